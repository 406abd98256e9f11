//! Single-task event loop owning a flow router.
//!
//! The engine is the only owner of its [`FlowRouter`]. Packet observations,
//! route requests, provisioning and handover commands arrive over a channel
//! and are handled one at a time; binding deadlines are fired in timestamp
//! order between commands. Nothing is locked.

use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::time;
use tracing::{debug, info, warn};

use crate::binding::{FlowId, Priority, Target};
use crate::controller::{HandoverController, HostLearner, Observation};
use crate::error::{BindingError, EngineError};
use crate::router::{FlowRouter, RoutingDecision};
use crate::selector::TrafficSelector;

/// Default command queue depth.
pub const DEFAULT_QUEUE_DEPTH: usize = 256;

/// Commands accepted by the engine.
#[derive(Debug)]
pub enum Command<T> {
    Inbound {
        ingress: T,
        packet: Vec<u8>,
        responder: oneshot::Sender<Observation>,
    },
    Outbound {
        packet: Vec<u8>,
        output_interface: Option<T>,
        responder: oneshot::Sender<RoutingDecision<T>>,
    },
    Provision {
        selector: TrafficSelector,
        priority: Priority,
        targets: Vec<T>,
        lifetime: Duration,
        responder: oneshot::Sender<FlowId>,
    },
    Remove {
        flow_id: FlowId,
        responder: oneshot::Sender<bool>,
    },
    Handover {
        flow_id: FlowId,
        target: T,
        responder: oneshot::Sender<Result<bool, BindingError>>,
    },
    LinkQuality {
        target: T,
        snr_db: f64,
        responder: oneshot::Sender<Vec<FlowId>>,
    },
    ResetPriorities {
        start: Priority,
        increment: u32,
        responder: oneshot::Sender<Result<(), BindingError>>,
    },
    Dump {
        responder: oneshot::Sender<String>,
    },
}

/// Binding lifecycle events emitted by the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event<T> {
    Learned { flow_id: FlowId, ingress: T },
    Moved { flow_id: FlowId, target: T },
    Expired { flow_id: FlowId },
}

/// The event loop. Create with [`FlowEngine::new`], drive with [`FlowEngine::run`].
pub struct FlowEngine<T> {
    router: FlowRouter<T>,
    learner: Option<HostLearner<T>>,
    handover: HandoverController<T>,
    command_rx: mpsc::Receiver<Command<T>>,
    event_tx: Option<mpsc::Sender<Event<T>>>,
}

impl<T: Target + Send + 'static> FlowEngine<T> {
    pub fn new(
        router: FlowRouter<T>,
        handover: HandoverController<T>,
        queue_depth: usize,
    ) -> (Self, EngineHandle<T>) {
        let (command_tx, command_rx) = mpsc::channel(queue_depth.max(1));
        let engine = FlowEngine {
            router,
            learner: None,
            handover,
            command_rx,
            event_tx: None,
        };
        (engine, EngineHandle { command_tx })
    }

    /// Learn bindings from inbound traffic (host role).
    pub fn with_learner(mut self, learner: HostLearner<T>) -> Self {
        self.learner = Some(learner);
        self
    }

    /// Emit binding lifecycle events on `event_tx`.
    pub fn with_events(mut self, event_tx: mpsc::Sender<Event<T>>) -> Self {
        self.event_tx = Some(event_tx);
        self
    }

    /// Run until every handle is dropped, then hand the router back.
    pub async fn run(mut self) -> FlowRouter<T> {
        info!(
            routes = self.router.routes().len(),
            bindings = self.router.bindings().len(),
            learning = self.learner.is_some(),
            "Flow engine running"
        );

        loop {
            let deadline = self.router.bindings().next_deadline();
            let expiry = async move {
                match deadline {
                    Some(at) => time::sleep_until(time::Instant::from_std(at)).await,
                    None => std::future::pending().await,
                }
            };

            tokio::select! {
                biased;
                _ = expiry => self.expire(),
                cmd = self.command_rx.recv() => match cmd {
                    Some(cmd) => {
                        self.expire();
                        self.handle_command(cmd);
                    }
                    None => break,
                },
            }
        }

        info!("Flow engine: channel closed, shutting down");
        self.router
    }

    fn expire(&mut self) {
        for entry in self.router.expire(now()) {
            self.emit(Event::Expired {
                flow_id: entry.flow_id(),
            });
        }
    }

    fn handle_command(&mut self, cmd: Command<T>) {
        match cmd {
            Command::Inbound {
                ingress,
                packet,
                responder,
            } => {
                let observation = match &self.learner {
                    Some(learner) => {
                        learner.observe_packet(self.router.bindings_mut(), ingress, &packet, now())
                    }
                    None => Observation::Ignored,
                };
                match observation {
                    Observation::Learned(flow_id) => self.emit(Event::Learned { flow_id, ingress }),
                    Observation::Refreshed {
                        flow_id,
                        promoted: true,
                    } => self.emit(Event::Moved {
                        flow_id,
                        target: ingress,
                    }),
                    _ => {}
                }
                let _ = responder.send(observation);
            }
            Command::Outbound {
                packet,
                output_interface,
                responder,
            } => {
                let _ = responder.send(self.router.route_output(&packet, output_interface));
            }
            Command::Provision {
                selector,
                priority,
                targets,
                lifetime,
                responder,
            } => {
                let flow_id = self
                    .router
                    .bindings_mut()
                    .add(selector, priority, targets, lifetime, now());
                let _ = responder.send(flow_id);
            }
            Command::Remove { flow_id, responder } => {
                let removed = self.router.bindings_mut().remove(flow_id).is_some();
                let _ = responder.send(removed);
            }
            Command::Handover {
                flow_id,
                target,
                responder,
            } => {
                let result = self
                    .handover
                    .handover(self.router.bindings_mut(), flow_id, target);
                if let Ok(true) = result {
                    self.emit(Event::Moved { flow_id, target });
                }
                let _ = responder.send(result);
            }
            Command::LinkQuality {
                target,
                snr_db,
                responder,
            } => {
                let moved = self.handover.report_link_quality(
                    self.router.bindings_mut(),
                    target,
                    snr_db,
                    now(),
                );
                for flow_id in &moved {
                    if let Some(entry) = self.router.bindings().get(*flow_id)
                        && let Some(first) = entry.targets().first()
                    {
                        self.emit(Event::Moved {
                            flow_id: *flow_id,
                            target: *first,
                        });
                    }
                }
                let _ = responder.send(moved);
            }
            Command::ResetPriorities {
                start,
                increment,
                responder,
            } => {
                let result =
                    self.handover
                        .reset_priorities(self.router.bindings_mut(), start, increment);
                let _ = responder.send(result);
            }
            Command::Dump { responder } => {
                let _ = responder.send(self.router.to_string());
            }
        }
    }

    fn emit(&self, event: Event<T>) {
        let Some(tx) = &self.event_tx else {
            return;
        };
        debug!(?event, "Flow engine event");
        if let Err(e) = tx.try_send(event) {
            warn!(error = %e, "Dropping flow engine event");
        }
    }
}

/// Engine clock. Follows tokio's clock so paused-time tests drive expiry.
fn now() -> std::time::Instant {
    time::Instant::now().into_std()
}

/// Cloneable handle for talking to a running engine.
#[derive(Debug)]
pub struct EngineHandle<T> {
    command_tx: mpsc::Sender<Command<T>>,
}

impl<T> Clone for EngineHandle<T> {
    fn clone(&self) -> Self {
        EngineHandle {
            command_tx: self.command_tx.clone(),
        }
    }
}

impl<T: Target + Send + 'static> EngineHandle<T> {
    async fn request<R>(
        &self,
        make: impl FnOnce(oneshot::Sender<R>) -> Command<T>,
    ) -> Result<R, EngineError> {
        let (responder, rx) = oneshot::channel();
        self.command_tx
            .send(make(responder))
            .await
            .map_err(|_| EngineError::Stopped)?;
        rx.await.map_err(|_| EngineError::Stopped)
    }

    /// Report a packet that arrived on `ingress`.
    pub async fn observe(&self, ingress: T, packet: Vec<u8>) -> Result<Observation, EngineError> {
        self.request(|responder| Command::Inbound {
            ingress,
            packet,
            responder,
        })
        .await
    }

    /// Route an outgoing packet.
    pub async fn route(
        &self,
        packet: Vec<u8>,
        output_interface: Option<T>,
    ) -> Result<RoutingDecision<T>, EngineError> {
        self.request(|responder| Command::Outbound {
            packet,
            output_interface,
            responder,
        })
        .await
    }

    pub async fn provision(
        &self,
        selector: TrafficSelector,
        priority: Priority,
        targets: Vec<T>,
        lifetime: Duration,
    ) -> Result<FlowId, EngineError> {
        self.request(|responder| Command::Provision {
            selector,
            priority,
            targets,
            lifetime,
            responder,
        })
        .await
    }

    /// Remove a binding. Returns whether it existed.
    pub async fn remove(&self, flow_id: FlowId) -> Result<bool, EngineError> {
        self.request(|responder| Command::Remove { flow_id, responder })
            .await
    }

    /// Move a flow to `target`.
    pub async fn handover(&self, flow_id: FlowId, target: T) -> Result<bool, EngineError> {
        Ok(self
            .request(|responder| Command::Handover {
                flow_id,
                target,
                responder,
            })
            .await??)
    }

    pub async fn report_link_quality(
        &self,
        target: T,
        snr_db: f64,
    ) -> Result<Vec<FlowId>, EngineError> {
        self.request(|responder| Command::LinkQuality {
            target,
            snr_db,
            responder,
        })
        .await
    }

    pub async fn reset_priorities(&self, start: Priority, increment: u32) -> Result<(), EngineError> {
        Ok(self
            .request(|responder| Command::ResetPriorities {
                start,
                increment,
                responder,
            })
            .await??)
    }

    /// Route table and binding dump.
    pub async fn dump(&self) -> Result<String, EngineError> {
        self.request(|responder| Command::Dump { responder }).await
    }
}
