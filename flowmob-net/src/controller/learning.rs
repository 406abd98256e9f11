//! Host-side binding learning.
//!
//! Every inbound packet installs or refreshes a short-lived binding for the
//! reverse flow, with the ingress device at the front of the target list.
//! The outbound path of a live flow thereby follows the path its inbound
//! traffic most recently used.

use std::time::{Duration, Instant};

use tracing::{debug, trace, warn};

use crate::binding::{FlowBindingRegistry, FlowId, Priority, Target};
use crate::packet::peek_flow;
use crate::selector::{FlowTuple, TrafficSelector, is_port_bearing};

/// Priority of every learned binding.
pub const LEARNED_PRIORITY: Priority = match Priority::new(10000) {
    Some(p) => p,
    None => panic!("learned priority must be non-zero"),
};

/// Lifetime of a learned binding without further traffic.
pub const LEARNED_LIFETIME: Duration = Duration::from_secs(5);

/// What an inbound packet did to the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Observation {
    /// Not learnable, or already bound statically.
    Ignored,
    /// A new binding was installed.
    Learned(FlowId),
    /// An existing binding was refreshed, and possibly reordered.
    Refreshed { flow_id: FlowId, promoted: bool },
}

/// Learns bindings for the reverse direction of observed inbound flows.
#[derive(Debug, Clone)]
pub struct HostLearner<T> {
    devices: Vec<T>,
    priority: Priority,
    lifetime: Duration,
}

impl<T: Target> HostLearner<T> {
    pub fn new(devices: Vec<T>) -> Self {
        HostLearner {
            devices,
            priority: LEARNED_PRIORITY,
            lifetime: LEARNED_LIFETIME,
        }
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_lifetime(mut self, lifetime: Duration) -> Self {
        self.lifetime = lifetime;
        self
    }

    pub fn devices(&self) -> &[T] {
        &self.devices
    }

    /// Learn from a flow that arrived on `ingress`.
    pub fn observe(
        &self,
        registry: &mut FlowBindingRegistry<T>,
        ingress: T,
        flow: &FlowTuple,
        now: Instant,
    ) -> Observation {
        if !is_port_bearing(flow.protocol) {
            return Observation::Ignored;
        }
        if is_link_local(flow.destination) || flow.destination.is_multicast() {
            trace!(%flow, "Ignoring locally scoped destination");
            return Observation::Ignored;
        }
        if !self.devices.contains(&ingress) {
            warn!(%ingress, %flow, "Packet from unknown device");
            return Observation::Ignored;
        }

        let selector = TrafficSelector::exact(&flow.reversed());

        if let Some(entry) = registry.lookup(&selector) {
            let flow_id = entry.flow_id();
            if entry.is_permanent() {
                trace!(%flow_id, %ingress, "Static binding, not relearning");
                return Observation::Ignored;
            }
            let refreshed = registry
                .refresh(flow_id, self.lifetime, now)
                .and_then(|_| registry.promote(flow_id, ingress));
            return match refreshed {
                Ok(promoted) => {
                    if promoted {
                        debug!(%flow_id, %ingress, "Flow moved to new ingress device");
                    }
                    Observation::Refreshed { flow_id, promoted }
                }
                Err(e) => {
                    warn!(%flow_id, error = %e, "Failed to refresh learned binding");
                    Observation::Ignored
                }
            };
        }

        let mut targets = Vec::with_capacity(self.devices.len());
        targets.push(ingress);
        targets.extend(self.devices.iter().copied().filter(|d| *d != ingress));

        let flow_id = registry.add(selector, self.priority, targets, self.lifetime, now);
        debug!(%flow_id, %ingress, %selector, "Learned flow binding");
        Observation::Learned(flow_id)
    }

    /// Learn from a raw IPv6 datagram that arrived on `ingress`.
    pub fn observe_packet(
        &self,
        registry: &mut FlowBindingRegistry<T>,
        ingress: T,
        datagram: &[u8],
        now: Instant,
    ) -> Observation {
        match peek_flow(datagram) {
            Some(flow) => self.observe(registry, ingress, &flow, now),
            None => Observation::Ignored,
        }
    }
}

fn is_link_local(addr: std::net::Ipv6Addr) -> bool {
    (addr.segments()[0] & 0xffc0) == 0xfe80
}
