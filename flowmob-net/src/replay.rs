//! Timed event scripts driven through a running engine.
//!
//! A script is a JSON list of steps, each with an offset in milliseconds
//! from the start of the replay and one action: an inbound packet, an
//! outbound route request, a handover command, a link-quality sample, or a
//! dump. Steps run in offset order; equal offsets keep script order.

use std::fs;
use std::net::Ipv6Addr;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time;
use tracing::info;

use crate::binding::{FlowId, Target};
use crate::config::{RouterConfig, TransportProtocol};
use crate::engine::EngineHandle;
use crate::error::{ConfigError, ReplayError};
use crate::packet::build_flow_packet;
use crate::selector::FlowTuple;

/// A flow as written in a script.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FlowSpec {
    pub protocol: TransportProtocol,
    pub source: Ipv6Addr,
    pub destination: Ipv6Addr,
    pub source_port: u16,
    pub destination_port: u16,
}

impl From<FlowSpec> for FlowTuple {
    fn from(spec: FlowSpec) -> Self {
        FlowTuple {
            protocol: spec.protocol.number(),
            source: spec.source,
            destination: spec.destination,
            source_port: spec.source_port,
            destination_port: spec.destination_port,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum Action {
    /// A packet of `flow` arrives on `interface`.
    Inbound { interface: String, flow: FlowSpec },
    /// Route a packet of `flow`.
    Outbound {
        flow: FlowSpec,
        #[serde(default)]
        interface: Option<String>,
    },
    Handover { flow_id: u64, interface: String },
    LinkQuality { interface: String, snr_db: f64 },
    Dump,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Step {
    pub at_ms: u64,
    #[serde(flatten)]
    pub action: Action,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Script {
    pub steps: Vec<Step>,
}

impl Script {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }
}

/// Run `script` against `handle`, returning one output line per step.
///
/// Interface names are resolved through `config`.
pub async fn run<T>(
    handle: &EngineHandle<T>,
    config: &RouterConfig,
    script: &Script,
) -> Result<Vec<String>, ReplayError>
where
    T: Target + From<u32> + Send + 'static,
{
    let resolve = |name: &str| {
        config
            .interface_id(name)
            .map(T::from)
            .ok_or_else(|| ConfigError::UnknownInterface(name.to_string()))
    };

    let mut steps: Vec<&Step> = script.steps.iter().collect();
    steps.sort_by_key(|step| step.at_ms);

    let start = time::Instant::now();
    let mut output = Vec::with_capacity(steps.len());

    for step in steps {
        let at = start
            .checked_add(Duration::from_millis(step.at_ms))
            .ok_or(ReplayError::OffsetOutOfRange { at_ms: step.at_ms })?;
        time::sleep_until(at).await;

        let line = match &step.action {
            Action::Inbound { interface, flow } => {
                let ingress = resolve(interface.as_str())?;
                let flow = FlowTuple::from(*flow);
                let observation = handle.observe(ingress, build_flow_packet(&flow)).await?;
                format!("inbound {flow} on {ingress}: {observation:?}")
            }
            Action::Outbound { flow, interface } => {
                let output_interface = interface.as_deref().map(|name| resolve(name)).transpose()?;
                let flow = FlowTuple::from(*flow);
                let decision = handle
                    .route(build_flow_packet(&flow), output_interface)
                    .await?;
                format!("outbound {flow}: {decision}")
            }
            Action::Handover { flow_id, interface } => {
                let target = resolve(interface.as_str())?;
                let moved = handle.handover(FlowId::new(*flow_id), target).await?;
                format!("handover flow {flow_id} to {target}: moved={moved}")
            }
            Action::LinkQuality { interface, snr_db } => {
                let target = resolve(interface.as_str())?;
                let moved = handle.report_link_quality(target, *snr_db).await?;
                let moved: Vec<String> = moved.iter().map(ToString::to_string).collect();
                format!("link quality {target} {snr_db} dB: moved [{}]", moved.join(", "))
            }
            Action::Dump => handle.dump().await?,
        };

        let line = format!("t={}ms {line}", step.at_ms);
        info!("{line}");
        output.push(line);
    }

    Ok(output)
}
