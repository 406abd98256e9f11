pub mod binding;
pub mod config;
pub mod controller;
pub mod engine;
pub mod error;
pub mod packet;
pub mod replay;
pub mod router;
pub mod routing;
pub mod selector;
pub mod test_util;

pub use binding::{BindingEntry, FlowBindingRegistry, FlowId, Priority, Target};
pub use router::{AnchorRouter, DeviceId, FlowRouter, HostRouter, InterfaceId, RoutingDecision};
pub use selector::{FlowTuple, PortRange, TrafficSelector};
