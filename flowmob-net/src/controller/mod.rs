//! Policies that create and reorder flow bindings at runtime.
//!
//! Controllers never touch packets in flight. They observe traffic or
//! external signals and mutate a router's binding registry.

pub mod handover;
pub mod learning;

pub use handover::{HandoverController, HandoverPolicy};
pub use learning::{HostLearner, LEARNED_LIFETIME, LEARNED_PRIORITY, Observation};
