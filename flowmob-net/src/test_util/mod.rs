//! Test utilities for flow routing scenarios
//!
//! Fixtures shared by unit and integration tests.

pub mod packets;

pub use packets::{datagram, flow, tcp_flow, udp_flow};
