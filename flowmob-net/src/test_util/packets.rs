//! Flow and packet fixtures for tests
//!
//! Uses smoltcp for packet construction, matching the engine's parser.

use std::net::Ipv6Addr;

use crate::packet::build_flow_packet;
use crate::selector::{FlowTuple, PROTO_TCP, PROTO_UDP};

/// Build a flow from textual addresses.
///
/// Panics on malformed addresses; fixtures are literals.
pub fn flow(
    protocol: u8,
    source: &str,
    destination: &str,
    source_port: u16,
    destination_port: u16,
) -> FlowTuple {
    FlowTuple {
        protocol,
        source: parse(source),
        destination: parse(destination),
        source_port,
        destination_port,
    }
}

/// TCP flow fixture.
pub fn tcp_flow(
    source: &str,
    destination: &str,
    source_port: u16,
    destination_port: u16,
) -> FlowTuple {
    flow(PROTO_TCP, source, destination, source_port, destination_port)
}

/// UDP flow fixture.
pub fn udp_flow(
    source: &str,
    destination: &str,
    source_port: u16,
    destination_port: u16,
) -> FlowTuple {
    flow(PROTO_UDP, source, destination, source_port, destination_port)
}

/// Serialize a flow fixture as an IPv6 datagram.
pub fn datagram(flow: &FlowTuple) -> Vec<u8> {
    build_flow_packet(flow)
}

fn parse(addr: &str) -> Ipv6Addr {
    match addr.parse() {
        Ok(addr) => addr,
        Err(e) => panic!("invalid fixture address {addr}: {e}"),
    }
}
