//! Traffic selectors: predicates over a flow's 5-tuple.
//!
//! A selector matches a packet when the source and destination addresses
//! fall within the configured prefixes, both ports fall within their
//! inclusive ranges, and the transport protocol is equal. Only port-bearing
//! protocols (TCP and UDP) can be classified at all.

use std::fmt;
use std::net::Ipv6Addr;
use std::str::FromStr;

use ipnet::Ipv6Net;
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// IP protocol number of TCP.
pub const PROTO_TCP: u8 = 6;

/// IP protocol number of UDP.
pub const PROTO_UDP: u8 = 17;

/// Whether `protocol` carries 16-bit source/destination ports at a fixed offset.
pub fn is_port_bearing(protocol: u8) -> bool {
    matches!(protocol, PROTO_TCP | PROTO_UDP)
}

/// The fields of a packet that classification looks at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FlowTuple {
    pub protocol: u8,
    pub source: Ipv6Addr,
    pub destination: Ipv6Addr,
    pub source_port: u16,
    pub destination_port: u16,
}

impl FlowTuple {
    /// The same flow seen from the other end.
    pub fn reversed(&self) -> Self {
        FlowTuple {
            protocol: self.protocol,
            source: self.destination,
            destination: self.source,
            source_port: self.destination_port,
            destination_port: self.source_port,
        }
    }
}

impl fmt::Display for FlowTuple {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} [{}]:{} -> [{}]:{}",
            self.protocol, self.source, self.source_port, self.destination, self.destination_port
        )
    }
}

/// Inclusive port range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PortRange {
    start: u16,
    end: u16,
}

impl PortRange {
    /// Every port.
    pub const ANY: PortRange = PortRange {
        start: 0,
        end: u16::MAX,
    };

    /// A range holding exactly one port.
    pub const fn single(port: u16) -> Self {
        PortRange {
            start: port,
            end: port,
        }
    }

    /// Create a range. An `end` of zero means the single port `start`.
    pub fn new(start: u16, end: u16) -> Result<Self, ConfigError> {
        let end = if end == 0 { start } else { end };
        if start > end {
            return Err(ConfigError::InvalidPortRange(format!("{start}-{end}")));
        }
        Ok(PortRange { start, end })
    }

    pub fn start(&self) -> u16 {
        self.start
    }

    pub fn end(&self) -> u16 {
        self.end
    }

    pub fn contains(&self, port: u16) -> bool {
        self.start <= port && port <= self.end
    }
}

impl Default for PortRange {
    fn default() -> Self {
        PortRange::ANY
    }
}

impl fmt::Display for PortRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.start, self.end)
    }
}

impl FromStr for PortRange {
    type Err = ConfigError;

    /// Accepts `"80"`, `"8000-8080"` and `"*"`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s == "*" {
            return Ok(PortRange::ANY);
        }
        let invalid = || ConfigError::InvalidPortRange(s.to_string());
        match s.split_once('-') {
            Some((start, end)) => {
                let start = start.trim().parse().map_err(|_| invalid())?;
                let end = end.trim().parse().map_err(|_| invalid())?;
                if start > end {
                    return Err(invalid());
                }
                Ok(PortRange { start, end })
            }
            None => s.parse().map(PortRange::single).map_err(|_| invalid()),
        }
    }
}

impl TryFrom<String> for PortRange {
    type Error = ConfigError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<PortRange> for String {
    fn from(range: PortRange) -> Self {
        range.to_string()
    }
}

/// Predicate over protocol, address prefixes and port ranges.
///
/// Equality and hashing cover every field, so selectors can key an
/// exact-match index. The derived ordering is lexicographic over all fields
/// with the protocol first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TrafficSelector {
    protocol: u8,
    source: Ipv6Net,
    destination: Ipv6Net,
    source_ports: PortRange,
    destination_ports: PortRange,
}

impl TrafficSelector {
    /// Selector matching every address and port for `protocol`.
    pub fn new(protocol: u8) -> Self {
        TrafficSelector {
            protocol,
            source: Ipv6Net::default(),
            destination: Ipv6Net::default(),
            source_ports: PortRange::ANY,
            destination_ports: PortRange::ANY,
        }
    }

    /// Selector matching exactly one 5-tuple (/128 prefixes, single ports).
    pub fn exact(flow: &FlowTuple) -> Self {
        TrafficSelector {
            protocol: flow.protocol,
            source: host_prefix(flow.source),
            destination: host_prefix(flow.destination),
            source_ports: PortRange::single(flow.source_port),
            destination_ports: PortRange::single(flow.destination_port),
        }
    }

    pub fn with_source(mut self, source: Ipv6Net) -> Self {
        self.source = source;
        self
    }

    pub fn with_destination(mut self, destination: Ipv6Net) -> Self {
        self.destination = destination;
        self
    }

    pub fn with_source_ports(mut self, ports: PortRange) -> Self {
        self.source_ports = ports;
        self
    }

    pub fn with_destination_ports(mut self, ports: PortRange) -> Self {
        self.destination_ports = ports;
        self
    }

    pub fn protocol(&self) -> u8 {
        self.protocol
    }

    pub fn source(&self) -> Ipv6Net {
        self.source
    }

    pub fn destination(&self) -> Ipv6Net {
        self.destination
    }

    pub fn source_ports(&self) -> PortRange {
        self.source_ports
    }

    pub fn destination_ports(&self) -> PortRange {
        self.destination_ports
    }

    /// The selector for traffic flowing the opposite way.
    pub fn reverse(&self) -> Self {
        TrafficSelector {
            protocol: self.protocol,
            source: self.destination,
            destination: self.source,
            source_ports: self.destination_ports,
            destination_ports: self.source_ports,
        }
    }

    /// Test a packet's fields against this selector.
    pub fn matches(&self, flow: &FlowTuple) -> bool {
        self.source.contains(&flow.source)
            && self.destination.contains(&flow.destination)
            && self.source_ports.contains(flow.source_port)
            && self.destination_ports.contains(flow.destination_port)
            && self.protocol == flow.protocol
    }
}

impl fmt::Display for TrafficSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {}:{} -> {}:{}",
            self.protocol, self.source, self.source_ports, self.destination, self.destination_ports
        )
    }
}

fn host_prefix(addr: Ipv6Addr) -> Ipv6Net {
    Ipv6Net::from(addr)
}
