//! Packet peeking and building using smoltcp
//!
//! The engine never mutates a packet: it reads the IPv6 header and, for
//! port-bearing protocols, the first bytes of the transport header.

use std::net::Ipv6Addr;

use smoltcp::wire::{IpProtocol, Ipv6Packet, TcpPacket, UdpPacket};
use tracing::trace;

use crate::selector::{FlowTuple, PROTO_TCP, PROTO_UDP};

/// IPv6 fixed header size
pub const IPV6_HDR_SIZE: usize = 40;

/// TCP header size (without options)
pub const TCP_HDR_SIZE: usize = 20;

/// UDP header size
pub const UDP_HDR_SIZE: usize = 8;

/// Network-layer fields of an IPv6 datagram.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ipv6Fields {
    pub protocol: u8,
    pub source: Ipv6Addr,
    pub destination: Ipv6Addr,
}

/// Read the IPv6 header of a datagram.
pub fn peek_ipv6(datagram: &[u8]) -> Option<Ipv6Fields> {
    let ipv6 = Ipv6Packet::new_checked(datagram).ok()?;
    Some(Ipv6Fields {
        protocol: u8::from(ipv6.next_header()),
        source: Ipv6Addr::from(ipv6.src_addr()),
        destination: Ipv6Addr::from(ipv6.dst_addr()),
    })
}

/// Extract the 5-tuple of an IPv6 datagram.
///
/// Returns `None` for malformed datagrams and for protocols without ports.
pub fn peek_flow(datagram: &[u8]) -> Option<FlowTuple> {
    let ipv6 = Ipv6Packet::new_checked(datagram).ok()?;

    let (source_port, destination_port) = match ipv6.next_header() {
        IpProtocol::Tcp => {
            let tcp = TcpPacket::new_checked(ipv6.payload()).ok()?;
            (tcp.src_port(), tcp.dst_port())
        }
        IpProtocol::Udp => {
            let udp = UdpPacket::new_checked(ipv6.payload()).ok()?;
            (udp.src_port(), udp.dst_port())
        }
        other => {
            trace!(protocol = ?other, "Unclassifiable protocol");
            return None;
        }
    };

    Some(FlowTuple {
        protocol: u8::from(ipv6.next_header()),
        source: Ipv6Addr::from(ipv6.src_addr()),
        destination: Ipv6Addr::from(ipv6.dst_addr()),
        source_port,
        destination_port,
    })
}

/// Build an IPv6 datagram around `payload`.
///
/// Returns `None` if the payload exceeds the 16-bit payload length field.
pub fn build_ipv6(
    source: Ipv6Addr,
    destination: Ipv6Addr,
    next_header: IpProtocol,
    payload: &[u8],
) -> Option<Vec<u8>> {
    let payload_len = u16::try_from(payload.len()).ok()?;
    Some(ipv6_datagram(source, destination, next_header, payload_len, payload))
}

fn ipv6_datagram(
    source: Ipv6Addr,
    destination: Ipv6Addr,
    next_header: IpProtocol,
    payload_len: u16,
    payload: &[u8],
) -> Vec<u8> {
    let mut buffer = vec![0u8; IPV6_HDR_SIZE + payload.len()];
    let mut packet = Ipv6Packet::new_unchecked(&mut buffer[..]);
    packet.set_version(6);
    packet.set_traffic_class(0);
    packet.set_flow_label(0);
    packet.set_payload_len(payload_len);
    packet.set_next_header(next_header);
    packet.set_hop_limit(64);
    packet.set_src_addr(source.into());
    packet.set_dst_addr(destination.into());
    packet.payload_mut().copy_from_slice(payload);
    buffer
}

/// Build a TCP segment header (no options, no payload).
pub fn build_tcp(source_port: u16, destination_port: u16) -> Vec<u8> {
    let mut buffer = vec![0u8; TCP_HDR_SIZE];
    let mut segment = TcpPacket::new_unchecked(&mut buffer[..]);
    segment.set_src_port(source_port);
    segment.set_dst_port(destination_port);
    segment.set_header_len(TCP_HDR_SIZE as u8);
    buffer
}

/// Build a UDP datagram carrying `payload`.
///
/// Returns `None` if the datagram exceeds the 16-bit length field.
pub fn build_udp(source_port: u16, destination_port: u16, payload: &[u8]) -> Option<Vec<u8>> {
    let len = u16::try_from(UDP_HDR_SIZE + payload.len()).ok()?;
    Some(udp_datagram(source_port, destination_port, len, payload))
}

fn udp_datagram(source_port: u16, destination_port: u16, len: u16, payload: &[u8]) -> Vec<u8> {
    let mut buffer = vec![0u8; UDP_HDR_SIZE + payload.len()];
    let mut datagram = UdpPacket::new_unchecked(&mut buffer[..]);
    datagram.set_src_port(source_port);
    datagram.set_dst_port(destination_port);
    datagram.set_len(len);
    datagram.set_checksum(0);
    datagram.payload_mut().copy_from_slice(payload);
    buffer
}

/// Build a complete IPv6 datagram for a flow.
///
/// TCP and UDP flows get a bare transport header carrying the flow's ports;
/// any other protocol gets an empty payload.
pub fn build_flow_packet(flow: &FlowTuple) -> Vec<u8> {
    let (transport, len) = match flow.protocol {
        PROTO_TCP => (build_tcp(flow.source_port, flow.destination_port), TCP_HDR_SIZE as u16),
        PROTO_UDP => (
            udp_datagram(flow.source_port, flow.destination_port, UDP_HDR_SIZE as u16, &[]),
            UDP_HDR_SIZE as u16,
        ),
        _ => (Vec::new(), 0),
    };
    ipv6_datagram(
        flow.source,
        flow.destination,
        IpProtocol::from(flow.protocol),
        len,
        &transport,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tuple(protocol: u8) -> FlowTuple {
        FlowTuple {
            protocol,
            source: "2001:db8:1::10".parse().unwrap(),
            destination: "2001:db8:2::20".parse().unwrap(),
            source_port: 49152,
            destination_port: 443,
        }
    }

    #[test]
    fn test_peek_tcp_flow() {
        let flow = tuple(PROTO_TCP);
        let packet = build_flow_packet(&flow);
        assert_eq!(packet.len(), IPV6_HDR_SIZE + TCP_HDR_SIZE);
        assert_eq!(peek_flow(&packet), Some(flow));
    }

    #[test]
    fn test_peek_udp_flow() {
        let flow = tuple(PROTO_UDP);
        let packet = build_flow_packet(&flow);
        assert_eq!(peek_flow(&packet), Some(flow));
    }

    #[test]
    fn test_icmp_is_unclassifiable() {
        let packet = build_flow_packet(&tuple(58));
        assert!(peek_flow(&packet).is_none());

        let fields = peek_ipv6(&packet).unwrap();
        assert_eq!(fields.protocol, 58);
        assert_eq!(fields.destination, "2001:db8:2::20".parse::<Ipv6Addr>().unwrap());
    }

    #[test]
    fn test_truncated_transport_header() {
        let flow = tuple(PROTO_TCP);
        let packet = build_ipv6(flow.source, flow.destination, IpProtocol::Tcp, &[0u8; 4]).unwrap();
        assert!(peek_flow(&packet).is_none());
    }

    #[test]
    fn test_oversized_payloads_are_refused() {
        let flow = tuple(PROTO_UDP);
        let max = vec![0u8; usize::from(u16::MAX)];
        let over = vec![0u8; usize::from(u16::MAX) + 1];

        assert!(build_ipv6(flow.source, flow.destination, IpProtocol::Udp, &over).is_none());
        let packet = build_ipv6(flow.source, flow.destination, IpProtocol::Udp, &max).unwrap();
        assert_eq!(packet.len(), IPV6_HDR_SIZE + max.len());

        let fits = usize::from(u16::MAX) - UDP_HDR_SIZE;
        assert!(build_udp(1, 2, &max[..fits + 1]).is_none());
        let datagram = build_udp(1, 2, &max[..fits]).unwrap();
        assert_eq!(UdpPacket::new_checked(&datagram[..]).unwrap().len(), u16::MAX);
    }

    #[test]
    fn test_garbage_is_rejected() {
        assert!(peek_flow(&[0x60, 0, 0]).is_none());
        assert!(peek_ipv6(&[]).is_none());
    }
}
