//! Property tests for selector matching and registry ordering.
//!
//! Each property is checked against a brute-force model: matching against a
//! conjunction of independent bit-level checks, classification against a
//! linear scan over all live entries, ordering and the exact-selector index
//! against the sequence of operations that produced them.

use std::collections::HashMap;
use std::net::Ipv6Addr;
use std::time::{Duration, Instant};

use flowmob_net::binding::{FlowBindingRegistry, FlowId, Priority};
use flowmob_net::selector::{FlowTuple, PROTO_TCP, PROTO_UDP, PortRange, TrafficSelector};
use ipnet::Ipv6Net;
use proptest::prelude::*;

const BASES: [u128; 3] = [
    0x2001_0db8_0000_0001_0000_0000_0000_0000,
    0x2001_0db8_0000_0002_0000_0000_0000_0000,
    0x2001_0db8_00ff_0001_0000_0000_0000_0000,
];

fn address() -> impl Strategy<Value = Ipv6Addr> {
    (prop::sample::select(BASES.to_vec()), 0u8..4).prop_map(|(base, low)| Ipv6Addr::from(base | low as u128))
}

fn prefix() -> impl Strategy<Value = Ipv6Net> {
    (address(), prop::sample::select(vec![0u8, 48, 64, 126, 128]))
        .prop_map(|(addr, len)| Ipv6Net::new(addr, len).unwrap().trunc())
}

fn port_range() -> impl Strategy<Value = PortRange> {
    prop_oneof![
        Just(PortRange::ANY),
        (0u16..8, 0u16..8).prop_map(|(a, b)| PortRange::new(a.min(b), a.max(b).max(1)).unwrap()),
    ]
}

fn protocol() -> impl Strategy<Value = u8> {
    prop::sample::select(vec![PROTO_TCP, PROTO_UDP])
}

fn selector() -> impl Strategy<Value = TrafficSelector> {
    (protocol(), prefix(), prefix(), port_range(), port_range()).prop_map(
        |(protocol, source, destination, source_ports, destination_ports)| {
            TrafficSelector::new(protocol)
                .with_source(source)
                .with_destination(destination)
                .with_source_ports(source_ports)
                .with_destination_ports(destination_ports)
        },
    )
}

fn flow() -> impl Strategy<Value = FlowTuple> {
    (protocol(), address(), address(), 0u16..8, 0u16..8).prop_map(
        |(protocol, source, destination, source_port, destination_port)| FlowTuple {
            protocol,
            source,
            destination,
            source_port,
            destination_port,
        },
    )
}

fn in_prefix(net: Ipv6Net, addr: Ipv6Addr) -> bool {
    let len = u32::from(net.prefix_len());
    let mask = if len == 0 { 0 } else { u128::MAX << (128 - len) };
    (u128::from(net.addr()) & mask) == (u128::from(addr) & mask)
}

fn in_range(range: PortRange, port: u16) -> bool {
    range.start() <= port && port <= range.end()
}

fn matches_oracle(ts: &TrafficSelector, f: &FlowTuple) -> bool {
    let protocol = ts.protocol() == f.protocol;
    let source = in_prefix(ts.source(), f.source);
    let destination = in_prefix(ts.destination(), f.destination);
    let source_port = in_range(ts.source_ports(), f.source_port);
    let destination_port = in_range(ts.destination_ports(), f.destination_port);
    protocol && source && destination && source_port && destination_port
}

#[derive(Debug, Clone)]
enum Op {
    Add(TrafficSelector, u32),
    /// Remove the n-th live entry (modulo the live count).
    Remove(usize),
}

fn ops() -> impl Strategy<Value = Vec<Op>> {
    prop::collection::vec(
        prop_oneof![
            3 => (selector(), 1u32..5).prop_map(|(ts, p)| Op::Add(ts, p)),
            1 => any::<usize>().prop_map(Op::Remove),
        ],
        0..40,
    )
}

struct Model {
    /// (flow id, priority, insertion sequence, selector)
    live: Vec<(FlowId, u32, usize, TrafficSelector)>,
    removed: Vec<TrafficSelector>,
}

fn apply(ops: &[Op]) -> (FlowBindingRegistry<u32>, Model) {
    let now = Instant::now();
    let mut registry = FlowBindingRegistry::new();
    let mut model = Model {
        live: Vec::new(),
        removed: Vec::new(),
    };

    for (seq, op) in ops.iter().enumerate() {
        match op {
            Op::Add(ts, p) => {
                let id = registry.add(*ts, Priority::new(*p).unwrap(), vec![1], Duration::ZERO, now);
                model.live.push((id, *p, seq, *ts));
            }
            Op::Remove(n) => {
                if model.live.is_empty() {
                    continue;
                }
                let (id, _, _, ts) = model.live.remove(n % model.live.len());
                assert!(registry.remove(id).is_some());
                model.removed.push(ts);
            }
        }
    }
    (registry, model)
}

proptest! {
    #[test]
    fn prop_match_is_conjunction_of_fields(ts in selector(), f in flow()) {
        prop_assert_eq!(ts.matches(&f), matches_oracle(&ts, &f));
    }

    #[test]
    fn prop_iteration_is_priority_ordered(ops in ops()) {
        let (registry, model) = apply(&ops);
        let seq_of: HashMap<FlowId, usize> = model.live.iter().map(|(id, _, seq, _)| (*id, *seq)).collect();

        let entries: Vec<_> = registry.iter().collect();
        prop_assert_eq!(entries.len(), model.live.len());
        for pair in entries.windows(2) {
            let (a, b) = (pair[0], pair[1]);
            prop_assert!(a.priority() >= b.priority());
            if a.priority() == b.priority() {
                // Newest first among equals.
                prop_assert!(seq_of[&a.flow_id()] > seq_of[&b.flow_id()]);
            }
        }
    }

    #[test]
    fn prop_classify_is_first_match(ops in ops(), flows in prop::collection::vec(flow(), 1..10)) {
        let (registry, model) = apply(&ops);

        for f in &flows {
            let expected = model
                .live
                .iter()
                .filter(|(_, _, _, ts)| matches_oracle(ts, f))
                .max_by_key(|(_, p, seq, _)| (*p, *seq))
                .map(|(id, _, _, _)| *id);
            let actual = registry.classify(f).map(|e| e.flow_id());
            prop_assert_eq!(actual, expected);
        }
    }

    #[test]
    fn prop_index_tracks_live_entries(ops in ops()) {
        let (registry, model) = apply(&ops);

        for (id, _, _, ts) in &model.live {
            // Duplicates resolve to the newest live entry with that selector.
            let newest = model
                .live
                .iter()
                .filter(|(_, _, _, live)| live == ts)
                .map(|(id, _, _, _)| *id)
                .max();
            prop_assert_eq!(registry.lookup(ts).map(|e| e.flow_id()), newest);
            prop_assert!(registry.get(*id).is_some());
        }
        for ts in &model.removed {
            if model.live.iter().all(|(_, _, _, live)| live != ts) {
                prop_assert!(registry.lookup(ts).is_none());
            }
        }
    }
}
