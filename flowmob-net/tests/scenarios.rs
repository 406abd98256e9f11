//! End-to-end flow mobility scenarios on anchor and host routers.

use std::time::{Duration, Instant};

use flowmob_net::binding::{FlowBindingRegistry, Priority};
use flowmob_net::controller::{HandoverController, HandoverPolicy, HostLearner, Observation};
use flowmob_net::router::{AnchorRouter, DeviceId, HostRouter, InterfaceId, RoutingDecision};
use flowmob_net::selector::{PROTO_TCP, PROTO_UDP, PortRange, TrafficSelector};
use flowmob_net::test_util::{datagram, tcp_flow, udp_flow};

const WIFI: InterfaceId = InterfaceId(4);
const LTE: InterfaceId = InterfaceId(8);

fn prio(p: u32) -> Priority {
    Priority::new(p).unwrap()
}

fn anchor() -> AnchorRouter {
    let mut router = AnchorRouter::new();
    let mn_prefix = "2001:db8:100::/64".parse().unwrap();
    router
        .routes_mut()
        .add_network_route(mn_prefix, Some("fe80::4".parse().unwrap()), WIFI, None, 0);
    router
        .routes_mut()
        .add_network_route(mn_prefix, Some("fe80::8".parse().unwrap()), LTE, None, 0);
    router
}

#[test]
fn test_single_entry_classifies_any_tcp() {
    let mut registry = FlowBindingRegistry::new();
    registry.add(
        TrafficSelector::new(PROTO_TCP),
        prio(10),
        vec![WIFI, LTE],
        Duration::ZERO,
        Instant::now(),
    );

    for f in [
        tcp_flow("2001:db8::1", "2001:db8::2", 1, 2),
        tcp_flow("2001:db8:ffff::1", "::1", 65535, 0),
    ] {
        let entry = registry.classify(&f).unwrap();
        assert_eq!(entry.targets(), &[WIFI, LTE]);
    }
    assert!(registry.classify(&udp_flow("2001:db8::1", "2001:db8::2", 1, 2)).is_none());
}

#[test]
fn test_higher_priority_entry_wins() {
    let now = Instant::now();
    let mut registry = FlowBindingRegistry::new();
    registry.add(TrafficSelector::new(PROTO_TCP), prio(10), vec![WIFI], Duration::ZERO, now);
    let high = registry.add(TrafficSelector::new(PROTO_TCP), prio(20), vec![LTE], Duration::ZERO, now);

    let f = tcp_flow("2001:db8::1", "2001:db8::2", 1000, 80);
    assert_eq!(registry.classify(&f).unwrap().flow_id(), high);
}

#[test]
fn test_entry_expires_after_lifetime() {
    let t0 = Instant::now();
    let mut registry = FlowBindingRegistry::new();
    let id = registry.add(
        TrafficSelector::new(PROTO_TCP),
        prio(10),
        vec![WIFI],
        Duration::from_secs(5),
        t0,
    );
    let f = tcp_flow("2001:db8::1", "2001:db8::2", 1000, 80);

    registry.expire(t0 + Duration::from_millis(4999));
    assert_eq!(registry.classify(&f).unwrap().flow_id(), id);

    registry.expire(t0 + Duration::from_millis(5001));
    assert!(registry.get(id).is_none());
    assert!(registry.classify(&f).is_none());
}

#[test]
fn test_reordering_targets_moves_flow() {
    let mut router = anchor();
    let id = router.bindings_mut().add(
        TrafficSelector::new(PROTO_TCP),
        prio(10),
        vec![LTE, WIFI],
        Duration::ZERO,
        Instant::now(),
    );

    let f = tcp_flow("2001:db8:cafe::1", "2001:db8:100::20", 40000, 443);
    let packet = datagram(&f);

    let selected = router.select_route(&packet, f.destination).unwrap();
    assert_eq!(selected.interface(), LTE);
    assert_eq!(selected.route.gateway, Some("fe80::8".parse().unwrap()));

    router.bindings_mut().set_targets(id, vec![WIFI, LTE]).unwrap();
    let selected = router.select_route(&packet, f.destination).unwrap();
    assert_eq!(selected.interface(), WIFI);
    assert_eq!(selected.route.gateway, Some("fe80::4".parse().unwrap()));
}

#[test]
fn test_reset_priorities_counts_down() {
    let now = Instant::now();
    let mut registry = FlowBindingRegistry::<InterfaceId>::new();
    let e3 = registry.add(TrafficSelector::new(PROTO_UDP), prio(1), vec![WIFI], Duration::ZERO, now);
    let e2 = registry.add(TrafficSelector::new(PROTO_TCP), prio(2), vec![WIFI], Duration::ZERO, now);
    let e1 = registry.add(
        TrafficSelector::new(PROTO_TCP).with_destination_ports(PortRange::single(80)),
        prio(2),
        vec![WIFI],
        Duration::ZERO,
        now,
    );

    let ctl = HandoverController::new(HandoverPolicy::default());
    ctl.reset_priorities(&mut registry, prio(100), 10).unwrap();

    let renumbered: Vec<_> = registry
        .iter()
        .map(|e| (e.flow_id(), e.priority().get()))
        .collect();
    assert_eq!(renumbered, vec![(e1, 120), (e2, 110), (e3, 100)]);
}

#[test]
fn test_host_flow_follows_inbound_path() {
    let eth = DeviceId(1);
    let wlan = DeviceId(2);

    let mut router = HostRouter::new();
    router
        .routes_mut()
        .interface_up(eth, vec!["2001:db8:1::10/64".parse().unwrap()]);
    router
        .routes_mut()
        .interface_up(wlan, vec!["2001:db8:2::10/64".parse().unwrap()]);
    router
        .routes_mut()
        .set_default_route("fe80::1".parse().unwrap(), eth, None, 0);
    router
        .routes_mut()
        .set_default_route("fe80::2".parse().unwrap(), wlan, None, 0);

    let learner = HostLearner::new(vec![eth, wlan]);
    let t0 = Instant::now();

    // Server reply arrives over WLAN.
    let inbound = udp_flow("2001:db8:cafe::1", "2001:db8:2::10", 5000, 40000);
    let Observation::Learned(id) = learner.observe_packet(router.bindings_mut(), wlan, &datagram(&inbound), t0)
    else {
        panic!("expected a learned binding");
    };

    let outbound = inbound.reversed();
    match router.route(&datagram(&outbound)) {
        RoutingDecision::Flow(selected) => {
            assert_eq!(selected.flow_id, id);
            assert_eq!(selected.interface(), wlan);
            assert_eq!(selected.source, Some("2001:db8:2::10".parse().unwrap()));
        }
        other => panic!("unexpected decision {other:?}"),
    }

    // The same flow now arrives over Ethernet.
    let t1 = t0 + Duration::from_secs(1);
    assert_eq!(
        learner.observe(router.bindings_mut(), eth, &inbound, t1),
        Observation::Refreshed { flow_id: id, promoted: true }
    );
    match router.route(&datagram(&outbound)) {
        RoutingDecision::Flow(selected) => assert_eq!(selected.interface(), eth),
        other => panic!("unexpected decision {other:?}"),
    }

    // Silence: the binding lapses and routing falls back.
    router.expire(t1 + Duration::from_secs(6));
    assert!(matches!(
        router.route(&datagram(&outbound)),
        RoutingDecision::Fallback(_)
    ));
}
