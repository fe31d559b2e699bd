//! L3 forwarding scenarios: gate, lookup order, reverse path, TTL
//!
//! ```text
//!   a (10.1.0.2) ── eth0 [r] eth1 ── b (10.2.0.2)
//!                  10.1.0.1   10.2.0.1
//! ```

use super::lab::{cidr, host, iface, ip, Node};
use netlab::dataplane::{DropReason, RouteSpec};
use netlab::protocol::Packet;
use netlab::topology::{LinkState, NamespaceId, RpFilter};
use netlab::{Engine, Error};

struct Net {
    engine: Engine,
    r: NamespaceId,
    eth0: Node,
    eth1: Node,
    a: Node,
    b: Node,
}

fn net() -> Net {
    let engine = Engine::default();
    let r = engine.create_namespace("r").unwrap();
    engine.set_forwarding(r, true).unwrap();
    let eth0 = iface(&engine, r, "eth0", Some("10.1.0.1/24"));
    let eth1 = iface(&engine, r, "eth1", Some("10.2.0.1/24"));

    let a = host(&engine, "a", Some("10.1.0.2/24"));
    let b = host(&engine, "b", Some("10.2.0.2/24"));
    engine.create_link(a.iface, eth0.iface).unwrap();
    engine.create_link(b.iface, eth1.iface).unwrap();
    for (h, gw) in [(&a, "10.1.0.1"), (&b, "10.2.0.1")] {
        engine
            .add_route(h.ns, RouteSpec::default_via(ip(gw)))
            .unwrap();
    }

    Net {
        engine,
        r,
        eth0,
        eth1,
        a,
        b,
    }
}

impl Net {
    /// A datagram arriving at the router from `a`
    fn from_a(&self, src: &str, dst: &str) -> Packet {
        Packet::udp(ip(src), 4000, ip(dst), 53).with_macs(self.a.mac, self.eth0.mac)
    }

    fn send(&self, packet: Packet) -> netlab::InjectReport {
        self.engine.inject(self.eth0.iface, packet).unwrap()
    }
}

#[test]
fn test_originated_packet_crosses_router() {
    let net = net();

    let report = net
        .engine
        .originate(net.a.ns, Packet::udp(ip("10.1.0.2"), 4000, ip("10.2.0.2"), 53))
        .unwrap();

    let got = report.delivered_to(net.b.ns);
    assert_eq!(got.len(), 1);
    assert_eq!(got[0].datagram().unwrap().ttl, 63);
    assert!(report.drops.is_empty());

    let counters = net.engine.query_counters(net.r).unwrap();
    assert_eq!(counters.forwarded, 1);
    assert_eq!(net.engine.take_delivered(net.b.ns).len(), 1);
    assert!(net.engine.take_delivered(net.b.ns).is_empty());
}

#[test]
fn test_source_address_is_filled_in() {
    let net = net();

    let report = net
        .engine
        .originate(
            net.a.ns,
            Packet::udp(std::net::Ipv4Addr::UNSPECIFIED, 4000, ip("10.2.0.2"), 53),
        )
        .unwrap();

    let got = report.delivered_to(net.b.ns);
    assert_eq!(got[0].datagram().unwrap().src, ip("10.1.0.2"));
}

#[test]
fn test_forwarding_disabled() {
    let net = net();
    net.engine.set_forwarding(net.r, false).unwrap();

    let report = net.send(net.from_a("10.1.0.2", "10.2.0.2"));
    assert_eq!(report.drops, vec![(net.r, DropReason::ForwardingDisabled)]);
    assert!(report.delivered.is_empty());

    // Traffic for the router itself is unaffected
    let report = net.send(net.from_a("10.1.0.2", "10.2.0.1"));
    assert_eq!(report.delivered_to(net.r).len(), 1);

    let counters = net.engine.query_counters(net.r).unwrap();
    assert_eq!(counters.drops(DropReason::ForwardingDisabled), 1);
}

#[test]
fn test_no_route() {
    let net = net();
    let report = net.send(net.from_a("10.1.0.2", "198.51.100.1"));
    assert_eq!(report.drops, vec![(net.r, DropReason::NoRoute)]);
}

#[test]
fn test_down_egress_removes_its_routes() {
    let net = net();
    net.engine
        .set_interface_state(net.eth1.iface, LinkState::Down)
        .unwrap();

    let report = net.send(net.from_a("10.1.0.2", "10.2.0.2"));
    assert_eq!(report.dropped(DropReason::NoRoute), 1);
}

#[test]
fn test_ttl_expires_at_router() {
    let net = net();

    let report = net.send(net.from_a("10.1.0.2", "10.2.0.2").with_ttl(1));
    assert_eq!(report.drops, vec![(net.r, DropReason::ZeroTtl)]);

    let report = net.send(net.from_a("10.1.0.2", "10.2.0.2").with_ttl(2));
    let got = report.delivered_to(net.b.ns);
    assert_eq!(got.len(), 1);
    assert_eq!(got[0].datagram().unwrap().ttl, 1);
}

#[test]
fn test_rpf_strict() {
    let net = net();
    net.engine.set_rp_filter(net.r, RpFilter::Strict).unwrap();

    // 10.2.0.77 lives behind eth1, not eth0
    let report = net.send(net.from_a("10.2.0.77", "10.2.0.2"));
    assert_eq!(report.drops, vec![(net.r, DropReason::RpfDrop)]);

    let report = net.send(net.from_a("10.1.0.2", "10.2.0.2"));
    assert_eq!(report.delivered_to(net.b.ns).len(), 1);

    let counters = net.engine.query_counters(net.r).unwrap();
    assert_eq!(counters.drops(DropReason::RpfDrop), 1);
}

#[test]
fn test_rpf_loose() {
    let net = net();
    net.engine.set_rp_filter(net.r, RpFilter::Loose).unwrap();

    // Any route back is enough
    let report = net.send(net.from_a("10.2.0.77", "10.2.0.2"));
    assert_eq!(report.delivered_to(net.b.ns).len(), 1);

    // No route back at all
    let report = net.send(net.from_a("192.0.2.1", "10.2.0.2"));
    assert_eq!(report.drops, vec![(net.r, DropReason::RpfDrop)]);
}

#[test]
fn test_rpf_off() {
    let net = net();

    let report = net.send(net.from_a("192.0.2.1", "10.2.0.2"));
    assert_eq!(report.delivered_to(net.b.ns).len(), 1);
}

#[test]
fn test_longest_prefix_wins() {
    let net = net();
    net.engine
        .add_route(net.r, RouteSpec::via(cidr("10.9.0.0/16"), ip("10.1.0.2")))
        .unwrap();
    net.engine
        .add_route(net.r, RouteSpec::via(cidr("10.9.1.0/24"), ip("10.2.0.2")))
        .unwrap();

    // The hosts do not forward, so the drop shows where the packet went
    let report = net.send(net.from_a("10.1.0.2", "10.9.1.5"));
    assert_eq!(report.drops, vec![(net.b.ns, DropReason::ForwardingDisabled)]);

    let report = net.send(net.from_a("10.1.0.2", "10.9.2.5"));
    assert_eq!(report.drops, vec![(net.a.ns, DropReason::ForwardingDisabled)]);
}

#[test]
fn test_lower_metric_wins() {
    let net = net();
    let prefix = cidr("10.9.0.0/16");
    net.engine
        .add_route(net.r, RouteSpec::via(prefix, ip("10.1.0.2")).with_metric(10))
        .unwrap();
    net.engine
        .add_route(net.r, RouteSpec::via(prefix, ip("10.2.0.2")).with_metric(5))
        .unwrap();

    let report = net.send(net.from_a("10.1.0.2", "10.9.0.1"));
    assert_eq!(report.drops, vec![(net.b.ns, DropReason::ForwardingDisabled)]);

    net.engine.delete_route(net.r, prefix, Some(5)).unwrap();
    let report = net.send(net.from_a("10.1.0.2", "10.9.0.1"));
    assert_eq!(report.drops, vec![(net.a.ns, DropReason::ForwardingDisabled)]);
}

#[test]
fn test_most_recent_route_wins_a_tie() {
    let net = net();
    let prefix = cidr("10.9.0.0/16");
    net.engine
        .add_route(net.r, RouteSpec::via(prefix, ip("10.1.0.2")))
        .unwrap();
    net.engine
        .add_route(net.r, RouteSpec::via(prefix, ip("10.2.0.2")))
        .unwrap();

    let report = net.send(net.from_a("10.1.0.2", "10.9.0.1"));
    assert_eq!(report.drops, vec![(net.b.ns, DropReason::ForwardingDisabled)]);
}

#[test]
fn test_route_must_be_reachable() {
    let net = net();

    let err = net
        .engine
        .add_route(net.r, RouteSpec::via(cidr("10.9.0.0/16"), ip("172.16.0.1")))
        .unwrap_err();
    assert!(matches!(err, Error::Configuration(_)));

    // A device from another namespace is rejected too
    let err = net
        .engine
        .add_route(net.r, RouteSpec::dev(cidr("10.9.0.0/16"), net.a.iface))
        .unwrap_err();
    assert!(matches!(err, Error::Configuration(_)));

    assert!(net
        .engine
        .delete_route(net.r, cidr("10.9.0.0/16"), None)
        .is_err());
}

#[test]
fn test_deleting_interface_purges_routes() {
    let net = net();
    net.engine
        .add_route(net.r, RouteSpec::via(cidr("10.9.0.0/16"), ip("10.2.0.2")))
        .unwrap();
    net.engine.delete_interface(net.eth1.iface).unwrap();

    let fib = net.engine.query_fib(net.r).unwrap();
    assert!(fib.iter().all(|r| r.interface != net.eth1.iface));

    let report = net.send(net.from_a("10.1.0.2", "10.9.0.1"));
    assert_eq!(report.drops, vec![(net.r, DropReason::NoRoute)]);
}

#[test]
fn test_lookup_route_answers_without_traffic() {
    let net = net();
    net.engine
        .add_route(net.r, RouteSpec::via(cidr("10.9.0.0/16"), ip("10.1.0.2")).with_metric(10))
        .unwrap();
    net.engine
        .add_route(net.r, RouteSpec::via(cidr("10.9.0.0/16"), ip("10.2.0.2")).with_metric(5))
        .unwrap();
    net.engine
        .add_route(net.r, RouteSpec::via(cidr("10.9.1.0/24"), ip("10.1.0.2")))
        .unwrap();

    let hit = net.engine.lookup_route(net.r, ip("10.9.1.5")).unwrap().unwrap();
    assert_eq!(hit.egress, net.eth0.iface);
    assert_eq!(hit.next_hop, ip("10.1.0.2"));
    assert!(!hit.is_local);

    let hit = net.engine.lookup_route(net.r, ip("10.9.2.5")).unwrap().unwrap();
    assert_eq!(hit.egress, net.eth1.iface);
    assert_eq!(hit.next_hop, ip("10.2.0.2"));

    // Directly connected: the destination is its own next hop
    let hit = net.engine.lookup_route(net.r, ip("10.2.0.2")).unwrap().unwrap();
    assert_eq!((hit.egress, hit.next_hop), (net.eth1.iface, ip("10.2.0.2")));

    let own = net.engine.lookup_route(net.r, ip("10.2.0.1")).unwrap().unwrap();
    assert!(own.is_local);
    assert_eq!(own.egress, net.eth1.iface);

    assert_eq!(net.engine.lookup_route(net.r, ip("198.51.100.1")).unwrap(), None);

    // Routes through a down interface are skipped
    net.engine
        .set_interface_state(net.eth1.iface, LinkState::Down)
        .unwrap();
    let hit = net.engine.lookup_route(net.r, ip("10.9.2.5")).unwrap().unwrap();
    assert_eq!(hit.egress, net.eth0.iface);

    let gone = net.engine.create_namespace("gone").unwrap();
    net.engine.delete_namespace(gone).unwrap();
    assert!(net.engine.lookup_route(gone, ip("10.9.2.5")).is_err());
}
