//! Masquerade scenarios on the home-router layout

use super::lab::{cidr, home, home_with, ip};
use netlab::dataplane::{DropReason, FlowTuple, TcpConnState};
use netlab::protocol::{IpProtocol, Packet, TcpFlags};
use netlab::{Engine, Names};
use std::time::Duration;

struct Home {
    engine: Engine,
    names: Names,
}

impl Home {
    fn new((engine, names): (Engine, Names)) -> Self {
        Self { engine, names }
    }

    fn ns(&self, name: &str) -> netlab::topology::NamespaceId {
        self.names.namespace(name).unwrap()
    }

    /// Send UDP from the LAN host; returns the source port seen by the ISP
    fn udp_out(&self, src: &str, sport: u16, dst: &str, dport: u16) -> Option<u16> {
        let report = self
            .engine
            .originate(self.ns("lan"), Packet::udp(ip(src), sport, ip(dst), dport))
            .unwrap();
        let seen = report.delivered_to(self.ns("isp"));
        seen.first().map(|p| {
            let dgram = p.datagram().unwrap();
            assert_eq!(dgram.src, ip("203.0.113.2"));
            dgram.transport.src_port()
        })
    }

    /// Send UDP from the ISP side
    fn udp_in(&self, src: &str, sport: u16, dport: u16) -> netlab::InjectReport {
        self.engine
            .originate(
                self.ns("isp"),
                Packet::udp(ip(src), sport, ip("203.0.113.2"), dport),
            )
            .unwrap()
    }
}

fn udp_flow(src: &str, sport: u16, dst: &str, dport: u16) -> FlowTuple {
    FlowTuple {
        protocol: IpProtocol::Udp,
        src: ip(src),
        src_port: sport,
        dst: ip(dst),
        dst_port: dport,
    }
}

#[test]
fn test_udp_round_trip() {
    let home = Home::new(home());

    let port = home.udp_out("10.22.33.2", 40000, "8.8.8.8", 53).unwrap();
    assert_eq!(port, 40000);

    let report = home.udp_in("8.8.8.8", 53, port);
    let got = report.delivered_to(home.ns("lan"));
    assert_eq!(got.len(), 1);
    let dgram = got[0].datagram().unwrap();
    assert_eq!(dgram.src, ip("8.8.8.8"));
    assert_eq!(dgram.dst, ip("10.22.33.2"));
    assert_eq!(dgram.transport.dst_port(), 40000);

    let flows = home.engine.query_conntrack();
    assert_eq!(flows.len(), 1);
    assert_eq!(flows[0].original, "udp 10.22.33.2:40000 -> 8.8.8.8:53");
    assert_eq!(flows[0].reply, "udp 8.8.8.8:53 -> 203.0.113.2:40000");
    assert!(flows[0].replied);
}

#[test]
fn test_same_port_to_different_remotes_is_shared() {
    let home = Home::new(home());

    let first = home.udp_out("10.22.33.2", 40000, "8.8.8.8", 53).unwrap();
    let second = home.udp_out("10.22.33.2", 40000, "203.0.113.1", 53).unwrap();
    assert_eq!(first, 40000);
    assert_eq!(second, 40000);
    assert_eq!(home.engine.query_conntrack().len(), 2);
}

#[test]
fn test_port_clash_gets_a_new_port() {
    let home = Home::new(home());
    let lan = home.names.interface("lan", "eth0").unwrap();
    home.engine
        .assign_address(lan, cidr("10.22.33.3/24"))
        .unwrap();

    let first = home.udp_out("10.22.33.2", 40000, "8.8.8.8", 53).unwrap();
    let second = home.udp_out("10.22.33.3", 40000, "8.8.8.8", 53).unwrap();
    assert_eq!(first, 40000);
    assert_ne!(second, 40000);

    // Each reply finds its own flow
    let report = home.udp_in("8.8.8.8", 53, second);
    let got = report.delivered_to(home.ns("lan"));
    assert_eq!(got[0].datagram().unwrap().dst, ip("10.22.33.3"));

    let report = home.udp_in("8.8.8.8", 53, first);
    let got = report.delivered_to(home.ns("lan"));
    assert_eq!(got[0].datagram().unwrap().dst, ip("10.22.33.2"));
}

#[test]
fn test_table_full_drops_new_flows_only() {
    let home = Home::new(home_with("conntrack_max = 1"));
    let gw = home.ns("gw");

    assert!(home.udp_out("10.22.33.2", 40000, "8.8.8.8", 53).is_some());

    let report = home
        .engine
        .originate(
            home.ns("lan"),
            Packet::udp(ip("10.22.33.2"), 40001, ip("8.8.8.8"), 53),
        )
        .unwrap();
    assert_eq!(report.drops, vec![(gw, DropReason::ConntrackTableFull)]);
    assert!(report.delivered.is_empty());

    // The existing flow keeps working in both directions
    assert_eq!(home.udp_out("10.22.33.2", 40000, "8.8.8.8", 53), Some(40000));
    let report = home.udp_in("8.8.8.8", 53, 40000);
    assert_eq!(report.delivered_to(home.ns("lan")).len(), 1);

    let counters = home.engine.query_counters(gw).unwrap();
    assert_eq!(counters.drops(DropReason::ConntrackTableFull), 1);
}

#[test]
fn test_idle_flow_expires() {
    let home = Home::new(home_with("udp_timeout_secs = 30"));
    home.udp_out("10.22.33.2", 40000, "8.8.8.8", 53).unwrap();

    home.engine.advance(Duration::from_secs(20));
    assert_eq!(home.engine.query_conntrack().len(), 1);

    home.engine.advance(Duration::from_secs(11));
    assert!(home.engine.query_conntrack().is_empty());

    // Without a flow the reply is just traffic for the router itself
    let report = home.udp_in("8.8.8.8", 53, 40000);
    assert!(report.delivered_to(home.ns("lan")).is_empty());
    assert_eq!(report.delivered_to(home.ns("gw")).len(), 1);
}

#[test]
fn test_remove_flow_by_either_tuple() {
    let home = Home::new(home());
    let gw = home.ns("gw");

    home.udp_out("10.22.33.2", 40000, "8.8.8.8", 53).unwrap();
    let original = udp_flow("10.22.33.2", 40000, "8.8.8.8", 53);
    assert!(home.engine.remove_flow(gw, &original));
    assert!(!home.engine.remove_flow(gw, &original));
    assert!(home.engine.query_conntrack().is_empty());

    home.udp_out("10.22.33.2", 40000, "8.8.8.8", 53).unwrap();
    let reply = udp_flow("8.8.8.8", 53, "203.0.113.2", 40000);
    assert!(home.engine.remove_flow(gw, &reply));
    assert!(home.engine.query_conntrack().is_empty());

    let report = home.udp_in("8.8.8.8", 53, 40000);
    assert!(report.delivered_to(home.ns("lan")).is_empty());
}

#[test]
fn test_disabling_masquerade_drops_flows() {
    let home = Home::new(home());
    home.udp_out("10.22.33.2", 40000, "8.8.8.8", 53).unwrap();

    let wan = home.names.interface("gw", "wan0").unwrap();
    home.engine.set_masquerade(wan, false).unwrap();
    assert!(home.engine.query_conntrack().is_empty());

    // Now the private source leaves untranslated
    let report = home
        .engine
        .originate(
            home.ns("lan"),
            Packet::udp(ip("10.22.33.2"), 40000, ip("8.8.8.8"), 53),
        )
        .unwrap();
    let seen = report.delivered_to(home.ns("isp"));
    assert_eq!(seen[0].datagram().unwrap().src, ip("10.22.33.2"));
}

#[test]
fn test_tcp_state_follows_handshake() {
    let home = Home::new(home());
    let lan = home.ns("lan");
    let isp = home.ns("isp");

    home.engine
        .originate(
            lan,
            Packet::tcp(ip("10.22.33.2"), 50000, ip("8.8.8.8"), 443, TcpFlags::SYN),
        )
        .unwrap();
    let flows = home.engine.query_conntrack();
    assert_eq!(flows[0].tcp_state, Some(TcpConnState::SynSent));

    let report = home
        .engine
        .originate(
            isp,
            Packet::tcp(ip("8.8.8.8"), 443, ip("203.0.113.2"), 50000, TcpFlags::SYN_ACK),
        )
        .unwrap();
    assert_eq!(report.delivered_to(lan).len(), 1);

    let flows = home.engine.query_conntrack();
    assert_eq!(flows[0].tcp_state, Some(TcpConnState::Established));
}

#[test]
fn test_dropped_reply_leaves_flow_alone() {
    let home = Home::new(home());
    let lan = home.ns("lan");
    let gw = home.ns("gw");

    home.engine
        .originate(
            lan,
            Packet::tcp(ip("10.22.33.2"), 5000, ip("8.8.8.8"), 80, TcpFlags::SYN),
        )
        .unwrap();

    // The RST would close the flow, but it dies at the gateway
    let report = home
        .engine
        .originate(
            home.ns("isp"),
            Packet::tcp(ip("8.8.8.8"), 80, ip("203.0.113.2"), 5000, TcpFlags::RST).with_ttl(1),
        )
        .unwrap();
    assert_eq!(report.drops, vec![(gw, DropReason::ZeroTtl)]);

    let flows = home.engine.query_conntrack();
    assert_eq!(flows.len(), 1);
    assert_eq!(flows[0].tcp_state, Some(TcpConnState::SynSent));
    assert!(!flows[0].replied);

    // A reply that gets through still completes the handshake
    let report = home
        .engine
        .originate(
            home.ns("isp"),
            Packet::tcp(ip("8.8.8.8"), 80, ip("203.0.113.2"), 5000, TcpFlags::SYN_ACK),
        )
        .unwrap();
    assert_eq!(report.delivered_to(lan).len(), 1);
    let flows = home.engine.query_conntrack();
    assert_eq!(flows[0].tcp_state, Some(TcpConnState::Established));
    assert!(flows[0].replied);
}
