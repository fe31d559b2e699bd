//! Whole-path scenarios: LAN host behind a masquerading gateway

use super::lab::{home, ip, HOME};
use netlab::config;
use netlab::dataplane::{DropReason, NeighborState};
use netlab::protocol::{IcmpKind, Packet, Transport};
use netlab::topology::LinkState;
use netlab::Engine;

#[test]
fn test_ping_through_masquerade() {
    let (engine, names) = home();
    let lan = names.namespace("lan").unwrap();
    let gw = names.namespace("gw").unwrap();
    let isp = names.namespace("isp").unwrap();

    let report = engine
        .originate(lan, Packet::echo_request(ip("10.22.33.2"), ip("8.8.8.8"), 7, 1))
        .unwrap();
    assert!(report.drops.is_empty());

    // The ISP only ever sees the gateway's public address
    let seen = report.delivered_to(isp);
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].datagram().unwrap().src, ip("203.0.113.2"));

    let replies = report.delivered_to(lan);
    assert_eq!(replies.len(), 1);
    let reply = replies[0].datagram().unwrap();
    assert_eq!(reply.src, ip("8.8.8.8"));
    assert_eq!(reply.dst, ip("10.22.33.2"));
    assert_eq!(
        reply.transport,
        Transport::Icmp {
            kind: IcmpKind::EchoReply,
            ident: 7,
            seq: 1
        }
    );

    let flows = engine.query_conntrack();
    assert_eq!(flows.len(), 1);
    assert_eq!(flows[0].original, "icmp 10.22.33.2:7 -> 8.8.8.8:7");
    assert!(flows[0].replied);

    assert_eq!(engine.query_counters(gw).unwrap().forwarded, 2);
}

#[test]
fn test_remote_ping_is_answered_by_gateway() {
    let (engine, names) = home();
    let lan = names.namespace("lan").unwrap();
    let gw = names.namespace("gw").unwrap();
    let isp = names.namespace("isp").unwrap();

    engine
        .originate(lan, Packet::echo_request(ip("10.22.33.2"), ip("8.8.8.8"), 7, 1))
        .unwrap();

    // Same identifier as the tracked ping, but a request is not a reply
    let report = engine
        .originate(isp, Packet::echo_request(ip("8.8.8.8"), ip("203.0.113.2"), 7, 1))
        .unwrap();
    assert!(report.delivered_to(lan).is_empty());
    assert_eq!(report.delivered_to(gw).len(), 1);

    let answers = report.delivered_to(isp);
    assert_eq!(answers.len(), 1);
    let answer = answers[0].datagram().unwrap();
    assert_eq!(answer.src, ip("203.0.113.2"));
    assert_eq!(
        answer.transport,
        Transport::Icmp {
            kind: IcmpKind::EchoReply,
            ident: 7,
            seq: 1
        }
    );
}

#[test]
fn test_second_ping_reuses_everything() {
    let (engine, names) = home();
    let lan = names.namespace("lan").unwrap();
    let gw = names.namespace("gw").unwrap();

    engine
        .originate(lan, Packet::echo_request(ip("10.22.33.2"), ip("8.8.8.8"), 7, 1))
        .unwrap();
    let probes_before = engine.query_counters(lan).unwrap().probes_sent;

    let report = engine
        .originate(lan, Packet::echo_request(ip("10.22.33.2"), ip("8.8.8.8"), 7, 2))
        .unwrap();
    assert_eq!(report.delivered_to(lan).len(), 1);
    assert_eq!(report.held, 0);
    assert_eq!(engine.query_conntrack().len(), 1);
    assert_eq!(engine.query_counters(lan).unwrap().probes_sent, probes_before);

    let lan0 = names.interface("gw", "lan0").unwrap();
    let neighbors = engine.query_neighbor_cache(gw).unwrap();
    let row = neighbors
        .iter()
        .find(|r| r.iface == lan0 && r.ip == ip("10.22.33.2"))
        .unwrap();
    assert_eq!(row.state, NeighborState::Reachable);
}

#[test]
fn test_wan_down_means_no_route() {
    let (engine, names) = home();
    let lan = names.namespace("lan").unwrap();
    let gw = names.namespace("gw").unwrap();
    let wan0 = names.interface("gw", "wan0").unwrap();

    engine.set_interface_state(wan0, LinkState::Down).unwrap();
    let report = engine
        .originate(lan, Packet::echo_request(ip("10.22.33.2"), ip("8.8.8.8"), 7, 1))
        .unwrap();
    assert_eq!(report.drops, vec![(gw, DropReason::NoRoute)]);
    assert!(engine.query_conntrack().is_empty());

    engine.set_interface_state(wan0, LinkState::Up).unwrap();
    let report = engine
        .originate(lan, Packet::echo_request(ip("10.22.33.2"), ip("8.8.8.8"), 7, 2))
        .unwrap();
    assert_eq!(report.delivered_to(lan).len(), 1);
}

#[test]
fn test_deleting_link_loses_carrier() {
    let (engine, names) = home();
    let lan = names.namespace("lan").unwrap();
    let gw = names.namespace("gw").unwrap();

    engine
        .originate(lan, Packet::echo_request(ip("10.22.33.2"), ip("8.8.8.8"), 7, 1))
        .unwrap();

    let wan0 = names.interface("gw", "wan0").unwrap();
    let link = engine.with_topology(|t| t.interface(wan0).unwrap().link).unwrap();
    engine.delete_link(link).unwrap();

    let report = engine
        .originate(lan, Packet::echo_request(ip("10.22.33.2"), ip("8.8.8.8"), 7, 2))
        .unwrap();
    assert_eq!(report.drops, vec![(gw, DropReason::NoCarrier)]);
}

#[test]
fn test_scenario_file_and_export() {
    let path = std::env::temp_dir().join(format!("netlab-home-{}.toml", std::process::id()));
    std::fs::write(&path, HOME).unwrap();
    let config = config::load(&path).unwrap();
    std::fs::remove_file(&path).unwrap();

    let (engine, names) = Engine::from_config(&config).unwrap();
    let lan = names.namespace("lan").unwrap();
    engine
        .originate(lan, Packet::echo_request(ip("10.22.33.2"), ip("8.8.8.8"), 7, 1))
        .unwrap();

    let text = engine.export().to_toml().unwrap();
    assert!(text.contains("name = \"gw\""));
    assert!(text.contains("[[conntrack]]"));
    assert!(text.contains("icmp 10.22.33.2:7 -> 8.8.8.8:7"));

    // Nothing moves between two exports
    assert_eq!(engine.export().to_toml().unwrap(), text);
}

#[test]
fn test_deleting_namespace_cleans_up() {
    let (engine, names) = home();
    let lan = names.namespace("lan").unwrap();
    let gw = names.namespace("gw").unwrap();

    engine
        .originate(lan, Packet::echo_request(ip("10.22.33.2"), ip("8.8.8.8"), 7, 1))
        .unwrap();
    engine.delete_namespace(gw).unwrap();

    assert!(engine.query_conntrack().is_empty());
    assert!(engine.query_fib(gw).is_err());
    assert!(engine.query_counters(gw).is_err());

    // lan lost its peer with the namespace
    let report = engine
        .originate(lan, Packet::echo_request(ip("10.22.33.2"), ip("8.8.8.8"), 7, 2))
        .unwrap();
    assert_eq!(report.drops, vec![(lan, DropReason::NoCarrier)]);
}
