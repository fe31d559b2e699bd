//! Bridge scenarios: flooding, learning, mobility, ageing, capacity
//!
//! Topology:
//! ```text
//!   h1 (10.0.0.1) ── p1 ┐
//!   h2 (10.0.0.2) ── p2 ├─ br0 (10.0.0.254)   all in namespace "sw"
//!   h3 (10.0.0.3) ── p3 ┘
//! ```

use super::lab::{host, iface, ip, Node};
use netlab::dataplane::DropReason;
use netlab::engine::EngineConfig;
use netlab::protocol::{MacAddr, Packet};
use netlab::topology::{BridgeId, LinkState, NamespaceId};
use netlab::Engine;
use std::time::Duration;

struct Lan {
    engine: Engine,
    sw: NamespaceId,
    br0: BridgeId,
    hosts: [Node; 3],
    ports: [Node; 3],
}

fn lan(config: EngineConfig) -> Lan {
    let engine = Engine::new(config);
    let sw = engine.create_namespace("sw").unwrap();
    let br0 = engine.create_bridge(sw, "br0").unwrap();
    let device = engine.bridge_interface(br0).unwrap();
    engine
        .assign_address(device, "10.0.0.254/24".parse().unwrap())
        .unwrap();
    engine.set_interface_state(device, LinkState::Up).unwrap();

    let mut hosts = Vec::new();
    let mut ports = Vec::new();
    for n in 1..=3 {
        let addr = format!("10.0.0.{}/24", n);
        let h = host(&engine, &format!("h{}", n), Some(addr.as_str()));
        let p = iface(&engine, sw, &format!("p{}", n), None);
        engine.attach_to_bridge(p.iface, br0).unwrap();
        engine.create_link(h.iface, p.iface).unwrap();
        hosts.push(h);
        ports.push(p);
    }

    Lan {
        engine,
        sw,
        br0,
        hosts: [hosts[0], hosts[1], hosts[2]],
        ports: [ports[0], ports[1], ports[2]],
    }
}

fn udp(from: &Node, to_ip: &str, to_mac: MacAddr, src_ip: &str) -> Packet {
    Packet::udp(ip(src_ip), 5000, ip(to_ip), 6000).with_macs(from.mac, to_mac)
}

#[test]
fn test_flood_then_learn() {
    let lan = lan(EngineConfig::default());
    let [h1, h2, h3] = lan.hosts;
    let [p1, p2, _] = lan.ports;

    // Unknown destination: every port but the ingress gets a copy
    let report = lan
        .engine
        .inject(p1.iface, udp(&h1, "10.0.0.2", h2.mac, "10.0.0.1"))
        .unwrap();
    assert_eq!(report.transmitted, 2);
    assert_eq!(report.delivered_to(h2.ns).len(), 1);
    assert!(report.drops.contains(&(h3.ns, DropReason::OtherHost)));

    // The reply teaches the bridge where h2 lives
    let report = lan
        .engine
        .inject(p2.iface, udp(&h2, "10.0.0.1", h1.mac, "10.0.0.2"))
        .unwrap();
    assert_eq!(report.transmitted, 1);
    assert_eq!(report.delivered_to(h1.ns).len(), 1);

    // Second frame in the original direction goes to p2 only
    let report = lan
        .engine
        .inject(p1.iface, udp(&h1, "10.0.0.2", h2.mac, "10.0.0.1"))
        .unwrap();
    assert_eq!(report.transmitted, 1);
    assert_eq!(report.delivered_to(h2.ns).len(), 1);
    assert!(report.drops.is_empty());

    let fdb = lan.engine.query_fdb(lan.br0).unwrap();
    assert!(fdb.iter().any(|r| r.mac == h1.mac && r.port == p1.iface));
    assert!(fdb.iter().any(|r| r.mac == h2.mac && r.port == p2.iface));
}

#[test]
fn test_unicast_goes_only_to_learned_port() {
    let lan = lan(EngineConfig::default());
    let [h1, h2, h3] = lan.hosts;
    let [p1, p2, p3] = lan.ports;
    let roaming = MacAddr([0x02, 0xaa, 0, 0, 0, 1]);

    // Learn `roaming` behind p1
    lan.engine
        .inject(
            p1.iface,
            Packet::udp(ip("10.0.0.99"), 1, ip("10.0.0.9"), 1)
                .with_macs(roaming, MacAddr::BROADCAST),
        )
        .unwrap();
    let report = lan
        .engine
        .inject(p2.iface, udp(&h2, "10.0.0.99", roaming, "10.0.0.2"))
        .unwrap();
    assert_eq!(report.transmitted, 1);
    assert_eq!(report.drops, vec![(h1.ns, DropReason::OtherHost)]);

    // It moves to p3: the old mapping is overwritten
    lan.engine
        .inject(
            p3.iface,
            Packet::udp(ip("10.0.0.99"), 1, ip("10.0.0.9"), 1)
                .with_macs(roaming, MacAddr::BROADCAST),
        )
        .unwrap();
    let fdb = lan.engine.query_fdb(lan.br0).unwrap();
    let row = fdb.iter().find(|r| r.mac == roaming).unwrap();
    assert_eq!(row.port, p3.iface);

    let report = lan
        .engine
        .inject(p2.iface, udp(&h2, "10.0.0.99", roaming, "10.0.0.2"))
        .unwrap();
    assert_eq!(report.transmitted, 1);
    assert_eq!(report.drops, vec![(h3.ns, DropReason::OtherHost)]);
}

#[test]
fn test_ageing_removes_idle_entries() {
    let lan = lan(EngineConfig {
        fdb_ageing_time: Duration::from_secs(10),
        ..EngineConfig::default()
    });
    let [h1, h2, _] = lan.hosts;
    let [p1, _, _] = lan.ports;

    lan.engine
        .inject(p1.iface, udp(&h1, "10.0.0.2", h2.mac, "10.0.0.1"))
        .unwrap();
    assert_eq!(lan.engine.query_fdb(lan.br0).unwrap().len(), 1);

    lan.engine.advance(Duration::from_secs(5));
    assert_eq!(lan.engine.query_fdb(lan.br0).unwrap().len(), 1);

    lan.engine.advance(Duration::from_secs(6));
    assert!(lan.engine.query_fdb(lan.br0).unwrap().is_empty());
}

#[test]
fn test_full_table_evicts_oldest_and_floods() {
    let lan = lan(EngineConfig {
        fdb_capacity: 2,
        ..EngineConfig::default()
    });
    let [h1, h2, h3] = lan.hosts;
    let [p1, p2, p3] = lan.ports;

    lan.engine
        .inject(p1.iface, udp(&h1, "10.0.0.2", h2.mac, "10.0.0.1"))
        .unwrap();
    lan.engine
        .inject(p2.iface, udp(&h2, "10.0.0.1", h1.mac, "10.0.0.2"))
        .unwrap();
    // h1 was learned first and gives way to h3
    lan.engine
        .inject(p3.iface, udp(&h3, "10.0.0.2", h2.mac, "10.0.0.3"))
        .unwrap();

    let fdb = lan.engine.query_fdb(lan.br0).unwrap();
    assert_eq!(fdb.len(), 2);
    assert!(fdb.iter().all(|r| r.mac != h1.mac));

    // Frames to the evicted MAC are flooded again
    let report = lan
        .engine
        .inject(p2.iface, udp(&h2, "10.0.0.1", h1.mac, "10.0.0.2"))
        .unwrap();
    assert_eq!(report.transmitted, 2);
    assert_eq!(report.delivered_to(h1.ns).len(), 1);
}

#[test]
fn test_flush_forgets_everything() {
    let lan = lan(EngineConfig::default());
    let [h1, h2, _] = lan.hosts;
    let [p1, p2, _] = lan.ports;

    lan.engine
        .inject(p2.iface, udp(&h2, "10.0.0.1", h1.mac, "10.0.0.2"))
        .unwrap();
    lan.engine.flush_fdb(lan.br0).unwrap();
    assert!(lan.engine.query_fdb(lan.br0).unwrap().is_empty());

    let report = lan
        .engine
        .inject(p1.iface, udp(&h1, "10.0.0.2", h2.mac, "10.0.0.1"))
        .unwrap();
    assert_eq!(report.transmitted, 2);
}

#[test]
fn test_learning_happens_even_when_frame_is_filtered() {
    let lan = lan(EngineConfig::default());
    let [h1, _, _] = lan.hosts;
    let [p1, _, _] = lan.ports;
    let other = MacAddr([0x02, 0xbb, 0, 0, 0, 2]);

    // Teach the bridge that `other` is behind p1, then send to it from p1
    lan.engine
        .inject(
            p1.iface,
            Packet::udp(ip("10.0.0.50"), 1, ip("10.0.0.1"), 1).with_macs(other, h1.mac),
        )
        .unwrap();
    let report = lan
        .engine
        .inject(p1.iface, udp(&h1, "10.0.0.50", other, "10.0.0.1"))
        .unwrap();
    assert_eq!(report.transmitted, 0);

    let fdb = lan.engine.query_fdb(lan.br0).unwrap();
    assert!(fdb.iter().any(|r| r.mac == h1.mac && r.port == p1.iface));
}

#[test]
fn test_bridge_device_answers_ping() {
    let lan = lan(EngineConfig::default());
    let [h1, _, _] = lan.hosts;

    let report = lan
        .engine
        .originate(
            h1.ns,
            Packet::echo_request(ip("10.0.0.1"), ip("10.0.0.254"), 1, 1),
        )
        .unwrap();

    assert_eq!(report.delivered_to(lan.sw).len(), 1);
    let replies = report.delivered_to(h1.ns);
    assert_eq!(replies.len(), 1);
    assert_eq!(replies[0].datagram().unwrap().src, ip("10.0.0.254"));
}

#[test]
fn test_down_port_is_skipped() {
    let lan = lan(EngineConfig::default());
    let [h1, h2, _] = lan.hosts;
    let [p1, _, p3] = lan.ports;

    lan.engine
        .set_interface_state(p3.iface, LinkState::Down)
        .unwrap();
    let report = lan
        .engine
        .inject(p1.iface, udp(&h1, "10.0.0.2", h2.mac, "10.0.0.1"))
        .unwrap();
    assert_eq!(report.transmitted, 1);
    assert_eq!(report.delivered_to(h2.ns).len(), 1);
}
