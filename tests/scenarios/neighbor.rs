//! Neighbor resolution: logical callers and held packets
//!
//! ```text
//!   a (10.1.0.2) ── b (10.1.0.3)
//! ```

use super::lab::{cidr, host, ip, Node};
use netlab::dataplane::{DropReason, NeighborState};
use netlab::protocol::Packet;
use netlab::{Engine, Error};
use std::time::Duration;

fn pair() -> (Engine, Node, Node) {
    let engine = Engine::default();
    let a = host(&engine, "a", Some("10.1.0.2/24"));
    let b = host(&engine, "b", Some("10.1.0.3/24"));
    engine.create_link(a.iface, b.iface).unwrap();
    (engine, a, b)
}

#[tokio::test]
async fn test_resolve_answered_right_away() {
    let (engine, a, b) = pair();

    let resolution = engine.resolve(a.ns, ip("10.1.0.3")).unwrap();
    assert_eq!(resolution.ip(), ip("10.1.0.3"));
    assert_eq!(resolution.await.unwrap(), b.mac);

    // Second lookup is a cache hit and needs no query
    let probes = engine.query_counters(a.ns).unwrap().probes_sent;
    let mut again = engine.resolve(a.ns, ip("10.1.0.3")).unwrap();
    assert!(!again.is_pending());
    assert_eq!(again.try_result().unwrap().unwrap(), b.mac);
    assert_eq!(engine.query_counters(a.ns).unwrap().probes_sent, probes);
}

#[tokio::test]
async fn test_resolve_local_and_unroutable() {
    let (engine, a, _) = pair();

    let own = engine.resolve(a.ns, ip("10.1.0.2")).unwrap();
    assert_eq!(own.await.unwrap(), a.mac);

    let nowhere = engine.resolve(a.ns, ip("192.0.2.1")).unwrap();
    assert!(matches!(nowhere.await, Err(Error::Unreachable { .. })));

    let gone = engine.create_namespace("gone").unwrap();
    engine.delete_namespace(gone).unwrap();
    assert!(matches!(
        engine.resolve(gone, ip("10.1.0.3")),
        Err(Error::NamespaceNotFound(_))
    ));
}

#[tokio::test]
async fn test_unanswered_resolution_fails_after_retries() {
    let (engine, a, _) = pair();

    let mut pending = engine.resolve(a.ns, ip("10.1.0.99")).unwrap();
    assert!(pending.is_pending());

    engine.advance(Duration::from_secs(2));
    assert!(pending.try_result().is_none());

    engine.advance(Duration::from_secs(1));
    assert!(matches!(pending.await, Err(Error::Unreachable { .. })));

    assert_eq!(engine.query_counters(a.ns).unwrap().probes_sent, 3);
    let rows = engine.query_neighbor_cache(a.ns).unwrap();
    assert_eq!(rows[0].state, NeighborState::Unreachable);
}

#[tokio::test]
async fn test_concurrent_resolutions_share_one_query() {
    let (engine, a, b) = pair();

    let first = engine.resolve(a.ns, ip("10.1.0.50")).unwrap();
    let second = engine.resolve(a.ns, ip("10.1.0.50")).unwrap();
    assert_eq!(engine.query_counters(a.ns).unwrap().probes_sent, 1);

    // Abandoning one caller leaves the other waiting
    drop(first);
    engine.assign_address(b.iface, cidr("10.1.0.50/24")).unwrap();
    engine.advance(Duration::from_secs(1));

    assert_eq!(second.await.unwrap(), b.mac);
    assert_eq!(engine.query_counters(a.ns).unwrap().probes_sent, 2);
}

#[tokio::test]
async fn test_deleting_interface_fails_waiters() {
    let (engine, a, _) = pair();

    let pending = engine.resolve(a.ns, ip("10.1.0.99")).unwrap();
    engine.delete_interface(a.iface).unwrap();

    assert!(matches!(pending.await, Err(Error::Unreachable { .. })));
    assert!(engine.query_neighbor_cache(a.ns).unwrap().is_empty());
}

#[test]
fn test_held_packet_dropped_when_unresolved() {
    let (engine, a, _) = pair();

    let report = engine
        .originate(a.ns, Packet::udp(ip("10.1.0.2"), 4000, ip("10.1.0.99"), 53))
        .unwrap();
    assert_eq!(report.held, 1);
    assert!(report.drops.is_empty());

    let report = engine.advance(Duration::from_secs(3));
    assert_eq!(report.drops, vec![(a.ns, DropReason::Unreachable)]);
    assert_eq!(
        engine.query_counters(a.ns).unwrap().drops(DropReason::Unreachable),
        1
    );
}

#[test]
fn test_held_packets_released_in_order() {
    let (engine, a, b) = pair();
    engine.set_interface_state(b.iface, netlab::topology::LinkState::Down).unwrap();

    for port in [1, 2] {
        let report = engine
            .originate(a.ns, Packet::udp(ip("10.1.0.2"), port, ip("10.1.0.3"), 53))
            .unwrap();
        assert_eq!(report.held, 1);
    }

    // b comes back before the retries run out and answers the next query
    engine.set_interface_state(b.iface, netlab::topology::LinkState::Up).unwrap();
    let report = engine.advance(Duration::from_secs(1));

    let got = report.delivered_to(b.ns);
    assert_eq!(got.len(), 2);
    assert_eq!(got[0].datagram().unwrap().transport.src_port(), 1);
    assert_eq!(got[1].datagram().unwrap().transport.src_port(), 2);
}

#[test]
fn test_stale_entry_is_confirmed_before_use() {
    let (engine, a, b) = pair();

    engine
        .originate(a.ns, Packet::udp(ip("10.1.0.2"), 4000, ip("10.1.0.3"), 53))
        .unwrap();
    let row = engine.query_neighbor_cache(a.ns).unwrap()[0].clone();
    assert_eq!(row.state, NeighborState::Reachable);
    assert_eq!(row.mac, Some(b.mac));

    engine.advance(Duration::from_secs(31));
    let row = engine.query_neighbor_cache(a.ns).unwrap()[0].clone();
    assert_eq!(row.state, NeighborState::Stale);

    // The unicast check is answered at once and the packet goes out
    let report = engine
        .originate(a.ns, Packet::udp(ip("10.1.0.2"), 4000, ip("10.1.0.3"), 53))
        .unwrap();
    assert_eq!(report.delivered_to(b.ns).len(), 1);
    let row = engine.query_neighbor_cache(a.ns).unwrap()[0].clone();
    assert_eq!(row.state, NeighborState::Reachable);
}
