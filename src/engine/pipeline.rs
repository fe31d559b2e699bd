//! Packet pipeline
//!
//! Delivery is synchronous: work produced while handling a packet (a frame
//! crossing a link, a flood copy, a resolution reply, an echo reply) goes on
//! a queue that is drained before `inject` returns.

use super::Engine;
use crate::dataplane::{
    forward, route_output, DropReason, Fib, ForwardAction, ForwardPolicy, L2ForwardAction,
    NeighborKey, Probe, Resolve, SnatResult, Waiter,
};
use crate::protocol::{
    ArpMessage, ArpOp, IcmpKind, MacAddr, Packet, Payload, Transport,
};
use crate::topology::{BridgeId, InterfaceId, InterfaceKind, NamespaceId};
use crate::Result;
use std::collections::VecDeque;
use std::net::Ipv4Addr;
use std::time::Duration;
use tracing::{debug, trace, warn};

/// Upper bound on work items per call, so a switching loop cannot spin forever
const MAX_STEPS: usize = 100_000;

/// What happened during one `inject`/`originate`/`advance` call
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InjectReport {
    /// Packets handed to a namespace's own stack
    pub delivered: Vec<(NamespaceId, Packet)>,
    /// Silent drops, in the order they happened
    pub drops: Vec<(NamespaceId, DropReason)>,
    /// Packets parked waiting for neighbor resolution
    pub held: usize,
    /// Frames put on a link or into a bridge
    pub transmitted: usize,
}

impl InjectReport {
    /// Number of drops recorded for `reason`
    pub fn dropped(&self, reason: DropReason) -> usize {
        self.drops.iter().filter(|(_, r)| *r == reason).count()
    }

    pub fn delivered_to(&self, ns: NamespaceId) -> Vec<&Packet> {
        self.delivered
            .iter()
            .filter(|(n, _)| *n == ns)
            .map(|(_, p)| p)
            .collect()
    }
}

#[derive(Debug)]
enum Work {
    /// Frame arriving on an interface from the wire
    Receive { iface: InterfaceId, packet: Packet },
    /// Frame leaving through an interface
    Transmit { iface: InterfaceId, packet: Packet },
    /// Datagram sent by a namespace's own stack
    Originate { ns: NamespaceId, packet: Packet },
}

#[derive(Debug, Default)]
struct Run {
    queue: VecDeque<Work>,
    report: InjectReport,
}

impl Run {
    fn push(&mut self, work: Work) {
        self.queue.push_back(work);
    }
}

impl Engine {
    /// Put a frame on the wire of `iface` as if it had just arrived
    ///
    /// Drops are never errors; they show up in the report and the counters.
    /// Only an unknown interface fails.
    pub fn inject(&self, iface: InterfaceId, packet: Packet) -> Result<InjectReport> {
        self.topo().interface(iface)?;
        let mut run = Run::default();
        run.push(Work::Receive { iface, packet });
        self.run(&mut run);
        Ok(run.report)
    }

    /// Send a datagram from `ns`'s own stack (the local output path)
    ///
    /// An unspecified source address is filled in from the egress interface.
    pub fn originate(&self, ns: NamespaceId, packet: Packet) -> Result<InjectReport> {
        self.topo().namespace(ns)?;
        let mut run = Run::default();
        run.push(Work::Originate { ns, packet });
        self.run(&mut run);
        Ok(run.report)
    }

    /// Move the logical clock forward by `by`, firing every timer on the way
    ///
    /// Neighbor retransmissions fire at their exact deadlines so a probe's
    /// reply and its follow-up are ordered as they would be in real time.
    pub fn advance(&self, by: Duration) -> InjectReport {
        let mut run = Run::default();
        let target = self.clock.now() + by;

        loop {
            let next = self.neighbors().next_deadline();
            let Some(deadline) = next else {
                break;
            };
            if deadline > target {
                break;
            }
            let now = self.clock.now();
            if deadline > now {
                self.clock.advance(deadline - now);
            }
            self.run_timers(&mut run);
        }

        let now = self.clock.now();
        if target > now {
            self.clock.advance(target - now);
        }
        self.run_timers(&mut run);
        run.report
    }

    fn run_timers(&self, run: &mut Run) {
        let now = self.clock.now();

        let tick = self.neighbors().tick(now);
        for probe in tick.probes {
            self.send_probe(run, probe);
        }
        for (key, waiter) in tick.failed {
            self.fail_waiter(Some(&mut run.report), key, waiter);
        }

        let aged = self.bridge_tables().age_out(now);
        let expired = self.nat().table_mut().expire(now);
        if aged > 0 || expired > 0 {
            debug!(
                "t={}ms: aged {} fdb entries, expired {} flows",
                now.as_millis(),
                aged,
                expired
            );
        }

        self.run(run);
    }

    pub(super) fn record_drop(
        &self,
        report: Option<&mut InjectReport>,
        ns: NamespaceId,
        reason: DropReason,
    ) {
        trace!("{}: drop ({})", ns, reason);
        self.metrics.record_drop(ns, reason);
        if let Some(report) = report {
            report.drops.push((ns, reason));
        }
    }

    fn drop_packet(&self, run: &mut Run, ns: NamespaceId, reason: DropReason) {
        self.record_drop(Some(&mut run.report), ns, reason);
    }

    fn run(&self, run: &mut Run) {
        let mut steps = 0;
        while let Some(work) = run.queue.pop_front() {
            steps += 1;
            if steps > MAX_STEPS {
                warn!(
                    "Gave up after {} steps ({} items left); is there a switching loop?",
                    MAX_STEPS,
                    run.queue.len()
                );
                run.queue.clear();
                break;
            }
            match work {
                Work::Receive { iface, packet } => self.receive(run, iface, packet),
                Work::Transmit { iface, packet } => self.transmit(run, iface, packet),
                Work::Originate { ns, packet } => self.local_output(run, ns, packet),
            }
        }
    }

    // ========================================
    // Link layer
    // ========================================

    fn receive(&self, run: &mut Run, iface: InterfaceId, packet: Packet) {
        let info = {
            let topo = self.topo();
            topo.interface(iface)
                .map(|i| (i.ns, i.is_up(), i.master, i.mac))
        };
        let Ok((ns, up, master, mac)) = info else {
            return;
        };
        if !up {
            self.drop_packet(run, ns, DropReason::InterfaceDown);
            return;
        }
        self.metrics.with(ns, |s| s.record_rx(packet.wire_len()));

        match master {
            Some(bridge) => self.bridge_input(run, bridge, iface, packet),
            None => self.l3_input(run, ns, iface, mac, packet),
        }
    }

    fn transmit(&self, run: &mut Run, iface: InterfaceId, packet: Packet) {
        let info = {
            let topo = self.topo();
            topo.interface(iface).map(|i| {
                let peer_up = topo
                    .peer(iface)
                    .and_then(|p| topo.interface(p).ok())
                    .map(|p| (p.id, p.is_up()));
                (i.ns, i.is_up(), i.kind, peer_up)
            })
        };
        let Ok((ns, up, kind, peer)) = info else {
            return;
        };
        if !up {
            self.drop_packet(run, ns, DropReason::InterfaceDown);
            return;
        }

        match kind {
            // The bridge's own stack sends into the switch through its device port
            InterfaceKind::Bridge(bridge) => {
                self.metrics.with(ns, |s| s.record_tx(packet.wire_len()));
                run.report.transmitted += 1;
                self.bridge_input(run, bridge, iface, packet);
            }
            InterfaceKind::Veth => match peer {
                Some((peer, true)) => {
                    self.metrics.with(ns, |s| s.record_tx(packet.wire_len()));
                    run.report.transmitted += 1;
                    trace!("{} -> {}: {:?}", iface, peer, packet.payload);
                    run.push(Work::Receive {
                        iface: peer,
                        packet,
                    });
                }
                _ => self.drop_packet(run, ns, DropReason::NoCarrier),
            },
        }
    }

    fn bridge_input(&self, run: &mut Run, bridge: BridgeId, ingress: InterfaceId, packet: Packet) {
        let info = {
            let topo = self.topo();
            topo.bridge(bridge).and_then(|br| {
                let device = topo.interface(br.iface)?;
                let up_ports: Vec<InterfaceId> = br
                    .ports
                    .iter()
                    .copied()
                    .filter(|p| topo.interface(*p).is_ok_and(|i| i.is_up()))
                    .collect();
                Ok((br.ns, br.iface, device.mac, device.is_up(), up_ports))
            })
        };
        let Ok((ns, device, device_mac, device_up, up_ports)) = info else {
            return;
        };
        if !device_up {
            self.drop_packet(run, ns, DropReason::InterfaceDown);
            return;
        }

        // Learning happens before any forwarding decision, even if nothing goes out
        let action = {
            let now = self.clock.now();
            let mut tables = self.bridge_tables();
            match tables.get_mut(bridge) {
                Some(fdb) => fdb.process(packet.src_mac, &packet.dst_mac, ingress, now),
                None => return,
            }
        };

        let group = packet.dst_mac.is_broadcast() || packet.dst_mac.is_multicast();
        let targets: Vec<InterfaceId> = if packet.dst_mac == device_mac && ingress != device {
            vec![device]
        } else {
            match action {
                L2ForwardAction::Forward { port } => vec![port],
                // Unknown unicast floods the ports but not the bridge's own stack
                L2ForwardAction::Flood { ports } => ports
                    .into_iter()
                    .filter(|p| *p != device || group)
                    .collect(),
                L2ForwardAction::Filter => Vec::new(),
            }
        };
        trace!("{}: {} from {} -> {:?}", bridge, packet.dst_mac, ingress, targets);

        for port in targets {
            if port == device {
                run.push(Work::Receive {
                    iface: device,
                    packet: packet.clone(),
                });
            } else if up_ports.contains(&port) {
                run.push(Work::Transmit {
                    iface: port,
                    packet: packet.clone(),
                });
            }
        }
    }

    // ========================================
    // Network layer
    // ========================================

    fn l3_input(
        &self,
        run: &mut Run,
        ns: NamespaceId,
        iface: InterfaceId,
        mac: MacAddr,
        packet: Packet,
    ) {
        let dst = packet.dst_mac;
        if dst != mac && !dst.is_broadcast() && !dst.is_multicast() {
            self.drop_packet(run, ns, DropReason::OtherHost);
            return;
        }
        match packet.payload {
            Payload::Arp(msg) => self.arp_input(run, ns, iface, mac, msg),
            Payload::Ipv4(_) => self.ip_input(run, ns, iface, packet),
        }
    }

    /// Answer queries for any local address and learn from whatever arrives
    fn arp_input(
        &self,
        run: &mut Run,
        ns: NamespaceId,
        iface: InterfaceId,
        own_mac: MacAddr,
        msg: ArpMessage,
    ) {
        let now = self.clock.now();
        let key = NeighborKey::new(ns, iface, msg.sender_ip);

        match msg.op {
            ArpOp::Request => {
                let is_local = self.topo().is_local_address(ns, msg.target_ip);
                if !is_local {
                    trace!("{}: who-has {} is not for us", iface, msg.target_ip);
                    return;
                }
                if !msg.sender_ip.is_unspecified() {
                    let released = self.neighbors().record_stale(key, msg.sender_mac, now);
                    self.release(run, key, msg.sender_mac, released);
                }
                let reply =
                    ArpMessage::reply(own_mac, msg.target_ip, msg.sender_mac, msg.sender_ip);
                trace!("{}: {} is-at {} (to {})", iface, msg.target_ip, own_mac, msg.sender_ip);
                run.push(Work::Transmit {
                    iface,
                    packet: Packet::arp(own_mac, msg.sender_mac, reply),
                });
            }
            ArpOp::Reply => {
                let released = self.neighbors().confirm(&key, msg.sender_mac, now);
                self.release(run, key, msg.sender_mac, released);
            }
        }
    }

    /// Hand a resolved MAC to everyone who was waiting for it
    fn release(&self, run: &mut Run, key: NeighborKey, mac: MacAddr, waiters: Vec<Waiter>) {
        if !waiters.is_empty() {
            debug!("{} {}: releasing {} waiters", key.iface, key.ip, waiters.len());
        }
        for waiter in waiters {
            match waiter {
                Waiter::Packet(mut packet) => {
                    packet.dst_mac = mac;
                    run.push(Work::Transmit {
                        iface: key.iface,
                        packet,
                    });
                }
                Waiter::Task(tx) => {
                    let _ = tx.send(Ok(mac));
                }
            }
        }
    }

    fn ip_input(&self, run: &mut Run, ns: NamespaceId, iface: InterfaceId, mut packet: Packet) {
        let info = {
            let topo = self.topo();
            topo.namespace(ns).and_then(|n| {
                let masquerade = topo.interface(iface)?.masquerade;
                Ok((
                    ForwardPolicy {
                        forwarding: n.forwarding,
                        rp_filter: n.rp_filter,
                    },
                    masquerade,
                ))
            })
        };
        let Ok((policy, masquerade)) = info else {
            return;
        };
        let Some(dgram) = packet.datagram_mut() else {
            return;
        };

        // Replies to masqueraded flows get their internal destination back
        // before the local-address check
        let now = self.clock.now();
        let matched = if masquerade {
            self.nat().dnat(ns, iface, dgram, now)
        } else {
            None
        };

        let usable = self.usable_interfaces(ns);
        let action = {
            let routing = self.routing();
            let empty = Fib::new();
            let fib = routing.fib(ns).unwrap_or(&empty);
            forward(fib, policy, iface, dgram, |i| usable.contains(&i))
        };

        // The flow only sees replies that made it past the forwarding step
        if let Some(matched) = matched {
            if !matches!(action, ForwardAction::Drop(_)) {
                self.nat().confirm_reply(ns, &matched, now);
            }
        }

        match action {
            ForwardAction::Local => self.local_deliver(run, ns, packet),
            ForwardAction::Drop(reason) => self.drop_packet(run, ns, reason),
            ForwardAction::Forward { egress, next_hop } => {
                self.output(run, ns, egress, next_hop, packet, true)
            }
        }
    }

    fn local_deliver(&self, run: &mut Run, ns: NamespaceId, packet: Packet) {
        self.metrics.with(ns, |s| s.delivered.inc());

        if let Some(dgram) = packet.datagram() {
            trace!("{}: delivered {} -> {}", ns, dgram.src, dgram.dst);
            if let Transport::Icmp {
                kind: IcmpKind::EchoRequest,
                ident,
                seq,
            } = dgram.transport
            {
                let reply = Packet::echo_reply(dgram.dst, dgram.src, ident, seq)
                    .with_payload_len(dgram.payload_len);
                run.push(Work::Originate { ns, packet: reply });
            }
        }

        self.inbox().entry(ns).or_default().push(packet.clone());
        run.report.delivered.push((ns, packet));
    }

    fn local_output(&self, run: &mut Run, ns: NamespaceId, mut packet: Packet) {
        let Some(dgram) = packet.datagram_mut() else {
            self.drop_packet(run, ns, DropReason::Unsupported);
            return;
        };

        let usable = self.usable_interfaces(ns);
        let action = {
            let routing = self.routing();
            let empty = Fib::new();
            let fib = routing.fib(ns).unwrap_or(&empty);
            route_output(fib, dgram, |i| usable.contains(&i))
        };

        match action {
            ForwardAction::Local => {
                if dgram.src.is_unspecified() {
                    dgram.src = dgram.dst;
                }
                self.local_deliver(run, ns, packet);
            }
            ForwardAction::Drop(reason) => self.drop_packet(run, ns, reason),
            ForwardAction::Forward { egress, next_hop } => {
                if dgram.src.is_unspecified() {
                    let source = self
                        .topo()
                        .interface(egress)
                        .ok()
                        .and_then(|i| i.source_address_for(next_hop));
                    match source {
                        Some(src) => dgram.src = src,
                        None => {
                            self.drop_packet(run, ns, DropReason::NoRoute);
                            return;
                        }
                    }
                }
                self.output(run, ns, egress, next_hop, packet, false);
            }
        }
    }

    /// NAT, neighbor resolution and transmission on `egress`
    fn output(
        &self,
        run: &mut Run,
        ns: NamespaceId,
        egress: InterfaceId,
        next_hop: Ipv4Addr,
        mut packet: Packet,
        forwarded: bool,
    ) {
        let info = {
            let topo = self.topo();
            topo.interface(egress)
                .map(|i| (i.masquerade, i.primary_address(), i.mac))
        };
        let Ok((masquerade, public, egress_mac)) = info else {
            return;
        };

        if let (true, Some(public), Some(dgram)) = (masquerade, public, packet.datagram_mut()) {
            let now = self.clock.now();
            let result = self.nat().snat(ns, egress, public, dgram, now);
            if matches!(result, SnatResult::TableFull) {
                self.drop_packet(run, ns, DropReason::ConntrackTableFull);
                return;
            }
        }

        if forwarded {
            self.metrics.with(ns, |s| s.forwarded.inc());
        }

        packet.src_mac = egress_mac;
        let key = NeighborKey::new(ns, egress, next_hop);
        let now = self.clock.now();
        let outcome = self.neighbors().resolve(key, Waiter::Packet(packet), now);

        match outcome {
            Resolve::Ready(mac, Waiter::Packet(mut packet)) => {
                packet.dst_mac = mac;
                run.push(Work::Transmit {
                    iface: egress,
                    packet,
                });
            }
            Resolve::Ready(_, Waiter::Task(_)) => {}
            Resolve::Pending { probe, .. } => {
                trace!("{}: holding packet for {} on {}", ns, next_hop, egress);
                run.report.held += 1;
                if let Some(probe) = probe {
                    self.send_probe(run, probe);
                }
            }
        }
    }

    pub(super) fn send_probe_now(&self, probe: Probe) {
        let mut run = Run::default();
        self.send_probe(&mut run, probe);
        self.run(&mut run);
    }

    /// Put a who-has query for `probe.key.ip` on the wire
    fn send_probe(&self, run: &mut Run, probe: Probe) {
        let key = probe.key;
        let info = {
            let topo = self.topo();
            topo.interface(key.iface)
                .map(|i| (i.mac, i.source_address_for(key.ip)))
        };
        let Ok((mac, source)) = info else {
            return;
        };
        let request = ArpMessage::request(mac, source.unwrap_or(Ipv4Addr::UNSPECIFIED), key.ip);
        let dst_mac = probe.unicast.unwrap_or(MacAddr::BROADCAST);
        trace!("{}: who-has {} (to {})", key.iface, key.ip, dst_mac);
        self.metrics.with(key.ns, |s| s.probes_sent.inc());
        run.push(Work::Transmit {
            iface: key.iface,
            packet: Packet::arp(mac, dst_mac, request),
        });
    }
}
