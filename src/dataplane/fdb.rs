//! Forwarding Database (MAC address table)
//!
//! Provides L2 switching for one bridge:
//! - MAC address learning from received frames, with MAC mobility
//! - FDB lookup for forwarding decisions
//! - Unknown unicast/broadcast flooding
//! - Ageing driven by the logical clock
//! - Bounded capacity with FIFO eviction by learn order

use crate::protocol::MacAddr;
use crate::topology::{BridgeId, InterfaceId, LinkState, TopologyEvent, TopologyObserver};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::time::Duration;
use tracing::{debug, trace};

/// Port identifier (the enslaved interface, or the bridge's own device)
pub type PortId = InterfaceId;

/// Default ageing time (5 minutes, per IEEE 802.1D)
pub const DEFAULT_AGEING_TIME: Duration = Duration::from_secs(300);

/// Default number of dynamic entries per bridge
pub const DEFAULT_FDB_CAPACITY: usize = 1024;

#[derive(Debug, Clone)]
struct FdbEntry {
    port: PortId,
    last_seen: Duration,
    /// Position in learn order; changes only when the MAC is (re)learned on a new port
    seq: u64,
}

/// Result of a L2 forwarding decision
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum L2ForwardAction {
    /// Forward to a specific port (unicast hit)
    Forward { port: PortId },
    /// Flood to all ports except ingress port (unknown unicast/broadcast/multicast)
    Flood { ports: Vec<PortId> },
    /// Filter/drop the frame (destination sits behind the ingress port)
    Filter,
}

/// Read-only copy of one FDB row
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FdbRow {
    pub mac: MacAddr,
    pub port: PortId,
    #[serde(rename = "last_seen_ms", serialize_with = "super::clock::as_millis")]
    pub last_seen: Duration,
}

/// Forwarding database of a single bridge
#[derive(Debug)]
pub struct Fdb {
    entries: HashMap<MacAddr, FdbEntry>,
    /// seq -> MAC, oldest learn first
    learn_order: BTreeMap<u64, MacAddr>,
    next_seq: u64,
    /// Member ports, including the bridge's own device
    ports: BTreeSet<PortId>,
    ageing_time: Duration,
    capacity: usize,
    evictions: u64,
}

impl Default for Fdb {
    fn default() -> Self {
        Self::new(DEFAULT_AGEING_TIME, DEFAULT_FDB_CAPACITY)
    }
}

impl Fdb {
    pub fn new(ageing_time: Duration, capacity: usize) -> Self {
        Self {
            entries: HashMap::new(),
            learn_order: BTreeMap::new(),
            next_seq: 0,
            ports: BTreeSet::new(),
            ageing_time,
            capacity: capacity.max(1),
            evictions: 0,
        }
    }

    // ========================================
    // Port Membership
    // ========================================

    pub fn add_port(&mut self, port: PortId) {
        self.ports.insert(port);
    }

    /// Remove a port and every MAC learned on it
    pub fn remove_port(&mut self, port: PortId) {
        self.ports.remove(&port);
        self.flush_port(port);
    }

    /// Drop MACs learned on a port but keep the membership
    pub fn flush_port(&mut self, port: PortId) {
        let stale: Vec<MacAddr> = self
            .entries
            .iter()
            .filter(|(_, e)| e.port == port)
            .map(|(mac, _)| *mac)
            .collect();
        for mac in stale {
            self.remove_entry(&mac);
        }
    }

    pub fn has_port(&self, port: PortId) -> bool {
        self.ports.contains(&port)
    }

    pub fn ports(&self) -> Vec<PortId> {
        self.ports.iter().copied().collect()
    }

    // ========================================
    // MAC Learning
    // ========================================

    /// Learn a MAC address on a port
    ///
    /// Overwrites any mapping on another port (MAC mobility). When the table
    /// is full, the entry learned longest ago is evicted first.
    /// Broadcast and multicast sources are never learned.
    pub fn learn(&mut self, mac: MacAddr, port: PortId, now: Duration) {
        if mac.is_multicast() || mac == MacAddr::ZERO {
            return;
        }

        if let Some(entry) = self.entries.get_mut(&mac) {
            entry.last_seen = now;
            if entry.port != port {
                trace!("FDB: {} moved from {} to {}", mac, entry.port, port);
                entry.port = port;
                let old_seq = entry.seq;
                let seq = self.next_seq;
                self.next_seq += 1;
                entry.seq = seq;
                self.learn_order.remove(&old_seq);
                self.learn_order.insert(seq, mac);
            }
            return;
        }

        while self.entries.len() >= self.capacity {
            let Some((_, oldest)) = self.learn_order.pop_first() else {
                break;
            };
            self.entries.remove(&oldest);
            self.evictions += 1;
            debug!("FDB full, evicted {}", oldest);
        }

        let seq = self.next_seq;
        self.next_seq += 1;
        self.entries.insert(
            mac,
            FdbEntry {
                port,
                last_seen: now,
                seq,
            },
        );
        self.learn_order.insert(seq, mac);
    }

    fn remove_entry(&mut self, mac: &MacAddr) -> Option<FdbEntry> {
        let entry = self.entries.remove(mac)?;
        self.learn_order.remove(&entry.seq);
        Some(entry)
    }

    // ========================================
    // FDB Lookup and Forwarding Decision
    // ========================================

    /// Lookup a MAC address, ignoring entries that have already aged out
    pub fn lookup(&self, mac: &MacAddr, now: Duration) -> Option<PortId> {
        self.entries
            .get(mac)
            .filter(|e| now.saturating_sub(e.last_seen) <= self.ageing_time)
            .map(|e| e.port)
    }

    /// Make a forwarding decision for a frame without learning
    pub fn forward(&self, dst_mac: &MacAddr, ingress_port: PortId, now: Duration) -> L2ForwardAction {
        if dst_mac.is_broadcast() || dst_mac.is_multicast() {
            return L2ForwardAction::Flood {
                ports: self.flood_ports(ingress_port),
            };
        }

        match self.lookup(dst_mac, now) {
            Some(egress) if egress == ingress_port => L2ForwardAction::Filter,
            Some(egress) => L2ForwardAction::Forward { port: egress },
            None => L2ForwardAction::Flood {
                ports: self.flood_ports(ingress_port),
            },
        }
    }

    /// Learn the source, then decide where the frame goes
    pub fn process(
        &mut self,
        src_mac: MacAddr,
        dst_mac: &MacAddr,
        ingress_port: PortId,
        now: Duration,
    ) -> L2ForwardAction {
        if !self.has_port(ingress_port) {
            return L2ForwardAction::Filter;
        }
        self.learn(src_mac, ingress_port, now);
        self.forward(dst_mac, ingress_port, now)
    }

    fn flood_ports(&self, ingress_port: PortId) -> Vec<PortId> {
        self.ports
            .iter()
            .filter(|&&p| p != ingress_port)
            .copied()
            .collect()
    }

    // ========================================
    // Ageing
    // ========================================

    /// Remove entries not refreshed for longer than the ageing time.
    /// Returns the number of entries removed.
    pub fn age_out(&mut self, now: Duration) -> usize {
        let ageing_time = self.ageing_time;
        let expired: Vec<MacAddr> = self
            .entries
            .iter()
            .filter(|(_, e)| now.saturating_sub(e.last_seen) > ageing_time)
            .map(|(mac, _)| *mac)
            .collect();
        for mac in &expired {
            self.remove_entry(mac);
        }
        expired.len()
    }

    pub fn ageing_time(&self) -> Duration {
        self.ageing_time
    }

    pub fn set_ageing_time(&mut self, ageing_time: Duration) {
        self.ageing_time = ageing_time;
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Entries evicted because the table was full
    pub fn evictions(&self) -> u64 {
        self.evictions
    }

    // ========================================
    // Utility Methods
    // ========================================

    /// Clear all learned entries (memberships stay)
    pub fn flush(&mut self) {
        self.entries.clear();
        self.learn_order.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Rows ordered by MAC
    pub fn rows(&self) -> Vec<FdbRow> {
        let mut rows: Vec<FdbRow> = self
            .entries
            .iter()
            .map(|(mac, e)| FdbRow {
                mac: *mac,
                port: e.port,
                last_seen: e.last_seen,
            })
            .collect();
        rows.sort_by_key(|r| r.mac);
        rows
    }
}

/// All bridge FDBs, kept in sync with the topology
#[derive(Debug)]
pub struct BridgeTables {
    tables: HashMap<BridgeId, Fdb>,
    ageing_time: Duration,
    capacity: usize,
}

impl BridgeTables {
    pub fn new(ageing_time: Duration, capacity: usize) -> Self {
        Self {
            tables: HashMap::new(),
            ageing_time,
            capacity,
        }
    }

    pub fn get(&self, bridge: BridgeId) -> Option<&Fdb> {
        self.tables.get(&bridge)
    }

    pub fn get_mut(&mut self, bridge: BridgeId) -> Option<&mut Fdb> {
        self.tables.get_mut(&bridge)
    }

    /// Run the ageing sweep on every bridge
    pub fn age_out(&mut self, now: Duration) -> usize {
        self.tables.values_mut().map(|fdb| fdb.age_out(now)).sum()
    }
}

impl TopologyObserver for BridgeTables {
    fn on_topology_event(&mut self, event: &TopologyEvent) {
        match *event {
            TopologyEvent::BridgeCreated { bridge, iface } => {
                let mut fdb = Fdb::new(self.ageing_time, self.capacity);
                fdb.add_port(iface);
                self.tables.insert(bridge, fdb);
            }
            TopologyEvent::BridgeRemoved { bridge } => {
                self.tables.remove(&bridge);
            }
            TopologyEvent::PortAttached { bridge, iface } => {
                if let Some(fdb) = self.tables.get_mut(&bridge) {
                    fdb.add_port(iface);
                }
            }
            TopologyEvent::PortDetached { bridge, iface } => {
                if let Some(fdb) = self.tables.get_mut(&bridge) {
                    fdb.remove_port(iface);
                }
            }
            TopologyEvent::InterfaceStateChanged {
                iface,
                state: LinkState::Down,
                ..
            }
            | TopologyEvent::InterfaceRemoved { iface, .. } => {
                // Rows learned through an interface that went away or down are stale
                for fdb in self.tables.values_mut() {
                    if fdb.has_port(iface) {
                        fdb.flush_port(iface);
                    }
                }
            }
            _ => {}
        }
    }
}
