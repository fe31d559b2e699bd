//! Neighbor cache (IPv4 to MAC mapping)
//!
//! Rows are scoped to (namespace, interface, ip). Resolution requests for
//! the same row share one probe sequence; each request is a waiter that is
//! released when a reply arrives or failed once probing is exhausted.

use crate::protocol::{MacAddr, Packet};
use crate::topology::{InterfaceId, LinkState, NamespaceId, TopologyEvent, TopologyObserver};
use crate::Result;
use serde::Serialize;
use std::collections::BTreeMap;
use std::net::Ipv4Addr;
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{debug, trace, warn};

pub const DEFAULT_REACHABLE_TIME: Duration = Duration::from_secs(30);
pub const DEFAULT_RETRANS_TIME: Duration = Duration::from_secs(1);
pub const DEFAULT_MAX_PROBES: u32 = 3;
pub const DEFAULT_STALE_GC_TIME: Duration = Duration::from_secs(60);
pub const DEFAULT_FAILED_GC_TIME: Duration = Duration::from_secs(20);

/// Neighbor entry state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum NeighborState {
    /// Broadcast probing in progress
    Incomplete,
    /// Recently confirmed
    Reachable,
    /// Confirmation expired; must be re-probed before use
    Stale,
    /// Probing exhausted
    Unreachable,
}

/// Resolver timers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NeighborConfig {
    pub reachable_time: Duration,
    pub retrans_time: Duration,
    pub max_probes: u32,
    /// How long an unused STALE row is kept
    pub stale_gc_time: Duration,
    /// How long an UNREACHABLE row is kept
    pub failed_gc_time: Duration,
}

impl Default for NeighborConfig {
    fn default() -> Self {
        Self {
            reachable_time: DEFAULT_REACHABLE_TIME,
            retrans_time: DEFAULT_RETRANS_TIME,
            max_probes: DEFAULT_MAX_PROBES,
            stale_gc_time: DEFAULT_STALE_GC_TIME,
            failed_gc_time: DEFAULT_FAILED_GC_TIME,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NeighborKey {
    pub ns: NamespaceId,
    pub iface: InterfaceId,
    pub ip: Ipv4Addr,
}

impl NeighborKey {
    pub fn new(ns: NamespaceId, iface: InterfaceId, ip: Ipv4Addr) -> Self {
        Self { ns, iface, ip }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WaiterId(u64);

/// Something suspended on a resolution
#[derive(Debug)]
pub enum Waiter {
    /// Packet held until its next hop resolves
    Packet(Packet),
    /// Logical caller awaiting the result
    Task(oneshot::Sender<Result<MacAddr>>),
}

/// Resolution query to put on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Probe {
    pub key: NeighborKey,
    /// Cached MAC for a unicast re-probe, None for broadcast
    pub unicast: Option<MacAddr>,
}

/// Outcome of a resolution request
#[derive(Debug)]
pub enum Resolve {
    /// Address known; the waiter is handed back untouched
    Ready(MacAddr, Waiter),
    /// Waiter parked; `probe` is set when this request started a probe
    Pending { id: WaiterId, probe: Option<Probe> },
}

/// Work produced by a timer pass
#[derive(Debug, Default)]
pub struct TickOutput {
    pub probes: Vec<Probe>,
    pub failed: Vec<(NeighborKey, Waiter)>,
}

#[derive(Debug)]
struct NeighborEntry {
    mac: Option<MacAddr>,
    state: NeighborState,
    /// Last positive confirmation
    confirmed: Duration,
    /// Last state change
    changed: Duration,
    probes_sent: u32,
    /// Next retransmission (or failure) deadline while probing
    deadline: Option<Duration>,
    waiters: Vec<(WaiterId, Waiter)>,
}

impl NeighborEntry {
    fn probing(&self) -> bool {
        self.deadline.is_some()
    }
}

/// Read-only copy of a cache row
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NeighborRow {
    pub iface: InterfaceId,
    pub ip: Ipv4Addr,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mac: Option<MacAddr>,
    pub state: NeighborState,
    #[serde(rename = "updated_ms", serialize_with = "super::clock::as_millis")]
    pub updated: Duration,
}

/// Neighbor cache for every namespace
#[derive(Debug, Default)]
pub struct NeighborCache {
    entries: BTreeMap<NeighborKey, NeighborEntry>,
    config: NeighborConfig,
    next_waiter: u64,
    /// Waiters orphaned by topology changes, collected by the engine
    orphaned: Vec<(NeighborKey, Waiter)>,
}

impl NeighborCache {
    pub fn new(config: NeighborConfig) -> Self {
        Self {
            config,
            ..Default::default()
        }
    }

    pub fn config(&self) -> &NeighborConfig {
        &self.config
    }

    /// Cached MAC if the row is REACHABLE and still fresh
    pub fn lookup(&self, key: &NeighborKey, now: Duration) -> Option<MacAddr> {
        let entry = self.entries.get(key)?;
        if entry.state == NeighborState::Reachable && !self.expired(entry, now) {
            entry.mac
        } else {
            None
        }
    }

    pub fn state(&self, key: &NeighborKey) -> Option<NeighborState> {
        self.entries.get(key).map(|e| e.state)
    }

    fn expired(&self, entry: &NeighborEntry, now: Duration) -> bool {
        now.saturating_sub(entry.confirmed) >= self.config.reachable_time
    }

    fn alloc_waiter(&mut self) -> WaiterId {
        self.next_waiter += 1;
        WaiterId(self.next_waiter)
    }

    /// Request resolution of `key` on behalf of `waiter`
    pub fn resolve(&mut self, key: NeighborKey, waiter: Waiter, now: Duration) -> Resolve {
        if let Some(mac) = self.lookup(&key, now) {
            return Resolve::Ready(mac, waiter);
        }

        let id = self.alloc_waiter();
        let retrans = self.config.retrans_time;
        let entry = self.entries.entry(key).or_insert_with(|| NeighborEntry {
            mac: None,
            state: NeighborState::Incomplete,
            confirmed: now,
            changed: now,
            probes_sent: 0,
            deadline: None,
            waiters: Vec::new(),
        });
        entry.waiters.push((id, waiter));

        if entry.probing() {
            trace!("{} {}: coalesced waiter ({} waiting)", key.iface, key.ip, entry.waiters.len());
            return Resolve::Pending { id, probe: None };
        }

        let unicast = match (entry.state, entry.mac) {
            // Stale or aged reachable row: confirm the cached MAC first
            (NeighborState::Reachable | NeighborState::Stale, Some(mac)) => {
                entry.state = NeighborState::Stale;
                Some(mac)
            }
            _ => {
                entry.state = NeighborState::Incomplete;
                None
            }
        };
        entry.changed = now;
        entry.probes_sent = 1;
        entry.deadline = Some(now + retrans);
        debug!(
            "{} {}: probing ({})",
            key.iface,
            key.ip,
            if unicast.is_some() { "unicast" } else { "broadcast" }
        );
        Resolve::Pending {
            id,
            probe: Some(Probe { key, unicast }),
        }
    }

    /// Drop one waiter. The probe keeps running for everyone else.
    pub fn cancel(&mut self, key: &NeighborKey, id: WaiterId) -> Option<Waiter> {
        let entry = self.entries.get_mut(key)?;
        let pos = entry.waiters.iter().position(|(w, _)| *w == id)?;
        let (_, waiter) = entry.waiters.remove(pos);
        trace!("{} {}: waiter cancelled", key.iface, key.ip);
        Some(waiter)
    }

    /// Handle a reply: the row becomes REACHABLE and its waiters are released
    ///
    /// Replies for rows nobody asked about are ignored.
    pub fn confirm(&mut self, key: &NeighborKey, mac: MacAddr, now: Duration) -> Vec<Waiter> {
        let Some(entry) = self.entries.get_mut(key) else {
            trace!("{} {}: unsolicited reply ignored", key.iface, key.ip);
            return Vec::new();
        };
        entry.mac = Some(mac);
        entry.state = NeighborState::Reachable;
        entry.confirmed = now;
        entry.changed = now;
        entry.probes_sent = 0;
        entry.deadline = None;
        debug!("{} {} is at {}", key.iface, key.ip, mac);
        entry.waiters.drain(..).map(|(_, w)| w).collect()
    }

    /// Record a MAC heard from the neighbor's own query
    ///
    /// Creates or updates a STALE row. Waiters of an in-flight probe are
    /// released since the address just arrived from its owner.
    pub fn record_stale(&mut self, key: NeighborKey, mac: MacAddr, now: Duration) -> Vec<Waiter> {
        let entry = self.entries.entry(key).or_insert_with(|| NeighborEntry {
            mac: None,
            state: NeighborState::Stale,
            confirmed: now,
            changed: now,
            probes_sent: 0,
            deadline: None,
            waiters: Vec::new(),
        });
        if entry.state == NeighborState::Reachable && entry.mac == Some(mac) {
            return Vec::new();
        }
        entry.mac = Some(mac);
        entry.state = NeighborState::Stale;
        entry.changed = now;
        entry.probes_sent = 0;
        entry.deadline = None;
        entry.waiters.drain(..).map(|(_, w)| w).collect()
    }

    /// Earliest pending probe deadline
    pub fn next_deadline(&self) -> Option<Duration> {
        self.entries.values().filter_map(|e| e.deadline).min()
    }

    /// Run timers up to `now`
    pub fn tick(&mut self, now: Duration) -> TickOutput {
        let config = self.config;
        let mut out = TickOutput::default();
        let mut remove = Vec::new();

        for (key, entry) in self.entries.iter_mut() {
            match entry.deadline {
                Some(deadline) if now >= deadline => {
                    if entry.state == NeighborState::Stale {
                        // Unicast re-probe unanswered: start over with broadcasts
                        entry.state = NeighborState::Incomplete;
                        entry.changed = now;
                        entry.probes_sent = 1;
                        entry.deadline = Some(now + config.retrans_time);
                        out.probes.push(Probe {
                            key: *key,
                            unicast: None,
                        });
                    } else if entry.probes_sent < config.max_probes {
                        entry.probes_sent += 1;
                        entry.deadline = Some(now + config.retrans_time);
                        out.probes.push(Probe {
                            key: *key,
                            unicast: None,
                        });
                    } else {
                        warn!("{} {}: resolution failed", key.iface, key.ip);
                        entry.state = NeighborState::Unreachable;
                        entry.mac = None;
                        entry.changed = now;
                        entry.deadline = None;
                        out.failed
                            .extend(entry.waiters.drain(..).map(|(_, w)| (*key, w)));
                    }
                }
                Some(_) => {}
                None => match entry.state {
                    NeighborState::Reachable
                        if now.saturating_sub(entry.confirmed) >= config.reachable_time =>
                    {
                        entry.state = NeighborState::Stale;
                        entry.changed = now;
                    }
                    NeighborState::Stale
                        if now.saturating_sub(entry.changed) >= config.stale_gc_time =>
                    {
                        remove.push(*key);
                    }
                    NeighborState::Unreachable
                        if now.saturating_sub(entry.changed) >= config.failed_gc_time =>
                    {
                        remove.push(*key);
                    }
                    _ => {}
                },
            }
        }

        for key in remove {
            trace!("{} {}: garbage collected", key.iface, key.ip);
            self.entries.remove(&key);
        }
        out
    }

    /// Waiters orphaned by purges since the last call
    pub fn take_orphaned(&mut self) -> Vec<(NeighborKey, Waiter)> {
        std::mem::take(&mut self.orphaned)
    }

    fn purge(&mut self, pred: impl Fn(&NeighborKey) -> bool) {
        let keys: Vec<NeighborKey> = self.entries.keys().filter(|k| pred(*k)).copied().collect();
        for key in keys {
            if let Some(mut entry) = self.entries.remove(&key) {
                self.orphaned
                    .extend(entry.waiters.drain(..).map(|(_, w)| (key, w)));
            }
        }
    }

    /// Rows of one namespace ordered by interface then address
    pub fn rows(&self, ns: NamespaceId) -> Vec<NeighborRow> {
        self.entries
            .iter()
            .filter(|(k, _)| k.ns == ns)
            .map(|(k, e)| NeighborRow {
                iface: k.iface,
                ip: k.ip,
                mac: e.mac,
                state: e.state,
                updated: e.changed,
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl TopologyObserver for NeighborCache {
    fn on_topology_event(&mut self, event: &TopologyEvent) {
        match *event {
            TopologyEvent::NamespaceRemoved { ns } => self.purge(|k| k.ns == ns),
            TopologyEvent::InterfaceRemoved { ns, iface }
            | TopologyEvent::InterfaceStateChanged {
                ns,
                iface,
                state: LinkState::Down,
            } => self.purge(|k| k.ns == ns && k.iface == iface),
            TopologyEvent::AddressRemoved { ns, iface, cidr } => {
                // Rows that were only on-link through the removed prefix
                let network = cidr.network();
                self.purge(|k| k.ns == ns && k.iface == iface && network.contains(k.ip));
            }
            _ => {}
        }
    }
}
