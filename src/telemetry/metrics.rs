//! Packet counters.
//!
//! Every drop increments exactly one counter of the namespace that made
//! the decision. Counters are atomics behind a registry lock that is only
//! taken for writing when a namespace is first seen or removed.

use crate::dataplane::DropReason;
use crate::topology::NamespaceId;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{PoisonError, RwLock};

/// Atomic counter for thread-safe increment operations.
#[derive(Debug, Default)]
pub struct Counter(AtomicU64);

impl Counter {
    pub fn new() -> Self {
        Self(AtomicU64::new(0))
    }

    pub fn inc(&self) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(&self, val: u64) {
        self.0.fetch_add(val, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

/// Per-namespace statistics.
#[derive(Debug, Default)]
pub struct NamespaceStats {
    pub rx_packets: Counter,
    pub rx_bytes: Counter,
    pub tx_packets: Counter,
    pub tx_bytes: Counter,
    /// Datagrams routed through to another interface
    pub forwarded: Counter,
    /// Datagrams handed to the local stack
    pub delivered: Counter,
    /// Resolution queries sent
    pub probes_sent: Counter,
    drops: [Counter; DropReason::ALL.len()],
}

impl NamespaceStats {
    pub fn record_rx(&self, bytes: usize) {
        self.rx_packets.inc();
        self.rx_bytes.add(bytes as u64);
    }

    pub fn record_tx(&self, bytes: usize) {
        self.tx_packets.inc();
        self.tx_bytes.add(bytes as u64);
    }

    pub fn record_drop(&self, reason: DropReason) {
        self.drops[reason as usize].inc();
    }

    pub fn drops(&self, reason: DropReason) -> u64 {
        self.drops[reason as usize].get()
    }

    pub fn snapshot(&self) -> CounterSnapshot {
        CounterSnapshot {
            rx_packets: self.rx_packets.get(),
            rx_bytes: self.rx_bytes.get(),
            tx_packets: self.tx_packets.get(),
            tx_bytes: self.tx_bytes.get(),
            forwarded: self.forwarded.get(),
            delivered: self.delivered.get(),
            probes_sent: self.probes_sent.get(),
            drops: DropReason::ALL
                .iter()
                .map(|r| (r.as_str().to_string(), self.drops(*r)))
                .collect(),
        }
    }
}

/// Immutable copy of one namespace's counters
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CounterSnapshot {
    pub rx_packets: u64,
    pub rx_bytes: u64,
    pub tx_packets: u64,
    pub tx_bytes: u64,
    pub forwarded: u64,
    pub delivered: u64,
    pub probes_sent: u64,
    pub drops: BTreeMap<String, u64>,
}

impl CounterSnapshot {
    pub fn drops(&self, reason: DropReason) -> u64 {
        self.drops.get(reason.as_str()).copied().unwrap_or(0)
    }

    /// Sum of all drop counters
    pub fn total_drops(&self) -> u64 {
        self.drops.values().sum()
    }
}

/// Counters for every namespace.
#[derive(Debug, Default)]
pub struct MetricsRegistry {
    namespaces: RwLock<HashMap<NamespaceId, NamespaceStats>>,
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `f` against the namespace's stats, creating them on first use
    pub fn with<R>(&self, ns: NamespaceId, f: impl FnOnce(&NamespaceStats) -> R) -> R {
        {
            let namespaces = self.namespaces.read().unwrap_or_else(PoisonError::into_inner);
            if let Some(stats) = namespaces.get(&ns) {
                return f(stats);
            }
        }
        let mut namespaces = self
            .namespaces
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        f(namespaces.entry(ns).or_default())
    }

    pub fn record_drop(&self, ns: NamespaceId, reason: DropReason) {
        self.with(ns, |s| s.record_drop(reason));
    }

    pub fn remove_namespace(&self, ns: NamespaceId) {
        self.namespaces
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&ns);
    }

    pub fn snapshot(&self, ns: NamespaceId) -> CounterSnapshot {
        self.namespaces
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&ns)
            .map(NamespaceStats::snapshot)
            .unwrap_or_else(|| NamespaceStats::default().snapshot())
    }

    /// Exports all counters as key-value pairs, ordered by namespace.
    pub fn export(&self) -> Vec<(String, u64)> {
        let namespaces = self.namespaces.read().unwrap_or_else(PoisonError::into_inner);
        let mut ids: Vec<&NamespaceId> = namespaces.keys().collect();
        ids.sort();

        let mut result = Vec::new();
        for ns in ids {
            let snap = namespaces[ns].snapshot();
            result.extend([
                (format!("{}_rx_packets", ns), snap.rx_packets),
                (format!("{}_rx_bytes", ns), snap.rx_bytes),
                (format!("{}_tx_packets", ns), snap.tx_packets),
                (format!("{}_tx_bytes", ns), snap.tx_bytes),
                (format!("{}_forwarded", ns), snap.forwarded),
                (format!("{}_delivered", ns), snap.delivered),
                (format!("{}_probes_sent", ns), snap.probes_sent),
            ]);
            for (reason, value) in snap.drops {
                result.push((format!("{}_drop_{}", ns, reason), value));
            }
        }
        result
    }
}
