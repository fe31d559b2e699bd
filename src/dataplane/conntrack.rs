//! Connection tracking for masqueraded flows
//!
//! Each entry records the original 5-tuple and the reply tuple expected
//! after translation. Both are unique within a namespace.

use crate::protocol::{Datagram, IpProtocol, TcpFlags};
use crate::topology::{InterfaceId, LinkState, NamespaceId, TopologyEvent, TopologyObserver};
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::net::Ipv4Addr;
use std::time::Duration;
use tracing::{debug, trace};

pub const DEFAULT_CONNTRACK_MAX: usize = 65536;

/// TCP connection state for timeout selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TcpConnState {
    /// SYN sent, waiting for SYN-ACK
    SynSent,
    /// Connection established
    Established,
    /// FIN seen, closing
    FinWait,
    /// Both FINs seen
    TimeWait,
    /// RST seen
    Closed,
}

impl TcpConnState {
    fn transition(self, flags: TcpFlags) -> Self {
        if flags.is_rst() {
            return TcpConnState::Closed;
        }

        match self {
            TcpConnState::SynSent if flags.is_syn_ack() => TcpConnState::Established,
            TcpConnState::Established if flags.is_fin() => TcpConnState::FinWait,
            TcpConnState::FinWait if flags.is_fin() => TcpConnState::TimeWait,
            current => current,
        }
    }
}

/// 5-tuple; ICMP echo uses the identifier as both ports
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FlowTuple {
    pub protocol: IpProtocol,
    pub src: Ipv4Addr,
    pub src_port: u16,
    pub dst: Ipv4Addr,
    pub dst_port: u16,
}

impl FlowTuple {
    pub fn of(dgram: &Datagram) -> Self {
        Self {
            protocol: dgram.protocol(),
            src: dgram.src,
            src_port: dgram.transport.src_port(),
            dst: dgram.dst,
            dst_port: dgram.transport.dst_port(),
        }
    }

    /// Same flow seen from the other end
    pub fn reverse(&self) -> Self {
        Self {
            protocol: self.protocol,
            src: self.dst,
            src_port: self.dst_port,
            dst: self.src,
            dst_port: self.src_port,
        }
    }
}

impl fmt::Display for FlowTuple {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {}:{} -> {}:{}",
            self.protocol.as_str(),
            self.src,
            self.src_port,
            self.dst,
            self.dst_port
        )
    }
}

/// Idle timeouts per protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConntrackTimeouts {
    /// TCP established connection (default: 2 hours)
    pub tcp_established: Duration,
    /// TCP transitory states (default: 4 minutes)
    pub tcp_transitory: Duration,
    /// UDP (default: 2 minutes)
    pub udp: Duration,
    /// ICMP (default: 1 minute)
    pub icmp: Duration,
}

impl Default for ConntrackTimeouts {
    fn default() -> Self {
        Self {
            tcp_established: Duration::from_secs(7200),
            tcp_transitory: Duration::from_secs(240),
            udp: Duration::from_secs(120),
            icmp: Duration::from_secs(60),
        }
    }
}

/// Tracked flow
#[derive(Debug, Clone)]
pub struct ConnEntry {
    pub ns: NamespaceId,
    /// Masquerading interface the flow leaves through
    pub iface: InterfaceId,
    pub original: FlowTuple,
    /// Tuple replies carry (destination is the public address and port)
    pub reply: FlowTuple,
    pub tcp_state: Option<TcpConnState>,
    /// Set once traffic was seen in the reply direction
    pub replied: bool,
    pub last_seen: Duration,
}

impl ConnEntry {
    fn timeout(&self, timeouts: &ConntrackTimeouts) -> Duration {
        match self.original.protocol {
            IpProtocol::Tcp => match self.tcp_state {
                Some(TcpConnState::Established) => timeouts.tcp_established,
                Some(TcpConnState::Closed) => Duration::ZERO,
                _ => timeouts.tcp_transitory,
            },
            IpProtocol::Udp => timeouts.udp,
            IpProtocol::Icmp => timeouts.icmp,
        }
    }

    fn expired(&self, now: Duration, timeouts: &ConntrackTimeouts) -> bool {
        now.saturating_sub(self.last_seen) >= self.timeout(timeouts)
    }

    fn touch(&mut self, now: Duration, flags: Option<TcpFlags>) {
        self.last_seen = now;
        if let (Some(state), Some(flags)) = (self.tcp_state.as_mut(), flags) {
            *state = state.transition(flags);
        }
    }
}

/// Read-only copy of a tracked flow
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConntrackRow {
    pub ns: NamespaceId,
    pub iface: InterfaceId,
    pub original: String,
    pub reply: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tcp_state: Option<TcpConnState>,
    pub replied: bool,
    #[serde(rename = "expires_ms", serialize_with = "super::clock::as_millis")]
    pub expires: Duration,
}

type FlowKey = (NamespaceId, FlowTuple);

/// Connection tracking table shared by all namespaces
#[derive(Debug)]
pub struct ConntrackTable {
    /// Original direction -> entry
    entries: HashMap<FlowKey, ConnEntry>,
    /// Reply direction -> original direction
    reply_map: HashMap<FlowKey, FlowTuple>,
    timeouts: ConntrackTimeouts,
    max: usize,
}

impl Default for ConntrackTable {
    fn default() -> Self {
        Self::new(DEFAULT_CONNTRACK_MAX, ConntrackTimeouts::default())
    }
}

impl ConntrackTable {
    pub fn new(max: usize, timeouts: ConntrackTimeouts) -> Self {
        Self {
            entries: HashMap::new(),
            reply_map: HashMap::new(),
            timeouts,
            max,
        }
    }

    pub fn timeouts(&self) -> &ConntrackTimeouts {
        &self.timeouts
    }

    pub fn max(&self) -> usize {
        self.max
    }

    pub fn is_full(&self) -> bool {
        self.entries.len() >= self.max
    }

    /// Whether a reply tuple is already claimed by another flow
    pub fn reply_in_use(&self, ns: NamespaceId, reply: &FlowTuple, now: Duration) -> bool {
        self.reply_map
            .get(&(ns, *reply))
            .and_then(|orig| self.entries.get(&(ns, *orig)))
            .is_some_and(|e| !e.expired(now, &self.timeouts))
    }

    /// Record a new flow. The caller has checked capacity and reply uniqueness.
    pub fn insert(&mut self, entry: ConnEntry) {
        debug!(
            "{}: new flow {} (reply {}) via {}",
            entry.ns, entry.original, entry.reply, entry.iface
        );
        // A stale flow may still hold either tuple
        self.remove_entry(entry.ns, &entry.original);
        if let Some(orig) = self.reply_map.get(&(entry.ns, entry.reply)).copied() {
            self.remove_entry(entry.ns, &orig);
        }
        self.reply_map
            .insert((entry.ns, entry.reply), entry.original);
        self.entries.insert((entry.ns, entry.original), entry);
    }

    /// Look up by original tuple, refreshing the entry. Expired entries are
    /// removed and reported as a miss.
    pub fn touch_original(
        &mut self,
        ns: NamespaceId,
        tuple: &FlowTuple,
        flags: Option<TcpFlags>,
        now: Duration,
    ) -> Option<&ConnEntry> {
        self.expire_one(ns, tuple, now);
        let entry = self.entries.get_mut(&(ns, *tuple))?;
        entry.touch(now, flags);
        Some(&*entry)
    }

    /// Look up by reply tuple without refreshing anything. Expired entries
    /// are a miss.
    pub fn lookup_reply(&self, ns: NamespaceId, reply: &FlowTuple, now: Duration) -> Option<&ConnEntry> {
        let original = self.reply_map.get(&(ns, *reply))?;
        self.entries
            .get(&(ns, *original))
            .filter(|e| !e.expired(now, &self.timeouts))
    }

    /// Look up by reply tuple, refreshing the entry
    pub fn touch_reply(
        &mut self,
        ns: NamespaceId,
        reply: &FlowTuple,
        flags: Option<TcpFlags>,
        now: Duration,
    ) -> Option<&ConnEntry> {
        let original = *self.reply_map.get(&(ns, *reply))?;
        self.expire_one(ns, &original, now);
        let entry = self.entries.get_mut(&(ns, original))?;
        entry.touch(now, flags);
        entry.replied = true;
        Some(&*entry)
    }

    fn expire_one(&mut self, ns: NamespaceId, original: &FlowTuple, now: Duration) {
        let expired = self
            .entries
            .get(&(ns, *original))
            .is_some_and(|e| e.expired(now, &self.timeouts));
        if expired {
            trace!("{}: flow {} expired", ns, original);
            self.remove_entry(ns, original);
        }
    }

    fn remove_entry(&mut self, ns: NamespaceId, original: &FlowTuple) -> Option<ConnEntry> {
        let entry = self.entries.remove(&(ns, *original))?;
        self.reply_map.remove(&(ns, entry.reply));
        Some(entry)
    }

    /// Tear down a flow given either of its tuples
    pub fn remove_flow(&mut self, ns: NamespaceId, tuple: &FlowTuple) -> bool {
        let original = if self.entries.contains_key(&(ns, *tuple)) {
            *tuple
        } else if let Some(orig) = self.reply_map.get(&(ns, *tuple)) {
            *orig
        } else {
            return false;
        };
        self.remove_entry(ns, &original).is_some()
    }

    /// Remove expired entries
    pub fn expire(&mut self, now: Duration) -> usize {
        let expired: Vec<FlowKey> = self
            .entries
            .iter()
            .filter(|(_, e)| e.expired(now, &self.timeouts))
            .map(|(k, _)| *k)
            .collect();
        for (ns, original) in &expired {
            self.remove_entry(*ns, original);
        }
        if !expired.is_empty() {
            debug!("conntrack: expired {} flow(s)", expired.len());
        }
        expired.len()
    }

    fn purge(&mut self, pred: impl Fn(&ConnEntry) -> bool) -> usize {
        let doomed: Vec<FlowKey> = self
            .entries
            .iter()
            .filter(|(_, e)| pred(e))
            .map(|(k, _)| *k)
            .collect();
        for (ns, original) in &doomed {
            self.remove_entry(*ns, original);
        }
        doomed.len()
    }

    /// Drop every flow masqueraded through `iface`
    pub fn purge_interface(&mut self, iface: InterfaceId) -> usize {
        self.purge(|e| e.iface == iface)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Live flows ordered by namespace then original tuple
    pub fn rows(&self) -> Vec<ConntrackRow> {
        let mut entries: Vec<&ConnEntry> = self.entries.values().collect();
        entries.sort_by_key(|e| (e.ns, e.original));
        entries
            .into_iter()
            .map(|e| ConntrackRow {
                ns: e.ns,
                iface: e.iface,
                original: e.original.to_string(),
                reply: e.reply.to_string(),
                tcp_state: e.tcp_state,
                replied: e.replied,
                expires: e.last_seen + e.timeout(&self.timeouts),
            })
            .collect()
    }
}

impl TopologyObserver for ConntrackTable {
    fn on_topology_event(&mut self, event: &TopologyEvent) {
        let removed = match *event {
            TopologyEvent::NamespaceRemoved { ns } => self.purge(|e| e.ns == ns),
            TopologyEvent::InterfaceRemoved { iface, .. }
            | TopologyEvent::InterfaceStateChanged {
                iface,
                state: LinkState::Down,
                ..
            } => self.purge_interface(iface),
            TopologyEvent::AddressRemoved { iface, cidr, .. } => {
                self.purge(|e| e.iface == iface && e.reply.dst == cidr.addr())
            }
            _ => 0,
        };
        if removed > 0 {
            debug!("conntrack: purged {} flow(s) after {:?}", removed, event);
        }
    }
}
