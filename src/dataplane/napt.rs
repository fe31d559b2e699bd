//! NAPT (masquerade)
//!
//! Outbound traffic leaving a masquerading interface gets its source
//! rewritten to the interface address. Replies arriving on that interface
//! are matched against the conntrack reply tuple and rewritten back.

use super::conntrack::{ConnEntry, ConntrackTable, FlowTuple, TcpConnState};
use crate::protocol::{Datagram, IcmpKind, IpProtocol, TcpFlags, Transport};
use crate::topology::{InterfaceId, NamespaceId};
use std::net::Ipv4Addr;
use std::ops::RangeInclusive;
use std::time::Duration;
use tracing::{debug, trace, warn};

pub const DEFAULT_PORT_RANGE: RangeInclusive<u16> = 1024..=65535;

/// Result of outbound translation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnatResult {
    /// Source rewritten (new flow or existing mapping)
    Translated { port: u16 },
    /// Source already is the public address; nothing to do
    Untouched,
    /// No entry could be created
    TableFull,
}

/// Reply-direction hit from [`Masquerade::dnat`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReplyMatch {
    pub reply: FlowTuple,
    pub flags: Option<TcpFlags>,
}

/// Masquerade engine: conntrack table plus port allocation state
#[derive(Debug)]
pub struct Masquerade {
    table: ConntrackTable,
    port_range: RangeInclusive<u16>,
    /// Next port to try when the original one is taken
    next_port: u16,
}

impl Masquerade {
    pub fn new(table: ConntrackTable, port_range: RangeInclusive<u16>) -> Self {
        let (lo, hi) = (*port_range.start(), *port_range.end());
        let port_range = lo.min(hi)..=lo.max(hi);
        let next_port = *port_range.start();
        Self {
            table,
            port_range,
            next_port,
        }
    }

    pub fn table(&self) -> &ConntrackTable {
        &self.table
    }

    pub fn table_mut(&mut self) -> &mut ConntrackTable {
        &mut self.table
    }

    /// Translate a datagram leaving `iface` (address `public`) in `ns`
    pub fn snat(
        &mut self,
        ns: NamespaceId,
        iface: InterfaceId,
        public: Ipv4Addr,
        dgram: &mut Datagram,
        now: Duration,
    ) -> SnatResult {
        let original = FlowTuple::of(dgram);
        let flags = dgram.transport.tcp_flags();

        if let Some(entry) = self.table.touch_original(ns, &original, flags, now) {
            let (addr, port) = (entry.reply.dst, entry.reply.dst_port);
            rewrite_source(dgram, addr, port);
            trace!("{}: {} -> existing mapping {}:{}", ns, original, addr, port);
            return SnatResult::Translated { port };
        }

        if dgram.src == public {
            return SnatResult::Untouched;
        }

        if self.table.is_full() && self.table.expire(now) == 0 {
            warn!("{}: conntrack table full, dropping {}", ns, original);
            return SnatResult::TableFull;
        }

        let Some(port) = self.allocate_port(ns, &original, public, now) else {
            warn!("{}: no free port on {} for {}", ns, public, original);
            return SnatResult::TableFull;
        };

        let reply = FlowTuple {
            src: public,
            src_port: port,
            ..original
        }
        .reverse();
        let reply = if original.protocol == IpProtocol::Icmp {
            // The identifier stands for both ports
            FlowTuple {
                src_port: port,
                ..reply
            }
        } else {
            reply
        };

        let tcp_state = flags.map(|f| {
            if f.is_rst() {
                TcpConnState::Closed
            } else {
                TcpConnState::SynSent
            }
        });
        let entry = ConnEntry {
            ns,
            iface,
            original,
            reply,
            tcp_state,
            replied: false,
            last_seen: now,
        };
        self.table.insert(entry);
        rewrite_source(dgram, public, port);
        SnatResult::Translated { port }
    }

    /// Undo translation for a datagram arriving on masquerading `iface`
    ///
    /// Only the datagram is rewritten; the flow itself is left alone until
    /// the caller knows the datagram goes somewhere and calls
    /// [`Masquerade::confirm_reply`]. Returns `None` (datagram untouched)
    /// when no flow matches. ICMP only matches echo replies.
    pub fn dnat(
        &self,
        ns: NamespaceId,
        iface: InterfaceId,
        dgram: &mut Datagram,
        now: Duration,
    ) -> Option<ReplyMatch> {
        if let Transport::Icmp { kind, .. } = dgram.transport {
            if kind != IcmpKind::EchoReply {
                return None;
            }
        }

        let reply = FlowTuple::of(dgram);
        let entry = self.table.lookup_reply(ns, &reply, now)?;
        if entry.iface != iface {
            return None;
        }
        let (addr, port) = (entry.original.src, entry.original.src_port);
        let flags = dgram.transport.tcp_flags();
        dgram.dst = addr;
        dgram.transport.set_dst_port(port);
        trace!("{}: {} de-translated to {}:{}", ns, reply, addr, port);
        Some(ReplyMatch { reply, flags })
    }

    /// Refresh the flow behind a de-translated reply that was accepted
    pub fn confirm_reply(&mut self, ns: NamespaceId, matched: &ReplyMatch, now: Duration) {
        self.table.touch_reply(ns, &matched.reply, matched.flags, now);
    }

    /// Keep the original source port when its reply tuple is free, else scan
    /// the range from a rotating cursor.
    fn allocate_port(
        &mut self,
        ns: NamespaceId,
        original: &FlowTuple,
        public: Ipv4Addr,
        now: Duration,
    ) -> Option<u16> {
        let candidate = |port: u16| {
            let mut reply = FlowTuple {
                protocol: original.protocol,
                src: original.dst,
                src_port: original.dst_port,
                dst: public,
                dst_port: port,
            };
            if original.protocol == IpProtocol::Icmp {
                reply.src_port = port;
            }
            reply
        };

        if !self.table.reply_in_use(ns, &candidate(original.src_port), now) {
            return Some(original.src_port);
        }

        let (min, max) = (*self.port_range.start(), *self.port_range.end());
        let range_size = u32::from(max - min) + 1;
        for _ in 0..range_size {
            let port = self.next_port;
            self.next_port = if self.next_port >= max {
                min
            } else {
                self.next_port + 1
            };

            if !self.table.reply_in_use(ns, &candidate(port), now) {
                debug!("{}: {} remapped to port {}", ns, original, port);
                return Some(port);
            }
        }

        None // Port exhaustion
    }
}

impl Default for Masquerade {
    fn default() -> Self {
        Self::new(ConntrackTable::default(), DEFAULT_PORT_RANGE)
    }
}

fn rewrite_source(dgram: &mut Datagram, addr: Ipv4Addr, port: u16) {
    dgram.src = addr;
    dgram.transport.set_src_port(port);
}
