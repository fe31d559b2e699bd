//! Packet forwarder
//!
//! The L3 decision for one datagram inside one namespace: local delivery,
//! forwarding gate, route lookup, reverse-path check and TTL, in that order.
//! The datagram is only modified (TTL) once every check has passed.

use crate::dataplane::Fib;
use crate::protocol::Datagram;
use crate::topology::{InterfaceId, RpFilter};
use serde::Serialize;
use std::fmt;
use std::net::Ipv4Addr;
use tracing::trace;

/// Why a packet was dropped without telling anyone
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DropReason {
    ForwardingDisabled,
    NoRoute,
    RpfDrop,
    ZeroTtl,
    ConntrackTableFull,
    /// Ingress or egress interface administratively down
    InterfaceDown,
    /// Unicast frame addressed to another host
    OtherHost,
    /// Egress interface has no link or bridge behind it
    NoCarrier,
    /// Held packet whose next hop never resolved
    Unreachable,
    /// Payload the engine does not model
    Unsupported,
}

impl DropReason {
    pub const ALL: [DropReason; 10] = [
        DropReason::ForwardingDisabled,
        DropReason::NoRoute,
        DropReason::RpfDrop,
        DropReason::ZeroTtl,
        DropReason::ConntrackTableFull,
        DropReason::InterfaceDown,
        DropReason::OtherHost,
        DropReason::NoCarrier,
        DropReason::Unreachable,
        DropReason::Unsupported,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            DropReason::ForwardingDisabled => "forwarding_disabled",
            DropReason::NoRoute => "no_route",
            DropReason::RpfDrop => "rpf_drop",
            DropReason::ZeroTtl => "zero_ttl",
            DropReason::ConntrackTableFull => "conntrack_table_full",
            DropReason::InterfaceDown => "interface_down",
            DropReason::OtherHost => "other_host",
            DropReason::NoCarrier => "no_carrier",
            DropReason::Unreachable => "unreachable",
            DropReason::Unsupported => "unsupported",
        }
    }
}

impl fmt::Display for DropReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of a forwarding decision
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForwardAction {
    /// Destination is one of the namespace's addresses
    Local,
    /// Send out `egress` towards `next_hop`
    Forward {
        egress: InterfaceId,
        next_hop: Ipv4Addr,
    },
    Drop(DropReason),
}

/// Per-namespace knobs the decision depends on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ForwardPolicy {
    pub forwarding: bool,
    pub rp_filter: RpFilter,
}

/// Decide what happens to a datagram received on `ingress`
///
/// TTL is decremented in place only when the result is `Forward`.
pub fn forward(
    fib: &Fib,
    policy: ForwardPolicy,
    ingress: InterfaceId,
    dgram: &mut Datagram,
    usable: impl Fn(InterfaceId) -> bool + Copy,
) -> ForwardAction {
    let dst = dgram.dst;

    if fib.is_local(dst) {
        return ForwardAction::Local;
    }

    if !policy.forwarding {
        trace!("{} -> {}: forwarding disabled", dgram.src, dst);
        return ForwardAction::Drop(DropReason::ForwardingDisabled);
    }

    let Some(hit) = fib.lookup(dst, usable) else {
        trace!("{} -> {}: no route", dgram.src, dst);
        return ForwardAction::Drop(DropReason::NoRoute);
    };

    if !fib.check_rpf(policy.rp_filter, dgram.src, ingress, usable) {
        trace!("{} -> {}: reverse path check failed on {}", dgram.src, dst, ingress);
        return ForwardAction::Drop(DropReason::RpfDrop);
    }

    if !dgram.decrement_ttl() {
        trace!("{} -> {}: ttl exceeded", dgram.src, dst);
        return ForwardAction::Drop(DropReason::ZeroTtl);
    }

    ForwardAction::Forward {
        egress: hit.egress,
        next_hop: hit.next_hop,
    }
}

/// Route a locally generated datagram (no forwarding gate, RPF or TTL step)
pub fn route_output(fib: &Fib, dgram: &Datagram, usable: impl Fn(InterfaceId) -> bool) -> ForwardAction {
    match fib.lookup(dgram.dst, usable) {
        Some(hit) if hit.is_local => ForwardAction::Local,
        Some(hit) => ForwardAction::Forward {
            egress: hit.egress,
            next_hop: hit.next_hop,
        },
        None => ForwardAction::Drop(DropReason::NoRoute),
    }
}
