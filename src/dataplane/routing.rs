//! Routing tables
//!
//! One FIB per namespace. Lookup is longest prefix match; equal prefixes
//! are ordered by lowest metric, then by most recent insertion.

use crate::protocol::Ipv4Cidr;
use crate::topology::{InterfaceId, NamespaceId, RpFilter, TopologyEvent, TopologyObserver};
use crate::{Error, Result};
use serde::Serialize;
use std::collections::HashMap;
use std::net::Ipv4Addr;
use tracing::{debug, trace};

/// Route entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Route {
    /// Destination network (host bits cleared)
    pub prefix: Ipv4Cidr,
    /// Next hop (None for directly connected)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_hop: Option<Ipv4Addr>,
    /// Outgoing interface
    pub interface: InterfaceId,
    /// Route metric
    pub metric: u32,
    /// Route source
    pub source: RouteSource,
}

/// Source of a route
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RouteSource {
    /// Installed with an interface address
    Connected,
    /// Added explicitly
    Static,
}

/// Route as requested by a caller; the egress interface may be left for
/// the table to infer from the gateway.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteSpec {
    pub prefix: Ipv4Cidr,
    pub via: Option<Ipv4Addr>,
    pub dev: Option<InterfaceId>,
    pub metric: u32,
}

impl RouteSpec {
    /// Default route through a gateway
    pub fn default_via(gateway: Ipv4Addr) -> Self {
        Self {
            prefix: Ipv4Cidr::DEFAULT,
            via: Some(gateway),
            dev: None,
            metric: 0,
        }
    }

    pub fn via(prefix: Ipv4Cidr, gateway: Ipv4Addr) -> Self {
        Self {
            prefix,
            via: Some(gateway),
            dev: None,
            metric: 0,
        }
    }

    pub fn dev(prefix: Ipv4Cidr, dev: InterfaceId) -> Self {
        Self {
            prefix,
            via: None,
            dev: Some(dev),
            metric: 0,
        }
    }

    pub fn with_metric(mut self, metric: u32) -> Self {
        self.metric = metric;
        self
    }
}

/// Result of a FIB lookup
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RouteLookup {
    pub egress: InterfaceId,
    /// Gateway, or the destination itself when directly connected
    pub next_hop: Ipv4Addr,
    pub is_local: bool,
}

#[derive(Debug, Clone)]
struct FibEntry {
    route: Route,
    seq: u64,
}

/// Routing table using longest prefix match
#[derive(Debug, Default)]
pub struct RoutingTable {
    entries: Vec<FibEntry>,
    next_seq: u64,
}

impl RoutingTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a route. Returns false if an identical route already exists.
    pub fn add(&mut self, mut route: Route) -> bool {
        route.prefix = route.prefix.network();
        if self.entries.iter().any(|e| e.route == route) {
            return false;
        }
        let seq = self.next_seq;
        self.next_seq += 1;
        self.entries.push(FibEntry { route, seq });
        true
    }

    /// Remove routes for a prefix; `metric` narrows the match when given
    pub fn remove(&mut self, prefix: Ipv4Cidr, metric: Option<u32>) -> usize {
        let prefix = prefix.network();
        self.remove_where(|r| {
            r.prefix == prefix && metric.map_or(true, |m| r.metric == m) && r.source == RouteSource::Static
        })
    }

    pub fn remove_where(&mut self, pred: impl Fn(&Route) -> bool) -> usize {
        let before = self.entries.len();
        self.entries.retain(|e| !pred(&e.route));
        before - self.entries.len()
    }

    /// Longest prefix match over routes whose interface passes `usable`
    pub fn lookup(&self, addr: Ipv4Addr, usable: impl Fn(InterfaceId) -> bool) -> Option<&Route> {
        self.entries
            .iter()
            .filter(|e| e.route.prefix.contains(addr) && usable(e.route.interface))
            .max_by(|a, b| {
                a.route
                    .prefix
                    .prefix_len()
                    .cmp(&b.route.prefix.prefix_len())
                    .then(b.route.metric.cmp(&a.route.metric))
                    .then(a.seq.cmp(&b.seq))
            })
            .map(|e| &e.route)
    }

    /// Routes in lookup preference order
    pub fn routes(&self) -> Vec<Route> {
        let mut entries: Vec<&FibEntry> = self.entries.iter().collect();
        entries.sort_by(|a, b| {
            b.route
                .prefix
                .prefix_len()
                .cmp(&a.route.prefix.prefix_len())
                .then(a.route.prefix.cmp(&b.route.prefix))
                .then(a.route.metric.cmp(&b.route.metric))
                .then(b.seq.cmp(&a.seq))
        });
        entries.into_iter().map(|e| e.route.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Forwarding information base of one namespace
#[derive(Debug, Default)]
pub struct Fib {
    table: RoutingTable,
    /// Local addresses and the interface carrying them
    local: HashMap<Ipv4Addr, InterfaceId>,
}

impl Fib {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn table(&self) -> &RoutingTable {
        &self.table
    }

    pub fn table_mut(&mut self) -> &mut RoutingTable {
        &mut self.table
    }

    pub fn is_local(&self, addr: Ipv4Addr) -> bool {
        self.local.contains_key(&addr)
    }

    /// Resolve where a packet for `dst` leaves (or whether it is ours)
    pub fn lookup(&self, dst: Ipv4Addr, usable: impl Fn(InterfaceId) -> bool) -> Option<RouteLookup> {
        if let Some(&owner) = self.local.get(&dst) {
            return Some(RouteLookup {
                egress: owner,
                next_hop: dst,
                is_local: true,
            });
        }
        self.table.lookup(dst, usable).map(|route| RouteLookup {
            egress: route.interface,
            next_hop: route.next_hop.unwrap_or(dst),
            is_local: false,
        })
    }

    /// Reverse-path validation for a packet from `src` received on `ingress`
    pub fn check_rpf(
        &self,
        mode: RpFilter,
        src: Ipv4Addr,
        ingress: InterfaceId,
        usable: impl Fn(InterfaceId) -> bool,
    ) -> bool {
        match mode {
            RpFilter::Off => true,
            RpFilter::Loose => self.table.lookup(src, usable).is_some(),
            RpFilter::Strict => self
                .table
                .lookup(src, usable)
                .is_some_and(|route| route.interface == ingress),
        }
    }

    /// Connected route on `dev` (any interface when None) covering `gateway`
    fn onlink_interface(&self, gateway: Ipv4Addr, dev: Option<InterfaceId>) -> Option<InterfaceId> {
        self.table
            .entries
            .iter()
            .filter(|e| e.route.source == RouteSource::Connected && e.route.prefix.contains(gateway))
            .filter(|e| dev.map_or(true, |d| d == e.route.interface))
            .max_by_key(|e| e.route.prefix.prefix_len())
            .map(|e| e.route.interface)
    }

    /// Turn a request into a concrete route
    ///
    /// A gateway must be reachable through a connected route (on `dev` if
    /// one is named).
    pub fn resolve(&self, spec: &RouteSpec) -> Result<Route> {
        let interface = match (spec.via, spec.dev) {
            (None, None) => {
                return Err(Error::Configuration(format!(
                    "route {} needs a gateway or a device",
                    spec.prefix
                )))
            }
            (None, Some(dev)) => dev,
            (Some(gw), dev) => self.onlink_interface(gw, dev).ok_or_else(|| {
                Error::Configuration(format!("gateway {} for {} is not on-link", gw, spec.prefix))
            })?,
        };
        Ok(Route {
            prefix: spec.prefix.network(),
            next_hop: spec.via,
            interface,
            metric: spec.metric,
            source: RouteSource::Static,
        })
    }
}

/// FIBs of every namespace
#[derive(Debug, Default)]
pub struct RoutingTables {
    fibs: HashMap<NamespaceId, Fib>,
}

impl RoutingTables {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fib(&self, ns: NamespaceId) -> Option<&Fib> {
        self.fibs.get(&ns)
    }

    pub fn fib_mut(&mut self, ns: NamespaceId) -> &mut Fib {
        self.fibs.entry(ns).or_default()
    }

    pub fn add_route(&mut self, ns: NamespaceId, spec: &RouteSpec) -> Result<Route> {
        let fib = self.fib_mut(ns);
        let route = fib.resolve(spec)?;
        if !fib.table.add(route.clone()) {
            return Err(Error::Configuration(format!(
                "route {} via {:?} dev {} metric {} already exists",
                route.prefix, route.next_hop, route.interface, route.metric
            )));
        }
        debug!("{}: added route {} -> {}", ns, route.prefix, route.interface);
        Ok(route)
    }

    pub fn delete_route(&mut self, ns: NamespaceId, prefix: Ipv4Cidr, metric: Option<u32>) -> Result<()> {
        let removed = self
            .fibs
            .get_mut(&ns)
            .map_or(0, |fib| fib.table.remove(prefix, metric));
        if removed == 0 {
            return Err(Error::Configuration(format!("no route {} in {}", prefix, ns)));
        }
        debug!("{}: removed {} route(s) for {}", ns, removed, prefix);
        Ok(())
    }
}

impl TopologyObserver for RoutingTables {
    fn on_topology_event(&mut self, event: &TopologyEvent) {
        match *event {
            TopologyEvent::AddressAdded { ns, iface, cidr } => {
                let fib = self.fib_mut(ns);
                fib.local.insert(cidr.addr(), iface);
                fib.table.add(Route {
                    prefix: cidr.network(),
                    next_hop: None,
                    interface: iface,
                    metric: 0,
                    source: RouteSource::Connected,
                });
            }
            TopologyEvent::AddressRemoved { ns, iface, cidr } => {
                if let Some(fib) = self.fibs.get_mut(&ns) {
                    fib.local.remove(&cidr.addr());
                    let network = cidr.network();
                    // Another address in the same subnet keeps the connected route alive
                    let still_covered = fib
                        .local
                        .iter()
                        .any(|(addr, owner)| *owner == iface && network.contains(*addr));
                    if !still_covered {
                        fib.table.remove_where(|r| {
                            r.source == RouteSource::Connected && r.interface == iface && r.prefix == network
                        });
                    }
                }
            }
            TopologyEvent::InterfaceRemoved { ns, iface } => {
                if let Some(fib) = self.fibs.get_mut(&ns) {
                    fib.local.retain(|_, owner| *owner != iface);
                    let removed = fib.table.remove_where(|r| r.interface == iface);
                    trace!("{}: purged {} route(s) via {}", ns, removed, iface);
                }
            }
            TopologyEvent::NamespaceRemoved { ns } => {
                self.fibs.remove(&ns);
            }
            _ => {}
        }
    }
}
