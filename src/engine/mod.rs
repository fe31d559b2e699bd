//! Emulation engine
//!
//! Owns the topology and every dependent table, each behind its own lock.
//! No lock is held while another is taken: a step reads what it needs from
//! one table, releases it, then moves on to the next. Topology mutations
//! queue events that are fanned out to the tables after the topology lock
//! is released, so the tables purge their own rows.

mod pipeline;
mod resolve;
mod scenario;
mod snapshot;

pub use pipeline::InjectReport;
pub use resolve::Resolution;
pub use scenario::Names;
pub use snapshot::{BridgeSnapshot, InterfaceSnapshot, LinkSnapshot, NamespaceSnapshot, Snapshot};

use crate::dataplane::{
    BridgeTables, ConntrackTable, ConntrackTimeouts, DropReason, FlowTuple, LogicalClock, Masquerade,
    NeighborCache, NeighborConfig, NeighborKey, Route, RouteLookup, RouteSpec, RoutingTables, Waiter,
    DEFAULT_AGEING_TIME, DEFAULT_CONNTRACK_MAX, DEFAULT_FDB_CAPACITY, DEFAULT_PORT_RANGE,
};
use crate::protocol::{Ipv4Cidr, MacAddr, Packet};
use crate::telemetry::MetricsRegistry;
use crate::topology::{
    BridgeId, InterfaceId, LinkId, LinkState, NamespaceId, RpFilter, Topology, TopologyEvent,
    TopologyObserver,
};
use crate::{Error, Result};
use std::collections::{HashMap, HashSet};
use std::net::Ipv4Addr;
use std::ops::RangeInclusive;
use std::sync::{
    Arc, Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard,
};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Engine tunables
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    pub fdb_ageing_time: Duration,
    pub fdb_capacity: usize,
    pub neighbor: NeighborConfig,
    pub conntrack_max: usize,
    pub nat_ports: RangeInclusive<u16>,
    pub conntrack_timeouts: ConntrackTimeouts,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            fdb_ageing_time: DEFAULT_AGEING_TIME,
            fdb_capacity: DEFAULT_FDB_CAPACITY,
            neighbor: NeighborConfig::default(),
            conntrack_max: DEFAULT_CONNTRACK_MAX,
            nat_ports: DEFAULT_PORT_RANGE,
            conntrack_timeouts: ConntrackTimeouts::default(),
        }
    }
}

/// A whole emulated network
#[derive(Debug)]
pub struct Engine {
    config: EngineConfig,
    clock: LogicalClock,
    topology: RwLock<Topology>,
    bridges: Mutex<BridgeTables>,
    routing: RwLock<RoutingTables>,
    /// Shared with pending [`Resolution`]s so a dropped one can cancel itself
    neighbors: Arc<Mutex<NeighborCache>>,
    nat: Mutex<Masquerade>,
    metrics: MetricsRegistry,
    delivered: Mutex<HashMap<NamespaceId, Vec<Packet>>>,
}

impl Default for Engine {
    fn default() -> Self {
        Self::new(EngineConfig::default())
    }
}

impl Engine {
    pub fn new(mut config: EngineConfig) -> Self {
        // A zero retransmit interval would never let the clock move past a probe
        config.neighbor.retrans_time = config.neighbor.retrans_time.max(Duration::from_millis(1));
        if config.nat_ports.start() > config.nat_ports.end() {
            warn!("Reversed nat port range {:?}, swapping bounds", config.nat_ports);
            config.nat_ports = *config.nat_ports.end()..=*config.nat_ports.start();
        }

        let conntrack = ConntrackTable::new(config.conntrack_max, config.conntrack_timeouts);
        info!(
            "Engine created (fdb capacity {}, conntrack max {}, nat ports {:?})",
            config.fdb_capacity, config.conntrack_max, config.nat_ports
        );
        Self {
            clock: LogicalClock::new(),
            topology: RwLock::new(Topology::new()),
            bridges: Mutex::new(BridgeTables::new(config.fdb_ageing_time, config.fdb_capacity)),
            routing: RwLock::new(RoutingTables::new()),
            neighbors: Arc::new(Mutex::new(NeighborCache::new(config.neighbor))),
            nat: Mutex::new(Masquerade::new(conntrack, config.nat_ports.clone())),
            metrics: MetricsRegistry::new(),
            delivered: Mutex::new(HashMap::new()),
            config,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Current logical time
    pub fn now(&self) -> Duration {
        self.clock.now()
    }

    pub fn metrics(&self) -> &MetricsRegistry {
        &self.metrics
    }

    // ========================================
    // Lock helpers
    // ========================================

    fn topo(&self) -> RwLockReadGuard<'_, Topology> {
        self.topology.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn topo_mut(&self) -> RwLockWriteGuard<'_, Topology> {
        self.topology.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn bridge_tables(&self) -> MutexGuard<'_, BridgeTables> {
        self.bridges.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn routing(&self) -> RwLockReadGuard<'_, RoutingTables> {
        self.routing.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn routing_mut(&self) -> RwLockWriteGuard<'_, RoutingTables> {
        self.routing.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn neighbors(&self) -> MutexGuard<'_, NeighborCache> {
        self.neighbors.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn nat(&self) -> MutexGuard<'_, Masquerade> {
        self.nat.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn inbox(&self) -> MutexGuard<'_, HashMap<NamespaceId, Vec<Packet>>> {
        self.delivered.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // ========================================
    // Topology
    // ========================================

    /// Apply a topology mutation, then let every table react to its events
    fn mutate<R>(&self, f: impl FnOnce(&mut Topology) -> Result<R>) -> Result<R> {
        let (result, events) = {
            let mut topo = self.topo_mut();
            let result = f(&mut topo);
            (result, topo.drain_events())
        };
        self.dispatch(&events);
        result
    }

    fn dispatch(&self, events: &[TopologyEvent]) {
        if events.is_empty() {
            return;
        }
        {
            let mut bridges = self.bridge_tables();
            events.iter().for_each(|e| bridges.on_topology_event(e));
        }
        {
            let mut routing = self.routing_mut();
            events.iter().for_each(|e| routing.on_topology_event(e));
        }
        let orphaned = {
            let mut neighbors = self.neighbors();
            events.iter().for_each(|e| neighbors.on_topology_event(e));
            neighbors.take_orphaned()
        };
        {
            let mut nat = self.nat();
            let table = nat.table_mut();
            events.iter().for_each(|e| table.on_topology_event(e));
        }

        for (key, waiter) in orphaned {
            self.fail_waiter(None, key, waiter);
        }

        for event in events {
            if let TopologyEvent::NamespaceRemoved { ns } = *event {
                self.metrics.remove_namespace(ns);
                self.inbox().remove(&ns);
            }
        }
    }

    /// Fail a suspended resolution: tasks get `Unreachable`, held packets
    /// are counted as dropped
    fn fail_waiter(&self, report: Option<&mut InjectReport>, key: NeighborKey, waiter: Waiter) {
        match waiter {
            Waiter::Task(tx) => {
                let _ = tx.send(Err(Error::Unreachable { ip: key.ip }));
            }
            Waiter::Packet(_) => {
                let alive = self.topo().namespace(key.ns).is_ok();
                if alive {
                    self.record_drop(report, key.ns, DropReason::Unreachable);
                }
            }
        }
    }

    /// Run `f` with read access to the topology
    pub fn with_topology<R>(&self, f: impl FnOnce(&Topology) -> R) -> R {
        f(&self.topo())
    }

    pub fn namespace_id(&self, name: &str) -> Option<NamespaceId> {
        self.topo().find_namespace(name)
    }

    pub fn interface_id(&self, ns: NamespaceId, name: &str) -> Option<InterfaceId> {
        self.topo().find_interface(ns, name)
    }

    /// The bridge's own L3 interface
    pub fn bridge_interface(&self, bridge: BridgeId) -> Result<InterfaceId> {
        self.topo().bridge(bridge).map(|b| b.iface)
    }

    pub fn create_namespace(&self, name: &str) -> Result<NamespaceId> {
        self.mutate(|t| t.create_namespace(name))
    }

    /// Delete a namespace with all its interfaces and bridges
    pub fn delete_namespace(&self, ns: NamespaceId) -> Result<()> {
        self.mutate(|t| t.delete_namespace(ns))
    }

    pub fn set_forwarding(&self, ns: NamespaceId, enabled: bool) -> Result<()> {
        self.mutate(|t| t.set_forwarding(ns, enabled))
    }

    pub fn set_rp_filter(&self, ns: NamespaceId, mode: RpFilter) -> Result<()> {
        self.mutate(|t| t.set_rp_filter(ns, mode))
    }

    pub fn create_interface(&self, ns: NamespaceId, name: &str) -> Result<InterfaceId> {
        self.mutate(|t| t.create_interface(ns, name))
    }

    pub fn delete_interface(&self, iface: InterfaceId) -> Result<()> {
        self.mutate(|t| t.delete_interface(iface))
    }

    /// Move an interface to another namespace. Addresses are flushed and the
    /// interface comes up DOWN on the other side.
    pub fn move_interface(&self, iface: InterfaceId, to: NamespaceId) -> Result<()> {
        self.mutate(|t| t.move_interface(iface, to))
    }

    pub fn set_mac(&self, iface: InterfaceId, mac: MacAddr) -> Result<()> {
        self.mutate(|t| t.set_mac(iface, mac))
    }

    pub fn set_interface_state(&self, iface: InterfaceId, state: LinkState) -> Result<()> {
        self.mutate(|t| t.set_interface_state(iface, state))
    }

    /// Turn source masquerading on or off for traffic leaving `iface`.
    /// Disabling tears down the flows translated through it.
    pub fn set_masquerade(&self, iface: InterfaceId, enabled: bool) -> Result<()> {
        self.mutate(|t| t.set_masquerade(iface, enabled))?;
        if !enabled {
            let purged = self.nat().table_mut().purge_interface(iface);
            if purged > 0 {
                debug!("{}: masquerade off, removed {} flows", iface, purged);
            }
        }
        Ok(())
    }

    pub fn assign_address(&self, iface: InterfaceId, cidr: Ipv4Cidr) -> Result<()> {
        self.mutate(|t| t.assign_address(iface, cidr))
    }

    pub fn remove_address(&self, iface: InterfaceId, cidr: Ipv4Cidr) -> Result<()> {
        self.mutate(|t| t.remove_address(iface, cidr))
    }

    pub fn create_link(&self, a: InterfaceId, b: InterfaceId) -> Result<LinkId> {
        self.mutate(|t| t.create_link(a, b))
    }

    pub fn delete_link(&self, link: LinkId) -> Result<()> {
        self.mutate(|t| t.delete_link(link))
    }

    pub fn create_bridge(&self, ns: NamespaceId, name: &str) -> Result<BridgeId> {
        self.mutate(|t| t.create_bridge(ns, name))
    }

    pub fn delete_bridge(&self, bridge: BridgeId) -> Result<()> {
        self.mutate(|t| t.delete_bridge(bridge))
    }

    pub fn attach_to_bridge(&self, iface: InterfaceId, bridge: BridgeId) -> Result<()> {
        self.mutate(|t| t.attach_to_bridge(iface, bridge))
    }

    pub fn detach_from_bridge(&self, iface: InterfaceId) -> Result<()> {
        self.mutate(|t| t.detach_from_bridge(iface))
    }

    pub fn set_bridge_ageing_time(&self, bridge: BridgeId, ageing_time: Duration) -> Result<()> {
        self.topo().bridge(bridge)?;
        let mut tables = self.bridge_tables();
        let fdb = tables.get_mut(bridge).ok_or(Error::BridgeNotFound(bridge))?;
        fdb.set_ageing_time(ageing_time);
        Ok(())
    }

    /// Remove every learned entry of a bridge
    pub fn flush_fdb(&self, bridge: BridgeId) -> Result<()> {
        self.topo().bridge(bridge)?;
        if let Some(fdb) = self.bridge_tables().get_mut(bridge) {
            fdb.flush();
        }
        Ok(())
    }

    // ========================================
    // Routing
    // ========================================

    pub fn add_route(&self, ns: NamespaceId, spec: RouteSpec) -> Result<Route> {
        {
            let topo = self.topo();
            topo.namespace(ns)?;
            if let Some(dev) = spec.dev {
                let iface = topo.interface(dev)?;
                if iface.ns != ns {
                    return Err(Error::Configuration(format!(
                        "{} does not belong to {}",
                        dev, ns
                    )));
                }
            }
        }
        self.routing_mut().add_route(ns, &spec)
    }

    /// Delete static routes for `prefix` (all metrics when `metric` is None)
    pub fn delete_route(&self, ns: NamespaceId, prefix: Ipv4Cidr, metric: Option<u32>) -> Result<()> {
        self.topo().namespace(ns)?;
        self.routing_mut().delete_route(ns, prefix, metric)
    }

    /// Forwarding decision for `dst` as seen from `ns`, without sending anything
    pub fn lookup_route(&self, ns: NamespaceId, dst: Ipv4Addr) -> Result<Option<RouteLookup>> {
        self.topo().namespace(ns)?;
        let usable = self.usable_interfaces(ns);
        let routing = self.routing();
        Ok(routing
            .fib(ns)
            .and_then(|fib| fib.lookup(dst, |i| usable.contains(&i))))
    }

    /// Interfaces of `ns` that may carry traffic
    fn usable_interfaces(&self, ns: NamespaceId) -> HashSet<InterfaceId> {
        self.topo()
            .interfaces_in(ns)
            .map(|ifaces| {
                ifaces
                    .into_iter()
                    .filter(|i| i.is_up() && i.master.is_none())
                    .map(|i| i.id)
                    .collect()
            })
            .unwrap_or_default()
    }

    // ========================================
    // Conntrack
    // ========================================

    /// Tear down a tracked flow given either of its tuples
    pub fn remove_flow(&self, ns: NamespaceId, tuple: &FlowTuple) -> bool {
        self.nat().table_mut().remove_flow(ns, tuple)
    }

    // ========================================
    // Local delivery
    // ========================================

    /// Take the packets delivered to `ns`'s own stack so far
    pub fn take_delivered(&self, ns: NamespaceId) -> Vec<Packet> {
        self.inbox().remove(&ns).unwrap_or_default()
    }
}
