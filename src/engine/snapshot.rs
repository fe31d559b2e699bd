//! Read-only queries and structured export
//!
//! Every query returns owned copies taken under the table's lock; nothing
//! handed out refers back into the engine.

use super::Engine;
use crate::dataplane::{ConntrackRow, FdbRow, NeighborRow, Route};
use crate::protocol::{Ipv4Cidr, MacAddr};
use crate::telemetry::CounterSnapshot;
use crate::topology::{BridgeId, InterfaceId, LinkId, LinkState, NamespaceId, RpFilter};
use crate::{Error, Result};
use serde::Serialize;

/// Full state of the engine at one instant, ordered by id
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Snapshot {
    pub now_ms: u64,
    #[serde(rename = "namespace")]
    pub namespaces: Vec<NamespaceSnapshot>,
    #[serde(rename = "link")]
    pub links: Vec<LinkSnapshot>,
    #[serde(rename = "bridge")]
    pub bridges: Vec<BridgeSnapshot>,
    pub conntrack: Vec<ConntrackRow>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NamespaceSnapshot {
    pub id: NamespaceId,
    pub name: String,
    pub forwarding: bool,
    pub rp_filter: RpFilter,
    pub counters: CounterSnapshot,
    #[serde(rename = "interface")]
    pub interfaces: Vec<InterfaceSnapshot>,
    #[serde(rename = "route")]
    pub routes: Vec<Route>,
    #[serde(rename = "neighbor")]
    pub neighbors: Vec<NeighborRow>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InterfaceSnapshot {
    pub id: InterfaceId,
    pub name: String,
    pub mac: MacAddr,
    pub state: LinkState,
    pub addresses: Vec<Ipv4Cidr>,
    pub masquerade: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub link: Option<LinkId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub master: Option<BridgeId>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct LinkSnapshot {
    pub id: LinkId,
    pub a: InterfaceId,
    pub b: InterfaceId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BridgeSnapshot {
    pub id: BridgeId,
    pub ns: NamespaceId,
    pub iface: InterfaceId,
    pub ageing_time_ms: u64,
    pub ports: Vec<InterfaceId>,
    pub fdb: Vec<FdbRow>,
}

impl Snapshot {
    /// Render as TOML for diffing between runs
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| Error::Export(e.to_string()))
    }
}

fn millis(d: std::time::Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

impl Engine {
    /// Learned MAC table of a bridge, ordered by MAC
    pub fn query_fdb(&self, bridge: BridgeId) -> Result<Vec<FdbRow>> {
        self.topo().bridge(bridge)?;
        Ok(self
            .bridge_tables()
            .get(bridge)
            .map(|fdb| fdb.rows())
            .unwrap_or_default())
    }

    /// Routes of a namespace in table order (prefix, then metric)
    pub fn query_fib(&self, ns: NamespaceId) -> Result<Vec<Route>> {
        self.topo().namespace(ns)?;
        Ok(self
            .routing()
            .fib(ns)
            .map(|fib| fib.table().routes())
            .unwrap_or_default())
    }

    /// Every tracked flow across namespaces
    pub fn query_conntrack(&self) -> Vec<ConntrackRow> {
        self.nat().table().rows()
    }

    pub fn query_neighbor_cache(&self, ns: NamespaceId) -> Result<Vec<NeighborRow>> {
        self.topo().namespace(ns)?;
        Ok(self.neighbors().rows(ns))
    }

    /// Packet and drop counters of a namespace
    pub fn query_counters(&self, ns: NamespaceId) -> Result<CounterSnapshot> {
        self.topo().namespace(ns)?;
        Ok(self.metrics.snapshot(ns))
    }

    /// Capture topology and every table
    pub fn export(&self) -> Snapshot {
        let (mut namespaces, links, bridge_shapes) = {
            let topo = self.topo();
            let namespaces: Vec<NamespaceSnapshot> = topo
                .namespaces()
                .into_iter()
                .map(|ns| NamespaceSnapshot {
                    id: ns.id,
                    name: ns.name.clone(),
                    forwarding: ns.forwarding,
                    rp_filter: ns.rp_filter,
                    counters: CounterSnapshot::default(),
                    interfaces: topo
                        .interfaces_in(ns.id)
                        .unwrap_or_default()
                        .into_iter()
                        .map(|i| InterfaceSnapshot {
                            id: i.id,
                            name: i.name.clone(),
                            mac: i.mac,
                            state: i.state,
                            addresses: i.addresses.clone(),
                            masquerade: i.masquerade,
                            link: i.link,
                            master: i.master,
                        })
                        .collect(),
                    routes: Vec::new(),
                    neighbors: Vec::new(),
                })
                .collect();
            let links: Vec<LinkSnapshot> = topo
                .links()
                .into_iter()
                .map(|l| LinkSnapshot {
                    id: l.id,
                    a: l.ends.0,
                    b: l.ends.1,
                })
                .collect();
            let bridges: Vec<(BridgeId, NamespaceId, InterfaceId, Vec<InterfaceId>)> = topo
                .bridges()
                .into_iter()
                .map(|b| (b.id, b.ns, b.iface, b.ports.iter().copied().collect()))
                .collect();
            (namespaces, links, bridges)
        };

        {
            let routing = self.routing();
            for ns in namespaces.iter_mut() {
                ns.routes = routing
                    .fib(ns.id)
                    .map(|fib| fib.table().routes())
                    .unwrap_or_default();
            }
        }
        {
            let neighbors = self.neighbors();
            for ns in namespaces.iter_mut() {
                ns.neighbors = neighbors.rows(ns.id);
            }
        }
        for ns in namespaces.iter_mut() {
            ns.counters = self.metrics.snapshot(ns.id);
        }

        let bridges = {
            let tables = self.bridge_tables();
            bridge_shapes
                .into_iter()
                .map(|(id, ns, iface, ports)| {
                    let fdb = tables.get(id);
                    BridgeSnapshot {
                        id,
                        ns,
                        iface,
                        ageing_time_ms: fdb.map(|f| millis(f.ageing_time())).unwrap_or_default(),
                        ports,
                        fdb: fdb.map(|f| f.rows()).unwrap_or_default(),
                    }
                })
                .collect()
        };

        Snapshot {
            now_ms: millis(self.clock.now()),
            namespaces,
            links,
            bridges,
            conntrack: self.query_conntrack(),
        }
    }
}
