//! Topology graph: namespaces, interfaces, links and bridges
//!
//! Entities live in id-keyed arenas. Relationships are stored as ids on
//! both sides (namespace -> interfaces, interface -> namespace) and are
//! only ever updated here, so the index can never disagree with the
//! arena. Mutations queue [`TopologyEvent`]s which the caller drains and
//! fans out to dependent tables.

use super::{BridgeId, InterfaceId, LinkId, NamespaceId, TopologyEvent};
use crate::protocol::{Ipv4Cidr, MacAddr};
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::net::Ipv4Addr;
use tracing::debug;

/// Administrative interface state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LinkState {
    Up,
    #[default]
    Down,
}

/// Reverse-path filter mode (`rp_filter` sysctl)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RpFilter {
    #[default]
    Off,
    Strict,
    Loose,
}

/// What sits behind an interface
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterfaceKind {
    /// veth end; may be linked to a peer and enslaved to a bridge
    Veth,
    /// The bridge's own L3 device
    Bridge(BridgeId),
}

#[derive(Debug, Clone)]
pub struct Namespace {
    pub id: NamespaceId,
    pub name: String,
    pub forwarding: bool,
    pub rp_filter: RpFilter,
    pub interfaces: BTreeSet<InterfaceId>,
}

#[derive(Debug, Clone)]
pub struct Interface {
    pub id: InterfaceId,
    pub ns: NamespaceId,
    pub name: String,
    pub mac: MacAddr,
    pub addresses: Vec<Ipv4Cidr>,
    pub state: LinkState,
    pub kind: InterfaceKind,
    pub link: Option<LinkId>,
    /// Bridge this interface is enslaved to
    pub master: Option<BridgeId>,
    pub masquerade: bool,
}

impl Interface {
    pub fn is_up(&self) -> bool {
        self.state == LinkState::Up
    }

    /// First configured address
    pub fn primary_address(&self) -> Option<Ipv4Addr> {
        self.addresses.first().map(|c| c.addr())
    }

    /// Address whose subnet contains `dst`, falling back to the primary one
    pub fn source_address_for(&self, dst: Ipv4Addr) -> Option<Ipv4Addr> {
        self.addresses
            .iter()
            .find(|c| c.contains(dst))
            .map(|c| c.addr())
            .or_else(|| self.primary_address())
    }

    pub fn has_address(&self, ip: Ipv4Addr) -> bool {
        self.addresses.iter().any(|c| c.addr() == ip)
    }
}

/// veth pair
#[derive(Debug, Clone, Copy)]
pub struct Link {
    pub id: LinkId,
    pub ends: (InterfaceId, InterfaceId),
}

impl Link {
    /// The end opposite to `iface`
    pub fn other(&self, iface: InterfaceId) -> Option<InterfaceId> {
        if self.ends.0 == iface {
            Some(self.ends.1)
        } else if self.ends.1 == iface {
            Some(self.ends.0)
        } else {
            None
        }
    }
}

#[derive(Debug, Clone)]
pub struct Bridge {
    pub id: BridgeId,
    pub ns: NamespaceId,
    /// The bridge's own interface (holds its MAC and L3 addresses)
    pub iface: InterfaceId,
    pub ports: BTreeSet<InterfaceId>,
}

#[derive(Debug, Default)]
pub struct Topology {
    namespaces: HashMap<NamespaceId, Namespace>,
    interfaces: HashMap<InterfaceId, Interface>,
    links: HashMap<LinkId, Link>,
    bridges: HashMap<BridgeId, Bridge>,
    next_id: u32,
    events: Vec<TopologyEvent>,
}

fn config_err(msg: impl Into<String>) -> Error {
    Error::Configuration(msg.into())
}

impl Topology {
    pub fn new() -> Self {
        Self::default()
    }

    fn alloc(&mut self) -> u32 {
        self.next_id += 1;
        self.next_id
    }

    fn emit(&mut self, event: TopologyEvent) {
        debug!(?event, "topology change");
        self.events.push(event);
    }

    /// Take the events queued by previous mutations
    pub fn drain_events(&mut self) -> Vec<TopologyEvent> {
        std::mem::take(&mut self.events)
    }

    // ========================================
    // Queries
    // ========================================

    pub fn namespace(&self, ns: NamespaceId) -> Result<&Namespace> {
        self.namespaces.get(&ns).ok_or(Error::NamespaceNotFound(ns))
    }

    pub fn interface(&self, iface: InterfaceId) -> Result<&Interface> {
        self.interfaces
            .get(&iface)
            .ok_or(Error::InterfaceNotFound(iface))
    }

    pub fn bridge(&self, bridge: BridgeId) -> Result<&Bridge> {
        self.bridges
            .get(&bridge)
            .ok_or(Error::BridgeNotFound(bridge))
    }

    pub fn link(&self, link: LinkId) -> Result<&Link> {
        self.links.get(&link).ok_or(Error::LinkNotFound(link))
    }

    /// Namespaces ordered by id
    pub fn namespaces(&self) -> Vec<&Namespace> {
        let mut all: Vec<&Namespace> = self.namespaces.values().collect();
        all.sort_by_key(|n| n.id);
        all
    }

    /// Interfaces of a namespace ordered by id
    pub fn interfaces_in(&self, ns: NamespaceId) -> Result<Vec<&Interface>> {
        let namespace = self.namespace(ns)?;
        Ok(namespace
            .interfaces
            .iter()
            .filter_map(|id| self.interfaces.get(id))
            .collect())
    }

    pub fn links(&self) -> Vec<&Link> {
        let mut all: Vec<&Link> = self.links.values().collect();
        all.sort_by_key(|l| l.id);
        all
    }

    pub fn bridges(&self) -> Vec<&Bridge> {
        let mut all: Vec<&Bridge> = self.bridges.values().collect();
        all.sort_by_key(|b| b.id);
        all
    }

    pub fn find_namespace(&self, name: &str) -> Option<NamespaceId> {
        self.namespaces
            .values()
            .find(|n| n.name == name)
            .map(|n| n.id)
    }

    pub fn find_interface(&self, ns: NamespaceId, name: &str) -> Option<InterfaceId> {
        let namespace = self.namespaces.get(&ns)?;
        namespace
            .interfaces
            .iter()
            .copied()
            .find(|id| self.interfaces.get(id).is_some_and(|i| i.name == name))
    }

    /// Peer at the other end of the interface's link
    pub fn peer(&self, iface: InterfaceId) -> Option<InterfaceId> {
        let link = self.interfaces.get(&iface)?.link?;
        self.links.get(&link)?.other(iface)
    }

    /// Interface in `ns` that owns `ip` as a local address
    pub fn local_owner(&self, ns: NamespaceId, ip: Ipv4Addr) -> Option<InterfaceId> {
        let namespace = self.namespaces.get(&ns)?;
        namespace
            .interfaces
            .iter()
            .copied()
            .find(|id| self.interfaces.get(id).is_some_and(|i| i.has_address(ip)))
    }

    pub fn is_local_address(&self, ns: NamespaceId, ip: Ipv4Addr) -> bool {
        self.local_owner(ns, ip).is_some()
    }

    // ========================================
    // Namespaces
    // ========================================

    pub fn create_namespace(&mut self, name: &str) -> Result<NamespaceId> {
        if self.find_namespace(name).is_some() {
            return Err(config_err(format!("namespace {} already exists", name)));
        }
        let id = NamespaceId(self.alloc());
        self.namespaces.insert(
            id,
            Namespace {
                id,
                name: name.to_string(),
                forwarding: false,
                rp_filter: RpFilter::default(),
                interfaces: BTreeSet::new(),
            },
        );
        debug!("Created namespace {} ({})", name, id);
        Ok(id)
    }

    /// Delete a namespace together with its bridges and interfaces
    pub fn delete_namespace(&mut self, ns: NamespaceId) -> Result<()> {
        self.namespace(ns)?;

        let bridges: Vec<BridgeId> = self
            .bridges
            .values()
            .filter(|b| b.ns == ns)
            .map(|b| b.id)
            .collect();
        for bridge in bridges {
            self.delete_bridge(bridge)?;
        }

        let interfaces: Vec<InterfaceId> = self.namespace(ns)?.interfaces.iter().copied().collect();
        for iface in interfaces {
            self.remove_interface(iface);
        }

        self.namespaces.remove(&ns);
        self.emit(TopologyEvent::NamespaceRemoved { ns });
        Ok(())
    }

    pub fn set_forwarding(&mut self, ns: NamespaceId, enabled: bool) -> Result<()> {
        let namespace = self
            .namespaces
            .get_mut(&ns)
            .ok_or(Error::NamespaceNotFound(ns))?;
        namespace.forwarding = enabled;
        debug!("{}: forwarding={}", ns, enabled);
        Ok(())
    }

    pub fn set_rp_filter(&mut self, ns: NamespaceId, mode: RpFilter) -> Result<()> {
        let namespace = self
            .namespaces
            .get_mut(&ns)
            .ok_or(Error::NamespaceNotFound(ns))?;
        namespace.rp_filter = mode;
        debug!("{}: rp_filter={:?}", ns, mode);
        Ok(())
    }

    // ========================================
    // Interfaces
    // ========================================

    fn insert_interface(
        &mut self,
        ns: NamespaceId,
        name: &str,
        kind: InterfaceKind,
    ) -> Result<InterfaceId> {
        self.namespace(ns)?;
        if self.find_interface(ns, name).is_some() {
            return Err(config_err(format!(
                "interface {} already exists in {}",
                name, ns
            )));
        }

        let id = InterfaceId(self.alloc());
        self.interfaces.insert(
            id,
            Interface {
                id,
                ns,
                name: name.to_string(),
                mac: MacAddr::local(id.0),
                addresses: Vec::new(),
                state: LinkState::Down,
                kind,
                link: None,
                master: None,
                masquerade: false,
            },
        );
        if let Some(namespace) = self.namespaces.get_mut(&ns) {
            namespace.interfaces.insert(id);
        }
        debug!("Created interface {} ({}) in {}", name, id, ns);
        Ok(id)
    }

    pub fn create_interface(&mut self, ns: NamespaceId, name: &str) -> Result<InterfaceId> {
        self.insert_interface(ns, name, InterfaceKind::Veth)
    }

    pub fn delete_interface(&mut self, iface: InterfaceId) -> Result<()> {
        if let InterfaceKind::Bridge(bridge) = self.interface(iface)?.kind {
            return Err(config_err(format!(
                "{} is the device of {}; delete the bridge instead",
                iface, bridge
            )));
        }
        self.remove_interface(iface);
        Ok(())
    }

    fn remove_interface(&mut self, iface: InterfaceId) {
        let Some(interface) = self.interfaces.get(&iface) else {
            return;
        };
        let ns = interface.ns;
        let link = interface.link;
        let master = interface.master;

        if let Some(link) = link {
            self.remove_link(link);
        }
        if let Some(bridge) = master {
            self.detach(iface, bridge);
        }

        if let Some(namespace) = self.namespaces.get_mut(&ns) {
            namespace.interfaces.remove(&iface);
        }
        self.interfaces.remove(&iface);
        self.emit(TopologyEvent::InterfaceRemoved { ns, iface });
    }

    /// Move an interface to another namespace
    ///
    /// Addresses are flushed and the interface comes up DOWN on the other
    /// side, as with `ip link set netns`.
    pub fn move_interface(&mut self, iface: InterfaceId, to: NamespaceId) -> Result<()> {
        self.namespace(to)?;
        let interface = self.interface(iface)?;
        if interface.ns == to {
            return Ok(());
        }
        if matches!(interface.kind, InterfaceKind::Bridge(_)) {
            return Err(config_err(format!("bridge device {} cannot change namespace", iface)));
        }
        if let Some(bridge) = interface.master {
            return Err(config_err(format!(
                "{} is attached to {}; detach it first",
                iface, bridge
            )));
        }
        if self.find_interface(to, &interface.name).is_some() {
            return Err(config_err(format!(
                "interface {} already exists in {}",
                interface.name, to
            )));
        }

        let from = interface.ns;
        let addresses = interface.addresses.clone();
        for cidr in addresses {
            self.emit(TopologyEvent::AddressRemoved {
                ns: from,
                iface,
                cidr,
            });
        }
        self.emit(TopologyEvent::InterfaceRemoved { ns: from, iface });

        if let Some(namespace) = self.namespaces.get_mut(&from) {
            namespace.interfaces.remove(&iface);
        }
        if let Some(namespace) = self.namespaces.get_mut(&to) {
            namespace.interfaces.insert(iface);
        }
        if let Some(interface) = self.interfaces.get_mut(&iface) {
            interface.ns = to;
            interface.addresses.clear();
            interface.state = LinkState::Down;
        }
        debug!("Moved {} from {} to {}", iface, from, to);
        Ok(())
    }

    pub fn set_interface_state(&mut self, iface: InterfaceId, state: LinkState) -> Result<()> {
        let interface = self
            .interfaces
            .get_mut(&iface)
            .ok_or(Error::InterfaceNotFound(iface))?;
        if interface.state == state {
            return Ok(());
        }
        interface.state = state;
        let ns = interface.ns;
        self.emit(TopologyEvent::InterfaceStateChanged { ns, iface, state });
        Ok(())
    }

    pub fn set_mac(&mut self, iface: InterfaceId, mac: MacAddr) -> Result<()> {
        if !mac.is_unicast() || mac == MacAddr::ZERO {
            return Err(config_err(format!("{} is not a unicast address", mac)));
        }
        let interface = self
            .interfaces
            .get_mut(&iface)
            .ok_or(Error::InterfaceNotFound(iface))?;
        interface.mac = mac;
        Ok(())
    }

    pub fn set_masquerade(&mut self, iface: InterfaceId, enabled: bool) -> Result<()> {
        let interface = self
            .interfaces
            .get_mut(&iface)
            .ok_or(Error::InterfaceNotFound(iface))?;
        interface.masquerade = enabled;
        debug!("{}: masquerade={}", iface, enabled);
        Ok(())
    }

    /// Bind an address to an interface
    ///
    /// Fails when the prefix overlaps an address bound to a different
    /// interface of the same namespace.
    pub fn assign_address(&mut self, iface: InterfaceId, cidr: Ipv4Cidr) -> Result<()> {
        let interface = self.interface(iface)?;
        if interface.has_address(cidr.addr()) {
            return Err(config_err(format!(
                "{} is already assigned to {}",
                cidr, iface
            )));
        }

        let ns = interface.ns;
        for other in self.interfaces_in(ns)? {
            if other.id == iface {
                continue;
            }
            if let Some(existing) = other.addresses.iter().find(|a| a.overlaps(&cidr)) {
                return Err(config_err(format!(
                    "{} overlaps {} on {} ({})",
                    cidr, existing, other.name, other.id
                )));
            }
        }

        if let Some(interface) = self.interfaces.get_mut(&iface) {
            interface.addresses.push(cidr);
        }
        self.emit(TopologyEvent::AddressAdded { ns, iface, cidr });
        Ok(())
    }

    pub fn remove_address(&mut self, iface: InterfaceId, cidr: Ipv4Cidr) -> Result<()> {
        let interface = self
            .interfaces
            .get_mut(&iface)
            .ok_or(Error::InterfaceNotFound(iface))?;
        let Some(pos) = interface.addresses.iter().position(|a| *a == cidr) else {
            return Err(config_err(format!("{} is not assigned to {}", cidr, iface)));
        };
        interface.addresses.remove(pos);
        let ns = interface.ns;
        self.emit(TopologyEvent::AddressRemoved { ns, iface, cidr });
        Ok(())
    }

    // ========================================
    // Links
    // ========================================

    pub fn create_link(&mut self, a: InterfaceId, b: InterfaceId) -> Result<LinkId> {
        if a == b {
            return Err(config_err(format!("cannot link {} to itself", a)));
        }
        for end in [a, b] {
            let interface = self.interface(end)?;
            if matches!(interface.kind, InterfaceKind::Bridge(_)) {
                return Err(config_err(format!("bridge device {} cannot be linked", end)));
            }
            if let Some(link) = interface.link {
                return Err(config_err(format!("{} is already linked ({})", end, link)));
            }
        }

        let id = LinkId(self.alloc());
        self.links.insert(id, Link { id, ends: (a, b) });
        for end in [a, b] {
            if let Some(interface) = self.interfaces.get_mut(&end) {
                interface.link = Some(id);
            }
        }
        debug!("Linked {} <-> {} ({})", a, b, id);
        Ok(id)
    }

    pub fn delete_link(&mut self, link: LinkId) -> Result<()> {
        self.link(link)?;
        self.remove_link(link);
        Ok(())
    }

    fn remove_link(&mut self, link: LinkId) {
        let Some(removed) = self.links.remove(&link) else {
            return;
        };
        for end in [removed.ends.0, removed.ends.1] {
            if let Some(interface) = self.interfaces.get_mut(&end) {
                interface.link = None;
            }
        }
        self.emit(TopologyEvent::LinkRemoved {
            link,
            ends: removed.ends,
        });
    }

    // ========================================
    // Bridges
    // ========================================

    /// Create a bridge and its own interface in `ns`
    pub fn create_bridge(&mut self, ns: NamespaceId, name: &str) -> Result<BridgeId> {
        self.namespace(ns)?;
        if self.find_interface(ns, name).is_some() {
            return Err(config_err(format!(
                "interface {} already exists in {}",
                name, ns
            )));
        }
        let id = BridgeId(self.alloc());
        let iface = self.insert_interface(ns, name, InterfaceKind::Bridge(id))?;
        self.bridges.insert(
            id,
            Bridge {
                id,
                ns,
                iface,
                ports: BTreeSet::new(),
            },
        );
        self.emit(TopologyEvent::BridgeCreated { bridge: id, iface });
        Ok(id)
    }

    pub fn delete_bridge(&mut self, bridge: BridgeId) -> Result<()> {
        let br = self.bridge(bridge)?;
        let ports: Vec<InterfaceId> = br.ports.iter().copied().collect();
        let iface = br.iface;
        for port in ports {
            self.detach(port, bridge);
        }
        self.remove_interface(iface);
        self.bridges.remove(&bridge);
        self.emit(TopologyEvent::BridgeRemoved { bridge });
        Ok(())
    }

    pub fn attach_to_bridge(&mut self, iface: InterfaceId, bridge: BridgeId) -> Result<()> {
        let br_ns = self.bridge(bridge)?.ns;
        let interface = self.interface(iface)?;
        if matches!(interface.kind, InterfaceKind::Bridge(_)) {
            return Err(config_err(format!("bridge device {} cannot be a port", iface)));
        }
        if interface.ns != br_ns {
            return Err(config_err(format!(
                "{} ({}) and {} ({}) are in different namespaces",
                iface, interface.ns, bridge, br_ns
            )));
        }
        match interface.master {
            Some(current) if current == bridge => return Ok(()),
            Some(current) => {
                return Err(config_err(format!(
                    "{} is already attached to {}",
                    iface, current
                )))
            }
            None => {}
        }

        if let Some(interface) = self.interfaces.get_mut(&iface) {
            interface.master = Some(bridge);
        }
        if let Some(br) = self.bridges.get_mut(&bridge) {
            br.ports.insert(iface);
        }
        self.emit(TopologyEvent::PortAttached { bridge, iface });
        Ok(())
    }

    pub fn detach_from_bridge(&mut self, iface: InterfaceId) -> Result<()> {
        let Some(bridge) = self.interface(iface)?.master else {
            return Err(config_err(format!("{} is not attached to a bridge", iface)));
        };
        self.detach(iface, bridge);
        Ok(())
    }

    fn detach(&mut self, iface: InterfaceId, bridge: BridgeId) {
        if let Some(interface) = self.interfaces.get_mut(&iface) {
            interface.master = None;
        }
        if let Some(br) = self.bridges.get_mut(&bridge) {
            br.ports.remove(&iface);
        }
        self.emit(TopologyEvent::PortDetached { bridge, iface });
    }
}
