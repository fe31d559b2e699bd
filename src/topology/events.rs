//! Topology change notifications
//!
//! Tables never hold references into the topology. When an entity goes
//! away the graph emits events and every table purges its own rows.

use super::{BridgeId, InterfaceId, LinkId, LinkState, NamespaceId};
use crate::protocol::Ipv4Cidr;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TopologyEvent {
    NamespaceRemoved {
        ns: NamespaceId,
    },
    /// Interface destroyed, or moved out of `ns`
    InterfaceRemoved {
        ns: NamespaceId,
        iface: InterfaceId,
    },
    InterfaceStateChanged {
        ns: NamespaceId,
        iface: InterfaceId,
        state: LinkState,
    },
    AddressAdded {
        ns: NamespaceId,
        iface: InterfaceId,
        cidr: Ipv4Cidr,
    },
    AddressRemoved {
        ns: NamespaceId,
        iface: InterfaceId,
        cidr: Ipv4Cidr,
    },
    BridgeCreated {
        bridge: BridgeId,
        iface: InterfaceId,
    },
    BridgeRemoved {
        bridge: BridgeId,
    },
    PortAttached {
        bridge: BridgeId,
        iface: InterfaceId,
    },
    PortDetached {
        bridge: BridgeId,
        iface: InterfaceId,
    },
    LinkRemoved {
        link: LinkId,
        ends: (InterfaceId, InterfaceId),
    },
}

/// Implemented by every table that keeps rows keyed by topology ids.
pub trait TopologyObserver {
    fn on_topology_event(&mut self, event: &TopologyEvent);
}
