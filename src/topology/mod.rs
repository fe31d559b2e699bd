//! Topology graph
//!
//! Namespaces, interfaces, veth links and bridges, addressed by opaque ids.

mod events;
mod graph;
mod ids;

pub use events::{TopologyEvent, TopologyObserver};
pub use graph::{
    Bridge, Interface, InterfaceKind, Link, LinkState, Namespace, RpFilter, Topology,
};
pub use ids::{BridgeId, InterfaceId, LinkId, NamespaceId};
