//! Data plane components
//!
//! Per-concern tables (bridge FDB, FIB, neighbor cache, conntrack) and the
//! pure decisions made against them. Each table reacts to topology events
//! on its own; the engine decides when they run.

pub mod clock;
mod conntrack;
mod fdb;
mod forwarder;
mod napt;
mod neighbor_table;
mod routing;

pub use clock::LogicalClock;
pub use conntrack::{
    ConnEntry, ConntrackRow, ConntrackTable, ConntrackTimeouts, FlowTuple, TcpConnState,
    DEFAULT_CONNTRACK_MAX,
};
pub use fdb::{
    BridgeTables, Fdb, FdbRow, L2ForwardAction, PortId, DEFAULT_AGEING_TIME, DEFAULT_FDB_CAPACITY,
};
pub use forwarder::{forward, route_output, DropReason, ForwardAction, ForwardPolicy};
pub use napt::{Masquerade, ReplyMatch, SnatResult, DEFAULT_PORT_RANGE};
pub use neighbor_table::{
    NeighborCache, NeighborConfig, NeighborKey, NeighborRow, NeighborState, Probe, Resolve,
    TickOutput, Waiter, WaiterId,
};
pub use routing::{Fib, Route, RouteLookup, RouteSource, RouteSpec, RoutingTable, RoutingTables};
