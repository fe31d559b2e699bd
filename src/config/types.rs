//! Configuration types

use crate::dataplane::{
    ConntrackTimeouts, NeighborConfig, DEFAULT_AGEING_TIME, DEFAULT_CONNTRACK_MAX,
    DEFAULT_FDB_CAPACITY,
};
use crate::engine::EngineConfig;
use crate::protocol::{Ipv4Cidr, MacAddr};
use crate::telemetry::LogConfig;
use crate::topology::RpFilter;
use serde::Deserialize;
use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;
use std::time::Duration;

/// Scenario file
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub engine: EngineSection,
    #[serde(default)]
    pub log: LogConfig,
    #[serde(default, rename = "namespace")]
    pub namespaces: Vec<NamespaceConfig>,
    #[serde(default, rename = "bridge")]
    pub bridges: Vec<BridgeConfig>,
    #[serde(default, rename = "interface")]
    pub interfaces: Vec<InterfaceConfig>,
    #[serde(default, rename = "link")]
    pub links: Vec<LinkConfig>,
    #[serde(default, rename = "route")]
    pub routes: Vec<RouteConfig>,
}

/// `[engine]` tunables. Times are in milliseconds unless the name says otherwise.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct EngineSection {
    pub fdb_ageing_time_ms: u64,
    pub fdb_capacity: usize,
    pub neighbor_reachable_time_ms: u64,
    pub neighbor_retrans_time_ms: u64,
    pub neighbor_max_probes: u32,
    pub neighbor_stale_gc_ms: u64,
    pub neighbor_failed_gc_ms: u64,
    pub conntrack_max: usize,
    pub nat_port_min: u16,
    pub nat_port_max: u16,
    pub tcp_established_timeout_secs: u64,
    pub tcp_transitory_timeout_secs: u64,
    pub udp_timeout_secs: u64,
    pub icmp_timeout_secs: u64,
}

impl Default for EngineSection {
    fn default() -> Self {
        let neighbor = NeighborConfig::default();
        let timeouts = ConntrackTimeouts::default();
        Self {
            fdb_ageing_time_ms: millis(DEFAULT_AGEING_TIME),
            fdb_capacity: DEFAULT_FDB_CAPACITY,
            neighbor_reachable_time_ms: millis(neighbor.reachable_time),
            neighbor_retrans_time_ms: millis(neighbor.retrans_time),
            neighbor_max_probes: neighbor.max_probes,
            neighbor_stale_gc_ms: millis(neighbor.stale_gc_time),
            neighbor_failed_gc_ms: millis(neighbor.failed_gc_time),
            conntrack_max: DEFAULT_CONNTRACK_MAX,
            nat_port_min: 1024,
            nat_port_max: 65535,
            tcp_established_timeout_secs: timeouts.tcp_established.as_secs(),
            tcp_transitory_timeout_secs: timeouts.tcp_transitory.as_secs(),
            udp_timeout_secs: timeouts.udp.as_secs(),
            icmp_timeout_secs: timeouts.icmp.as_secs(),
        }
    }
}

fn millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

impl EngineSection {
    pub fn to_engine_config(&self) -> EngineConfig {
        EngineConfig {
            fdb_ageing_time: Duration::from_millis(self.fdb_ageing_time_ms),
            fdb_capacity: self.fdb_capacity,
            neighbor: NeighborConfig {
                reachable_time: Duration::from_millis(self.neighbor_reachable_time_ms),
                retrans_time: Duration::from_millis(self.neighbor_retrans_time_ms),
                max_probes: self.neighbor_max_probes,
                stale_gc_time: Duration::from_millis(self.neighbor_stale_gc_ms),
                failed_gc_time: Duration::from_millis(self.neighbor_failed_gc_ms),
            },
            conntrack_max: self.conntrack_max,
            nat_ports: self.nat_port_min..=self.nat_port_max,
            conntrack_timeouts: ConntrackTimeouts {
                tcp_established: Duration::from_secs(self.tcp_established_timeout_secs),
                tcp_transitory: Duration::from_secs(self.tcp_transitory_timeout_secs),
                udp: Duration::from_secs(self.udp_timeout_secs),
                icmp: Duration::from_secs(self.icmp_timeout_secs),
            },
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct NamespaceConfig {
    pub name: String,
    #[serde(default)]
    pub forwarding: bool,
    #[serde(default)]
    pub rp_filter: RpFilter,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BridgeConfig {
    pub namespace: String,
    pub name: String,
    #[serde(default)]
    pub addresses: Vec<Ipv4Cidr>,
    #[serde(default = "default_up")]
    pub up: bool,
    pub ageing_time_ms: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct InterfaceConfig {
    pub namespace: String,
    pub name: String,
    pub mac: Option<MacAddr>,
    #[serde(default)]
    pub addresses: Vec<Ipv4Cidr>,
    #[serde(default = "default_up")]
    pub up: bool,
    /// Bridge (in the same namespace) to enslave this interface to
    pub bridge: Option<String>,
    #[serde(default)]
    pub masquerade: bool,
}

fn default_up() -> bool {
    true
}

/// `namespace/interface` reference
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Deserialize)]
#[serde(try_from = "String")]
pub struct Endpoint {
    pub namespace: String,
    pub interface: String,
}

impl FromStr for Endpoint {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.split_once('/') {
            Some((ns, iface)) if !ns.is_empty() && !iface.is_empty() => Ok(Self {
                namespace: ns.to_string(),
                interface: iface.to_string(),
            }),
            _ => Err(format!("expected namespace/interface, got '{}'", s)),
        }
    }
}

impl TryFrom<String> for Endpoint {
    type Error = String;

    fn try_from(s: String) -> std::result::Result<Self, Self::Error> {
        s.parse()
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.interface)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LinkConfig {
    pub a: Endpoint,
    pub b: Endpoint,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RouteConfig {
    pub namespace: String,
    pub prefix: Ipv4Cidr,
    pub via: Option<Ipv4Addr>,
    pub dev: Option<String>,
    #[serde(default)]
    pub metric: u32,
}
