//! Small helpers for building topologies in tests

use netlab::config;
use netlab::protocol::{Ipv4Cidr, MacAddr};
use netlab::topology::{InterfaceId, LinkState, NamespaceId};
use netlab::{Engine, Names};
use std::net::Ipv4Addr;

pub fn ip(s: &str) -> Ipv4Addr {
    s.parse().unwrap()
}

pub fn cidr(s: &str) -> Ipv4Cidr {
    s.parse().unwrap()
}

/// A namespace with one interface of interest
#[derive(Debug, Clone, Copy)]
pub struct Node {
    pub ns: NamespaceId,
    pub iface: InterfaceId,
    pub mac: MacAddr,
}

/// Create an up interface in `ns`, optionally addressed
pub fn iface(engine: &Engine, ns: NamespaceId, name: &str, addr: Option<&str>) -> Node {
    let iface = engine.create_interface(ns, name).unwrap();
    if let Some(addr) = addr {
        engine.assign_address(iface, cidr(addr)).unwrap();
    }
    engine.set_interface_state(iface, LinkState::Up).unwrap();
    Node {
        ns,
        iface,
        mac: mac_of(engine, iface),
    }
}

/// A namespace with a single up `eth0`
pub fn host(engine: &Engine, name: &str, addr: Option<&str>) -> Node {
    let ns = engine.create_namespace(name).unwrap();
    iface(engine, ns, "eth0", addr)
}

pub fn mac_of(engine: &Engine, iface: InterfaceId) -> MacAddr {
    engine.with_topology(|t| t.interface(iface).unwrap().mac)
}

/// Home-router layout:
///
/// ```text
/// lan (10.22.33.2/24) --- gw lan0 (10.22.33.1/24)
///                          gw wan0 (203.0.113.2/24, masquerade) --- isp (203.0.113.1/24, 8.8.8.8/32)
/// ```
pub const HOME: &str = r#"
[[namespace]]
name = "lan"

[[namespace]]
name = "gw"
forwarding = true

[[namespace]]
name = "isp"
forwarding = true

[[interface]]
namespace = "lan"
name = "eth0"
addresses = ["10.22.33.2/24"]

[[interface]]
namespace = "gw"
name = "lan0"
addresses = ["10.22.33.1/24"]

[[interface]]
namespace = "gw"
name = "wan0"
addresses = ["203.0.113.2/24"]
masquerade = true

[[interface]]
namespace = "isp"
name = "eth0"
addresses = ["203.0.113.1/24", "8.8.8.8/32"]

[[link]]
a = "lan/eth0"
b = "gw/lan0"

[[link]]
a = "gw/wan0"
b = "isp/eth0"

[[route]]
namespace = "lan"
prefix = "0.0.0.0/0"
via = "10.22.33.1"

[[route]]
namespace = "gw"
prefix = "0.0.0.0/0"
via = "203.0.113.1"
"#;

pub fn home() -> (Engine, Names) {
    home_with("")
}

/// [`HOME`] with extra `[engine]` settings
pub fn home_with(engine_section: &str) -> (Engine, Names) {
    let text = format!("[engine]\n{}\n{}", engine_section, HOME);
    let config = config::parse(&text).unwrap();
    Engine::from_config(&config).unwrap()
}
