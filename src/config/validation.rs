//! Configuration validation
//!
//! Checks a scenario without building anything. Errors make
//! `Engine::from_config` fail; warnings are worth a look but harmless.

use super::{Config, Endpoint};
use std::collections::{BTreeMap, BTreeSet};

#[derive(Debug, Clone, Default)]
pub struct ValidationResult {
    pub warnings: Vec<String>,
    pub errors: Vec<String>,
}

impl ValidationResult {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn warn(&mut self, msg: impl Into<String>) {
        self.warnings.push(msg.into());
    }

    pub fn error(&mut self, msg: impl Into<String>) {
        self.errors.push(msg.into());
    }

    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }

    pub fn print_diagnostics(&self) {
        for warning in &self.warnings {
            eprintln!("[WARN] {}", warning);
        }
        for error in &self.errors {
            eprintln!("[ERROR] {}", error);
        }
    }
}

/// Validate configuration and return warnings/errors
pub fn validate(config: &Config) -> ValidationResult {
    let mut result = ValidationResult::new();

    validate_engine(config, &mut result);
    let namespaces = validate_namespaces(config, &mut result);
    let devices = validate_devices(config, &namespaces, &mut result);
    validate_links(config, &devices, &mut result);
    validate_routes(config, &devices, &namespaces, &mut result);

    result
}

fn validate_engine(config: &Config, result: &mut ValidationResult) {
    let engine = &config.engine;
    if engine.fdb_capacity == 0 {
        result.error("engine.fdb_capacity must be at least 1");
    }
    if engine.conntrack_max == 0 {
        result.error("engine.conntrack_max must be at least 1");
    }
    if engine.neighbor_retrans_time_ms == 0 {
        result.error("engine.neighbor_retrans_time_ms must be positive");
    }
    if engine.neighbor_max_probes == 0 {
        result.error("engine.neighbor_max_probes must be at least 1");
    }
    if engine.nat_port_min == 0 || engine.nat_port_min > engine.nat_port_max {
        result.error(format!(
            "engine: invalid NAT port range {}..={}",
            engine.nat_port_min, engine.nat_port_max
        ));
    }
    if engine.udp_timeout_secs > engine.tcp_established_timeout_secs {
        result.warn("engine: UDP flows outlive established TCP flows");
    }
}

fn validate_namespaces(config: &Config, result: &mut ValidationResult) -> BTreeSet<String> {
    let mut names = BTreeSet::new();
    for ns in &config.namespaces {
        if !names.insert(ns.name.clone()) {
            result.error(format!("namespace '{}' defined twice", ns.name));
        }
    }
    names
}

/// Returns every (namespace, device) pair with whether it is a bridge
fn validate_devices(
    config: &Config,
    namespaces: &BTreeSet<String>,
    result: &mut ValidationResult,
) -> BTreeMap<(String, String), bool> {
    let mut devices = BTreeMap::new();

    for bridge in &config.bridges {
        if !namespaces.contains(&bridge.namespace) {
            result.error(format!(
                "bridge {}: unknown namespace '{}'",
                bridge.name, bridge.namespace
            ));
        }
        let key = (bridge.namespace.clone(), bridge.name.clone());
        if devices.insert(key, true).is_some() {
            result.error(format!(
                "{}/{}: device defined twice",
                bridge.namespace, bridge.name
            ));
        }
    }

    for iface in &config.interfaces {
        if !namespaces.contains(&iface.namespace) {
            result.error(format!(
                "interface {}: unknown namespace '{}'",
                iface.name, iface.namespace
            ));
        }
        let key = (iface.namespace.clone(), iface.name.clone());
        if devices.insert(key, false).is_some() {
            result.error(format!(
                "{}/{}: device defined twice",
                iface.namespace, iface.name
            ));
        }
        if let Some(mac) = iface.mac {
            if !mac.is_unicast() {
                result.error(format!("{}/{}: {} is not unicast", iface.namespace, iface.name, mac));
            }
        }
        if iface.masquerade && iface.addresses.is_empty() {
            result.warn(format!(
                "{}/{}: masquerade without an address never translates",
                iface.namespace, iface.name
            ));
        }
    }

    for iface in &config.interfaces {
        let Some(bridge) = &iface.bridge else {
            continue;
        };
        match devices.get(&(iface.namespace.clone(), bridge.clone())) {
            Some(true) => {}
            _ => result.error(format!(
                "{}/{}: bridge '{}' not defined in the same namespace",
                iface.namespace, iface.name, bridge
            )),
        }
        if !iface.addresses.is_empty() {
            result.warn(format!(
                "{}/{}: addresses on a bridge port are never used",
                iface.namespace, iface.name
            ));
        }
    }

    devices
}

fn validate_links(
    config: &Config,
    devices: &BTreeMap<(String, String), bool>,
    result: &mut ValidationResult,
) {
    let mut linked: BTreeSet<&Endpoint> = BTreeSet::new();
    for link in &config.links {
        if link.a == link.b {
            result.error(format!("link {} <-> {}: both ends are the same", link.a, link.b));
        }
        for end in [&link.a, &link.b] {
            match devices.get(&(end.namespace.clone(), end.interface.clone())) {
                None => result.error(format!("link: unknown interface {}", end)),
                Some(true) => result.error(format!("link: {} is a bridge", end)),
                Some(false) => {}
            }
            if !linked.insert(end) {
                result.error(format!("link: {} is linked twice", end));
            }
        }
    }
}

fn validate_routes(
    config: &Config,
    devices: &BTreeMap<(String, String), bool>,
    namespaces: &BTreeSet<String>,
    result: &mut ValidationResult,
) {
    for route in &config.routes {
        if !namespaces.contains(&route.namespace) {
            result.error(format!(
                "route {}: unknown namespace '{}'",
                route.prefix, route.namespace
            ));
        }
        if route.via.is_none() && route.dev.is_none() {
            result.error(format!(
                "route {} in {}: needs via or dev",
                route.prefix, route.namespace
            ));
        }
        if let Some(dev) = &route.dev {
            if !devices.contains_key(&(route.namespace.clone(), dev.clone())) {
                result.error(format!(
                    "route {} in {}: unknown device '{}'",
                    route.prefix, route.namespace, dev
                ));
            }
        }
        if route.prefix.addr() != route.prefix.network().addr() {
            result.warn(format!(
                "route {} in {}: host bits set, using {}",
                route.prefix,
                route.namespace,
                route.prefix.network()
            ));
        }
    }
}
