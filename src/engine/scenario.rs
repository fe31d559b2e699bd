//! Build an engine from a scenario file

use super::Engine;
use crate::config::{validate, Config, Endpoint};
use crate::dataplane::RouteSpec;
use crate::topology::{BridgeId, InterfaceId, LinkState, NamespaceId};
use crate::{Error, Result};
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::{info, warn};

/// Configured names mapped to the ids they were given
#[derive(Debug, Clone, Default)]
pub struct Names {
    namespaces: BTreeMap<String, NamespaceId>,
    interfaces: BTreeMap<(String, String), InterfaceId>,
    bridges: BTreeMap<(String, String), BridgeId>,
}

impl Names {
    pub fn namespace(&self, name: &str) -> Result<NamespaceId> {
        self.namespaces
            .get(name)
            .copied()
            .ok_or_else(|| Error::Config(format!("unknown namespace '{}'", name)))
    }

    /// Interface (or bridge device) `name` in namespace `ns`
    pub fn interface(&self, ns: &str, name: &str) -> Result<InterfaceId> {
        self.interfaces
            .get(&(ns.to_string(), name.to_string()))
            .copied()
            .ok_or_else(|| Error::Config(format!("unknown interface {}/{}", ns, name)))
    }

    pub fn endpoint(&self, end: &Endpoint) -> Result<InterfaceId> {
        self.interface(&end.namespace, &end.interface)
    }

    pub fn bridge(&self, ns: &str, name: &str) -> Result<BridgeId> {
        self.bridges
            .get(&(ns.to_string(), name.to_string()))
            .copied()
            .ok_or_else(|| Error::Config(format!("unknown bridge {}/{}", ns, name)))
    }
}

impl Engine {
    /// Validate `config` and build everything it describes
    ///
    /// Order matters for the topology rules: namespaces, bridges,
    /// interfaces (enslaved as they are created), links, addresses, link
    /// state, then routes, which need their connected prefixes in place.
    pub fn from_config(config: &Config) -> Result<(Engine, Names)> {
        let result = validate(config);
        for warning in &result.warnings {
            warn!("{}", warning);
        }
        if result.has_errors() {
            return Err(Error::Config(result.errors.join("; ")));
        }

        let engine = Engine::new(config.engine.to_engine_config());
        let mut names = Names::default();

        for ns in &config.namespaces {
            let id = engine.create_namespace(&ns.name)?;
            engine.set_forwarding(id, ns.forwarding)?;
            engine.set_rp_filter(id, ns.rp_filter)?;
            names.namespaces.insert(ns.name.clone(), id);
        }

        for br in &config.bridges {
            let ns = names.namespace(&br.namespace)?;
            let id = engine.create_bridge(ns, &br.name)?;
            if let Some(ms) = br.ageing_time_ms {
                engine.set_bridge_ageing_time(id, Duration::from_millis(ms))?;
            }
            let key = (br.namespace.clone(), br.name.clone());
            names.interfaces.insert(key.clone(), engine.bridge_interface(id)?);
            names.bridges.insert(key, id);
        }

        for iface in &config.interfaces {
            let ns = names.namespace(&iface.namespace)?;
            let id = engine.create_interface(ns, &iface.name)?;
            if let Some(mac) = iface.mac {
                engine.set_mac(id, mac)?;
            }
            if iface.masquerade {
                engine.set_masquerade(id, true)?;
            }
            if let Some(bridge) = &iface.bridge {
                engine.attach_to_bridge(id, names.bridge(&iface.namespace, bridge)?)?;
            }
            names
                .interfaces
                .insert((iface.namespace.clone(), iface.name.clone()), id);
        }

        for link in &config.links {
            engine.create_link(names.endpoint(&link.a)?, names.endpoint(&link.b)?)?;
        }

        for br in &config.bridges {
            let id = names.interface(&br.namespace, &br.name)?;
            for cidr in &br.addresses {
                engine.assign_address(id, *cidr)?;
            }
        }
        for iface in &config.interfaces {
            let id = names.interface(&iface.namespace, &iface.name)?;
            for cidr in &iface.addresses {
                engine.assign_address(id, *cidr)?;
            }
        }

        for br in config.bridges.iter().filter(|b| b.up) {
            engine.set_interface_state(names.interface(&br.namespace, &br.name)?, LinkState::Up)?;
        }
        for iface in config.interfaces.iter().filter(|i| i.up) {
            engine.set_interface_state(
                names.interface(&iface.namespace, &iface.name)?,
                LinkState::Up,
            )?;
        }

        for route in &config.routes {
            let ns = names.namespace(&route.namespace)?;
            let dev = route
                .dev
                .as_deref()
                .map(|dev| names.interface(&route.namespace, dev))
                .transpose()?;
            let spec = RouteSpec {
                prefix: route.prefix,
                via: route.via,
                dev,
                metric: route.metric,
            };
            engine.add_route(ns, spec)?;
        }

        info!(
            "Scenario loaded: {} namespaces, {} interfaces, {} links, {} bridges, {} routes",
            config.namespaces.len(),
            config.interfaces.len(),
            config.links.len(),
            config.bridges.len(),
            config.routes.len()
        );
        Ok((engine, names))
    }
}
