//! Route store adapter
//!
//! Turns container, ingress-rule and static-route rows into the values the
//! router snapshots. The router only ever talks to a [`RouteStore`], so the
//! relational backend can be swapped in tests.

use crate::db::{ContainerRecord, Database, IngressRuleRecord, StaticRouteRecord};
use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::warn;

/// Status a container must report to be routable
pub const RUNNING: &str = "running";

/// A routable user container
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Container {
    pub id: String,
    pub namespace: String,
    pub external_ip: String,
    pub status: String,
    pub ssh_enabled: bool,
    pub https_enabled: bool,
    pub owner_id: Option<String>,
    /// Ingress port -> target port
    pub port_map: HashMap<u16, u16>,
}

impl Container {
    pub fn is_routable(&self) -> bool {
        self.status == RUNNING && !self.external_ip.is_empty()
    }

    pub fn target_port(&self, ingress_port: u16) -> Option<u16> {
        self.port_map.get(&ingress_port).copied()
    }
}

/// An administrator-configured path-prefix route
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StaticRoute {
    pub host: String,
    pub path_prefix: String,
    pub target: String,
    pub strip_prefix: bool,
    pub priority: i64,
}

impl StaticRoute {
    pub fn new(host: &str, path_prefix: &str, target: &str, strip_prefix: bool) -> Self {
        Self {
            host: host.to_ascii_lowercase(),
            path_prefix: path_prefix.to_string(),
            target: target.to_string(),
            strip_prefix,
            priority: Self::priority_for(path_prefix),
        }
    }

    /// Longer prefixes rank higher; the bare root ranks lowest
    pub fn priority_for(path_prefix: &str) -> i64 {
        if path_prefix == "/" {
            0
        } else {
            path_prefix.len() as i64 * 10
        }
    }
}

/// One consistent read of the store
#[derive(Debug, Clone, Default)]
pub struct RouteData {
    pub containers: Vec<Container>,
    /// Load order, unsorted
    pub routes: Vec<StaticRoute>,
}

/// Backing store consumed by the router
pub trait RouteStore: Send + Sync {
    /// Running containers with their port maps, plus all static routes
    fn load(&self) -> Result<RouteData>;

    /// Insert or update the route keyed by `(host, path_prefix)`
    fn upsert_static_route(&self, route: &StaticRoute) -> Result<()>;

    /// Returns false when no such route existed
    fn delete_static_route(&self, host: &str, path_prefix: &str) -> Result<bool>;

    /// Whether the key fingerprint belongs to the user owning the container
    fn key_owns_container(&self, container_id: &str, fingerprint: &str) -> Result<bool>;
}

impl RouteStore for Database {
    fn load(&self) -> Result<RouteData> {
        let rows = self.read_routing_state()?;

        Ok(RouteData {
            containers: assemble_containers(rows.containers, rows.ingress_rules),
            routes: rows.static_routes.into_iter().map(StaticRoute::from).collect(),
        })
    }

    fn upsert_static_route(&self, route: &StaticRoute) -> Result<()> {
        self.save_static_route(&StaticRouteRecord::from(route))
    }

    fn delete_static_route(&self, host: &str, path_prefix: &str) -> Result<bool> {
        self.remove_static_route(host, path_prefix)
    }

    fn key_owns_container(&self, container_id: &str, fingerprint: &str) -> Result<bool> {
        self.ssh_key_owns_container(container_id, fingerprint)
    }
}

/// Attach ingress rules to their containers, dropping anything not routable
fn assemble_containers(
    records: Vec<ContainerRecord>,
    rules: Vec<IngressRuleRecord>,
) -> Vec<Container> {
    let mut port_maps: HashMap<String, HashMap<u16, u16>> = HashMap::new();
    for rule in rules {
        let (Ok(port), Ok(target)) = (u16::try_from(rule.port), u16::try_from(rule.target_port))
        else {
            warn!(
                container_id = %rule.container_id,
                port = rule.port,
                target_port = rule.target_port,
                "Skipping ingress rule with out-of-range port"
            );
            continue;
        };
        port_maps
            .entry(rule.container_id)
            .or_default()
            .insert(port, target);
    }

    records
        .into_iter()
        .map(|record| Container {
            port_map: port_maps.remove(&record.id).unwrap_or_default(),
            id: record.id,
            namespace: record.namespace,
            external_ip: record.external_ip.unwrap_or_default(),
            status: record.status,
            ssh_enabled: record.ssh_enabled,
            https_enabled: record.https_enabled,
            owner_id: record.owner_id,
        })
        .filter(Container::is_routable)
        .collect()
}

impl From<StaticRouteRecord> for StaticRoute {
    fn from(record: StaticRouteRecord) -> Self {
        Self {
            host: record.host,
            path_prefix: record.path_prefix,
            target: record.target,
            strip_prefix: record.strip_prefix,
            priority: record.priority,
        }
    }
}

impl From<&StaticRoute> for StaticRouteRecord {
    fn from(route: &StaticRoute) -> Self {
        Self {
            host: route.host.clone(),
            path_prefix: route.path_prefix.clone(),
            target: route.target.clone(),
            strip_prefix: route.strip_prefix,
            priority: route.priority,
        }
    }
}
