//! Route resolution over an immutable, periodically reloaded snapshot
//!
//! The snapshot (running containers plus sorted static routes) is built
//! outside any lock and swapped in under a short write lock. Readers hold
//! the read lock for a single lookup only and never across I/O.

use crate::error::RouteError;
use crate::route_cache::{RouteCache, StaticRouteMatch};
use crate::sshkey;
use crate::store::{Container, RouteData, RouteStore, StaticRoute};
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Default port a container's SSH daemon listens on. Ingress rules
/// targeting it publish SSH for that container on the rule's ingress port.
pub const SSH_TARGET_PORT: u16 = 22;

#[derive(Debug, Default)]
struct Snapshot {
    generation: u64,
    containers: HashMap<String, Container>,
    /// Sorted by host, then descending prefix length; stable for ties
    routes: Vec<StaticRoute>,
    static_hosts: HashSet<String>,
    /// Ingress port -> container publishing SSH there
    ssh_ports: HashMap<u16, String>,
}

impl Snapshot {
    fn build(data: RouteData, generation: u64, ssh_target_port: u16) -> Self {
        let RouteData {
            containers: loaded,
            mut routes,
        } = data;

        routes.sort_by(|a, b| {
            a.host
                .cmp(&b.host)
                .then_with(|| b.path_prefix.len().cmp(&a.path_prefix.len()))
        });
        let static_hosts = routes.iter().map(|r| r.host.clone()).collect();

        let mut containers = HashMap::with_capacity(loaded.len());
        let mut ssh_ports: HashMap<u16, String> = HashMap::new();
        for container in loaded {
            if !container.is_routable() {
                continue;
            }
            let mut ports: Vec<u16> = container
                .port_map
                .iter()
                .filter(|(_, &target)| target == ssh_target_port)
                .map(|(&port, _)| port)
                .collect();
            ports.sort_unstable();
            for port in ports {
                match ssh_ports.get(&port) {
                    Some(owner) => warn!(
                        port,
                        owner = %owner,
                        container_id = %container.id,
                        "SSH ingress port already claimed, ignoring"
                    ),
                    None => {
                        ssh_ports.insert(port, container.id.clone());
                    }
                }
            }
            containers.insert(container.id.clone(), container);
        }

        Self {
            generation,
            containers,
            routes,
            static_hosts,
            ssh_ports,
        }
    }
}

/// Counts from a completed reload
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReloadStats {
    pub generation: u64,
    pub containers: usize,
    pub routes: usize,
}

pub struct Router {
    store: Arc<dyn RouteStore>,
    snapshot: RwLock<Arc<Snapshot>>,
    route_cache: RouteCache,
    /// Serializes load+swap so an older read can never replace a newer one
    reload_gate: Mutex<()>,
    ssh_target_port: u16,
}

impl Router {
    /// Perform the initial load. Failing here is fatal for the gateway.
    pub fn load(store: Arc<dyn RouteStore>, route_cache_capacity: usize) -> Result<Self, RouteError> {
        Self::load_with_ssh_port(store, route_cache_capacity, SSH_TARGET_PORT)
    }

    /// Like [`Router::load`], with containers running sshd on `ssh_target_port`
    pub fn load_with_ssh_port(
        store: Arc<dyn RouteStore>,
        route_cache_capacity: usize,
        ssh_target_port: u16,
    ) -> Result<Self, RouteError> {
        let router = Self {
            store,
            snapshot: RwLock::new(Arc::new(Snapshot::default())),
            route_cache: RouteCache::new(route_cache_capacity),
            reload_gate: Mutex::new(()),
            ssh_target_port,
        };
        let stats = router.reload()?;
        info!(
            containers = stats.containers,
            routes = stats.routes,
            "Initial route snapshot loaded"
        );
        Ok(router)
    }

    /// Rebuild the snapshot from the store. On failure the current snapshot
    /// stays in place.
    pub fn reload(&self) -> Result<ReloadStats, RouteError> {
        let _gate = self.reload_gate.lock();

        let data = self
            .store
            .load()
            .map_err(|e| RouteError::StoreUnavailable(format!("{:#}", e)))?;

        let generation = self.snapshot.read().generation + 1;
        let next = Arc::new(Snapshot::build(data, generation, self.ssh_target_port));
        let stats = ReloadStats {
            generation,
            containers: next.containers.len(),
            routes: next.routes.len(),
        };

        {
            let mut current = self.snapshot.write();
            *current = next;
            self.route_cache.reset(generation);
        }

        debug!(
            generation,
            containers = stats.containers,
            routes = stats.routes,
            "Route snapshot swapped"
        );
        Ok(stats)
    }

    fn current(&self) -> Arc<Snapshot> {
        Arc::clone(&*self.snapshot.read())
    }

    pub fn generation(&self) -> u64 {
        self.snapshot.read().generation
    }

    pub fn container_count(&self) -> usize {
        self.snapshot.read().containers.len()
    }

    pub fn resolve_container(&self, container_id: &str) -> Result<Container, RouteError> {
        self.snapshot
            .read()
            .containers
            .get(container_id)
            .cloned()
            .ok_or_else(|| RouteError::NotFound(container_id.to_string()))
    }

    /// `abc123.cloud.example.com` resolves container `abc123`. Hostnames with
    /// fewer than three labels never resolve.
    pub fn resolve_by_hostname(&self, hostname: &str) -> Result<Container, RouteError> {
        let hostname = normalize_host(hostname);
        let id = container_id_from_hostname(&hostname)
            .ok_or_else(|| RouteError::NotFound(hostname.clone()))?;
        self.resolve_container(id)
    }

    pub fn resolve_ssh(&self, container_id: &str) -> Result<Container, RouteError> {
        let container = self.resolve_container(container_id)?;
        if !container.ssh_enabled {
            return Err(RouteError::blocked(&container.id, "ssh"));
        }
        Ok(container)
    }

    pub fn resolve_https(&self, hostname: &str) -> Result<Container, RouteError> {
        let container = self.resolve_by_hostname(hostname)?;
        if !container.https_enabled {
            return Err(RouteError::blocked(&container.id, "https"));
        }
        Ok(container)
    }

    /// Container plus the target port mapped for `ingress_port`. An unmapped
    /// port means it was never opened for this container.
    pub fn resolve_http(&self, hostname: &str, ingress_port: u16) -> Result<(Container, u16), RouteError> {
        let container = self.resolve_by_hostname(hostname)?;
        match container.target_port(ingress_port) {
            Some(target) => Ok((container, target)),
            None => Err(RouteError::blocked(&container.id, "http")),
        }
    }

    /// SSH has no hostname; the ingress port identifies the container
    pub fn resolve_ssh_port(&self, ingress_port: u16) -> Result<(Container, u16), RouteError> {
        let container_id = self
            .snapshot
            .read()
            .ssh_ports
            .get(&ingress_port)
            .cloned()
            .ok_or_else(|| RouteError::NotFound(format!("ssh port {}", ingress_port)))?;
        let container = self.resolve_ssh(&container_id)?;
        let target = container
            .target_port(ingress_port)
            .unwrap_or(self.ssh_target_port);
        Ok((container, target))
    }

    /// Longest-prefix static route for `host` and `path`, memoized per key
    pub fn resolve_static_route(&self, host: &str, path: &str) -> Result<StaticRouteMatch, RouteError> {
        let host = normalize_host(host);

        if let Some(cached) = self.route_cache.get(&host, path) {
            return cached.ok_or_else(|| RouteError::no_route(&host, path));
        }

        let snapshot = self.current();
        let lookup = snapshot
            .routes
            .iter()
            .find(|r| r.host == host && path.starts_with(&r.path_prefix))
            .map(|route| StaticRouteMatch {
                target_path: target_path(route, path),
                route: route.clone(),
            });
        self.route_cache
            .insert(snapshot.generation, &host, path, lookup.clone());

        lookup.ok_or_else(|| RouteError::no_route(&host, path))
    }

    /// Whether any static route claims `host`, for admission before the
    /// path is known
    pub fn has_static_host(&self, host: &str) -> bool {
        self.snapshot
            .read()
            .static_hosts
            .contains(&normalize_host(host))
    }

    /// Static routes in match order
    pub fn static_routes(&self) -> Vec<StaticRoute> {
        self.current().routes.clone()
    }

    pub fn route_cache_len(&self) -> usize {
        self.route_cache.len()
    }

    /// Whether `public_key` belongs to a user owning the container. Every
    /// failure, including an unparseable key, is a plain rejection.
    pub fn validate_ssh_key(&self, container_id: &str, public_key: &str) -> bool {
        if let Err(e) = self.resolve_ssh(container_id) {
            debug!(container_id, error = %e, "SSH key rejected: container not reachable");
            return false;
        }

        let fingerprint = match sshkey::fingerprint(public_key) {
            Ok(fp) => fp,
            Err(e) => {
                debug!(container_id, error = %e, "SSH key rejected: unparseable key");
                return false;
            }
        };

        match self.store.key_owns_container(container_id, &fingerprint) {
            Ok(owned) => {
                debug!(container_id, fingerprint = %fingerprint, owned, "SSH key ownership checked");
                owned
            }
            Err(e) => {
                warn!(container_id, error = %format!("{:#}", e), "SSH key lookup failed");
                false
            }
        }
    }

    /// Write the route through to the store and reload immediately
    pub fn register_route(&self, route: StaticRoute) -> Result<(), RouteError> {
        validate_route(&route)?;
        self.store
            .upsert_static_route(&route)
            .map_err(|e| RouteError::StoreUnavailable(format!("{:#}", e)))?;
        info!(
            host = %route.host,
            path = %route.path_prefix,
            target = %route.target,
            strip_prefix = route.strip_prefix,
            "Static route registered"
        );
        self.reload().map(|_| ())
    }

    pub fn unregister_route(&self, host: &str, path_prefix: &str) -> Result<(), RouteError> {
        let host = normalize_host(host);
        let removed = self
            .store
            .delete_static_route(&host, path_prefix)
            .map_err(|e| RouteError::StoreUnavailable(format!("{:#}", e)))?;
        if !removed {
            return Err(RouteError::no_route(&host, path_prefix));
        }
        info!(host = %host, path = %path_prefix, "Static route unregistered");
        self.reload().map(|_| ())
    }

    /// Reload on a fixed interval until shutdown. Store errors keep the
    /// previous snapshot and are retried on the next tick.
    pub async fn run_reload_loop(self: Arc<Self>, interval: Duration, mut shutdown_rx: watch::Receiver<bool>) {
        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {
                    let router = Arc::clone(&self);
                    match tokio::task::spawn_blocking(move || router.reload()).await {
                        Ok(Ok(_)) => {}
                        Ok(Err(e)) => error!(error = %e, "Route reload failed, keeping previous snapshot"),
                        Err(e) => error!(error = %e, "Route reload task panicked"),
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        debug!("Route reload loop stopping");
                        break;
                    }
                }
            }
        }
    }
}

/// Lowercase and drop a trailing dot
pub fn normalize_host(host: &str) -> String {
    host.trim_end_matches('.').to_ascii_lowercase()
}

/// Leading label of an `id.domain.tld` hostname
pub fn container_id_from_hostname(hostname: &str) -> Option<&str> {
    let labels: Vec<&str> = hostname.split('.').collect();
    if labels.len() < 3 || labels.iter().any(|l| l.is_empty()) {
        return None;
    }
    Some(labels[0])
}

fn target_path(route: &StaticRoute, path: &str) -> String {
    if !route.strip_prefix || route.path_prefix == "/" {
        return path.to_string();
    }
    match &path[route.path_prefix.len()..] {
        "" => "/".to_string(),
        rest if rest.starts_with('/') => rest.to_string(),
        rest => format!("/{}", rest),
    }
}

fn validate_route(route: &StaticRoute) -> Result<(), RouteError> {
    if route.host.is_empty() {
        return Err(RouteError::MalformedRequest("route host is empty".into()));
    }
    if !route.path_prefix.starts_with('/') {
        return Err(RouteError::MalformedRequest(format!(
            "route path '{}' must start with '/'",
            route.path_prefix
        )));
    }
    if route.target.is_empty() {
        return Err(RouteError::MalformedRequest("route target is empty".into()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{ContainerRecord, Database};
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    fn record(id: &str, ssh: bool, https: bool) -> ContainerRecord {
        ContainerRecord {
            id: id.to_string(),
            namespace: format!("ns-{}", id),
            external_ip: Some("10.0.0.5".to_string()),
            status: "running".to_string(),
            ssh_enabled: ssh,
            https_enabled: https,
            owner_id: Some("alice".to_string()),
        }
    }

    fn setup() -> (Arc<Database>, Router) {
        let db = Arc::new(Database::open_in_memory().unwrap());
        let router = Router::load(db.clone(), 100).unwrap();
        (db, router)
    }

    /// Store wrapper that can be switched into failure mode
    struct FlakyStore {
        inner: Database,
        failing: AtomicBool,
        loads: AtomicUsize,
    }

    impl RouteStore for FlakyStore {
        fn load(&self) -> anyhow::Result<RouteData> {
            self.loads.fetch_add(1, Ordering::SeqCst);
            if self.failing.load(Ordering::SeqCst) {
                anyhow::bail!("connection refused");
            }
            self.inner.load()
        }
        fn upsert_static_route(&self, route: &StaticRoute) -> anyhow::Result<()> {
            RouteStore::upsert_static_route(&self.inner, route)
        }
        fn delete_static_route(&self, host: &str, path_prefix: &str) -> anyhow::Result<bool> {
            RouteStore::delete_static_route(&self.inner, host, path_prefix)
        }
        fn key_owns_container(&self, container_id: &str, fingerprint: &str) -> anyhow::Result<bool> {
            self.inner.key_owns_container(container_id, fingerprint)
        }
    }

    #[test]
    fn test_container_id_from_hostname() {
        assert_eq!(container_id_from_hostname("abc123.cloud.example.com"), Some("abc123"));
        assert_eq!(container_id_from_hostname("abc.example.com"), Some("abc"));
        assert_eq!(container_id_from_hostname("example.com"), None);
        assert_eq!(container_id_from_hostname("localhost"), None);
        assert_eq!(container_id_from_hostname(".example.com"), None);
    }

    #[test]
    fn test_resolve_by_hostname() {
        let (db, router) = setup();
        db.upsert_container(&record("abc123", true, true)).unwrap();
        router.reload().unwrap();

        let c = router.resolve_by_hostname("ABC123.cloud.example.com.").unwrap();
        assert_eq!(c.id, "abc123");
        assert!(matches!(
            router.resolve_by_hostname("abc123.example"),
            Err(RouteError::NotFound(_))
        ));
        assert!(matches!(
            router.resolve_by_hostname("zzz.cloud.example.com"),
            Err(RouteError::NotFound(_))
        ));
    }

    #[test]
    fn test_stopped_container_disappears_after_reload() {
        let (db, router) = setup();
        db.upsert_container(&record("abc123", true, true)).unwrap();
        router.reload().unwrap();
        assert!(router.resolve_by_hostname("abc123.cloud.example.com").is_ok());

        db.set_container_status("abc123", "stopped").unwrap();
        router.reload().unwrap();
        assert!(matches!(
            router.resolve_by_hostname("abc123.cloud.example.com"),
            Err(RouteError::NotFound(_))
        ));

        let mut no_ip = record("abc123", true, true);
        no_ip.external_ip = None;
        db.upsert_container(&no_ip).unwrap();
        router.reload().unwrap();
        assert!(router.resolve_container("abc123").is_err());
    }

    #[test]
    fn test_protocol_gates() {
        let (db, router) = setup();
        db.upsert_container(&record("sshonly", true, false)).unwrap();
        db.upsert_container(&record("webonly", false, true)).unwrap();
        router.reload().unwrap();

        assert!(router.resolve_ssh("sshonly").is_ok());
        assert!(matches!(
            router.resolve_ssh("webonly"),
            Err(RouteError::ProtocolBlocked { protocol: "ssh", .. })
        ));
        assert!(router.resolve_https("webonly.cloud.example.com").is_ok());
        assert!(matches!(
            router.resolve_https("sshonly.cloud.example.com"),
            Err(RouteError::ProtocolBlocked { protocol: "https", .. })
        ));
        assert!(matches!(router.resolve_ssh("ghost"), Err(RouteError::NotFound(_))));
    }

    #[test]
    fn test_resolve_http_port_mapping() {
        let (db, router) = setup();
        db.upsert_container(&record("abc123", false, false)).unwrap();
        db.add_ingress_rule("abc123", 8080, 3000).unwrap();
        router.reload().unwrap();

        let (c, port) = router.resolve_http("abc123.cloud.example.com", 8080).unwrap();
        assert_eq!(c.id, "abc123");
        assert_eq!(port, 3000);

        // An unmapped ingress port is blocked, not missing
        assert!(matches!(
            router.resolve_http("abc123.cloud.example.com", 8081),
            Err(RouteError::ProtocolBlocked { .. })
        ));
    }

    #[test]
    fn test_resolve_ssh_port_convention() {
        let (db, router) = setup();
        db.upsert_container(&record("first", true, false)).unwrap();
        db.upsert_container(&record("second", true, false)).unwrap();
        db.upsert_container(&record("locked", false, false)).unwrap();
        db.add_ingress_rule("first", 8022, 22).unwrap();
        db.add_ingress_rule("second", 8022, 22).unwrap();
        db.add_ingress_rule("locked", 8023, 22).unwrap();
        router.reload().unwrap();

        let (c, port) = router.resolve_ssh_port(8022).unwrap();
        assert_eq!(c.id, "first");
        assert_eq!(port, 22);
        assert!(matches!(
            router.resolve_ssh_port(8023),
            Err(RouteError::ProtocolBlocked { .. })
        ));
        assert!(matches!(router.resolve_ssh_port(9999), Err(RouteError::NotFound(_))));
    }

    #[test]
    fn test_custom_ssh_target_port() {
        let db = Arc::new(Database::open_in_memory().unwrap());
        let router = Router::load_with_ssh_port(db.clone(), 100, 2200).unwrap();
        db.upsert_container(&record("abc", true, false)).unwrap();
        db.add_ingress_rule("abc", 8022, 2200).unwrap();
        db.add_ingress_rule("abc", 8023, 22).unwrap();
        router.reload().unwrap();

        let (c, port) = router.resolve_ssh_port(8022).unwrap();
        assert_eq!(c.id, "abc");
        assert_eq!(port, 2200);
        assert!(matches!(router.resolve_ssh_port(8023), Err(RouteError::NotFound(_))));
    }

    #[test]
    fn test_longest_prefix_wins() {
        let (_db, router) = setup();
        router.register_route(StaticRoute::new("api.example.com", "/", "root:80", false)).unwrap();
        router.register_route(StaticRoute::new("api.example.com", "/api/v2", "v2:80", false)).unwrap();
        router.register_route(StaticRoute::new("api.example.com", "/api", "api:80", false)).unwrap();

        let m = router.resolve_static_route("api.example.com", "/api/v2/x").unwrap();
        assert_eq!(m.route.path_prefix, "/api/v2");
        assert_eq!(m.route.target, "v2:80");

        let m = router.resolve_static_route("api.example.com", "/api/v1").unwrap();
        assert_eq!(m.route.path_prefix, "/api");

        let m = router.resolve_static_route("api.example.com", "/other").unwrap();
        assert_eq!(m.route.path_prefix, "/");
    }

    #[test]
    fn test_routes_sorted_by_host_then_prefix_length() {
        let (_db, router) = setup();
        router.register_route(StaticRoute::new("b.example.com", "/", "b:80", false)).unwrap();
        router.register_route(StaticRoute::new("a.example.com", "/x", "a1:80", false)).unwrap();
        router.register_route(StaticRoute::new("a.example.com", "/long", "a2:80", false)).unwrap();
        router.register_route(StaticRoute::new("a.example.com", "/y", "a3:80", false)).unwrap();

        let order: Vec<_> = router
            .static_routes()
            .into_iter()
            .map(|r| r.target)
            .collect();
        // Equal-length prefixes keep registration order
        assert_eq!(order, vec!["a2:80", "a1:80", "a3:80", "b:80"]);
    }

    #[test]
    fn test_host_must_match_exactly() {
        let (_db, router) = setup();
        router.register_route(StaticRoute::new("api.example.com", "/", "svc:80", false)).unwrap();
        assert!(matches!(
            router.resolve_static_route("www.example.com", "/"),
            Err(RouteError::NoRoute { .. })
        ));
        assert!(router.resolve_static_route("API.example.com", "/").is_ok());
        assert!(router.has_static_host("api.example.com"));
        assert!(!router.has_static_host("www.example.com"));
    }

    #[test]
    fn test_strip_prefix_target_path() {
        let (_db, router) = setup();
        router.register_route(StaticRoute::new("api.example.com", "/v1", "svc:80", true)).unwrap();
        router.register_route(StaticRoute::new("api.example.com", "/keep", "svc:80", false)).unwrap();
        router.register_route(StaticRoute::new("root.example.com", "/", "svc:80", true)).unwrap();

        let m = router.resolve_static_route("api.example.com", "/v1/users").unwrap();
        assert_eq!(m.target_path, "/users");
        let m = router.resolve_static_route("api.example.com", "/v1").unwrap();
        assert_eq!(m.target_path, "/");
        let m = router.resolve_static_route("api.example.com", "/keep/a").unwrap();
        assert_eq!(m.target_path, "/keep/a");
        let m = router.resolve_static_route("root.example.com", "/a/b").unwrap();
        assert_eq!(m.target_path, "/a/b");
    }

    #[test]
    fn test_misses_are_memoized_and_invalidated_on_register() {
        let (_db, router) = setup();
        assert!(router.resolve_static_route("api.example.com", "/v1/x").is_err());
        assert_eq!(router.route_cache_len(), 1);

        router.register_route(StaticRoute::new("api.example.com", "/v1", "svc:80", true)).unwrap();
        assert_eq!(router.route_cache_len(), 0);

        let m = router.resolve_static_route("api.example.com", "/v1/x").unwrap();
        assert_eq!(m.route.target, "svc:80");
    }

    #[test]
    fn test_unregister_invalidates_cached_hit() {
        let (_db, router) = setup();
        router.register_route(StaticRoute::new("api.example.com", "/v1", "svc:80", false)).unwrap();
        assert!(router.resolve_static_route("api.example.com", "/v1/x").is_ok());

        router.unregister_route("api.example.com", "/v1").unwrap();
        assert!(matches!(
            router.resolve_static_route("api.example.com", "/v1/x"),
            Err(RouteError::NoRoute { .. })
        ));
        assert!(matches!(
            router.unregister_route("api.example.com", "/v1"),
            Err(RouteError::NoRoute { .. })
        ));
    }

    #[test]
    fn test_scheduled_reload_invalidates_cache() {
        let (db, router) = setup();
        assert!(router.resolve_static_route("api.example.com", "/").is_err());

        // Written behind the router's back, picked up by the next reload
        db.save_static_route(&crate::db::StaticRouteRecord {
            host: "api.example.com".into(),
            path_prefix: "/".into(),
            target: "svc:80".into(),
            strip_prefix: false,
            priority: 0,
        })
        .unwrap();
        assert!(router.resolve_static_route("api.example.com", "/").is_err());

        router.reload().unwrap();
        assert!(router.resolve_static_route("api.example.com", "/").is_ok());
    }

    #[test]
    fn test_register_rejects_invalid_routes() {
        let (_db, router) = setup();
        assert!(matches!(
            router.register_route(StaticRoute::new("", "/", "svc:80", false)),
            Err(RouteError::MalformedRequest(_))
        ));
        assert!(matches!(
            router.register_route(StaticRoute::new("a.example.com", "v1", "svc:80", false)),
            Err(RouteError::MalformedRequest(_))
        ));
        assert!(router.static_routes().is_empty());
    }

    #[test]
    fn test_failed_reload_keeps_snapshot() {
        let store = Arc::new(FlakyStore {
            inner: Database::open_in_memory().unwrap(),
            failing: AtomicBool::new(false),
            loads: AtomicUsize::new(0),
        });
        store.inner.upsert_container(&record("abc123", true, true)).unwrap();
        let router = Router::load(store.clone(), 10).unwrap();
        let generation = router.generation();

        store.failing.store(true, Ordering::SeqCst);
        assert!(matches!(router.reload(), Err(RouteError::StoreUnavailable(_))));
        assert_eq!(router.generation(), generation);
        assert!(router.resolve_container("abc123").is_ok());
    }

    #[test]
    fn test_initial_load_failure_is_an_error() {
        let store = Arc::new(FlakyStore {
            inner: Database::open_in_memory().unwrap(),
            failing: AtomicBool::new(true),
            loads: AtomicUsize::new(0),
        });
        assert!(Router::load(store, 10).is_err());
    }

    #[test]
    fn test_validate_ssh_key() {
        let (db, router) = setup();
        db.upsert_container(&record("abc123", true, false)).unwrap();
        db.upsert_container(&record("nossh", false, false)).unwrap();
        let key = "ssh-ed25519 AAAAC3NzaC1lZDI1NTE5AAAAIAECAwQFBgcICQoLDA0ODxAREhMUFRYXGBkaGxwdHh8g alice";
        db.add_ssh_key("alice", key).unwrap();
        router.reload().unwrap();

        assert!(router.validate_ssh_key("abc123", key));
        assert!(!router.validate_ssh_key("nossh", key));
        assert!(!router.validate_ssh_key("ghost", key));
        assert!(!router.validate_ssh_key("abc123", "garbage"));
    }

    #[tokio::test]
    async fn test_reload_loop_picks_up_changes_and_stops() {
        let db = Arc::new(Database::open_in_memory().unwrap());
        let router = Arc::new(Router::load(db.clone(), 10).unwrap());
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let handle = tokio::spawn(Arc::clone(&router).run_reload_loop(Duration::from_millis(20), shutdown_rx));

        db.upsert_container(&record("late", true, true)).unwrap();
        let mut found = false;
        for _ in 0..100 {
            if router.resolve_container("late").is_ok() {
                found = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(found, "reload loop should pick up the new container");

        shutdown_tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .expect("reload loop should stop on shutdown")
            .unwrap();
    }
}
