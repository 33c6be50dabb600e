//! Ordered backend resolution for HTTP and TLS-terminated requests
//!
//! Static routes are tried first, then containers, then the fallback
//! upstream. A strategy either matches, passes, or rejects; a rejection
//! stops the chain.

use crate::error::RouteError;
use crate::router::Router;
use crate::store::{Container, StaticRoute};
use tracing::debug;

/// Where a request should go
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    Static {
        route: StaticRoute,
        /// `host:port` to dial
        backend: String,
        target_path: String,
    },
    Container {
        container: Container,
        backend: String,
    },
    Fallback {
        backend: String,
    },
}

impl Target {
    pub fn backend(&self) -> &str {
        match self {
            Target::Static { backend, .. }
            | Target::Container { backend, .. }
            | Target::Fallback { backend } => backend,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Target::Static { .. } => "static",
            Target::Container { .. } => "container",
            Target::Fallback { .. } => "fallback",
        }
    }
}

/// Outcome of one strategy
#[derive(Debug)]
pub enum Resolution {
    Matched(Target),
    NoMatch,
    Rejected(RouteError),
}

/// Routing key of one request
#[derive(Debug, Clone, Copy)]
pub struct RouteRequest<'a> {
    /// Normalized host without port
    pub host: &'a str,
    /// Path without query
    pub path: &'a str,
    /// Gateway port the connection arrived on
    pub ingress_port: u16,
    /// Whether the gateway terminated TLS for this connection
    pub tls_terminated: bool,
}

pub trait Resolver: Send + Sync {
    fn name(&self) -> &'static str;

    fn resolve(&self, router: &Router, req: &RouteRequest<'_>) -> Resolution;
}

/// Turn a router result into a chain outcome; misses fall through
fn outcome<T>(result: Result<T, RouteError>, matched: impl FnOnce(T) -> Target) -> Resolution {
    match result {
        Ok(value) => Resolution::Matched(matched(value)),
        Err(e) if e.is_miss() => Resolution::NoMatch,
        Err(e) => Resolution::Rejected(e),
    }
}

pub struct StaticRouteResolver;

impl Resolver for StaticRouteResolver {
    fn name(&self) -> &'static str {
        "static"
    }

    fn resolve(&self, router: &Router, req: &RouteRequest<'_>) -> Resolution {
        outcome(router.resolve_static_route(req.host, req.path), |m| {
            Target::Static {
                backend: m.route.target.clone(),
                target_path: m.target_path,
                route: m.route,
            }
        })
    }
}

pub struct ContainerResolver {
    host_template: String,
    /// Backend port for terminated TLS when the container maps no 443
    https_port: u16,
}

impl ContainerResolver {
    pub fn new(host_template: impl Into<String>, https_port: u16) -> Self {
        Self {
            host_template: host_template.into(),
            https_port,
        }
    }

    pub fn backend_addr(&self, container: &Container, port: u16) -> String {
        format!("{}:{}", container_host(&self.host_template, container), port)
    }
}

impl Resolver for ContainerResolver {
    fn name(&self) -> &'static str {
        "container"
    }

    fn resolve(&self, router: &Router, req: &RouteRequest<'_>) -> Resolution {
        let result = if req.tls_terminated {
            router.resolve_https(req.host).map(|c| {
                let port = c.target_port(443).unwrap_or(self.https_port);
                (c, port)
            })
        } else {
            router.resolve_http(req.host, req.ingress_port)
        };

        outcome(result, |(container, port)| Target::Container {
            backend: self.backend_addr(&container, port),
            container,
        })
    }
}

/// Catch-all upstream, dialed on the request's own ingress port
pub struct FallbackResolver {
    upstream: String,
}

impl FallbackResolver {
    pub fn new(upstream: impl Into<String>) -> Self {
        Self {
            upstream: upstream.into(),
        }
    }
}

impl Resolver for FallbackResolver {
    fn name(&self) -> &'static str {
        "fallback"
    }

    fn resolve(&self, _router: &Router, req: &RouteRequest<'_>) -> Resolution {
        Resolution::Matched(Target::Fallback {
            backend: format!("{}:{}", self.upstream, req.ingress_port),
        })
    }
}

pub struct ResolverChain {
    resolvers: Vec<Box<dyn Resolver>>,
}

impl ResolverChain {
    pub fn new(resolvers: Vec<Box<dyn Resolver>>) -> Self {
        Self { resolvers }
    }

    /// Static routes, containers, then the fallback when one is configured
    pub fn standard(host_template: &str, container_https_port: u16, fallback: Option<&str>) -> Self {
        let mut resolvers: Vec<Box<dyn Resolver>> = vec![
            Box::new(StaticRouteResolver),
            Box::new(ContainerResolver::new(host_template, container_https_port)),
        ];
        if let Some(upstream) = fallback {
            resolvers.push(Box::new(FallbackResolver::new(upstream)));
        }
        Self::new(resolvers)
    }

    pub fn has_fallback(&self) -> bool {
        self.resolvers.iter().any(|r| r.name() == "fallback")
    }

    pub fn resolve(&self, router: &Router, req: &RouteRequest<'_>) -> Result<Target, RouteError> {
        for resolver in &self.resolvers {
            match resolver.resolve(router, req) {
                Resolution::Matched(target) => {
                    debug!(
                        host = req.host,
                        path = req.path,
                        resolver = resolver.name(),
                        backend = target.backend(),
                        "Request resolved"
                    );
                    return Ok(target);
                }
                Resolution::NoMatch => continue,
                Resolution::Rejected(e) => return Err(e),
            }
        }
        Err(RouteError::no_route(req.host, req.path))
    }

    /// Pre-handshake check for a TLS server name: whether anything would
    /// accept a request for this host once TLS is terminated
    pub fn admit_tls(&self, router: &Router, server_name: &str) -> Result<(), RouteError> {
        if router.has_static_host(server_name) {
            return Ok(());
        }
        match router.resolve_https(server_name) {
            Ok(_) => Ok(()),
            Err(e) if e.is_miss() && self.has_fallback() => Ok(()),
            Err(e) => Err(e),
        }
    }
}

/// Backend host for a container: `template` with `{id}`, `{namespace}` and
/// `{external_ip}` substituted
pub fn container_host(template: &str, container: &Container) -> String {
    template
        .replace("{id}", &container.id)
        .replace("{namespace}", &container.namespace)
        .replace("{external_ip}", &container.external_ip)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{ContainerRecord, Database};
    use std::sync::Arc;

    const TEMPLATE: &str = "{id}.{namespace}.svc.cluster.local";

    fn setup() -> (Arc<Database>, Router) {
        let db = Arc::new(Database::open_in_memory().unwrap());
        db.upsert_container(&ContainerRecord {
            id: "abc123".into(),
            namespace: "user-7".into(),
            external_ip: Some("10.0.0.5".into()),
            status: "running".into(),
            ssh_enabled: true,
            https_enabled: false,
            owner_id: None,
        })
        .unwrap();
        db.add_ingress_rule("abc123", 8080, 3000).unwrap();
        db.add_ingress_rule("abc123", 80, 8000).unwrap();
        let router = Router::load(db.clone(), 100).unwrap();
        (db, router)
    }

    fn request<'a>(host: &'a str, path: &'a str, port: u16, tls: bool) -> RouteRequest<'a> {
        RouteRequest {
            host,
            path,
            ingress_port: port,
            tls_terminated: tls,
        }
    }

    #[test]
    fn test_container_host_template() {
        let (_db, router) = setup();
        let c = router.resolve_container("abc123").unwrap();
        assert_eq!(container_host(TEMPLATE, &c), "abc123.user-7.svc.cluster.local");
        assert_eq!(container_host("{external_ip}", &c), "10.0.0.5");
    }

    #[test]
    fn test_container_resolution_on_ingress_port() {
        let (_db, router) = setup();
        let chain = ResolverChain::standard(TEMPLATE, 80, None);
        let target = chain
            .resolve(&router, &request("abc123.cloud.example.com", "/", 8080, false))
            .unwrap();
        assert_eq!(target.kind(), "container");
        assert_eq!(target.backend(), "abc123.user-7.svc.cluster.local:3000");
    }

    #[test]
    fn test_static_routes_preempt_containers() {
        let (_db, router) = setup();
        router
            .register_route(StaticRoute::new("abc123.cloud.example.com", "/", "core:80", false))
            .unwrap();
        let chain = ResolverChain::standard(TEMPLATE, 80, None);
        let target = chain
            .resolve(&router, &request("abc123.cloud.example.com", "/", 8080, false))
            .unwrap();
        assert_eq!(target.kind(), "static");
        assert_eq!(target.backend(), "core:80");
    }

    #[test]
    fn test_blocked_does_not_fall_through() {
        let (_db, router) = setup();
        let chain = ResolverChain::standard(TEMPLATE, 80, Some("core-web"));

        // Port 9000 is not mapped for the container
        let err = chain
            .resolve(&router, &request("abc123.cloud.example.com", "/", 9000, false))
            .unwrap_err();
        assert!(matches!(err, RouteError::ProtocolBlocked { .. }));

        let err = chain
            .resolve(&router, &request("abc123.cloud.example.com", "/", 443, true))
            .unwrap_err();
        assert!(matches!(err, RouteError::ProtocolBlocked { protocol: "https", .. }));
    }

    #[test]
    fn test_fallback_uses_ingress_port() {
        let (_db, router) = setup();
        let chain = ResolverChain::standard(TEMPLATE, 80, Some("core-web"));
        let target = chain
            .resolve(&router, &request("unknown.example.com", "/", 8123, false))
            .unwrap();
        assert_eq!(target, Target::Fallback { backend: "core-web:8123".into() });
    }

    #[test]
    fn test_no_match_without_fallback() {
        let (_db, router) = setup();
        let chain = ResolverChain::standard(TEMPLATE, 80, None);
        let err = chain
            .resolve(&router, &request("example.com", "/x", 80, false))
            .unwrap_err();
        assert!(matches!(err, RouteError::NoRoute { .. }));
    }

    #[test]
    fn test_terminated_tls_uses_https_port() {
        let (db, router) = setup();
        db.upsert_container(&ContainerRecord {
            id: "web1".into(),
            namespace: "user-8".into(),
            external_ip: Some("10.0.0.6".into()),
            status: "running".into(),
            ssh_enabled: false,
            https_enabled: true,
            owner_id: None,
        })
        .unwrap();
        router.reload().unwrap();

        let chain = ResolverChain::standard(TEMPLATE, 8080, None);
        let target = chain
            .resolve(&router, &request("web1.cloud.example.com", "/", 443, true))
            .unwrap();
        assert_eq!(target.backend(), "web1.user-8.svc.cluster.local:8080");

        db.add_ingress_rule("web1", 443, 8443).unwrap();
        router.reload().unwrap();
        let target = chain
            .resolve(&router, &request("web1.cloud.example.com", "/", 443, true))
            .unwrap();
        assert_eq!(target.backend(), "web1.user-8.svc.cluster.local:8443");
    }

    #[test]
    fn test_admit_tls() {
        let (_db, router) = setup();
        router
            .register_route(StaticRoute::new("api.example.com", "/v1", "svc:80", true))
            .unwrap();

        let strict = ResolverChain::standard(TEMPLATE, 80, None);
        assert!(strict.admit_tls(&router, "api.example.com").is_ok());
        assert!(matches!(
            strict.admit_tls(&router, "abc123.cloud.example.com"),
            Err(RouteError::ProtocolBlocked { .. })
        ));
        assert!(strict.admit_tls(&router, "nobody.cloud.example.com").is_err());

        let lenient = ResolverChain::standard(TEMPLATE, 80, Some("core-web"));
        assert!(lenient.admit_tls(&router, "nobody.cloud.example.com").is_ok());
        assert!(lenient.admit_tls(&router, "abc123.cloud.example.com").is_err());
    }
}
