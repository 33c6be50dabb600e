use cloudgate::admin::{AdminScope, AdminServer, AdminState, PKG_NAME, VERSION};
use cloudgate::config::Config;
use cloudgate::db::Database;
use cloudgate::proxy::{Gateway, ListenerKind, ProxyServer, ProxySettings};
use cloudgate::resolve::ResolverChain;
use cloudgate::response_cache::ResponseCache;
use cloudgate::router::Router;
use cloudgate::store::RouteStore;
use cloudgate::tls;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("cloudgate=info".parse().expect("valid log directive")),
        )
        .init();

    // Load configuration
    let explicit_path = std::env::args().nth(1).map(PathBuf::from);
    let config_path = explicit_path
        .clone()
        .unwrap_or_else(|| PathBuf::from("cloudgate.toml"));

    let config = if explicit_path.is_none() && !config_path.exists() {
        warn!(path = %config_path.display(), "Configuration file not found, using defaults");
        Config::default()
    } else {
        let config = Config::load(&config_path).map_err(|e| {
            error!(path = %config_path.display(), error = %e, "Failed to load configuration");
            e
        })?;
        info!(path = %config_path.display(), "Configuration loaded");
        config
    };

    print_startup_banner(&config);

    // Open the route store and seed configured static routes
    let db = Arc::new(Database::open(&config.store.path).map_err(|e| {
        error!(path = %config.store.path, error = %e, "Failed to open route store");
        e
    })?);

    let static_routes = config.all_static_routes()?;
    for route in &static_routes {
        db.upsert_static_route(route)?;
    }
    if !static_routes.is_empty() {
        info!(count = static_routes.len(), "Static routes upserted from configuration");
    }

    // First load must succeed
    let store: Arc<dyn RouteStore> = db.clone();
    let router = Arc::new(
        Router::load_with_ssh_port(
            store,
            config.routing.route_cache_capacity,
            config.routing.container_ssh_port,
        )
        .map_err(|e| {
            error!(error = %e, "Initial route load failed");
            anyhow::anyhow!("Initial route load failed: {}", e)
        })?,
    );

    // Create shutdown channel
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let cache = if config.cache.enabled {
        let cache = Arc::new(ResponseCache::new(
            config.cache.shards,
            config.cache.capacity_bytes,
            config.cache.max_entry_bytes,
            config.cache.ttl(),
        ));
        info!(
            shards = cache.shard_count(),
            capacity_bytes = config.cache.capacity_bytes,
            ttl_secs = config.cache.ttl_secs,
            "Response cache enabled"
        );
        Some(cache)
    } else {
        None
    };
    let sweepers: Vec<JoinHandle<()>> = cache
        .as_ref()
        .map(|c| c.spawn_sweepers(config.cache.sweep_interval(), shutdown_rx.clone()))
        .unwrap_or_default();

    // TLS termination for the HTTPS listener
    let tls_acceptor = if config.server.https_port > 0 {
        let names = vec![config.server.canonical_host.clone()];
        Some(tls::build_acceptor(
            config.server.tls_cert.as_deref(),
            config.server.tls_key.as_deref(),
            &names,
        )?)
    } else {
        None
    };

    let resolvers = ResolverChain::standard(
        &config.routing.container_host_template,
        config.routing.container_https_port,
        config.routing.fallback_upstream.as_deref(),
    );
    let gateway = Arc::new(Gateway::new(
        Arc::clone(&router),
        resolvers,
        cache.clone(),
        tls_acceptor,
        ProxySettings::from_config(&config),
    ));

    // Mandatory listeners: any bind failure aborts startup
    let mut listener_handles = Vec::new();
    let mandatory = [
        (ListenerKind::Http, config.server.http_port),
        (ListenerKind::Https, config.server.https_port),
        (ListenerKind::Ssh, config.server.ssh_port),
    ];
    for (kind, port) in mandatory {
        if port == 0 {
            continue;
        }
        let addr = parse_addr(&config.server.bind, port)?;
        let server = ProxyServer::bind(addr, kind, Arc::clone(&gateway), shutdown_rx.clone())
            .await
            .map_err(|e| {
                error!(%kind, addr = %addr, error = %e, "Failed to bind listener");
                e
            })?;
        info!(%kind, addr = %addr, "Listener bound");
        listener_handles.push(spawn_listener(server));
    }

    // Generate or use configured admin token
    let admin_token = config.server.admin_token.clone().unwrap_or_else(|| {
        let token = uuid::Uuid::new_v4().to_string();
        info!(token = %token, "Generated admin API token (configure admin_token to set a fixed value)");
        token
    });

    let ready = Arc::new(AtomicBool::new(false));
    let admin_addr = parse_addr(&config.server.admin_bind, config.server.admin_port)?;
    let admin_state = Arc::new(AdminState {
        router: Arc::clone(&router),
        cache: cache.clone(),
        ready: Arc::clone(&ready),
    });
    let admin_server = AdminServer::bind(
        admin_addr,
        Arc::clone(&admin_state),
        shutdown_rx.clone(),
        admin_token.clone(),
    )
    .await?;
    let mut admin_handles = vec![spawn_admin(admin_server)];

    // Key checks for container sshd, on an address containers can reach
    if config.server.ssh_authorize_port > 0 {
        let addr = parse_addr(&config.server.ssh_authorize_bind, config.server.ssh_authorize_port)?;
        let token = config.server.ssh_authorize_token.clone().unwrap_or(admin_token);
        let server = AdminServer::bind(addr, admin_state, shutdown_rx.clone(), token)
            .await?
            .with_scope(AdminScope::SshAuthorize);
        admin_handles.push(spawn_admin(server));
    }

    // Multi-protocol ingress block: ports that cannot be bound are skipped
    if let Some(range) = config.server.ingress_ports() {
        let mut bound = 0usize;
        for port in range.clone() {
            let addr = parse_addr(&config.server.bind, port)?;
            match ProxyServer::bind(addr, ListenerKind::Ingress, Arc::clone(&gateway), shutdown_rx.clone()).await {
                Ok(server) => {
                    listener_handles.push(spawn_listener(server));
                    bound += 1;
                }
                Err(e) => warn!(port, error = %e, "Skipping ingress port"),
            }
        }
        info!(
            start = range.start(),
            end = range.end(),
            bound,
            "Ingress port block bound"
        );
    }

    ready.store(true, Ordering::Release);
    info!("Gateway ready");

    let reload_handle = tokio::spawn(
        Arc::clone(&router).run_reload_loop(config.store.reload_interval(), shutdown_rx.clone()),
    );

    // Wait for shutdown signal (Ctrl+C or SIGTERM)
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received SIGINT (Ctrl+C), shutting down...");
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM, shutting down...");
            }
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
        info!("Received Ctrl+C, shutting down...");
    }

    // Signal shutdown
    ready.store(false, Ordering::Release);
    let _ = shutdown_tx.send(true);

    // Background tasks exit before the store is released
    let _ = tokio::time::timeout(Duration::from_secs(5), async {
        let _ = reload_handle.await;
        for handle in sweepers {
            let _ = handle.await;
        }
        for handle in listener_handles {
            let _ = handle.await;
        }
        for handle in admin_handles {
            let _ = handle.await;
        }
    })
    .await;

    drop(gateway);
    drop(router);
    drop(db);

    info!("Shutdown complete");
    Ok(())
}

fn parse_addr(bind: &str, port: u16) -> anyhow::Result<SocketAddr> {
    format!("{}:{}", bind, port).parse().map_err(|e| {
        error!(bind = %bind, port, error = %e, "Invalid bind address");
        anyhow::anyhow!("Invalid bind address {}:{}: {}", bind, port, e)
    })
}

fn spawn_listener(server: ProxyServer) -> JoinHandle<()> {
    tokio::spawn(async move {
        let kind = server.kind();
        if let Err(e) = server.run().await {
            error!(%kind, error = %e, "Listener error");
        }
    })
}

fn spawn_admin(server: AdminServer) -> JoinHandle<()> {
    tokio::spawn(async move {
        if let Err(e) = server.run().await {
            error!(error = %e, "Admin server error");
        }
    })
}

fn print_startup_banner(config: &Config) {
    info!(name = PKG_NAME, version = VERSION, "Starting gateway");
    let port = |p: u16| if p > 0 { Some(p) } else { None };
    info!(
        bind = %config.server.bind,
        http_port = port(config.server.http_port),
        https_port = port(config.server.https_port),
        ssh_port = port(config.server.ssh_port),
        admin = %format!("{}:{}", config.server.admin_bind, config.server.admin_port),
        ssh_authorize_port = port(config.server.ssh_authorize_port),
        ingress = ?config.server.ingress_ports(),
        "Listener configuration"
    );
    info!(
        store = %config.store.path,
        reload_interval_secs = config.store.reload_interval_secs,
        route_cache_capacity = config.routing.route_cache_capacity,
        fallback = ?config.routing.fallback_upstream,
        "Routing configuration"
    );
    info!(
        enabled = config.cache.enabled,
        capacity_bytes = config.cache.capacity_bytes,
        max_entry_bytes = config.cache.max_entry_bytes,
        ttl_secs = config.cache.ttl_secs,
        "Response cache configuration"
    );
}
