use crate::store::StaticRoute;
use serde::Deserialize;
use std::ops::RangeInclusive;
use std::path::Path;
use std::time::Duration;

/// Gateway configuration
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    /// Listeners and connection handling
    #[serde(default)]
    pub server: ServerConfig,

    /// Route store location and reload cadence
    #[serde(default)]
    pub store: StoreConfig,

    /// Resolution settings
    #[serde(default)]
    pub routing: RoutingConfig,

    /// Response cache
    #[serde(default)]
    pub cache: CacheConfig,

    /// Static routes upserted into the store at startup
    #[serde(default)]
    pub static_routes: Vec<StaticRouteEntry>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    /// Bind address for public listeners (default: 0.0.0.0)
    #[serde(default = "default_bind_address")]
    pub bind: String,

    /// Plain HTTP port (default: 80, 0 disables)
    #[serde(default = "default_http_port")]
    pub http_port: u16,

    /// TLS-terminating HTTPS port (default: 443, 0 disables)
    #[serde(default = "default_https_port")]
    pub https_port: u16,

    /// Dedicated SSH port (default: 22, 0 disables)
    #[serde(default = "default_ssh_port")]
    pub ssh_port: u16,

    /// Internal health and admin listener
    #[serde(default = "default_admin_port")]
    pub admin_port: u16,

    #[serde(default = "default_admin_bind")]
    pub admin_bind: String,

    /// Bearer token for route and key endpoints. Generated at startup when unset.
    pub admin_token: Option<String>,

    /// Listener serving only `/ssh/authorize`, reachable from container
    /// networks so sshd can check keys (0 disables)
    #[serde(default)]
    pub ssh_authorize_port: u16,

    #[serde(default = "default_bind_address")]
    pub ssh_authorize_bind: String,

    /// Token for the key-check listener; never grants route administration.
    /// Falls back to `admin_token` when unset.
    pub ssh_authorize_token: Option<String>,

    /// First port of the multi-protocol ingress block (0 disables the block)
    #[serde(default = "default_ingress_port_start")]
    pub ingress_port_start: u16,

    #[serde(default = "default_ingress_port_end")]
    pub ingress_port_end: u16,

    /// Hostname IP-addressed requests are redirected to
    #[serde(default = "default_canonical_host")]
    pub canonical_host: String,

    /// Path to TLS certificate file (PEM format)
    pub tls_cert: Option<String>,

    /// Path to TLS private key file (PEM format)
    pub tls_key: Option<String>,

    /// Hard cap on a request head
    #[serde(default = "default_max_header_bytes")]
    pub max_header_bytes: usize,

    /// Time allowed for a client to send enough bytes to be routed
    #[serde(default = "default_sniff_timeout_ms")]
    pub sniff_timeout_ms: u64,

    /// Backend dial timeout
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
}

impl ServerConfig {
    pub fn has_tls_files(&self) -> bool {
        self.tls_cert.is_some() && self.tls_key.is_some()
    }

    pub fn ingress_ports(&self) -> Option<RangeInclusive<u16>> {
        if self.ingress_port_start == 0 {
            return None;
        }
        Some(self.ingress_port_start..=self.ingress_port_end)
    }

    pub fn sniff_timeout(&self) -> Duration {
        Duration::from_millis(self.sniff_timeout_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind_address(),
            http_port: default_http_port(),
            https_port: default_https_port(),
            ssh_port: default_ssh_port(),
            admin_port: default_admin_port(),
            admin_bind: default_admin_bind(),
            admin_token: None,
            ssh_authorize_port: 0,
            ssh_authorize_bind: default_bind_address(),
            ssh_authorize_token: None,
            ingress_port_start: default_ingress_port_start(),
            ingress_port_end: default_ingress_port_end(),
            canonical_host: default_canonical_host(),
            tls_cert: None,
            tls_key: None,
            max_header_bytes: default_max_header_bytes(),
            sniff_timeout_ms: default_sniff_timeout_ms(),
            connect_timeout_ms: default_connect_timeout_ms(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct StoreConfig {
    /// SQLite database path
    #[serde(default = "default_store_path")]
    pub path: String,

    #[serde(default = "default_reload_interval_secs")]
    pub reload_interval_secs: u64,
}

impl StoreConfig {
    pub fn reload_interval(&self) -> Duration {
        Duration::from_secs(self.reload_interval_secs.max(1))
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: default_store_path(),
            reload_interval_secs: default_reload_interval_secs(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct RoutingConfig {
    /// Entries in the static route lookup cache
    #[serde(default = "default_route_cache_capacity")]
    pub route_cache_capacity: usize,

    /// Backend host for a container; `{id}`, `{namespace}` and `{external_ip}`
    /// are substituted
    #[serde(default = "default_container_host_template")]
    pub container_host_template: String,

    /// Container port for TLS-terminated traffic when no 443 mapping exists
    #[serde(default = "default_container_https_port")]
    pub container_https_port: u16,

    /// Port sshd listens on inside containers; ingress rules targeting it
    /// publish SSH
    #[serde(default = "default_container_ssh_port")]
    pub container_ssh_port: u16,

    /// Catch-all upstream host, dialed on the inbound ingress port
    pub fallback_upstream: Option<String>,

    /// Optional TOML file with additional `[[routes]]`
    pub static_routes_file: Option<String>,
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            route_cache_capacity: default_route_cache_capacity(),
            container_host_template: default_container_host_template(),
            container_https_port: default_container_https_port(),
            container_ssh_port: default_container_ssh_port(),
            fallback_upstream: None,
            static_routes_file: None,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct CacheConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Rounded up to a power of two
    #[serde(default = "default_cache_shards")]
    pub shards: usize,

    /// Budget across all shards
    #[serde(default = "default_cache_capacity_bytes")]
    pub capacity_bytes: usize,

    #[serde(default = "default_max_entry_bytes")]
    pub max_entry_bytes: usize,

    #[serde(default = "default_cache_ttl_secs")]
    pub ttl_secs: u64,

    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
}

impl CacheConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs.max(1))
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            shards: default_cache_shards(),
            capacity_bytes: default_cache_capacity_bytes(),
            max_entry_bytes: default_max_entry_bytes(),
            ttl_secs: default_cache_ttl_secs(),
            sweep_interval_secs: default_sweep_interval_secs(),
        }
    }
}

/// A static route as written in configuration
#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
pub struct StaticRouteEntry {
    pub host: String,

    /// Path prefix (default: "/")
    #[serde(default = "default_route_path")]
    pub path: String,

    /// Backend `host:port`
    pub target: String,

    #[serde(default)]
    pub strip_prefix: bool,
}

impl StaticRouteEntry {
    pub fn to_route(&self) -> StaticRoute {
        StaticRoute::new(&self.host, &self.path, &self.target, self.strip_prefix)
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.host.trim().is_empty() {
            return Err(format!("static route '{}': host must not be empty", self.path));
        }
        if !self.path.starts_with('/') {
            return Err(format!(
                "static route '{}{}': path must start with '/'",
                self.host, self.path
            ));
        }
        if self.target.trim().is_empty() {
            return Err(format!(
                "static route '{}{}': target must not be empty",
                self.host, self.path
            ));
        }
        Ok(())
    }
}

/// Shape of the optional routes file
#[derive(Debug, Deserialize, Default)]
struct RoutesFile {
    #[serde(default)]
    routes: Vec<StaticRouteEntry>,
}

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_http_port() -> u16 {
    80
}

fn default_https_port() -> u16 {
    443
}

fn default_ssh_port() -> u16 {
    22
}

fn default_admin_port() -> u16 {
    9090
}

fn default_admin_bind() -> String {
    "127.0.0.1".to_string()
}

fn default_ingress_port_start() -> u16 {
    8000
}

fn default_ingress_port_end() -> u16 {
    8999
}

fn default_canonical_host() -> String {
    "localhost".to_string()
}

fn default_max_header_bytes() -> usize {
    8192
}

fn default_sniff_timeout_ms() -> u64 {
    5000
}

fn default_connect_timeout_ms() -> u64 {
    5000
}

fn default_store_path() -> String {
    "cloudgate.db".to_string()
}

fn default_reload_interval_secs() -> u64 {
    5
}

fn default_route_cache_capacity() -> usize {
    100
}

fn default_container_host_template() -> String {
    "{id}.{namespace}.svc.cluster.local".to_string()
}

fn default_container_https_port() -> u16 {
    80
}

fn default_container_ssh_port() -> u16 {
    22
}

fn default_true() -> bool {
    true
}

fn default_cache_shards() -> usize {
    16
}

fn default_cache_capacity_bytes() -> usize {
    64 * 1024 * 1024
}

fn default_max_entry_bytes() -> usize {
    1024 * 1024
}

fn default_cache_ttl_secs() -> u64 {
    60
}

fn default_sweep_interval_secs() -> u64 {
    30
}

fn default_route_path() -> String {
    "/".to_string()
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate all configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        let mut errors = Vec::new();

        for route in &self.static_routes {
            if let Err(e) = route.validate() {
                errors.push(e);
            }
        }

        if self.server.ingress_port_start > self.server.ingress_port_end {
            errors.push(format!(
                "ingress_port_start ({}) is greater than ingress_port_end ({})",
                self.server.ingress_port_start, self.server.ingress_port_end
            ));
        }

        if self.server.ssh_authorize_port != 0
            && self.server.ssh_authorize_port == self.server.admin_port
            && self.server.ssh_authorize_bind == self.server.admin_bind
        {
            errors.push(format!(
                "ssh_authorize_port ({}) collides with admin_port",
                self.server.ssh_authorize_port
            ));
        }

        if self.routing.container_ssh_port == 0 {
            errors.push("routing.container_ssh_port must be greater than 0".to_string());
        }

        if self.server.max_header_bytes == 0 {
            errors.push("max_header_bytes must be greater than 0".to_string());
        }

        if self.cache.shards == 0 {
            errors.push("cache.shards must be greater than 0".to_string());
        } else {
            let shard_budget = self.cache.capacity_bytes / self.cache.shards.next_power_of_two();
            if self.cache.max_entry_bytes > shard_budget {
                errors.push(format!(
                    "cache.max_entry_bytes ({}) exceeds the per-shard budget ({})",
                    self.cache.max_entry_bytes, shard_budget
                ));
            }
        }

        if !errors.is_empty() {
            anyhow::bail!("Configuration errors:\n  - {}", errors.join("\n  - "));
        }

        Ok(())
    }

    /// Inline static routes followed by those in the routes file, if any
    pub fn all_static_routes(&self) -> anyhow::Result<Vec<StaticRoute>> {
        let mut entries = self.static_routes.clone();

        if let Some(path) = &self.routing.static_routes_file {
            let content = std::fs::read_to_string(path)
                .map_err(|e| anyhow::anyhow!("Failed to read routes file {}: {}", path, e))?;
            let file: RoutesFile = toml::from_str(&content)
                .map_err(|e| anyhow::anyhow!("Failed to parse routes file {}: {}", path, e))?;

            let errors: Vec<String> = file
                .routes
                .iter()
                .filter_map(|r| r.validate().err())
                .collect();
            if !errors.is_empty() {
                anyhow::bail!("Routes file {} errors:\n  - {}", path, errors.join("\n  - "));
            }
            entries.extend(file.routes);
        }

        Ok(entries.iter().map(StaticRouteEntry::to_route).collect())
    }
}
