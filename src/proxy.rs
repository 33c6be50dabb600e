//! Public listeners and the per-connection handler
//!
//! Every accepted connection carries one routed exchange: sniff, resolve,
//! then either answer directly (redirect, rejection, cache hit) or dial the
//! backend and relay bytes both ways until both directions finish.

use crate::config::Config;
use crate::error::{json_error_response, ProxyErrorCode, RouteError};
use crate::http1::{self, ForwardContext, HeadError, RequestHead};
use crate::resolve::{container_host, ResolverChain, RouteRequest, Target};
use crate::response_cache::{self, ResponseCache};
use crate::router::{normalize_host, Router};
use crate::sni::{self, SniResult};
use crate::sniff::{self, PrefixedStream, Protocol};
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::time::timeout;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Upper bound on a buffered ClientHello
const MAX_CLIENT_HELLO: usize = 16 * 1024;

const RELAY_BUFFER: usize = 16 * 1024;

/// Longest client-supplied request ID that is propagated
const MAX_REQUEST_ID_LEN: usize = 128;

/// What a listener accepts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerKind {
    /// Plain HTTP
    Http,
    /// TLS terminated by the gateway, then HTTP
    Https,
    /// Raw SSH, routed by port
    Ssh,
    /// Multi-protocol ingress port, classified by first bytes
    Ingress,
}

impl fmt::Display for ListenerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ListenerKind::Http => "http",
            ListenerKind::Https => "https",
            ListenerKind::Ssh => "ssh",
            ListenerKind::Ingress => "ingress",
        };
        f.write_str(name)
    }
}

/// Connection handling limits and addressing
#[derive(Debug, Clone)]
pub struct ProxySettings {
    /// Redirect target for IP-addressed requests
    pub canonical_host: String,
    /// Public HTTPS port used in upgrade redirects
    pub https_port: u16,
    pub max_header_bytes: usize,
    pub sniff_timeout: Duration,
    pub connect_timeout: Duration,
    pub container_host_template: String,
}

impl ProxySettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            canonical_host: config.server.canonical_host.clone(),
            https_port: config.server.https_port,
            max_header_bytes: config.server.max_header_bytes,
            sniff_timeout: config.server.sniff_timeout(),
            connect_timeout: config.server.connect_timeout(),
            container_host_template: config.routing.container_host_template.clone(),
        }
    }
}

/// State shared by every listener
pub struct Gateway {
    router: Arc<Router>,
    resolvers: ResolverChain,
    cache: Option<Arc<ResponseCache>>,
    tls_acceptor: Option<TlsAcceptor>,
    settings: ProxySettings,
}

impl Gateway {
    pub fn new(
        router: Arc<Router>,
        resolvers: ResolverChain,
        cache: Option<Arc<ResponseCache>>,
        tls_acceptor: Option<TlsAcceptor>,
        settings: ProxySettings,
    ) -> Self {
        Self {
            router,
            resolvers,
            cache,
            tls_acceptor,
            settings,
        }
    }

    pub fn router(&self) -> &Arc<Router> {
        &self.router
    }

    pub fn tls_enabled(&self) -> bool {
        self.tls_acceptor.is_some()
    }
}

/// One bound listener
pub struct ProxyServer {
    listener: TcpListener,
    kind: ListenerKind,
    gateway: Arc<Gateway>,
    shutdown_rx: watch::Receiver<bool>,
}

impl ProxyServer {
    pub async fn bind(
        addr: SocketAddr,
        kind: ListenerKind,
        gateway: Arc<Gateway>,
        shutdown_rx: watch::Receiver<bool>,
    ) -> anyhow::Result<Self> {
        if kind == ListenerKind::Https && !gateway.tls_enabled() {
            anyhow::bail!("HTTPS listener on {} requires TLS material", addr);
        }
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to bind {} listener on {}: {}", kind, addr, e))?;
        Ok(Self {
            listener,
            kind,
            gateway,
            shutdown_rx,
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn kind(&self) -> ListenerKind {
        self.kind
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let local_addr = self.listener.local_addr()?;
        let port = local_addr.port();
        debug!(addr = %local_addr, kind = %self.kind, "Listener accepting");

        let mut shutdown_rx = self.shutdown_rx.clone();
        loop {
            tokio::select! {
                result = self.listener.accept() => {
                    match result {
                        Ok((stream, peer)) => {
                            let gateway = Arc::clone(&self.gateway);
                            let kind = self.kind;
                            tokio::spawn(async move {
                                handle_connection(gateway, stream, peer, kind, port).await;
                            });
                        }
                        Err(e) => {
                            error!(addr = %local_addr, error = %e, "Failed to accept connection");
                        }
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        debug!(addr = %local_addr, kind = %self.kind, "Listener shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }
}

async fn handle_connection(gateway: Arc<Gateway>, mut stream: TcpStream, peer: SocketAddr, kind: ListenerKind, port: u16) {
    let _ = stream.set_nodelay(true);

    match kind {
        ListenerKind::Http => handle_http(&gateway, stream, Vec::new(), peer, port, false).await,
        ListenerKind::Https => handle_https(&gateway, stream, peer, port).await,
        ListenerKind::Ssh => handle_ssh(&gateway, stream, Vec::new(), peer, port).await,
        ListenerKind::Ingress => {
            let mut buf = Vec::new();
            let protocol = match timeout(gateway.settings.sniff_timeout, sniff::sniff(&mut stream, &mut buf)).await {
                Ok(Ok(protocol)) => protocol,
                Ok(Err(e)) => {
                    debug!(peer = %peer, port, error = %e, "Connection closed while sniffing");
                    return;
                }
                Err(_) => {
                    debug!(peer = %peer, port, "Sniff timed out");
                    return;
                }
            };
            debug!(peer = %peer, port, protocol = protocol.as_str(), "Ingress connection classified");

            match protocol {
                Protocol::Http => handle_http(&gateway, stream, buf, peer, port, false).await,
                Protocol::Ssh => handle_ssh(&gateway, stream, buf, peer, port).await,
                Protocol::Tls => handle_tls_passthrough(&gateway, stream, buf, peer, port).await,
            }
        }
    }
}

/// Terminate TLS, admitting the server name before the handshake so an
/// unroutable name costs nothing but the ClientHello read
async fn handle_https(gateway: &Gateway, mut stream: TcpStream, peer: SocketAddr, port: u16) {
    let Some(acceptor) = gateway.tls_acceptor.clone() else {
        return;
    };

    let mut buf = Vec::new();
    match timeout(
        gateway.settings.sniff_timeout,
        sni::read_client_hello(&mut stream, &mut buf, MAX_CLIENT_HELLO),
    )
    .await
    {
        Ok(Ok(())) => {}
        Ok(Err(e)) => {
            debug!(peer = %peer, error = %e, "Failed to read ClientHello");
            return;
        }
        Err(_) => {
            debug!(peer = %peer, "ClientHello timed out");
            return;
        }
    }

    match sni::parse_sni(&buf) {
        SniResult::Found(server_name) => {
            if let Err(e) = gateway.resolvers.admit_tls(&gateway.router, &server_name) {
                debug!(peer = %peer, server_name = %server_name, error = %e, "TLS connection rejected");
                return;
            }
        }
        SniResult::NoSni => {}
        other => {
            debug!(peer = %peer, result = ?other, "Not a usable ClientHello");
            return;
        }
    }

    let replay = PrefixedStream::new(buf, stream);
    let tls_stream = match timeout(gateway.settings.sniff_timeout, acceptor.accept(replay)).await {
        Ok(Ok(tls_stream)) => tls_stream,
        Ok(Err(e)) => {
            debug!(peer = %peer, error = %e, "TLS handshake failed");
            return;
        }
        Err(_) => {
            debug!(peer = %peer, "TLS handshake timed out");
            return;
        }
    };

    handle_http(gateway, tls_stream, Vec::new(), peer, port, true).await;
}

/// Read one request head, route it, then answer or relay
async fn handle_http<S>(gateway: &Gateway, mut client: S, mut buf: Vec<u8>, peer: SocketAddr, port: u16, is_tls: bool)
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let settings = &gateway.settings;
    let head = match timeout(
        settings.sniff_timeout,
        http1::read_request_head(&mut client, &mut buf, settings.max_header_bytes),
    )
    .await
    {
        Ok(Ok(head)) => head,
        Ok(Err(e)) => {
            debug!(peer = %peer, port, error = %e, "Request head rejected");
            if let Some(code) = e.code() {
                reject(&mut client, code, e.to_string()).await;
            }
            return;
        }
        Err(_) => {
            let e = HeadError::Timeout;
            debug!(peer = %peer, port, error = %e, "Request head rejected");
            if !buf.is_empty() {
                reject(&mut client, ProxyErrorCode::MalformedRequest, e.to_string()).await;
            }
            return;
        }
    };

    let Some(host_header) = head.host().map(str::to_string) else {
        reject(&mut client, ProxyErrorCode::MissingHostHeader, "Missing Host header").await;
        return;
    };
    let (hostname, _) = http1::split_host_port(&host_header);

    if http1::is_ip_literal(hostname) {
        let location = format!("https://{}{}", settings.canonical_host, head.target);
        debug!(peer = %peer, host = hostname, location = %location, "Redirecting IP-addressed request");
        respond(&mut client, &http1::redirect_response(302, &location)).await;
        return;
    }
    if !http1::is_valid_hostname(hostname) {
        reject(&mut client, ProxyErrorCode::MalformedRequest, "Invalid Host header").await;
        return;
    }
    let host = normalize_host(hostname);

    let request = RouteRequest {
        host: &host,
        path: head.path(),
        ingress_port: port,
        tls_terminated: is_tls,
    };
    let target = match gateway.resolvers.resolve(&gateway.router, &request) {
        Ok(target) => target,
        Err(e) => {
            debug!(peer = %peer, host = %host, path = head.path(), port, error = %e, "Request not routed");
            reject(&mut client, e.code(), e.to_string()).await;
            return;
        }
    };

    let forward_target = match &target {
        Target::Static { .. } if !is_tls => {
            let location = http1::https_location(&host, settings.https_port, &head.target);
            debug!(peer = %peer, host = %host, location = %location, "Upgrading static route to HTTPS");
            respond(&mut client, &http1::redirect_response(301, &location)).await;
            return;
        }
        Target::Static { target_path, .. } => http1::with_query(target_path, head.query()),
        _ => head.target.clone(),
    };
    let backend = target.backend().to_string();

    let cache_key = match &gateway.cache {
        Some(_) if is_cacheable_request(&head) => {
            Some(response_cache::request_key(&host, &backend, &forward_target))
        }
        _ => None,
    };
    if let (Some(cache), Some(key)) = (&gateway.cache, &cache_key) {
        if let Some(entry) = cache.get(key) {
            let response = http1::render_cached(&entry);
            respond(&mut client, &response).await;
            info!(
                peer = %peer,
                host = %host,
                method = %head.method,
                path = %forward_target,
                backend = %backend,
                status = entry.status,
                bytes_out = response.len(),
                cache = "hit",
                "Request completed"
            );
            return;
        }
    }

    let backend_stream = match dial(&backend, settings.connect_timeout).await {
        Ok(stream) => stream,
        Err(e) => {
            warn!(peer = %peer, host = %host, error = %e, "Backend unreachable");
            reject(&mut client, e.code(), e.to_string()).await;
            return;
        }
    };

    let request_id = request_id(&head);
    let forwarded = http1::forward_head(
        &head,
        &forward_target,
        &ForwardContext {
            client_ip: peer.ip(),
            host: &host_header,
            proto: if is_tls { "https" } else { "http" },
            request_id: &request_id,
        },
    );
    let mut preamble = forwarded;
    preamble.extend_from_slice(&buf[head.head_len..]);

    let sink = match (&gateway.cache, &cache_key) {
        (Some(cache), Some(key)) => Some(CacheSink {
            cache: cache.as_ref(),
            key: key.as_str(),
        }),
        _ => None,
    };
    let stats = relay(client, backend_stream, &preamble, sink).await;

    let cache_outcome = match stats.stored {
        Some(true) => "stored",
        Some(false) => "miss",
        None => "bypass",
    };

    info!(
        peer = %peer,
        host = %host,
        method = %head.method,
        path = %forward_target,
        backend = %backend,
        route = target.kind(),
        request_id = %request_id,
        status = ?stats.status,
        bytes_in = stats.bytes_up,
        bytes_out = stats.bytes_down,
        cache = cache_outcome,
        "Request completed"
    );
}

/// SSH has no routing key on the wire; the ingress port picks the container
async fn handle_ssh(gateway: &Gateway, client: TcpStream, buf: Vec<u8>, peer: SocketAddr, port: u16) {
    let (container, target_port) = match gateway.router.resolve_ssh_port(port) {
        Ok(resolved) => resolved,
        Err(e) => {
            debug!(peer = %peer, port, error = %e, "SSH connection rejected");
            return;
        }
    };

    let backend = format!(
        "{}:{}",
        container_host(&gateway.settings.container_host_template, &container),
        target_port
    );
    relay_opaque(gateway, client, &buf, peer, &backend, "ssh").await;
}

/// TLS on an ingress port is relayed untouched to the container's mapped
/// port, gated by its HTTPS flag
async fn handle_tls_passthrough(gateway: &Gateway, mut client: TcpStream, mut buf: Vec<u8>, peer: SocketAddr, port: u16) {
    match timeout(
        gateway.settings.sniff_timeout,
        sni::read_client_hello(&mut client, &mut buf, MAX_CLIENT_HELLO),
    )
    .await
    {
        Ok(Ok(())) => {}
        _ => {
            debug!(peer = %peer, port, "Failed to read ClientHello");
            return;
        }
    }

    let server_name = match sni::parse_sni(&buf) {
        SniResult::Found(name) => name,
        other => {
            debug!(peer = %peer, port, result = ?other, "TLS passthrough needs a server name");
            return;
        }
    };

    let resolved = gateway.router.resolve_https(&server_name).and_then(|container| {
        match container.target_port(port) {
            Some(target_port) => Ok((container, target_port)),
            None => Err(RouteError::blocked(&container.id, "tls")),
        }
    });
    let (container, target_port) = match resolved {
        Ok(resolved) => resolved,
        Err(e) => {
            debug!(peer = %peer, port, server_name = %server_name, error = %e, "TLS connection rejected");
            return;
        }
    };

    let backend = format!(
        "{}:{}",
        container_host(&gateway.settings.container_host_template, &container),
        target_port
    );
    relay_opaque(gateway, client, &buf, peer, &backend, "tls").await;
}

async fn relay_opaque(gateway: &Gateway, client: TcpStream, preamble: &[u8], peer: SocketAddr, backend: &str, protocol: &'static str) {
    let backend_stream = match dial(backend, gateway.settings.connect_timeout).await {
        Ok(stream) => stream,
        Err(e) => {
            warn!(peer = %peer, protocol, error = %e, "Backend unreachable");
            return;
        }
    };

    let stats = relay(client, backend_stream, preamble, None).await;
    info!(
        peer = %peer,
        protocol,
        backend = %backend,
        bytes_in = stats.bytes_up,
        bytes_out = stats.bytes_down,
        "Connection completed"
    );
}

async fn dial(backend: &str, connect_timeout: Duration) -> Result<TcpStream, RouteError> {
    let unreachable = |reason: String| RouteError::BackendUnreachable {
        addr: backend.to_string(),
        reason,
    };
    match timeout(connect_timeout, TcpStream::connect(backend)).await {
        Ok(Ok(stream)) => {
            let _ = stream.set_nodelay(true);
            Ok(stream)
        }
        Ok(Err(e)) => Err(unreachable(e.to_string())),
        Err(_) => Err(unreachable(format!("connect timed out after {:?}", connect_timeout))),
    }
}

/// Cache slot a relayed response is written to once the backend finishes it
struct CacheSink<'a> {
    cache: &'a ResponseCache,
    key: &'a str,
}

#[derive(Debug, Default)]
struct RelayStats {
    bytes_up: u64,
    bytes_down: u64,
    /// Best-effort status from the first response chunk
    status: Option<u16>,
    /// Whether the response went into the cache; `None` without a sink
    stored: Option<bool>,
}

/// Send `preamble` to the backend, then pump both directions concurrently.
/// A response headed for `sink` is stored as soon as the backend closes,
/// before the client sees EOF. Returns once both directions have finished.
async fn relay<S>(client: S, mut backend: TcpStream, preamble: &[u8], sink: Option<CacheSink<'_>>) -> RelayStats
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    if let Err(e) = backend.write_all(preamble).await {
        debug!(error = %e, "Failed to write to backend");
        return RelayStats {
            stored: sink.map(|_| false),
            ..RelayStats::default()
        };
    }
    let capture_limit = sink.as_ref().map(|sink| sink.cache.max_entry_bytes());

    let (mut client_read, mut client_write) = tokio::io::split(client);
    let (mut backend_read, mut backend_write) = backend.split();

    let upstream = async {
        let copied = tokio::io::copy(&mut client_read, &mut backend_write)
            .await
            .unwrap_or(0);
        let _ = backend_write.shutdown().await;
        copied
    };

    let downstream = async {
        let mut chunk = vec![0u8; RELAY_BUFFER];
        let mut total = 0u64;
        let mut status = None;
        let mut capture = capture_limit.map(|_| Vec::new());
        let mut clean_eof = false;

        loop {
            let n = match backend_read.read(&mut chunk).await {
                Ok(0) => {
                    clean_eof = true;
                    break;
                }
                Ok(n) => n,
                Err(_) => break,
            };
            if total == 0 {
                status = http1::status_hint(&chunk[..n]);
            }

            let overflow = match (capture.as_mut(), capture_limit) {
                (Some(buf), Some(limit)) if buf.len() + n <= limit => {
                    buf.extend_from_slice(&chunk[..n]);
                    false
                }
                (Some(_), _) => true,
                _ => false,
            };
            if overflow {
                capture = None;
            }

            if client_write.write_all(&chunk[..n]).await.is_err() {
                break;
            }
            total += n as u64;
        }

        let stored = sink.map(|sink| match capture.filter(|_| clean_eof) {
            Some(raw) => store_response(sink.cache, sink.key, &raw),
            None => false,
        });
        let _ = client_write.shutdown().await;

        (total, status, stored)
    };

    let (bytes_up, (bytes_down, status, stored)) = tokio::join!(upstream, downstream);
    RelayStats {
        bytes_up: bytes_up + preamble.len() as u64,
        bytes_down,
        status,
        stored,
    }
}

/// GETs carrying `Authorization` or `Cookie` bypass the cache
fn is_cacheable_request(head: &RequestHead) -> bool {
    head.is_get() && head.header("authorization").is_none() && head.header("cookie").is_none()
}

/// Store a captured backend response if it is complete and cacheable
fn store_response(cache: &ResponseCache, key: &str, raw: &[u8]) -> bool {
    let Some(head) = http1::parse_response_head(raw) else {
        return false;
    };
    if head.header("transfer-encoding").is_some() {
        return false;
    }
    let body = &raw[head.head_len..];
    if let Some(len) = head.content_length() {
        if len != body.len() {
            return false;
        }
    }
    cache.set(key, head.status, &head.headers, body)
}

/// Propagate a sane client request ID or mint one
fn request_id(head: &RequestHead) -> String {
    head.header(http1::X_REQUEST_ID)
        .filter(|id| {
            !id.is_empty()
                && id.len() <= MAX_REQUEST_ID_LEN
                && id
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.')
        })
        .map(str::to_string)
        .unwrap_or_else(|| Uuid::new_v4().to_string())
}

async fn respond<S: AsyncWrite + Unpin>(client: &mut S, response: &[u8]) {
    if client.write_all(response).await.is_ok() {
        let _ = client.shutdown().await;
    }
}

async fn reject<S: AsyncWrite + Unpin>(client: &mut S, code: ProxyErrorCode, message: impl Into<String>) {
    respond(client, &json_error_response(code, message)).await;
}
