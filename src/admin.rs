use crate::config::StaticRouteEntry;
use crate::error::RouteError;
use crate::response_cache::ResponseCache;
use crate::router::{normalize_host, Router};
use http_body_util::{BodyExt, Full, Limited};
use hyper::body::{Bytes, Incoming};
use hyper::header::AUTHORIZATION;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Version information for the gateway
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const PKG_NAME: &str = env!("CARGO_PKG_NAME");

/// Largest accepted request body (route registrations)
const MAX_BODY_BYTES: usize = 64 * 1024;

/// Helper to create a simple response - infallible with valid StatusCode
fn response(status: StatusCode, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .body(Full::new(body.into()))
        .expect("valid response with StatusCode enum")
}

/// Helper to create a JSON response
fn json_response(status: StatusCode, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .header("content-type", "application/json")
        .body(Full::new(body.into()))
        .expect("valid response with StatusCode enum and static header")
}

fn json_error(status: StatusCode, message: impl std::fmt::Display) -> Response<Full<Bytes>> {
    json_response(
        status,
        serde_json::json!({ "error": message.to_string() }).to_string(),
    )
}

/// What the admin endpoints read and act on
pub struct AdminState {
    pub router: Arc<Router>,
    pub cache: Option<Arc<ResponseCache>>,
    /// Set once routes are loaded and every mandatory listener is bound
    pub ready: Arc<AtomicBool>,
}

/// Which endpoints a listener exposes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdminScope {
    Full,
    /// Liveness and key checks only. Meant for a bind address that
    /// container networks can reach.
    SshAuthorize,
}

impl AdminScope {
    fn serves(self, path: &str) -> bool {
        match self {
            AdminScope::Full => true,
            AdminScope::SshAuthorize => matches!(path, "/healthz" | "/ssh/authorize"),
        }
    }
}

/// Internal health, readiness and route administration server
pub struct AdminServer {
    listener: TcpListener,
    state: Arc<AdminState>,
    shutdown_rx: watch::Receiver<bool>,
    auth_token: Arc<String>,
    scope: AdminScope,
}

impl AdminServer {
    pub async fn bind(
        bind_addr: SocketAddr,
        state: Arc<AdminState>,
        shutdown_rx: watch::Receiver<bool>,
        auth_token: String,
    ) -> anyhow::Result<Self> {
        let listener = TcpListener::bind(bind_addr)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to bind admin listener on {}: {}", bind_addr, e))?;
        Ok(Self {
            listener,
            state,
            shutdown_rx,
            auth_token: Arc::new(auth_token),
            scope: AdminScope::Full,
        })
    }

    pub fn with_scope(mut self, scope: AdminScope) -> Self {
        self.scope = scope;
        self
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn auth_token(&self) -> &str {
        &self.auth_token
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let local_addr = self.listener.local_addr()?;
        info!(addr = %local_addr, scope = ?self.scope, "Admin server listening");

        let mut shutdown_rx = self.shutdown_rx.clone();
        loop {
            tokio::select! {
                result = self.listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let state = Arc::clone(&self.state);
                            let auth_token = Arc::clone(&self.auth_token);
                            let scope = self.scope;
                            tokio::spawn(async move {
                                if let Err(e) = serve_admin_connection(stream, state, auth_token, scope).await {
                                    debug!(addr = %addr, error = %e, "Admin connection error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept admin connection");
                        }
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("Admin server shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }
}

async fn serve_admin_connection(
    stream: tokio::net::TcpStream,
    state: Arc<AdminState>,
    auth_token: Arc<String>,
    scope: AdminScope,
) -> anyhow::Result<()> {
    let io = TokioIo::new(stream);
    let service = service_fn(move |req| {
        let state = Arc::clone(&state);
        let token = Arc::clone(&auth_token);
        async move { handle_admin_request(req, state, token, scope).await }
    });

    AutoBuilder::new(TokioExecutor::new())
        .serve_connection(io, service)
        .await
        .map_err(|e| anyhow::anyhow!("Admin connection error: {}", e))?;

    Ok(())
}

fn check_auth<B>(req: &Request<B>, expected_token: &str) -> bool {
    req.headers()
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .map(|auth| {
            // Support "Bearer <token>" format
            auth.strip_prefix("Bearer ")
                .unwrap_or(auth)
                .eq(expected_token)
        })
        .unwrap_or(false)
}

/// Percent-decoded query parameters. `+` is kept literally since base64
/// keys contain it.
fn query_params(query: Option<&str>) -> HashMap<String, String> {
    query
        .unwrap_or("")
        .split('&')
        .filter(|pair| !pair.is_empty())
        .filter_map(|pair| {
            let (name, value) = pair.split_once('=').unwrap_or((pair, ""));
            let name = urlencoding::decode(name).ok()?.into_owned();
            let value = urlencoding::decode(value).ok()?.into_owned();
            Some((name, value))
        })
        .collect()
}

/// Map a router failure onto an admin status
fn route_error_status(e: &RouteError) -> StatusCode {
    match e {
        RouteError::NoRoute { .. } | RouteError::NotFound(_) => StatusCode::NOT_FOUND,
        RouteError::MalformedRequest(_) => StatusCode::BAD_REQUEST,
        RouteError::StoreUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

async fn handle_admin_request(
    req: Request<Incoming>,
    state: Arc<AdminState>,
    auth_token: Arc<String>,
    scope: AdminScope,
) -> Result<Response<Full<Bytes>>, hyper::Error> {
    let path = req.uri().path().to_string();
    let method = req.method().clone();

    debug!(%method, %path, ?scope, "Admin API request");

    if !scope.serves(&path) {
        return Ok(response(StatusCode::NOT_FOUND, "not found"));
    }

    let response = match (&method, path.as_str()) {
        // Liveness (no auth required)
        (&Method::GET, "/healthz") => response(StatusCode::OK, "ok"),

        // Readiness (no auth required)
        (&Method::GET, "/readyz") => {
            if state.ready.load(Ordering::Acquire) {
                response(StatusCode::OK, "ready")
            } else {
                response(StatusCode::SERVICE_UNAVAILABLE, "not ready")
            }
        }

        // Version endpoint: GET /version (no auth required)
        (&Method::GET, "/version") => {
            let version_info = serde_json::json!({
                "name": PKG_NAME,
                "version": VERSION,
            });
            json_response(StatusCode::OK, version_info.to_string())
        }

        // Response cache counters (no auth required)
        (&Method::GET, "/cache/stats") => match &state.cache {
            Some(cache) => json_response(
                StatusCode::OK,
                serde_json::json!({ "enabled": true, "stats": cache.stats() }).to_string(),
            ),
            None => json_response(
                StatusCode::OK,
                serde_json::json!({ "enabled": false }).to_string(),
            ),
        },

        (_, "/routes") | (_, "/cache") | (_, "/ssh/authorize") if !check_auth(&req, &auth_token) => {
            warn!(%path, "Unauthorized admin API request");
            response(StatusCode::UNAUTHORIZED, "unauthorized")
        }

        // Static routes in match order: GET /routes (auth required)
        (&Method::GET, "/routes") => {
            let routes = state.router.static_routes();
            let body = serde_json::json!({
                "count": routes.len(),
                "routes": routes,
            });
            json_response(StatusCode::OK, body.to_string())
        }

        // Register a static route: PUT /routes (auth required)
        (&Method::PUT, "/routes") => put_route(req, &state).await,

        // Unregister: DELETE /routes?host=&path= (auth required)
        (&Method::DELETE, "/routes") => {
            let params = query_params(req.uri().query());
            match (params.get("host"), params.get("path")) {
                (Some(host), Some(prefix)) => {
                    let router = Arc::clone(&state.router);
                    let (host, prefix) = (normalize_host(host), prefix.clone());
                    let purge_host = host.clone();
                    match tokio::task::spawn_blocking(move || router.unregister_route(&host, &prefix)).await {
                        Ok(Ok(())) => {
                            invalidate_host(&state, &purge_host);
                            response(StatusCode::OK, "ok")
                        }
                        Ok(Err(e)) => json_error(route_error_status(&e), e),
                        Err(e) => json_error(StatusCode::INTERNAL_SERVER_ERROR, e),
                    }
                }
                _ => json_error(StatusCode::BAD_REQUEST, "host and path are required"),
            }
        }

        // SSH key check for sshd's AuthorizedKeysCommand (auth required)
        (&Method::GET, "/ssh/authorize") => {
            let params = query_params(req.uri().query());
            match (params.get("container"), params.get("key")) {
                (Some(container), Some(key)) => {
                    let router = Arc::clone(&state.router);
                    let (container, key) = (container.clone(), key.clone());
                    let authorized = tokio::task::spawn_blocking(move || router.validate_ssh_key(&container, &key))
                        .await
                        .unwrap_or(false);
                    if authorized {
                        response(StatusCode::OK, "authorized")
                    } else {
                        response(StatusCode::FORBIDDEN, "forbidden")
                    }
                }
                _ => json_error(StatusCode::BAD_REQUEST, "container and key are required"),
            }
        }

        // Drop cached responses: DELETE /cache?host= or ?key= (auth required)
        (&Method::DELETE, "/cache") => {
            let params = query_params(req.uri().query());
            match (&state.cache, params.get("host"), params.get("key")) {
                (None, _, _) => json_error(StatusCode::NOT_FOUND, "response cache is disabled"),
                (Some(cache), Some(host), None) => {
                    let removed = cache.delete_host(&normalize_host(host));
                    json_response(StatusCode::OK, serde_json::json!({ "removed": removed }).to_string())
                }
                (Some(cache), None, Some(key)) => {
                    let removed = usize::from(cache.delete(key));
                    json_response(StatusCode::OK, serde_json::json!({ "removed": removed }).to_string())
                }
                _ => json_error(StatusCode::BAD_REQUEST, "exactly one of host or key is required"),
            }
        }

        (_, "/routes") | (_, "/cache") | (_, "/ssh/authorize") => {
            response(StatusCode::METHOD_NOT_ALLOWED, "method not allowed")
        }

        // 404 for everything else
        _ => response(StatusCode::NOT_FOUND, "not found"),
    };

    Ok(response)
}

async fn put_route(req: Request<Incoming>, state: &AdminState) -> Response<Full<Bytes>> {
    let body = match Limited::new(req.into_body(), MAX_BODY_BYTES).collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(e) => return json_error(StatusCode::BAD_REQUEST, format!("failed to read body: {}", e)),
    };

    let entry: StaticRouteEntry = match serde_json::from_slice(&body) {
        Ok(entry) => entry,
        Err(e) => return json_error(StatusCode::BAD_REQUEST, format!("invalid route: {}", e)),
    };
    if let Err(e) = entry.validate() {
        return json_error(StatusCode::BAD_REQUEST, e);
    }

    let route = entry.to_route();
    let router = Arc::clone(&state.router);
    let registered = route.clone();
    match tokio::task::spawn_blocking(move || router.register_route(registered)).await {
        Ok(Ok(())) => {
            invalidate_host(state, &route.host);
            json_response(
                StatusCode::OK,
                serde_json::to_string(&route).unwrap_or_default(),
            )
        }
        Ok(Err(e)) => json_error(route_error_status(&e), e),
        Err(e) => json_error(StatusCode::INTERNAL_SERVER_ERROR, e),
    }
}

/// Responses cached under the old routing for `host` must not outlive it
fn invalidate_host(state: &AdminState, host: &str) {
    if let Some(cache) = &state.cache {
        let removed = cache.delete_host(host);
        if removed > 0 {
            info!(host, removed, "Cached responses invalidated after route change");
        }
    }
}
