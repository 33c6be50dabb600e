//! Raw HTTP/1.1 framing for the proxy path
//!
//! The gateway never runs a full HTTP stack on proxied connections. It reads
//! one request head, decides where it goes, rewrites the head and then
//! relays bytes. Responses are only parsed best-effort, for logging and for
//! the response cache.

use crate::error::ProxyErrorCode;
use crate::response_cache::CachedResponse;
use std::io;
use std::net::IpAddr;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};

pub const MAX_HEADERS: usize = 96;

/// DNS limit on hostname length
const MAX_HOSTNAME_LEN: usize = 253;

pub const X_REQUEST_ID: &str = "x-request-id";
pub const X_FORWARDED_FOR: &str = "x-forwarded-for";
pub const X_FORWARDED_HOST: &str = "x-forwarded-host";
pub const X_FORWARDED_PROTO: &str = "x-forwarded-proto";

/// Request-side headers replaced by the gateway
const REPLACED_HEADERS: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-connection",
    X_FORWARDED_FOR,
    X_FORWARDED_HOST,
    X_FORWARDED_PROTO,
    X_REQUEST_ID,
];

/// Response headers recomputed when serving from cache
const CACHE_SKIPPED_HEADERS: &[&str] = &[
    "connection",
    "keep-alive",
    "transfer-encoding",
    "content-length",
];

#[derive(Debug, Error)]
pub enum HeadError {
    #[error("connection closed before a complete request head")]
    Closed,
    #[error("request head exceeds {0} bytes")]
    TooLarge(usize),
    #[error("malformed request head: {0}")]
    Malformed(String),
    #[error("timed out waiting for request head")]
    Timeout,
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl HeadError {
    /// Rejection to send, if the client is still there to receive one
    pub fn code(&self) -> Option<ProxyErrorCode> {
        match self {
            HeadError::TooLarge(_) => Some(ProxyErrorCode::HeaderTooLarge),
            HeadError::Malformed(_) | HeadError::Timeout => Some(ProxyErrorCode::MalformedRequest),
            HeadError::Closed | HeadError::Io(_) => None,
        }
    }
}

/// A parsed request line and header block
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestHead {
    pub method: String,
    /// Request target as sent (path plus optional query)
    pub target: String,
    pub headers: Vec<(String, String)>,
    /// Length of the head in the read buffer; anything after it is body
    pub head_len: usize,
}

impl RequestHead {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn host(&self) -> Option<&str> {
        self.header("host").map(str::trim).filter(|h| !h.is_empty())
    }

    pub fn path(&self) -> &str {
        match self.target.split_once('?') {
            Some((path, _)) => path,
            None => &self.target,
        }
    }

    pub fn query(&self) -> Option<&str> {
        self.target.split_once('?').map(|(_, q)| q)
    }

    pub fn is_get(&self) -> bool {
        self.method == "GET"
    }
}

/// Parse a request head from the start of `buf`. `Ok(None)` means more bytes
/// are needed.
pub fn parse_request(buf: &[u8]) -> Result<Option<RequestHead>, HeadError> {
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut req = httparse::Request::new(&mut headers);

    let head_len = match req.parse(buf) {
        Ok(httparse::Status::Complete(len)) => len,
        Ok(httparse::Status::Partial) => return Ok(None),
        Err(e) => return Err(HeadError::Malformed(e.to_string())),
    };

    let method = req.method.unwrap_or_default().to_string();
    let target = req.path.unwrap_or_default().to_string();
    if method.is_empty() || target.is_empty() {
        return Err(HeadError::Malformed("empty request line".to_string()));
    }

    Ok(Some(RequestHead {
        method,
        target,
        headers: owned_headers(req.headers),
        head_len,
    }))
}

/// Read until a full request head is buffered. Bytes already in `buf` (from
/// sniffing) are parsed first.
pub async fn read_request_head<R: AsyncRead + Unpin>(
    stream: &mut R,
    buf: &mut Vec<u8>,
    max_bytes: usize,
) -> Result<RequestHead, HeadError> {
    let mut chunk = [0u8; 4096];
    loop {
        if let Some(head) = parse_request(buf)? {
            return Ok(head);
        }
        if buf.len() >= max_bytes {
            return Err(HeadError::TooLarge(max_bytes));
        }

        let limit = (max_bytes - buf.len()).min(chunk.len());
        let n = stream.read(&mut chunk[..limit]).await?;
        if n == 0 {
            return Err(if buf.is_empty() {
                HeadError::Closed
            } else {
                HeadError::Malformed("truncated request head".to_string())
            });
        }
        buf.extend_from_slice(&chunk[..n]);
    }
}

fn owned_headers(headers: &[httparse::Header<'_>]) -> Vec<(String, String)> {
    headers
        .iter()
        .map(|h| {
            (
                h.name.to_string(),
                String::from_utf8_lossy(h.value).trim().to_string(),
            )
        })
        .collect()
}

/// Split `host[:port]`, including bracketed IPv6 literals
pub fn split_host_port(host: &str) -> (&str, Option<u16>) {
    if let Some(rest) = host.strip_prefix('[') {
        return match rest.split_once(']') {
            Some((ip, tail)) => (ip, tail.strip_prefix(':').and_then(|p| p.parse().ok())),
            None => (host, None),
        };
    }
    match host.rsplit_once(':') {
        Some((name, port)) if !name.contains(':') => (name, port.parse().ok()),
        _ => (host, None),
    }
}

pub fn is_ip_literal(host: &str) -> bool {
    host.parse::<IpAddr>().is_ok()
}

/// Hostnames allowed into routing and logs: DNS characters only
pub fn is_valid_hostname(host: &str) -> bool {
    !host.is_empty()
        && host.len() <= MAX_HOSTNAME_LEN
        && host
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '.' || c == '_')
}

/// Per-request values the gateway stamps onto the forwarded head
#[derive(Debug, Clone)]
pub struct ForwardContext<'a> {
    pub client_ip: IpAddr,
    pub host: &'a str,
    pub proto: &'static str,
    pub request_id: &'a str,
}

/// Rebuild the head for the backend: new request target, gateway-owned
/// headers replaced, and `Connection: close` so every backend connection
/// carries exactly one request
pub fn forward_head(head: &RequestHead, target: &str, ctx: &ForwardContext<'_>) -> Vec<u8> {
    let mut out = format!("{} {} HTTP/1.1\r\n", head.method, target);

    for (name, value) in &head.headers {
        if REPLACED_HEADERS.iter().any(|h| name.eq_ignore_ascii_case(h)) {
            continue;
        }
        out.push_str(&format!("{}: {}\r\n", name, value));
    }

    out.push_str("Connection: close\r\n");
    out.push_str(&format!("X-Forwarded-For: {}\r\n", ctx.client_ip));
    out.push_str(&format!("X-Forwarded-Host: {}\r\n", ctx.host));
    out.push_str(&format!("X-Forwarded-Proto: {}\r\n", ctx.proto));
    out.push_str(&format!("X-Request-ID: {}\r\n", ctx.request_id));
    out.push_str("\r\n");
    out.into_bytes()
}

/// Request target with `path` replaced and the original query kept
pub fn with_query(path: &str, query: Option<&str>) -> String {
    match query {
        Some(q) => format!("{}?{}", path, q),
        None => path.to_string(),
    }
}

/// `https://host[:port]target`, omitting the default port. Port 0 means
/// this gateway does not listen for HTTPS, so the default port is assumed.
pub fn https_location(host: &str, https_port: u16, target: &str) -> String {
    if https_port == 443 || https_port == 0 {
        format!("https://{}{}", host, target)
    } else {
        format!("https://{}:{}{}", host, https_port, target)
    }
}

pub fn redirect_response(status: u16, location: &str) -> Vec<u8> {
    format!(
        "HTTP/1.1 {} {}\r\n\
         Location: {}\r\n\
         Content-Length: 0\r\n\
         Cache-Control: no-store\r\n\
         Connection: close\r\n\
         \r\n",
        status,
        reason_phrase(status),
        location
    )
    .into_bytes()
}

/// Serialize a cached response for a client, marked as a cache hit
pub fn render_cached(entry: &CachedResponse) -> Vec<u8> {
    let mut head = format!("HTTP/1.1 {} {}\r\n", entry.status, reason_phrase(entry.status));
    for (name, value) in &entry.headers {
        if CACHE_SKIPPED_HEADERS
            .iter()
            .any(|h| name.eq_ignore_ascii_case(h))
        {
            continue;
        }
        head.push_str(&format!("{}: {}\r\n", name, value));
    }
    head.push_str(&format!("Content-Length: {}\r\n", entry.body.len()));
    head.push_str("X-Cache: HIT\r\n");
    head.push_str("Connection: close\r\n\r\n");

    let mut out = head.into_bytes();
    out.extend_from_slice(&entry.body);
    out
}

/// A parsed backend status line and header block
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseHead {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub head_len: usize,
}

impl ResponseHead {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn content_length(&self) -> Option<usize> {
        self.header("content-length").and_then(|v| v.parse().ok())
    }
}

/// Complete response head at the start of `buf`, if there is one
pub fn parse_response_head(buf: &[u8]) -> Option<ResponseHead> {
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut resp = httparse::Response::new(&mut headers);
    match resp.parse(buf) {
        Ok(httparse::Status::Complete(head_len)) => Some(ResponseHead {
            status: resp.code?,
            headers: owned_headers(resp.headers),
            head_len,
        }),
        _ => None,
    }
}

/// Status code from the first response chunk, even if the head is not yet
/// complete
pub fn status_hint(chunk: &[u8]) -> Option<u16> {
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut resp = httparse::Response::new(&mut headers);
    let _ = resp.parse(chunk);
    if resp.code.is_some() {
        return resp.code;
    }

    // The header block may have overflowed the parser; the status line is
    // all that matters here
    let line = chunk.split(|&b| b == b'\n').next()?;
    let line = std::str::from_utf8(line).ok()?;
    let mut parts = line.split_whitespace();
    if !parts.next()?.starts_with("HTTP/") {
        return None;
    }
    parts.next()?.parse().ok()
}

pub fn reason_phrase(status: u16) -> &'static str {
    match status {
        100 => "Continue",
        101 => "Switching Protocols",
        200 => "OK",
        201 => "Created",
        202 => "Accepted",
        204 => "No Content",
        206 => "Partial Content",
        301 => "Moved Permanently",
        302 => "Found",
        303 => "See Other",
        304 => "Not Modified",
        307 => "Temporary Redirect",
        308 => "Permanent Redirect",
        400 => "Bad Request",
        401 => "Unauthorized",
        403 => "Forbidden",
        404 => "Not Found",
        405 => "Method Not Allowed",
        408 => "Request Timeout",
        413 => "Payload Too Large",
        429 => "Too Many Requests",
        431 => "Request Header Fields Too Large",
        500 => "Internal Server Error",
        502 => "Bad Gateway",
        503 => "Service Unavailable",
        504 => "Gateway Timeout",
        _ => "Unknown",
    }
}
