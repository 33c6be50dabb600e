//! Cloudgate - An edge gateway for container workloads
//!
//! This library provides the routing and proxy engine that:
//! - Multiplexes SSH, TLS and HTTP on shared ports by sniffing the first bytes
//! - Routes by TLS SNI, HTTP Host, or ingress port to containers and static backends
//! - Keeps an in-memory routing snapshot refreshed from a SQLite store
//! - Caches static-route lookups and idempotent responses in bounded LRU caches
//! - Terminates TLS on the HTTPS listener and redirects plain traffic where required

pub mod admin;
pub mod config;
pub mod db;
pub mod error;
pub mod http1;
pub mod lru;
pub mod proxy;
pub mod resolve;
pub mod response_cache;
pub mod route_cache;
pub mod router;
pub mod sni;
pub mod sniff;
pub mod sshkey;
pub mod store;
pub mod tls;
