//! SQLite database holding container, ingress and static route state
//!
//! The gateway reads this store on every reload tick. The only writes it
//! issues itself are static route registration and removal; the remaining
//! write operations exist for provisioning tooling and tests.

use anyhow::{Context, Result};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

/// Current schema version for migrations
const SCHEMA_VERSION: i32 = 2;

/// Database connection wrapper with thread-safe access
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    /// Open or create a database at the given path
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let conn = Connection::open(path).context("Failed to open database")?;

        // WAL lets the provisioning side write while we read
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")?;

        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };

        db.run_migrations()?;

        info!("Database opened at {}", path.display());
        Ok(db)
    }

    /// Open an in-memory database (for testing)
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("Failed to open in-memory database")?;

        conn.execute_batch("PRAGMA foreign_keys=ON;")?;

        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };

        db.run_migrations()?;
        Ok(db)
    }

    fn run_migrations(&self) -> Result<()> {
        let conn = self.conn.lock();

        conn.execute(
            "CREATE TABLE IF NOT EXISTS schema_migrations (
                version INTEGER PRIMARY KEY,
                applied_at TEXT NOT NULL DEFAULT (datetime('now'))
            )",
            [],
        )?;

        let current_version: i32 = conn
            .query_row(
                "SELECT COALESCE(MAX(version), 0) FROM schema_migrations",
                [],
                |row| row.get(0),
            )
            .unwrap_or(0);

        if current_version < SCHEMA_VERSION {
            info!("Running migrations from v{} to v{}", current_version, SCHEMA_VERSION);

            if current_version < 1 {
                self.migrate_v1(&conn)?;
            }

            if current_version < 2 {
                self.migrate_v2(&conn)?;
            }
        }

        Ok(())
    }

    /// Migration v1: containers, ingress rules and static routes
    fn migrate_v1(&self, conn: &Connection) -> Result<()> {
        debug!("Applying migration v1: routing schema");

        conn.execute_batch(r#"
            CREATE TABLE IF NOT EXISTS containers (
                id TEXT PRIMARY KEY,
                namespace TEXT NOT NULL,
                external_ip TEXT,
                status TEXT NOT NULL DEFAULT 'pending',
                ssh_enabled INTEGER NOT NULL DEFAULT 0,
                https_enabled INTEGER NOT NULL DEFAULT 0,
                owner_id TEXT,
                created_at TEXT NOT NULL DEFAULT (datetime('now'))
            );

            CREATE TABLE IF NOT EXISTS ingress_rules (
                container_id TEXT NOT NULL,
                port INTEGER NOT NULL,
                target_port INTEGER NOT NULL,
                created_at TEXT NOT NULL DEFAULT (datetime('now')),
                PRIMARY KEY (container_id, port),
                FOREIGN KEY (container_id) REFERENCES containers(id) ON DELETE CASCADE
            );

            CREATE TABLE IF NOT EXISTS static_routes (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                host TEXT NOT NULL,
                path_prefix TEXT NOT NULL,
                target TEXT NOT NULL,
                strip_prefix INTEGER NOT NULL DEFAULT 0,
                priority INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL DEFAULT (datetime('now')),
                UNIQUE (host, path_prefix)
            );

            CREATE INDEX IF NOT EXISTS idx_containers_status ON containers(status);
            CREATE INDEX IF NOT EXISTS idx_ingress_rules_container ON ingress_rules(container_id);

            INSERT INTO schema_migrations (version) VALUES (1);
        "#)?;

        Ok(())
    }

    /// Migration v2: SSH key ownership
    fn migrate_v2(&self, conn: &Connection) -> Result<()> {
        debug!("Applying migration v2: ssh keys");

        conn.execute_batch(r#"
            CREATE TABLE IF NOT EXISTS ssh_keys (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                user_id TEXT NOT NULL,
                fingerprint TEXT NOT NULL,
                public_key TEXT NOT NULL,
                created_at TEXT NOT NULL DEFAULT (datetime('now')),
                UNIQUE (user_id, fingerprint)
            );

            CREATE INDEX IF NOT EXISTS idx_ssh_keys_fingerprint ON ssh_keys(fingerprint);

            INSERT INTO schema_migrations (version) VALUES (2);
        "#)?;

        Ok(())
    }

    // ==================== Container Operations ====================

    /// Insert or replace a container row
    pub fn upsert_container(&self, container: &ContainerRecord) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO containers (id, namespace, external_ip, status, ssh_enabled, https_enabled, owner_id)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT(id) DO UPDATE SET
                namespace = excluded.namespace,
                external_ip = excluded.external_ip,
                status = excluded.status,
                ssh_enabled = excluded.ssh_enabled,
                https_enabled = excluded.https_enabled,
                owner_id = excluded.owner_id",
            params![
                container.id,
                container.namespace,
                container.external_ip,
                container.status,
                container.ssh_enabled,
                container.https_enabled,
                container.owner_id
            ],
        )?;
        Ok(())
    }

    /// Get a container by id regardless of status
    pub fn get_container(&self, id: &str) -> Result<Option<ContainerRecord>> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT id, namespace, external_ip, status, ssh_enabled, https_enabled, owner_id
             FROM containers WHERE id = ?1",
            params![id],
            |row| {
                Ok(ContainerRecord {
                    id: row.get(0)?,
                    namespace: row.get(1)?,
                    external_ip: row.get(2)?,
                    status: row.get(3)?,
                    ssh_enabled: row.get(4)?,
                    https_enabled: row.get(5)?,
                    owner_id: row.get(6)?,
                })
            },
        )
        .optional()
        .context("Failed to get container")
    }

    /// Containers eligible for routing: running with a non-empty external IP
    pub fn list_running_containers(&self) -> Result<Vec<ContainerRecord>> {
        let conn = self.conn.lock();
        query_running_containers(&conn)
    }

    /// Update container status
    pub fn set_container_status(&self, id: &str, status: &str) -> Result<bool> {
        let conn = self.conn.lock();
        let rows = conn.execute(
            "UPDATE containers SET status = ?1 WHERE id = ?2",
            params![status, id],
        )?;
        Ok(rows > 0)
    }

    /// Delete a container and its ingress rules
    pub fn delete_container(&self, id: &str) -> Result<bool> {
        let conn = self.conn.lock();
        let rows = conn.execute("DELETE FROM containers WHERE id = ?1", params![id])?;
        Ok(rows > 0)
    }

    // ==================== Ingress Rule Operations ====================

    /// Open an ingress port for a container
    pub fn add_ingress_rule(&self, container_id: &str, port: u16, target_port: u16) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO ingress_rules (container_id, port, target_port) VALUES (?1, ?2, ?3)
             ON CONFLICT(container_id, port) DO UPDATE SET target_port = excluded.target_port",
            params![container_id, port, target_port],
        )?;
        Ok(())
    }

    /// Close an ingress port for a container
    pub fn remove_ingress_rule(&self, container_id: &str, port: u16) -> Result<bool> {
        let conn = self.conn.lock();
        let rows = conn.execute(
            "DELETE FROM ingress_rules WHERE container_id = ?1 AND port = ?2",
            params![container_id, port],
        )?;
        Ok(rows > 0)
    }

    /// All ingress rules in insertion order
    pub fn list_ingress_rules(&self) -> Result<Vec<IngressRuleRecord>> {
        let conn = self.conn.lock();
        query_ingress_rules(&conn)
    }

    // ==================== Static Route Operations ====================

    /// Insert a route or update the one already registered for `(host, path_prefix)`
    pub fn save_static_route(&self, route: &StaticRouteRecord) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO static_routes (host, path_prefix, target, strip_prefix, priority)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(host, path_prefix) DO UPDATE SET
                target = excluded.target,
                strip_prefix = excluded.strip_prefix,
                priority = excluded.priority",
            params![
                route.host,
                route.path_prefix,
                route.target,
                route.strip_prefix,
                route.priority
            ],
        )?;
        Ok(())
    }

    /// Delete a static route
    pub fn remove_static_route(&self, host: &str, path_prefix: &str) -> Result<bool> {
        let conn = self.conn.lock();
        let rows = conn.execute(
            "DELETE FROM static_routes WHERE host = ?1 AND path_prefix = ?2",
            params![host, path_prefix],
        )?;
        Ok(rows > 0)
    }

    /// All static routes in registration order
    pub fn list_static_routes(&self) -> Result<Vec<StaticRouteRecord>> {
        let conn = self.conn.lock();
        query_static_routes(&conn)
    }

    /// Containers, ingress rules and static routes read inside one
    /// transaction, so a concurrent writer never yields a torn view
    pub fn read_routing_state(&self) -> Result<RoutingRows> {
        let conn = self.conn.lock();
        let tx = conn
            .unchecked_transaction()
            .context("Failed to begin routing read")?;

        let rows = RoutingRows {
            containers: query_running_containers(&tx)?,
            ingress_rules: query_ingress_rules(&tx)?,
            static_routes: query_static_routes(&tx)?,
        };

        tx.commit().context("Failed to finish routing read")?;
        Ok(rows)
    }

    // ==================== SSH Key Operations ====================

    /// Register a public key for a user. The key is stored with the same
    /// fingerprint format the gateway computes when validating.
    pub fn add_ssh_key(&self, user_id: &str, public_key: &str) -> Result<String> {
        let fingerprint = crate::sshkey::fingerprint(public_key)
            .context("Failed to fingerprint public key")?;

        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO ssh_keys (user_id, fingerprint, public_key) VALUES (?1, ?2, ?3)
             ON CONFLICT(user_id, fingerprint) DO NOTHING",
            params![user_id, fingerprint, public_key.trim()],
        )?;
        Ok(fingerprint)
    }

    /// Whether the fingerprint belongs to the user owning the container
    pub fn ssh_key_owns_container(&self, container_id: &str, fingerprint: &str) -> Result<bool> {
        let conn = self.conn.lock();
        let found: Option<i64> = conn
            .query_row(
                "SELECT 1 FROM ssh_keys k
                 JOIN containers c ON c.owner_id = k.user_id
                 WHERE c.id = ?1 AND k.fingerprint = ?2
                 LIMIT 1",
                params![container_id, fingerprint],
                |row| row.get(0),
            )
            .optional()
            .context("Failed to look up ssh key ownership")?;
        Ok(found.is_some())
    }
}

fn query_running_containers(conn: &Connection) -> Result<Vec<ContainerRecord>> {
    let mut stmt = conn.prepare(
        "SELECT id, namespace, external_ip, status, ssh_enabled, https_enabled, owner_id
         FROM containers
         WHERE status = 'running' AND external_ip IS NOT NULL AND external_ip != ''
         ORDER BY rowid",
    )?;

    let containers = stmt
        .query_map([], |row| {
            Ok(ContainerRecord {
                id: row.get(0)?,
                namespace: row.get(1)?,
                external_ip: row.get(2)?,
                status: row.get(3)?,
                ssh_enabled: row.get(4)?,
                https_enabled: row.get(5)?,
                owner_id: row.get(6)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;

    Ok(containers)
}

fn query_ingress_rules(conn: &Connection) -> Result<Vec<IngressRuleRecord>> {
    let mut stmt = conn.prepare(
        "SELECT container_id, port, target_port FROM ingress_rules ORDER BY rowid",
    )?;

    let rules = stmt
        .query_map([], |row| {
            Ok(IngressRuleRecord {
                container_id: row.get(0)?,
                port: row.get(1)?,
                target_port: row.get(2)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;

    Ok(rules)
}

fn query_static_routes(conn: &Connection) -> Result<Vec<StaticRouteRecord>> {
    let mut stmt = conn.prepare(
        "SELECT host, path_prefix, target, strip_prefix, priority
         FROM static_routes ORDER BY id",
    )?;

    let routes = stmt
        .query_map([], |row| {
            Ok(StaticRouteRecord {
                host: row.get(0)?,
                path_prefix: row.get(1)?,
                target: row.get(2)?,
                strip_prefix: row.get(3)?,
                priority: row.get(4)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;

    Ok(routes)
}

// ==================== Record Types ====================

/// Everything the router needs, read as one snapshot
#[derive(Debug, Clone, Default)]
pub struct RoutingRows {
    pub containers: Vec<ContainerRecord>,
    pub ingress_rules: Vec<IngressRuleRecord>,
    pub static_routes: Vec<StaticRouteRecord>,
}

/// Container record from database
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerRecord {
    pub id: String,
    pub namespace: String,
    pub external_ip: Option<String>,
    pub status: String,
    pub ssh_enabled: bool,
    pub https_enabled: bool,
    pub owner_id: Option<String>,
}

/// Ingress rule record from database
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngressRuleRecord {
    pub container_id: String,
    pub port: i64,
    pub target_port: i64,
}

/// Static route record from database
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StaticRouteRecord {
    pub host: String,
    pub path_prefix: String,
    pub target: String,
    pub strip_prefix: bool,
    pub priority: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    const ED25519_KEY: &str = "ssh-ed25519 AAAAC3NzaC1lZDI1NTE5AAAAIAECAwQFBgcICQoLDA0ODxAREhMUFRYXGBkaGxwdHh8g alice@laptop";

    fn container(id: &str, owner: &str) -> ContainerRecord {
        ContainerRecord {
            id: id.to_string(),
            namespace: "ns".to_string(),
            external_ip: Some("10.0.0.1".to_string()),
            status: "running".to_string(),
            ssh_enabled: true,
            https_enabled: false,
            owner_id: Some(owner.to_string()),
        }
    }

    #[test]
    fn test_migrations_are_idempotent() {
        let db = Database::open_in_memory().unwrap();
        db.run_migrations().unwrap();
        let version: i32 = db
            .conn
            .lock()
            .query_row("SELECT MAX(version) FROM schema_migrations", [], |row| row.get(0))
            .unwrap();
        assert_eq!(version, SCHEMA_VERSION);
    }

    #[test]
    fn test_open_file_database() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("gateway.db");
        let db = Database::open(&path).unwrap();
        db.upsert_container(&container("abc", "u1")).unwrap();
        drop(db);

        let reopened = Database::open(&path).unwrap();
        assert!(reopened.get_container("abc").unwrap().is_some());
    }

    #[test]
    fn test_upsert_container_updates_in_place() {
        let db = Database::open_in_memory().unwrap();
        db.upsert_container(&container("abc", "u1")).unwrap();

        let mut updated = container("abc", "u1");
        updated.https_enabled = true;
        db.upsert_container(&updated).unwrap();

        let got = db.get_container("abc").unwrap().unwrap();
        assert!(got.https_enabled);
        assert_eq!(db.list_running_containers().unwrap().len(), 1);
    }

    #[test]
    fn test_status_change_hides_container() {
        let db = Database::open_in_memory().unwrap();
        db.upsert_container(&container("abc", "u1")).unwrap();
        assert!(db.set_container_status("abc", "stopped").unwrap());
        assert!(db.list_running_containers().unwrap().is_empty());
        assert!(!db.set_container_status("missing", "running").unwrap());
    }

    #[test]
    fn test_delete_container_cascades_ingress_rules() {
        let db = Database::open_in_memory().unwrap();
        db.upsert_container(&container("abc", "u1")).unwrap();
        db.add_ingress_rule("abc", 8080, 3000).unwrap();
        db.add_ingress_rule("abc", 8080, 3001).unwrap();

        let rules = db.list_ingress_rules().unwrap();
        assert_eq!(rules.len(), 1);
        assert_eq!(rules[0].target_port, 3001);

        assert!(db.delete_container("abc").unwrap());
        assert!(db.list_ingress_rules().unwrap().is_empty());
    }

    #[test]
    fn test_ingress_rule_requires_container() {
        let db = Database::open_in_memory().unwrap();
        assert!(db.add_ingress_rule("ghost", 8080, 3000).is_err());
    }

    #[test]
    fn test_static_route_upsert_keeps_registration_order() {
        let db = Database::open_in_memory().unwrap();
        let route = |prefix: &str, target: &str| StaticRouteRecord {
            host: "api.example.com".to_string(),
            path_prefix: prefix.to_string(),
            target: target.to_string(),
            strip_prefix: false,
            priority: 0,
        };

        db.save_static_route(&route("/", "a:80")).unwrap();
        db.save_static_route(&route("/api", "b:80")).unwrap();
        db.save_static_route(&route("/", "c:80")).unwrap();

        let routes = db.list_static_routes().unwrap();
        assert_eq!(routes.len(), 2);
        assert_eq!(routes[0].path_prefix, "/");
        assert_eq!(routes[0].target, "c:80");
        assert_eq!(routes[1].path_prefix, "/api");

        assert!(db.remove_static_route("api.example.com", "/api").unwrap());
        assert!(!db.remove_static_route("api.example.com", "/api").unwrap());
    }

    #[test]
    fn test_ssh_key_ownership() {
        let db = Database::open_in_memory().unwrap();
        db.upsert_container(&container("abc", "alice")).unwrap();
        db.upsert_container(&container("def", "bob")).unwrap();

        let fingerprint = db.add_ssh_key("alice", ED25519_KEY).unwrap();
        // Adding the same key twice is a no-op
        assert_eq!(db.add_ssh_key("alice", ED25519_KEY).unwrap(), fingerprint);

        assert!(db.ssh_key_owns_container("abc", &fingerprint).unwrap());
        assert!(!db.ssh_key_owns_container("def", &fingerprint).unwrap());
        assert!(!db.ssh_key_owns_container("abc", "00:11").unwrap());
    }

    #[test]
    fn test_routing_state_ignores_uncommitted_writes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gateway.db");
        let db = Database::open(&path).unwrap();
        db.upsert_container(&container("abc", "u1")).unwrap();
        db.add_ingress_rule("abc", 2222, 22).unwrap();

        let mut writer = Connection::open(&path).unwrap();
        let tx = writer.transaction().unwrap();
        tx.execute(
            "INSERT INTO containers (id, namespace, external_ip, status) VALUES ('def', 'ns', '10.0.0.2', 'running')",
            [],
        )
        .unwrap();
        tx.execute(
            "INSERT INTO ingress_rules (container_id, port, target_port) VALUES ('def', 2223, 22)",
            [],
        )
        .unwrap();

        let rows = db.read_routing_state().unwrap();
        assert_eq!(rows.containers.len(), 1);
        assert_eq!(rows.ingress_rules.len(), 1);
        assert!(rows.static_routes.is_empty());

        tx.commit().unwrap();
        let rows = db.read_routing_state().unwrap();
        assert_eq!(rows.containers.len(), 2);
        assert_eq!(rows.ingress_rules.len(), 2);
    }

    #[test]
    fn test_add_invalid_ssh_key_fails() {
        let db = Database::open_in_memory().unwrap();
        assert!(db.add_ssh_key("alice", "not a key").is_err());
    }
}
