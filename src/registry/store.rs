//! Durable state: service definitions, API keys, and settings.
//!
//! Uses `rusqlite` synchronously behind a mutex; every call is short-lived
//! and never held across an await point. Lifecycle changes that touch more
//! than one statement run inside a transaction.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;

use anyhow::Context;
use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use sha2::{Digest, Sha256};
use tracing::debug;

use super::models::{ApiKeyRecord, DesiredStatus, ServiceDefinition};
use crate::error::GatewayError;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS services (
    id                    TEXT PRIMARY KEY,
    name                  TEXT NOT NULL,
    entry_point           TEXT NOT NULL,
    working_dir           TEXT NOT NULL,
    args                  TEXT NOT NULL DEFAULT '[]',
    env                   TEXT NOT NULL DEFAULT '{}',
    proxy_path            TEXT NOT NULL UNIQUE,
    rate_limit            INTEGER NOT NULL DEFAULT 100,
    cache_ttl             INTEGER NOT NULL DEFAULT 0,
    cache_enabled         INTEGER NOT NULL DEFAULT 1,
    timeout_ms            INTEGER NOT NULL DEFAULT 30000,
    auto_restart          INTEGER NOT NULL DEFAULT 0,
    max_restarts          INTEGER NOT NULL DEFAULT 3,
    health_check_interval INTEGER NOT NULL DEFAULT 30,
    desired_status        TEXT NOT NULL DEFAULT 'stopped'
);

CREATE TABLE IF NOT EXISTS api_keys (
    hash       TEXT PRIMARY KEY,
    name       TEXT NOT NULL,
    active     INTEGER NOT NULL DEFAULT 1,
    created_at TEXT NOT NULL,
    last_used  TEXT
);

CREATE TABLE IF NOT EXISTS settings (
    key       TEXT PRIMARY KEY,
    value     TEXT NOT NULL,
    encrypted INTEGER NOT NULL DEFAULT 0,
    category  TEXT NOT NULL DEFAULT 'general'
);
";

/// SHA-256 of an API-key secret, hex-encoded. The only form ever persisted.
pub fn hash_secret(secret: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(secret.as_bytes());
    format!("{:x}", hasher.finalize())
}

pub struct Registry {
    conn: Mutex<Connection>,
}

impl Registry {
    pub fn open(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let conn = Connection::open(path.as_ref())
            .with_context(|| format!("opening store at {}", path.as_ref().display()))?;
        conn.pragma_update(None, "journal_mode", "WAL")
            .context("enabling WAL")?;
        conn.pragma_update(None, "foreign_keys", "ON")
            .context("enabling foreign keys")?;
        conn.execute_batch(SCHEMA).context("initialising schema")?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// In-memory store, used by tests.
    pub fn open_in_memory() -> anyhow::Result<Self> {
        let conn = Connection::open_in_memory().context("opening in-memory store")?;
        conn.execute_batch(SCHEMA).context("initialising schema")?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Connection> {
        self.conn.lock().expect("registry lock poisoned")
    }

    // ------------------------------------------------------------------
    // Services
    // ------------------------------------------------------------------

    pub fn insert_service(&self, def: &ServiceDefinition) -> Result<(), GatewayError> {
        def.validate()?;
        let conn = self.lock();
        conn.execute(
            "INSERT INTO services (id, name, entry_point, working_dir, args, env, proxy_path,
                                   rate_limit, cache_ttl, cache_enabled, timeout_ms, auto_restart,
                                   max_restarts, health_check_interval, desired_status)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)",
            params![
                def.id,
                def.name,
                def.entry_point,
                def.working_dir,
                serde_json::to_string(&def.args)?,
                serde_json::to_string(&def.env)?,
                def.proxy_path,
                def.rate_limit,
                def.cache_ttl,
                def.cache_enabled,
                def.timeout_ms,
                def.auto_restart,
                def.max_restarts,
                def.health_check_interval,
                def.desired_status.as_str(),
            ],
        )
        .map_err(|e| map_constraint(e, &def.proxy_path))?;
        Ok(())
    }

    pub fn update_service(&self, def: &ServiceDefinition) -> Result<(), GatewayError> {
        def.validate()?;
        let conn = self.lock();
        let changed = conn
            .execute(
                "UPDATE services SET name = ?2, entry_point = ?3, working_dir = ?4, args = ?5,
                        env = ?6, proxy_path = ?7, rate_limit = ?8, cache_ttl = ?9,
                        cache_enabled = ?10, timeout_ms = ?11, auto_restart = ?12,
                        max_restarts = ?13, health_check_interval = ?14, desired_status = ?15
                 WHERE id = ?1",
                params![
                    def.id,
                    def.name,
                    def.entry_point,
                    def.working_dir,
                    serde_json::to_string(&def.args)?,
                    serde_json::to_string(&def.env)?,
                    def.proxy_path,
                    def.rate_limit,
                    def.cache_ttl,
                    def.cache_enabled,
                    def.timeout_ms,
                    def.auto_restart,
                    def.max_restarts,
                    def.health_check_interval,
                    def.desired_status.as_str(),
                ],
            )
            .map_err(|e| map_constraint(e, &def.proxy_path))?;
        if changed == 0 {
            return Err(GatewayError::NotFound);
        }
        Ok(())
    }

    pub fn delete_service(&self, id: &str) -> Result<bool, GatewayError> {
        let conn = self.lock();
        let changed = conn.execute("DELETE FROM services WHERE id = ?1", params![id])?;
        Ok(changed > 0)
    }

    pub fn get_service(&self, id: &str) -> Result<Option<ServiceDefinition>, GatewayError> {
        let conn = self.lock();
        conn.query_row(
            "SELECT id, name, entry_point, working_dir, args, env, proxy_path, rate_limit,
                    cache_ttl, cache_enabled, timeout_ms, auto_restart, max_restarts,
                    health_check_interval, desired_status
             FROM services WHERE id = ?1",
            params![id],
            row_to_service,
        )
        .optional()
        .map_err(Into::into)
    }

    pub fn list_services(&self) -> Result<Vec<ServiceDefinition>, GatewayError> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT id, name, entry_point, working_dir, args, env, proxy_path, rate_limit,
                    cache_ttl, cache_enabled, timeout_ms, auto_restart, max_restarts,
                    health_check_interval, desired_status
             FROM services ORDER BY name",
        )?;
        let rows = stmt.query_map([], row_to_service)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    /// Persist user intent for a service's lifecycle. The management layer is
    /// the only writer; supervisor-internal transitions never touch this.
    pub fn set_desired_status(&self, id: &str, status: DesiredStatus) -> Result<(), GatewayError> {
        let conn = self.lock();
        let changed = conn.execute(
            "UPDATE services SET desired_status = ?2 WHERE id = ?1",
            params![id, status.as_str()],
        )?;
        if changed == 0 {
            return Err(GatewayError::NotFound);
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // API keys
    // ------------------------------------------------------------------

    /// Issue a new key and return the plaintext secret. The secret is shown
    /// exactly once; only its hash is stored.
    pub fn issue_api_key(&self, name: &str) -> Result<String, GatewayError> {
        let secret = format!("mcpg_{}", uuid::Uuid::new_v4().simple());
        let hash = hash_secret(&secret);
        let conn = self.lock();
        conn.execute(
            "INSERT INTO api_keys (hash, name, active, created_at) VALUES (?1, ?2, 1, ?3)",
            params![hash, name, Utc::now().to_rfc3339()],
        )?;
        Ok(secret)
    }

    /// Check a presented hash against the active keys, bumping `last_used`.
    pub fn verify_api_key(&self, hash: &str) -> Result<bool, GatewayError> {
        let conn = self.lock();
        let active: Option<bool> = conn
            .query_row(
                "SELECT active FROM api_keys WHERE hash = ?1",
                params![hash],
                |row| row.get(0),
            )
            .optional()?;
        if active == Some(true) {
            conn.execute(
                "UPDATE api_keys SET last_used = ?2 WHERE hash = ?1",
                params![hash, Utc::now().to_rfc3339()],
            )?;
            return Ok(true);
        }
        Ok(false)
    }

    pub fn revoke_api_key(&self, name: &str) -> Result<bool, GatewayError> {
        let conn = self.lock();
        let changed = conn.execute(
            "UPDATE api_keys SET active = 0 WHERE name = ?1 AND active = 1",
            params![name],
        )?;
        Ok(changed > 0)
    }

    pub fn list_api_keys(&self) -> Result<Vec<ApiKeyRecord>, GatewayError> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT hash, name, active, created_at, last_used FROM api_keys ORDER BY created_at",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(ApiKeyRecord {
                hash: row.get(0)?,
                name: row.get(1)?,
                active: row.get(2)?,
                created_at: row.get(3)?,
                last_used: row.get(4)?,
            })
        })?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    pub fn count_api_keys(&self) -> Result<u64, GatewayError> {
        let conn = self.lock();
        let count: u64 = conn.query_row("SELECT COUNT(*) FROM api_keys", [], |row| row.get(0))?;
        Ok(count)
    }

    // ------------------------------------------------------------------
    // Settings
    // ------------------------------------------------------------------

    /// Read a plaintext setting. Encrypted entries belong to the
    /// collaborator-owned store and are skipped here.
    pub fn get_setting(&self, key: &str) -> Result<Option<String>, GatewayError> {
        let conn = self.lock();
        let row: Option<(String, bool)> = conn
            .query_row(
                "SELECT value, encrypted FROM settings WHERE key = ?1",
                params![key],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        match row {
            Some((_, true)) => {
                debug!(key, "skipping encrypted setting");
                Ok(None)
            }
            Some((value, false)) => Ok(Some(value)),
            None => Ok(None),
        }
    }

    pub fn set_setting(&self, key: &str, value: &str, category: &str) -> Result<(), GatewayError> {
        let conn = self.lock();
        conn.execute(
            "INSERT INTO settings (key, value, encrypted, category) VALUES (?1, ?2, 0, ?3)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value, category = excluded.category",
            params![key, value, category],
        )?;
        Ok(())
    }

    // Typed accessors for the handful of settings the core reads itself.

    pub fn listen_host(&self) -> String {
        self.get_setting("listen_host")
            .ok()
            .flatten()
            .unwrap_or_else(|| "127.0.0.1".to_string())
    }

    pub fn listen_port(&self) -> u16 {
        self.get_setting("listen_port")
            .ok()
            .flatten()
            .and_then(|v| v.parse().ok())
            .unwrap_or(8811)
    }

    pub fn https_port(&self) -> u16 {
        self.get_setting("https_port")
            .ok()
            .flatten()
            .and_then(|v| v.parse().ok())
            .unwrap_or(8843)
    }

    pub fn ws_upgrade_path(&self) -> String {
        self.get_setting("ws_upgrade_path")
            .ok()
            .flatten()
            .unwrap_or_else(|| "/ws".to_string())
    }

    pub fn log_dir(&self) -> Option<String> {
        self.get_setting("log_dir").ok().flatten()
    }
}

fn row_to_service(row: &rusqlite::Row<'_>) -> rusqlite::Result<ServiceDefinition> {
    let args_json: String = row.get(4)?;
    let env_json: String = row.get(5)?;
    let desired: String = row.get(14)?;
    Ok(ServiceDefinition {
        id: row.get(0)?,
        name: row.get(1)?,
        entry_point: row.get(2)?,
        working_dir: row.get(3)?,
        args: serde_json::from_str(&args_json).unwrap_or_default(),
        env: serde_json::from_str::<HashMap<String, String>>(&env_json).unwrap_or_default(),
        proxy_path: row.get(6)?,
        rate_limit: row.get(7)?,
        cache_ttl: row.get(8)?,
        cache_enabled: row.get(9)?,
        timeout_ms: row.get(10)?,
        auto_restart: row.get(11)?,
        max_restarts: row.get(12)?,
        health_check_interval: row.get(13)?,
        desired_status: DesiredStatus::parse(&desired).unwrap_or(DesiredStatus::Stopped),
    })
}

fn map_constraint(e: rusqlite::Error, proxy_path: &str) -> GatewayError {
    if let rusqlite::Error::SqliteFailure(ref failure, _) = e {
        if failure.code == rusqlite::ErrorCode::ConstraintViolation {
            return GatewayError::Conflict(format!(
                "a service with proxyPath '{proxy_path}' already exists"
            ));
        }
    }
    e.into()
}
