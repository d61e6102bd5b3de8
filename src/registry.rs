//! Subdomain registry: key/value records plus the membership index
//!
//! The orchestrator only depends on the [`Registry`] trait. The bundled
//! implementation keeps both in a SQLite database so bindings survive
//! restarts.

use async_trait::async_trait;
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

/// Current schema version for migrations
const SCHEMA_VERSION: i32 = 1;

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("{0} is not found")]
    NotFound(String),
    #[error("{0}")]
    Storage(String),
}

impl From<rusqlite::Error> for RegistryError {
    fn from(err: rusqlite::Error) -> Self {
        RegistryError::Storage(err.to_string())
    }
}

/// Persistent key/value store with an ordered index of active subdomains
#[async_trait]
pub trait Registry: Send + Sync {
    /// Value stored under `key`, or [`RegistryError::NotFound`]
    async fn get(&self, key: &str) -> Result<Vec<u8>, RegistryError>;

    /// Store `value` under `key`, replacing any previous value
    async fn set(&self, key: &str, value: &[u8]) -> Result<(), RegistryError>;

    /// Delete `key`; deleting a missing key is not an error
    async fn remove(&self, key: &str) -> Result<(), RegistryError>;

    /// Add to the membership index; already-present subdomains keep their position
    async fn add_to_membership(&self, subdomain: &str) -> Result<(), RegistryError>;

    async fn remove_from_membership(&self, subdomain: &str) -> Result<(), RegistryError>;

    /// All indexed subdomains in insertion order
    async fn membership(&self) -> Result<Vec<String>, RegistryError>;
}

/// SQLite-backed registry with thread-safe access
pub struct SqliteRegistry {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteRegistry {
    /// Open or create a registry database at the given path
    pub fn open(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(path)
            .map_err(|e| anyhow::anyhow!("Failed to open registry at {}: {}", path.display(), e))?;
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;

        let registry = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        registry.run_migrations()?;

        info!(path = %path.display(), "Registry opened");
        Ok(registry)
    }

    /// Open an in-memory registry (for testing)
    pub fn open_in_memory() -> anyhow::Result<Self> {
        let conn = Connection::open_in_memory()?;
        let registry = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        registry.run_migrations()?;
        Ok(registry)
    }

    fn run_migrations(&self) -> anyhow::Result<()> {
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
            info!("Running registry migrations from v{} to v{}", current_version, SCHEMA_VERSION);

            if current_version < 1 {
                debug!("Applying migration v1: records and membership index");
                conn.execute_batch(
                    r#"
                    CREATE TABLE IF NOT EXISTS records (
                        key TEXT PRIMARY KEY,
                        value BLOB NOT NULL,
                        updated_at TEXT NOT NULL DEFAULT (datetime('now'))
                    );

                    CREATE TABLE IF NOT EXISTS membership (
                        position INTEGER PRIMARY KEY AUTOINCREMENT,
                        subdomain TEXT NOT NULL UNIQUE
                    );

                    INSERT INTO schema_migrations (version) VALUES (1);
                    "#,
                )?;
            }
        }

        Ok(())
    }
}

#[async_trait]
impl Registry for SqliteRegistry {
    async fn get(&self, key: &str) -> Result<Vec<u8>, RegistryError> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT value FROM records WHERE key = ?1",
            params![key],
            |row| row.get::<_, Vec<u8>>(0),
        )
        .optional()?
        .ok_or_else(|| RegistryError::NotFound(key.to_string()))
    }

    async fn set(&self, key: &str, value: &[u8]) -> Result<(), RegistryError> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO records (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = datetime('now')",
            params![key, value],
        )?;
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<(), RegistryError> {
        let conn = self.conn.lock();
        conn.execute("DELETE FROM records WHERE key = ?1", params![key])?;
        Ok(())
    }

    async fn add_to_membership(&self, subdomain: &str) -> Result<(), RegistryError> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT OR IGNORE INTO membership (subdomain) VALUES (?1)",
            params![subdomain],
        )?;
        Ok(())
    }

    async fn remove_from_membership(&self, subdomain: &str) -> Result<(), RegistryError> {
        let conn = self.conn.lock();
        conn.execute("DELETE FROM membership WHERE subdomain = ?1", params![subdomain])?;
        Ok(())
    }

    async fn membership(&self) -> Result<Vec<String>, RegistryError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare("SELECT subdomain FROM membership ORDER BY position")?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
        let mut subdomains = Vec::new();
        for row in rows {
            subdomains.push(row?);
        }
        Ok(subdomains)
    }
}
