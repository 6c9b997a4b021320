//! High-level database interface.

use std::path::PathBuf;

use directories::ProjectDirs;
use tracing::info;

use crate::error::{Result, StorageError};
use crate::models::Entry;
use crate::connection::SharedConnection;
use crate::repository::KvRepo;

/// High-level database interface for SkyProxy.
#[derive(Clone)]
pub struct Database {
    conn: SharedConnection,
}

impl Database {
    /// Create a new database in the default app data directory.
    pub fn new() -> Result<Self> {
        Self::with_path(Self::default_db_path()?)
    }

    /// Create a new database at a specific path.
    pub fn with_path(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();

        // Create parent directories if they don't exist
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        info!("Opening database at: {:?}", path);
        let conn = SharedConnection::open(&path)?;

        Ok(Self { conn })
    }

    /// Create an in-memory database (for testing).
    pub fn in_memory() -> Result<Self> {
        let conn = SharedConnection::open_in_memory()?;
        Ok(Self { conn })
    }

    /// Get the default database path.
    pub fn default_db_path() -> Result<PathBuf> {
        let proj_dirs = ProjectDirs::from("com", "skyproxy", "skyproxy")
            .ok_or_else(|| StorageError::Config("Could not determine app data directory".into()))?;

        Ok(proj_dirs.data_dir().join("skyproxy.db"))
    }

    /// Get a stored value. Missing keys return `None`.
    pub fn get_value(&self, key: &str) -> Result<Option<serde_json::Value>> {
        Ok(self.get_entry(key)?.map(|e| e.value))
    }

    /// Get a stored record with its timestamp.
    pub fn get_entry(&self, key: &str) -> Result<Option<Entry>> {
        let conn = self.conn.lock()?;
        KvRepo::get(&conn, key)
    }

    /// Store a value.
    pub fn set_value(&self, key: &str, value: &serde_json::Value) -> Result<()> {
        let conn = self.conn.lock()?;
        KvRepo::set(&conn, key, value)
    }

    /// Store several values atomically.
    pub fn set_values(&self, entries: &[(&str, serde_json::Value)]) -> Result<()> {
        let mut conn = self.conn.lock()?;
        KvRepo::set_many(&mut conn, entries)
    }
}
