//! SkyProxy Storage - SQLite persistence layer.
//!
//! A small key-value store holding JSON values, used as the agent's local
//! storage area. It holds:
//!
//! - The saved proxy profile list
//! - The index of the active profile
//! - The last proxy configuration applied through the stored settings sink
//!
//! # Example
//!
//! ```no_run
//! use skyproxy_storage::{keys, Database};
//! use serde_json::json;
//!
//! let db = Database::in_memory().unwrap();
//! db.set_value(keys::ACTIVE_PROFILE, &json!(0)).unwrap();
//! assert_eq!(db.get_value(keys::ACTIVE_PROFILE).unwrap(), Some(json!(0)));
//! ```

mod connection;
mod database;
pub mod error;
pub mod models;
pub mod repository;
mod schema;

pub use database::Database;
pub use error::{Result, StorageError};
pub use models::Entry;

/// Well-known storage keys.
pub mod keys {
    /// Ordered list of saved profiles.
    pub const PROFILES: &str = "proxyProfiles";
    /// Index of the active profile, or null.
    pub const ACTIVE_PROFILE: &str = "activeProfileId";
    /// Configuration last written by the stored settings sink.
    pub const APPLIED_CONFIG: &str = "appliedProxyConfig";
}
