//! Data models for storage.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A stored key-value record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entry {
    pub key: String,
    /// JSON value. Unparseable stored text reads back as `Null`.
    pub value: serde_json::Value,
    pub updated_at: DateTime<Utc>,
}
