//! Key-value store seam.
//!
//! The controller and the stored sink only need `get`/`set` on JSON values.
//! [`Database`] implements the trait by moving each call onto the blocking
//! pool, since rusqlite is synchronous.

use async_trait::async_trait;
use serde_json::Value;
use skyproxy_storage::Database;

use crate::error::StoreError;

/// Asynchronous key-value storage of JSON values.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    /// Reads a value. Missing keys return `None`.
    async fn get(&self, key: &str) -> Result<Option<Value>, StoreError>;

    /// Writes a value.
    async fn set(&self, key: &str, value: Value) -> Result<(), StoreError>;

    /// Writes several values in one step; either all land or none do.
    async fn set_many(&self, entries: Vec<(String, Value)>) -> Result<(), StoreError>;
}

async fn blocking<T, F>(db: &Database, f: F) -> Result<T, StoreError>
where
    T: Send + 'static,
    F: FnOnce(Database) -> skyproxy_storage::Result<T> + Send + 'static,
{
    let db = db.clone();
    tokio::task::spawn_blocking(move || f(db))
        .await
        .map_err(|e| StoreError::Task(e.to_string()))?
        .map_err(StoreError::from)
}

#[async_trait]
impl KeyValueStore for Database {
    async fn get(&self, key: &str) -> Result<Option<Value>, StoreError> {
        let key = key.to_string();
        blocking(self, move |db| db.get_value(&key)).await
    }

    async fn set(&self, key: &str, value: Value) -> Result<(), StoreError> {
        let key = key.to_string();
        blocking(self, move |db| db.set_value(&key, &value)).await
    }

    async fn set_many(&self, entries: Vec<(String, Value)>) -> Result<(), StoreError> {
        blocking(self, move |db| {
            let borrowed: Vec<(&str, Value)> = entries
                .iter()
                .map(|(k, v)| (k.as_str(), v.clone()))
                .collect();
            db.set_values(&borrowed)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use skyproxy_storage::keys;

    #[tokio::test]
    async fn test_database_store_roundtrip() {
        let db = Database::in_memory().unwrap();
        let store: &dyn KeyValueStore = &db;

        assert_eq!(store.get(keys::PROFILES).await.unwrap(), None);

        store
            .set_many(vec![
                (keys::PROFILES.to_string(), json!([])),
                (keys::ACTIVE_PROFILE.to_string(), json!(null)),
            ])
            .await
            .unwrap();

        assert_eq!(store.get(keys::PROFILES).await.unwrap(), Some(json!([])));
        assert_eq!(
            store.get(keys::ACTIVE_PROFILE).await.unwrap(),
            Some(json!(null))
        );

        store.set(keys::ACTIVE_PROFILE, json!(3)).await.unwrap();
        assert_eq!(db.get_value(keys::ACTIVE_PROFILE).unwrap(), Some(json!(3)));
    }
}
