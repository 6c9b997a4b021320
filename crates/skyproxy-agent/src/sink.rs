//! Proxy settings sinks.
//!
//! A sink is the host-owned place where the active proxy configuration lives.
//! The background dispatcher is the only caller; everything else goes through
//! `SET_PROXY` / `GET_PROXY` messages.

use std::sync::Arc;

use async_trait::async_trait;
use skyproxy_core::ProxyConfig;
use skyproxy_storage::keys;
use tracing::{debug, info};

use crate::error::SinkError;
use crate::store::KeyValueStore;

/// Applies and reports the host's proxy configuration.
#[async_trait]
pub trait ProxySettingsSink: Send + Sync {
    /// Short name for logs and status output.
    fn name(&self) -> &'static str;

    /// Makes `config` the active configuration.
    async fn apply(&self, config: &ProxyConfig) -> Result<(), SinkError>;

    /// Returns the active configuration.
    async fn query(&self) -> Result<ProxyConfig, SinkError>;
}

/// Sink that records the applied configuration in the key-value store.
///
/// Used on hosts without a system proxy service, and by anything that reads
/// the `appliedProxyConfig` key itself.
pub struct StoredSink {
    store: Arc<dyn KeyValueStore>,
}

impl StoredSink {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl ProxySettingsSink for StoredSink {
    fn name(&self) -> &'static str {
        "stored"
    }

    async fn apply(&self, config: &ProxyConfig) -> Result<(), SinkError> {
        let value =
            serde_json::to_value(config).map_err(|e| SinkError::Invalid(e.to_string()))?;
        self.store.set(keys::APPLIED_CONFIG, value).await?;
        info!(config = %config, "Stored proxy configuration");
        Ok(())
    }

    async fn query(&self) -> Result<ProxyConfig, SinkError> {
        match self.store.get(keys::APPLIED_CONFIG).await? {
            None | Some(serde_json::Value::Null) => {
                debug!("No stored proxy configuration, reporting direct");
                Ok(ProxyConfig::Direct)
            }
            Some(value) => {
                serde_json::from_value(value).map_err(|e| SinkError::Invalid(e.to_string()))
            }
        }
    }
}
