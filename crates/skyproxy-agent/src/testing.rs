//! In-memory test doubles.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use skyproxy_core::{ProxyConfig, ProxyRules};
use skyproxy_storage::{Database, StorageError};
use tokio::sync::Notify;

use crate::error::{ProbeError, SinkError, StoreError};
use crate::probe::ConnectivityProbe;
use crate::sink::ProxySettingsSink;
use crate::store::KeyValueStore;

fn io_failure() -> StoreError {
    StoreError::Storage(StorageError::Io(std::io::Error::other("disk I/O error")))
}

/// Store over a real [`Database`] that can be told to fail reads of one key
/// or every write.
pub struct FlakyStore {
    inner: Database,
    unreadable: Mutex<Option<String>>,
    fail_writes: AtomicBool,
}

impl FlakyStore {
    pub fn new(inner: Database) -> Self {
        Self {
            inner,
            unreadable: Mutex::new(None),
            fail_writes: AtomicBool::new(false),
        }
    }

    pub fn fail_reads_of(&self, key: &str) {
        *self.unreadable.lock() = Some(key.to_string());
    }

    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    fn check_write(&self) -> Result<(), StoreError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(io_failure());
        }
        Ok(())
    }
}

#[async_trait]
impl KeyValueStore for FlakyStore {
    async fn get(&self, key: &str) -> Result<Option<Value>, StoreError> {
        if self.unreadable.lock().as_deref() == Some(key) {
            return Err(io_failure());
        }
        self.inner.get(key).await
    }

    async fn set(&self, key: &str, value: Value) -> Result<(), StoreError> {
        self.check_write()?;
        self.inner.set(key, value).await
    }

    async fn set_many(&self, entries: Vec<(String, Value)>) -> Result<(), StoreError> {
        self.check_write()?;
        self.inner.set_many(entries).await
    }
}

/// Sink that keeps the configuration in memory and can be told to fail.
#[derive(Default)]
pub struct MemorySink {
    config: Mutex<ProxyConfig>,
    applied: Mutex<Vec<ProxyConfig>>,
    reject_fixed: AtomicBool,
    reject_all: AtomicBool,
    fail_query: AtomicBool,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_config(config: ProxyConfig) -> Self {
        let sink = Self::default();
        *sink.config.lock() = config;
        sink
    }

    /// Rejects fixed-server configurations; direct still applies.
    pub fn reject_fixed(&self, reject: bool) {
        self.reject_fixed.store(reject, Ordering::SeqCst);
    }

    /// Rejects every apply.
    pub fn reject_all(&self, reject: bool) {
        self.reject_all.store(reject, Ordering::SeqCst);
    }

    pub fn fail_query(&self, fail: bool) {
        self.fail_query.store(fail, Ordering::SeqCst);
    }

    pub fn current(&self) -> ProxyConfig {
        self.config.lock().clone()
    }

    /// Every configuration successfully applied, oldest first.
    pub fn applied(&self) -> Vec<ProxyConfig> {
        self.applied.lock().clone()
    }
}

#[async_trait]
impl ProxySettingsSink for MemorySink {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn apply(&self, config: &ProxyConfig) -> Result<(), SinkError> {
        if self.reject_all.load(Ordering::SeqCst)
            || (!config.is_direct() && self.reject_fixed.load(Ordering::SeqCst))
        {
            return Err(SinkError::Command {
                command: "apply".to_string(),
                stderr: "rejected".to_string(),
            });
        }

        *self.config.lock() = config.clone();
        self.applied.lock().push(config.clone());
        Ok(())
    }

    async fn query(&self) -> Result<ProxyConfig, SinkError> {
        if self.fail_query.load(Ordering::SeqCst) {
            return Err(SinkError::Unsupported("proxy mode 'auto'".to_string()));
        }
        Ok(self.current())
    }
}

/// Scripted connectivity probe.
pub enum FakeProbe {
    Ip(String),
    Fail(String),
    /// Never answers.
    Hang,
    Panic,
    /// Signals `entered`, then waits for `release` before answering.
    Gated {
        entered: Arc<Notify>,
        release: Arc<Notify>,
        ip: String,
    },
}

impl FakeProbe {
    pub fn ip(ip: &str) -> Self {
        Self::Ip(ip.to_string())
    }
}

#[async_trait]
impl ConnectivityProbe for FakeProbe {
    async fn check(&self, _rules: &ProxyRules) -> Result<String, ProbeError> {
        match self {
            Self::Ip(ip) => Ok(ip.clone()),
            Self::Fail(message) => Err(ProbeError::Connection(message.clone())),
            Self::Hang => {
                std::future::pending::<()>().await;
                unreachable!()
            }
            Self::Panic => panic!("probe exploded"),
            Self::Gated {
                entered,
                release,
                ip,
            } => {
                entered.notify_one();
                release.notified().await;
                Ok(ip.clone())
            }
        }
    }
}
