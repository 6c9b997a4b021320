//! Background dispatcher.
//!
//! Holds the proxy-apply privilege: it owns the settings sink and the
//! connectivity probe and answers protocol requests against them.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::{json, Value};
use skyproxy_core::{ProxyConfig, ProxyProfile};
use tracing::{debug, info, warn};

use crate::config::AgentConfig;
use crate::error::ProbeError;
use crate::probe::ConnectivityProbe;
use crate::protocol::{Ack, Messenger, ProxyReport, ProxyState, Request, Response, TestResult};
use crate::sink::ProxySettingsSink;

/// Dispatches protocol requests to the sink and probe.
pub struct Background {
    sink: Arc<dyn ProxySettingsSink>,
    probe: Arc<dyn ConnectivityProbe>,
    probe_timeout: Duration,
    /// Last profile list announced with `PROFILES_UPDATED`.
    profiles: RwLock<Vec<ProxyProfile>>,
}

impl Background {
    pub fn new(
        sink: Arc<dyn ProxySettingsSink>,
        probe: Arc<dyn ConnectivityProbe>,
        config: &AgentConfig,
    ) -> Self {
        Self {
            sink,
            probe,
            probe_timeout: config.probe_timeout,
            profiles: RwLock::new(Vec::new()),
        }
    }

    /// Returns the sink's name.
    pub fn sink_name(&self) -> &'static str {
        self.sink.name()
    }

    /// Handles one request.
    pub async fn dispatch(&self, request: Request) -> Response {
        debug!(request = request.kind(), "Dispatching request");
        match request {
            Request::SetProxy { config } => Response::Ack(self.set_proxy(&config).await),
            Request::TestProxy => Response::Test(self.test_proxy().await),
            Request::GetProxy => Response::Proxy(self.get_proxy().await),
            Request::GetProxyState => Response::State(self.proxy_state().await),
            Request::ProfilesUpdated { profiles } => {
                Response::Ack(self.profiles_updated(profiles))
            }
        }
    }

    /// Handles a raw JSON message. Malformed messages get `{success: false, error}`.
    pub async fn dispatch_json(&self, message: Value) -> Value {
        let response = match serde_json::from_value::<Request>(message) {
            Ok(request) => self.dispatch(request).await,
            Err(e) => {
                warn!(error = %e, "Rejecting malformed message");
                Response::Ack(Ack::failed(format!("malformed request: {e}")))
            }
        };

        serde_json::to_value(&response)
            .unwrap_or_else(|e| json!({"success": false, "error": e.to_string()}))
    }

    async fn set_proxy(&self, config: &ProxyConfig) -> Ack {
        match self.sink.apply(config).await {
            Ok(()) => {
                info!(sink = self.sink.name(), config = %config, "Proxy configuration applied");
                Ack::ok()
            }
            Err(e) => {
                warn!(sink = self.sink.name(), error = %e, "Failed to set proxy");
                Ack::failed(e.to_string())
            }
        }
    }

    async fn get_proxy(&self) -> ProxyReport {
        match self.sink.query().await {
            Ok(config) => ProxyReport {
                config: Some(config),
                error: None,
            },
            Err(e) => ProxyReport {
                config: None,
                error: Some(e.to_string()),
            },
        }
    }

    async fn test_proxy(&self) -> TestResult {
        let config = match self.sink.query().await {
            Ok(config) => config,
            Err(e) => return TestResult::failed(ProbeError::NoProxy.reason(), e.to_string()),
        };

        let Some(rules) = config.rules() else {
            let err = ProbeError::NoProxy;
            return TestResult::failed(err.reason(), err.to_string());
        };

        let outcome = tokio::time::timeout(self.probe_timeout, self.probe.check(rules))
            .await
            .unwrap_or(Err(ProbeError::Timeout(self.probe_timeout)));

        match outcome {
            Ok(ip) => {
                info!(proxy = %rules.single_proxy, ip = %ip, "Connectivity test passed");
                TestResult::passed(ip)
            }
            Err(e) => {
                warn!(proxy = %rules.single_proxy, error = %e, "Connectivity test failed");
                TestResult::failed(e.reason(), e.to_string())
            }
        }
    }

    async fn proxy_state(&self) -> ProxyState {
        let proxy_config = match self.sink.query().await {
            Ok(config) => Some(config),
            Err(e) => {
                warn!(error = %e, "Could not read proxy configuration");
                None
            }
        };

        let active_profile = proxy_config.as_ref().and_then(|config| {
            self.profiles
                .read()
                .iter()
                .find(|p| p.to_config() == *config)
                .cloned()
        });

        ProxyState {
            active_profile,
            proxy_config,
        }
    }

    fn profiles_updated(&self, profiles: Vec<ProxyProfile>) -> Ack {
        debug!(count = profiles.len(), "Profile list updated");
        *self.profiles.write() = profiles;
        Ack::ok()
    }
}

#[async_trait]
impl Messenger for Background {
    async fn send(&self, request: Request) -> Response {
        self.dispatch(request).await
    }
}
