//! Message protocol between the shell and the background dispatcher.
//!
//! Requests are tagged by `type`:
//!
//! ```json
//! { "type": "SET_PROXY", "config": { "mode": "direct" } }
//! { "type": "TEST_PROXY" }
//! { "type": "GET_PROXY" }
//! { "type": "GET_PROXY_STATE" }
//! { "type": "PROFILES_UPDATED", "profiles": [ ... ] }
//! ```
//!
//! Each request has its own response shape; see [`Response`].

use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use skyproxy_core::{ProxyConfig, ProxyProfile};

/// A request to the background dispatcher.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Request {
    /// Apply a proxy configuration.
    SetProxy { config: ProxyConfig },
    /// Probe connectivity through the currently applied configuration.
    TestProxy,
    /// Report the currently applied configuration.
    GetProxy,
    /// Report the active profile and applied configuration.
    GetProxyState,
    /// The saved profile list changed.
    ProfilesUpdated { profiles: Vec<ProxyProfile> },
}

impl Request {
    /// Returns the wire name of the request type.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::SetProxy { .. } => "SET_PROXY",
            Self::TestProxy => "TEST_PROXY",
            Self::GetProxy => "GET_PROXY",
            Self::GetProxyState => "GET_PROXY_STATE",
            Self::ProfilesUpdated { .. } => "PROFILES_UPDATED",
        }
    }
}

/// Why a connectivity test failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    Timeout,
    Connection,
    InvalidResponse,
    NoProxy,
}

impl FailureReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Timeout => "timeout",
            Self::Connection => "connection",
            Self::InvalidResponse => "invalid_response",
            Self::NoProxy => "no_proxy",
        }
    }
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// `{ success, error? }`, answered to `SET_PROXY` and `PROFILES_UPDATED`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ack {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Ack {
    pub fn ok() -> Self {
        Self {
            success: true,
            error: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
        }
    }
}

/// `{ success, ip?, error?, reason? }`, answered to `TEST_PROXY`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestResult {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<FailureReason>,
}

impl TestResult {
    pub fn passed(ip: impl Into<String>) -> Self {
        Self {
            success: true,
            ip: Some(ip.into()),
            error: None,
            reason: None,
        }
    }

    pub fn failed(reason: FailureReason, error: impl Into<String>) -> Self {
        Self {
            success: false,
            ip: None,
            error: Some(error.into()),
            reason: Some(reason),
        }
    }
}

/// `{ config?, error? }`, answered to `GET_PROXY`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxyReport {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config: Option<ProxyConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// `{ activeProfile, proxyConfig? }`, answered to `GET_PROXY_STATE`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProxyState {
    /// Known profile whose configuration is currently applied.
    pub active_profile: Option<ProxyProfile>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proxy_config: Option<ProxyConfig>,
}

/// A response from the background dispatcher.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum Response {
    Ack(Ack),
    Test(TestResult),
    Proxy(ProxyReport),
    State(ProxyState),
}

/// Sends requests to the background dispatcher.
#[async_trait]
pub trait Messenger: Send + Sync {
    async fn send(&self, request: Request) -> Response;
}
