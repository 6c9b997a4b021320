//! Connectivity probe.
//!
//! Asks an external "what is my IP" endpoint for the caller's address through
//! the configured proxy. A successful answer proves the proxy forwards traffic.

use async_trait::async_trait;
use serde::Deserialize;
use skyproxy_core::ProxyRules;
use tracing::debug;

use crate::config::AgentConfig;
use crate::error::ProbeError;

/// Checks that traffic flows through a proxy.
#[async_trait]
pub trait ConnectivityProbe: Send + Sync {
    /// Returns the public IP address seen by the endpoint.
    async fn check(&self, rules: &ProxyRules) -> Result<String, ProbeError>;
}

#[derive(Debug, Deserialize)]
struct IpResponse {
    ip: Option<String>,
}

/// Probe that performs an HTTP GET through the proxy with reqwest.
#[derive(Debug, Clone)]
pub struct HttpProbe {
    config: AgentConfig,
}

impl HttpProbe {
    pub fn new(config: &AgentConfig) -> Self {
        Self {
            config: config.clone(),
        }
    }

    fn client(&self, rules: &ProxyRules) -> Result<reqwest::Client, ProbeError> {
        let proxy = reqwest::Proxy::all(rules.single_proxy.url())
            .map_err(|e| ProbeError::Connection(e.to_string()))?
            .no_proxy(reqwest::NoProxy::from_string(&rules.bypass_list.join(",")));

        reqwest::Client::builder()
            .user_agent(format!("SkyProxy/{}", env!("CARGO_PKG_VERSION")))
            .proxy(proxy)
            .timeout(self.config.probe_timeout)
            .build()
            .map_err(|e| ProbeError::Connection(e.to_string()))
    }
}

#[async_trait]
impl ConnectivityProbe for HttpProbe {
    async fn check(&self, rules: &ProxyRules) -> Result<String, ProbeError> {
        debug!(url = %self.config.probe_url, proxy = %rules.single_proxy, "Probing connectivity");
        let client = self.client(rules)?;

        let response = client.get(&self.config.probe_url).send().await.map_err(|e| {
            if e.is_timeout() {
                ProbeError::Timeout(self.config.probe_timeout)
            } else {
                ProbeError::from(e)
            }
        })?;

        if !response.status().is_success() {
            return Err(ProbeError::InvalidResponse(format!(
                "HTTP {}",
                response.status()
            )));
        }

        let body = response.text().await?;
        parse_ip(&body)
    }
}

/// Extracts the address from an `{"ip": "..."}` body.
pub fn parse_ip(body: &str) -> Result<String, ProbeError> {
    let parsed: IpResponse =
        serde_json::from_str(body).map_err(|e| ProbeError::InvalidResponse(e.to_string()))?;

    match parsed.ip.map(|ip| ip.trim().to_string()) {
        Some(ip) if !ip.is_empty() => Ok(ip),
        _ => Err(ProbeError::InvalidResponse(
            "response has no ip field".to_string(),
        )),
    }
}
