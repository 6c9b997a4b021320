//! Agent configuration.

use std::time::Duration;

/// Endpoint queried by the connectivity test. It answers `{"ip": "..."}`.
pub const DEFAULT_PROBE_URL: &str = "https://api.ipify.org?format=json";

/// Upper bound on a single connectivity test.
pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(10);

/// Configuration for the background agent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentConfig {
    /// "What is my IP" endpoint used by the connectivity test.
    pub probe_url: String,
    /// Time allowed for the probe before it is reported as timed out.
    pub probe_timeout: Duration,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            probe_url: DEFAULT_PROBE_URL.to_string(),
            probe_timeout: DEFAULT_PROBE_TIMEOUT,
        }
    }
}

impl AgentConfig {
    /// Sets the probe endpoint.
    pub fn with_probe_url(mut self, url: impl Into<String>) -> Self {
        self.probe_url = url.into();
        self
    }

    /// Sets the probe timeout.
    pub fn with_probe_timeout(mut self, timeout: Duration) -> Self {
        self.probe_timeout = timeout;
        self
    }
}
