//! Declarative proxy configuration.
//!
//! This is the value a proxy settings sink accepts and reports back. It
//! serializes to the same shape browser proxy APIs use:
//!
//! ```json
//! { "mode": "direct" }
//! { "mode": "fixed_servers",
//!   "rules": { "singleProxy": { "scheme": "http", "host": "proxy.local", "port": 8080 },
//!              "bypassList": ["localhost"] } }
//! ```

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Protocol spoken to the proxy server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProxyScheme {
    #[default]
    Http,
    Https,
    Socks4,
    Socks5,
}

impl ProxyScheme {
    /// All schemes, in display order.
    pub const ALL: [ProxyScheme; 4] = [Self::Http, Self::Https, Self::Socks4, Self::Socks5];

    /// Returns the scheme as a string.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Http => "http",
            Self::Https => "https",
            Self::Socks4 => "socks4",
            Self::Socks5 => "socks5",
        }
    }

    /// Parses a scheme, coercing anything unknown to `http`.
    pub fn parse_lenient(value: &str) -> Self {
        value.parse().unwrap_or_default()
    }

    /// Returns true for the SOCKS family.
    pub fn is_socks(&self) -> bool {
        matches!(self, Self::Socks4 | Self::Socks5)
    }
}

impl fmt::Display for ProxyScheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Error returned when a scheme string is not recognised.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown proxy scheme: {0}")]
pub struct UnknownScheme(pub String);

impl FromStr for ProxyScheme {
    type Err = UnknownScheme;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        Self::ALL
            .into_iter()
            .find(|scheme| scheme.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| UnknownScheme(s.to_string()))
    }
}

/// A single proxy endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ProxyServer {
    pub scheme: ProxyScheme,
    pub host: String,
    pub port: u16,
}

impl ProxyServer {
    /// Returns the endpoint as a URL, e.g. `socks5://127.0.0.1:1080`.
    pub fn url(&self) -> String {
        format!("{}://{}:{}", self.scheme, self.host, self.port)
    }
}

impl fmt::Display for ProxyServer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.url())
    }
}

/// Fixed-server rules: one endpoint plus hosts that go direct.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProxyRules {
    pub single_proxy: ProxyServer,
    #[serde(default)]
    pub bypass_list: Vec<String>,
}

/// Proxy configuration applied system-wide.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum ProxyConfig {
    /// No proxy; traffic goes straight to its destination.
    #[default]
    Direct,
    /// All non-bypassed traffic goes through one endpoint.
    FixedServers { rules: ProxyRules },
}

impl ProxyConfig {
    /// Builds a fixed-server configuration.
    pub fn fixed(server: ProxyServer, bypass_list: Vec<String>) -> Self {
        Self::FixedServers {
            rules: ProxyRules {
                single_proxy: server,
                bypass_list,
            },
        }
    }

    /// Returns the mode name as serialized.
    pub fn mode(&self) -> &'static str {
        match self {
            Self::Direct => "direct",
            Self::FixedServers { .. } => "fixed_servers",
        }
    }

    /// Returns true for direct mode.
    pub fn is_direct(&self) -> bool {
        matches!(self, Self::Direct)
    }

    /// Returns the fixed-server rules, if any.
    pub fn rules(&self) -> Option<&ProxyRules> {
        match self {
            Self::Direct => None,
            Self::FixedServers { rules } => Some(rules),
        }
    }
}

impl fmt::Display for ProxyConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Direct => f.write_str("direct"),
            Self::FixedServers { rules } => write!(f, "{}", rules.single_proxy),
        }
    }
}
