//! Proxy profiles and validation of user-entered drafts.
//!
//! A [`ProxyProfile`] is a named proxy target as persisted. A [`ProfileDraft`]
//! is the raw text a user typed into a form; [`ProfileDraft::validate`] turns
//! it into a profile or explains what is wrong.
//!
//! ## Usage
//!
//! ```
//! use skyproxy_core::profile::ProfileDraft;
//! use skyproxy_core::config::ProxyScheme;
//!
//! let draft = ProfileDraft {
//!     name: String::new(),
//!     scheme: "socks5".to_string(),
//!     host: "proxy.example.com".to_string(),
//!     port: "1080".to_string(),
//!     bypass: "localhost, *.local".to_string(),
//! };
//!
//! let profile = draft.validate().unwrap();
//! assert_eq!(profile.display_name(), "proxy.example.com");
//! assert_eq!(profile.scheme, ProxyScheme::Socks5);
//! assert_eq!(profile.bypass_list, vec!["localhost", "*.local"]);
//! ```

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::bypass::{self, InvalidRule};
use crate::config::{ProxyConfig, ProxyScheme, ProxyServer};

/// Errors raised when validating user input.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    /// Host is empty or not a hostname/IPv4 literal after sanitizing.
    #[error("invalid host: {0:?}")]
    InvalidHost(String),

    /// Port is not an integer in 1..=65535.
    #[error("invalid port: {0:?}")]
    InvalidPort(String),

    /// One or more bypass tokens failed validation.
    #[error("invalid bypass rules: {}", join_invalid(.0))]
    InvalidBypassRules(Vec<InvalidRule>),
}

fn join_invalid(rules: &[InvalidRule]) -> String {
    rules
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

/// Result type for validation.
pub type Result<T> = std::result::Result<T, ValidationError>;

/// A named proxy target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProxyProfile {
    /// Display label. May be empty; see [`ProxyProfile::display_name`].
    pub name: String,
    pub scheme: ProxyScheme,
    pub host: String,
    pub port: u16,
    /// Validated bypass rules, in the order entered.
    pub bypass_list: Vec<String>,
}

impl ProxyProfile {
    /// Creates a new profile.
    pub fn new(
        name: impl Into<String>,
        scheme: ProxyScheme,
        host: impl Into<String>,
        port: u16,
        bypass_list: Vec<String>,
    ) -> Self {
        Self {
            name: name.into(),
            scheme,
            host: host.into(),
            port,
            bypass_list,
        }
    }

    /// Returns the name, or the host when the name is empty.
    pub fn display_name(&self) -> &str {
        if self.name.trim().is_empty() {
            &self.host
        } else {
            &self.name
        }
    }

    /// Returns the proxy endpoint.
    pub fn server(&self) -> ProxyServer {
        ProxyServer {
            scheme: self.scheme,
            host: self.host.clone(),
            port: self.port,
        }
    }

    /// Returns the fixed-server configuration for this profile.
    pub fn to_config(&self) -> ProxyConfig {
        ProxyConfig::fixed(self.server(), self.bypass_list.clone())
    }
}

/// Raw form input for a profile.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProfileDraft {
    pub name: String,
    pub scheme: String,
    pub host: String,
    pub port: String,
    /// Comma-separated bypass rules.
    pub bypass: String,
}

impl ProfileDraft {
    /// Prefills a draft from an existing profile, for editing.
    pub fn from_profile(profile: &ProxyProfile) -> Self {
        Self {
            name: profile.name.clone(),
            scheme: profile.scheme.to_string(),
            host: profile.host.clone(),
            port: profile.port.to_string(),
            bypass: bypass::format_rule_list(&profile.bypass_list),
        }
    }

    /// Validates the draft into a profile.
    ///
    /// Unknown schemes become `http`. An empty name becomes the host. Every
    /// invalid bypass token is reported, not just the first.
    pub fn validate(&self) -> Result<ProxyProfile> {
        let host = validate_host(&self.host)
            .ok_or_else(|| ValidationError::InvalidHost(self.host.clone()))?;
        let port = validate_port(&self.port)
            .ok_or_else(|| ValidationError::InvalidPort(self.port.clone()))?;
        let scheme = ProxyScheme::parse_lenient(&self.scheme);

        let report = bypass::parse_rule_list(&self.bypass);
        if !report.is_clean() {
            return Err(ValidationError::InvalidBypassRules(report.invalid));
        }

        let name = match self.name.trim() {
            "" => host.clone(),
            name => name.to_string(),
        };

        Ok(ProxyProfile {
            name,
            scheme,
            host,
            port,
            bypass_list: report.raw_rules(),
        })
    }
}

/// Sanitizes a host: strips characters outside `[a-zA-Z0-9.-]`, then requires
/// the result to be a valid hostname.
pub fn validate_host(input: &str) -> Option<String> {
    let sanitized: String = input
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '.' || *c == '-')
        .collect();

    bypass::is_valid_hostname(&sanitized).then_some(sanitized)
}

/// Parses a port in `1..=65535`.
pub fn validate_port(input: &str) -> Option<u16> {
    match input.trim().parse::<u16>() {
        Ok(0) | Err(_) => None,
        Ok(port) => Some(port),
    }
}
