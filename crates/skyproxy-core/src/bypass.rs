//! Bypass-rule classification and validation.
//!
//! A bypass list is free text: comma-separated tokens naming hosts that should
//! skip the proxy. Each token is classified into exactly one [`RuleKind`] and
//! validated against that kind's grammar.
//!
//! ## Classification Order
//!
//! The first matching shape wins:
//!
//! 1. CIDR - contains `/` (IPv4 address plus a prefix in `0..=32`)
//! 2. IPv6 - contains `:` or is wrapped in `[...]` (loose group check)
//! 3. IPv4 - four dot-separated groups of 1-3 digits, canonical and `<= 255`
//! 4. Domain - everything else, with an optional `*.` wildcard prefix
//!
//! Malformed tokens are reported, never raised.
//!
//! ## Usage
//!
//! ```
//! use skyproxy_core::bypass::{format_rule_list, parse_rule_list, RuleKind};
//!
//! let report = parse_rule_list("localhost, 10.0.0.0/8, 999.1.1.1");
//! assert_eq!(report.valid.len(), 2);
//! assert_eq!(report.valid[1].kind, RuleKind::Cidr);
//! assert_eq!(report.invalid[0].token, "999.1.1.1");
//!
//! assert_eq!(format_rule_list(&report.raw_rules()), "localhost, 10.0.0.0/8");
//! ```

use std::fmt;
use std::str::FromStr;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Four dot-separated groups of one to three ASCII digits.
static IPV4_SHAPE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^([0-9]{1,3}\.){3}[0-9]{1,3}$").expect("IPv4 shape pattern"));

/// Dot-separated labels that start and end alphanumeric.
static HOST_LABELS: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[a-zA-Z0-9]([a-zA-Z0-9-]*[a-zA-Z0-9])?(\.[a-zA-Z0-9]([a-zA-Z0-9-]*[a-zA-Z0-9])?)*$")
        .expect("host label pattern")
});

/// Wildcard prefix accepted on domain rules.
const WILDCARD_PREFIX: &str = "*.";

/// Separator used when joining rules back into text.
pub const RULE_SEPARATOR: &str = ", ";

/// The syntactic class of a bypass rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuleKind {
    /// Hostname, optionally with a `*.` wildcard prefix.
    Domain,
    /// IPv4 literal.
    Ipv4,
    /// IPv6 literal, bare or bracketed.
    Ipv6,
    /// IPv4 CIDR block.
    Cidr,
}

impl RuleKind {
    /// Returns the kind as a string.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Domain => "domain",
            Self::Ipv4 => "ipv4",
            Self::Ipv6 => "ipv6",
            Self::Cidr => "cidr",
        }
    }
}

impl fmt::Display for RuleKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Why a token was rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum RuleError {
    /// The token was empty after trimming.
    #[error("rule cannot be empty")]
    Empty,

    #[error("invalid CIDR format")]
    InvalidCidr,

    #[error("invalid IPv6 address")]
    InvalidIpv6,

    #[error("invalid IPv4 address")]
    InvalidIpv4,

    #[error("invalid domain format")]
    InvalidDomain,
}

impl RuleError {
    /// Returns the kind the token was classified as before it failed validation.
    pub fn kind(&self) -> Option<RuleKind> {
        match self {
            Self::Empty => None,
            Self::InvalidCidr => Some(RuleKind::Cidr),
            Self::InvalidIpv6 => Some(RuleKind::Ipv6),
            Self::InvalidIpv4 => Some(RuleKind::Ipv4),
            Self::InvalidDomain => Some(RuleKind::Domain),
        }
    }
}

/// A single validated bypass entry.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BypassRule {
    /// The token as entered, trimmed.
    pub raw: String,
    /// Syntactic class.
    pub kind: RuleKind,
}

impl BypassRule {
    /// Classifies and validates a single token.
    pub fn parse(token: &str) -> Result<Self, RuleError> {
        classify(token)
    }

    /// Returns true if this is a wildcard domain rule (`*.example.com`).
    pub fn is_wildcard(&self) -> bool {
        self.kind == RuleKind::Domain && self.raw.starts_with(WILDCARD_PREFIX)
    }
}

impl FromStr for BypassRule {
    type Err = RuleError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        classify(s)
    }
}

impl fmt::Display for BypassRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

/// A token that failed validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvalidRule {
    /// The offending token, trimmed.
    pub token: String,
    /// Why it was rejected.
    pub reason: RuleError,
}

impl InvalidRule {
    /// Returns the kind the token was classified as.
    pub fn kind(&self) -> Option<RuleKind> {
        self.reason.kind()
    }
}

impl fmt::Display for InvalidRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.token, self.reason)
    }
}

/// Result of parsing a rule list: a partition of the non-empty tokens.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RuleListReport {
    /// Valid rules, in input order.
    pub valid: Vec<BypassRule>,
    /// Rejected tokens, in input order.
    pub invalid: Vec<InvalidRule>,
}

impl RuleListReport {
    /// Returns true if no token was rejected.
    pub fn is_clean(&self) -> bool {
        self.invalid.is_empty()
    }

    /// Returns the raw strings of the valid rules.
    pub fn raw_rules(&self) -> Vec<String> {
        self.valid.iter().map(|r| r.raw.clone()).collect()
    }

    /// Total number of non-empty tokens seen.
    pub fn len(&self) -> usize {
        self.valid.len() + self.invalid.len()
    }

    /// Returns true if the input had no non-empty tokens.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Classifies and validates a single token.
pub fn classify(token: &str) -> Result<BypassRule, RuleError> {
    let token = token.trim();
    if token.is_empty() {
        return Err(RuleError::Empty);
    }

    let (kind, valid, error) = if token.contains('/') {
        (RuleKind::Cidr, is_valid_cidr(token), RuleError::InvalidCidr)
    } else if token.contains(':') || (token.starts_with('[') && token.ends_with(']')) {
        (RuleKind::Ipv6, is_valid_ipv6(token), RuleError::InvalidIpv6)
    } else if IPV4_SHAPE.is_match(token) {
        (RuleKind::Ipv4, is_valid_ipv4(token), RuleError::InvalidIpv4)
    } else {
        (RuleKind::Domain, is_valid_domain(token), RuleError::InvalidDomain)
    };

    if valid {
        Ok(BypassRule {
            raw: token.to_string(),
            kind,
        })
    } else {
        Err(error)
    }
}

/// Splits rule text on commas, trimming and discarding empty pieces.
pub fn split_rule_list(text: &str) -> Vec<&str> {
    text.split(',')
        .map(str::trim)
        .filter(|piece| !piece.is_empty())
        .collect()
}

/// Parses a comma-separated rule list into valid and invalid entries.
pub fn parse_rule_list(text: &str) -> RuleListReport {
    let mut report = RuleListReport::default();

    for token in split_rule_list(text) {
        match classify(token) {
            Ok(rule) => report.valid.push(rule),
            Err(reason) => report.invalid.push(InvalidRule {
                token: token.to_string(),
                reason,
            }),
        }
    }

    report
}

/// Parses a rule list held in an untyped JSON value.
///
/// Anything other than a JSON string yields an empty report.
pub fn parse_rule_value(value: &serde_json::Value) -> RuleListReport {
    match value.as_str() {
        Some(text) => parse_rule_list(text),
        None => RuleListReport::default(),
    }
}

/// Joins rules with `", "`.
pub fn format_rule_list<S: AsRef<str>>(rules: &[S]) -> String {
    rules
        .iter()
        .map(AsRef::as_ref)
        .collect::<Vec<_>>()
        .join(RULE_SEPARATOR)
}

/// Validates a dotted-quad IPv4 literal with canonical decimal groups.
pub fn is_valid_ipv4(text: &str) -> bool {
    let parts: Vec<&str> = text.split('.').collect();
    if parts.len() != 4 {
        return false;
    }

    parts.iter().all(|part| match part.parse::<u16>() {
        Ok(n) => n <= 255 && n.to_string() == *part,
        Err(_) => false,
    })
}

/// Loosely validates an IPv6 literal, optionally wrapped in brackets.
///
/// Only the group count and group contents are checked; placement of `::`
/// compression is not.
pub fn is_valid_ipv6(text: &str) -> bool {
    let text = text.strip_prefix('[').unwrap_or(text);
    let text = text.strip_suffix(']').unwrap_or(text);

    let groups: Vec<&str> = text.split(':').collect();
    if !(2..=8).contains(&groups.len()) {
        return false;
    }

    groups.iter().all(|group| {
        group.is_empty() || (group.len() <= 4 && group.chars().all(|c| c.is_ascii_hexdigit()))
    })
}

/// Validates an IPv4 CIDR block (`a.b.c.d/n`, `n` in `0..=32`).
pub fn is_valid_cidr(text: &str) -> bool {
    let Some((address, prefix)) = text.split_once('/') else {
        return false;
    };

    if !is_valid_ipv4(address) {
        return false;
    }

    matches!(prefix.parse::<u8>(), Ok(n) if n <= 32)
}

/// Validates a domain rule, allowing a leading `*.` wildcard.
pub fn is_valid_domain(text: &str) -> bool {
    let host = text.strip_prefix(WILDCARD_PREFIX).unwrap_or(text);
    is_valid_hostname(host)
}

/// Validates a bare hostname: dot-separated alphanumeric labels, hyphens
/// allowed in the interior only.
pub fn is_valid_hostname(text: &str) -> bool {
    HOST_LABELS.is_match(text)
}

/// Canned bypass rule sets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuleTemplate {
    /// Loopback only.
    Minimal,
    /// Loopback plus local names.
    #[default]
    Basic,
    /// Local development hosts and the private 192.168/16 range.
    Development,
    /// Chinese domains and all private IPv4 ranges.
    China,
}

impl RuleTemplate {
    /// All templates, in display order.
    pub const ALL: [RuleTemplate; 4] = [Self::Minimal, Self::Basic, Self::Development, Self::China];

    /// Returns the template name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Minimal => "minimal",
            Self::Basic => "basic",
            Self::Development => "development",
            Self::China => "china",
        }
    }

    /// Looks up a template by name (case-insensitive).
    pub fn from_name(name: &str) -> Option<Self> {
        let name = name.trim();
        Self::ALL
            .into_iter()
            .find(|t| t.as_str().eq_ignore_ascii_case(name))
    }

    /// Returns the template's rules.
    pub fn rules(&self) -> &'static [&'static str] {
        match self {
            Self::Minimal => &["localhost", "127.0.0.1"],
            Self::Basic => &["localhost", "127.0.0.1", "[::1]", "*.localhost", "*.local"],
            Self::Development => &[
                "localhost",
                "127.0.0.1",
                "[::1]",
                "*.localhost",
                "*.local",
                "*.test",
                "*.development",
                "192.168.0.0/16",
            ],
            Self::China => &[
                "localhost",
                "127.0.0.1",
                "[::1]",
                "*.cn",
                "*.com.cn",
                "*.edu.cn",
                "*.gov.cn",
                "10.0.0.0/8",
                "172.16.0.0/12",
                "192.168.0.0/16",
            ],
        }
    }
}

impl fmt::Display for RuleTemplate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Returns the named template's rules, falling back to `basic`.
pub fn get_template(name: &str) -> &'static [&'static str] {
    RuleTemplate::from_name(name).unwrap_or_default().rules()
}
