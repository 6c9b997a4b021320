//! SkyProxy Core - bypass rules, proxy profiles, and sanitize-on-load.
//!
//! This crate holds the pure, synchronous logic of SkyProxy:
//!
//! - [`bypass`]: classification and validation of bypass-list tokens, plus
//!   canned rule templates
//! - [`config`]: the declarative proxy configuration a sink accepts
//! - [`profile`]: proxy profiles and validation of user-entered drafts
//! - [`sanitize`]: lenient recovery of persisted profile records
//!
//! Nothing here performs I/O; persistence and proxy application live in
//! `skyproxy-storage` and `skyproxy-agent`.

pub mod bypass;
pub mod config;
pub mod profile;
pub mod sanitize;

pub use bypass::{
    classify, format_rule_list, get_template, parse_rule_list, BypassRule, InvalidRule, RuleError,
    RuleKind, RuleListReport, RuleTemplate,
};
pub use config::{ProxyConfig, ProxyRules, ProxyScheme, ProxyServer};
pub use profile::{ProfileDraft, ProxyProfile, ValidationError};
pub use sanitize::{sanitize_collection, sanitize_profile, SanitizedCollection};
