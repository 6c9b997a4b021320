//! Sanitize-on-load for persisted profiles.
//!
//! Stored records can be damaged by hand edits, partial writes, or an older
//! release writing a different shape. Loading is lenient: unknown schemes
//! are coerced, bad bypass entries are dropped, and records without a usable
//! host or port are discarded. The caller writes the repaired collection back.
//!
//! Two record shapes are accepted:
//!
//! ```text
//! { name, scheme, host, port, bypassList }                                  (current)
//! { name, config: { mode, rules: { singleProxy: {scheme, host, port},
//!                                  bypassList } } }                        (legacy)
//! ```

use serde_json::Value;
use tracing::{debug, warn};

use crate::bypass;
use crate::config::ProxyScheme;
use crate::profile::{validate_host, ProxyProfile};

const LEGACY_PROXY: &str = "/config/rules/singleProxy";
const LEGACY_BYPASS: &str = "/config/rules/bypassList";

/// Looks a field up in the current shape, then the legacy one.
fn lookup<'a>(record: &'a Value, key: &str, legacy_path: &str) -> Option<&'a Value> {
    record.get(key).or_else(|| record.pointer(legacy_path))
}

fn proxy_field<'a>(record: &'a Value, key: &str) -> Option<&'a Value> {
    lookup(record, key, &format!("{LEGACY_PROXY}/{key}"))
}

/// Reads a port from a JSON integer or a numeric string.
fn port_from_value(value: &Value) -> Option<u16> {
    let port = match value {
        Value::Number(n) => n.as_u64()?,
        Value::String(s) => s.trim().parse::<u64>().ok()?,
        _ => return None,
    };

    match port {
        1..=65535 => u16::try_from(port).ok(),
        _ => None,
    }
}

/// Sanitizes one stored record.
///
/// Returns `None` when the record has no usable host or port.
pub fn sanitize_profile(record: &Value) -> Option<ProxyProfile> {
    if !record.is_object() {
        debug!("Discarding non-object profile record");
        return None;
    }

    let host = proxy_field(record, "host")
        .and_then(Value::as_str)
        .and_then(validate_host);
    let Some(host) = host else {
        debug!("Discarding profile record with unusable host");
        return None;
    };

    let Some(port) = proxy_field(record, "port").and_then(port_from_value) else {
        debug!(host = %host, "Discarding profile record with unusable port");
        return None;
    };

    let scheme = proxy_field(record, "scheme")
        .and_then(Value::as_str)
        .map(ProxyScheme::parse_lenient)
        .unwrap_or_default();

    let bypass_list = lookup(record, "bypassList", LEGACY_BYPASS)
        .and_then(Value::as_array)
        .map(|entries| {
            entries
                .iter()
                .filter_map(Value::as_str)
                .filter_map(|entry| bypass::classify(entry).ok())
                .map(|rule| rule.raw)
                .collect()
        })
        .unwrap_or_default();

    let name = record
        .get("name")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();

    Some(ProxyProfile {
        name,
        scheme,
        host,
        port,
        bypass_list,
    })
}

/// A collection after sanitizing.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SanitizedCollection {
    /// Surviving profiles, in stored order.
    pub profiles: Vec<ProxyProfile>,
    /// Number of records discarded.
    pub dropped: usize,
    /// Active index into `profiles`, if still valid.
    pub active: Option<usize>,
    /// True if a stored active index had to be cleared.
    pub active_reset: bool,
    /// True if the stored profile list differs from `profiles` and should be rewritten.
    pub needs_rewrite: bool,
}

/// Sanitizes a stored profile list and its active index.
///
/// `records` is the stored `proxyProfiles` value and `active` the stored
/// `activeProfileId` (`Value::Null` when absent). The active index follows its
/// profile when earlier records are dropped; it is cleared when it is not a
/// non-negative integer, is out of range, or its own record was dropped.
pub fn sanitize_collection(records: &Value, active: &Value) -> SanitizedCollection {
    let (raw, malformed_list) = match records {
        Value::Array(items) => (items.as_slice(), false),
        Value::Null => (&[][..], false),
        _ => (&[][..], true),
    };

    if malformed_list {
        warn!("Stored profile list is not an array, discarding it");
    }

    let mut profiles = Vec::with_capacity(raw.len());
    // Position of each raw record in `profiles`, or None if it was dropped.
    let mut positions = Vec::with_capacity(raw.len());

    for record in raw {
        match sanitize_profile(record) {
            Some(profile) => {
                positions.push(Some(profiles.len()));
                profiles.push(profile);
            }
            None => positions.push(None),
        }
    }

    let dropped = raw.len() - profiles.len();
    if dropped > 0 {
        warn!("Removed {} corrupted profile(s)", dropped);
    }

    let (active, active_reset) = match active {
        Value::Null => (None, false),
        value => match value
            .as_u64()
            .and_then(|i| usize::try_from(i).ok())
            .and_then(|i| positions.get(i).copied().flatten())
        {
            Some(index) => (Some(index), false),
            None => {
                warn!(stored = %value, "Invalid active profile index, resetting to direct");
                (None, true)
            }
        },
    };

    SanitizedCollection {
        profiles,
        dropped,
        active,
        active_reset,
        needs_rewrite: dropped > 0 || malformed_list,
    }
}
