//! Shared field-normalization helpers.
//!
//! Documents written by older deployments may carry instants as plain text in
//! odd formats or as integer epoch milliseconds. A raw lexical compare between
//! a legacy value and a canonical timestamp is unsafe, so every repository
//! normalizes date-like fields through these functions on read, and the
//! dual-shape SQL filters compare each stored shape against the matching
//! representation of "now".

use chrono::{DateTime, SecondsFormat, TimeZone, Utc};
use serde_json::Value;

/// Canonical stored form of an instant: RFC 3339 UTC, millisecond
/// precision, `Z` suffix. Fixed-width, so lexical order is chronological.
pub fn canonical_instant(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Upgrade a stored JSON value to an instant, accepting legacy shapes.
///
/// Handles: canonical/RFC 3339 text, RFC 2822 text, and integer epoch
/// milliseconds. Anything else is a data-shape anomaly and yields `None`
/// rather than a panic or a bogus comparison.
pub fn normalize_instant(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::String(s) => parse_instant_str(s),
        Value::Number(n) => {
            let millis = n.as_i64()?;
            Utc.timestamp_millis_opt(millis).single()
        }
        _ => None,
    }
}

fn parse_instant_str(s: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }
    if let Ok(dt) = DateTime::parse_from_rfc2822(s) {
        return Some(dt.with_timezone(&Utc));
    }
    // Epoch millis that ended up stored as text
    s.parse::<i64>()
        .ok()
        .and_then(|ms| Utc.timestamp_millis_opt(ms).single())
}

/// Parameter triple for dual-shape SQL due filters:
/// (canonical rfc3339 text, epoch millis, epoch seconds) for the same instant.
pub fn now_params(now: DateTime<Utc>) -> (String, i64, i64) {
    (canonical_instant(now), now.timestamp_millis(), now.timestamp())
}
