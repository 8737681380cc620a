// SPDX-License-Identifier: MIT OR Apache-2.0
#![deny(unsafe_code)]
#![warn(missing_docs)]
//! Structured logging setup and the redaction boundary.
//!
//! Every log site that renders endpoint diagnostics, config values, or
//! error details must pass them through [`redact_map`] / [`redact_value`]
//! first, so secrets never reach a log line, even when an upstream system
//! embeds them in free-form diagnostics.

use std::collections::BTreeMap;
use tracing_subscriber::EnvFilter;

/// The replacement for redacted values.
pub const REDACTED: &str = "***";

/// Initialize the process-wide tracing subscriber.
///
/// `level` overrides `RUST_LOG` when set (e.g. `"debug"`, `"ucl=trace"`).
/// With `json` the subscriber emits one JSON object per line, which is what
/// the workflow engine's log shipper expects.
///
/// Safe to call more than once; later calls are no-ops.
pub fn init_tracing(level: Option<&str>, json: bool) {
    let filter = match level {
        Some(level) => EnvFilter::try_new(level)
            .unwrap_or_else(|_| EnvFilter::new("info")),
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
    };
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true);
    let result = if json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
    // A second init (tests, embedded use) is fine.
    drop(result);
}

/// Returns `true` when a field with this name must never be logged verbatim.
///
/// Matches `password`, `token`, `secret`, and `apiKey`/`api_key`,
/// case-insensitively, anywhere in the field name.
#[must_use]
pub fn is_sensitive_key(key: &str) -> bool {
    let key = key.to_ascii_lowercase();
    key.contains("password")
        || key.contains("token")
        || key.contains("secret")
        || key.contains("apikey")
        || key.contains("api_key")
}

/// Redact a single value based on its field name.
#[must_use]
pub fn redact_value<'a>(key: &str, value: &'a str) -> &'a str {
    if is_sensitive_key(key) { REDACTED } else { value }
}

/// Redact a diagnostics map before it reaches a log line.
#[must_use]
pub fn redact_map(map: &BTreeMap<String, String>) -> BTreeMap<String, String> {
    map.iter()
        .map(|(k, v)| (k.clone(), redact_value(k, v).to_string()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sensitive_key_detection() {
        for key in [
            "password",
            "PASSWORD",
            "apiKey",
            "api_key",
            "x-api-key-header",
            "accessToken",
            "refresh_token",
            "clientSecret",
        ] {
            assert!(is_sensitive_key(key), "{key} should be sensitive");
        }
        for key in ["baseUrl", "username", "detectedVersion", "records"] {
            assert!(!is_sensitive_key(key), "{key} should not be sensitive");
        }
    }

    #[test]
    fn maps_are_redacted_field_by_field() {
        let mut details = BTreeMap::new();
        details.insert("baseUrl".to_string(), "https://jira.example".to_string());
        details.insert("apiKey".to_string(), "s3cr3t".to_string());
        details.insert("password".to_string(), "hunter2".to_string());

        let redacted = redact_map(&details);
        assert_eq!(redacted["baseUrl"], "https://jira.example");
        assert_eq!(redacted["apiKey"], REDACTED);
        assert_eq!(redacted["password"], REDACTED);
    }

    #[test]
    fn redacted_maps_serialize_without_secrets() {
        let mut details = BTreeMap::new();
        details.insert("token".to_string(), "abc123".to_string());
        let json = serde_json::to_string(&redact_map(&details)).unwrap();
        assert!(!json.contains("abc123"));
        assert!(json.contains(REDACTED));
    }

    #[test]
    fn init_is_idempotent() {
        init_tracing(Some("info"), false);
        init_tracing(Some("debug"), true);
    }
}
