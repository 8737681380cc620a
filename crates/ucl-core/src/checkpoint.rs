// SPDX-License-Identifier: MIT OR Apache-2.0
//! Checkpoint payloads, the checkpoint key grammar, and watermarks.
//!
//! A checkpoint is a CAS-versioned document stored per
//! `(tenant, project, key)`. The key grammar is normative:
//!
//! ```text
//! tenant/<tenantId>/project/<projectId>/<family>/<unitId>[/<dimension>]
//! ```
//!
//! Keys are lowercase, `/`-delimited, and at most 128 bytes.

use crate::TenantContext;
use chrono::{DateTime, SecondsFormat, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

/// Maximum checkpoint key length, in bytes.
pub const MAX_KEY_LEN: usize = 128;

// ---------------------------------------------------------------------------
// Watermark
// ---------------------------------------------------------------------------

/// A monotonic progress marker along a source's natural ordering.
///
/// Timestamps and sequences form ordered domains; delta tokens are opaque
/// cursors that only support equality (the latest token always replaces the
/// previous one).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Watermark {
    /// An RFC 3339 UTC instant.
    Timestamp {
        /// The instant, always UTC.
        at: DateTime<Utc>,
    },
    /// A monotonically increasing integer (e.g. a primary-key upper bound).
    Sequence {
        /// The sequence value.
        value: i64,
    },
    /// An opaque change-tracking cursor (delta link, sync token, commit sha).
    Delta {
        /// The opaque token.
        token: String,
    },
}

impl Watermark {
    /// Construct a timestamp watermark.
    #[must_use]
    pub fn timestamp(at: DateTime<Utc>) -> Self {
        Self::Timestamp { at }
    }

    /// Construct a sequence watermark.
    #[must_use]
    pub fn sequence(value: i64) -> Self {
        Self::Sequence { value }
    }

    /// Construct a delta-token watermark.
    #[must_use]
    pub fn delta(token: impl Into<String>) -> Self {
        Self::Delta {
            token: token.into(),
        }
    }

    /// Short label for the watermark domain (`"ts"`, `"seq"`, `"delta"`).
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Timestamp { .. } => "ts",
            Self::Sequence { .. } => "seq",
            Self::Delta { .. } => "delta",
        }
    }

    /// Returns `true` for domains with a total order (timestamp, sequence).
    #[must_use]
    pub fn is_ordered(&self) -> bool {
        !matches!(self, Self::Delta { .. })
    }

    /// Canonical token used for deterministic hashing.
    ///
    /// Timestamps are normalized to microsecond precision UTC so re-planning
    /// from identical inputs hashes identically.
    #[must_use]
    pub fn canonical_token(&self) -> String {
        match self {
            Self::Timestamp { at } => {
                format!("ts:{}", at.to_rfc3339_opts(SecondsFormat::Micros, true))
            }
            Self::Sequence { value } => format!("seq:{value}"),
            Self::Delta { token } => format!("delta:{token}"),
        }
    }

    /// Render this watermark as a checkpoint `value` document.
    ///
    /// Timestamps and sequences are stored under the dimension name
    /// (`{"updated": "2025-01-03T11:00:00Z"}`); delta tokens use the
    /// conventional `deltaLink` key.
    #[must_use]
    pub fn to_checkpoint_value(&self, dimension: &str) -> serde_json::Value {
        match self {
            Self::Timestamp { at } => serde_json::json!({
                dimension: at.to_rfc3339_opts(SecondsFormat::Secs, true)
            }),
            Self::Sequence { value } => serde_json::json!({ dimension: value }),
            Self::Delta { token } => serde_json::json!({ "deltaLink": token }),
        }
    }

    /// Recover a watermark from an opaque checkpoint `value` document.
    ///
    /// Returns `None` when the document has no recognizable watermark shape.
    #[must_use]
    pub fn from_checkpoint_value(value: &serde_json::Value) -> Option<Self> {
        let obj = value.as_object()?;
        if let Some(token) = obj.get("deltaLink").and_then(|v| v.as_str()) {
            return Some(Self::delta(token));
        }
        // Single-dimension documents: the one entry is the watermark.
        if obj.len() == 1 {
            let (_, v) = obj.iter().next()?;
            if let Some(s) = v.as_str() {
                if let Ok(at) = DateTime::parse_from_rfc3339(s) {
                    return Some(Self::timestamp(at.with_timezone(&Utc)));
                }
                return Some(Self::delta(s));
            }
            if let Some(n) = v.as_i64() {
                return Some(Self::sequence(n));
            }
        }
        None
    }

    /// Compare against `other` within the same ordered domain.
    ///
    /// Returns `None` across domains and for delta tokens (which are
    /// equality-only; an unequal pair has no order).
    #[must_use]
    pub fn try_cmp(&self, other: &Self) -> Option<Ordering> {
        match (self, other) {
            (Self::Timestamp { at: a }, Self::Timestamp { at: b }) => Some(a.cmp(b)),
            (Self::Sequence { value: a }, Self::Sequence { value: b }) => Some(a.cmp(b)),
            (Self::Delta { token: a }, Self::Delta { token: b }) if a == b => {
                Some(Ordering::Equal)
            }
            _ => None,
        }
    }

    /// Returns the later of `self` and `other`.
    ///
    /// Delta tokens are latest-wins: `other` replaces `self`.
    #[must_use]
    pub fn merge_max(self, other: Self) -> Self {
        match self.try_cmp(&other) {
            Some(Ordering::Less) => other,
            Some(_) => self,
            None => other,
        }
    }
}

impl fmt::Display for Watermark {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.canonical_token())
    }
}

// ---------------------------------------------------------------------------
// CheckpointKey
// ---------------------------------------------------------------------------

/// Errors produced by checkpoint key validation.
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum InvalidKey {
    /// Key exceeds [`MAX_KEY_LEN`] bytes.
    #[error("checkpoint key exceeds {MAX_KEY_LEN} bytes ({0} bytes)")]
    TooLong(usize),
    /// Key contains an uppercase or otherwise forbidden character.
    #[error("checkpoint key contains forbidden character {0:?}")]
    ForbiddenChar(char),
    /// Key does not start with `tenant/<id>/project/<id>/`.
    #[error("checkpoint key must start with tenant/<id>/project/<id>/: {0:?}")]
    BadPrefix(String),
    /// Key has an empty segment (`//` or trailing `/`).
    #[error("checkpoint key has an empty segment: {0:?}")]
    EmptySegment(String),
    /// Key belongs to a different tenant than the caller.
    #[error("checkpoint key {key:?} does not belong to tenant {tenant}/{project}")]
    TenantMismatch {
        /// The offending key.
        key: String,
        /// Expected tenant id.
        tenant: String,
        /// Expected project id.
        project: String,
    },
}

impl From<InvalidKey> for crate::EndpointError {
    fn from(err: InvalidKey) -> Self {
        crate::EndpointError::validation(err.to_string()).with_source(err)
    }
}

/// A validated checkpoint key.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(transparent)]
pub struct CheckpointKey(String);

impl CheckpointKey {
    /// Parse and validate a raw key string.
    pub fn parse(raw: impl Into<String>) -> Result<Self, InvalidKey> {
        let raw = raw.into();
        if raw.len() > MAX_KEY_LEN {
            return Err(InvalidKey::TooLong(raw.len()));
        }
        if let Some(c) = raw
            .chars()
            .find(|c| !matches!(c, 'a'..='z' | '0'..='9' | '/' | '-' | '_' | '.'))
        {
            return Err(InvalidKey::ForbiddenChar(c));
        }
        let segments: Vec<&str> = raw.split('/').collect();
        if segments.iter().any(|s| s.is_empty()) {
            return Err(InvalidKey::EmptySegment(raw));
        }
        if segments.len() < 5
            || segments[0] != "tenant"
            || segments[2] != "project"
        {
            return Err(InvalidKey::BadPrefix(raw));
        }
        Ok(Self(raw))
    }

    /// Build the per-dimension checkpoint key for an ingestion unit.
    pub fn for_unit(
        tenant: &TenantContext,
        family: &str,
        unit_id: &str,
        dimension: &str,
    ) -> Result<Self, InvalidKey> {
        Self::parse(format!(
            "tenant/{}/project/{}/{}/{}/{}",
            tenant.tenant_id,
            tenant.project_id,
            slug(family),
            slug(unit_id),
            slug(dimension),
        ))
    }

    /// Build the per-unit lease key (`…/<family>/locks/<unitId>`).
    pub fn for_lease(
        tenant: &TenantContext,
        family: &str,
        unit_id: &str,
    ) -> Result<Self, InvalidKey> {
        Self::parse(format!(
            "tenant/{}/project/{}/{}/locks/{}",
            tenant.tenant_id,
            tenant.project_id,
            slug(family),
            slug(unit_id),
        ))
    }

    /// The `tenant/<t>/project/<p>/` prefix all of a tenant's keys share.
    #[must_use]
    pub fn tenant_prefix(tenant: &TenantContext) -> String {
        format!(
            "tenant/{}/project/{}/",
            tenant.tenant_id, tenant.project_id
        )
    }

    /// Asserts the key lies inside the caller's tenant namespace.
    pub fn ensure_tenant(&self, tenant: &TenantContext) -> Result<(), InvalidKey> {
        if self.0.starts_with(&Self::tenant_prefix(tenant)) {
            Ok(())
        } else {
            Err(InvalidKey::TenantMismatch {
                key: self.0.clone(),
                tenant: tenant.tenant_id.clone(),
                project: tenant.project_id.clone(),
            })
        }
    }

    /// The raw key string.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CheckpointKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lowercase a free-form identifier for use inside a checkpoint key.
///
/// Unit ids and dataset names arrive in mixed case (`CUS-issues`); the key
/// grammar is lowercase-only.
#[must_use]
pub fn slug(raw: &str) -> String {
    raw.chars()
        .map(|c| {
            let c = c.to_ascii_lowercase();
            if matches!(c, 'a'..='z' | '0'..='9' | '-' | '_' | '.') {
                c
            } else {
                '-'
            }
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Checkpoint
// ---------------------------------------------------------------------------

/// A versioned checkpoint payload.
///
/// `value` is opaque to the substrate; the source decides its shape
/// (`{"updated": …}`, `{"deltaLink": …}`, `{"lastSha": …}`). `version` is
/// the CAS token: the first create uses `expected_version = 0` and every
/// successful put returns `current + 1`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Checkpoint {
    /// Opaque source-produced progress document.
    pub value: serde_json::Value,
    /// Monotonic non-negative version.
    pub version: u64,
    /// Identity of the last successful writer.
    pub last_writer: String,
    /// Request id of the last successful write.
    pub request_id: String,
    /// Timestamp of the last successful write.
    pub updated_at: DateTime<Utc>,
    /// Optional soft-delete horizon, in seconds from `updated_at`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttl_seconds: Option<u64>,
    /// Purpose tag (`"watermark"`, `"lease"`, …).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub semantics: Option<String>,
}

impl Checkpoint {
    /// The watermark recorded in this checkpoint, if its value has a
    /// recognizable shape.
    #[must_use]
    pub fn watermark(&self) -> Option<Watermark> {
        Watermark::from_checkpoint_value(&self.value)
    }

    /// Returns `true` when the TTL has elapsed relative to `now`.
    #[must_use]
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        match self.ttl_seconds {
            Some(ttl) => {
                let deadline = self.updated_at + chrono::Duration::seconds(ttl as i64);
                now >= deadline
            }
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn tenant() -> TenantContext {
        TenantContext::new("acme", "main").unwrap()
    }

    #[test]
    fn key_grammar_accepts_normative_shape() {
        let key = CheckpointKey::parse("tenant/acme/project/main/http/cus-issues/updated").unwrap();
        assert_eq!(
            key.as_str(),
            "tenant/acme/project/main/http/cus-issues/updated"
        );
    }

    #[test]
    fn key_grammar_rejects_uppercase_and_long_keys() {
        assert!(matches!(
            CheckpointKey::parse("tenant/acme/project/main/http/CUS/updated"),
            Err(InvalidKey::ForbiddenChar('C'))
        ));
        let long = format!("tenant/acme/project/main/http/{}", "x".repeat(140));
        assert!(matches!(
            CheckpointKey::parse(long),
            Err(InvalidKey::TooLong(_))
        ));
    }

    #[test]
    fn key_grammar_requires_tenant_project_prefix() {
        assert!(matches!(
            CheckpointKey::parse("project/main/http/u/updated"),
            Err(InvalidKey::BadPrefix(_))
        ));
        assert!(matches!(
            CheckpointKey::parse("tenant/acme/http/u/updated"),
            Err(InvalidKey::BadPrefix(_))
        ));
        assert!(matches!(
            CheckpointKey::parse("tenant/acme//project/main/http"),
            Err(InvalidKey::EmptySegment(_))
        ));
    }

    #[test]
    fn unit_keys_are_lowercased() {
        let key = CheckpointKey::for_unit(&tenant(), "http", "CUS-issues", "updated").unwrap();
        assert_eq!(
            key.as_str(),
            "tenant/acme/project/main/http/cus-issues/updated"
        );
        let lease = CheckpointKey::for_lease(&tenant(), "http", "CUS-issues").unwrap();
        assert_eq!(lease.as_str(), "tenant/acme/project/main/http/locks/cus-issues");
    }

    #[test]
    fn tenant_fencing() {
        let key = CheckpointKey::for_unit(&tenant(), "http", "u1", "updated").unwrap();
        let other = TenantContext::new("rival", "main").unwrap();
        assert!(key.ensure_tenant(&tenant()).is_ok());
        assert!(matches!(
            key.ensure_tenant(&other),
            Err(InvalidKey::TenantMismatch { .. })
        ));
    }

    #[test]
    fn watermark_ordering_within_domain() {
        let a = Watermark::timestamp(Utc.with_ymd_and_hms(2025, 1, 2, 10, 0, 0).unwrap());
        let b = Watermark::timestamp(Utc.with_ymd_and_hms(2025, 1, 3, 11, 0, 0).unwrap());
        assert_eq!(a.try_cmp(&b), Some(Ordering::Less));
        assert_eq!(a.clone().merge_max(b.clone()), b);

        let s1 = Watermark::sequence(10);
        let s2 = Watermark::sequence(42);
        assert_eq!(s2.try_cmp(&s1), Some(Ordering::Greater));

        // Cross-domain comparison has no defined order.
        assert_eq!(a.try_cmp(&s1), None);
    }

    #[test]
    fn delta_tokens_are_equality_only_and_latest_wins() {
        let d1 = Watermark::delta("skiptoken=A");
        let d2 = Watermark::delta("skiptoken=B");
        assert_eq!(d1.try_cmp(&d2), None);
        assert_eq!(d1.try_cmp(&d1), Some(Ordering::Equal));
        assert_eq!(d1.merge_max(d2.clone()), d2);
    }

    #[test]
    fn checkpoint_value_round_trip() {
        let ts = Watermark::timestamp(Utc.with_ymd_and_hms(2025, 1, 3, 11, 0, 0).unwrap());
        let value = ts.to_checkpoint_value("updated");
        assert_eq!(value["updated"], "2025-01-03T11:00:00Z");
        assert_eq!(Watermark::from_checkpoint_value(&value), Some(ts));

        let delta = Watermark::delta("https://graph/x?$skiptoken=B");
        let value = delta.to_checkpoint_value("ignored");
        assert!(value.get("deltaLink").is_some());
        assert_eq!(Watermark::from_checkpoint_value(&value), Some(delta));

        let sha = serde_json::json!({"lastSha": "abc123"});
        assert_eq!(
            Watermark::from_checkpoint_value(&sha),
            Some(Watermark::delta("abc123"))
        );
    }

    #[test]
    fn ttl_expiry() {
        let cp = Checkpoint {
            value: serde_json::json!({"updated": "2025-01-01T00:00:00Z"}),
            version: 3,
            last_writer: "exec-1".into(),
            request_id: "req-1".into(),
            updated_at: Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap(),
            ttl_seconds: Some(60),
            semantics: Some("watermark".into()),
        };
        assert!(!cp.is_expired(Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 59).unwrap()));
        assert!(cp.is_expired(Utc.with_ymd_and_hms(2025, 1, 1, 0, 1, 0).unwrap()));
    }
}
