// SPDX-License-Identifier: MIT OR Apache-2.0
//! The record envelope: one staged JSONL line.
//!
//! Wire format (single-line UTF-8 JSON, camelCase keys):
//!
//! ```json
//! {"sourceId":"JIRA-1","sourceUrl":"https://…","rawSource":{…},"cdm":{…},
//!  "tenantId":"acme","emittedAt":"2025-01-02T10:00:00Z"}
//! ```
//!
//! `sourceId`, `tenantId`, and `emittedAt` are required; decoding enforces
//! this. `emittedAt` is RFC 3339 UTC.

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Envelope format identifier stored on staging handles.
pub const ENVELOPE_FORMAT: &str = "jsonl+gzip";

/// One record as it crosses the staging substrate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct RecordEnvelope {
    /// Source-native record identifier.
    pub source_id: String,
    /// Canonical URL of the record at the source, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_url: Option<String>,
    /// The raw source payload, verbatim.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw_source: Option<serde_json::Value>,
    /// Canonical-model projection of the record, when the source emits one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cdm: Option<serde_json::Value>,
    /// Owning tenant. Always supplied by the caller's authenticated context.
    pub tenant_id: String,
    /// When the source emitted this envelope (RFC 3339 UTC).
    pub emitted_at: DateTime<Utc>,
}

/// Errors produced while encoding or decoding envelope lines.
#[derive(Debug, thiserror::Error)]
pub enum EnvelopeError {
    /// The line is not valid JSON or misses a required key.
    #[error("malformed envelope line: {0}")]
    Malformed(#[from] serde_json::Error),
    /// A required key decoded to an empty value.
    #[error("envelope field {0} must not be empty")]
    EmptyField(&'static str),
}

impl RecordEnvelope {
    /// Minimal constructor for the required fields.
    #[must_use]
    pub fn new(
        source_id: impl Into<String>,
        tenant_id: impl Into<String>,
        emitted_at: DateTime<Utc>,
    ) -> Self {
        Self {
            source_id: source_id.into(),
            source_url: None,
            raw_source: None,
            cdm: None,
            tenant_id: tenant_id.into(),
            emitted_at,
        }
    }

    /// Attach the raw source payload.
    #[must_use]
    pub fn with_raw(mut self, raw: serde_json::Value) -> Self {
        self.raw_source = Some(raw);
        self
    }

    /// Attach the canonical-model projection.
    #[must_use]
    pub fn with_cdm(mut self, cdm: serde_json::Value) -> Self {
        self.cdm = Some(cdm);
        self
    }

    /// Attach the source URL.
    #[must_use]
    pub fn with_source_url(mut self, url: impl Into<String>) -> Self {
        self.source_url = Some(url.into());
        self
    }

    /// Encode as a single JSONL line (no trailing newline).
    pub fn encode_line(&self) -> Result<String, EnvelopeError> {
        Ok(serde_json::to_string(self)?)
    }

    /// Decode a single JSONL line, enforcing required keys.
    pub fn decode_line(line: &str) -> Result<Self, EnvelopeError> {
        let env: Self = serde_json::from_str(line)?;
        if env.source_id.is_empty() {
            return Err(EnvelopeError::EmptyField("sourceId"));
        }
        if env.tenant_id.is_empty() {
            return Err(EnvelopeError::EmptyField("tenantId"));
        }
        Ok(env)
    }
}
