// SPDX-License-Identifier: MIT OR Apache-2.0
#![deny(unsafe_code)]

//! Wire-level error taxonomy for endpoint and executor operations.
//!
//! Every failure that crosses the connector contract carries a stable
//! [`ErrorCode`]. Codes partition into three bands:
//!
//! - **Transient** — retry with bounded exponential backoff and jitter.
//! - **Fatal** — no local recovery; the slice (and usually the run) fails.
//! - **Reset** — the stored cursor is no longer honored by the source; the
//!   planner degrades to a full strategy.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

// ---------------------------------------------------------------------------
// ErrorCode
// ---------------------------------------------------------------------------

/// Enumeration of all contract error codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    /// Credentials were rejected by the external system.
    AuthInvalid,
    /// Credentials are valid but lack a required scope or permission.
    ScopeMissing,
    /// The external system could not be reached.
    EndpointUnreachable,
    /// An operation exceeded its deadline.
    Timeout,
    /// The external system throttled the caller.
    RateLimited,
    /// The stored cursor (delta link, sync token) is no longer honored.
    CheckpointExpired,
    /// A required capability is not advertised by the live endpoint.
    CapabilityMissing,
    /// Input failed structural or semantic validation.
    Validation,
    /// A compare-and-swap lost to a concurrent writer that cannot be reconciled.
    Conflict,
    /// No staging backend is available; the run fails closed.
    StagingUnavailable,
}

/// Recovery band for an [`ErrorCode`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorBand {
    /// Retry with bounded exponential backoff.
    Transient,
    /// No local recovery.
    Fatal,
    /// Recoverable by resetting the checkpoint and re-planning full.
    Reset,
}

impl ErrorCode {
    /// Machine-readable wire code (e.g. `"E_AUTH_INVALID"`).
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::AuthInvalid => "E_AUTH_INVALID",
            Self::ScopeMissing => "E_SCOPE_MISSING",
            Self::EndpointUnreachable => "E_ENDPOINT_UNREACHABLE",
            Self::Timeout => "E_TIMEOUT",
            Self::RateLimited => "E_RATE_LIMITED",
            Self::CheckpointExpired => "E_CHECKPOINT_EXPIRED",
            Self::CapabilityMissing => "E_CAPABILITY_MISSING",
            Self::Validation => "E_VALIDATION",
            Self::Conflict => "E_CONFLICT",
            Self::StagingUnavailable => "E_STAGING_UNAVAILABLE",
        }
    }

    /// The recovery band this code belongs to.
    #[must_use]
    pub fn band(&self) -> ErrorBand {
        match self {
            Self::EndpointUnreachable | Self::Timeout | Self::RateLimited => ErrorBand::Transient,
            Self::CheckpointExpired => ErrorBand::Reset,
            Self::AuthInvalid
            | Self::ScopeMissing
            | Self::CapabilityMissing
            | Self::Validation
            | Self::Conflict
            | Self::StagingUnavailable => ErrorBand::Fatal,
        }
    }

    /// Returns `true` when callers may retry the failed operation.
    #[must_use]
    pub fn retryable(&self) -> bool {
        self.band() == ErrorBand::Transient
    }

    /// Look up a code by its wire string.
    #[must_use]
    pub fn parse(code: &str) -> Option<Self> {
        ALL_CODES.iter().find(|c| c.code() == code).copied()
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.code())
    }
}

/// All error codes, in definition order.
const ALL_CODES: &[ErrorCode] = &[
    ErrorCode::AuthInvalid,
    ErrorCode::ScopeMissing,
    ErrorCode::EndpointUnreachable,
    ErrorCode::Timeout,
    ErrorCode::RateLimited,
    ErrorCode::CheckpointExpired,
    ErrorCode::CapabilityMissing,
    ErrorCode::Validation,
    ErrorCode::Conflict,
    ErrorCode::StagingUnavailable,
];

// ---------------------------------------------------------------------------
// EndpointError
// ---------------------------------------------------------------------------

/// Rich error value returned by endpoint methods and the executor.
///
/// Carries the wire [`ErrorCode`], a human message, an optional throttle
/// hint, structured context, and an optional source error. Context values
/// must never contain secrets; redaction is enforced at the logging
/// boundary, not here.
pub struct EndpointError {
    /// The wire error code.
    pub code: ErrorCode,
    /// Human-readable message.
    pub message: String,
    /// Throttle hint carried by `E_RATE_LIMITED`.
    pub retry_after: Option<Duration>,
    /// Arbitrary key-value context (deterministic ordering).
    pub details: BTreeMap<String, String>,
    /// Optional underlying cause.
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

impl EndpointError {
    /// Start building an error for the given code.
    #[must_use]
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            retry_after: None,
            details: BTreeMap::new(),
            source: None,
        }
    }

    /// Shorthand for an `E_VALIDATION` error.
    #[must_use]
    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Validation, message)
    }

    /// Shorthand for an `E_CAPABILITY_MISSING` error.
    #[must_use]
    pub fn capability_missing(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::CapabilityMissing, message)
    }

    /// Attach a throttle hint (meaningful for `E_RATE_LIMITED`).
    #[must_use]
    pub fn with_retry_after(mut self, after: Duration) -> Self {
        self.retry_after = Some(after);
        self
    }

    /// Add a key-value context entry.
    #[must_use]
    pub fn with_detail(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.details.insert(key.into(), value.into());
        self
    }

    /// Attach an underlying source error.
    #[must_use]
    pub fn with_source(mut self, source: impl std::error::Error + Send + Sync + 'static) -> Self {
        self.source = Some(Box::new(source));
        self
    }

    /// Returns `true` when the operation may be retried.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        self.code.retryable()
    }
}

impl fmt::Display for EndpointError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.code.code(), self.message)?;
        if let Some(after) = self.retry_after {
            write!(f, " (retry after {}ms)", after.as_millis())?;
        }
        Ok(())
    }
}

impl fmt::Debug for EndpointError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EndpointError")
            .field("code", &self.code)
            .field("message", &self.message)
            .field("retry_after", &self.retry_after)
            .field("details", &self.details)
            .field("source", &self.source.as_ref().map(|e| e.to_string()))
            .finish()
    }
}

impl std::error::Error for EndpointError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source
            .as_ref()
            .map(|e| e.as_ref() as &(dyn std::error::Error + 'static))
    }
}

impl From<crate::ContractError> for EndpointError {
    fn from(err: crate::ContractError) -> Self {
        EndpointError::validation(err.to_string()).with_source(err)
    }
}

/// Convenience result alias for endpoint operations.
pub type EndpointResult<T> = Result<T, EndpointError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_stable() {
        assert_eq!(ErrorCode::AuthInvalid.code(), "E_AUTH_INVALID");
        assert_eq!(ErrorCode::RateLimited.code(), "E_RATE_LIMITED");
        assert_eq!(ErrorCode::StagingUnavailable.code(), "E_STAGING_UNAVAILABLE");
        for code in ALL_CODES {
            assert_eq!(ErrorCode::parse(code.code()), Some(*code));
        }
        assert_eq!(ErrorCode::parse("E_NOPE"), None);
    }

    #[test]
    fn bands_partition_retryability() {
        assert!(ErrorCode::Timeout.retryable());
        assert!(ErrorCode::EndpointUnreachable.retryable());
        assert!(ErrorCode::RateLimited.retryable());
        assert!(!ErrorCode::AuthInvalid.retryable());
        assert!(!ErrorCode::CheckpointExpired.retryable());
        assert_eq!(ErrorCode::CheckpointExpired.band(), ErrorBand::Reset);
    }

    #[test]
    fn display_includes_code_and_hint() {
        let err = EndpointError::new(ErrorCode::RateLimited, "throttled")
            .with_retry_after(Duration::from_secs(5))
            .with_detail("endpoint", "http.jira");
        let rendered = err.to_string();
        assert!(rendered.contains("E_RATE_LIMITED"));
        assert!(rendered.contains("5000ms"));
    }

    #[test]
    fn details_do_not_render_in_display() {
        // Secrets must not leak through Display; details only surface via the
        // redacting log boundary.
        let err = EndpointError::validation("bad config").with_detail("apiKey", "s3cr3t");
        assert!(!err.to_string().contains("s3cr3t"));
    }
}
