// SPDX-License-Identifier: MIT OR Apache-2.0
//! Slice-level retry for transient endpoint errors.
//!
//! Transient codes (`E_ENDPOINT_UNREACHABLE`, `E_TIMEOUT`,
//! `E_RATE_LIMITED`) back off exponentially with jitter, capped at five
//! attempts. `E_RATE_LIMITED` additionally honors the `retryAfter` hint:
//! the wait is never shorter than what the source mandated.

use std::time::Duration;
use ucl_core::EndpointError;
pub use ucl_checkpoint::retry::BackoffPolicy;
use ucl_checkpoint::retry::compute_delay;

/// Default slice retry policy: 1s → 32s, jittered, 5 attempts.
#[must_use]
pub fn default_policy() -> BackoffPolicy {
    BackoffPolicy {
        base_delay: Duration::from_secs(1),
        max_delay: Duration::from_secs(32),
        max_attempts: 5,
        jitter_factor: 0.5,
    }
}

/// The wait before retrying `err` after zero-indexed `attempt`.
///
/// Returns `None` when the error is not retryable or attempts ran out.
#[must_use]
pub fn retry_delay(
    policy: &BackoffPolicy,
    attempt: u32,
    err: &EndpointError,
) -> Option<Duration> {
    if !err.is_retryable() || attempt + 1 >= policy.max_attempts {
        return None;
    }
    let backoff = compute_delay(policy, attempt);
    Some(match err.retry_after {
        Some(mandated) => backoff.max(mandated),
        None => backoff,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use ucl_core::ErrorCode;

    #[test]
    fn fatal_errors_never_retry() {
        let policy = default_policy();
        let err = EndpointError::new(ErrorCode::AuthInvalid, "nope");
        assert_eq!(retry_delay(&policy, 0, &err), None);
    }

    #[test]
    fn attempts_are_capped() {
        let policy = default_policy();
        let err = EndpointError::new(ErrorCode::Timeout, "slow");
        assert!(retry_delay(&policy, 0, &err).is_some());
        assert!(retry_delay(&policy, 3, &err).is_some());
        assert_eq!(retry_delay(&policy, 4, &err), None);
    }

    #[test]
    fn rate_limit_hint_extends_the_wait() {
        let policy = BackoffPolicy {
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(32),
            max_attempts: 5,
            jitter_factor: 0.0,
        };
        let err = EndpointError::new(ErrorCode::RateLimited, "throttled")
            .with_retry_after(Duration::from_secs(5));
        // Backoff after attempt 0 is 1s; the 5s mandate wins.
        assert_eq!(retry_delay(&policy, 0, &err), Some(Duration::from_secs(5)));
        // Backoff after attempt 3 is 8s; the mandate no longer dominates.
        assert_eq!(retry_delay(&policy, 3, &err), Some(Duration::from_secs(8)));
    }
}
