// SPDX-License-Identifier: MIT OR Apache-2.0
//! Caller-side retry helpers for CAS conflicts and transient backend faults.
//!
//! The store itself never blocks; on conflict the caller reloads the current
//! checkpoint and decides whether to rewrite, settle, or abandon. This module
//! packages that loop with the bounded backoff schedule (1s, 2s, 4s, 8s,
//! 16s, 32s, then escalate) and jittered retries for transient errors.

use crate::{CheckpointStore, PutRequest, StoreError};
use std::time::{Duration, SystemTime};
use tracing::{debug, warn};
use ucl_core::{Checkpoint, CheckpointKey, TenantContext};

/// Backoff schedule for CAS conflicts and transient faults.
#[derive(Debug, Clone)]
pub struct BackoffPolicy {
    /// Base delay (doubled each attempt).
    pub base_delay: Duration,
    /// Delay cap.
    pub max_delay: Duration,
    /// Attempts before escalating.
    pub max_attempts: u32,
    /// Jitter factor in `[0.0, 1.0]`; subtracts up to this fraction.
    pub jitter_factor: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(32),
            max_attempts: 6,
            jitter_factor: 0.0,
        }
    }
}

impl BackoffPolicy {
    /// Jittered policy for transient backend faults (5 attempts).
    #[must_use]
    pub fn transient() -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(32),
            max_attempts: 5,
            jitter_factor: 0.5,
        }
    }
}

/// Compute the delay before the retry following zero-indexed `attempt`.
#[must_use]
pub fn compute_delay(policy: &BackoffPolicy, attempt: u32) -> Duration {
    let exp = 2u64.saturating_pow(attempt);
    let delay_ms = (policy.base_delay.as_millis() as u64).saturating_mul(exp);
    let capped_ms = delay_ms.min(policy.max_delay.as_millis() as u64);

    let jitter_factor = policy.jitter_factor.clamp(0.0, 1.0);
    if jitter_factor > 0.0 && capped_ms > 0 {
        let jitter_range = (capped_ms as f64 * jitter_factor) as u64;
        // Cheap pseudo-random: system-clock nanos mixed with the attempt index.
        let nanos = SystemTime::now()
            .duration_since(SystemTime::UNIX_EPOCH)
            .unwrap_or_default()
            .subsec_nanos() as u64;
        let pseudo = nanos.wrapping_mul(attempt as u64 + 1);
        let jitter = if jitter_range > 0 { pseudo % jitter_range } else { 0 };
        Duration::from_millis(capped_ms.saturating_sub(jitter))
    } else {
        Duration::from_millis(capped_ms)
    }
}

/// What the caller wants to do after observing the current checkpoint.
#[derive(Debug)]
pub enum Decision {
    /// Attempt a conditional write.
    Write(PutRequest),
    /// The desired state is already present; nothing to write.
    Settled,
    /// Give up without writing.
    Abandon(String),
}

/// Reload-and-decide CAS loop.
///
/// On each attempt the current checkpoint is loaded and handed to `decide`.
/// A [`Decision::Write`] that loses its CAS triggers backoff and another
/// round; [`Decision::Settled`] returns `Ok(None)`;
/// [`Decision::Abandon`] returns [`StoreError::Abandoned`]. After
/// `max_attempts` conflicts the loop escalates with
/// [`StoreError::RetriesExhausted`].
pub async fn with_cas_retry<F>(
    store: &dyn CheckpointStore,
    tenant: &TenantContext,
    key: &CheckpointKey,
    policy: &BackoffPolicy,
    mut decide: F,
) -> Result<Option<u64>, StoreError>
where
    F: FnMut(Option<&Checkpoint>) -> Decision,
{
    for attempt in 0..policy.max_attempts {
        let current = store.get(tenant, key).await?;
        match decide(current.as_ref()) {
            Decision::Settled => return Ok(None),
            Decision::Abandon(reason) => return Err(StoreError::Abandoned { reason }),
            Decision::Write(req) => match store.put(tenant, key, req).await {
                Ok(version) => return Ok(Some(version)),
                Err(StoreError::VersionConflict { current, .. }) => {
                    let delay = compute_delay(policy, attempt);
                    debug!(
                        target: "ucl.checkpoint.retry",
                        key = %key,
                        attempt,
                        current,
                        delay_ms = delay.as_millis() as u64,
                        "cas conflict, backing off"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(other) => return Err(other),
            },
        }
    }
    warn!(target: "ucl.checkpoint.retry", key = %key, "cas retries exhausted");
    Err(StoreError::RetriesExhausted { key: key.clone() })
}

/// Retry `op` across transient backend faults with jittered backoff.
///
/// Non-transient errors (conflicts, validation) surface immediately.
pub async fn retry_transient<T, F, Fut>(
    policy: &BackoffPolicy,
    mut op: F,
) -> Result<T, StoreError>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, StoreError>>,
{
    let mut last = None;
    for attempt in 0..policy.max_attempts {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_transient() => {
                let delay = compute_delay(policy, attempt);
                warn!(
                    target: "ucl.checkpoint.retry",
                    error = %err,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    "transient backend error, backing off"
                );
                last = Some(err);
                tokio::time::sleep(delay).await;
            }
            Err(err) => return Err(err),
        }
    }
    Err(last.unwrap_or(StoreError::Backend("retries exhausted".into())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MemoryCheckpointStore;
    use serde_json::json;

    fn tenant() -> TenantContext {
        TenantContext::new("acme", "main").unwrap()
    }

    fn key() -> CheckpointKey {
        CheckpointKey::parse("tenant/acme/project/main/http/u1/updated").unwrap()
    }

    #[test]
    fn delays_follow_the_schedule() {
        let policy = BackoffPolicy::default();
        let delays: Vec<u64> = (0..6)
            .map(|a| compute_delay(&policy, a).as_secs())
            .collect();
        assert_eq!(delays, vec![1, 2, 4, 8, 16, 32]);
    }

    #[test]
    fn jitter_never_exceeds_the_cap() {
        let policy = BackoffPolicy::transient();
        for attempt in 0..10 {
            let delay = compute_delay(&policy, attempt);
            assert!(delay <= policy.max_delay);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn settles_when_state_is_already_there() {
        let store = MemoryCheckpointStore::new();
        let t = tenant();
        let k = key();
        store
            .put(&t, &k, PutRequest::new(json!({"updated": "t1"}), 0))
            .await
            .unwrap();

        let outcome = with_cas_retry(&store, &t, &k, &BackoffPolicy::default(), |current| {
            match current {
                Some(cp) if cp.value == json!({"updated": "t1"}) => Decision::Settled,
                Some(cp) => Decision::Write(PutRequest::new(json!({"updated": "t1"}), cp.version)),
                None => Decision::Write(PutRequest::new(json!({"updated": "t1"}), 0)),
            }
        })
        .await
        .unwrap();
        assert_eq!(outcome, None);
    }

    #[tokio::test(start_paused = true)]
    async fn writes_after_reload() {
        let store = MemoryCheckpointStore::new();
        let t = tenant();
        let k = key();
        store
            .put(&t, &k, PutRequest::new(json!({"updated": "t1"}), 0))
            .await
            .unwrap();

        let outcome = with_cas_retry(&store, &t, &k, &BackoffPolicy::default(), |current| {
            let version = current.map_or(0, |c| c.version);
            Decision::Write(PutRequest::new(json!({"updated": "t2"}), version))
        })
        .await
        .unwrap();
        assert_eq!(outcome, Some(2));
    }

    #[tokio::test(start_paused = true)]
    async fn abandon_surfaces_as_error() {
        let store = MemoryCheckpointStore::new();
        let t = tenant();
        let k = key();
        let err = with_cas_retry(&store, &t, &k, &BackoffPolicy::default(), |_| {
            Decision::Abandon("newer watermark already stored".into())
        })
        .await
        .unwrap_err();
        assert!(matches!(err, StoreError::Abandoned { .. }));
    }
}
