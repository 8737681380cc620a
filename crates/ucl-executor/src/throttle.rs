// SPDX-License-Identifier: MIT OR Apache-2.0
//! Slice-parallelism throttle with sink back-pressure.
//!
//! A run starts with `N = min(source concurrency hint, global max)` permits.
//! When the sink signals saturation the limit halves (never below 1) and
//! does not grow again for the remainder of the run.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::info;

/// Bounded, shrink-only permit pool for slice workers.
pub struct Throttle {
    semaphore: Arc<Semaphore>,
    limit: AtomicUsize,
}

impl Throttle {
    /// A throttle with `n` permits (clamped to at least 1).
    #[must_use]
    pub fn new(n: usize) -> Self {
        let n = n.max(1);
        Self {
            semaphore: Arc::new(Semaphore::new(n)),
            limit: AtomicUsize::new(n),
        }
    }

    /// Current permit limit.
    #[must_use]
    pub fn limit(&self) -> usize {
        self.limit.load(Ordering::SeqCst)
    }

    /// Wait for a slice permit.
    pub async fn acquire(&self) -> OwnedSemaphorePermit {
        Arc::clone(&self.semaphore)
            .acquire_many_owned(1)
            .await
            .expect("throttle semaphore never closes")
    }

    /// Halve the limit (minimum 1). Returns the new limit.
    ///
    /// Permits above the new limit are retired as running slices release
    /// them, so the reduction takes effect without interrupting work.
    pub fn shed(&self) -> usize {
        let current = self.limit.load(Ordering::SeqCst);
        let target = (current / 2).max(1);
        let retire = current - target;
        if retire > 0 {
            self.limit.store(target, Ordering::SeqCst);
            let semaphore = Arc::clone(&self.semaphore);
            tokio::spawn(async move {
                if let Ok(permits) = semaphore.acquire_many_owned(retire as u32).await {
                    permits.forget();
                }
            });
            info!(target: "ucl.executor.throttle", from = current, to = target, "sink saturated, shedding parallelism");
        }
        target
    }
}
