// SPDX-License-Identifier: MIT OR Apache-2.0
#![deny(unsafe_code)]
#![warn(missing_docs)]
//! Universal Connectivity Layer.
//!
//! A connector framework and ingestion engine: records move from
//! heterogeneous sources through a deterministic, resumable, slice-based
//! pipeline into internal sinks. This façade crate re-exports the member
//! crates and provides the glue that assembles an executor from loaded
//! configuration.

pub use ucl_checkpoint as checkpoint;
pub use ucl_config as config;
pub use ucl_core as contract;
pub use ucl_endpoint as endpoint;
pub use ucl_executor as executor;
pub use ucl_planner as planner;
pub use ucl_staging as staging;
pub use ucl_telemetry as telemetry;

use std::sync::Arc;
use std::time::Duration;
use ucl_config::UclConfig;
use ucl_executor::ExecutorOptions;
use ucl_staging::{MemoryStaging, StagingProvider, StagingSelector};

/// Build executor options from loaded configuration.
#[must_use]
pub fn executor_options(config: &UclConfig) -> ExecutorOptions {
    ExecutorOptions {
        global_max_concurrency: config.executor.global_max_concurrency,
        fail_fast: config.executor.fail_fast,
        soft_slice_timeout: Duration::from_secs(config.executor.soft_slice_timeout_secs),
        hard_slice_timeout: Duration::from_secs(config.executor.hard_slice_timeout_secs),
        retry: ucl_executor::BackoffPolicy {
            base_delay: Duration::from_millis(config.retry.base_delay_ms),
            max_delay: Duration::from_millis(config.retry.max_delay_ms),
            max_attempts: config.retry.max_attempts,
            jitter_factor: 0.5,
        },
        staging_scheme: config.staging.scheme.clone(),
        staging_bucket: config.staging.bucket.clone(),
    }
}

/// Build the staging selection policy from configuration.
///
/// `object_store` is the primary backend when one is wired up; the bounded
/// memory backend joins as a fallback when the config enables it.
#[must_use]
pub fn staging_selector(
    config: &UclConfig,
    object_store: Option<Arc<dyn StagingProvider>>,
) -> StagingSelector {
    let memory: Option<Arc<dyn StagingProvider>> = if config.staging.memory_enabled {
        Some(Arc::new(MemoryStaging::with_cap(
            config.staging.memory_cap_bytes,
        )))
    } else {
        None
    };
    StagingSelector::new(
        object_store,
        memory,
        config.staging.memory_threshold_records,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn options_mirror_config() {
        let mut config = UclConfig::default();
        config.executor.global_max_concurrency = 3;
        config.executor.fail_fast = true;
        config.retry.base_delay_ms = 250;
        config.staging.bucket = "custom".into();

        let options = executor_options(&config);
        assert_eq!(options.global_max_concurrency, 3);
        assert!(options.fail_fast);
        assert_eq!(options.retry.base_delay, Duration::from_millis(250));
        assert_eq!(options.staging_bucket, "custom");
    }

    #[test]
    fn selector_respects_memory_policy() {
        let mut config = UclConfig::default();
        config.staging.memory_enabled = false;
        let selector = staging_selector(&config, None);
        assert!(selector.select(Some(1)).is_err());

        config.staging.memory_enabled = true;
        let selector = staging_selector(&config, None);
        assert!(selector.select(Some(1)).is_ok());
    }
}
