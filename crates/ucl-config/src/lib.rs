// SPDX-License-Identifier: MIT OR Apache-2.0
//! Configuration loading, validation, and merging for the connectivity layer.
//!
//! Provides [`UclConfig`] (executor limits, staging policy, and retry
//! schedule) with helpers for loading from TOML, applying `UCL_*`
//! environment overrides, and producing advisory [`ConfigWarning`]s.
#![deny(unsafe_code)]
#![warn(missing_docs)]

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::path::Path;

// ---------------------------------------------------------------------------
// Errors & warnings
// ---------------------------------------------------------------------------

/// Errors that can occur during configuration loading or validation.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The requested configuration file was not found.
    #[error("config file not found: {path}")]
    FileNotFound {
        /// Path that was requested.
        path: String,
    },

    /// The file could not be parsed as valid TOML.
    #[error("failed to parse config: {reason}")]
    ParseError {
        /// Human-readable parse error detail.
        reason: String,
    },

    /// Semantic validation failed (one or more problems).
    #[error("config validation failed: {reasons:?}")]
    ValidationError {
        /// Individual validation failure messages.
        reasons: Vec<String>,
    },
}

/// Advisory-level issues that do not prevent operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigWarning {
    /// A timeout is unusually large.
    LargeTimeout {
        /// Which timeout.
        field: String,
        /// Value in seconds.
        secs: u64,
    },
    /// The memory staging backend is enabled with a large cap.
    LargeMemoryCap {
        /// Cap in bytes.
        bytes: u64,
    },
}

impl std::fmt::Display for ConfigWarning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigWarning::LargeTimeout { field, secs } => {
                write!(f, "'{field}' is unusually large ({secs}s)")
            }
            ConfigWarning::LargeMemoryCap { bytes } => {
                write!(f, "memory staging cap of {bytes} bytes defeats its purpose")
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Config types
// ---------------------------------------------------------------------------

/// Executor limits.
#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(default)]
pub struct ExecutorSettings {
    /// Upper bound on slice parallelism per run.
    pub global_max_concurrency: usize,
    /// Fail the run on the first fatal slice.
    pub fail_fast: bool,
    /// Soft per-slice timeout in seconds (graceful reschedule).
    pub soft_slice_timeout_secs: u64,
    /// Hard per-slice timeout in seconds (`E_TIMEOUT`).
    pub hard_slice_timeout_secs: u64,
}

impl Default for ExecutorSettings {
    fn default() -> Self {
        Self {
            global_max_concurrency: 8,
            fail_fast: false,
            soft_slice_timeout_secs: 30 * 60,
            hard_slice_timeout_secs: 60 * 60,
        }
    }
}

/// Staging backend policy.
#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(default)]
pub struct StagingSettings {
    /// Scheme for staging URIs (`s3`, `file`, `mem`).
    pub scheme: String,
    /// Bucket (or namespace) for staging URIs.
    pub bucket: String,
    /// Whether the bounded memory backend may be used as a fallback.
    pub memory_enabled: bool,
    /// Record-count ceiling for choosing the memory backend.
    pub memory_threshold_records: u64,
    /// Hard byte cap for the memory backend.
    pub memory_cap_bytes: u64,
}

impl Default for StagingSettings {
    fn default() -> Self {
        Self {
            scheme: "mem".into(),
            bucket: "ucl-staging".into(),
            memory_enabled: true,
            memory_threshold_records: 10_000,
            memory_cap_bytes: 8 * 1024 * 1024,
        }
    }
}

/// Retry schedule for transient failures.
#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(default)]
pub struct RetrySettings {
    /// Base backoff delay in milliseconds.
    pub base_delay_ms: u64,
    /// Backoff cap in milliseconds.
    pub max_delay_ms: u64,
    /// Attempts before giving up.
    pub max_attempts: u32,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            base_delay_ms: 1_000,
            max_delay_ms: 32_000,
            max_attempts: 5,
        }
    }
}

/// Top-level runtime configuration.
#[derive(Debug, Clone, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(default)]
pub struct UclConfig {
    /// Log level override (`"debug"`, `"info"`, `"warn"`).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_level: Option<String>,
    /// Executor limits.
    pub executor: ExecutorSettings,
    /// Staging policy.
    pub staging: StagingSettings,
    /// Retry schedule.
    pub retry: RetrySettings,
}

// ---------------------------------------------------------------------------
// Loading
// ---------------------------------------------------------------------------

/// Load configuration: defaults, then the optional TOML file, then `UCL_*`
/// environment overrides.
pub fn load_config(path: Option<&Path>) -> Result<UclConfig, ConfigError> {
    let mut config = match path {
        Some(path) => {
            let content =
                std::fs::read_to_string(path).map_err(|_| ConfigError::FileNotFound {
                    path: path.display().to_string(),
                })?;
            parse_toml(&content)?
        }
        None => UclConfig::default(),
    };
    apply_env_overrides(&mut config);
    validate_config(&config)?;
    Ok(config)
}

/// Parse a TOML document into a [`UclConfig`].
pub fn parse_toml(content: &str) -> Result<UclConfig, ConfigError> {
    toml::from_str(content).map_err(|e| ConfigError::ParseError {
        reason: e.to_string(),
    })
}

/// Apply `UCL_*` environment overrides in place.
///
/// Recognized: `UCL_LOG_LEVEL`, `UCL_GLOBAL_MAX_CONCURRENCY`,
/// `UCL_FAIL_FAST`, `UCL_STAGING_BUCKET`, `UCL_STAGING_SCHEME`.
pub fn apply_env_overrides(config: &mut UclConfig) {
    if let Ok(level) = std::env::var("UCL_LOG_LEVEL") {
        config.log_level = Some(level);
    }
    if let Ok(n) = std::env::var("UCL_GLOBAL_MAX_CONCURRENCY") {
        if let Ok(n) = n.parse() {
            config.executor.global_max_concurrency = n;
        }
    }
    if let Ok(flag) = std::env::var("UCL_FAIL_FAST") {
        config.executor.fail_fast = matches!(flag.as_str(), "1" | "true" | "yes");
    }
    if let Ok(bucket) = std::env::var("UCL_STAGING_BUCKET") {
        config.staging.bucket = bucket;
    }
    if let Ok(scheme) = std::env::var("UCL_STAGING_SCHEME") {
        config.staging.scheme = scheme;
    }
}

/// Validate a configuration, returning advisory warnings.
pub fn validate_config(config: &UclConfig) -> Result<Vec<ConfigWarning>, ConfigError> {
    let mut reasons = Vec::new();
    if config.executor.global_max_concurrency == 0 {
        reasons.push("executor.global_max_concurrency must be at least 1".to_string());
    }
    if config.executor.hard_slice_timeout_secs < config.executor.soft_slice_timeout_secs {
        reasons.push(
            "executor.hard_slice_timeout_secs must be >= soft_slice_timeout_secs".to_string(),
        );
    }
    if config.retry.max_attempts == 0 {
        reasons.push("retry.max_attempts must be at least 1".to_string());
    }
    if config.retry.max_delay_ms < config.retry.base_delay_ms {
        reasons.push("retry.max_delay_ms must be >= base_delay_ms".to_string());
    }
    if config.staging.scheme.is_empty() || config.staging.bucket.is_empty() {
        reasons.push("staging.scheme and staging.bucket must be non-empty".to_string());
    }
    if !reasons.is_empty() {
        return Err(ConfigError::ValidationError { reasons });
    }

    let mut warnings = Vec::new();
    if config.executor.hard_slice_timeout_secs > 6 * 60 * 60 {
        warnings.push(ConfigWarning::LargeTimeout {
            field: "executor.hard_slice_timeout_secs".into(),
            secs: config.executor.hard_slice_timeout_secs,
        });
    }
    if config.staging.memory_enabled && config.staging.memory_cap_bytes > 64 * 1024 * 1024 {
        warnings.push(ConfigWarning::LargeMemoryCap {
            bytes: config.staging.memory_cap_bytes,
        });
    }
    Ok(warnings)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate_cleanly() {
        let config = UclConfig::default();
        assert!(validate_config(&config).unwrap().is_empty());
        assert_eq!(config.executor.global_max_concurrency, 8);
        assert_eq!(config.staging.memory_cap_bytes, 8 * 1024 * 1024);
        assert_eq!(config.retry.max_attempts, 5);
    }

    #[test]
    fn toml_round_trip() {
        let config = parse_toml(
            r#"
            log_level = "debug"

            [executor]
            global_max_concurrency = 4
            fail_fast = true

            [staging]
            scheme = "s3"
            bucket = "prod-staging"
            memory_enabled = false

            [retry]
            base_delay_ms = 500
            "#,
        )
        .unwrap();
        assert_eq!(config.log_level.as_deref(), Some("debug"));
        assert_eq!(config.executor.global_max_concurrency, 4);
        assert!(config.executor.fail_fast);
        assert_eq!(config.staging.scheme, "s3");
        assert!(!config.staging.memory_enabled);
        assert_eq!(config.retry.base_delay_ms, 500);
        // Unspecified fields keep their defaults.
        assert_eq!(config.retry.max_attempts, 5);
        assert_eq!(config.executor.soft_slice_timeout_secs, 1_800);
    }

    #[test]
    fn malformed_toml_is_a_parse_error() {
        assert!(matches!(
            parse_toml("executor = \"not a table\""),
            Err(ConfigError::ParseError { .. })
        ));
    }

    #[test]
    fn semantic_validation_catches_inverted_bounds() {
        let mut config = UclConfig::default();
        config.executor.soft_slice_timeout_secs = 100;
        config.executor.hard_slice_timeout_secs = 50;
        config.executor.global_max_concurrency = 0;
        match validate_config(&config) {
            Err(ConfigError::ValidationError { reasons }) => {
                assert_eq!(reasons.len(), 2);
            }
            other => panic!("expected validation failure, got {other:?}"),
        }
    }

    #[test]
    fn oversized_knobs_warn() {
        let mut config = UclConfig::default();
        config.executor.hard_slice_timeout_secs = 24 * 60 * 60;
        config.staging.memory_cap_bytes = 512 * 1024 * 1024;
        let warnings = validate_config(&config).unwrap();
        assert_eq!(warnings.len(), 2);
    }

    #[test]
    fn load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ucl.toml");
        std::fs::write(&path, "[staging]\nscheme = \"file\"\n").unwrap();
        let config = load_config(Some(&path)).unwrap();
        assert_eq!(config.staging.scheme, "file");
        assert!(matches!(
            load_config(Some(&dir.path().join("missing.toml"))),
            Err(ConfigError::FileNotFound { .. })
        ));
    }
}
