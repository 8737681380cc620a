// SPDX-License-Identifier: MIT OR Apache-2.0
#![deny(unsafe_code)]
#![warn(missing_docs)]
//! CAS-versioned checkpoint substrate.
//!
//! A checkpoint store holds one versioned document per
//! `(tenant, project, key)`. Writes are conditional on an expected version:
//! the first create uses `expected_version = 0`, and each successful put
//! returns `current + 1`. On conflict the caller reloads and decides; the
//! store never blocks.
//!
//! Checkpoint keys are the single serialization point between concurrent
//! slices of the same unit: every bit of cross-slice coordination happens
//! through CAS here.

/// Filesystem-backed store (one JSON document per key).
pub mod fs;
/// In-memory store.
pub mod memory;
/// Caller-side conflict and transient-error retry helpers.
pub mod retry;

pub use fs::FsCheckpointStore;
pub use memory::MemoryCheckpointStore;
pub use retry::{BackoffPolicy, Decision, with_cas_retry};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use ucl_core::{Checkpoint, CheckpointKey, InvalidKey, TenantContext};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors produced by checkpoint store operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The conditional write lost: the stored version differs from the
    /// expected one. Carries the current version and value so the caller
    /// can reload-and-decide without a second round trip.
    #[error("version conflict on {key}: expected {expected}, current {current}")]
    VersionConflict {
        /// The contested key.
        key: CheckpointKey,
        /// Version the caller expected.
        expected: u64,
        /// Version actually stored (0 when the key does not exist).
        current: u64,
        /// Value actually stored (`null` when the key does not exist).
        current_value: serde_json::Value,
    },

    /// Delete targeted a key that does not exist.
    #[error("checkpoint not found: {key}")]
    NotFound {
        /// The missing key.
        key: CheckpointKey,
    },

    /// The key failed grammar or tenant validation.
    #[error(transparent)]
    InvalidKey(#[from] InvalidKey),

    /// The backing medium failed (I/O, serialization).
    #[error("checkpoint backend error: {0}")]
    Backend(String),

    /// A CAS retry loop exhausted its attempts.
    #[error("checkpoint retries exhausted on {key}")]
    RetriesExhausted {
        /// The contested key.
        key: CheckpointKey,
    },

    /// The caller abandoned a CAS retry loop.
    #[error("checkpoint write abandoned: {reason}")]
    Abandoned {
        /// Why the caller gave up.
        reason: String,
    },
}

impl StoreError {
    /// Returns `true` for failures worth a jittered retry (backend faults).
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Backend(_))
    }
}

// ---------------------------------------------------------------------------
// Contract
// ---------------------------------------------------------------------------

/// A conditional checkpoint write.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PutRequest {
    /// The opaque progress document to store.
    pub value: serde_json::Value,
    /// Version the caller observed (0 for first create).
    pub expected_version: u64,
    /// Identity of the writer, recorded on the checkpoint.
    pub last_writer: String,
    /// Request id, recorded on the checkpoint.
    pub request_id: String,
    /// Optional soft-delete horizon in seconds.
    pub ttl_seconds: Option<u64>,
    /// Purpose tag (`"watermark"`, `"lease"`, …).
    pub semantics: Option<String>,
}

impl PutRequest {
    /// Build a write with the required fields.
    #[must_use]
    pub fn new(value: serde_json::Value, expected_version: u64) -> Self {
        Self {
            value,
            expected_version,
            last_writer: String::new(),
            request_id: String::new(),
            ttl_seconds: None,
            semantics: None,
        }
    }

    /// Record the writer identity.
    #[must_use]
    pub fn writer(mut self, writer: impl Into<String>, request_id: impl Into<String>) -> Self {
        self.last_writer = writer.into();
        self.request_id = request_id.into();
        self
    }

    /// Attach a TTL.
    #[must_use]
    pub fn ttl(mut self, seconds: u64) -> Self {
        self.ttl_seconds = Some(seconds);
        self
    }

    /// Attach a semantics tag.
    #[must_use]
    pub fn semantics(mut self, tag: impl Into<String>) -> Self {
        self.semantics = Some(tag.into());
        self
    }
}

/// The checkpoint store contract.
///
/// Implementations must be linearizable per key: of N concurrent puts with
/// the same expected version, exactly one succeeds and the rest observe a
/// version conflict.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// Read a checkpoint. Expired entries are soft-deleted on read (an audit
    /// record is emitted) and reported as absent.
    async fn get(
        &self,
        tenant: &TenantContext,
        key: &CheckpointKey,
    ) -> Result<Option<Checkpoint>, StoreError>;

    /// Conditionally write a checkpoint. Returns the new version.
    async fn put(
        &self,
        tenant: &TenantContext,
        key: &CheckpointKey,
        req: PutRequest,
    ) -> Result<u64, StoreError>;

    /// Conditionally delete a checkpoint.
    async fn delete(
        &self,
        tenant: &TenantContext,
        key: &CheckpointKey,
        expected_version: u64,
    ) -> Result<(), StoreError>;

    /// List keys under `prefix`, ascending, at most `limit`.
    ///
    /// `prefix` must lie inside the caller's tenant namespace.
    async fn list_keys(
        &self,
        tenant: &TenantContext,
        prefix: &str,
        limit: usize,
    ) -> Result<Vec<CheckpointKey>, StoreError>;
}

// ---------------------------------------------------------------------------
// Audit
// ---------------------------------------------------------------------------

/// Why an audit record was emitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditAction {
    /// A TTL-expired entry was soft-deleted during a read.
    ExpiredOnRead,
}

/// Record of a store-initiated mutation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditRecord {
    /// The affected key.
    pub key: CheckpointKey,
    /// What happened.
    pub action: AuditAction,
    /// Version of the entry at the time.
    pub version: u64,
    /// When it happened.
    pub at: DateTime<Utc>,
}

pub(crate) fn emit_expiry_audit(key: &CheckpointKey, version: u64) -> AuditRecord {
    tracing::info!(
        target: "ucl.checkpoint.audit",
        key = %key,
        version,
        "ttl expired, soft-deleting on read"
    );
    AuditRecord {
        key: key.clone(),
        action: AuditAction::ExpiredOnRead,
        version,
        at: Utc::now(),
    }
}

pub(crate) fn apply_put(
    key: &CheckpointKey,
    existing: Option<&Checkpoint>,
    req: &PutRequest,
) -> Result<Checkpoint, StoreError> {
    let current = existing.map_or(0, |c| c.version);
    if req.expected_version != current {
        return Err(StoreError::VersionConflict {
            key: key.clone(),
            expected: req.expected_version,
            current,
            current_value: existing
                .map(|c| c.value.clone())
                .unwrap_or(serde_json::Value::Null),
        });
    }
    Ok(Checkpoint {
        value: req.value.clone(),
        version: current + 1,
        last_writer: req.last_writer.clone(),
        request_id: req.request_id.clone(),
        updated_at: Utc::now(),
        ttl_seconds: req.ttl_seconds,
        semantics: req.semantics.clone(),
    })
}
