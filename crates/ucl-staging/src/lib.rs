// SPDX-License-Identifier: MIT OR Apache-2.0
#![deny(unsafe_code)]
#![warn(missing_docs)]
//! Staging substrate: gzipped JSONL record batches under stable URIs.
//!
//! Staging decouples source read throughput from sink write throughput and
//! keeps record batches out of the workflow control plane; only
//! [`StageRef`]s and [`BatchRef`]s cross process boundaries.
//!
//! Two backends implement [`StagingProvider`]: the object-store backend
//! (primary, any [`object_store::ObjectStore`]) and a bounded in-memory
//! backend for small runs that fails closed when its cap is reached.

/// Staging reference grammar (`StageRef`, `BatchRef`).
pub mod refs;

pub use refs::{BatchRef, StageRef};

use async_trait::async_trait;
use flate2::Compression;
use flate2::write::GzEncoder;
use futures::TryStreamExt;
use object_store::{ObjectStore, PutPayload};
use std::collections::BTreeMap;
use std::io::{Read, Write};
use std::sync::Arc;
use tracing::{debug, warn};
use ucl_core::{ENVELOPE_FORMAT, EndpointError, EnvelopeError, ErrorCode, RecordEnvelope, StagingHandle};

/// Rotate a part when this much raw JSONL has been appended.
pub const ROTATE_BYTES: u64 = 8 * 1024 * 1024;
/// Rotate a part when this many records have been appended.
pub const ROTATE_RECORDS: u32 = 10_000;
/// Hard cap for the in-memory backend.
pub const MEMORY_CAP_BYTES: u64 = 8 * 1024 * 1024;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors produced by the staging substrate.
#[derive(Debug, thiserror::Error)]
pub enum StagingError {
    /// The backing object store failed.
    #[error("object store error: {0}")]
    Store(#[from] object_store::Error),

    /// A staged line failed to encode or decode.
    #[error("envelope codec error: {0}")]
    Envelope(#[from] EnvelopeError),

    /// Gzip framing failed.
    #[error("gzip error: {0}")]
    Io(#[from] std::io::Error),

    /// A staging URI failed the reference grammar.
    #[error("invalid staging reference {uri:?}: {reason}")]
    InvalidRef {
        /// The offending URI.
        uri: String,
        /// Why it was rejected.
        reason: String,
    },

    /// The in-memory backend would exceed its cap; the write fails closed.
    #[error("memory staging cap of {cap} bytes exceeded")]
    CapExceeded {
        /// The configured cap.
        cap: u64,
    },

    /// No staging backend is available for this run.
    #[error("no staging backend available: {0}")]
    Unavailable(String),
}

impl StagingError {
    /// The wire error code this failure surfaces as.
    #[must_use]
    pub fn error_code(&self) -> ErrorCode {
        match self {
            Self::InvalidRef { .. } | Self::Envelope(_) => ErrorCode::Validation,
            _ => ErrorCode::StagingUnavailable,
        }
    }
}

impl From<StagingError> for EndpointError {
    fn from(err: StagingError) -> Self {
        EndpointError::new(err.error_code(), err.to_string()).with_source(err)
    }
}

// ---------------------------------------------------------------------------
// Provider contract
// ---------------------------------------------------------------------------

/// Which backend a provider represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StagingBackend {
    /// Bucket-backed object store (primary).
    ObjectStore,
    /// Bounded in-memory store for small runs.
    Memory,
}

/// The staging provider contract.
#[async_trait]
pub trait StagingProvider: Send + Sync {
    /// Which backend this provider is.
    fn backend(&self) -> StagingBackend;

    /// Open a batch writer under the given per-run prefix.
    async fn open_batch(&self, stage: &StageRef) -> Result<BatchWriter, StagingError>;

    /// Open a restartable reader over one sealed batch.
    async fn open_reader(&self, batch: &BatchRef) -> Result<BatchReader, StagingError>;

    /// List the sealed batches under a prefix, in part order.
    async fn list(&self, stage: &StageRef) -> Result<Vec<BatchRef>, StagingError>;

    /// Best-effort removal of everything under a prefix.
    async fn delete(&self, stage: &StageRef) -> Result<(), StagingError>;

    /// Best-effort removal of one sealed batch.
    async fn delete_batch(&self, batch: &BatchRef) -> Result<(), StagingError>;
}

// ---------------------------------------------------------------------------
// Batch writer
// ---------------------------------------------------------------------------

/// Appends record envelopes as gzipped JSONL, rotating parts at the
/// byte/record thresholds. Sealed parts are immutable.
pub struct BatchWriter {
    store: Arc<dyn ObjectStore>,
    stage: StageRef,
    budget: Option<Arc<MemoryBudget>>,
    encoder: GzEncoder<Vec<u8>>,
    rotate_bytes: u64,
    rotate_records: u32,
    raw_bytes_in_part: u64,
    records_in_part: u32,
    next_part: u32,
    sealed: Vec<BatchRef>,
    total_records: u64,
    total_compressed: u64,
}

fn new_encoder() -> GzEncoder<Vec<u8>> {
    GzEncoder::new(Vec::new(), Compression::default())
}

impl BatchWriter {
    fn new(
        store: Arc<dyn ObjectStore>,
        stage: StageRef,
        budget: Option<Arc<MemoryBudget>>,
    ) -> Self {
        Self {
            store,
            stage,
            budget,
            encoder: new_encoder(),
            rotate_bytes: ROTATE_BYTES,
            rotate_records: ROTATE_RECORDS,
            raw_bytes_in_part: 0,
            records_in_part: 0,
            next_part: 0,
            sealed: Vec::new(),
            total_records: 0,
            total_compressed: 0,
        }
    }

    /// Override the rotation thresholds (tests exercise small parts).
    #[must_use]
    pub fn with_rotation(mut self, bytes: u64, records: u32) -> Self {
        self.rotate_bytes = bytes;
        self.rotate_records = records;
        self
    }

    /// Start part numbering at `base`.
    ///
    /// Concurrent writers of the same run (one per slice) share the run
    /// prefix; each takes a disjoint part-number block.
    #[must_use]
    pub fn with_part_base(mut self, base: u32) -> Self {
        self.next_part = base;
        self
    }

    /// Append one envelope, rotating the part when a threshold is reached.
    pub async fn append(&mut self, envelope: &RecordEnvelope) -> Result<(), StagingError> {
        let line = envelope.encode_line()?;
        self.encoder.write_all(line.as_bytes())?;
        self.encoder.write_all(b"\n")?;
        self.raw_bytes_in_part += line.len() as u64 + 1;
        self.records_in_part += 1;
        self.total_records += 1;
        if self.raw_bytes_in_part >= self.rotate_bytes || self.records_in_part >= self.rotate_records
        {
            self.seal_part().await?;
        }
        Ok(())
    }

    async fn seal_part(&mut self) -> Result<(), StagingError> {
        if self.records_in_part == 0 {
            return Ok(());
        }
        let encoder = std::mem::replace(&mut self.encoder, new_encoder());
        let compressed = encoder.finish()?;
        if let Some(budget) = &self.budget {
            budget.reserve(&self.stage.uri(), compressed.len() as u64)?;
        }
        let batch = self.stage.batch(self.next_part);
        self.total_compressed += compressed.len() as u64;
        self.store
            .put(&batch.object_path(), PutPayload::from(compressed))
            .await?;
        debug!(
            target: "ucl.staging",
            batch = %batch,
            records = self.records_in_part,
            raw_bytes = self.raw_bytes_in_part,
            "sealed staging part"
        );
        self.sealed.push(batch);
        self.next_part += 1;
        self.raw_bytes_in_part = 0;
        self.records_in_part = 0;
        Ok(())
    }

    /// Batches sealed so far.
    #[must_use]
    pub fn sealed(&self) -> &[BatchRef] {
        &self.sealed
    }

    /// Seal any open part and return the staging handle.
    pub async fn finish(mut self) -> Result<StagingHandle, StagingError> {
        self.seal_part().await?;
        Ok(StagingHandle {
            stage_ref: self.stage.uri(),
            batch_refs: self.sealed.iter().map(BatchRef::uri).collect(),
            envelope_format: ENVELOPE_FORMAT.to_string(),
            record_count: self.total_records,
            byte_count: self.total_compressed,
        })
    }
}

// ---------------------------------------------------------------------------
// Batch reader
// ---------------------------------------------------------------------------

/// Lazy, finite iterator over the envelopes of one sealed batch.
///
/// Restartable by reopening the batch through the provider.
pub struct BatchReader {
    lines: std::vec::IntoIter<String>,
}

impl BatchReader {
    fn from_gzip(bytes: &[u8]) -> Result<Self, StagingError> {
        let mut text = String::new();
        flate2::read::GzDecoder::new(bytes).read_to_string(&mut text)?;
        let lines: Vec<String> = text
            .lines()
            .filter(|l| !l.is_empty())
            .map(str::to_string)
            .collect();
        Ok(Self {
            lines: lines.into_iter(),
        })
    }
}

impl Iterator for BatchReader {
    type Item = Result<RecordEnvelope, StagingError>;

    fn next(&mut self) -> Option<Self::Item> {
        let line = self.lines.next()?;
        Some(RecordEnvelope::decode_line(&line).map_err(StagingError::from))
    }
}

// ---------------------------------------------------------------------------
// Backends
// ---------------------------------------------------------------------------

async fn list_parts(
    store: &Arc<dyn ObjectStore>,
    stage: &StageRef,
) -> Result<Vec<BatchRef>, StagingError> {
    let prefix = stage.object_prefix();
    let metas: Vec<object_store::ObjectMeta> =
        store.list(Some(&prefix)).try_collect().await?;
    let mut parts: Vec<BatchRef> = Vec::new();
    for meta in metas {
        let name = meta.location.filename().unwrap_or_default().to_string();
        if let Some(part) = name
            .strip_prefix("part-")
            .and_then(|s| s.strip_suffix(".jsonl.gz"))
            .and_then(|s| s.parse::<u32>().ok())
        {
            parts.push(stage.batch(part));
        }
    }
    parts.sort_by_key(|b| b.part);
    Ok(parts)
}

async fn delete_parts(store: &Arc<dyn ObjectStore>, stage: &StageRef) {
    match list_parts(store, stage).await {
        Ok(parts) => {
            for part in parts {
                if let Err(e) = store.delete(&part.object_path()).await {
                    warn!(target: "ucl.staging", batch = %part, error = %e, "cleanup failed");
                }
            }
        }
        Err(e) => warn!(target: "ucl.staging", stage = %stage, error = %e, "cleanup listing failed"),
    }
}

/// Primary staging backend over any [`ObjectStore`].
pub struct ObjectStoreStaging {
    store: Arc<dyn ObjectStore>,
}

impl ObjectStoreStaging {
    /// Wrap an object store client.
    #[must_use]
    pub fn new(store: Arc<dyn ObjectStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl StagingProvider for ObjectStoreStaging {
    fn backend(&self) -> StagingBackend {
        StagingBackend::ObjectStore
    }

    async fn open_batch(&self, stage: &StageRef) -> Result<BatchWriter, StagingError> {
        Ok(BatchWriter::new(Arc::clone(&self.store), stage.clone(), None))
    }

    async fn open_reader(&self, batch: &BatchRef) -> Result<BatchReader, StagingError> {
        let bytes = self.store.get(&batch.object_path()).await?.bytes().await?;
        BatchReader::from_gzip(&bytes)
    }

    async fn list(&self, stage: &StageRef) -> Result<Vec<BatchRef>, StagingError> {
        list_parts(&self.store, stage).await
    }

    async fn delete(&self, stage: &StageRef) -> Result<(), StagingError> {
        delete_parts(&self.store, stage).await;
        Ok(())
    }

    async fn delete_batch(&self, batch: &BatchRef) -> Result<(), StagingError> {
        match self.store.delete(&batch.object_path()).await {
            Ok(()) | Err(object_store::Error::NotFound { .. }) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Byte budget shared by all writers of the memory backend.
pub struct MemoryBudget {
    cap: u64,
    ledger: std::sync::Mutex<Ledger>,
}

#[derive(Default)]
struct Ledger {
    used: u64,
    per_stage: BTreeMap<String, u64>,
}

impl MemoryBudget {
    fn new(cap: u64) -> Self {
        Self {
            cap,
            ledger: std::sync::Mutex::new(Ledger::default()),
        }
    }

    fn reserve(&self, stage_uri: &str, bytes: u64) -> Result<(), StagingError> {
        let mut ledger = self.ledger.lock().expect("budget ledger poisoned");
        if ledger.used + bytes > self.cap {
            return Err(StagingError::CapExceeded { cap: self.cap });
        }
        ledger.used += bytes;
        *ledger.per_stage.entry(stage_uri.to_string()).or_default() += bytes;
        Ok(())
    }

    fn release_stage(&self, stage_uri: &str) {
        let mut ledger = self.ledger.lock().expect("budget ledger poisoned");
        if let Some(bytes) = ledger.per_stage.remove(stage_uri) {
            ledger.used = ledger.used.saturating_sub(bytes);
        }
    }

    /// Bytes currently reserved.
    #[must_use]
    pub fn used(&self) -> u64 {
        self.ledger.lock().expect("budget ledger poisoned").used
    }
}

/// Bounded in-memory staging backend for small runs.
///
/// Exceeding the cap fails closed; staging is never silently dropped.
pub struct MemoryStaging {
    store: Arc<dyn ObjectStore>,
    budget: Arc<MemoryBudget>,
}

impl MemoryStaging {
    /// Create a memory backend with the default cap.
    #[must_use]
    pub fn new() -> Self {
        Self::with_cap(MEMORY_CAP_BYTES)
    }

    /// Create a memory backend with an explicit cap.
    #[must_use]
    pub fn with_cap(cap: u64) -> Self {
        Self {
            store: Arc::new(object_store::memory::InMemory::new()),
            budget: Arc::new(MemoryBudget::new(cap)),
        }
    }

    /// The shared byte budget (visible for tests and metrics).
    #[must_use]
    pub fn budget(&self) -> Arc<MemoryBudget> {
        Arc::clone(&self.budget)
    }
}

impl Default for MemoryStaging {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StagingProvider for MemoryStaging {
    fn backend(&self) -> StagingBackend {
        StagingBackend::Memory
    }

    async fn open_batch(&self, stage: &StageRef) -> Result<BatchWriter, StagingError> {
        Ok(BatchWriter::new(
            Arc::clone(&self.store),
            stage.clone(),
            Some(Arc::clone(&self.budget)),
        ))
    }

    async fn open_reader(&self, batch: &BatchRef) -> Result<BatchReader, StagingError> {
        let bytes = self.store.get(&batch.object_path()).await?.bytes().await?;
        BatchReader::from_gzip(&bytes)
    }

    async fn list(&self, stage: &StageRef) -> Result<Vec<BatchRef>, StagingError> {
        list_parts(&self.store, stage).await
    }

    async fn delete(&self, stage: &StageRef) -> Result<(), StagingError> {
        delete_parts(&self.store, stage).await;
        self.budget.release_stage(&stage.uri());
        Ok(())
    }

    async fn delete_batch(&self, batch: &BatchRef) -> Result<(), StagingError> {
        match self.store.delete(&batch.object_path()).await {
            Ok(()) | Err(object_store::Error::NotFound { .. }) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

// ---------------------------------------------------------------------------
// Selection policy
// ---------------------------------------------------------------------------

/// Chooses a staging backend for a run.
///
/// Object store is preferred. Memory is a fallback only when the source
/// estimated a record count at or under the threshold. With neither
/// available the selection fails closed.
pub struct StagingSelector {
    object_store: Option<Arc<dyn StagingProvider>>,
    memory: Option<Arc<dyn StagingProvider>>,
    memory_threshold_records: u64,
}

impl StagingSelector {
    /// Build a selector.
    #[must_use]
    pub fn new(
        object_store: Option<Arc<dyn StagingProvider>>,
        memory: Option<Arc<dyn StagingProvider>>,
        memory_threshold_records: u64,
    ) -> Self {
        Self {
            object_store,
            memory,
            memory_threshold_records,
        }
    }

    /// Select a provider for a run with the given record estimate.
    pub fn select(
        &self,
        estimated_records: Option<u64>,
    ) -> Result<Arc<dyn StagingProvider>, StagingError> {
        if let Some(primary) = &self.object_store {
            return Ok(Arc::clone(primary));
        }
        if let Some(memory) = &self.memory {
            match estimated_records {
                Some(estimate) if estimate <= self.memory_threshold_records => {
                    return Ok(Arc::clone(memory));
                }
                Some(estimate) => {
                    return Err(StagingError::Unavailable(format!(
                        "memory backend refused: estimated {estimate} records exceeds threshold {}",
                        self.memory_threshold_records
                    )));
                }
                None => {
                    return Err(StagingError::Unavailable(
                        "memory backend requires a record estimate".into(),
                    ));
                }
            }
        }
        Err(StagingError::Unavailable("no backend configured".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{NaiveDate, TimeZone, Utc};
    use ucl_core::TenantContext;
    use uuid::Uuid;

    fn stage() -> StageRef {
        let tenant = TenantContext::new("acme", "main").unwrap();
        StageRef::new(
            "mem",
            "staging",
            &tenant,
            "issues",
            NaiveDate::from_ymd_opt(2025, 1, 3).unwrap(),
            Uuid::new_v4(),
        )
    }

    fn envelope(n: u32) -> RecordEnvelope {
        RecordEnvelope::new(
            format!("JIRA-{n}"),
            "acme",
            Utc.with_ymd_and_hms(2025, 1, 2, 10, 0, 0).unwrap(),
        )
        .with_raw(serde_json::json!({"n": n}))
    }

    fn object_store_provider() -> ObjectStoreStaging {
        ObjectStoreStaging::new(Arc::new(object_store::memory::InMemory::new()))
    }

    #[tokio::test]
    async fn write_then_read_round_trips() {
        let provider = object_store_provider();
        let stage = stage();
        let mut writer = provider.open_batch(&stage).await.unwrap();
        for n in 0..5 {
            writer.append(&envelope(n)).await.unwrap();
        }
        let handle = writer.finish().await.unwrap();
        assert_eq!(handle.record_count, 5);
        assert_eq!(handle.envelope_format, ENVELOPE_FORMAT);
        assert_eq!(handle.batch_refs.len(), 1);
        assert!(handle.byte_count > 0);

        let batch = BatchRef::parse(&handle.batch_refs[0]).unwrap();
        let records: Vec<RecordEnvelope> = provider
            .open_reader(&batch)
            .await
            .unwrap()
            .collect::<Result<_, _>>()
            .unwrap();
        assert_eq!(records.len(), 5);
        assert_eq!(records[0].source_id, "JIRA-0");
        assert_eq!(records[4].source_id, "JIRA-4");
    }

    #[tokio::test]
    async fn rotation_produces_multiple_parts() {
        let provider = object_store_provider();
        let stage = stage();
        let mut writer = provider
            .open_batch(&stage)
            .await
            .unwrap()
            .with_rotation(ROTATE_BYTES, 2);
        for n in 0..5 {
            writer.append(&envelope(n)).await.unwrap();
        }
        let handle = writer.finish().await.unwrap();
        assert_eq!(handle.batch_refs.len(), 3);

        let listed = provider.list(&stage).await.unwrap();
        assert_eq!(listed.len(), 3);
        assert_eq!(listed[0].part, 0);
        assert_eq!(listed[2].part, 2);
    }

    #[tokio::test]
    async fn readers_are_restartable() {
        let provider = object_store_provider();
        let stage = stage();
        let mut writer = provider.open_batch(&stage).await.unwrap();
        writer.append(&envelope(1)).await.unwrap();
        let handle = writer.finish().await.unwrap();
        let batch = BatchRef::parse(&handle.batch_refs[0]).unwrap();

        for _ in 0..2 {
            let count = provider.open_reader(&batch).await.unwrap().count();
            assert_eq!(count, 1);
        }
    }

    #[tokio::test]
    async fn empty_writer_produces_no_parts() {
        let provider = object_store_provider();
        let stage = stage();
        let writer = provider.open_batch(&stage).await.unwrap();
        let handle = writer.finish().await.unwrap();
        assert_eq!(handle.record_count, 0);
        assert!(handle.batch_refs.is_empty());
        assert!(provider.list(&stage).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn memory_backend_fails_closed_at_cap() {
        let provider = MemoryStaging::with_cap(64);
        let stage = stage();
        let mut writer = provider
            .open_batch(&stage)
            .await
            .unwrap()
            .with_rotation(ROTATE_BYTES, 1);
        let err = loop {
            if let Err(e) = writer.append(&envelope(0)).await {
                break e;
            }
        };
        assert!(matches!(err, StagingError::CapExceeded { cap: 64 }));
        assert_eq!(err.error_code(), ErrorCode::StagingUnavailable);
    }

    #[tokio::test]
    async fn delete_releases_memory_budget() {
        let provider = MemoryStaging::with_cap(10_000);
        let stage = stage();
        let mut writer = provider.open_batch(&stage).await.unwrap();
        writer.append(&envelope(0)).await.unwrap();
        writer.finish().await.unwrap();
        assert!(provider.budget().used() > 0);

        provider.delete(&stage).await.unwrap();
        assert_eq!(provider.budget().used(), 0);
        assert!(provider.list(&stage).await.unwrap().is_empty());
    }

    #[test]
    fn selector_prefers_object_store() {
        let selector = StagingSelector::new(
            Some(Arc::new(object_store_provider())),
            Some(Arc::new(MemoryStaging::new())),
            100,
        );
        let chosen = selector.select(Some(1_000_000)).unwrap();
        assert_eq!(chosen.backend(), StagingBackend::ObjectStore);
    }

    #[test]
    fn selector_falls_back_to_memory_only_under_threshold() {
        let selector =
            StagingSelector::new(None, Some(Arc::new(MemoryStaging::new())), 100);
        assert_eq!(
            selector.select(Some(50)).unwrap().backend(),
            StagingBackend::Memory
        );
        assert!(selector.select(Some(101)).is_err());
        assert!(selector.select(None).is_err());
    }

    #[test]
    fn selector_fails_closed_with_no_backend() {
        let selector = StagingSelector::new(None, None, 100);
        assert!(matches!(
            selector.select(Some(1)),
            Err(StagingError::Unavailable(_))
        ));
    }
}
