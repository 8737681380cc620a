// SPDX-License-Identifier: MIT OR Apache-2.0
#![deny(unsafe_code)]
//! Deterministic mock endpoints for local development and tests.
//!
//! [`MockSourceEndpoint`] serves a fixed record set with watermarks, plans
//! slices the way real slice-capable sources do, and supports scripted
//! failures (rate limits, expired cursors, outages). [`MockSinkEndpoint`]
//! drains staged batches into memory so tests can assert exactly what got
//! sunk.

use async_trait::async_trait;
use chrono::Utc;
use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use ucl_core::{
    BudgetHints, Capability, CapabilitySet, Dataset, EndpointError, EndpointId, EndpointResult,
    ErrorCode, Field, IngestionPlan, PlanStrategy, ProbeReport, RecordEnvelope, RunMode,
    SemanticType, Slice, StagingHandle, TestConnectionReport, UnitFilter, VectorProfile,
    Watermark, capability_set,
};
use ucl_endpoint::{
    AdaptiveIngestion, Endpoint, PlanRequest, SinkEndpoint, SinkReport, SinkRequest, SliceCapable,
    SliceReader, SourceEndpoint, VectorProfileProvider,
};
use ucl_staging::{BatchRef, StagingError, StagingProvider};

// ---------------------------------------------------------------------------
// Mock source
// ---------------------------------------------------------------------------

/// How the mock source tracks change.
enum ChangeTracking {
    /// Ordered watermarks (timestamps or sequences) on each record.
    Ordered,
    /// Delta tokens: each run drains the pending change set and rotates the
    /// token.
    Delta {
        initial_token: String,
        next_token: String,
    },
}

/// A scripted in-memory source endpoint.
pub struct MockSourceEndpoint {
    id: EndpointId,
    dataset: Dataset,
    records: Vec<(Watermark, RecordEnvelope)>,
    tracking: ChangeTracking,
    probe: Option<ProbeReport>,
    concurrency_hint: usize,
    plan_errors: Mutex<VecDeque<EndpointError>>,
    read_errors: Mutex<VecDeque<EndpointError>>,
    targeted_read_errors: Mutex<Vec<(Option<Watermark>, EndpointError)>>,
    slice_surface: bool,
    capabilities: CapabilitySet,
}

impl MockSourceEndpoint {
    /// A source over ordered-watermark records.
    #[must_use]
    pub fn new(id: EndpointId, dataset_id: &str, dimension: &str) -> Self {
        Self {
            id,
            dataset: Dataset {
                id: dataset_id.to_string(),
                schema: vec![
                    Field {
                        name: "id".into(),
                        semantic_type: SemanticType::Identifier,
                        nullable: false,
                    },
                    Field {
                        name: dimension.to_string(),
                        semantic_type: SemanticType::Timestamp,
                        nullable: false,
                    },
                ],
                cdm_model_id: None,
                capabilities: capability_set(&[
                    Capability::Source,
                    Capability::SliceCapable,
                    Capability::SupportsIncremental,
                ]),
            },
            records: Vec::new(),
            tracking: ChangeTracking::Ordered,
            probe: None,
            concurrency_hint: 2,
            plan_errors: Mutex::new(VecDeque::new()),
            read_errors: Mutex::new(VecDeque::new()),
            targeted_read_errors: Mutex::new(Vec::new()),
            slice_surface: true,
            capabilities: capability_set(&[
                Capability::Source,
                Capability::SliceCapable,
                Capability::SupportsIncremental,
                Capability::Metadata,
                Capability::Preview,
                Capability::TestConnection,
            ]),
        }
    }

    /// A delta-token source: one slice per run, token rotates on read.
    #[must_use]
    pub fn with_delta_tokens(
        mut self,
        initial_token: impl Into<String>,
        next_token: impl Into<String>,
    ) -> Self {
        self.tracking = ChangeTracking::Delta {
            initial_token: initial_token.into(),
            next_token: next_token.into(),
        };
        self.capabilities.insert(Capability::SupportsDelta);
        self
    }

    /// Add a record at the given watermark.
    #[must_use]
    pub fn with_record(mut self, watermark: Watermark, envelope: RecordEnvelope) -> Self {
        self.records.push((watermark, envelope));
        self.records.sort_by(|(a, _), (b, _)| {
            a.try_cmp(b).unwrap_or(std::cmp::Ordering::Equal)
        });
        self
    }

    /// Advertise an adaptive probe result.
    #[must_use]
    pub fn with_probe(mut self, probe: ProbeReport) -> Self {
        self.probe = Some(probe);
        self
    }

    /// Set the parallelism the source tolerates.
    #[must_use]
    pub fn with_concurrency_hint(mut self, hint: usize) -> Self {
        self.concurrency_hint = hint;
        self
    }

    /// Queue an error for the next `plan_slices` call.
    #[must_use]
    pub fn fail_next_plan(self, err: EndpointError) -> Self {
        self.plan_errors.lock().expect("plan errors").push_back(err);
        self
    }

    /// Queue an error for the next `read_slice` call.
    #[must_use]
    pub fn fail_next_read(self, err: EndpointError) -> Self {
        self.read_errors.lock().expect("read errors").push_back(err);
        self
    }

    /// Queue an error for the next read of the slice with this lower bound.
    #[must_use]
    pub fn fail_read_at(self, lower: Option<Watermark>, err: EndpointError) -> Self {
        self.targeted_read_errors
            .lock()
            .expect("targeted read errors")
            .push((lower, err));
        self
    }

    /// Drop the slice-planning surface entirely (degenerate-slice tests).
    #[must_use]
    pub fn without_slice_surface(mut self) -> Self {
        self.slice_surface = false;
        self.capabilities.remove(&Capability::SliceCapable);
        self
    }

    /// Advertise an additional capability.
    #[must_use]
    pub fn with_capability(mut self, cap: Capability) -> Self {
        self.capabilities.insert(cap);
        self
    }

    /// Stop advertising a capability (capability-gate tests).
    #[must_use]
    pub fn without_capability(mut self, cap: Capability) -> Self {
        self.capabilities.remove(&cap);
        self
    }

    fn records_between(
        &self,
        lower: Option<&Watermark>,
        upper: Option<&Watermark>,
    ) -> Vec<(Watermark, RecordEnvelope)> {
        self.records
            .iter()
            .filter(|(w, _)| {
                let above = lower.is_none_or(|lo| {
                    matches!(
                        w.try_cmp(lo),
                        Some(std::cmp::Ordering::Greater | std::cmp::Ordering::Equal) | None
                    )
                });
                let below = upper.is_none_or(|hi| {
                    matches!(w.try_cmp(hi), Some(std::cmp::Ordering::Less))
                });
                above && below
            })
            .cloned()
            .collect()
    }
}

#[async_trait]
impl Endpoint for MockSourceEndpoint {
    fn id(&self) -> &EndpointId {
        &self.id
    }

    fn capabilities(&self) -> CapabilitySet {
        self.capabilities.clone()
    }

    async fn test_connection(&self) -> EndpointResult<TestConnectionReport> {
        let mut details = BTreeMap::new();
        details.insert("records".into(), self.records.len().to_string());
        Ok(TestConnectionReport {
            ok: true,
            detected_version: Some("mock/1".into()),
            capabilities: self.capabilities(),
            details,
        })
    }

    fn as_source(&self) -> Option<&dyn SourceEndpoint> {
        Some(self)
    }
}

#[async_trait]
impl SourceEndpoint for MockSourceEndpoint {
    async fn list_datasets(&self) -> EndpointResult<Vec<Dataset>> {
        Ok(vec![self.dataset.clone()])
    }

    async fn preview(
        &self,
        _dataset_id: &str,
        limit: usize,
    ) -> EndpointResult<Vec<RecordEnvelope>> {
        Ok(self
            .records
            .iter()
            .take(limit)
            .map(|(_, env)| env.clone())
            .collect())
    }

    async fn read(
        &self,
        _dataset_id: &str,
        _filter: &UnitFilter,
    ) -> EndpointResult<Box<dyn SliceReader>> {
        Ok(Box::new(VecReader::new(self.records.clone(), None)))
    }

    fn concurrency_hint(&self) -> usize {
        self.concurrency_hint
    }

    fn as_slice_capable(&self) -> Option<&dyn SliceCapable> {
        if self.slice_surface { Some(self) } else { None }
    }
}

#[async_trait]
impl SliceCapable for MockSourceEndpoint {
    async fn plan_slices(&self, req: &PlanRequest) -> EndpointResult<IngestionPlan> {
        if let Some(err) = self.plan_errors.lock().expect("plan errors").pop_front() {
            return Err(err);
        }

        match &self.tracking {
            ChangeTracking::Delta { initial_token, .. } => {
                let token = req
                    .checkpoint
                    .as_ref()
                    .and_then(ucl_core::Checkpoint::watermark)
                    .and_then(|w| match w {
                        Watermark::Delta { token } => Some(token),
                        _ => None,
                    })
                    .unwrap_or_else(|| initial_token.clone());
                let slice = Slice::new(
                    req.unit_id.clone(),
                    req.dimension.clone(),
                    Some(Watermark::delta(token)),
                    None,
                    &req.budget,
                );
                Ok(IngestionPlan {
                    slices: vec![slice],
                    strategy: PlanStrategy::Incremental,
                    horizon: None,
                    warnings: Vec::new(),
                })
            }
            ChangeTracking::Ordered => {
                let checkpoint_watermark = match req.run_mode {
                    RunMode::Full => None,
                    RunMode::Incremental => req
                        .checkpoint
                        .as_ref()
                        .and_then(ucl_core::Checkpoint::watermark),
                };

                // A full scan over a sequence domain partitions by key
                // range; everything else windows the distinct watermarks.
                let sequence_domain: Vec<i64> = self
                    .records
                    .iter()
                    .filter_map(|(w, _)| match w {
                        Watermark::Sequence { value } => Some(*value),
                        _ => None,
                    })
                    .collect();
                let windows = if req.run_mode == RunMode::Full
                    && !sequence_domain.is_empty()
                    && sequence_domain.len() == self.records.len()
                {
                    let min = sequence_domain.iter().copied().min().unwrap_or(0);
                    let max = sequence_domain.iter().copied().max().unwrap_or(0);
                    ucl_planner::sequence_ranges(min, max, req.budget.page_hint)
                } else {
                    let mut boundaries: Vec<Watermark> = Vec::new();
                    for (w, _) in &self.records {
                        if let Some(cp) = &checkpoint_watermark {
                            if !matches!(w.try_cmp(cp), Some(std::cmp::Ordering::Greater)) {
                                continue;
                            }
                        }
                        if boundaries.last() != Some(w) {
                            boundaries.push(w.clone());
                        }
                    }
                    ucl_planner::half_open_windows(&boundaries)
                };

                let slices = windows
                    .into_iter()
                    .map(|(lower, upper)| {
                        Slice::new(
                            req.unit_id.clone(),
                            req.dimension.clone(),
                            Some(lower),
                            upper,
                            &req.budget,
                        )
                    })
                    .collect();
                let horizon = match self.records.first() {
                    Some((Watermark::Timestamp { .. }, _)) | None => {
                        Some(Watermark::timestamp(Utc::now()))
                    }
                    Some(_) => None,
                };
                Ok(IngestionPlan {
                    slices,
                    strategy: match req.run_mode {
                        RunMode::Full => PlanStrategy::Full,
                        RunMode::Incremental => PlanStrategy::Incremental,
                    },
                    horizon,
                    warnings: Vec::new(),
                })
            }
        }
    }

    async fn read_slice(&self, slice: &Slice) -> EndpointResult<Box<dyn SliceReader>> {
        {
            let mut targeted = self.targeted_read_errors.lock().expect("targeted read errors");
            if let Some(pos) = targeted.iter().position(|(lower, _)| *lower == slice.lower) {
                return Err(targeted.remove(pos).1);
            }
        }
        if let Some(err) = self.read_errors.lock().expect("read errors").pop_front() {
            return Err(err);
        }
        match &self.tracking {
            ChangeTracking::Delta { next_token, .. } => Ok(Box::new(VecReader::new(
                self.records.clone(),
                Some(Watermark::delta(next_token.clone())),
            ))),
            ChangeTracking::Ordered => Ok(Box::new(VecReader::new(
                self.records_between(slice.lower.as_ref(), slice.upper.as_ref()),
                None,
            ))),
        }
    }

    fn as_adaptive(&self) -> Option<&dyn AdaptiveIngestion> {
        if self.probe.is_some() { Some(self) } else { None }
    }
}

#[async_trait]
impl AdaptiveIngestion for MockSourceEndpoint {
    async fn probe(&self, _req: &PlanRequest) -> EndpointResult<ProbeReport> {
        self.probe.clone().ok_or_else(|| {
            EndpointError::new(ErrorCode::EndpointUnreachable, "probe not scripted")
        })
    }
}

/// Reader over a fixed record list; tracks the max observed watermark or
/// hands back a pre-set cursor (delta tokens).
struct VecReader {
    records: std::vec::IntoIter<(Watermark, RecordEnvelope)>,
    observed: Option<Watermark>,
    fixed: Option<Watermark>,
}

impl VecReader {
    fn new(records: Vec<(Watermark, RecordEnvelope)>, fixed: Option<Watermark>) -> Self {
        Self {
            records: records.into_iter(),
            observed: None,
            fixed,
        }
    }
}

#[async_trait]
impl SliceReader for VecReader {
    async fn next(&mut self) -> Option<EndpointResult<RecordEnvelope>> {
        let (watermark, envelope) = self.records.next()?;
        self.observed = Some(match self.observed.take() {
            Some(prev) => prev.merge_max(watermark),
            None => watermark,
        });
        Some(Ok(envelope))
    }

    fn watermark(&self) -> Option<Watermark> {
        self.fixed.clone().or_else(|| self.observed.clone())
    }
}

// ---------------------------------------------------------------------------
// Mock sink
// ---------------------------------------------------------------------------

/// A sink that drains staged batches into memory.
pub struct MockSinkEndpoint {
    id: EndpointId,
    staging: Arc<dyn StagingProvider>,
    written: Mutex<Vec<RecordEnvelope>>,
    write_errors: Mutex<VecDeque<EndpointError>>,
    writes: AtomicU64,
    saturate_after: Option<u64>,
    profiles: Vec<VectorProfile>,
}

impl MockSinkEndpoint {
    /// A sink reading staged batches through `staging`.
    #[must_use]
    pub fn new(id: EndpointId, staging: Arc<dyn StagingProvider>) -> Self {
        Self {
            id,
            staging,
            written: Mutex::new(Vec::new()),
            write_errors: Mutex::new(VecDeque::new()),
            writes: AtomicU64::new(0),
            saturate_after: None,
            profiles: Vec::new(),
        }
    }

    /// Queue an error for the next write.
    #[must_use]
    pub fn fail_next_write(self, err: EndpointError) -> Self {
        self.write_errors.lock().expect("write errors").push_back(err);
        self
    }

    /// Report saturation after this many successful writes.
    #[must_use]
    pub fn saturate_after(mut self, writes: u64) -> Self {
        self.saturate_after = Some(writes);
        self
    }

    /// Declare vector profiles for the registry to surface.
    #[must_use]
    pub fn with_vector_profile(mut self, profile: VectorProfile) -> Self {
        self.profiles.push(profile);
        self
    }

    /// Everything sunk so far, in write order.
    #[must_use]
    pub fn written(&self) -> Vec<RecordEnvelope> {
        self.written.lock().expect("written").clone()
    }
}

#[async_trait]
impl Endpoint for MockSinkEndpoint {
    fn id(&self) -> &EndpointId {
        &self.id
    }

    fn capabilities(&self) -> CapabilitySet {
        capability_set(&[Capability::Sink, Capability::TestConnection])
    }

    async fn test_connection(&self) -> EndpointResult<TestConnectionReport> {
        Ok(TestConnectionReport {
            ok: true,
            detected_version: Some("mock/1".into()),
            capabilities: self.capabilities(),
            details: BTreeMap::new(),
        })
    }

    fn as_sink(&self) -> Option<&dyn SinkEndpoint> {
        Some(self)
    }

    fn as_vector_profiles(&self) -> Option<&dyn VectorProfileProvider> {
        if self.profiles.is_empty() { None } else { Some(self) }
    }
}

impl VectorProfileProvider for MockSinkEndpoint {
    fn vector_profiles(&self) -> Vec<VectorProfile> {
        self.profiles.clone()
    }
}

#[async_trait]
impl SinkEndpoint for MockSinkEndpoint {
    async fn write(&self, handle: &StagingHandle, req: &SinkRequest) -> EndpointResult<SinkReport> {
        if let Some(err) = self.write_errors.lock().expect("write errors").pop_front() {
            return Err(err);
        }

        let mut drained = Vec::new();
        for uri in &handle.batch_refs {
            let batch = BatchRef::parse(uri).map_err(EndpointError::from)?;
            let reader = self
                .staging
                .open_reader(&batch)
                .await
                .map_err(EndpointError::from)?;
            for envelope in reader {
                let envelope = envelope.map_err(EndpointError::from)?;
                if envelope.tenant_id != req.tenant.tenant_id {
                    return Err(EndpointError::validation(format!(
                        "staged envelope belongs to tenant {:?}, run is for {:?}",
                        envelope.tenant_id, req.tenant.tenant_id
                    )));
                }
                drained.push(envelope);
            }
        }

        let written = drained.len() as u64;
        self.written.lock().expect("written").extend(drained);
        let writes = self.writes.fetch_add(1, Ordering::SeqCst) + 1;
        let saturated = self.saturate_after.is_some_and(|after| writes > after);
        Ok(SinkReport {
            written,
            failed: 0,
            materialized_uri: Some(format!(
                "relational://warehouse/{}/{}",
                req.tenant.tenant_id, req.dataset_id
            )),
            saturated,
        })
    }
}

// ---------------------------------------------------------------------------
// Failing staging provider
// ---------------------------------------------------------------------------

/// A staging provider whose every operation fails, for fail-closed tests.
pub struct FailingStaging;

#[async_trait]
impl StagingProvider for FailingStaging {
    fn backend(&self) -> ucl_staging::StagingBackend {
        ucl_staging::StagingBackend::ObjectStore
    }

    async fn open_batch(
        &self,
        _stage: &ucl_staging::StageRef,
    ) -> Result<ucl_staging::BatchWriter, StagingError> {
        Err(StagingError::Unavailable("injected outage".into()))
    }

    async fn open_reader(&self, _batch: &BatchRef) -> Result<ucl_staging::BatchReader, StagingError> {
        Err(StagingError::Unavailable("injected outage".into()))
    }

    async fn list(&self, _stage: &ucl_staging::StageRef) -> Result<Vec<BatchRef>, StagingError> {
        Err(StagingError::Unavailable("injected outage".into()))
    }

    async fn delete(&self, _stage: &ucl_staging::StageRef) -> Result<(), StagingError> {
        Ok(())
    }

    async fn delete_batch(&self, _batch: &BatchRef) -> Result<(), StagingError> {
        Ok(())
    }
}
