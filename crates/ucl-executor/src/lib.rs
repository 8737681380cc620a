// SPDX-License-Identifier: MIT OR Apache-2.0
#![deny(unsafe_code)]
#![warn(missing_docs)]
//! The slice executor.
//!
//! A run moves one ingestion unit through Source → Staging → Sink:
//!
//! ```text
//! IDLE ──start──> RUNNING ──all-slices-ok──> SUCCEEDED
//!                    │
//!                    ├──slice-fail(retryable)──> retry w/ backoff
//!                    ├──slice-fail(fatal)──────> FAILED (checkpoint prefix only)
//!                    └──pause-signal───────────> PAUSED ──resume──> RUNNING
//! ```
//!
//! Slices execute in parallel up to `N = min(source hint, global max)`, but
//! checkpoint advancement is serialized in plan order: only the
//! lowest-watermark outcome still pending may advance, so the checkpoint
//! always reflects a contiguous successful prefix. Workers are
//! shared-nothing (each owns its staging writer) and the checkpoint CAS
//! is the single coordination point.

/// Materialized-artifact registry.
pub mod artifact;
/// Run-level cancellation token.
pub mod cancel;
/// Per-unit run lease.
pub mod lease;
/// Slice retry policy.
pub mod retry;
/// Sink back-pressure throttle.
pub mod throttle;

mod slice;

pub use artifact::{ArtifactRegistry, FsArtifactRegistry, MemoryArtifactRegistry};
pub use cancel::CancellationToken;
pub use lease::Lease;
pub use retry::{BackoffPolicy, default_policy};
pub use throttle::Throttle;

use crate::slice::{PART_BLOCK, SliceContext, SliceOutcome, execute_slice};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{info, warn};
use ucl_checkpoint::{
    CheckpointStore, Decision, PutRequest, StoreError, with_cas_retry,
};
use ucl_core::{
    BudgetHints, Capability, CheckpointKey, EndpointError, EndpointId, EndpointResult, ErrorCode,
    IngestionUnit, MaterializedArtifact, ProgressEvent, RunCounters, RunMode, RunState,
    SlicePhase, TenantContext, UnitFilter, Watermark,
};
use ucl_endpoint::{Endpoint, EndpointRegistry, ensure_capabilities};
use ucl_staging::{StageRef, StagingSelector};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Options, request, result
// ---------------------------------------------------------------------------

/// Executor tuning knobs.
#[derive(Debug, Clone)]
pub struct ExecutorOptions {
    /// Upper bound on slice parallelism across any single run.
    pub global_max_concurrency: usize,
    /// Fail the run on the first fatal slice instead of draining the plan.
    pub fail_fast: bool,
    /// Soft per-slice timeout: close gracefully and reschedule.
    pub soft_slice_timeout: Duration,
    /// Hard per-slice timeout: fail the slice with `E_TIMEOUT`.
    pub hard_slice_timeout: Duration,
    /// Retry policy for transient slice failures.
    pub retry: retry::BackoffPolicy,
    /// Scheme for staging URIs (`s3`, `file`, `mem`).
    pub staging_scheme: String,
    /// Bucket for staging URIs.
    pub staging_bucket: String,
}

impl Default for ExecutorOptions {
    fn default() -> Self {
        Self {
            global_max_concurrency: 8,
            fail_fast: false,
            soft_slice_timeout: Duration::from_secs(30 * 60),
            hard_slice_timeout: Duration::from_secs(60 * 60),
            retry: default_policy(),
            staging_scheme: "mem".into(),
            staging_bucket: "ucl-staging".into(),
        }
    }
}

impl ExecutorOptions {
    /// Lease TTL: twice the hard slice timeout, in seconds.
    #[must_use]
    pub fn lease_ttl_seconds(&self) -> u64 {
        (self.hard_slice_timeout.as_secs() * 2).max(1)
    }
}

/// One ingestion run, as the workflow engine submits it.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunRequest {
    /// The caller's authenticated tenant scope.
    pub tenant: TenantContext,
    /// The unit to ingest (carries the source endpoint id).
    pub unit: IngestionUnit,
    /// Where the records land.
    pub sink_endpoint_id: EndpointId,
    /// Traversal mode for this run (overrides the unit default).
    pub data_mode: RunMode,
    /// Filter override; empty means "use the unit's filter".
    #[serde(default)]
    pub filter: UnitFilter,
    /// Planner budget hints.
    #[serde(default)]
    pub budget: BudgetHints,
    /// Caller-supplied request id, recorded on checkpoint writes.
    pub request_id: String,
}

/// First fatal error of a failed run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunError {
    /// Wire error code.
    pub code: ErrorCode,
    /// Human-readable message.
    pub message: String,
}

/// Terminal result of a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunResult {
    /// The run's identity.
    pub run_id: Uuid,
    /// Terminal state (`SUCCEEDED`, `FAILED`, `PAUSED`).
    pub state: RunState,
    /// Aggregate counters across all slices, including failed ones.
    pub counters: RunCounters,
    /// Non-fatal conditions observed during the run.
    pub warnings: Vec<String>,
    /// The first fatal error, when the run failed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub first_error: Option<RunError>,
    /// Artifacts registered on success.
    #[serde(default)]
    pub artifacts: Vec<MaterializedArtifact>,
}

// ---------------------------------------------------------------------------
// Error mapping
// ---------------------------------------------------------------------------

/// Map a checkpoint store failure onto the wire taxonomy.
#[must_use]
pub fn store_error_to_endpoint(err: StoreError) -> EndpointError {
    let message = err.to_string();
    match &err {
        StoreError::Backend(_) => {
            EndpointError::new(ErrorCode::EndpointUnreachable, message).with_source(err)
        }
        StoreError::InvalidKey(_) => EndpointError::validation(message).with_source(err),
        _ => EndpointError::new(ErrorCode::Conflict, message).with_source(err),
    }
}

// ---------------------------------------------------------------------------
// Checkpoint advancement
// ---------------------------------------------------------------------------

/// CAS-advance a unit's watermark checkpoint to `target`.
///
/// Returns `Ok(Some(version))` when this call advanced the checkpoint and
/// `Ok(None)` when another writer already advanced to (or past) the target,
/// the no-op success of two executors computing the same watermark. A
/// conflicting writer that stored a *lower* watermark is a lease violation
/// and surfaces as `E_CONFLICT`.
pub async fn advance_watermark(
    store: &dyn CheckpointStore,
    tenant: &TenantContext,
    key: &CheckpointKey,
    dimension: &str,
    target: &Watermark,
    writer: &str,
    request_id: &str,
) -> EndpointResult<Option<u64>> {
    use std::cmp::Ordering;

    let value = target.to_checkpoint_value(dimension);
    let mut tried = false;
    let policy = ucl_checkpoint::BackoffPolicy::default();
    let outcome = with_cas_retry(store, tenant, key, &policy, |current| {
        if let Some(cp) = current {
            if let Some(stored) = cp.watermark() {
                if matches!(
                    stored.try_cmp(target),
                    Some(Ordering::Greater | Ordering::Equal)
                ) {
                    return Decision::Settled;
                }
            }
            if tried {
                return Decision::Abandon(format!(
                    "checkpoint {key} was advanced concurrently below the target watermark"
                ));
            }
            tried = true;
            Decision::Write(
                PutRequest::new(value.clone(), cp.version)
                    .writer(writer, request_id)
                    .semantics("watermark"),
            )
        } else {
            if tried {
                return Decision::Abandon(format!(
                    "checkpoint {key} changed concurrently during first create"
                ));
            }
            tried = true;
            Decision::Write(
                PutRequest::new(value.clone(), 0)
                    .writer(writer, request_id)
                    .semantics("watermark"),
            )
        }
    })
    .await;

    match outcome {
        Ok(version) => Ok(version),
        Err(StoreError::Abandoned { reason }) => {
            Err(EndpointError::new(ErrorCode::Conflict, reason))
        }
        Err(other) => Err(store_error_to_endpoint(other)),
    }
}

// ---------------------------------------------------------------------------
// Executor
// ---------------------------------------------------------------------------

/// Drives ingestion runs: planning, slice workers, checkpoint advancement,
/// progress, and artifact registration.
pub struct IngestionExecutor {
    registry: EndpointRegistry,
    checkpoints: Arc<dyn CheckpointStore>,
    staging: StagingSelector,
    artifacts: Arc<dyn ArtifactRegistry>,
    options: ExecutorOptions,
}

impl IngestionExecutor {
    /// Assemble an executor over its collaborators.
    #[must_use]
    pub fn new(
        registry: EndpointRegistry,
        checkpoints: Arc<dyn CheckpointStore>,
        staging: StagingSelector,
        artifacts: Arc<dyn ArtifactRegistry>,
        options: ExecutorOptions,
    ) -> Self {
        Self {
            registry,
            checkpoints,
            staging,
            artifacts,
            options,
        }
    }

    /// Execute one run.
    ///
    /// Progress events stream into `progress` while the run is live; the
    /// terminal [`RunResult`] is returned. Pre-flight failures (unknown
    /// endpoint, capability gate, lease held, no staging backend) surface
    /// as `Err` with the checkpoint untouched.
    pub async fn run(
        &self,
        req: RunRequest,
        progress: mpsc::Sender<ProgressEvent>,
        cancel: CancellationToken,
    ) -> EndpointResult<RunResult> {
        let run_id = Uuid::new_v4();
        info!(
            target: "ucl.executor",
            run = %run_id,
            unit = %req.unit.unit_id,
            endpoint = %req.unit.endpoint_id,
            sink = %req.sink_endpoint_id,
            mode = ?req.data_mode,
            "run starting"
        );

        let source_ep = self.registry.resolve(&req.unit.endpoint_id)?;
        let sink_ep = self.registry.resolve(&req.sink_endpoint_id)?;

        let mut required = vec![Capability::Source];
        if req.data_mode == RunMode::Incremental {
            required.push(Capability::SupportsIncremental);
        }
        ensure_capabilities(&*source_ep, &required)?;
        ensure_capabilities(&*sink_ep, &[Capability::Sink])?;

        let parallelism = {
            let Some(source) = source_ep.as_source() else {
                return Err(EndpointError::capability_missing(format!(
                    "endpoint {} advertises source but exposes no source surface",
                    req.unit.endpoint_id
                )));
            };
            source
                .concurrency_hint()
                .min(self.options.global_max_concurrency)
                .max(1)
        };

        let lease = Lease::acquire(
            &*self.checkpoints,
            &req.tenant,
            req.unit.endpoint_id.family(),
            &req.unit.unit_id,
            run_id,
            self.options.lease_ttl_seconds(),
        )
        .await?;

        let result = self
            .run_leased(&req, run_id, source_ep, sink_ep, parallelism, progress, cancel)
            .await;
        lease.release(&*self.checkpoints, &req.tenant).await;

        match &result {
            Ok(run) => info!(
                target: "ucl.executor",
                run = %run_id,
                state = ?run.state,
                records_read = run.counters.records_read,
                records_written = run.counters.records_written,
                "run finished"
            ),
            Err(err) => warn!(
                target: "ucl.executor",
                run = %run_id,
                error = %err,
                details = ?ucl_telemetry::redact_map(&err.details),
                "run aborted"
            ),
        }
        result
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_leased(
        &self,
        req: &RunRequest,
        run_id: Uuid,
        source_ep: Arc<dyn Endpoint>,
        sink_ep: Arc<dyn Endpoint>,
        parallelism: usize,
        progress: mpsc::Sender<ProgressEvent>,
        cancel: CancellationToken,
    ) -> EndpointResult<RunResult> {
        let mut unit = req.unit.clone();
        unit.run_mode = req.data_mode;
        if !req.filter.is_empty() {
            unit.filter = req.filter.clone();
        }

        let key = CheckpointKey::for_unit(
            &req.tenant,
            unit.endpoint_id.family(),
            &unit.unit_id,
            &unit.dimension,
        )?;
        let checkpoint = self
            .checkpoints
            .get(&req.tenant, &key)
            .await
            .map_err(store_error_to_endpoint)?;

        let plan_outcome = {
            let Some(source) = source_ep.as_source() else {
                return Err(EndpointError::capability_missing("source surface missing"));
            };
            ucl_planner::plan(source, &unit, checkpoint.as_ref(), &req.budget).await?
        };
        let plan = plan_outcome.plan;
        let plan_warnings = plan.warnings.clone();
        let estimate = plan_outcome
            .probe
            .as_ref()
            .map(|p| p.estimated_record_count);
        let staging = self.staging.select(estimate).map_err(EndpointError::from)?;

        let stage = StageRef::new(
            &self.options.staging_scheme,
            &self.options.staging_bucket,
            &req.tenant,
            &unit.dataset_id,
            Utc::now().date_naive(),
            run_id,
        );

        let ctx = Arc::new(SliceContext {
            run_id,
            tenant: req.tenant.clone(),
            dataset_id: unit.dataset_id.clone(),
            filter: unit.filter.clone(),
            data_mode: req.data_mode,
            staging: Arc::clone(&staging),
            stage: stage.clone(),
            progress,
            cancel: cancel.clone(),
            retry: self.options.retry.clone(),
            soft_timeout: self.options.soft_slice_timeout,
            hard_timeout: self.options.hard_slice_timeout,
            throttle: Arc::new(Throttle::new(parallelism)),
            warnings: Mutex::new(Vec::new()),
        });

        let total = plan.slices.len();
        let (outcome_tx, mut outcome_rx) = mpsc::channel::<(usize, SliceOutcome)>(total.max(1));
        for (index, slice) in plan.slices.into_iter().enumerate() {
            let ctx = Arc::clone(&ctx);
            let source_ep = Arc::clone(&source_ep);
            let sink_ep = Arc::clone(&sink_ep);
            let tx = outcome_tx.clone();
            tokio::spawn(async move {
                let _permit = ctx.throttle.acquire().await;
                let part_base = (index as u32) * PART_BLOCK;
                let outcome = execute_slice(ctx, source_ep, sink_ep, slice, part_base).await;
                let _ = tx.send((index, outcome)).await;
            });
        }
        drop(outcome_tx);

        // Advancement is serialized in plan order: outcomes are buffered
        // until every lower-watermark slice has settled.
        let mut pending: BTreeMap<usize, SliceOutcome> = BTreeMap::new();
        let mut next = 0usize;
        let mut counters = RunCounters::default();
        let mut first_error: Option<RunError> = None;
        let mut chain_intact = true;
        let mut any_skipped = false;
        let mut materialized_uri: Option<String> = None;

        while let Some((index, outcome)) = outcome_rx.recv().await {
            pending.insert(index, outcome);
            while let Some(outcome) = pending.remove(&next) {
                next += 1;
                match outcome {
                    SliceOutcome::Success {
                        slice_id,
                        advance_to,
                        counters: slice_counters,
                        materialized_uri: uri,
                    } => {
                        counters.absorb(slice_counters);
                        if uri.is_some() {
                            materialized_uri = uri;
                        }
                        if chain_intact {
                            if let Some(target) = &advance_to {
                                match advance_watermark(
                                    &*self.checkpoints,
                                    &req.tenant,
                                    &key,
                                    &unit.dimension,
                                    target,
                                    &run_id.to_string(),
                                    &req.request_id,
                                )
                                .await
                                {
                                    Ok(_) => {
                                        ctx.emit(&slice_id, SlicePhase::Done, slice_counters, None)
                                            .await;
                                    }
                                    Err(error) => {
                                        ctx.emit(
                                            &slice_id,
                                            SlicePhase::Failed,
                                            slice_counters,
                                            Some(&error),
                                        )
                                        .await;
                                        if first_error.is_none() {
                                            first_error = Some(RunError {
                                                code: error.code,
                                                message: error.message.clone(),
                                            });
                                        }
                                        chain_intact = false;
                                        if self.options.fail_fast {
                                            cancel.cancel();
                                        }
                                    }
                                }
                            } else {
                                ctx.emit(&slice_id, SlicePhase::Done, slice_counters, None).await;
                            }
                        } else {
                            // Sunk, but a lower slice failed: the checkpoint
                            // stays at the contiguous prefix.
                            ctx.emit(&slice_id, SlicePhase::Done, slice_counters, None).await;
                        }
                    }
                    SliceOutcome::Failed {
                        slice_id: _,
                        error,
                        counters: slice_counters,
                    } => {
                        counters.absorb(slice_counters);
                        if first_error.is_none() {
                            first_error = Some(RunError {
                                code: error.code,
                                message: error.message.clone(),
                            });
                        }
                        chain_intact = false;
                        if self.options.fail_fast {
                            cancel.cancel();
                        }
                    }
                    SliceOutcome::Skipped { slice_id: _ } => {
                        any_skipped = true;
                        chain_intact = false;
                    }
                }
            }
        }

        let state = if first_error.is_some() {
            RunState::Failed
        } else if any_skipped || cancel.is_cancelled() {
            RunState::Paused
        } else {
            RunState::Succeeded
        };

        let mut warnings = plan_warnings;
        warnings.extend(ctx.warnings.lock().expect("warnings").drain(..));

        let mut artifacts = Vec::new();
        match state {
            RunState::Succeeded => {
                let mut canonical_meta = BTreeMap::new();
                canonical_meta.insert("unitId".to_string(), unit.unit_id.clone());
                canonical_meta.insert("datasetId".to_string(), unit.dataset_id.clone());
                let artifact = MaterializedArtifact {
                    tenant_id: req.tenant.tenant_id.clone(),
                    source_run_id: run_id,
                    artifact_kind: "sink".to_string(),
                    handle: materialized_uri
                        .unwrap_or_else(|| req.sink_endpoint_id.to_string()),
                    canonical_meta,
                    counters,
                };
                self.artifacts.record(artifact.clone()).await?;
                artifacts.push(artifact);
            }
            RunState::Failed => {
                // Best-effort cleanup: no partial staging files remain.
                if let Err(e) = staging.delete(&stage).await {
                    warn!(target: "ucl.executor", stage = %stage, error = %e, "staging cleanup failed");
                }
            }
            _ => {}
        }

        Ok(RunResult {
            run_id,
            state,
            counters,
            warnings,
            first_error,
            artifacts,
        })
    }
}
