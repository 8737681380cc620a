// SPDX-License-Identifier: MIT OR Apache-2.0
//! Per-slice execution: source → staging → sink.
//!
//! A slice attempt streams the source records into a staging batch in
//! source order, seals it, and hands the staging handle to the sink.
//! Transient failures retry the whole slice with backoff (sources are
//! restartable from the slice cursor); fatal failures surface immediately.
//! The cancel token is observed between records: a cancelled slice closes
//! its staging batch gracefully and never sinks.

use crate::cancel::CancellationToken;
use crate::retry::{self, BackoffPolicy};
use crate::throttle::Throttle;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, warn};
use ucl_core::{
    EndpointError, ErrorCode, ProgressEvent, RecordEnvelope, RunCounters, RunMode, Slice,
    SlicePhase, TenantContext, UnitFilter, Watermark,
};
use ucl_endpoint::{Endpoint, SinkRequest, SliceReader};
use ucl_staging::{BatchRef, StageRef, StagingProvider};
use uuid::Uuid;

/// Part-number block reserved for each slice under the shared run prefix.
pub(crate) const PART_BLOCK: u32 = 10_000;

/// Everything a slice worker needs, shared across the run.
pub(crate) struct SliceContext {
    pub run_id: Uuid,
    pub tenant: TenantContext,
    pub dataset_id: String,
    pub filter: UnitFilter,
    pub data_mode: RunMode,
    pub staging: Arc<dyn StagingProvider>,
    pub stage: StageRef,
    pub progress: mpsc::Sender<ProgressEvent>,
    pub cancel: CancellationToken,
    pub retry: BackoffPolicy,
    pub soft_timeout: Duration,
    pub hard_timeout: Duration,
    pub throttle: Arc<Throttle>,
    pub warnings: Mutex<Vec<String>>,
}

impl SliceContext {
    pub(crate) async fn emit(
        &self,
        slice_id: &str,
        phase: SlicePhase,
        counters: RunCounters,
        error: Option<&EndpointError>,
    ) {
        let event = ProgressEvent {
            run_id: self.run_id,
            slice_id: slice_id.to_string(),
            phase,
            counters,
            error_code: error.map(|e| e.code.code().to_string()),
            retry_after_ms: error
                .and_then(|e| e.retry_after)
                .map(|d| d.as_millis() as u64),
        };
        // Progress is advisory; a departed caller is not an error.
        let _ = self.progress.send(event).await;
    }

    pub(crate) fn push_warning(&self, warning: String) {
        self.warnings.lock().expect("warnings").push(warning);
    }
}

/// Terminal outcome of one slice.
pub(crate) enum SliceOutcome {
    Success {
        slice_id: String,
        advance_to: Option<Watermark>,
        counters: RunCounters,
        materialized_uri: Option<String>,
    },
    Failed {
        slice_id: String,
        error: EndpointError,
        counters: RunCounters,
    },
    Skipped {
        slice_id: String,
    },
}

enum Attempt {
    Done {
        advance_to: Option<Watermark>,
        counters: RunCounters,
        materialized_uri: Option<String>,
    },
    Cancelled,
    Err {
        error: EndpointError,
        staged: Vec<BatchRef>,
        counters: RunCounters,
    },
}

/// Run one slice to a terminal outcome, retrying transient failures.
pub(crate) async fn execute_slice(
    ctx: Arc<SliceContext>,
    source_ep: Arc<dyn Endpoint>,
    sink_ep: Arc<dyn Endpoint>,
    slice: Slice,
    part_base: u32,
) -> SliceOutcome {
    let mut attempt: u32 = 0;
    loop {
        if ctx.cancel.is_cancelled() {
            return SliceOutcome::Skipped {
                slice_id: slice.slice_id.clone(),
            };
        }

        let outcome = match tokio::time::timeout(
            ctx.hard_timeout,
            attempt_once(&ctx, &*source_ep, &*sink_ep, &slice, part_base),
        )
        .await
        {
            Ok(outcome) => outcome,
            Err(_) => {
                let error = EndpointError::new(
                    ErrorCode::Timeout,
                    format!("slice exceeded the hard timeout of {:?}", ctx.hard_timeout),
                );
                ctx.emit(&slice.slice_id, SlicePhase::Failed, RunCounters::default(), Some(&error))
                    .await;
                return SliceOutcome::Failed {
                    slice_id: slice.slice_id.clone(),
                    error,
                    counters: RunCounters::default(),
                };
            }
        };

        match outcome {
            Attempt::Done {
                advance_to,
                counters,
                materialized_uri,
            } => {
                return SliceOutcome::Success {
                    slice_id: slice.slice_id.clone(),
                    advance_to,
                    counters,
                    materialized_uri,
                };
            }
            Attempt::Cancelled => {
                return SliceOutcome::Skipped {
                    slice_id: slice.slice_id.clone(),
                };
            }
            Attempt::Err {
                error,
                staged,
                counters,
            } => {
                cleanup_batches(&ctx, &staged).await;
                match retry::retry_delay(&ctx.retry, attempt, &error) {
                    Some(delay) => {
                        warn!(
                            target: "ucl.executor.slice",
                            slice = %slice.slice_id,
                            attempt,
                            error = %error,
                            details = ?ucl_telemetry::redact_map(&error.details),
                            delay_ms = delay.as_millis() as u64,
                            "retryable slice failure, backing off"
                        );
                        tokio::time::sleep(delay).await;
                        attempt += 1;
                    }
                    None => {
                        // Endpoint diagnostics only reach the log through
                        // the redaction boundary.
                        warn!(
                            target: "ucl.executor.slice",
                            slice = %slice.slice_id,
                            error = %error,
                            details = ?ucl_telemetry::redact_map(&error.details),
                            "slice failed terminally"
                        );
                        ctx.emit(&slice.slice_id, SlicePhase::Failed, counters, Some(&error))
                            .await;
                        return SliceOutcome::Failed {
                            slice_id: slice.slice_id.clone(),
                            error,
                            counters,
                        };
                    }
                }
            }
        }
    }
}

async fn attempt_once(
    ctx: &SliceContext,
    source_ep: &dyn Endpoint,
    sink_ep: &dyn Endpoint,
    slice: &Slice,
    part_base: u32,
) -> Attempt {
    let mut counters = RunCounters::default();
    ctx.emit(&slice.slice_id, SlicePhase::Staging, counters, None).await;

    let Some(source) = source_ep.as_source() else {
        return Attempt::Err {
            error: EndpointError::capability_missing("source surface disappeared mid-run"),
            staged: Vec::new(),
            counters,
        };
    };

    let mut writer = match ctx.staging.open_batch(&ctx.stage).await {
        Ok(writer) => writer.with_part_base(part_base),
        Err(e) => {
            return Attempt::Err {
                error: e.into(),
                staged: Vec::new(),
                counters,
            };
        }
    };

    let reader = match source.as_slice_capable() {
        Some(slice_capable) => slice_capable.read_slice(slice).await,
        None => source.read(&ctx.dataset_id, &ctx.filter).await,
    };
    let mut reader = match reader {
        Ok(reader) => reader,
        Err(e) => {
            return Attempt::Err {
                error: e,
                staged: writer.sealed().to_vec(),
                counters,
            };
        }
    };

    // Stage in source order, watching the cancel signal between records.
    let staged_phase = tokio::time::timeout(ctx.soft_timeout, async {
        while let Some(item) = reader.next().await {
            if ctx.cancel.is_cancelled() {
                return Ok(false);
            }
            let envelope: RecordEnvelope = item?;
            writer
                .append(&envelope)
                .await
                .map_err(EndpointError::from)?;
            counters.records_read += 1;
        }
        Ok::<bool, EndpointError>(true)
    })
    .await;

    match staged_phase {
        Err(_) => {
            // Soft timeout: close out and reschedule via the retry loop.
            let staged = writer.sealed().to_vec();
            return Attempt::Err {
                error: EndpointError::new(
                    ErrorCode::Timeout,
                    format!("slice exceeded the soft timeout of {:?}", ctx.soft_timeout),
                ),
                staged,
                counters,
            };
        }
        Ok(Err(error)) => {
            let staged = writer.sealed().to_vec();
            return Attempt::Err {
                error,
                staged,
                counters,
            };
        }
        Ok(Ok(false)) => {
            // Cancelled: seal what we have, skip the sink.
            if let Ok(handle) = writer.finish().await {
                let staged: Vec<BatchRef> = handle
                    .batch_refs
                    .iter()
                    .filter_map(|uri| BatchRef::parse(uri).ok())
                    .collect();
                cleanup_batches(ctx, &staged).await;
            }
            debug!(target: "ucl.executor.slice", slice = %slice.slice_id, "slice cancelled during staging");
            return Attempt::Cancelled;
        }
        Ok(Ok(true)) => {}
    }

    let advance_to = reader.watermark().or_else(|| match &slice.upper {
        Some(upper) if upper.is_ordered() => Some(upper.clone()),
        _ => None,
    });

    let handle = match writer.finish().await {
        Ok(handle) => handle,
        Err(e) => {
            return Attempt::Err {
                error: e.into(),
                staged: Vec::new(),
                counters,
            };
        }
    };
    counters.bytes_staged = handle.byte_count;
    ctx.emit(&slice.slice_id, SlicePhase::Sinking, counters, None).await;

    let staged: Vec<BatchRef> = handle
        .batch_refs
        .iter()
        .filter_map(|uri| BatchRef::parse(uri).ok())
        .collect();

    if ctx.cancel.is_cancelled() {
        cleanup_batches(ctx, &staged).await;
        return Attempt::Cancelled;
    }

    let Some(sink) = sink_ep.as_sink() else {
        return Attempt::Err {
            error: EndpointError::capability_missing("sink surface disappeared mid-run"),
            staged,
            counters,
        };
    };
    let request = SinkRequest {
        dataset_id: ctx.dataset_id.clone(),
        data_mode: ctx.data_mode,
        tenant: ctx.tenant.clone(),
    };
    let report = match sink.write(&handle, &request).await {
        Ok(report) => report,
        Err(error) => {
            return Attempt::Err {
                error,
                staged,
                counters,
            };
        }
    };

    counters.records_written += report.written;
    if report.saturated {
        let limit = ctx.throttle.shed();
        ctx.push_warning(format!(
            "sink signaled saturation; slice parallelism reduced to {limit}"
        ));
    }

    // Staged batches are only deleted after the sink accepted them.
    cleanup_batches(ctx, &staged).await;

    Attempt::Done {
        advance_to,
        counters,
        materialized_uri: report.materialized_uri,
    }
}

async fn cleanup_batches(ctx: &SliceContext, staged: &[BatchRef]) {
    for batch in staged {
        if let Err(e) = ctx.staging.delete_batch(batch).await {
            warn!(target: "ucl.executor.slice", batch = %batch, error = %e, "staging cleanup failed");
        }
    }
}
