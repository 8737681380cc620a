// SPDX-License-Identifier: MIT OR Apache-2.0
#![deny(unsafe_code)]
#![warn(missing_docs)]
//! The adaptive ingestion planner.
//!
//! Given a unit, its checkpoint, and the live source endpoint, the planner
//! emits a deterministic, bounded, ordered [`IngestionPlan`]:
//!
//! 1. A source without the slice surface gets a single degenerate slice
//!    covering the whole dataset.
//! 2. When the source probes successfully, the probe's recommended strategy
//!    wins.
//! 3. `FULL` mode, or a missing checkpoint, partitions by natural key range.
//! 4. Otherwise the watermark domain is partitioned into half-open
//!    ascending intervals; the final slice is open-ended.
//!
//! Re-planning the same unit at the same checkpoint yields byte-identical
//! slice ids, which is what makes resume-after-partial-success safe.

use chrono::{DateTime, SecondsFormat, Utc};
use tracing::{debug, warn};
use ucl_core::{
    BudgetHints, Checkpoint, EndpointError, EndpointResult, ErrorCode, IngestionPlan,
    IngestionUnit, PlanStrategy, ProbeReport, RunMode, Slice, UnitFilter, Watermark,
    slice_identity,
};
use ucl_endpoint::{PlanRequest, SourceEndpoint};

/// Outcome of planning: the plan plus the probe that informed it, when one
/// ran (the executor reuses the probe's estimate for staging selection).
#[derive(Debug, Clone)]
pub struct PlanOutcome {
    /// The ordered slice plan.
    pub plan: IngestionPlan,
    /// Probe report, when the source is adaptive and probing succeeded.
    pub probe: Option<ProbeReport>,
}

/// Plans one run of one unit against the live source.
pub async fn plan(
    source: &dyn SourceEndpoint,
    unit: &IngestionUnit,
    checkpoint: Option<&Checkpoint>,
    budget: &BudgetHints,
) -> EndpointResult<PlanOutcome> {
    let filter = normalize_filter(&unit.filter)?;

    let Some(slice_capable) = source.as_slice_capable() else {
        debug!(
            target: "ucl.planner",
            unit = %unit.unit_id,
            "source is not slice-capable, planning one degenerate slice"
        );
        let slice = Slice::new(unit.unit_id.clone(), unit.dimension.clone(), None, None, budget);
        return Ok(PlanOutcome {
            plan: IngestionPlan {
                slices: vec![slice],
                strategy: PlanStrategy::Full,
                horizon: None,
                warnings: Vec::new(),
            },
            probe: None,
        });
    };

    let mut warnings = Vec::new();
    let mut effective_mode = match (unit.run_mode, checkpoint) {
        (RunMode::Full, _) | (_, None) => RunMode::Full,
        (RunMode::Incremental, Some(_)) => RunMode::Incremental,
    };
    let mut effective_checkpoint = match effective_mode {
        RunMode::Full => None,
        RunMode::Incremental => checkpoint.cloned(),
    };

    // An adaptive probe, when it succeeds, overrides the mode decision.
    let mut probe = None;
    if let Some(adaptive) = slice_capable.as_adaptive() {
        let req = plan_request(unit, &filter, effective_mode, effective_checkpoint.clone(), budget);
        match adaptive.probe(&req).await {
            Ok(report) => {
                match report.recommended_strategy {
                    PlanStrategy::Full => {
                        effective_mode = RunMode::Full;
                        effective_checkpoint = None;
                    }
                    PlanStrategy::Incremental | PlanStrategy::Adaptive => {
                        if checkpoint.is_some() {
                            effective_mode = RunMode::Incremental;
                            effective_checkpoint = checkpoint.cloned();
                        }
                    }
                }
                probe = Some(report);
            }
            Err(err) if err.code == ErrorCode::CheckpointExpired => {
                warnings.push(format!(
                    "stored cursor for {} expired during probe; degrading to full",
                    unit.unit_id
                ));
                effective_mode = RunMode::Full;
                effective_checkpoint = None;
            }
            Err(err) => {
                warn!(
                    target: "ucl.planner",
                    unit = %unit.unit_id,
                    error = %err,
                    "probe failed, continuing without it"
                );
            }
        }
    }

    let req = plan_request(unit, &filter, effective_mode, effective_checkpoint.clone(), budget);
    let mut plan = match slice_capable.plan_slices(&req).await {
        Ok(plan) => plan,
        Err(err) if err.code == ErrorCode::CheckpointExpired => {
            warnings.push(format!(
                "stored cursor for {} no longer honored by the source; degrading to full",
                unit.unit_id
            ));
            // A full reset: the stale cursor must not filter the new plan.
            effective_checkpoint = None;
            let full = plan_request(unit, &filter, RunMode::Full, None, budget);
            slice_capable.plan_slices(&full).await?
        }
        Err(err) => return Err(err),
    };

    let checkpoint_watermark = effective_checkpoint.as_ref().and_then(Checkpoint::watermark);
    finalize(&mut plan, unit, budget, checkpoint_watermark.as_ref());
    plan.warnings.extend(warnings);

    if probe.is_some() {
        plan.strategy = PlanStrategy::Adaptive;
    }

    debug!(
        target: "ucl.planner",
        unit = %unit.unit_id,
        slices = plan.slices.len(),
        strategy = ?plan.strategy,
        "plan ready"
    );
    Ok(PlanOutcome { plan, probe })
}

fn plan_request(
    unit: &IngestionUnit,
    filter: &UnitFilter,
    run_mode: RunMode,
    checkpoint: Option<Checkpoint>,
    budget: &BudgetHints,
) -> PlanRequest {
    PlanRequest {
        unit_id: unit.unit_id.clone(),
        dataset_id: unit.dataset_id.clone(),
        dimension: unit.dimension.clone(),
        filter: filter.clone(),
        run_mode,
        checkpoint,
        budget: *budget,
    }
}

/// Enforce the planner's slice invariants on a source-produced plan.
///
/// - slice ids are recomputed from content (sources cannot break
///   determinism);
/// - slices are ordered ascending by lower bound;
/// - slices fully at or below the checkpoint watermark are dropped;
/// - an empty plan becomes a single empty slice bounded by the plan
///   horizon, so a watermark-based checkpoint still advances.
fn finalize(
    plan: &mut IngestionPlan,
    unit: &IngestionUnit,
    budget: &BudgetHints,
    checkpoint_watermark: Option<&Watermark>,
) {
    for slice in &mut plan.slices {
        slice.unit_id = unit.unit_id.clone();
        slice.dimension = unit.dimension.clone();
        slice.slice_id = slice_identity(
            &slice.unit_id,
            &slice.dimension,
            slice.lower.as_ref(),
            slice.upper.as_ref(),
        );
    }

    plan.slices.sort_by(|a, b| match (&a.lower, &b.lower) {
        (None, None) => std::cmp::Ordering::Equal,
        (None, Some(_)) => std::cmp::Ordering::Less,
        (Some(_), None) => std::cmp::Ordering::Greater,
        (Some(x), Some(y)) => x.try_cmp(y).unwrap_or(std::cmp::Ordering::Equal),
    });

    if let Some(cp) = checkpoint_watermark {
        plan.slices.retain(|slice| match &slice.upper {
            Some(upper) => !matches!(
                upper.try_cmp(cp),
                Some(std::cmp::Ordering::Less | std::cmp::Ordering::Equal)
            ),
            None => true,
        });
    }

    if plan.slices.is_empty() {
        // Nothing beyond the checkpoint. With a time-based horizon the run
        // still advances the watermark to now(), via one empty slice whose
        // window [horizon, horizon) can never match a record. Without a
        // horizon the checkpoint stays untouched: the plan remains empty.
        if let Some(horizon) = plan.horizon.clone() {
            plan.slices.push(Slice::new(
                unit.unit_id.clone(),
                unit.dimension.clone(),
                Some(horizon.clone()),
                Some(horizon),
                budget,
            ));
        }
    }
}

/// Normalize timestamp-valued filter entries to UTC.
///
/// Values carrying a single non-UTC offset are converted; values carrying
/// more than one distinct offset are rejected with `E_VALIDATION`.
pub fn normalize_filter(filter: &UnitFilter) -> EndpointResult<UnitFilter> {
    let mut normalized = UnitFilter::new();
    for (dimension, values) in filter {
        let mut offsets = std::collections::BTreeSet::new();
        let mut out = Vec::with_capacity(values.len());
        for value in values {
            match DateTime::parse_from_rfc3339(value) {
                Ok(ts) => {
                    offsets.insert(ts.offset().local_minus_utc());
                    out.push(
                        ts.with_timezone(&Utc)
                            .to_rfc3339_opts(SecondsFormat::Secs, true),
                    );
                }
                Err(_) => out.push(value.clone()),
            }
        }
        if offsets.len() > 1 {
            return Err(EndpointError::validation(format!(
                "filter dimension {dimension:?} mixes timestamp zones; normalize to UTC"
            ))
            .with_detail("dimension", dimension.clone()));
        }
        normalized.insert(dimension.clone(), out);
    }
    Ok(normalized)
}

// ---------------------------------------------------------------------------
// Partitioning helpers for slice-capable sources
// ---------------------------------------------------------------------------

/// Partition sorted, distinct ordered watermarks into half-open windows.
///
/// `[w1, w2, …, wn]` becomes `[w1, w2), [w2, w3), …, [wn, ·)`; the final
/// window is open-ended so its slice id does not depend on planning-time
/// wall clock.
#[must_use]
pub fn half_open_windows(boundaries: &[Watermark]) -> Vec<(Watermark, Option<Watermark>)> {
    let mut windows = Vec::with_capacity(boundaries.len());
    for (i, lower) in boundaries.iter().enumerate() {
        let upper = boundaries.get(i + 1).cloned();
        windows.push((lower.clone(), upper));
    }
    windows
}

/// Partition a sequence (natural key) domain into ranges of `width`.
///
/// Covers `[min, max]`; every range but the last is `[lo, lo + width)` and
/// the last is open-ended.
#[must_use]
pub fn sequence_ranges(min: i64, max: i64, width: u32) -> Vec<(Watermark, Option<Watermark>)> {
    let mut ranges = Vec::new();
    if max < min || width == 0 {
        return ranges;
    }
    let width = i64::from(width);
    let mut lo = min;
    loop {
        let hi = lo.saturating_add(width);
        if hi > max {
            ranges.push((Watermark::sequence(lo), None));
            break;
        }
        ranges.push((Watermark::sequence(lo), Some(Watermark::sequence(hi))));
        lo = hi;
    }
    ranges
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn windows_are_half_open_with_open_tail() {
        let w: Vec<Watermark> = (1..=3).map(Watermark::sequence).collect();
        let windows = half_open_windows(&w);
        assert_eq!(windows.len(), 3);
        assert_eq!(windows[0], (Watermark::sequence(1), Some(Watermark::sequence(2))));
        assert_eq!(windows[2], (Watermark::sequence(3), None));
    }

    #[test]
    fn sequence_ranges_cover_the_domain() {
        let ranges = sequence_ranges(0, 2_500, 1_000);
        assert_eq!(ranges.len(), 3);
        assert_eq!(ranges[0], (Watermark::sequence(0), Some(Watermark::sequence(1_000))));
        assert_eq!(ranges[1], (Watermark::sequence(1_000), Some(Watermark::sequence(2_000))));
        assert_eq!(ranges[2], (Watermark::sequence(2_000), None));
        assert!(sequence_ranges(10, 5, 100).is_empty());
    }

    #[test]
    fn filters_normalize_to_utc() {
        let mut filter = UnitFilter::new();
        filter.insert(
            "updated".into(),
            vec!["2025-01-02T12:00:00+02:00".into(), "project-x".into()],
        );
        let normalized = normalize_filter(&filter).unwrap();
        assert_eq!(
            normalized["updated"],
            vec!["2025-01-02T10:00:00Z".to_string(), "project-x".to_string()]
        );
    }

    #[test]
    fn mixed_zone_filters_are_rejected() {
        let mut filter = UnitFilter::new();
        filter.insert(
            "updated".into(),
            vec![
                "2025-01-02T12:00:00+02:00".into(),
                "2025-01-02T12:00:00-05:00".into(),
            ],
        );
        let err = normalize_filter(&filter).unwrap_err();
        assert_eq!(err.code, ErrorCode::Validation);
    }

    #[test]
    fn utc_only_filters_pass() {
        let mut filter = UnitFilter::new();
        filter.insert(
            "updated".into(),
            vec![
                "2025-01-02T10:00:00Z".into(),
                "2025-01-03T11:00:00Z".into(),
            ],
        );
        assert!(normalize_filter(&filter).is_ok());
    }

    #[test]
    fn finalize_drops_covered_slices_and_sorts() {
        let budget = BudgetHints::default();
        let unit = IngestionUnit {
            unit_id: "u1".into(),
            endpoint_id: ucl_core::EndpointId::parse("http.jira").unwrap(),
            dataset_id: "issues".into(),
            dimension: "updated".into(),
            filter: UnitFilter::new(),
            run_mode: RunMode::Incremental,
        };
        let t = |d: u32| {
            Watermark::timestamp(Utc.with_ymd_and_hms(2025, 1, d, 0, 0, 0).unwrap())
        };
        let mut plan = IngestionPlan {
            slices: vec![
                Slice::new("u1", "updated", Some(t(3)), None, &budget),
                Slice::new("u1", "updated", Some(t(1)), Some(t(2)), &budget),
                Slice::new("u1", "updated", Some(t(2)), Some(t(3)), &budget),
            ],
            strategy: PlanStrategy::Incremental,
            horizon: None,
            warnings: Vec::new(),
        };
        finalize(&mut plan, &unit, &budget, Some(&t(2)));
        // [t1,t2) is fully covered by the checkpoint at t2 and is dropped.
        assert_eq!(plan.slices.len(), 2);
        assert_eq!(plan.slices[0].lower, Some(t(2)));
        assert_eq!(plan.slices[1].lower, Some(t(3)));
    }

    #[test]
    fn finalize_synthesizes_empty_slice_with_horizon() {
        let budget = BudgetHints::default();
        let unit = IngestionUnit {
            unit_id: "u1".into(),
            endpoint_id: ucl_core::EndpointId::parse("http.jira").unwrap(),
            dataset_id: "issues".into(),
            dimension: "updated".into(),
            filter: UnitFilter::new(),
            run_mode: RunMode::Incremental,
        };
        let now = Watermark::timestamp(Utc.with_ymd_and_hms(2025, 2, 1, 0, 0, 0).unwrap());
        let cp = Watermark::timestamp(Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap());
        let mut plan = IngestionPlan {
            slices: Vec::new(),
            strategy: PlanStrategy::Incremental,
            horizon: Some(now.clone()),
            warnings: Vec::new(),
        };
        finalize(&mut plan, &unit, &budget, Some(&cp));
        // The empty window can never match a record but still names the
        // horizon the checkpoint should advance to.
        assert_eq!(plan.slices.len(), 1);
        assert_eq!(plan.slices[0].lower, Some(now.clone()));
        assert_eq!(plan.slices[0].upper, Some(now));

        // Without a time-based horizon the plan stays empty and the
        // checkpoint is left untouched.
        let mut plan = IngestionPlan {
            slices: Vec::new(),
            strategy: PlanStrategy::Incremental,
            horizon: None,
            warnings: Vec::new(),
        };
        finalize(&mut plan, &unit, &budget, Some(&cp));
        assert!(plan.slices.is_empty());
    }
}
