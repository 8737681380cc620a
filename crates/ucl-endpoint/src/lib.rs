// SPDX-License-Identifier: MIT OR Apache-2.0
#![deny(unsafe_code)]
#![warn(missing_docs)]
//! Endpoint contracts: the capability trait hierarchy every data source and
//! sink implements, plus the process-wide factory registry.
//!
//! The hierarchy composes rather than inherits. A concrete endpoint
//! implements [`Endpoint`] and exposes its optional capability surfaces
//! through explicit accessors (`as_source`, `as_slice_capable`, …) that
//! return `Option<&dyn …>`. Capability gating is authoritative at run time:
//! the executor checks [`Endpoint::capabilities`] on the live instance, not
//! whatever the catalog said at configuration time.

/// Factory registry with JSON-schema config validation.
pub mod registry;

pub use registry::{EndpointFactory, EndpointRegistry, EndpointRegistryBuilder};

use async_trait::async_trait;
use ucl_core::{
    BudgetHints, Capability, CapabilitySet, Checkpoint, Dataset, EndpointError, EndpointId,
    EndpointResult, IngestionPlan, ProbeReport, RecordEnvelope, RunMode, Slice, StagingHandle,
    TenantContext, TestConnectionReport, UnitFilter, VectorProfile, Watermark,
};

// ---------------------------------------------------------------------------
// Requests & reports
// ---------------------------------------------------------------------------

/// Input to [`SliceCapable::plan_slices`] and [`AdaptiveIngestion::probe`].
#[derive(Debug, Clone)]
pub struct PlanRequest {
    /// The unit being planned (slice identity hashes over this).
    pub unit_id: String,
    /// Dataset to partition.
    pub dataset_id: String,
    /// Watermark dimension the unit tracks.
    pub dimension: String,
    /// Dimension filter applied at the source.
    pub filter: UnitFilter,
    /// Traversal mode requested by the caller.
    pub run_mode: RunMode,
    /// The stored checkpoint, when one exists.
    pub checkpoint: Option<Checkpoint>,
    /// Planner budget hints.
    pub budget: BudgetHints,
}

/// Input to [`SinkEndpoint::write`].
#[derive(Debug, Clone)]
pub struct SinkRequest {
    /// Target dataset at the sink.
    pub dataset_id: String,
    /// Traversal mode of the producing run.
    pub data_mode: RunMode,
    /// The caller's authenticated tenant scope.
    pub tenant: TenantContext,
}

/// Result of one sink write.
#[derive(Debug, Clone, Default)]
pub struct SinkReport {
    /// Records the sink acknowledged.
    pub written: u64,
    /// Records the sink rejected.
    pub failed: u64,
    /// Where the sink materialized the data, when addressable.
    pub materialized_uri: Option<String>,
    /// The sink is saturated; the executor sheds read parallelism.
    pub saturated: bool,
}

// ---------------------------------------------------------------------------
// Trait hierarchy
// ---------------------------------------------------------------------------

/// Base contract every endpoint implements.
#[async_trait]
pub trait Endpoint: Send + Sync {
    /// Stable endpoint identity (`{family}.{vendor}`).
    fn id(&self) -> &EndpointId;

    /// Capabilities this endpoint advertises right now. Authoritative.
    fn capabilities(&self) -> CapabilitySet;

    /// Probe connectivity, auth, and remote version.
    async fn test_connection(&self) -> EndpointResult<TestConnectionReport>;

    /// Release held resources (connection pools, cursors).
    async fn close(&self) -> EndpointResult<()> {
        Ok(())
    }

    /// The source surface, when this endpoint can be read.
    fn as_source(&self) -> Option<&dyn SourceEndpoint> {
        None
    }

    /// The sink surface, when this endpoint can be written.
    fn as_sink(&self) -> Option<&dyn SinkEndpoint> {
        None
    }

    /// The vector profile surface, when this endpoint declares any.
    fn as_vector_profiles(&self) -> Option<&dyn VectorProfileProvider> {
        None
    }
}

/// A finite, pull-based record sequence.
///
/// Sources are restartable by replaying from a cursor, never by seeking
/// inside an opaque stream. The executor pulls records one page at a time
/// and, once the sequence is exhausted, reads the cursor-advance watermark
/// (the max observed watermark, or the fresh delta token).
#[async_trait]
pub trait SliceReader: Send {
    /// Next record, or `None` when the sequence is exhausted.
    async fn next(&mut self) -> Option<EndpointResult<RecordEnvelope>>;

    /// The watermark this sequence advanced to. Meaningful once
    /// [`next`](Self::next) has returned `None`.
    fn watermark(&self) -> Option<Watermark>;
}

/// Read surface of an endpoint.
#[async_trait]
pub trait SourceEndpoint: Send + Sync {
    /// Datasets this source offers.
    async fn list_datasets(&self) -> EndpointResult<Vec<Dataset>>;

    /// A bounded sample of records, for console preview.
    async fn preview(&self, dataset_id: &str, limit: usize)
    -> EndpointResult<Vec<RecordEnvelope>>;

    /// Read the whole filtered dataset as one sequence.
    async fn read(
        &self,
        dataset_id: &str,
        filter: &UnitFilter,
    ) -> EndpointResult<Box<dyn SliceReader>>;

    /// How many slices this source tolerates in parallel.
    fn concurrency_hint(&self) -> usize {
        1
    }

    /// The slice-planning surface, when supported.
    fn as_slice_capable(&self) -> Option<&dyn SliceCapable> {
        None
    }
}

/// Slice planning and bounded reads.
#[async_trait]
pub trait SliceCapable: Send + Sync {
    /// Partition the requested unit into bounded, deterministic slices.
    async fn plan_slices(&self, req: &PlanRequest) -> EndpointResult<IngestionPlan>;

    /// Read exactly the records of one slice, in source order.
    async fn read_slice(&self, slice: &Slice) -> EndpointResult<Box<dyn SliceReader>>;

    /// The adaptive probing surface, when supported.
    fn as_adaptive(&self) -> Option<&dyn AdaptiveIngestion> {
        None
    }
}

/// Optional probing surface for adaptive strategy selection.
#[async_trait]
pub trait AdaptiveIngestion: Send + Sync {
    /// Estimate volume and recommend a strategy for the request.
    async fn probe(&self, req: &PlanRequest) -> EndpointResult<ProbeReport>;
}

/// Write surface of an endpoint.
///
/// Sinks consume sealed staging handles; record batches never cross the
/// control plane directly.
#[async_trait]
pub trait SinkEndpoint: Send + Sync {
    /// Write every envelope under the staging handle into the sink.
    async fn write(&self, handle: &StagingHandle, req: &SinkRequest) -> EndpointResult<SinkReport>;
}

/// Optional surface declaring vector index profiles for the brain layer.
pub trait VectorProfileProvider: Send + Sync {
    /// The profiles this endpoint declares.
    fn vector_profiles(&self) -> Vec<VectorProfile>;
}

// ---------------------------------------------------------------------------
// Capability gating
// ---------------------------------------------------------------------------

/// Checks that the live endpoint advertises every required capability.
///
/// Gating is dynamic: a run that requires `supports-incremental` against an
/// endpoint that no longer advertises it fails here with
/// `E_CAPABILITY_MISSING`, before any slice work starts.
pub fn ensure_capabilities(
    endpoint: &dyn Endpoint,
    required: &[Capability],
) -> EndpointResult<()> {
    let advertised = endpoint.capabilities();
    let missing: Vec<String> = required
        .iter()
        .filter(|cap| !advertised.contains(cap))
        .map(|cap| {
            serde_json::to_string(cap)
                .map(|s| s.trim_matches('"').to_string())
                .unwrap_or_else(|_| format!("{cap:?}"))
        })
        .collect();
    if missing.is_empty() {
        return Ok(());
    }
    Err(
        EndpointError::capability_missing(format!(
            "endpoint {} does not advertise: {}",
            endpoint.id(),
            missing.join(", ")
        ))
        .with_detail("endpoint", endpoint.id().as_str())
        .with_detail("missing", missing.join(",")),
    )
}
