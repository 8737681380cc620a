// SPDX-License-Identifier: MIT OR Apache-2.0
#![doc = include_str!("../README.md")]
//! ucl-core
#![deny(unsafe_code)]
#![warn(missing_docs)]
//!
//! The stable contract for the Universal Connectivity Layer.

/// Checkpoint payloads, key grammar, and watermarks.
pub mod checkpoint;
/// The staged record envelope and its wire format.
pub mod envelope;
/// Wire-level error taxonomy.
pub mod error;

pub use checkpoint::{Checkpoint, CheckpointKey, InvalidKey, Watermark, slug};
pub use envelope::{ENVELOPE_FORMAT, EnvelopeError, RecordEnvelope};
pub use error::{EndpointError, EndpointResult, ErrorBand, ErrorCode};

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use uuid::Uuid;

/// Current contract version embedded in run results and artifacts.
pub const CONTRACT_VERSION: &str = "ucl/v0.1";

// ---------------------------------------------------------------------------
// Identity
// ---------------------------------------------------------------------------

/// Endpoint identity of the form `{family}.{vendor}` (e.g. `http.jira`,
/// `jdbc.postgres`, `object.minio`).
///
/// The family names the transport/protocol class and doubles as the
/// checkpoint key segment; the vendor names the concrete system.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(transparent)]
pub struct EndpointId(String);

impl EndpointId {
    /// Parse and validate an endpoint id.
    pub fn parse(raw: impl Into<String>) -> Result<Self, EndpointError> {
        let raw = raw.into();
        let mut parts = raw.split('.');
        match (parts.next(), parts.next(), parts.next()) {
            (Some(family), Some(vendor), None)
                if !family.is_empty()
                    && !vendor.is_empty()
                    && raw
                        .chars()
                        .all(|c| matches!(c, 'a'..='z' | '0'..='9' | '.' | '-' | '_')) =>
            {
                Ok(Self(raw))
            }
            _ => Err(EndpointError::validation(format!(
                "endpoint id must be lowercase {{family}}.{{vendor}}: {raw:?}"
            ))),
        }
    }

    /// The transport family (`http`, `jdbc`, `object`, …).
    #[must_use]
    pub fn family(&self) -> &str {
        self.0.split('.').next().unwrap_or_default()
    }

    /// The vendor segment (`jira`, `postgres`, …).
    #[must_use]
    pub fn vendor(&self) -> &str {
        self.0.split('.').nth(1).unwrap_or_default()
    }

    /// The full id string.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EndpointId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The caller's authenticated tenant scope.
///
/// Every store, staging, and executor operation takes this as an explicit
/// first-class parameter; it is never inferred from payloads.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct TenantContext {
    /// Tenant identifier.
    pub tenant_id: String,
    /// Project identifier within the tenant.
    pub project_id: String,
}

impl TenantContext {
    /// Construct and validate a tenant context.
    pub fn new(
        tenant_id: impl Into<String>,
        project_id: impl Into<String>,
    ) -> Result<Self, EndpointError> {
        let tenant_id = tenant_id.into();
        let project_id = project_id.into();
        for (label, id) in [("tenantId", &tenant_id), ("projectId", &project_id)] {
            if id.is_empty()
                || !id
                    .chars()
                    .all(|c| matches!(c, 'a'..='z' | '0'..='9' | '-' | '_'))
            {
                return Err(EndpointError::validation(format!(
                    "{label} must be lowercase alphanumeric: {id:?}"
                )));
            }
        }
        Ok(Self {
            tenant_id,
            project_id,
        })
    }
}

// ---------------------------------------------------------------------------
// Capabilities
// ---------------------------------------------------------------------------

/// A discrete feature an endpoint may advertise.
#[derive(
    Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq, PartialOrd, Ord, Hash,
)]
#[serde(rename_all = "kebab-case")]
pub enum Capability {
    /// The endpoint can be read from.
    Source,
    /// The endpoint can be written to.
    Sink,
    /// The endpoint can plan and read bounded slices.
    SliceCapable,
    /// The endpoint honors watermark-based incremental reads.
    SupportsIncremental,
    /// The endpoint tracks changes via delta tokens.
    SupportsDelta,
    /// The endpoint exposes dataset metadata.
    Metadata,
    /// The endpoint supports record previews.
    Preview,
    /// The endpoint supports connection probing.
    TestConnection,
}

/// The set of capabilities an endpoint advertises.
pub type CapabilitySet = BTreeSet<Capability>;

/// Build a capability set from a slice of capabilities.
#[must_use]
pub fn capability_set(caps: &[Capability]) -> CapabilitySet {
    caps.iter().copied().collect()
}

/// Result of probing an endpoint's connectivity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct TestConnectionReport {
    /// Whether the endpoint is reachable and authorized.
    pub ok: bool,
    /// Version string detected on the remote system, when available.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detected_version: Option<String>,
    /// Capabilities observed at probe time. Authoritative for gating.
    pub capabilities: CapabilitySet,
    /// Free-form diagnostics. Redacted before logging.
    #[serde(default)]
    pub details: BTreeMap<String, String>,
}

// ---------------------------------------------------------------------------
// Datasets & units
// ---------------------------------------------------------------------------

/// Semantic type of a dataset field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum SemanticType {
    /// Source-native identifier.
    Identifier,
    /// Free-form text.
    Text,
    /// Whole number.
    Integer,
    /// Floating-point number.
    Float,
    /// Boolean flag.
    Boolean,
    /// RFC 3339 instant.
    Timestamp,
    /// Nested JSON document.
    Json,
    /// Opaque binary payload.
    Binary,
}

/// One field of a dataset schema.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct Field {
    /// Field name as the source spells it.
    pub name: String,
    /// Semantic type.
    pub semantic_type: SemanticType,
    /// Whether the field may be absent or null.
    pub nullable: bool,
}

/// A logical collection offered by a source (Jira `issues`, Confluence
/// `pages`, a JDBC table).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Dataset {
    /// Dataset identifier, unique within the endpoint.
    pub id: String,
    /// Ordered field list.
    pub schema: Vec<Field>,
    /// Optional canonical-model tag.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cdm_model_id: Option<String>,
    /// Capability flags for this dataset (a subset of the endpoint's).
    #[serde(default)]
    pub capabilities: CapabilitySet,
}

/// How a run traverses the dataset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunMode {
    /// Only records beyond the stored watermark.
    Incremental,
    /// The whole dataset, ignoring any stored watermark.
    Full,
}

/// Dimension filter: dimension name → accepted values.
pub type UnitFilter = BTreeMap<String, Vec<String>>;

/// The unit of scheduling: a configured (endpoint, dataset, filter) tuple.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct IngestionUnit {
    /// Stable unit identifier.
    pub unit_id: String,
    /// The source endpoint this unit reads from.
    pub endpoint_id: EndpointId,
    /// The dataset within the endpoint.
    pub dataset_id: String,
    /// Watermark dimension this unit tracks (`updated`, `delta`, …).
    pub dimension: String,
    /// Dimension filter applied at the source.
    #[serde(default)]
    pub filter: UnitFilter,
    /// Traversal mode.
    pub run_mode: RunMode,
}

/// Planner budget hints.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct BudgetHints {
    /// Target records per slice.
    pub page_hint: u32,
    /// Target staged bytes per slice.
    pub expected_byte_budget: u64,
}

impl Default for BudgetHints {
    fn default() -> Self {
        Self {
            page_hint: 1_000,
            expected_byte_budget: 64 * 1024 * 1024,
        }
    }
}

// ---------------------------------------------------------------------------
// Slices & plans
// ---------------------------------------------------------------------------

/// Partitioning strategy chosen by the planner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum PlanStrategy {
    /// Whole-dataset traversal partitioned by natural key range.
    Full,
    /// Watermark-windowed traversal beyond the checkpoint.
    Incremental,
    /// Strategy recommended by the source's probe.
    Adaptive,
}

/// A deterministic, bounded unit of work within an ingestion run.
///
/// `slice_id` is content-derived: re-planning the same unit at the same
/// checkpoint yields byte-identical ids.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Slice {
    /// Content-deterministic identifier.
    pub slice_id: String,
    /// Owning unit.
    pub unit_id: String,
    /// Watermark dimension this slice covers.
    pub dimension: String,
    /// Inclusive lower bound; `None` for the open start of a full scan.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lower: Option<Watermark>,
    /// Exclusive upper bound; `None` for an open-ended final slice.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub upper: Option<Watermark>,
    /// Expected staged bytes for this slice.
    pub expected_byte_budget: u64,
    /// Source page size to use while reading.
    pub page_hint: u32,
}

impl Slice {
    /// Construct a slice, deriving its deterministic identity.
    #[must_use]
    pub fn new(
        unit_id: impl Into<String>,
        dimension: impl Into<String>,
        lower: Option<Watermark>,
        upper: Option<Watermark>,
        budget: &BudgetHints,
    ) -> Self {
        let unit_id = unit_id.into();
        let dimension = dimension.into();
        let slice_id = slice_identity(&unit_id, &dimension, lower.as_ref(), upper.as_ref());
        Self {
            slice_id,
            unit_id,
            dimension,
            lower,
            upper,
            expected_byte_budget: budget.expected_byte_budget,
            page_hint: budget.page_hint,
        }
    }
}

/// Compute the content-deterministic slice identity.
#[must_use]
pub fn slice_identity(
    unit_id: &str,
    dimension: &str,
    lower: Option<&Watermark>,
    upper: Option<&Watermark>,
) -> String {
    let lower = lower.map_or_else(|| "-".to_string(), Watermark::canonical_token);
    let upper = upper.map_or_else(|| "-".to_string(), Watermark::canonical_token);
    sha256_hex(format!("{unit_id}\n{dimension}\n{lower}\n{upper}").as_bytes())
}

/// The ordered slice list for one run of one unit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct IngestionPlan {
    /// Slices in ascending watermark order.
    pub slices: Vec<Slice>,
    /// Strategy that produced the slices.
    pub strategy: PlanStrategy,
    /// Upper horizon of the plan (usually `now()` at planning time).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub horizon: Option<Watermark>,
    /// Non-fatal conditions observed while planning (e.g. cursor expiry).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
}

impl IngestionPlan {
    /// Returns `true` when the plan contains no slices.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.slices.is_empty()
    }
}

/// Result of an adaptive source probe.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ProbeReport {
    /// Estimated records the run would move.
    pub estimated_record_count: u64,
    /// Estimated staged bytes.
    pub estimated_bytes: u64,
    /// Strategy the source recommends.
    pub recommended_strategy: PlanStrategy,
    /// Observed throttling posture, when known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rate_limit: Option<RateLimitInfo>,
}

/// Throttling posture reported by a source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitInfo {
    /// Requests per minute the source will tolerate.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requests_per_minute: Option<u32>,
    /// Currently mandated wait, in milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_after_ms: Option<u64>,
}

// ---------------------------------------------------------------------------
// Staging handles & artifacts
// ---------------------------------------------------------------------------

/// Opaque reference to a staged record set.
///
/// Only handles cross the workflow control plane; record batches never do.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema, Default)]
#[serde(rename_all = "camelCase")]
pub struct StagingHandle {
    /// The staging prefix URI for this slice.
    pub stage_ref: String,
    /// Sealed, immutable batch URIs under the prefix.
    pub batch_refs: Vec<String>,
    /// Envelope encoding (always `jsonl+gzip`).
    pub envelope_format: String,
    /// Total records staged.
    pub record_count: u64,
    /// Total compressed bytes staged.
    pub byte_count: u64,
}

/// Counters carried on progress events and run results.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema, Default)]
#[serde(rename_all = "camelCase")]
pub struct RunCounters {
    /// Records read from the source.
    pub records_read: u64,
    /// Records acknowledged by the sink.
    pub records_written: u64,
    /// Compressed bytes staged.
    pub bytes_staged: u64,
}

impl RunCounters {
    /// Accumulate another counter set into this one.
    pub fn absorb(&mut self, other: RunCounters) {
        self.records_read += other.records_read;
        self.records_written += other.records_written;
        self.bytes_staged += other.bytes_staged;
    }
}

/// Registry row written when a run completes successfully.
///
/// Idempotent on `(tenantId, sourceRunId, artifactKind)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct MaterializedArtifact {
    /// Owning tenant.
    pub tenant_id: String,
    /// The run that produced this artifact.
    pub source_run_id: Uuid,
    /// Kind discriminator (`"sink"`, `"staging"`, …).
    pub artifact_kind: String,
    /// Location of the materialized data at the sink.
    pub handle: String,
    /// Canonical metadata for downstream consumers.
    #[serde(default)]
    pub canonical_meta: BTreeMap<String, String>,
    /// Final counters for the run.
    pub counters: RunCounters,
}

impl MaterializedArtifact {
    /// The idempotency key for registry upserts.
    #[must_use]
    pub fn identity(&self) -> (String, Uuid, String) {
        (
            self.tenant_id.clone(),
            self.source_run_id,
            self.artifact_kind.clone(),
        )
    }
}

// ---------------------------------------------------------------------------
// Progress & run state
// ---------------------------------------------------------------------------

/// Phase of a slice as reported on the progress stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum SlicePhase {
    /// Streaming source records into staging.
    Staging,
    /// Feeding the sealed staging handle to the sink.
    Sinking,
    /// Slice fully sunk and checkpoint advanced.
    Done,
    /// Slice failed terminally.
    Failed,
}

/// One event on the executor → caller progress stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ProgressEvent {
    /// The run this event belongs to.
    pub run_id: Uuid,
    /// The slice this event describes.
    pub slice_id: String,
    /// Current phase.
    pub phase: SlicePhase,
    /// Counters at event time.
    pub counters: RunCounters,
    /// Wire error code when `phase == Failed`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
    /// Mandated wait before retry, in milliseconds.
    #[serde(default, rename = "retryAfter", skip_serializing_if = "Option::is_none")]
    pub retry_after_ms: Option<u64>,
}

/// Lifecycle state of an ingestion run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunState {
    /// Not started.
    Idle,
    /// Slices are executing.
    Running,
    /// All slices sank and the checkpoint advanced.
    Succeeded,
    /// A fatal error stopped the run; checkpoint untouched beyond the
    /// contiguous successful prefix.
    Failed,
    /// A cancel signal stopped the run gracefully; resumable.
    Paused,
}

/// A vector index profile surfaced by an endpoint for the brain layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct VectorProfile {
    /// Profile identifier.
    pub id: String,
    /// Embedding model name.
    pub model: String,
    /// Embedding dimensionality.
    pub dimensions: u32,
}

// ---------------------------------------------------------------------------
// Hashing
// ---------------------------------------------------------------------------

/// Errors from contract-level operations (serialization, hashing).
#[derive(Debug, thiserror::Error)]
pub enum ContractError {
    /// JSON serialization or deserialization failed.
    #[error("failed to serialize JSON: {0}")]
    Json(#[from] serde_json::Error),
}

/// Produce a deterministic JSON string for hashing.
///
/// Not a full JCS implementation, but stable for our types: keys are sorted
/// (serde_json maps preserve insertion into a BTreeMap-backed object) and
/// numbers serialize consistently.
///
/// # Errors
///
/// Returns [`ContractError::Json`] if the value cannot be serialized.
pub fn canonical_json<T: Serialize>(value: &T) -> Result<String, ContractError> {
    let v = serde_json::to_value(value)?;
    Ok(serde_json::to_string(&v)?)
}

/// Compute the hex-encoded SHA-256 digest of `bytes`.
#[must_use]
pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}
