// SPDX-License-Identifier: MIT OR Apache-2.0
//! Whole-pipeline tests: config → registry → planner → executor →
//! checkpoint/staging/artifacts, with durable (filesystem) substrates.

use chrono::{TimeZone, Utc};
use serde_json::json;
use std::sync::Arc;
use tokio::sync::mpsc;
use ucl::executor_options;
use ucl_checkpoint::{CheckpointStore, FsCheckpointStore};
use ucl_core::{
    BudgetHints, CheckpointKey, EndpointId, IngestionUnit, RecordEnvelope, RunMode, RunState,
    TenantContext, UnitFilter, Watermark,
};
use ucl_endpoint::{Endpoint, EndpointFactory, EndpointRegistryBuilder};
use ucl_endpoint_mock::{MockSinkEndpoint, MockSourceEndpoint};
use ucl_executor::{
    ArtifactRegistry, CancellationToken, IngestionExecutor, MemoryArtifactRegistry, RunRequest,
};
use ucl_staging::{ObjectStoreStaging, StagingProvider, StagingSelector};

struct FixedFactory(Arc<dyn Endpoint>);

impl EndpointFactory for FixedFactory {
    fn config_schema(&self) -> serde_json::Value {
        json!({
            "type": "object",
            "properties": { "baseUrl": { "type": "string" } }
        })
    }

    fn build(
        &self,
        _id: &EndpointId,
        _config: &serde_json::Value,
    ) -> ucl_core::EndpointResult<Arc<dyn Endpoint>> {
        Ok(Arc::clone(&self.0))
    }
}

fn tenant() -> TenantContext {
    TenantContext::new("acme", "main").unwrap()
}

fn ts(day: u32, hour: u32) -> Watermark {
    Watermark::timestamp(Utc.with_ymd_and_hms(2025, 1, day, hour, 0, 0).unwrap())
}

fn record(n: u32, day: u32, hour: u32) -> RecordEnvelope {
    RecordEnvelope::new(
        format!("JIRA-{n}"),
        "acme",
        Utc.with_ymd_and_hms(2025, 1, day, hour, 0, 0).unwrap(),
    )
    .with_source_url(format!("https://jira.example/browse/JIRA-{n}"))
    .with_raw(json!({"fields": {"summary": format!("issue {n}")}}))
}

fn request() -> RunRequest {
    RunRequest {
        tenant: tenant(),
        unit: IngestionUnit {
            unit_id: "cus-issues".into(),
            endpoint_id: EndpointId::parse("http.jira").unwrap(),
            dataset_id: "issues".into(),
            dimension: "updated".into(),
            filter: UnitFilter::new(),
            run_mode: RunMode::Incremental,
        },
        sink_endpoint_id: EndpointId::parse("jdbc.warehouse").unwrap(),
        data_mode: RunMode::Incremental,
        filter: UnitFilter::new(),
        budget: BudgetHints::default(),
        request_id: "wf-req-1".into(),
    }
}

struct Pipeline {
    executor: IngestionExecutor,
    checkpoints: Arc<FsCheckpointStore>,
    sink: Arc<MockSinkEndpoint>,
    staging_root: tempfile::TempDir,
}

fn pipeline(source: MockSourceEndpoint) -> Pipeline {
    let config = ucl_config::parse_toml(
        r#"
        [executor]
        global_max_concurrency = 4

        [staging]
        scheme = "file"
        bucket = "ucl-staging"
        "#,
    )
    .unwrap();
    ucl_config::validate_config(&config).unwrap();
    ucl_telemetry::init_tracing(config.log_level.as_deref(), false);

    let staging_root = tempfile::tempdir().unwrap();
    let store = object_store::local::LocalFileSystem::new_with_prefix(staging_root.path())
        .expect("local object store");
    let staging: Arc<dyn StagingProvider> = Arc::new(ObjectStoreStaging::new(Arc::new(store)));

    let source: Arc<dyn Endpoint> = Arc::new(source);
    let sink = Arc::new(MockSinkEndpoint::new(
        EndpointId::parse("jdbc.warehouse").unwrap(),
        Arc::clone(&staging),
    ));

    let mut builder = EndpointRegistryBuilder::new();
    builder
        .register(
            EndpointId::parse("http.jira").unwrap(),
            &FixedFactory(source),
            &json!({"baseUrl": "https://jira.example"}),
        )
        .unwrap();
    builder
        .register(
            EndpointId::parse("jdbc.warehouse").unwrap(),
            &FixedFactory(Arc::clone(&sink) as Arc<dyn Endpoint>),
            &json!({}),
        )
        .unwrap();

    let checkpoint_root = staging_root.path().join("checkpoints");
    let checkpoints = Arc::new(FsCheckpointStore::new(checkpoint_root));

    let executor = IngestionExecutor::new(
        builder.build(),
        Arc::clone(&checkpoints) as Arc<dyn CheckpointStore>,
        StagingSelector::new(
            Some(staging),
            None,
            config.staging.memory_threshold_records,
        ),
        Arc::new(MemoryArtifactRegistry::new()) as Arc<dyn ArtifactRegistry>,
        executor_options(&config),
    );

    Pipeline {
        executor,
        checkpoints,
        sink,
        staging_root,
    }
}

fn source_with_issues() -> MockSourceEndpoint {
    MockSourceEndpoint::new(EndpointId::parse("http.jira").unwrap(), "issues", "updated")
        .with_concurrency_hint(1)
        .with_record(ts(2, 10), record(1, 2, 10))
        .with_record(ts(2, 10), record(2, 2, 10))
        .with_record(ts(3, 11), record(3, 3, 11))
}

#[tokio::test(start_paused = true)]
async fn full_run_then_incremental_resume() {
    let p = pipeline(source_with_issues());
    let key = CheckpointKey::parse("tenant/acme/project/main/http/cus-issues/updated").unwrap();

    // First run: no checkpoint, so the planner goes full.
    let mut first = request();
    first.data_mode = RunMode::Full;
    let (tx, _rx) = mpsc::channel(64);
    let result = p
        .executor
        .run(first, tx, CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(result.state, RunState::Succeeded);
    assert_eq!(result.counters.records_read, 3);
    assert_eq!(p.sink.written().len(), 3);

    let cp = p.checkpoints.get(&tenant(), &key).await.unwrap().unwrap();
    assert_eq!(cp.watermark(), Some(ts(3, 11)));

    // Second run with no source changes: incremental correctness means the
    // record set beyond the checkpoint is empty.
    let (tx, _rx) = mpsc::channel(64);
    let result = p
        .executor
        .run(request(), tx, CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(result.state, RunState::Succeeded);
    assert_eq!(result.counters.records_read, 0);
    assert_eq!(p.sink.written().len(), 3, "no duplicates on resume");

    // The watermark-based checkpoint still advanced (empty slice to now).
    let cp = p.checkpoints.get(&tenant(), &key).await.unwrap().unwrap();
    match cp.watermark() {
        Some(Watermark::Timestamp { at }) => {
            assert!(at >= Utc.with_ymd_and_hms(2025, 1, 3, 11, 0, 0).unwrap());
        }
        other => panic!("expected timestamp watermark, got {other:?}"),
    }
}

#[tokio::test(start_paused = true)]
async fn round_trip_preserves_envelopes_and_cleans_staging() {
    let p = pipeline(source_with_issues());

    let mut req = request();
    req.data_mode = RunMode::Full;
    let (tx, _rx) = mpsc::channel(64);
    let result = p
        .executor
        .run(req, tx, CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(result.state, RunState::Succeeded);

    // What the sink drained equals what the source emitted, field by field.
    let written = p.sink.written();
    assert_eq!(written.len(), 3);
    for (n, envelope) in written.iter().take(2).enumerate() {
        assert_eq!(envelope.source_id, format!("JIRA-{}", n + 1));
        assert_eq!(envelope.tenant_id, "acme");
        assert!(envelope.raw_source.is_some());
        assert!(envelope.source_url.is_some());
    }

    // Staged parts were deleted after the sink accepted them.
    let mut staged_files = Vec::new();
    let mut stack = vec![p.staging_root.path().join("ingestion")];
    while let Some(dir) = stack.pop() {
        let Ok(entries) = std::fs::read_dir(&dir) else { continue };
        for entry in entries.flatten() {
            let path = entry.path();
            if path.is_dir() {
                stack.push(path);
            } else if path.extension().and_then(|e| e.to_str()) == Some("gz") {
                staged_files.push(path);
            }
        }
    }
    assert!(staged_files.is_empty(), "leftover staging: {staged_files:?}");

    // Artifact row points at the sink materialization.
    assert_eq!(result.artifacts.len(), 1);
    assert_eq!(result.artifacts[0].artifact_kind, "sink");
    assert_eq!(result.artifacts[0].counters.records_written, 3);
}

#[tokio::test(start_paused = true)]
async fn tenant_mismatch_between_run_and_records_fails() {
    // The source emits envelopes for a different tenant than the run's
    // authenticated context; the sink must refuse them.
    let source = MockSourceEndpoint::new(
        EndpointId::parse("http.jira").unwrap(),
        "issues",
        "updated",
    )
    .with_record(
        ts(2, 10),
        RecordEnvelope::new("JIRA-1", "rival", Utc.with_ymd_and_hms(2025, 1, 2, 10, 0, 0).unwrap()),
    );
    let p = pipeline(source);

    let mut req = request();
    req.data_mode = RunMode::Full;
    let (tx, _rx) = mpsc::channel(64);
    let result = p
        .executor
        .run(req, tx, CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(result.state, RunState::Failed);
    assert_eq!(
        result.first_error.unwrap().code,
        ucl_core::ErrorCode::Validation
    );
    assert!(p.sink.written().is_empty());
}
