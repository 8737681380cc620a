// SPDX-License-Identifier: MIT OR Apache-2.0
//! Materialized-artifact registry.
//!
//! On successful run completion the executor writes one row per
//! `(tenantId, sourceRunId, artifactKind)` pointing at the sink location.
//! Writes are idempotent on that key, so a re-delivered completion is
//! harmless.

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::debug;
use ucl_core::{EndpointError, EndpointResult, ErrorCode, MaterializedArtifact, slug};
use uuid::Uuid;

/// The artifact registry contract.
#[async_trait]
pub trait ArtifactRegistry: Send + Sync {
    /// Idempotently upsert one artifact row.
    async fn record(&self, artifact: MaterializedArtifact) -> EndpointResult<()>;

    /// Fetch one row by its identity.
    async fn get(
        &self,
        tenant_id: &str,
        source_run_id: Uuid,
        artifact_kind: &str,
    ) -> EndpointResult<Option<MaterializedArtifact>>;

    /// All rows for a tenant, in key order.
    async fn list(&self, tenant_id: &str) -> EndpointResult<Vec<MaterializedArtifact>>;
}

/// Process-local artifact registry.
#[derive(Default)]
pub struct MemoryArtifactRegistry {
    rows: Mutex<BTreeMap<(String, Uuid, String), MaterializedArtifact>>,
}

impl MemoryArtifactRegistry {
    /// An empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ArtifactRegistry for MemoryArtifactRegistry {
    async fn record(&self, artifact: MaterializedArtifact) -> EndpointResult<()> {
        let key = artifact.identity();
        debug!(
            target: "ucl.executor.artifact",
            tenant = %artifact.tenant_id,
            run = %artifact.source_run_id,
            kind = %artifact.artifact_kind,
            "recording artifact"
        );
        self.rows.lock().expect("artifact rows").insert(key, artifact);
        Ok(())
    }

    async fn get(
        &self,
        tenant_id: &str,
        source_run_id: Uuid,
        artifact_kind: &str,
    ) -> EndpointResult<Option<MaterializedArtifact>> {
        let key = (
            tenant_id.to_string(),
            source_run_id,
            artifact_kind.to_string(),
        );
        Ok(self.rows.lock().expect("artifact rows").get(&key).cloned())
    }

    async fn list(&self, tenant_id: &str) -> EndpointResult<Vec<MaterializedArtifact>> {
        Ok(self
            .rows
            .lock()
            .expect("artifact rows")
            .values()
            .filter(|row| row.tenant_id == tenant_id)
            .cloned()
            .collect())
    }
}

/// Filesystem-backed artifact registry.
///
/// One JSON document per row at
/// `<root>/<tenantId>/<sourceRunId>/<artifactKind>.json`, written via
/// temp-file-and-rename so readers never observe a torn document. The
/// overwrite-on-rename is what makes `record` idempotent on the identity
/// key.
pub struct FsArtifactRegistry {
    root: PathBuf,
    lock: tokio::sync::Mutex<()>,
}

impl FsArtifactRegistry {
    /// Create a registry rooted at `root`. Directories are created lazily.
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            lock: tokio::sync::Mutex::new(()),
        }
    }

    fn path_for(&self, tenant_id: &str, source_run_id: Uuid, artifact_kind: &str) -> PathBuf {
        self.root
            .join(slug(tenant_id))
            .join(source_run_id.to_string())
            .join(format!("{}.json", slug(artifact_kind)))
    }

    async fn read_row(&self, path: &Path) -> EndpointResult<Option<MaterializedArtifact>> {
        match tokio::fs::read_to_string(path).await {
            Ok(json) => {
                let row = serde_json::from_str(&json).map_err(|e| {
                    backend_error(format!("parse artifact {}: {e}", path.display()))
                })?;
                Ok(Some(row))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(backend_error(format!(
                "read artifact {}: {e}",
                path.display()
            ))),
        }
    }
}

fn backend_error(message: String) -> EndpointError {
    EndpointError::new(ErrorCode::EndpointUnreachable, message)
}

#[async_trait]
impl ArtifactRegistry for FsArtifactRegistry {
    async fn record(&self, artifact: MaterializedArtifact) -> EndpointResult<()> {
        let _guard = self.lock.lock().await;
        let path = self.path_for(
            &artifact.tenant_id,
            artifact.source_run_id,
            &artifact.artifact_kind,
        );
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| backend_error(format!("mkdir {}: {e}", parent.display())))?;
        }
        let json = serde_json::to_string_pretty(&artifact)
            .map_err(|e| backend_error(format!("serialize artifact: {e}")))?;
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, json)
            .await
            .map_err(|e| backend_error(format!("write {}: {e}", tmp.display())))?;
        tokio::fs::rename(&tmp, &path)
            .await
            .map_err(|e| backend_error(format!("rename {}: {e}", path.display())))?;
        debug!(
            target: "ucl.executor.artifact",
            tenant = %artifact.tenant_id,
            run = %artifact.source_run_id,
            kind = %artifact.artifact_kind,
            path = %path.display(),
            "recorded artifact"
        );
        Ok(())
    }

    async fn get(
        &self,
        tenant_id: &str,
        source_run_id: Uuid,
        artifact_kind: &str,
    ) -> EndpointResult<Option<MaterializedArtifact>> {
        let path = self.path_for(tenant_id, source_run_id, artifact_kind);
        self.read_row(&path).await
    }

    async fn list(&self, tenant_id: &str) -> EndpointResult<Vec<MaterializedArtifact>> {
        let tenant_dir = self.root.join(slug(tenant_id));
        let mut rows = Vec::new();
        let mut stack = vec![tenant_dir];
        while let Some(dir) = stack.pop() {
            let mut entries = match tokio::fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => {
                    return Err(backend_error(format!("read dir {}: {e}", dir.display())));
                }
            };
            while let Some(entry) = entries
                .next_entry()
                .await
                .map_err(|e| backend_error(format!("read dir entry: {e}")))?
            {
                let path = entry.path();
                if path.is_dir() {
                    stack.push(path);
                } else if path.extension().and_then(|e| e.to_str()) == Some("json") {
                    if let Some(row) = self.read_row(&path).await? {
                        rows.push(row);
                    }
                }
            }
        }
        rows.sort_by_key(MaterializedArtifact::identity);
        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ucl_core::RunCounters;

    fn artifact(run: Uuid, kind: &str, handle: &str) -> MaterializedArtifact {
        MaterializedArtifact {
            tenant_id: "acme".into(),
            source_run_id: run,
            artifact_kind: kind.into(),
            handle: handle.into(),
            canonical_meta: BTreeMap::new(),
            counters: RunCounters::default(),
        }
    }

    #[tokio::test]
    async fn record_is_idempotent_on_identity() {
        let registry = MemoryArtifactRegistry::new();
        let run = Uuid::new_v4();
        registry.record(artifact(run, "sink", "first")).await.unwrap();
        registry.record(artifact(run, "sink", "second")).await.unwrap();

        let rows = registry.list("acme").await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].handle, "second");
    }

    #[tokio::test]
    async fn rows_are_scoped_by_tenant() {
        let registry = MemoryArtifactRegistry::new();
        let run = Uuid::new_v4();
        registry.record(artifact(run, "sink", "h")).await.unwrap();
        assert!(registry.list("rival").await.unwrap().is_empty());
        assert!(
            registry
                .get("acme", run, "sink")
                .await
                .unwrap()
                .is_some()
        );
        assert!(registry.get("acme", run, "staging").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn fs_registry_round_trips_and_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let run = Uuid::new_v4();
        {
            let registry = FsArtifactRegistry::new(dir.path());
            registry
                .record(artifact(run, "sink", "relational://warehouse/issues"))
                .await
                .unwrap();
        }
        let registry = FsArtifactRegistry::new(dir.path());
        let row = registry.get("acme", run, "sink").await.unwrap().unwrap();
        assert_eq!(row.handle, "relational://warehouse/issues");
        assert!(registry.get("acme", run, "staging").await.unwrap().is_none());
        assert!(registry.list("rival").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn fs_registry_record_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let registry = FsArtifactRegistry::new(dir.path());
        let run = Uuid::new_v4();
        registry.record(artifact(run, "sink", "first")).await.unwrap();
        registry.record(artifact(run, "sink", "second")).await.unwrap();
        registry
            .record(artifact(run, "staging", "s3://bucket/prefix"))
            .await
            .unwrap();

        let rows = registry.list("acme").await.unwrap();
        assert_eq!(rows.len(), 2);
        let sink = registry.get("acme", run, "sink").await.unwrap().unwrap();
        assert_eq!(sink.handle, "second");
    }
}
