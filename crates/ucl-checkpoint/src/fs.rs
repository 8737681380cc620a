// SPDX-License-Identifier: MIT OR Apache-2.0
//! Filesystem-backed checkpoint store.
//!
//! One JSON document per key, laid out as directories mirroring the key
//! segments. A store-wide mutex serializes the read-compare-write of each
//! put; writes land via temp-file-and-rename so readers never observe a
//! torn document.

use crate::{
    AuditRecord, CheckpointStore, PutRequest, StoreError, apply_put, emit_expiry_audit,
};
use async_trait::async_trait;
use chrono::Utc;
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;
use ucl_core::{Checkpoint, CheckpointKey, TenantContext};

/// Checkpoint store rooted at a directory.
pub struct FsCheckpointStore {
    root: PathBuf,
    lock: Mutex<Vec<AuditRecord>>,
}

impl FsCheckpointStore {
    /// Create a store rooted at `root`. The directory is created lazily.
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            lock: Mutex::new(Vec::new()),
        }
    }

    /// Audit records emitted so far, oldest first.
    pub async fn audit_log(&self) -> Vec<AuditRecord> {
        self.lock.lock().await.clone()
    }

    fn path_for(&self, key: &CheckpointKey) -> PathBuf {
        let mut path = self.root.clone();
        for segment in key.as_str().split('/') {
            path.push(segment);
        }
        // Append rather than set_extension: key segments may contain dots.
        let mut os = path.into_os_string();
        os.push(".json");
        PathBuf::from(os)
    }

    async fn read_entry(&self, path: &Path) -> Result<Option<Checkpoint>, StoreError> {
        match tokio::fs::read_to_string(path).await {
            Ok(json) => {
                let cp = serde_json::from_str(&json)
                    .map_err(|e| StoreError::Backend(format!("parse {}: {e}", path.display())))?;
                Ok(Some(cp))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(StoreError::Backend(format!(
                "read {}: {e}",
                path.display()
            ))),
        }
    }

    async fn write_entry(&self, path: &Path, cp: &Checkpoint) -> Result<(), StoreError> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| StoreError::Backend(format!("mkdir {}: {e}", parent.display())))?;
        }
        let json = serde_json::to_string_pretty(cp)
            .map_err(|e| StoreError::Backend(format!("serialize checkpoint: {e}")))?;
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, json)
            .await
            .map_err(|e| StoreError::Backend(format!("write {}: {e}", tmp.display())))?;
        tokio::fs::rename(&tmp, path)
            .await
            .map_err(|e| StoreError::Backend(format!("rename {}: {e}", path.display())))?;
        Ok(())
    }

    async fn remove_entry(&self, path: &Path) -> Result<(), StoreError> {
        tokio::fs::remove_file(path)
            .await
            .map_err(|e| StoreError::Backend(format!("remove {}: {e}", path.display())))
    }
}

#[async_trait]
impl CheckpointStore for FsCheckpointStore {
    async fn get(
        &self,
        tenant: &TenantContext,
        key: &CheckpointKey,
    ) -> Result<Option<Checkpoint>, StoreError> {
        key.ensure_tenant(tenant)?;
        let mut audit = self.lock.lock().await;
        let path = self.path_for(key);
        match self.read_entry(&path).await? {
            Some(cp) if cp.is_expired(Utc::now()) => {
                self.remove_entry(&path).await?;
                audit.push(emit_expiry_audit(key, cp.version));
                Ok(None)
            }
            other => Ok(other),
        }
    }

    async fn put(
        &self,
        tenant: &TenantContext,
        key: &CheckpointKey,
        req: PutRequest,
    ) -> Result<u64, StoreError> {
        key.ensure_tenant(tenant)?;
        let mut audit = self.lock.lock().await;
        let path = self.path_for(key);
        let mut existing = self.read_entry(&path).await?;
        if let Some(cp) = &existing {
            if cp.is_expired(Utc::now()) {
                self.remove_entry(&path).await?;
                audit.push(emit_expiry_audit(key, cp.version));
                existing = None;
            }
        }
        let next = apply_put(key, existing.as_ref(), &req)?;
        let version = next.version;
        self.write_entry(&path, &next).await?;
        Ok(version)
    }

    async fn delete(
        &self,
        tenant: &TenantContext,
        key: &CheckpointKey,
        expected_version: u64,
    ) -> Result<(), StoreError> {
        key.ensure_tenant(tenant)?;
        let _audit = self.lock.lock().await;
        let path = self.path_for(key);
        match self.read_entry(&path).await? {
            None => Err(StoreError::NotFound { key: key.clone() }),
            Some(cp) if cp.version != expected_version => Err(StoreError::VersionConflict {
                key: key.clone(),
                expected: expected_version,
                current: cp.version,
                current_value: cp.value,
            }),
            Some(_) => self.remove_entry(&path).await,
        }
    }

    async fn list_keys(
        &self,
        tenant: &TenantContext,
        prefix: &str,
        limit: usize,
    ) -> Result<Vec<CheckpointKey>, StoreError> {
        let tenant_prefix = CheckpointKey::tenant_prefix(tenant);
        if !prefix.starts_with(&tenant_prefix) {
            return Err(StoreError::InvalidKey(ucl_core::InvalidKey::TenantMismatch {
                key: prefix.to_string(),
                tenant: tenant.tenant_id.clone(),
                project: tenant.project_id.clone(),
            }));
        }
        let mut keys = Vec::new();
        let mut stack = vec![self.root.clone()];
        while let Some(dir) = stack.pop() {
            let mut entries = match tokio::fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => {
                    return Err(StoreError::Backend(format!(
                        "read dir {}: {e}",
                        dir.display()
                    )));
                }
            };
            while let Some(entry) = entries
                .next_entry()
                .await
                .map_err(|e| StoreError::Backend(format!("read dir entry: {e}")))?
            {
                let path = entry.path();
                if path.is_dir() {
                    stack.push(path);
                } else if path.extension().and_then(|e| e.to_str()) == Some("json") {
                    let raw = path
                        .with_extension("")
                        .strip_prefix(&self.root)
                        .map(|p| p.to_string_lossy().replace('\\', "/"))
                        .unwrap_or_default();
                    if raw.starts_with(prefix) {
                        keys.push(CheckpointKey::parse(raw)?);
                    }
                }
            }
        }
        keys.sort();
        keys.truncate(limit);
        Ok(keys)
    }
}
