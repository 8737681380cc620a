// SPDX-License-Identifier: MIT OR Apache-2.0
//! In-memory checkpoint store.
//!
//! Linearizability comes from holding the map mutex across the whole
//! read-compare-write of a put.

use crate::{
    AuditRecord, CheckpointStore, PutRequest, StoreError, apply_put, emit_expiry_audit,
};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::BTreeMap;
use tokio::sync::Mutex;
use ucl_core::{Checkpoint, CheckpointKey, TenantContext};

#[derive(Default)]
struct Inner {
    entries: BTreeMap<String, Checkpoint>,
    audit: Vec<AuditRecord>,
}

/// A process-local checkpoint store backed by a `BTreeMap`.
#[derive(Default)]
pub struct MemoryCheckpointStore {
    inner: Mutex<Inner>,
}

impl MemoryCheckpointStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Audit records emitted so far, oldest first.
    pub async fn audit_log(&self) -> Vec<AuditRecord> {
        self.inner.lock().await.audit.clone()
    }
}

#[async_trait]
impl CheckpointStore for MemoryCheckpointStore {
    async fn get(
        &self,
        tenant: &TenantContext,
        key: &CheckpointKey,
    ) -> Result<Option<Checkpoint>, StoreError> {
        key.ensure_tenant(tenant)?;
        let mut inner = self.inner.lock().await;
        if let Some(cp) = inner.entries.get(key.as_str()) {
            if cp.is_expired(Utc::now()) {
                let version = cp.version;
                inner.entries.remove(key.as_str());
                let record = emit_expiry_audit(key, version);
                inner.audit.push(record);
                return Ok(None);
            }
            return Ok(Some(cp.clone()));
        }
        Ok(None)
    }

    async fn put(
        &self,
        tenant: &TenantContext,
        key: &CheckpointKey,
        req: PutRequest,
    ) -> Result<u64, StoreError> {
        key.ensure_tenant(tenant)?;
        let mut inner = self.inner.lock().await;
        // An expired entry behaves as absent for CAS purposes.
        if let Some(cp) = inner.entries.get(key.as_str()) {
            if cp.is_expired(Utc::now()) {
                let version = cp.version;
                inner.entries.remove(key.as_str());
                let record = emit_expiry_audit(key, version);
                inner.audit.push(record);
            }
        }
        let existing = inner.entries.get(key.as_str()).cloned();
        let next = apply_put(key, existing.as_ref(), &req)?;
        let version = next.version;
        inner.entries.insert(key.as_str().to_string(), next);
        Ok(version)
    }

    async fn delete(
        &self,
        tenant: &TenantContext,
        key: &CheckpointKey,
        expected_version: u64,
    ) -> Result<(), StoreError> {
        key.ensure_tenant(tenant)?;
        let mut inner = self.inner.lock().await;
        match inner.entries.get(key.as_str()) {
            None => Err(StoreError::NotFound { key: key.clone() }),
            Some(cp) if cp.version != expected_version => Err(StoreError::VersionConflict {
                key: key.clone(),
                expected: expected_version,
                current: cp.version,
                current_value: cp.value.clone(),
            }),
            Some(_) => {
                inner.entries.remove(key.as_str());
                Ok(())
            }
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
        let inner = self.inner.lock().await;
        let mut keys = Vec::new();
        for raw in inner.entries.keys() {
            if raw.starts_with(prefix) {
                keys.push(CheckpointKey::parse(raw.clone())?);
                if keys.len() >= limit {
                    break;
                }
            }
        }
        Ok(keys)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn tenant() -> TenantContext {
        TenantContext::new("acme", "main").unwrap()
    }

    fn key(suffix: &str) -> CheckpointKey {
        CheckpointKey::parse(format!("tenant/acme/project/main/http/{suffix}")).unwrap()
    }

    #[tokio::test]
    async fn first_create_requires_expected_zero() {
        let store = MemoryCheckpointStore::new();
        let t = tenant();
        let k = key("u1/updated");

        let err = store
            .put(&t, &k, PutRequest::new(json!({"updated": "x"}), 3))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            StoreError::VersionConflict { current: 0, expected: 3, .. }
        ));

        let v = store
            .put(&t, &k, PutRequest::new(json!({"updated": "x"}), 0))
            .await
            .unwrap();
        assert_eq!(v, 1);
    }

    #[tokio::test]
    async fn versions_increase_monotonically() {
        let store = MemoryCheckpointStore::new();
        let t = tenant();
        let k = key("u1/updated");
        let mut version = 0;
        for i in 0..5 {
            version = store
                .put(
                    &t,
                    &k,
                    PutRequest::new(json!({ "updated": i }), version)
                        .writer("exec-1", format!("req-{i}")),
                )
                .await
                .unwrap();
        }
        assert_eq!(version, 5);
        let cp = store.get(&t, &k).await.unwrap().unwrap();
        assert_eq!(cp.version, 5);
        assert_eq!(cp.last_writer, "exec-1");
    }

    #[tokio::test]
    async fn conflict_carries_current_state() {
        let store = MemoryCheckpointStore::new();
        let t = tenant();
        let k = key("u1/updated");
        store
            .put(&t, &k, PutRequest::new(json!({"updated": "a"}), 0))
            .await
            .unwrap();

        let err = store
            .put(&t, &k, PutRequest::new(json!({"updated": "b"}), 0))
            .await
            .unwrap_err();
        match err {
            StoreError::VersionConflict {
                current,
                current_value,
                ..
            } => {
                assert_eq!(current, 1);
                assert_eq!(current_value, json!({"updated": "a"}));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn ttl_soft_deletes_on_read_and_audits() {
        let store = MemoryCheckpointStore::new();
        let t = tenant();
        let k = key("locks/u1");
        store
            .put(
                &t,
                &k,
                PutRequest::new(json!({"holder": "run-1"}), 0)
                    .ttl(0)
                    .semantics("lease"),
            )
            .await
            .unwrap();

        assert!(store.get(&t, &k).await.unwrap().is_none());
        let audit = store.audit_log().await;
        assert_eq!(audit.len(), 1);
        assert_eq!(audit[0].action, crate::AuditAction::ExpiredOnRead);

        // The slot is free again: expected_version = 0 succeeds.
        let v = store
            .put(&t, &k, PutRequest::new(json!({"holder": "run-2"}), 0))
            .await
            .unwrap();
        assert_eq!(v, 1);
    }

    #[tokio::test]
    async fn delete_requires_matching_version() {
        let store = MemoryCheckpointStore::new();
        let t = tenant();
        let k = key("u1/updated");
        store
            .put(&t, &k, PutRequest::new(json!({"updated": "a"}), 0))
            .await
            .unwrap();

        assert!(matches!(
            store.delete(&t, &k, 9).await.unwrap_err(),
            StoreError::VersionConflict { .. }
        ));
        store.delete(&t, &k, 1).await.unwrap();
        assert!(matches!(
            store.delete(&t, &k, 1).await.unwrap_err(),
            StoreError::NotFound { .. }
        ));
    }

    #[tokio::test]
    async fn list_keys_filters_by_prefix_and_limit() {
        let store = MemoryCheckpointStore::new();
        let t = tenant();
        for unit in ["u1", "u2", "u3"] {
            store
                .put(
                    &t,
                    &key(&format!("{unit}/updated")),
                    PutRequest::new(json!({}), 0),
                )
                .await
                .unwrap();
        }
        let keys = store
            .list_keys(&t, "tenant/acme/project/main/http/", 2)
            .await
            .unwrap();
        assert_eq!(keys.len(), 2);
        assert!(keys[0].as_str() < keys[1].as_str());
    }

    #[tokio::test]
    async fn cross_tenant_access_is_rejected() {
        let store = MemoryCheckpointStore::new();
        let t = tenant();
        let k = key("u1/updated");
        store
            .put(&t, &k, PutRequest::new(json!({}), 0))
            .await
            .unwrap();

        let rival = TenantContext::new("rival", "main").unwrap();
        assert!(store.get(&rival, &k).await.is_err());
        assert!(store
            .put(&rival, &k, PutRequest::new(json!({}), 1))
            .await
            .is_err());
        assert!(store
            .list_keys(&rival, "tenant/acme/project/main/", 10)
            .await
            .is_err());
    }
}
