// SPDX-License-Identifier: MIT OR Apache-2.0
//! Per-unit run lease.
//!
//! A lease is an ordinary checkpoint row at `…/<family>/locks/<unitId>`
//! whose value names the holder and whose TTL (2 × max slice duration)
//! provides crash recovery: a run that dies without releasing is stolen
//! once the store soft-deletes the expired row.

use crate::store_error_to_endpoint;
use chrono::Utc;
use tracing::{debug, warn};
use ucl_checkpoint::{CheckpointStore, PutRequest, StoreError};
use ucl_core::{CheckpointKey, EndpointError, EndpointResult, ErrorCode, TenantContext};
use uuid::Uuid;

/// A held run lease.
#[derive(Debug)]
pub struct Lease {
    key: CheckpointKey,
    version: u64,
    holder: Uuid,
}

impl Lease {
    /// Acquire the lease for a unit, failing closed when another run holds it.
    pub async fn acquire(
        store: &dyn CheckpointStore,
        tenant: &TenantContext,
        family: &str,
        unit_id: &str,
        run_id: Uuid,
        ttl_seconds: u64,
    ) -> EndpointResult<Self> {
        let key = CheckpointKey::for_lease(tenant, family, unit_id)?;
        if let Some(existing) = store
            .get(tenant, &key)
            .await
            .map_err(store_error_to_endpoint)?
        {
            return Err(EndpointError::new(
                ErrorCode::Conflict,
                format!("another run holds the lease for unit {unit_id:?}"),
            )
            .with_detail("lease", key.as_str())
            .with_detail("holder", existing.last_writer));
        }

        let value = serde_json::json!({
            "holder": run_id,
            "acquiredAt": Utc::now().to_rfc3339(),
        });
        let put = PutRequest::new(value, 0)
            .writer(run_id.to_string(), run_id.to_string())
            .ttl(ttl_seconds)
            .semantics("lease");
        match store.put(tenant, &key, put).await {
            Ok(version) => {
                debug!(target: "ucl.executor.lease", lease = %key, run = %run_id, "lease acquired");
                Ok(Self {
                    key,
                    version,
                    holder: run_id,
                })
            }
            Err(StoreError::VersionConflict { .. }) => Err(EndpointError::new(
                ErrorCode::Conflict,
                format!("lost the lease race for unit {unit_id:?}"),
            )),
            Err(other) => Err(store_error_to_endpoint(other)),
        }
    }

    /// Release the lease. Best effort: an expired-and-stolen lease is not
    /// ours to delete anymore, and that is fine.
    pub async fn release(self, store: &dyn CheckpointStore, tenant: &TenantContext) {
        match store.delete(tenant, &self.key, self.version).await {
            Ok(()) => {
                debug!(target: "ucl.executor.lease", lease = %self.key, run = %self.holder, "lease released");
            }
            Err(err) => {
                warn!(
                    target: "ucl.executor.lease",
                    lease = %self.key,
                    run = %self.holder,
                    error = %err,
                    "lease release skipped"
                );
            }
        }
    }
}
