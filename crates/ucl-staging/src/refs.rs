// SPDX-License-Identifier: MIT OR Apache-2.0
//! Staging reference grammar.
//!
//! ```text
//! <scheme>://<bucket>/ingestion/<tenantId>/<datasetSlug>/dt=<YYYY-MM-DD>/run=<runId>/part-<NNNN>.jsonl.gz
//! ```
//!
//! A [`StageRef`] names the per-run prefix (everything up to `run=<runId>`);
//! a [`BatchRef`] names one sealed part underneath it. Staging URIs are
//! globally unique per run (the run id is part of the prefix), so no two
//! runs ever race on the same reference.

use crate::StagingError;
use chrono::NaiveDate;
use object_store::path::Path as ObjectPath;
use std::fmt;
use ucl_core::{TenantContext, slug};
use uuid::Uuid;

/// The per-run staging prefix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageRef {
    /// URI scheme (`s3`, `gs`, `file`, `mem`).
    pub scheme: String,
    /// Bucket (or bucket-equivalent namespace).
    pub bucket: String,
    /// Owning tenant id.
    pub tenant_id: String,
    /// Slugged dataset name.
    pub dataset_slug: String,
    /// Partition date (UTC).
    pub date: NaiveDate,
    /// The run this prefix belongs to.
    pub run_id: Uuid,
}

impl StageRef {
    /// Build the staging prefix for a run.
    #[must_use]
    pub fn new(
        scheme: impl Into<String>,
        bucket: impl Into<String>,
        tenant: &TenantContext,
        dataset_id: &str,
        date: NaiveDate,
        run_id: Uuid,
    ) -> Self {
        Self {
            scheme: scheme.into(),
            bucket: bucket.into(),
            tenant_id: tenant.tenant_id.clone(),
            dataset_slug: slug(dataset_id),
            date,
            run_id,
        }
    }

    /// Parse a staging prefix URI.
    pub fn parse(uri: &str) -> Result<Self, StagingError> {
        let bad = |reason: &str| StagingError::InvalidRef {
            uri: uri.to_string(),
            reason: reason.to_string(),
        };
        let (scheme, rest) = uri.split_once("://").ok_or_else(|| bad("missing scheme"))?;
        let mut segments = rest.split('/');
        let bucket = segments.next().filter(|s| !s.is_empty()).ok_or_else(|| bad("missing bucket"))?;
        if segments.next() != Some("ingestion") {
            return Err(bad("expected ingestion/ segment"));
        }
        let tenant_id = segments.next().filter(|s| !s.is_empty()).ok_or_else(|| bad("missing tenant"))?;
        let dataset_slug = segments.next().filter(|s| !s.is_empty()).ok_or_else(|| bad("missing dataset"))?;
        let date = segments
            .next()
            .and_then(|s| s.strip_prefix("dt="))
            .and_then(|s| NaiveDate::parse_from_str(s, "%Y-%m-%d").ok())
            .ok_or_else(|| bad("missing or malformed dt= segment"))?;
        let run_id = segments
            .next()
            .and_then(|s| s.strip_prefix("run="))
            .and_then(|s| Uuid::parse_str(s).ok())
            .ok_or_else(|| bad("missing or malformed run= segment"))?;
        if segments.next().is_some() {
            return Err(bad("trailing segments after run="));
        }
        Ok(Self {
            scheme: scheme.to_string(),
            bucket: bucket.to_string(),
            tenant_id: tenant_id.to_string(),
            dataset_slug: dataset_slug.to_string(),
            date,
            run_id,
        })
    }

    /// Render the prefix URI.
    #[must_use]
    pub fn uri(&self) -> String {
        format!(
            "{}://{}/ingestion/{}/{}/dt={}/run={}",
            self.scheme,
            self.bucket,
            self.tenant_id,
            self.dataset_slug,
            self.date.format("%Y-%m-%d"),
            self.run_id
        )
    }

    /// The bucket-relative object prefix for this run.
    #[must_use]
    pub fn object_prefix(&self) -> ObjectPath {
        ObjectPath::from(format!(
            "ingestion/{}/{}/dt={}/run={}",
            self.tenant_id,
            self.dataset_slug,
            self.date.format("%Y-%m-%d"),
            self.run_id
        ))
    }

    /// The batch reference for `part`.
    #[must_use]
    pub fn batch(&self, part: u32) -> BatchRef {
        BatchRef {
            stage: self.clone(),
            part,
        }
    }
}

impl fmt::Display for StageRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.uri())
    }
}

/// One sealed, immutable part under a [`StageRef`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchRef {
    /// The owning staging prefix.
    pub stage: StageRef,
    /// Zero-indexed part number.
    pub part: u32,
}

impl BatchRef {
    /// Parse a batch URI (`…/run=<id>/part-<NNNN>.jsonl.gz`).
    pub fn parse(uri: &str) -> Result<Self, StagingError> {
        let bad = |reason: &str| StagingError::InvalidRef {
            uri: uri.to_string(),
            reason: reason.to_string(),
        };
        let (prefix, file) = uri.rsplit_once('/').ok_or_else(|| bad("missing part segment"))?;
        let part = file
            .strip_prefix("part-")
            .and_then(|s| s.strip_suffix(".jsonl.gz"))
            .and_then(|s| s.parse::<u32>().ok())
            .ok_or_else(|| bad("malformed part-<NNNN>.jsonl.gz file name"))?;
        Ok(Self {
            stage: StageRef::parse(prefix)?,
            part,
        })
    }

    /// Render the batch URI.
    #[must_use]
    pub fn uri(&self) -> String {
        format!("{}/{}", self.stage.uri(), self.file_name())
    }

    /// The bucket-relative object path of this part.
    #[must_use]
    pub fn object_path(&self) -> ObjectPath {
        ObjectPath::from(format!(
            "{}/{}",
            self.stage.object_prefix(),
            self.file_name()
        ))
    }

    fn file_name(&self) -> String {
        format!("part-{:04}.jsonl.gz", self.part)
    }
}

impl fmt::Display for BatchRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.uri())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stage() -> StageRef {
        let tenant = TenantContext::new("acme", "main").unwrap();
        StageRef::new(
            "s3",
            "ucl-staging",
            &tenant,
            "CUS-issues",
            NaiveDate::from_ymd_opt(2025, 1, 3).unwrap(),
            Uuid::nil(),
        )
    }

    #[test]
    fn uri_round_trip() {
        let stage = stage();
        let uri = stage.uri();
        assert_eq!(
            uri,
            format!(
                "s3://ucl-staging/ingestion/acme/cus-issues/dt=2025-01-03/run={}",
                Uuid::nil()
            )
        );
        assert_eq!(StageRef::parse(&uri).unwrap(), stage);
    }

    #[test]
    fn batch_uri_round_trip() {
        let batch = stage().batch(1);
        let uri = batch.uri();
        assert!(uri.ends_with("/part-0001.jsonl.gz"));
        assert_eq!(BatchRef::parse(&uri).unwrap(), batch);
    }

    #[test]
    fn object_paths_are_bucket_relative() {
        let batch = stage().batch(0);
        let path = batch.object_path().to_string();
        assert!(path.starts_with("ingestion/acme/cus-issues/dt=2025-01-03/"));
        assert!(!path.contains("s3://"));
    }

    #[test]
    fn malformed_uris_are_rejected() {
        for uri in [
            "no-scheme/bucket/ingestion/t/d/dt=2025-01-01/run=x",
            "s3://bucket/wrong/t/d/dt=2025-01-01/run=00000000-0000-0000-0000-000000000000",
            "s3://bucket/ingestion/t/d/dt=bad/run=00000000-0000-0000-0000-000000000000",
            "s3://bucket/ingestion/t/d/dt=2025-01-01/run=not-a-uuid",
        ] {
            assert!(StageRef::parse(uri).is_err(), "{uri} should not parse");
        }
        assert!(BatchRef::parse("s3://bucket/ingestion/t/d/dt=2025-01-01/run=00000000-0000-0000-0000-000000000000/part-xx.jsonl.gz").is_err());
    }
}
