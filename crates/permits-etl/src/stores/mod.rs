//! Boundary traits for the four zone stores and the run-record store
//!
//! Every adapter classifies its client errors into the pipeline taxonomy at
//! this boundary, so stages only ever see `PipelineError`.

use async_trait::async_trait;
use permits_common::{PipelineError, Result, RunStage, RunStatus};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use crate::config::Config;
use crate::models::{
    CuratedDocument, FailureReason, IndexedEntry, RejectedRecord, RunKind, RunRecord, StagingRow,
    ValueCategory,
};

pub mod elasticsearch;
pub mod memory;
pub mod postgres;
pub mod s3;

pub use elasticsearch::ElasticsearchIndex;
pub use memory::{
    MemoryDocumentStore, MemoryObjectStore, MemoryRelationalStore, MemoryRunStore, MemorySearchIndex,
};
pub use postgres::PgStore;
pub use s3::S3ObjectStore;

// ============================================================================
// Object storage (raw zone)
// ============================================================================

/// Location and integrity data of a stored object
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectRef {
    pub bucket: String,
    pub key: String,
    pub checksum: String,
    pub size: u64,
}

#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Store `bytes` under `key`, replacing any previous object
    async fn put(&self, key: &str, bytes: Vec<u8>) -> Result<ObjectRef>;

    /// Fetch an object; `NotFound` if absent
    async fn get(&self, key: &str) -> Result<Vec<u8>>;

    async fn exists(&self, key: &str) -> Result<bool>;

    /// Number of objects under `prefix`
    async fn count(&self, prefix: &str) -> Result<u64>;
}

// ============================================================================
// Relational store (staging zone)
// ============================================================================

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotOutcome {
    pub upserted: usize,
    pub pruned: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct StagingSummary {
    pub row_count: u64,
    pub average_value: Option<f64>,
}

#[async_trait]
pub trait RelationalStore: Send + Sync {
    /// Atomically make `rows` the table's contents: upsert by permit id and
    /// drop ids absent from `rows`. The run's rejects are written in the
    /// same commit. Readers see either the old or the new snapshot.
    async fn replace_snapshot(
        &self,
        run_id: Uuid,
        rows: &[StagingRow],
        rejects: &[RejectedRecord],
    ) -> Result<SnapshotOutcome>;

    /// All rows ordered by permit id
    async fn fetch_rows(&self) -> Result<Vec<StagingRow>>;

    async fn summary(&self) -> Result<StagingSummary>;

    async fn rejected(&self, run_id: Uuid) -> Result<Vec<RejectedRecord>>;
}

// ============================================================================
// Document store (curated zone)
// ============================================================================

/// Conjunctive filter over curated documents; empty matches everything
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DocumentFilter {
    pub permit_ids: Option<Vec<String>>,
    pub value_category: Option<ValueCategory>,
    pub label: Option<String>,
}

impl DocumentFilter {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn matches(&self, doc: &CuratedDocument) -> bool {
        self.permit_ids
            .as_ref()
            .map_or(true, |ids| ids.iter().any(|id| id == &doc.permit_id))
            && self.value_category.map_or(true, |c| c == doc.value_category)
            && self
                .label
                .as_ref()
                .map_or(true, |label| doc.labels.iter().any(|l| l == label))
    }
}

#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Insert or replace documents by permit id
    async fn upsert_batch(&self, docs: &[CuratedDocument]) -> Result<usize>;

    /// Delete every document whose id is not in `keep`; returns the number removed
    async fn delete_except(&self, keep: &BTreeSet<String>) -> Result<usize>;

    /// Make `docs` the collection's contents. Stores with transactions
    /// override this to commit both halves at once.
    async fn replace_all(&self, docs: &[CuratedDocument]) -> Result<SnapshotOutcome> {
        let keep: BTreeSet<String> = docs.iter().map(|d| d.permit_id.clone()).collect();
        let upserted = self.upsert_batch(docs).await?;
        let pruned = self.delete_except(&keep).await?;
        Ok(SnapshotOutcome { upserted, pruned })
    }

    /// Matching documents ordered by permit id
    async fn find(&self, filter: &DocumentFilter) -> Result<Vec<CuratedDocument>>;

    async fn count(&self) -> Result<u64>;
}

// ============================================================================
// Search engine (indexed zone)
// ============================================================================

/// Field mapping of an index, in the engine's `properties` JSON shape
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexMapping {
    pub properties: serde_json::Map<String, serde_json::Value>,
}

impl IndexMapping {
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!({ "properties": self.properties })
    }
}

#[async_trait]
pub trait SearchIndex: Send + Sync {
    /// Create the index; a no-op if it exists with the same mapping and a
    /// `Schema` error if it exists with a different one
    async fn create_index(&self, name: &str, mapping: &IndexMapping) -> Result<()>;

    /// Drop the index; absent indices are not an error
    async fn delete_index(&self, name: &str) -> Result<()>;

    /// Insert or replace entries by permit id; visible to reads on return
    async fn bulk_upsert(&self, name: &str, entries: &[IndexedEntry]) -> Result<usize>;

    async fn bulk_delete(&self, name: &str, ids: &[String]) -> Result<usize>;

    async fn get(&self, name: &str, id: &str) -> Result<Option<IndexedEntry>>;

    /// permit id -> content hash for every entry; empty if the index is absent
    async fn content_hashes(&self, name: &str) -> Result<BTreeMap<String, String>>;

    /// Entry count; zero if the index is absent
    async fn count(&self, name: &str) -> Result<u64>;
}

// ============================================================================
// Run records
// ============================================================================

#[async_trait]
pub trait RunStore: Send + Sync {
    /// Open a run and take the dataset lock.
    ///
    /// In-progress runs idle for longer than `stale_after` are first marked
    /// failed as abandoned. A live in-progress run for the same dataset key
    /// yields `ConcurrencyConflict`.
    async fn begin_run(&self, dataset_key: &str, kind: RunKind, stale_after: Duration) -> Result<RunRecord>;

    /// Durably record the stage a run has completed.
    ///
    /// Refused with `Consistency` once the run is no longer in progress, so a
    /// run taken over as abandoned cannot keep advancing.
    async fn record_stage(&self, run_id: Uuid, stage: RunStage, rejected_count: Option<i64>) -> Result<RunRecord>;

    /// Close an in-progress run, releasing the dataset lock
    async fn finish_run(
        &self,
        run_id: Uuid,
        status: RunStatus,
        failure: Option<FailureReason>,
    ) -> Result<RunRecord>;

    async fn get_run(&self, run_id: Uuid) -> Result<Option<RunRecord>>;

    /// Most recently started run of any kind for a dataset
    async fn latest_run(&self, dataset_key: &str) -> Result<Option<RunRecord>>;

    /// Most recently started run of `kind` that succeeded
    async fn latest_succeeded(&self, dataset_key: &str, kind: RunKind) -> Result<Option<RunRecord>>;
}

/// The store handles one pipeline works against
#[derive(Clone)]
pub struct Stores {
    pub objects: Arc<dyn ObjectStore>,
    pub staging: Arc<dyn RelationalStore>,
    pub documents: Arc<dyn DocumentStore>,
    pub index: Arc<dyn SearchIndex>,
    pub runs: Arc<dyn RunStore>,
}

impl Stores {
    /// Fresh in-memory stores, for tests and local dry runs
    pub fn in_memory() -> Self {
        Self {
            objects: Arc::new(MemoryObjectStore::new("memory")),
            staging: Arc::new(MemoryRelationalStore::new()),
            documents: Arc::new(MemoryDocumentStore::new()),
            index: Arc::new(MemorySearchIndex::new()),
            runs: Arc::new(MemoryRunStore::new()),
        }
    }

    /// Connect to Postgres, S3 and Elasticsearch. Postgres backs the staging,
    /// curated and run-record stores; migrations run on connect.
    pub async fn connect(config: &Config) -> Result<Self> {
        let pg = Arc::new(PgStore::connect(&config.database, config.pipeline.collection.clone()).await?);

        let objects = S3ObjectStore::new(&config.storage).await?;
        objects.ensure_bucket().await?;

        let index = ElasticsearchIndex::new(&config.search)?;

        Ok(Self {
            objects: Arc::new(objects),
            staging: pg.clone(),
            documents: pg.clone(),
            index: Arc::new(index),
            runs: pg,
        })
    }
}

/// Error for a transition attempted on a run that is no longer in progress
pub(crate) fn run_closed(run: &RunRecord) -> PipelineError {
    PipelineError::consistency(format!(
        "run {} is {}, no longer in progress",
        run.run_id, run.status
    ))
}

/// Failure reason recorded for a run taken over after going stale
pub(crate) fn abandoned_reason(run: &RunRecord) -> FailureReason {
    FailureReason {
        step: run.stage.as_str().to_string(),
        kind: permits_common::ErrorKind::Cancelled,
        affected_records: 0,
        attempts: 0,
        message: "abandoned".to_string(),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::models::{EnrichmentStatus, GeoStatus, PermitClass};
    use chrono::NaiveDate;

    fn doc(id: &str, category: ValueCategory, labels: &[&str]) -> CuratedDocument {
        CuratedDocument {
            permit_id: id.to_string(),
            application_type: None,
            building_type: None,
            value: 1.0,
            ward: None,
            description: None,
            issued_date: NaiveDate::from_ymd_opt(2024, 1, 1).unwrap(),
            location: None,
            contractor: None,
            permit_class: PermitClass::Construction,
            value_category: category,
            labels: labels.iter().map(|l| l.to_string()).collect(),
            geo_point: None,
            geo_status: GeoStatus::Missing,
            enrichment: EnrichmentStatus::Complete,
        }
    }

    #[test]
    fn test_filter_is_conjunctive() {
        let d = doc("P1", ValueCategory::High, &["pool"]);
        assert!(DocumentFilter::all().matches(&d));

        let filter = DocumentFilter {
            value_category: Some(ValueCategory::High),
            label: Some("pool".to_string()),
            ..DocumentFilter::default()
        };
        assert!(filter.matches(&d));

        let filter = DocumentFilter {
            value_category: Some(ValueCategory::High),
            label: Some("deck".to_string()),
            ..DocumentFilter::default()
        };
        assert!(!filter.matches(&d));

        let filter = DocumentFilter {
            permit_ids: Some(vec!["P2".to_string()]),
            ..DocumentFilter::default()
        };
        assert!(!filter.matches(&d));
    }
}
