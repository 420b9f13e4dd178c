//! In-memory store implementations for tests and local dry runs.
//!
//! Each store keeps its state behind a `std::sync::Mutex` and applies a
//! whole call under one lock, so every write is atomic. Failures can be
//! queued with [`Faults::push`] to exercise retry and recovery paths.

use async_trait::async_trait;
use chrono::Utc;
use permits_common::{checksum, PipelineError, Result, RunStage, RunStatus};
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use uuid::Uuid;

use super::{
    abandoned_reason, run_closed, DocumentFilter, DocumentStore, IndexMapping, ObjectRef, ObjectStore,
    RelationalStore, RunStore, SearchIndex, SnapshotOutcome, StagingSummary,
};
use crate::models::{
    CuratedDocument, FailureReason, IndexedEntry, RejectedRecord, RunKind, RunRecord, StagingRow,
};

fn lock<T>(mutex: &Mutex<T>) -> Result<MutexGuard<'_, T>> {
    mutex
        .lock()
        .map_err(|_| PipelineError::consistency("in-memory store lock poisoned"))
}

/// Queue of errors returned by the next calls into a store, one per call
#[derive(Debug, Default)]
pub struct Faults {
    queue: Mutex<VecDeque<PipelineError>>,
}

impl Faults {
    pub fn push(&self, error: PipelineError) {
        if let Ok(mut queue) = self.queue.lock() {
            queue.push_back(error);
        }
    }

    /// Queue `count` connectivity failures for `service`
    pub fn push_outage(&self, service: &str, count: usize) {
        for _ in 0..count {
            self.push(PipelineError::connectivity(service, "injected outage"));
        }
    }

    fn check(&self) -> Result<()> {
        match lock(&self.queue)?.pop_front() {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }
}

// ============================================================================
// Object store
// ============================================================================

pub struct MemoryObjectStore {
    bucket: String,
    objects: Mutex<BTreeMap<String, Vec<u8>>>,
    faults: Faults,
}

impl MemoryObjectStore {
    pub fn new(bucket: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            objects: Mutex::new(BTreeMap::new()),
            faults: Faults::default(),
        }
    }

    pub fn faults(&self) -> &Faults {
        &self.faults
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn put(&self, key: &str, bytes: Vec<u8>) -> Result<ObjectRef> {
        self.faults.check()?;
        let object = ObjectRef {
            bucket: self.bucket.clone(),
            key: key.to_string(),
            checksum: checksum::sha256_hex(&bytes),
            size: bytes.len() as u64,
        };
        lock(&self.objects)?.insert(key.to_string(), bytes);
        Ok(object)
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>> {
        self.faults.check()?;
        lock(&self.objects)?
            .get(key)
            .cloned()
            .ok_or_else(|| PipelineError::not_found(format!("{}/{}", self.bucket, key)))
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        self.faults.check()?;
        Ok(lock(&self.objects)?.contains_key(key))
    }

    async fn count(&self, prefix: &str) -> Result<u64> {
        self.faults.check()?;
        Ok(lock(&self.objects)?.keys().filter(|k| k.starts_with(prefix)).count() as u64)
    }
}

// ============================================================================
// Relational store
// ============================================================================

#[derive(Default)]
struct StagingTables {
    rows: BTreeMap<String, StagingRow>,
    rejects: BTreeMap<Uuid, Vec<RejectedRecord>>,
}

#[derive(Default)]
pub struct MemoryRelationalStore {
    tables: Mutex<StagingTables>,
    faults: Faults,
}

impl MemoryRelationalStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn faults(&self) -> &Faults {
        &self.faults
    }
}

#[async_trait]
impl RelationalStore for MemoryRelationalStore {
    async fn replace_snapshot(
        &self,
        run_id: Uuid,
        rows: &[StagingRow],
        rejects: &[RejectedRecord],
    ) -> Result<SnapshotOutcome> {
        self.faults.check()?;
        let mut tables = lock(&self.tables)?;

        let incoming: BTreeSet<&str> = rows.iter().map(|r| r.permit_id.as_str()).collect();
        let before = tables.rows.len();
        tables.rows.retain(|id, _| incoming.contains(id.as_str()));
        let pruned = before - tables.rows.len();

        for row in rows {
            tables.rows.insert(row.permit_id.clone(), row.clone());
        }
        tables.rejects.insert(run_id, rejects.to_vec());

        Ok(SnapshotOutcome {
            upserted: rows.len(),
            pruned,
        })
    }

    async fn fetch_rows(&self) -> Result<Vec<StagingRow>> {
        self.faults.check()?;
        Ok(lock(&self.tables)?.rows.values().cloned().collect())
    }

    async fn summary(&self) -> Result<StagingSummary> {
        self.faults.check()?;
        let tables = lock(&self.tables)?;
        let row_count = tables.rows.len() as u64;
        let average_value = (row_count > 0)
            .then(|| tables.rows.values().map(|r| r.value).sum::<f64>() / row_count as f64);
        Ok(StagingSummary {
            row_count,
            average_value,
        })
    }

    async fn rejected(&self, run_id: Uuid) -> Result<Vec<RejectedRecord>> {
        self.faults.check()?;
        Ok(lock(&self.tables)?.rejects.get(&run_id).cloned().unwrap_or_default())
    }
}

// ============================================================================
// Document store
// ============================================================================

/// Documents are held in serialized form so tests can compare stored bytes
#[derive(Default)]
pub struct MemoryDocumentStore {
    documents: Mutex<BTreeMap<String, Vec<u8>>>,
    faults: Faults,
}

impl MemoryDocumentStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn faults(&self) -> &Faults {
        &self.faults
    }

    /// Stored bytes keyed by permit id
    pub fn snapshot(&self) -> Result<BTreeMap<String, Vec<u8>>> {
        Ok(lock(&self.documents)?.clone())
    }
}

#[async_trait]
impl DocumentStore for MemoryDocumentStore {
    async fn upsert_batch(&self, docs: &[CuratedDocument]) -> Result<usize> {
        self.faults.check()?;
        let encoded = docs
            .iter()
            .map(|doc| Ok((doc.permit_id.clone(), serde_json::to_vec(doc)?)))
            .collect::<Result<Vec<_>>>()?;

        let mut documents = lock(&self.documents)?;
        for (id, bytes) in encoded {
            documents.insert(id, bytes);
        }
        Ok(docs.len())
    }

    async fn delete_except(&self, keep: &BTreeSet<String>) -> Result<usize> {
        self.faults.check()?;
        let mut documents = lock(&self.documents)?;
        let before = documents.len();
        documents.retain(|id, _| keep.contains(id));
        Ok(before - documents.len())
    }

    async fn replace_all(&self, docs: &[CuratedDocument]) -> Result<SnapshotOutcome> {
        self.faults.check()?;
        let encoded = docs
            .iter()
            .map(|doc| Ok((doc.permit_id.clone(), serde_json::to_vec(doc)?)))
            .collect::<Result<BTreeMap<_, _>>>()?;

        let mut documents = lock(&self.documents)?;
        let pruned = documents.keys().filter(|id| !encoded.contains_key(*id)).count();
        *documents = encoded;
        Ok(SnapshotOutcome {
            upserted: docs.len(),
            pruned,
        })
    }

    async fn find(&self, filter: &DocumentFilter) -> Result<Vec<CuratedDocument>> {
        self.faults.check()?;
        let documents = lock(&self.documents)?;
        let mut found = Vec::new();
        for bytes in documents.values() {
            let doc: CuratedDocument = serde_json::from_slice(bytes)?;
            if filter.matches(&doc) {
                found.push(doc);
            }
        }
        Ok(found)
    }

    async fn count(&self) -> Result<u64> {
        self.faults.check()?;
        Ok(lock(&self.documents)?.len() as u64)
    }
}

// ============================================================================
// Search index
// ============================================================================

struct MemoryIndex {
    mapping: IndexMapping,
    entries: BTreeMap<String, IndexedEntry>,
}

#[derive(Default)]
pub struct MemorySearchIndex {
    indices: Mutex<BTreeMap<String, MemoryIndex>>,
    faults: Faults,
}

impl MemorySearchIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn faults(&self) -> &Faults {
        &self.faults
    }

    pub fn index_exists(&self, name: &str) -> Result<bool> {
        Ok(lock(&self.indices)?.contains_key(name))
    }
}

fn missing_index(name: &str) -> PipelineError {
    PipelineError::schema(name, "index does not exist")
}

#[async_trait]
impl SearchIndex for MemorySearchIndex {
    async fn create_index(&self, name: &str, mapping: &IndexMapping) -> Result<()> {
        self.faults.check()?;
        let mut indices = lock(&self.indices)?;
        match indices.get(name) {
            Some(existing) if existing.mapping == *mapping => Ok(()),
            Some(_) => Err(PipelineError::schema(
                name,
                "index exists with a different mapping",
            )),
            None => {
                indices.insert(
                    name.to_string(),
                    MemoryIndex {
                        mapping: mapping.clone(),
                        entries: BTreeMap::new(),
                    },
                );
                Ok(())
            }
        }
    }

    async fn delete_index(&self, name: &str) -> Result<()> {
        self.faults.check()?;
        lock(&self.indices)?.remove(name);
        Ok(())
    }

    async fn bulk_upsert(&self, name: &str, entries: &[IndexedEntry]) -> Result<usize> {
        self.faults.check()?;
        let mut indices = lock(&self.indices)?;
        let index = indices.get_mut(name).ok_or_else(|| missing_index(name))?;
        for entry in entries {
            index.entries.insert(entry.permit_id.clone(), entry.clone());
        }
        Ok(entries.len())
    }

    async fn bulk_delete(&self, name: &str, ids: &[String]) -> Result<usize> {
        self.faults.check()?;
        let mut indices = lock(&self.indices)?;
        let index = indices.get_mut(name).ok_or_else(|| missing_index(name))?;
        Ok(ids.iter().filter(|id| index.entries.remove(*id).is_some()).count())
    }

    async fn get(&self, name: &str, id: &str) -> Result<Option<IndexedEntry>> {
        self.faults.check()?;
        Ok(lock(&self.indices)?
            .get(name)
            .and_then(|index| index.entries.get(id).cloned()))
    }

    async fn content_hashes(&self, name: &str) -> Result<BTreeMap<String, String>> {
        self.faults.check()?;
        Ok(lock(&self.indices)?
            .get(name)
            .map(|index| {
                index
                    .entries
                    .iter()
                    .map(|(id, entry)| (id.clone(), entry.content_hash.clone()))
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn count(&self, name: &str) -> Result<u64> {
        self.faults.check()?;
        Ok(lock(&self.indices)?
            .get(name)
            .map_or(0, |index| index.entries.len() as u64))
    }
}

// ============================================================================
// Run store
// ============================================================================

#[derive(Default)]
pub struct MemoryRunStore {
    runs: Mutex<Vec<RunRecord>>,
    faults: Faults,
}

impl MemoryRunStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn faults(&self) -> &Faults {
        &self.faults
    }

    /// Backdate a run's last update, simulating a crashed process
    pub fn backdate(&self, run_id: Uuid, by: chrono::Duration) -> Result<()> {
        let mut runs = lock(&self.runs)?;
        let run = runs
            .iter_mut()
            .find(|r| r.run_id == run_id)
            .ok_or_else(|| PipelineError::not_found(format!("run {}", run_id)))?;
        run.updated_at -= by;
        Ok(())
    }
}

/// Apply a transition to an in-progress run
fn update_run<F>(runs: &mut [RunRecord], run_id: Uuid, apply: F) -> Result<RunRecord>
where
    F: FnOnce(&mut RunRecord),
{
    let run = runs
        .iter_mut()
        .find(|r| r.run_id == run_id)
        .ok_or_else(|| PipelineError::not_found(format!("run {}", run_id)))?;
    if run.status != RunStatus::InProgress {
        return Err(run_closed(run));
    }
    apply(run);
    run.updated_at = Utc::now();
    Ok(run.clone())
}

#[async_trait]
impl RunStore for MemoryRunStore {
    async fn begin_run(&self, dataset_key: &str, kind: RunKind, stale_after: Duration) -> Result<RunRecord> {
        self.faults.check()?;
        let mut runs = lock(&self.runs)?;
        let now = Utc::now();

        for run in runs
            .iter_mut()
            .filter(|r| r.dataset_key == dataset_key && r.status == RunStatus::InProgress)
        {
            if run.is_stale(now, stale_after) {
                run.failure = Some(abandoned_reason(run));
                run.status = RunStatus::Failed;
                run.stage = RunStage::Failed;
                run.updated_at = now;
                run.completed_at = Some(now);
            } else {
                return Err(PipelineError::ConcurrencyConflict {
                    dataset_key: dataset_key.to_string(),
                    run_id: run.run_id.to_string(),
                });
            }
        }

        let run = RunRecord::new(dataset_key, kind);
        runs.push(run.clone());
        Ok(run)
    }

    async fn record_stage(&self, run_id: Uuid, stage: RunStage, rejected_count: Option<i64>) -> Result<RunRecord> {
        self.faults.check()?;
        update_run(&mut lock(&self.runs)?, run_id, |run| {
            run.stage = stage;
            if let Some(count) = rejected_count {
                run.rejected_count = count;
            }
        })
    }

    async fn finish_run(
        &self,
        run_id: Uuid,
        status: RunStatus,
        failure: Option<FailureReason>,
    ) -> Result<RunRecord> {
        self.faults.check()?;
        update_run(&mut lock(&self.runs)?, run_id, |run| {
            run.status = status;
            if status == RunStatus::Failed {
                run.stage = RunStage::Failed;
            }
            run.failure = failure;
            run.completed_at = Some(Utc::now());
        })
    }

    async fn get_run(&self, run_id: Uuid) -> Result<Option<RunRecord>> {
        self.faults.check()?;
        Ok(lock(&self.runs)?.iter().find(|r| r.run_id == run_id).cloned())
    }

    async fn latest_run(&self, dataset_key: &str) -> Result<Option<RunRecord>> {
        self.faults.check()?;
        Ok(lock(&self.runs)?
            .iter()
            .rev()
            .find(|r| r.dataset_key == dataset_key)
            .cloned())
    }

    async fn latest_succeeded(&self, dataset_key: &str, kind: RunKind) -> Result<Option<RunRecord>> {
        self.faults.check()?;
        Ok(lock(&self.runs)?
            .iter()
            .rev()
            .find(|r| r.dataset_key == dataset_key && r.kind == kind && r.status == RunStatus::Succeeded)
            .cloned())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn row(id: &str, value: f64) -> StagingRow {
        StagingRow {
            permit_id: id.to_string(),
            application_type: None,
            building_type: None,
            value,
            ward: None,
            description: None,
            issued_date: NaiveDate::from_ymd_opt(2024, 3, 1).unwrap(),
            location: None,
            contractor: None,
            geometry_type: None,
            coordinates: None,
        }
    }

    #[tokio::test]
    async fn test_object_get_missing_is_not_found() {
        let store = MemoryObjectStore::new("ottawa-raw");
        let err = store.get("raw/missing.json").await.unwrap_err();
        assert_eq!(err.kind(), permits_common::ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn test_object_put_overwrites() {
        let store = MemoryObjectStore::new("ottawa-raw");
        store.put("raw/a.json", b"[1]".to_vec()).await.unwrap();
        let second = store.put("raw/a.json", b"[2]".to_vec()).await.unwrap();
        assert_eq!(store.count("raw/").await.unwrap(), 1);
        assert_eq!(store.get("raw/a.json").await.unwrap(), b"[2]");
        assert_eq!(second.checksum, checksum::sha256_hex(b"[2]"));
    }

    #[tokio::test]
    async fn test_replace_snapshot_prunes_absent_rows() {
        let store = MemoryRelationalStore::new();
        let run = Uuid::new_v4();
        store
            .replace_snapshot(run, &[row("A", 1.0), row("B", 2.0)], &[])
            .await
            .unwrap();
        let outcome = store.replace_snapshot(run, &[row("B", 3.0)], &[]).await.unwrap();

        assert_eq!(outcome, SnapshotOutcome { upserted: 1, pruned: 1 });
        let rows = store.fetch_rows().await.unwrap();
        assert_eq!(rows, vec![row("B", 3.0)]);
    }

    #[tokio::test]
    async fn test_injected_fault_leaves_table_untouched() {
        let store = MemoryRelationalStore::new();
        let run = Uuid::new_v4();
        store.replace_snapshot(run, &[row("A", 1.0)], &[]).await.unwrap();

        store.faults().push_outage("postgres", 1);
        assert!(store.replace_snapshot(run, &[row("B", 2.0)], &[]).await.is_err());
        assert_eq!(store.fetch_rows().await.unwrap(), vec![row("A", 1.0)]);
    }

    #[tokio::test]
    async fn test_second_run_conflicts_until_finished() {
        let store = MemoryRunStore::new();
        let stale = Duration::from_secs(3600);
        let first = store.begin_run("ottawa", RunKind::Pipeline, stale).await.unwrap();

        let err = store.begin_run("ottawa", RunKind::Pipeline, stale).await.unwrap_err();
        assert_eq!(err.kind(), permits_common::ErrorKind::ConcurrencyConflict);

        // Different dataset keys do not contend
        store.begin_run("gatineau", RunKind::Pipeline, stale).await.unwrap();

        store.finish_run(first.run_id, RunStatus::Succeeded, None).await.unwrap();
        store.begin_run("ottawa", RunKind::Pipeline, stale).await.unwrap();
    }

    #[tokio::test]
    async fn test_stale_run_is_abandoned() {
        let store = MemoryRunStore::new();
        let stale = Duration::from_secs(60);
        let crashed = store.begin_run("ottawa", RunKind::Pipeline, stale).await.unwrap();
        store.backdate(crashed.run_id, chrono::Duration::minutes(5)).unwrap();

        let next = store.begin_run("ottawa", RunKind::Pipeline, stale).await.unwrap();
        assert_ne!(next.run_id, crashed.run_id);

        let crashed = store.get_run(crashed.run_id).await.unwrap().unwrap();
        assert_eq!(crashed.status, RunStatus::Failed);
        assert_eq!(crashed.failure.unwrap().message, "abandoned");
    }

    #[tokio::test]
    async fn test_abandoned_run_cannot_advance_or_finish() {
        let store = MemoryRunStore::new();
        let stale = Duration::from_secs(60);
        let slow = store.begin_run("ottawa", RunKind::Pipeline, stale).await.unwrap();
        store.backdate(slow.run_id, chrono::Duration::minutes(5)).unwrap();
        store.begin_run("ottawa", RunKind::Pipeline, stale).await.unwrap();

        let err = store
            .record_stage(slow.run_id, RunStage::RawUploaded, None)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), permits_common::ErrorKind::Consistency);
        let err = store
            .finish_run(slow.run_id, RunStatus::Succeeded, None)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), permits_common::ErrorKind::Consistency);

        let slow = store.get_run(slow.run_id).await.unwrap().unwrap();
        assert_eq!(slow.status, RunStatus::Failed);
        assert_eq!(slow.failure.unwrap().message, "abandoned");
    }

    #[tokio::test]
    async fn test_latest_succeeded_skips_other_kinds() {
        let store = MemoryRunStore::new();
        let stale = Duration::from_secs(3600);
        let pipeline = store.begin_run("ottawa", RunKind::Pipeline, stale).await.unwrap();
        store.record_stage(pipeline.run_id, RunStage::StagingLoaded, Some(2)).await.unwrap();
        store.finish_run(pipeline.run_id, RunStatus::Succeeded, None).await.unwrap();
        let report = store.begin_run("ottawa", RunKind::Report, stale).await.unwrap();
        store.finish_run(report.run_id, RunStatus::Succeeded, None).await.unwrap();

        let found = store.latest_succeeded("ottawa", RunKind::Pipeline).await.unwrap().unwrap();
        assert_eq!(found.run_id, pipeline.run_id);
        assert_eq!(found.rejected_count, 2);
        assert!(store.latest_succeeded("gatineau", RunKind::Pipeline).await.unwrap().is_none());
    }
}
