//! Indexed zone: project curated documents into the search index

use futures::{stream, StreamExt, TryStreamExt};
use permits_common::{PipelineError, Result};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, instrument, warn};

use crate::models::IndexedEntry;
use crate::retry::with_timeout;
use crate::stores::{DocumentFilter, DocumentStore, IndexMapping, SearchIndex};

/// Field mapping of the permits index. Every field of [`IndexedEntry`] is
/// declared so the engine never adds dynamic fields.
pub fn permit_index_mapping() -> IndexMapping {
    let properties = [
        ("permit_id", json!({ "type": "keyword" })),
        ("application_type", json!({ "type": "keyword" })),
        ("permit_class", json!({ "type": "keyword" })),
        ("building_type", json!({ "type": "keyword" })),
        ("value", json!({ "type": "float" })),
        ("value_category", json!({ "type": "keyword" })),
        ("ward", json!({ "type": "keyword" })),
        ("description", json!({ "type": "text" })),
        ("labels", json!({ "type": "keyword" })),
        ("issued_date", json!({ "type": "date", "format": "yyyy-MM-dd" })),
        ("location", json!({ "type": "text" })),
        ("contractor", json!({ "type": "keyword" })),
        ("geo_point", json!({ "type": "geo_point" })),
        ("geo_status", json!({ "type": "keyword" })),
        ("content_hash", json!({ "type": "keyword", "index": false })),
    ]
    .into_iter()
    .map(|(field, spec)| (field.to_string(), spec))
    .collect();

    IndexMapping { properties }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IndexMode {
    /// Upsert changed entries and delete entries absent from curated
    Incremental,
    /// Drop and recreate the index, then load every curated document
    FullRebuild,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexOutcome {
    pub mode: IndexMode,
    pub upserted: usize,
    pub deleted: usize,
    pub unchanged: usize,
}

pub struct Indexer {
    index: Arc<dyn SearchIndex>,
    documents: Arc<dyn DocumentStore>,
    index_name: String,
    batch_size: usize,
    concurrency: usize,
    call_timeout: Duration,
}

impl Indexer {
    pub fn new(
        index: Arc<dyn SearchIndex>,
        documents: Arc<dyn DocumentStore>,
        index_name: impl Into<String>,
        batch_size: usize,
        concurrency: usize,
        call_timeout: Duration,
    ) -> Self {
        Self {
            index,
            documents,
            index_name: index_name.into(),
            batch_size: batch_size.max(1),
            concurrency: concurrency.max(1),
            call_timeout,
        }
    }

    pub fn index_name(&self) -> &str {
        &self.index_name
    }

    async fn upsert_chunked(&self, entries: Vec<IndexedEntry>) -> Result<usize> {
        let chunks: Vec<Vec<IndexedEntry>> = entries.chunks(self.batch_size).map(<[_]>::to_vec).collect();

        let written: Vec<usize> = stream::iter(chunks)
            .map(|chunk| async move {
                with_timeout(
                    "search index",
                    self.call_timeout,
                    self.index.bulk_upsert(&self.index_name, &chunk),
                )
                .await
            })
            .buffer_unordered(self.concurrency)
            .try_collect()
            .await?;

        Ok(written.into_iter().sum())
    }

    async fn delete_chunked(&self, ids: Vec<String>) -> Result<usize> {
        let mut deleted = 0;
        for chunk in ids.chunks(self.batch_size) {
            deleted += with_timeout(
                "search index",
                self.call_timeout,
                self.index.bulk_delete(&self.index_name, chunk),
            )
            .await?;
        }
        Ok(deleted)
    }

    /// Bring the index in line with the curated collection
    #[instrument(skip(self), fields(index = %self.index_name))]
    pub async fn sync(&self, mode: IndexMode) -> Result<IndexOutcome> {
        let mapping = permit_index_mapping();

        if mode == IndexMode::FullRebuild {
            warn!("Dropping index for full rebuild");
            with_timeout("search index", self.call_timeout, self.index.delete_index(&self.index_name)).await?;
        }
        with_timeout(
            "search index",
            self.call_timeout,
            self.index.create_index(&self.index_name, &mapping),
        )
        .await?;

        let documents = with_timeout(
            "document store",
            self.call_timeout,
            self.documents.find(&DocumentFilter::all()),
        )
        .await?;
        let entries = documents
            .iter()
            .map(IndexedEntry::from_document)
            .collect::<Result<Vec<_>>>()?;
        let curated_ids: BTreeSet<String> = entries.iter().map(|e| e.permit_id.clone()).collect();

        let existing = match mode {
            IndexMode::Incremental => {
                with_timeout(
                    "search index",
                    self.call_timeout,
                    self.index.content_hashes(&self.index_name),
                )
                .await?
            }
            IndexMode::FullRebuild => Default::default(),
        };

        let total = entries.len();
        let changed: Vec<IndexedEntry> = entries
            .into_iter()
            .filter(|entry| existing.get(&entry.permit_id) != Some(&entry.content_hash))
            .collect();
        let stale: Vec<String> = existing
            .keys()
            .filter(|id| !curated_ids.contains(*id))
            .cloned()
            .collect();

        let unchanged = total - changed.len();
        let upserted = self.upsert_chunked(changed).await?;
        let deleted = self.delete_chunked(stale).await?;

        let indexed = with_timeout("search index", self.call_timeout, self.index.count(&self.index_name)).await?;
        if indexed != total as u64 {
            return Err(PipelineError::consistency(format!(
                "index '{}' holds {} entries for {} curated documents",
                self.index_name, indexed, total
            )));
        }

        let outcome = IndexOutcome {
            mode,
            upserted,
            deleted,
            unchanged,
        };
        info!(
            mode = ?outcome.mode,
            upserted = outcome.upserted,
            deleted = outcome.deleted,
            unchanged = outcome.unchanged,
            "Index synchronised"
        );

        Ok(outcome)
    }
}
