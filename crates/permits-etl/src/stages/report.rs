//! Cross-zone analytics report
//!
//! Read-only over every zone. Counts are taken one zone after another; the
//! caller holds the dataset lock, so no writer for the same dataset can
//! interleave, and the `consistency` section records whether adjacent zones
//! agreed at read time.

use chrono::{DateTime, Utc};
use permits_common::{PipelineError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, instrument};
use uuid::Uuid;

use crate::models::{CuratedDocument, ValueCategory};
use crate::retry::with_timeout;
use crate::stages::raw::RawStore;
use crate::stores::{DocumentFilter, DocumentStore, RelationalStore, SearchIndex};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ZoneCounts {
    pub raw_objects: u64,
    pub staging_rows: u64,
    pub curated_documents: u64,
    pub indexed_entries: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LabelCount {
    pub label: String,
    pub count: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Analytics {
    /// Mean curated value, rounded to cents; zero when curated is empty
    pub average_permit_value: f64,
    pub staging_average_value: f64,
    /// Always lists Low, Medium and High
    pub value_category_distribution: BTreeMap<String, u64>,
    pub top_labels: Vec<LabelCount>,
    pub degraded_documents: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Consistency {
    pub staging_matches_curated: bool,
    pub curated_matches_indexed: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisReport {
    pub run_id: Uuid,
    pub dataset_key: String,
    pub generated_at: DateTime<Utc>,
    pub rejected_records: i64,
    pub data_zones: ZoneCounts,
    pub analytics: Analytics,
    pub consistency: Consistency,
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// Labels by descending frequency, ties alphabetical, at most `top_n`
pub fn top_labels(documents: &[CuratedDocument], top_n: usize) -> Vec<LabelCount> {
    let mut counts: BTreeMap<&str, u64> = BTreeMap::new();
    for doc in documents {
        for label in &doc.labels {
            *counts.entry(label.as_str()).or_default() += 1;
        }
    }

    let mut ranked: Vec<LabelCount> = counts
        .into_iter()
        .map(|(label, count)| LabelCount {
            label: label.to_string(),
            count,
        })
        .collect();
    ranked.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.label.cmp(&b.label)));
    ranked.truncate(top_n);
    ranked
}

pub fn category_distribution(documents: &[CuratedDocument]) -> BTreeMap<String, u64> {
    let mut distribution: BTreeMap<String, u64> = ValueCategory::ALL
        .iter()
        .map(|category| (category.as_str().to_string(), 0))
        .collect();
    for doc in documents {
        *distribution.entry(doc.value_category.as_str().to_string()).or_default() += 1;
    }
    distribution
}

pub struct ReportAggregator {
    raw: RawStore,
    staging: Arc<dyn RelationalStore>,
    documents: Arc<dyn DocumentStore>,
    index: Arc<dyn SearchIndex>,
    index_name: String,
    top_n: usize,
    call_timeout: Duration,
}

impl ReportAggregator {
    pub fn new(
        raw: RawStore,
        staging: Arc<dyn RelationalStore>,
        documents: Arc<dyn DocumentStore>,
        index: Arc<dyn SearchIndex>,
        index_name: impl Into<String>,
        top_n: usize,
        call_timeout: Duration,
    ) -> Self {
        Self {
            raw,
            staging,
            documents,
            index,
            index_name: index_name.into(),
            top_n,
            call_timeout,
        }
    }

    #[instrument(skip(self), fields(%run_id))]
    pub async fn compute(&self, run_id: Uuid, dataset_key: &str, rejected_records: i64) -> Result<AnalysisReport> {
        let raw_objects = self.raw.count().await?;
        let staging = with_timeout("relational store", self.call_timeout, self.staging.summary()).await?;
        let documents = with_timeout(
            "document store",
            self.call_timeout,
            self.documents.find(&DocumentFilter::all()),
        )
        .await?;
        let indexed_entries =
            with_timeout("search index", self.call_timeout, self.index.count(&self.index_name)).await?;

        let curated_documents = documents.len() as u64;
        let average_permit_value = if documents.is_empty() {
            0.0
        } else {
            round2(documents.iter().map(|d| d.value).sum::<f64>() / documents.len() as f64)
        };

        let report = AnalysisReport {
            run_id,
            dataset_key: dataset_key.to_string(),
            generated_at: Utc::now(),
            rejected_records,
            data_zones: ZoneCounts {
                raw_objects,
                staging_rows: staging.row_count,
                curated_documents,
                indexed_entries,
            },
            analytics: Analytics {
                average_permit_value,
                staging_average_value: round2(staging.average_value.unwrap_or(0.0)),
                value_category_distribution: category_distribution(&documents),
                top_labels: top_labels(&documents, self.top_n),
                degraded_documents: documents
                    .iter()
                    .filter(|d| d.enrichment == crate::models::EnrichmentStatus::Degraded)
                    .count() as u64,
            },
            consistency: Consistency {
                staging_matches_curated: staging.row_count == curated_documents,
                curated_matches_indexed: curated_documents == indexed_entries,
            },
        };

        info!(
            staging_rows = report.data_zones.staging_rows,
            curated = report.data_zones.curated_documents,
            indexed = report.data_zones.indexed_entries,
            average = report.analytics.average_permit_value,
            "Report computed"
        );

        Ok(report)
    }
}

/// Write the report, fully replacing any previous one. The file is written
/// beside the target and renamed over it, so readers never see a partial
/// report.
pub async fn write_report(report: &AnalysisReport, path: &Path) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent).await?;
    }

    let mut bytes = serde_json::to_vec_pretty(report)?;
    bytes.push(b'\n');

    let file_name = path
        .file_name()
        .ok_or_else(|| PipelineError::config(format!("report path {} has no file name", path.display())))?;
    let mut temp_name = file_name.to_os_string();
    temp_name.push(".tmp");
    let temp_path = path.with_file_name(temp_name);

    tokio::fs::write(&temp_path, &bytes).await?;
    tokio::fs::rename(&temp_path, path).await?;

    info!(path = %path.display(), "Report written");
    Ok(())
}
