//! Records as they exist in each zone, plus the run-record entity
//!
//! The permit identifier is the single join key across every zone. Derived
//! records carry no timestamps, so recomputing them from the same staging
//! row yields byte-identical output.

use chrono::{DateTime, NaiveDate, Utc};
use permits_common::{checksum, ErrorKind, Result, RunStage, RunStatus};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ============================================================================
// Staging zone
// ============================================================================

/// Typed, validated projection of one raw permit
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StagingRow {
    pub permit_id: String,
    pub application_type: Option<String>,
    pub building_type: Option<String>,
    pub value: f64,
    pub ward: Option<String>,
    pub description: Option<String>,
    pub issued_date: NaiveDate,
    pub location: Option<String>,
    pub contractor: Option<String>,
    pub geometry_type: Option<String>,
    /// Geometry coordinates as the source supplied them (JSON text)
    pub coordinates: Option<String>,
}

/// A raw record excluded from staging, kept for audit
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RejectedRecord {
    /// Zero-based position of the record in the raw snapshot
    pub position: i64,
    pub permit_id: Option<String>,
    pub reason: String,
    pub raw: serde_json::Value,
}

// ============================================================================
// Curated zone
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ValueCategory {
    Low,
    Medium,
    High,
}

impl ValueCategory {
    pub const ALL: [ValueCategory; 3] = [ValueCategory::Low, ValueCategory::Medium, ValueCategory::High];

    pub fn as_str(&self) -> &str {
        match self {
            ValueCategory::Low => "Low",
            ValueCategory::Medium => "Medium",
            ValueCategory::High => "High",
        }
    }
}

impl std::fmt::Display for ValueCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Coarse classification of what the permit authorises
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PermitClass {
    Demolition,
    Renovation,
    Construction,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    pub lat: f64,
    pub lon: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GeoStatus {
    Valid,
    /// Parsed, but outside the municipality's bounding box
    OutOfBounds,
    Missing,
    Unparseable,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnrichmentStatus {
    Complete,
    /// Stored despite an enrichment data error; see `geo_status`
    Degraded,
}

/// Staging row plus derived attributes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CuratedDocument {
    pub permit_id: String,
    pub application_type: Option<String>,
    pub building_type: Option<String>,
    pub value: f64,
    pub ward: Option<String>,
    pub description: Option<String>,
    pub issued_date: NaiveDate,
    pub location: Option<String>,
    pub contractor: Option<String>,
    pub permit_class: PermitClass,
    pub value_category: ValueCategory,
    /// Sorted, deduplicated
    pub labels: Vec<String>,
    pub geo_point: Option<GeoPoint>,
    pub geo_status: GeoStatus,
    pub enrichment: EnrichmentStatus,
}

impl CuratedDocument {
    pub fn fingerprint(&self) -> Result<String> {
        checksum::fingerprint(self)
    }
}

// ============================================================================
// Indexed zone
// ============================================================================

/// Search-index projection of a curated document
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexedEntry {
    pub permit_id: String,
    pub application_type: Option<String>,
    pub permit_class: PermitClass,
    pub building_type: Option<String>,
    pub value: f64,
    pub value_category: ValueCategory,
    pub ward: Option<String>,
    pub description: Option<String>,
    pub labels: Vec<String>,
    pub issued_date: NaiveDate,
    pub location: Option<String>,
    pub contractor: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub geo_point: Option<GeoPoint>,
    pub geo_status: GeoStatus,
    /// Fingerprint of the source curated document; drives incremental sync
    pub content_hash: String,
}

impl IndexedEntry {
    pub fn from_document(doc: &CuratedDocument) -> Result<Self> {
        Ok(Self {
            permit_id: doc.permit_id.clone(),
            application_type: doc.application_type.clone(),
            permit_class: doc.permit_class,
            building_type: doc.building_type.clone(),
            value: doc.value,
            value_category: doc.value_category,
            ward: doc.ward.clone(),
            description: doc.description.clone(),
            labels: doc.labels.clone(),
            issued_date: doc.issued_date,
            location: doc.location.clone(),
            contractor: doc.contractor.clone(),
            geo_point: doc.geo_point,
            geo_status: doc.geo_status,
            content_hash: doc.fingerprint()?,
        })
    }
}

// ============================================================================
// Run records
// ============================================================================

/// What a run record was opened for. All kinds hold the dataset lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunKind {
    Pipeline,
    IndexRebuild,
    Report,
}

impl RunKind {
    pub fn as_str(&self) -> &str {
        match self {
            RunKind::Pipeline => "pipeline",
            RunKind::IndexRebuild => "index_rebuild",
            RunKind::Report => "report",
        }
    }
}

impl std::str::FromStr for RunKind {
    type Err = permits_common::PipelineError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "pipeline" => Ok(RunKind::Pipeline),
            "index_rebuild" => Ok(RunKind::IndexRebuild),
            "report" => Ok(RunKind::Report),
            other => Err(permits_common::PipelineError::schema(
                "pipeline_runs.kind",
                format!("unknown run kind '{}'", other),
            )),
        }
    }
}

/// Why a run stopped, recorded for operator diagnosis
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureReason {
    pub step: String,
    pub kind: ErrorKind,
    pub affected_records: i64,
    pub attempts: u32,
    pub message: String,
}

/// Durable state of one run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRecord {
    pub run_id: Uuid,
    pub dataset_key: String,
    pub kind: RunKind,
    pub stage: RunStage,
    pub status: RunStatus,
    pub rejected_count: i64,
    pub failure: Option<FailureReason>,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl RunRecord {
    pub fn new(dataset_key: &str, kind: RunKind) -> Self {
        let now = Utc::now();
        Self {
            run_id: Uuid::new_v4(),
            dataset_key: dataset_key.to_string(),
            kind,
            stage: RunStage::Pending,
            status: RunStatus::InProgress,
            rejected_count: 0,
            failure: None,
            started_at: now,
            updated_at: now,
            completed_at: None,
        }
    }

    /// In progress but not touched for longer than `stale_after`
    pub fn is_stale(&self, now: DateTime<Utc>, stale_after: std::time::Duration) -> bool {
        let Ok(stale_after) = chrono::Duration::from_std(stale_after) else {
            return false;
        };
        self.status == RunStatus::InProgress && now - self.updated_at > stale_after
    }
}
