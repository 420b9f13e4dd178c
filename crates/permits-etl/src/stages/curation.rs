//! Curated zone: derive enriched documents from staging rows
//!
//! Every derivation here is a pure function of one staging row and the
//! [`EnrichmentRules`], so re-running curation over unchanged staging data
//! reproduces the same documents byte for byte.

use futures::{stream, StreamExt, TryStreamExt};
use permits_common::{PipelineError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, instrument, warn};

use crate::config::{BoundingBox, EnrichmentRules, LabelRule, ValueThresholds};
use crate::models::{
    CuratedDocument, EnrichmentStatus, GeoPoint, GeoStatus, PermitClass, StagingRow, ValueCategory,
};
use crate::retry::with_timeout;
use crate::stores::{DocumentStore, RelationalStore};

/// `value < low` is Low, `low <= value < high` is Medium, otherwise High
pub fn categorize(value: f64, thresholds: &ValueThresholds) -> ValueCategory {
    if value < thresholds.low {
        ValueCategory::Low
    } else if value < thresholds.high {
        ValueCategory::Medium
    } else {
        ValueCategory::High
    }
}

/// Lower-cased word tokens; hyphens inside a word are kept ("fit-up")
pub fn tokenize(text: &str) -> Vec<String> {
    text.to_lowercase()
        .split(|c: char| !(c.is_alphanumeric() || c == '-'))
        .map(|token| token.trim_matches('-'))
        .filter(|token| !token.is_empty())
        .map(str::to_string)
        .collect()
}

/// Token equality, tolerating a plural "s" on the description side
fn token_matches(token: &str, keyword: &str) -> bool {
    token == keyword
        || (token.len() > 3 && token.strip_suffix('s') == Some(keyword))
}

fn phrase_occurs(tokens: &[String], phrase: &[String]) -> bool {
    !phrase.is_empty()
        && tokens.len() >= phrase.len()
        && tokens
            .windows(phrase.len())
            .any(|window| window.iter().zip(phrase).all(|(t, k)| token_matches(t, k)))
}

/// Labels whose keyword phrases occur in the description, sorted and unique
pub fn extract_labels(description: Option<&str>, vocabulary: &[LabelRule]) -> Vec<String> {
    let Some(description) = description else {
        return Vec::new();
    };
    let tokens = tokenize(description);

    vocabulary
        .iter()
        .filter(|rule| {
            rule.keywords
                .iter()
                .any(|keyword| phrase_occurs(&tokens, &tokenize(keyword)))
        })
        .map(|rule| rule.label.clone())
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}

pub fn classify_permit(application_type: Option<&str>, labels: &[String]) -> PermitClass {
    let application_type = application_type.unwrap_or_default().to_lowercase();
    let has_label = |label: &str| labels.iter().any(|l| l == label);

    if application_type.contains("demolition") || has_label("demolition") {
        PermitClass::Demolition
    } else if application_type.contains("interior alteration") || has_label("renovation") {
        PermitClass::Renovation
    } else {
        PermitClass::Construction
    }
}

fn round6(value: f64) -> f64 {
    (value * 1_000_000.0).round() / 1_000_000.0
}

fn read_point(coordinates: &serde_json::Value) -> Option<(f64, f64)> {
    match coordinates {
        // GeoJSON order: [lon, lat]
        serde_json::Value::Array(pair) if pair.len() == 2 => Some((pair[1].as_f64()?, pair[0].as_f64()?)),
        serde_json::Value::Object(object) => Some((
            object.get("lat")?.as_f64()?,
            object.get("lon").or_else(|| object.get("lng"))?.as_f64()?,
        )),
        _ => None,
    }
}

/// Parse stored coordinates and check them against the bounding box.
/// Points outside the box are kept and flagged; points that are not valid
/// coordinates at all are dropped and flagged.
pub fn normalize_geo(coordinates: Option<&str>, bbox: &BoundingBox) -> (Option<GeoPoint>, GeoStatus) {
    let Some(raw) = coordinates else {
        return (None, GeoStatus::Missing);
    };

    let point = serde_json::from_str::<serde_json::Value>(raw)
        .ok()
        .as_ref()
        .and_then(read_point)
        .filter(|(lat, lon)| (-90.0..=90.0).contains(lat) && (-180.0..=180.0).contains(lon));

    match point {
        None => (None, GeoStatus::Unparseable),
        Some((lat, lon)) => {
            let point = GeoPoint {
                lat: round6(lat),
                lon: round6(lon),
            };
            let status = if bbox.contains(point.lat, point.lon) {
                GeoStatus::Valid
            } else {
                GeoStatus::OutOfBounds
            };
            (Some(point), status)
        }
    }
}

/// Derive the curated document for one staging row
pub fn enrich(row: &StagingRow, rules: &EnrichmentRules) -> CuratedDocument {
    let labels = extract_labels(row.description.as_deref(), &rules.vocabulary);
    let permit_class = classify_permit(row.application_type.as_deref(), &labels);
    let (geo_point, geo_status) = normalize_geo(row.coordinates.as_deref(), &rules.bounding_box);
    let enrichment = match geo_status {
        GeoStatus::Valid | GeoStatus::Missing => EnrichmentStatus::Complete,
        GeoStatus::OutOfBounds | GeoStatus::Unparseable => EnrichmentStatus::Degraded,
    };

    CuratedDocument {
        permit_id: row.permit_id.clone(),
        application_type: row.application_type.clone(),
        building_type: row.building_type.clone(),
        value: row.value,
        ward: row.ward.clone(),
        description: row.description.clone(),
        issued_date: row.issued_date,
        location: row.location.clone(),
        contractor: row.contractor.clone(),
        permit_class,
        value_category: categorize(row.value, &rules.thresholds),
        labels,
        geo_point,
        geo_status,
        enrichment,
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CurationOutcome {
    pub documents: usize,
    pub degraded: usize,
    pub out_of_bounds: usize,
    pub pruned: usize,
}

pub struct CurationEnricher {
    staging: Arc<dyn RelationalStore>,
    documents: Arc<dyn DocumentStore>,
    rules: Arc<EnrichmentRules>,
    batch_size: usize,
    concurrency: usize,
    call_timeout: Duration,
}

impl CurationEnricher {
    pub fn new(
        staging: Arc<dyn RelationalStore>,
        documents: Arc<dyn DocumentStore>,
        rules: EnrichmentRules,
        batch_size: usize,
        concurrency: usize,
        call_timeout: Duration,
    ) -> Self {
        Self {
            staging,
            documents,
            rules: Arc::new(rules),
            batch_size: batch_size.max(1),
            concurrency: concurrency.max(1),
            call_timeout,
        }
    }

    /// Enrich rows on blocking workers, one chunk each, preserving order
    async fn enrich_all(&self, rows: Vec<StagingRow>) -> Result<Vec<CuratedDocument>> {
        let chunks: Vec<Vec<StagingRow>> = rows.chunks(self.batch_size).map(<[_]>::to_vec).collect();

        let enriched: Vec<Vec<CuratedDocument>> = stream::iter(chunks)
            .map(|chunk| {
                let rules = Arc::clone(&self.rules);
                tokio::task::spawn_blocking(move || {
                    chunk.iter().map(|row| enrich(row, &rules)).collect::<Vec<_>>()
                })
            })
            .buffered(self.concurrency)
            .map_err(|e| PipelineError::consistency(format!("enrichment worker failed: {}", e)))
            .try_collect()
            .await?;

        Ok(enriched.into_iter().flatten().collect())
    }

    /// Rebuild the curated collection from the current staging table
    #[instrument(skip(self))]
    pub async fn curate(&self) -> Result<CurationOutcome> {
        let rows = with_timeout("relational store", self.call_timeout, self.staging.fetch_rows()).await?;
        let row_count = rows.len();

        let documents = self.enrich_all(rows).await?;

        let degraded = documents
            .iter()
            .filter(|d| d.enrichment == EnrichmentStatus::Degraded)
            .count();
        let out_of_bounds = documents
            .iter()
            .filter(|d| d.geo_status == GeoStatus::OutOfBounds)
            .count();
        if degraded > 0 {
            warn!(degraded, out_of_bounds, "Documents stored with degraded enrichment");
        }

        let snapshot = with_timeout(
            "document store",
            self.call_timeout,
            self.documents.replace_all(&documents),
        )
        .await?;

        let stored = with_timeout("document store", self.call_timeout, self.documents.count()).await?;
        if stored != row_count as u64 {
            return Err(PipelineError::consistency(format!(
                "curated holds {} documents for {} staging rows",
                stored, row_count
            )));
        }

        let outcome = CurationOutcome {
            documents: snapshot.upserted,
            degraded,
            out_of_bounds,
            pruned: snapshot.pruned,
        };
        info!(
            documents = outcome.documents,
            degraded = outcome.degraded,
            pruned = outcome.pruned,
            "Curation complete"
        );

        Ok(outcome)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn rules() -> EnrichmentRules {
        EnrichmentRules::default()
    }

    fn row(id: &str, description: &str, coordinates: Option<&str>) -> StagingRow {
        StagingRow {
            permit_id: id.to_string(),
            application_type: Some("Construction".to_string()),
            building_type: None,
            value: 75_000.0,
            ward: None,
            description: Some(description.to_string()),
            issued_date: NaiveDate::from_ymd_opt(2024, 4, 9).unwrap(),
            location: None,
            contractor: None,
            geometry_type: Some("Point".to_string()),
            coordinates: coordinates.map(str::to_string),
        }
    }

    #[test]
    fn test_category_boundaries() {
        let thresholds = ValueThresholds {
            low: 250_000.0,
            high: 1_000_000.0,
        };
        assert_eq!(categorize(249_999.0, &thresholds), ValueCategory::Low);
        assert_eq!(categorize(250_000.0, &thresholds), ValueCategory::Medium);
        assert_eq!(categorize(999_999.99, &thresholds), ValueCategory::Medium);
        assert_eq!(categorize(1_000_000.0, &thresholds), ValueCategory::High);
    }

    #[test]
    fn test_labels_match_whole_tokens_and_phrases() {
        let vocabulary = rules().vocabulary;
        assert_eq!(
            extract_labels(Some("Install in-ground POOL and hot tub; new roof"), &vocabulary),
            vec!["pool", "roofing"]
        );
        assert_eq!(
            extract_labels(Some("Tenant fit-up, 3rd floor"), &vocabulary),
            vec!["tenant_fitup"]
        );
        assert_eq!(
            extract_labels(Some("Construct 2 stacked dwellings"), &vocabulary),
            vec!["stacked_dwelling"]
        );
        // "spa" must not match inside "space"
        assert!(extract_labels(Some("Office space renovation"), &vocabulary).is_empty());
        assert!(extract_labels(None, &vocabulary).is_empty());
    }

    #[test]
    fn test_permit_class() {
        assert_eq!(classify_permit(Some("Demolition"), &[]), PermitClass::Demolition);
        assert_eq!(
            classify_permit(Some("Interior Alteration"), &[]),
            PermitClass::Renovation
        );
        assert_eq!(
            classify_permit(Some("Construction"), &["renovation".to_string()]),
            PermitClass::Renovation
        );
        assert_eq!(classify_permit(None, &[]), PermitClass::Construction);
    }

    #[test]
    fn test_geo_normalization() {
        let bbox = rules().bounding_box;
        let (point, status) = normalize_geo(Some("[-75.6972094, 45.4215296]"), &bbox);
        assert_eq!(status, GeoStatus::Valid);
        assert_eq!(point, Some(GeoPoint { lat: 45.42153, lon: -75.697209 }));

        let (point, status) = normalize_geo(Some("[-79.3832, 43.6532]"), &bbox);
        assert_eq!(status, GeoStatus::OutOfBounds);
        assert!(point.is_some());

        assert_eq!(normalize_geo(Some("[200.0, 45.4]"), &bbox), (None, GeoStatus::Unparseable));
        assert_eq!(normalize_geo(Some("not json"), &bbox), (None, GeoStatus::Unparseable));
        assert_eq!(normalize_geo(None, &bbox), (None, GeoStatus::Missing));
    }

    #[test]
    fn test_bad_geo_degrades_but_keeps_document() {
        let doc = enrich(&row("P1", "New deck", Some("{\"x\": 1}")), &rules());
        assert_eq!(doc.enrichment, EnrichmentStatus::Degraded);
        assert_eq!(doc.geo_status, GeoStatus::Unparseable);
        assert_eq!(doc.labels, vec!["deck"]);
    }

    #[test]
    fn test_enrichment_is_deterministic() {
        let row = row("P1", "Garage and deck", Some("[-75.7, 45.4]"));
        let a = serde_json::to_vec(&enrich(&row, &rules())).unwrap();
        let b = serde_json::to_vec(&enrich(&row, &rules())).unwrap();
        assert_eq!(a, b);
    }
}
