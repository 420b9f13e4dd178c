//! Staging zone: parse and validate a raw snapshot, then replace the
//! staging table with its valid rows
//!
//! Accepted raw shapes:
//! - a JSON array of records
//! - a GeoJSON-style object with a `features` array
//! - JSON lines, one record per line
//!
//! A record is either flat (`{"PERMIT": .., "VALUE": ..}`) or nested as
//! `{"permits": {..}, "properties": {..}, "geometry": {"type", "coordinates"}}`.
//! Field names are matched case-insensitively.

use chrono::{DateTime, NaiveDate, NaiveDateTime};
use permits_common::{PipelineError, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::models::{RejectedRecord, StagingRow};
use crate::retry::with_timeout;
use crate::stores::RelationalStore;

const PERMIT_ID_FIELDS: &[&str] = &["PERMIT", "PERMIT_ID", "PERMIT_NUMBER"];
const VALUE_FIELDS: &[&str] = &["VALUE", "PERMIT_VALUE"];
const ISSUED_DATE_FIELDS: &[&str] = &["ISSUED_DATE", "ISSUE_DATE", "ISSUED"];
const APPL_TYPE_FIELDS: &[&str] = &["APPL_TYPE", "APPLICATION_TYPE"];
const BLG_TYPE_FIELDS: &[&str] = &["BLG_TYPE", "BUILDING_TYPE"];
const LOCATION_FIELDS: &[&str] = &["LOCATION", "ADDRESS"];

/// A raw record that could not be read as JSON at all
#[derive(Debug, Clone)]
pub struct UnreadableRecord {
    pub position: usize,
    pub text: String,
    pub reason: String,
}

/// Split raw bytes into records. Only a malformed array or feature
/// collection fails the whole snapshot; a bad JSON line is one reject.
pub fn parse_snapshot(bytes: &[u8]) -> Result<Vec<std::result::Result<Value, UnreadableRecord>>> {
    let text = std::str::from_utf8(bytes)
        .map_err(|e| PipelineError::schema("raw snapshot", format!("not UTF-8: {}", e)))?;
    let trimmed = text.trim_start();

    if trimmed.is_empty() {
        return Ok(Vec::new());
    }

    if trimmed.starts_with('[') {
        let records: Vec<Value> = serde_json::from_str(trimmed)
            .map_err(|e| PipelineError::schema("raw snapshot", format!("malformed JSON array: {}", e)))?;
        return Ok(records.into_iter().map(Ok).collect());
    }

    if let Ok(document) = serde_json::from_str::<Value>(trimmed) {
        return match document {
            Value::Object(mut object) if object.contains_key("features") => match object.remove("features") {
                Some(Value::Array(features)) => Ok(features.into_iter().map(Ok).collect()),
                _ => Err(PipelineError::schema("raw snapshot", "'features' is not an array")),
            },
            other => Ok(vec![Ok(other)]),
        };
    }

    Ok(text
        .lines()
        .filter(|line| !line.trim().is_empty())
        .enumerate()
        .map(|(position, line)| {
            serde_json::from_str::<Value>(line).map_err(|e| UnreadableRecord {
                position,
                text: line.to_string(),
                reason: format!("unparseable JSON line: {}", e),
            })
        })
        .collect())
}

/// Merge the nested source shape into one upper-cased field map
fn flatten(record: &Map<String, Value>) -> BTreeMap<String, Value> {
    let mut fields = BTreeMap::new();

    for (key, value) in record {
        match (key.as_str(), value) {
            ("permits" | "properties", Value::Object(inner)) => {
                for (k, v) in inner {
                    fields.insert(k.to_uppercase(), v.clone());
                }
            }
            ("geometry", Value::Object(geometry)) => {
                if let Some(kind) = geometry.get("type") {
                    fields.insert("GEOMETRY_TYPE".to_string(), kind.clone());
                }
                if let Some(coordinates) = geometry.get("coordinates") {
                    fields.insert("COORDINATES".to_string(), coordinates.clone());
                }
            }
            _ => {
                fields.entry(key.to_uppercase()).or_insert_with(|| value.clone());
            }
        }
    }

    fields
}

fn first<'a>(fields: &'a BTreeMap<String, Value>, names: &[&str]) -> Option<&'a Value> {
    names
        .iter()
        .filter_map(|name| fields.get(*name))
        .find(|value| !value.is_null())
}

/// Non-empty trimmed text; numbers are rendered as written
fn text(value: Option<&Value>) -> Option<String> {
    match value? {
        Value::String(s) => {
            let s = s.trim();
            (!s.is_empty()).then(|| s.to_string())
        }
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

fn permit_id(fields: &BTreeMap<String, Value>) -> Result<String> {
    match first(fields, PERMIT_ID_FIELDS) {
        Some(Value::Number(n)) if n.is_i64() || n.is_u64() => Ok(n.to_string()),
        Some(Value::String(s)) if !s.trim().is_empty() => Ok(s.trim().to_string()),
        Some(other) => Err(PipelineError::validation(format!("invalid PERMIT identifier: {}", other))),
        None => Err(PipelineError::validation("missing required field PERMIT")),
    }
}

/// Monetary value: a JSON number, or a string such as "$12,500.00"
fn permit_value(fields: &BTreeMap<String, Value>) -> Result<f64> {
    let value = match first(fields, VALUE_FIELDS) {
        Some(Value::Number(n)) => n.as_f64(),
        Some(Value::String(s)) => {
            let cleaned: String = s.trim().chars().filter(|c| *c != '$' && *c != ',').collect();
            cleaned.parse::<f64>().ok()
        }
        Some(other) => {
            return Err(PipelineError::validation(format!("non-numeric VALUE: {}", other)));
        }
        None => return Err(PipelineError::validation("missing required field VALUE")),
    };

    match value {
        Some(v) if v.is_finite() && v >= 0.0 => Ok(v),
        Some(v) => Err(PipelineError::validation(format!("VALUE out of range: {}", v))),
        None => Err(PipelineError::validation(format!(
            "non-numeric VALUE: {}",
            first(fields, VALUE_FIELDS).map(|v| v.to_string()).unwrap_or_default()
        ))),
    }
}

/// Parse an issue date. Accepts ISO dates, `YYYY/MM/DD`, RFC 3339 and naive
/// timestamps, and epoch milliseconds.
pub fn parse_issued_date(value: &Value) -> Option<NaiveDate> {
    match value {
        Value::String(s) => {
            let s = s.trim();
            NaiveDate::parse_from_str(s, "%Y-%m-%d")
                .or_else(|_| NaiveDate::parse_from_str(s, "%Y/%m/%d"))
                .ok()
                .or_else(|| DateTime::parse_from_rfc3339(s).ok().map(|dt| dt.date_naive()))
                .or_else(|| {
                    ["%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S%.f"]
                        .iter()
                        .find_map(|format| NaiveDateTime::parse_from_str(s, format).ok())
                        .map(|dt| dt.date())
                })
        }
        Value::Number(n) => n
            .as_i64()
            .and_then(DateTime::from_timestamp_millis)
            .map(|dt| dt.date_naive()),
        _ => None,
    }
}

fn issued_date(fields: &BTreeMap<String, Value>) -> Result<NaiveDate> {
    match first(fields, ISSUED_DATE_FIELDS) {
        Some(value) => parse_issued_date(value)
            .ok_or_else(|| PipelineError::validation(format!("unparseable ISSUED_DATE: {}", value))),
        None => Err(PipelineError::validation("missing required field ISSUED_DATE")),
    }
}

fn coordinates(fields: &BTreeMap<String, Value>) -> Option<String> {
    match fields.get("COORDINATES")? {
        Value::Null => None,
        Value::String(s) if s.trim().is_empty() => None,
        Value::String(s) => Some(s.trim().to_string()),
        other => Some(other.to_string()),
    }
}

/// Outcome of validating one raw record
#[derive(Debug, Clone, PartialEq)]
pub enum Validated {
    Valid(StagingRow),
    Rejected(RejectedRecord),
}

/// Validate one raw record into a staging row or a reject. Required fields
/// are the identifier, value and issue date; other fields are nulled when
/// absent or empty.
pub fn validate_record(position: usize, raw: &Value) -> Validated {
    let reject = |permit_id: Option<String>, error: PipelineError| {
        let reason = match error {
            PipelineError::Validation(reason) => reason,
            other => other.to_string(),
        };
        Validated::Rejected(RejectedRecord {
            position: position as i64,
            permit_id,
            reason,
            raw: raw.clone(),
        })
    };

    let Value::Object(object) = raw else {
        return reject(None, PipelineError::validation("record is not a JSON object"));
    };
    let fields = flatten(object);

    let permit_id = match permit_id(&fields) {
        Ok(id) => id,
        Err(e) => return reject(None, e),
    };
    let value = match permit_value(&fields) {
        Ok(v) => v,
        Err(e) => return reject(Some(permit_id), e),
    };
    let issued_date = match issued_date(&fields) {
        Ok(d) => d,
        Err(e) => return reject(Some(permit_id), e),
    };

    Validated::Valid(StagingRow {
        permit_id,
        application_type: text(first(&fields, APPL_TYPE_FIELDS)),
        building_type: text(first(&fields, BLG_TYPE_FIELDS)),
        value,
        ward: text(fields.get("WARD")),
        description: text(fields.get("DESCRIPTION")),
        issued_date,
        location: text(first(&fields, LOCATION_FIELDS)),
        contractor: text(fields.get("CONTRACTOR")),
        geometry_type: text(fields.get("GEOMETRY_TYPE")),
        coordinates: coordinates(&fields),
    })
}

/// Validated, de-duplicated snapshot ready to commit
#[derive(Debug, Clone, Default)]
pub struct PreparedSnapshot {
    /// Ordered by permit id
    pub rows: Vec<StagingRow>,
    pub rejects: Vec<RejectedRecord>,
    /// Earlier occurrences of an identifier that a later record replaced
    pub superseded: usize,
    pub records: usize,
}

/// Parse and validate raw bytes without touching any store
pub fn prepare(bytes: &[u8]) -> Result<PreparedSnapshot> {
    let mut rows: BTreeMap<String, StagingRow> = BTreeMap::new();
    let mut prepared = PreparedSnapshot::default();

    for (position, record) in parse_snapshot(bytes)?.into_iter().enumerate() {
        prepared.records += 1;
        let record = match record {
            Ok(value) => value,
            Err(unreadable) => {
                prepared.rejects.push(RejectedRecord {
                    position: unreadable.position as i64,
                    permit_id: None,
                    reason: unreadable.reason,
                    raw: Value::String(unreadable.text),
                });
                continue;
            }
        };

        match validate_record(position, &record) {
            Validated::Valid(row) => {
                if rows.insert(row.permit_id.clone(), row).is_some() {
                    prepared.superseded += 1;
                }
            }
            Validated::Rejected(reject) => {
                debug!(position, reason = %reject.reason, "Record rejected");
                prepared.rejects.push(reject);
            }
        }
    }

    prepared.rows = rows.into_values().collect();
    Ok(prepared)
}

/// Result of one staging load
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StagingOutcome {
    pub records: usize,
    pub loaded: usize,
    pub rejected: usize,
    pub superseded: usize,
    pub pruned: usize,
}

pub struct StagingLoader {
    store: Arc<dyn RelationalStore>,
    call_timeout: Duration,
}

impl StagingLoader {
    pub fn new(store: Arc<dyn RelationalStore>, call_timeout: Duration) -> Self {
        Self { store, call_timeout }
    }

    /// Replace the staging table with the snapshot's valid rows
    #[instrument(skip(self, bytes), fields(%run_id, size = bytes.len()))]
    pub async fn load(&self, run_id: Uuid, bytes: &[u8]) -> Result<StagingOutcome> {
        let prepared = prepare(bytes)?;

        if !prepared.rejects.is_empty() {
            warn!(
                rejected = prepared.rejects.len(),
                records = prepared.records,
                "Records failed validation and were routed to rejects"
            );
        }

        let snapshot = with_timeout(
            "relational store",
            self.call_timeout,
            self.store.replace_snapshot(run_id, &prepared.rows, &prepared.rejects),
        )
        .await?;

        let summary = with_timeout("relational store", self.call_timeout, self.store.summary()).await?;
        if summary.row_count != prepared.rows.len() as u64 {
            return Err(PipelineError::consistency(format!(
                "staging holds {} rows after loading {}",
                summary.row_count,
                prepared.rows.len()
            )));
        }

        let outcome = StagingOutcome {
            records: prepared.records,
            loaded: snapshot.upserted,
            rejected: prepared.rejects.len(),
            superseded: prepared.superseded,
            pruned: snapshot.pruned,
        };

        info!(
            loaded = outcome.loaded,
            rejected = outcome.rejected,
            superseded = outcome.superseded,
            pruned = outcome.pruned,
            "Staging loaded"
        );

        Ok(outcome)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::stores::MemoryRelationalStore;
    use serde_json::json;

    fn valid(id: &str) -> Value {
        json!({
            "PERMIT": id,
            "APPL_TYPE": "Construction",
            "VALUE": 1500.5,
            "ISSUED_DATE": "2024-06-01",
            "DESCRIPTION": "  Construct a detached garage  ",
            "WARD": 7
        })
    }

    fn row(validated: Validated) -> StagingRow {
        match validated {
            Validated::Valid(row) => row,
            Validated::Rejected(reject) => panic!("unexpected reject: {}", reject.reason),
        }
    }

    fn reason(validated: Validated) -> String {
        match validated {
            Validated::Rejected(reject) => reject.reason,
            Validated::Valid(row) => panic!("unexpected valid row {}", row.permit_id),
        }
    }

    #[test]
    fn test_flat_record() {
        let row = row(validate_record(0, &valid("24-001")));
        assert_eq!(row.permit_id, "24-001");
        assert_eq!(row.value, 1500.5);
        assert_eq!(row.issued_date, NaiveDate::from_ymd_opt(2024, 6, 1).unwrap());
        assert_eq!(row.description.as_deref(), Some("Construct a detached garage"));
        assert_eq!(row.ward.as_deref(), Some("7"));
        assert_eq!(row.location, None);
    }

    #[test]
    fn test_nested_record() {
        let raw = json!({
            "permits": {
                "PERMIT": 2401234,
                "VALUE": "$250,000",
                "ISSUED_DATE": "2024-02-03T00:00:00Z",
                "BLG_TYPE": "Rowhouse"
            },
            "properties": { "location": "100 Main St" },
            "geometry": { "type": "Point", "coordinates": [-75.69, 45.42] }
        });

        let row = row(validate_record(0, &raw));
        assert_eq!(row.permit_id, "2401234");
        assert_eq!(row.value, 250_000.0);
        assert_eq!(row.issued_date, NaiveDate::from_ymd_opt(2024, 2, 3).unwrap());
        assert_eq!(row.location.as_deref(), Some("100 Main St"));
        assert_eq!(row.geometry_type.as_deref(), Some("Point"));
        assert_eq!(row.coordinates.as_deref(), Some("[-75.69,45.42]"));
    }

    #[test]
    fn test_required_fields() {
        let mut raw = valid("A");
        raw.as_object_mut().unwrap().remove("PERMIT");
        assert_eq!(reason(validate_record(0, &raw)), "missing required field PERMIT");

        let mut raw = valid("A");
        raw["PERMIT"] = json!("   ");
        assert!(matches!(validate_record(0, &raw), Validated::Rejected(_)));

        let mut raw = valid("A");
        raw["VALUE"] = json!("twelve");
        assert!(reason(validate_record(0, &raw)).starts_with("non-numeric VALUE"));

        let mut raw = valid("A");
        raw["VALUE"] = json!(-5);
        assert!(reason(validate_record(0, &raw)).starts_with("VALUE out of range"));

        let mut raw = valid("A");
        raw["ISSUED_DATE"] = json!("03/02/2024");
        assert!(reason(validate_record(0, &raw)).starts_with("unparseable ISSUED_DATE"));

        assert_eq!(reason(validate_record(0, &json!([1, 2]))), "record is not a JSON object");
    }

    #[test]
    fn test_date_formats() {
        let expected = NaiveDate::from_ymd_opt(2023, 11, 30);
        for value in [
            json!("2023-11-30"),
            json!("2023/11/30"),
            json!("2023-11-30T14:05:00"),
            json!("2023-11-30 14:05:00"),
            json!("2023-11-30T14:05:00-05:00"),
            json!(1_701_352_800_000i64),
        ] {
            assert_eq!(parse_issued_date(&value), expected, "{}", value);
        }
    }

    #[test]
    fn test_json_lines_with_bad_line() {
        let bytes = b"{\"PERMIT\":\"A\",\"VALUE\":1,\"ISSUED_DATE\":\"2024-01-01\"}\n\nnot json\n{\"PERMIT\":\"B\",\"VALUE\":2,\"ISSUED_DATE\":\"2024-01-02\"}\n";
        let prepared = prepare(bytes).unwrap();
        assert_eq!(prepared.records, 3);
        assert_eq!(prepared.rows.len(), 2);
        assert_eq!(prepared.rejects.len(), 1);
        assert_eq!(prepared.rejects[0].raw, json!("not json"));
    }

    #[test]
    fn test_feature_collection() {
        let bytes = serde_json::to_vec(&json!({
            "type": "FeatureCollection",
            "features": [
                { "properties": { "PERMIT": "A", "VALUE": 1, "ISSUED_DATE": "2024-01-01" },
                  "geometry": { "type": "Point", "coordinates": [-75.7, 45.4] } }
            ]
        }))
        .unwrap();
        let prepared = prepare(&bytes).unwrap();
        assert_eq!(prepared.rows.len(), 1);
        assert_eq!(prepared.rows[0].geometry_type.as_deref(), Some("Point"));
    }

    #[test]
    fn test_malformed_array_is_schema_error() {
        let err = prepare(b"[{\"PERMIT\": \"A\"").unwrap_err();
        assert_eq!(err.kind(), permits_common::ErrorKind::Schema);
    }

    #[test]
    fn test_duplicate_ids_last_wins() {
        let mut second = valid("A");
        second["VALUE"] = json!(99);
        let bytes = serde_json::to_vec(&json!([valid("A"), valid("B"), second])).unwrap();

        let prepared = prepare(&bytes).unwrap();
        assert_eq!(prepared.superseded, 1);
        assert_eq!(prepared.rows.len(), 2);
        assert_eq!(prepared.rows[0].permit_id, "A");
        assert_eq!(prepared.rows[0].value, 99.0);
    }

    #[tokio::test]
    async fn test_nine_valid_one_missing_id() {
        let mut records: Vec<Value> = (1..=9).map(|i| valid(&format!("P{}", i))).collect();
        let mut broken = valid("P10");
        broken.as_object_mut().unwrap().remove("PERMIT");
        records.insert(4, broken);
        let bytes = serde_json::to_vec(&records).unwrap();

        let store = Arc::new(MemoryRelationalStore::new());
        let loader = StagingLoader::new(store.clone(), Duration::from_secs(5));
        let run_id = Uuid::new_v4();
        let outcome = loader.load(run_id, &bytes).await.unwrap();

        assert_eq!(outcome.loaded, 9);
        assert_eq!(outcome.rejected, 1);
        assert_eq!(store.fetch_rows().await.unwrap().len(), 9);

        let rejects = store.rejected(run_id).await.unwrap();
        assert_eq!(rejects.len(), 1);
        assert_eq!(rejects[0].position, 4);
        assert_eq!(rejects[0].permit_id, None);
    }

    #[tokio::test]
    async fn test_reload_is_identical() {
        let bytes = serde_json::to_vec(&json!([valid("B"), valid("A")])).unwrap();
        let store = Arc::new(MemoryRelationalStore::new());
        let loader = StagingLoader::new(store.clone(), Duration::from_secs(5));

        loader.load(Uuid::new_v4(), &bytes).await.unwrap();
        let first = store.fetch_rows().await.unwrap();
        loader.load(Uuid::new_v4(), &bytes).await.unwrap();
        assert_eq!(store.fetch_rows().await.unwrap(), first);
    }
}
