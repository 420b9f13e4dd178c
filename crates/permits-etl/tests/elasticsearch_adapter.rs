//! Elasticsearch adapter against a mocked REST API

use chrono::NaiveDate;
use permits_common::ErrorKind;
use permits_etl::config::SearchConfig;
use permits_etl::models::{
    CuratedDocument, EnrichmentStatus, GeoPoint, GeoStatus, IndexedEntry, PermitClass, ValueCategory,
};
use permits_etl::stages::indexer::permit_index_mapping;
use permits_etl::stores::{ElasticsearchIndex, SearchIndex};
use serde_json::json;
use wiremock::matchers::{body_string_contains, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

const INDEX: &str = "ottawa_permits";

fn adapter(server: &MockServer) -> ElasticsearchIndex {
    ElasticsearchIndex::new(&SearchConfig {
        url: format!("{}/", server.uri()),
        index_name: INDEX.to_string(),
        timeout_secs: 5,
    })
    .unwrap()
}

fn entry(id: &str) -> IndexedEntry {
    IndexedEntry::from_document(&CuratedDocument {
        permit_id: id.to_string(),
        application_type: Some("Construction".to_string()),
        building_type: Some("Residential".to_string()),
        value: 75_000.0,
        ward: Some("12".to_string()),
        description: Some("Construct a deck".to_string()),
        issued_date: NaiveDate::from_ymd_opt(2024, 3, 15).unwrap(),
        location: Some("123 Main St".to_string()),
        contractor: None,
        permit_class: PermitClass::Construction,
        value_category: ValueCategory::Medium,
        labels: vec!["deck".to_string()],
        geo_point: Some(GeoPoint {
            lat: 45.42,
            lon: -75.69,
        }),
        geo_status: GeoStatus::Valid,
        enrichment: EnrichmentStatus::Complete,
    })
    .unwrap()
}

#[tokio::test]
async fn test_create_index_when_absent() {
    let server = MockServer::start().await;
    Mock::given(method("HEAD"))
        .and(path(format!("/{}", INDEX)))
        .respond_with(ResponseTemplate::new(404))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("PUT"))
        .and(path(format!("/{}", INDEX)))
        .and(body_string_contains("geo_point"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "acknowledged": true })))
        .expect(1)
        .mount(&server)
        .await;

    adapter(&server)
        .create_index(INDEX, &permit_index_mapping())
        .await
        .unwrap();
}

#[tokio::test]
async fn test_create_index_is_idempotent_for_matching_mapping() {
    let server = MockServer::start().await;
    let mapping = permit_index_mapping();
    Mock::given(method("HEAD"))
        .and(path(format!("/{}", INDEX)))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path(format!("/{}/_mapping", INDEX)))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            INDEX: { "mappings": { "properties": mapping.properties } }
        })))
        .mount(&server)
        .await;
    Mock::given(method("PUT"))
        .respond_with(ResponseTemplate::new(500))
        .expect(0)
        .mount(&server)
        .await;

    adapter(&server).create_index(INDEX, &mapping).await.unwrap();
}

#[tokio::test]
async fn test_mapping_mismatch_is_schema_error() {
    let server = MockServer::start().await;
    Mock::given(method("HEAD"))
        .and(path(format!("/{}", INDEX)))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path(format!("/{}/_mapping", INDEX)))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            INDEX: { "mappings": { "properties": { "permit_id": { "type": "text" } } } }
        })))
        .mount(&server)
        .await;

    let err = adapter(&server)
        .create_index(INDEX, &permit_index_mapping())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Schema);
}

#[tokio::test]
async fn test_bulk_upsert_sends_ndjson() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/_bulk"))
        .and(query_param("refresh", "wait_for"))
        .and(body_string_contains(r#""_id":"P1""#))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "errors": false,
            "items": [
                { "index": { "_id": "P1", "status": 201 } },
                { "index": { "_id": "P2", "status": 200 } }
            ]
        })))
        .expect(1)
        .mount(&server)
        .await;

    let written = adapter(&server)
        .bulk_upsert(INDEX, &[entry("P1"), entry("P2")])
        .await
        .unwrap();
    assert_eq!(written, 2);
}

#[tokio::test]
async fn test_bulk_mapping_rejection_is_schema_error() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/_bulk"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "errors": true,
            "items": [
                { "index": { "_id": "P1", "status": 400,
                  "error": { "type": "mapper_parsing_exception", "reason": "failed to parse field [value]" } } }
            ]
        })))
        .mount(&server)
        .await;

    let err = adapter(&server).bulk_upsert(INDEX, &[entry("P1")]).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Schema);
    assert!(err.to_string().contains("failed to parse field"));
}

#[tokio::test]
async fn test_unavailable_engine_is_retryable() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/_bulk"))
        .respond_with(ResponseTemplate::new(503).set_body_string("cluster unavailable"))
        .mount(&server)
        .await;

    let err = adapter(&server).bulk_upsert(INDEX, &[entry("P1")]).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Connectivity);
    assert!(err.is_retryable());
}

#[tokio::test]
async fn test_bulk_delete_tolerates_absent_entries() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/_bulk"))
        .and(body_string_contains("delete"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "errors": false,
            "items": [
                { "delete": { "_id": "P1", "status": 200 } },
                { "delete": { "_id": "P2", "status": 404 } }
            ]
        })))
        .mount(&server)
        .await;

    let deleted = adapter(&server)
        .bulk_delete(INDEX, &["P1".to_string(), "P2".to_string()])
        .await
        .unwrap();
    assert_eq!(deleted, 1);
}

#[tokio::test]
async fn test_missing_index_reads_as_empty() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(format!("/{}/_search", INDEX)))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path(format!("/{}/_count", INDEX)))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;
    Mock::given(method("DELETE"))
        .and(path(format!("/{}", INDEX)))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;

    let index = adapter(&server);
    assert!(index.content_hashes(INDEX).await.unwrap().is_empty());
    assert_eq!(index.count(INDEX).await.unwrap(), 0);
    index.delete_index(INDEX).await.unwrap();
}

#[tokio::test]
async fn test_content_hashes_and_get() {
    let server = MockServer::start().await;
    let stored = entry("P1");
    Mock::given(method("POST"))
        .and(path(format!("/{}/_search", INDEX)))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "hits": { "hits": [
                { "_id": "P1", "_source": { "content_hash": stored.content_hash }, "sort": ["P1"] },
                { "_id": "P2", "_source": { "content_hash": "abc" }, "sort": ["P2"] }
            ] }
        })))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path(format!("/{}/_doc/P1", INDEX)))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "_id": "P1", "found": true, "_source": stored
        })))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path(format!("/{}/_doc/P9", INDEX)))
        .respond_with(ResponseTemplate::new(404).set_body_json(json!({ "_id": "P9", "found": false })))
        .mount(&server)
        .await;

    let index = adapter(&server);
    let hashes = index.content_hashes(INDEX).await.unwrap();
    assert_eq!(hashes.len(), 2);
    assert_eq!(hashes["P1"], stored.content_hash);

    assert_eq!(index.get(INDEX, "P1").await.unwrap(), Some(stored));
    assert_eq!(index.get(INDEX, "P9").await.unwrap(), None);
}

#[tokio::test]
async fn test_rejected_credentials_are_config_errors() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path(format!("/{}/_count", INDEX)))
        .respond_with(ResponseTemplate::new(401))
        .mount(&server)
        .await;

    let err = adapter(&server).count(INDEX).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Config);
}
