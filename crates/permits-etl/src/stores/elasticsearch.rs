//! Elasticsearch-compatible search index over its REST API

use async_trait::async_trait;
use permits_common::{PipelineError, Result};
use reqwest::{Client, Response, StatusCode, Url};
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

use super::{IndexMapping, SearchIndex};
use crate::config::SearchConfig;
use crate::models::IndexedEntry;

const SERVICE: &str = "elasticsearch";

/// Page size when scanning content hashes
const SCAN_PAGE_SIZE: usize = 1000;

#[derive(Clone)]
pub struct ElasticsearchIndex {
    client: Client,
    base_url: String,
}

#[derive(Debug, Deserialize)]
struct BulkResponse {
    errors: bool,
    #[serde(default)]
    items: Vec<BTreeMap<String, BulkItem>>,
}

#[derive(Debug, Deserialize)]
struct BulkItem {
    #[serde(rename = "_id")]
    id: Option<String>,
    status: u16,
    #[serde(default)]
    error: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct SearchResponse {
    hits: SearchHits,
}

#[derive(Debug, Deserialize)]
struct SearchHits {
    hits: Vec<SearchHit>,
}

#[derive(Debug, Deserialize)]
struct SearchHit {
    #[serde(rename = "_id")]
    id: String,
    #[serde(rename = "_source", default)]
    source: Value,
    #[serde(default)]
    sort: Vec<Value>,
}

#[derive(Debug, Deserialize)]
struct GetResponse {
    found: bool,
    #[serde(rename = "_source")]
    source: Option<IndexedEntry>,
}

#[derive(Debug, Deserialize)]
struct CountResponse {
    count: u64,
}

fn transport(err: reqwest::Error) -> PipelineError {
    if err.is_decode() {
        PipelineError::schema("search response", err)
    } else {
        PipelineError::connectivity(SERVICE, err)
    }
}

/// Turn a non-success response into a classified error
async fn status_error(index: &str, response: Response) -> PipelineError {
    let status = response.status();
    let body = response.text().await.unwrap_or_default();
    let message = format!("HTTP {}: {}", status, body);

    if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
        PipelineError::connectivity(SERVICE, message)
    } else if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
        PipelineError::config(format!("search engine rejected credentials: {}", message))
    } else {
        PipelineError::schema(index, message)
    }
}

/// Classify per-item bulk failures: any throttled or server-side item makes
/// the whole batch retryable, otherwise the documents do not fit the mapping
fn bulk_failure(index: &str, failed: &[&BulkItem]) -> PipelineError {
    let summary = failed
        .iter()
        .take(3)
        .map(|item| {
            format!(
                "{}: {}",
                item.id.as_deref().unwrap_or("?"),
                item.error
                    .as_ref()
                    .and_then(|e| e.get("reason"))
                    .and_then(Value::as_str)
                    .unwrap_or("unknown error")
            )
        })
        .collect::<Vec<_>>()
        .join("; ");
    let message = format!("{} bulk item(s) failed: {}", failed.len(), summary);

    if failed.iter().any(|item| item.status == 429 || item.status >= 500) {
        PipelineError::connectivity(SERVICE, message)
    } else {
        PipelineError::schema(index, message)
    }
}

impl ElasticsearchIndex {
    pub fn new(config: &SearchConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| PipelineError::config(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            base_url: config.url.trim_end_matches('/').to_string(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path)
    }

    /// Document URL with the id percent-encoded as a single path segment
    fn doc_url(&self, name: &str, id: &str) -> Result<Url> {
        let mut url = Url::parse(&self.base_url)
            .map_err(|e| PipelineError::config(format!("invalid search URL {}: {}", self.base_url, e)))?;
        url.path_segments_mut()
            .map_err(|_| PipelineError::config(format!("search URL {} cannot take a path", self.base_url)))?
            .pop_if_empty()
            .extend([name, "_doc", id]);
        Ok(url)
    }

    async fn index_exists(&self, name: &str) -> Result<bool> {
        let response = self.client.head(self.url(name)).send().await.map_err(transport)?;
        match response.status() {
            StatusCode::OK => Ok(true),
            StatusCode::NOT_FOUND => Ok(false),
            _ => Err(status_error(name, response).await),
        }
    }

    async fn verify_mapping(&self, name: &str, mapping: &IndexMapping) -> Result<()> {
        let response = self
            .client
            .get(self.url(&format!("{}/_mapping", name)))
            .send()
            .await
            .map_err(transport)?;
        if !response.status().is_success() {
            return Err(status_error(name, response).await);
        }

        let body: Value = response.json().await.map_err(transport)?;
        let existing = body
            .get(name)
            .and_then(|index| index.get("mappings"))
            .and_then(|mappings| mappings.get("properties"))
            .cloned()
            .unwrap_or(Value::Null);

        if existing == Value::Object(mapping.properties.clone()) {
            debug!(index = name, "Index exists with matching mapping");
            Ok(())
        } else {
            Err(PipelineError::schema(
                name,
                "index exists with a different mapping; run a full rebuild",
            ))
        }
    }

    async fn send_bulk(&self, index: &str, body: String) -> Result<BulkResponse> {
        let response = self
            .client
            .post(self.url("_bulk?refresh=wait_for"))
            .header(reqwest::header::CONTENT_TYPE, "application/x-ndjson")
            .body(body)
            .send()
            .await
            .map_err(transport)?;

        if !response.status().is_success() {
            return Err(status_error(index, response).await);
        }
        response.json().await.map_err(transport)
    }
}

#[async_trait]
impl SearchIndex for ElasticsearchIndex {
    #[instrument(skip(self, mapping))]
    async fn create_index(&self, name: &str, mapping: &IndexMapping) -> Result<()> {
        if self.index_exists(name).await? {
            return self.verify_mapping(name, mapping).await;
        }

        let response = self
            .client
            .put(self.url(name))
            .json(&json!({ "mappings": mapping.to_json() }))
            .send()
            .await
            .map_err(transport)?;

        if response.status().is_success() {
            info!(index = name, "Created search index");
            return Ok(());
        }

        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        if status == StatusCode::BAD_REQUEST && body.contains("resource_already_exists_exception") {
            // Created concurrently; same rules as an existing index
            return self.verify_mapping(name, mapping).await;
        }

        if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
            Err(PipelineError::connectivity(SERVICE, format!("HTTP {}: {}", status, body)))
        } else {
            Err(PipelineError::schema(name, format!("HTTP {}: {}", status, body)))
        }
    }

    #[instrument(skip(self))]
    async fn delete_index(&self, name: &str) -> Result<()> {
        let response = self.client.delete(self.url(name)).send().await.map_err(transport)?;
        match response.status() {
            status if status.is_success() => {
                info!(index = name, "Deleted search index");
                Ok(())
            }
            StatusCode::NOT_FOUND => Ok(()),
            _ => Err(status_error(name, response).await),
        }
    }

    #[instrument(skip(self, entries), fields(entries = entries.len()))]
    async fn bulk_upsert(&self, name: &str, entries: &[IndexedEntry]) -> Result<usize> {
        if entries.is_empty() {
            return Ok(0);
        }

        let mut body = String::new();
        for entry in entries {
            body.push_str(&serde_json::to_string(&json!({
                "index": { "_index": name, "_id": entry.permit_id }
            }))?);
            body.push('\n');
            body.push_str(&serde_json::to_string(entry)?);
            body.push('\n');
        }

        let response = self.send_bulk(name, body).await?;
        let failed: Vec<&BulkItem> = response
            .items
            .iter()
            .flat_map(|item| item.values())
            .filter(|item| item.status >= 300)
            .collect();

        if response.errors || !failed.is_empty() {
            warn!(index = name, failed = failed.len(), "Bulk upsert reported failures");
            return Err(bulk_failure(name, &failed));
        }

        Ok(entries.len())
    }

    #[instrument(skip(self, ids), fields(ids = ids.len()))]
    async fn bulk_delete(&self, name: &str, ids: &[String]) -> Result<usize> {
        if ids.is_empty() {
            return Ok(0);
        }

        let mut body = String::new();
        for id in ids {
            body.push_str(&serde_json::to_string(&json!({
                "delete": { "_index": name, "_id": id }
            }))?);
            body.push('\n');
        }

        let response = self.send_bulk(name, body).await?;
        let items: Vec<&BulkItem> = response.items.iter().flat_map(|item| item.values()).collect();

        // A delete of an already-absent entry reports 404 and is fine
        let failed: Vec<&BulkItem> = items
            .iter()
            .copied()
            .filter(|item| item.status >= 300 && item.status != 404)
            .collect();
        if !failed.is_empty() {
            return Err(bulk_failure(name, &failed));
        }

        Ok(items.iter().filter(|item| item.status < 300).count())
    }

    async fn get(&self, name: &str, id: &str) -> Result<Option<IndexedEntry>> {
        let response = self
            .client
            .get(self.doc_url(name, id)?)
            .send()
            .await
            .map_err(transport)?;

        match response.status() {
            StatusCode::NOT_FOUND => Ok(None),
            status if status.is_success() => {
                let body: GetResponse = response.json().await.map_err(transport)?;
                Ok(if body.found { body.source } else { None })
            }
            _ => Err(status_error(name, response).await),
        }
    }

    #[instrument(skip(self))]
    async fn content_hashes(&self, name: &str) -> Result<BTreeMap<String, String>> {
        let mut hashes = BTreeMap::new();
        let mut search_after: Option<Vec<Value>> = None;

        loop {
            let mut query = json!({
                "size": SCAN_PAGE_SIZE,
                "_source": ["content_hash"],
                "sort": [{ "permit_id": "asc" }],
                "track_total_hits": false,
            });
            if let Some(after) = &search_after {
                query["search_after"] = Value::Array(after.clone());
            }

            let response = self
                .client
                .post(self.url(&format!("{}/_search", name)))
                .json(&query)
                .send()
                .await
                .map_err(transport)?;

            if response.status() == StatusCode::NOT_FOUND {
                return Ok(hashes);
            }
            if !response.status().is_success() {
                return Err(status_error(name, response).await);
            }

            let page: SearchResponse = response.json().await.map_err(transport)?;
            let page_len = page.hits.hits.len();
            for hit in page.hits.hits {
                let hash = hit
                    .source
                    .get("content_hash")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string();
                search_after = Some(hit.sort);
                hashes.insert(hit.id, hash);
            }

            if page_len < SCAN_PAGE_SIZE {
                return Ok(hashes);
            }
        }
    }

    async fn count(&self, name: &str) -> Result<u64> {
        let response = self
            .client
            .get(self.url(&format!("{}/_count", name)))
            .send()
            .await
            .map_err(transport)?;

        match response.status() {
            StatusCode::NOT_FOUND => Ok(0),
            status if status.is_success() => {
                let body: CountResponse = response.json().await.map_err(transport)?;
                Ok(body.count)
            }
            _ => Err(status_error(name, response).await),
        }
    }
}
