//! Configuration management

use permits_common::{PipelineError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use crate::retry::RetryPolicy;

// ============================================================================
// Configuration Constants
// ============================================================================

/// Default database URL for local development.
pub const DEFAULT_DATABASE_URL: &str = "postgresql://localhost/permits";

/// Default maximum database connections in the pool.
pub const DEFAULT_DATABASE_MAX_CONNECTIONS: u32 = 10;

/// Default minimum database connections in the pool.
pub const DEFAULT_DATABASE_MIN_CONNECTIONS: u32 = 1;

/// Default database connection timeout in seconds.
pub const DEFAULT_DATABASE_CONNECT_TIMEOUT_SECS: u64 = 10;

/// Default database idle timeout in seconds (10 minutes).
pub const DEFAULT_DATABASE_IDLE_TIMEOUT_SECS: u64 = 600;

/// Default S3 region.
pub const DEFAULT_S3_REGION: &str = "us-east-1";

/// Default raw-zone bucket.
pub const DEFAULT_S3_BUCKET: &str = "ottawa-raw";

/// Default search engine URL.
pub const DEFAULT_ES_URL: &str = "http://localhost:9200";

/// Default search index name.
pub const DEFAULT_INDEX_NAME: &str = "ottawa_permits";

/// Default search request timeout in seconds.
pub const DEFAULT_ES_TIMEOUT_SECS: u64 = 30;

/// Default dataset key; also the run-lock key.
pub const DEFAULT_DATASET_KEY: &str = "ottawa-permits";

/// Default prefix under which raw snapshots are stored.
pub const DEFAULT_RAW_PREFIX: &str = "raw";

/// Default curated collection name.
pub const DEFAULT_COLLECTION: &str = "permits_curated";

/// Default report location.
pub const DEFAULT_REPORT_PATH: &str = "reports/analysis_report.json";

/// Default number of records per store write.
pub const DEFAULT_BATCH_SIZE: usize = 500;

/// Default number of concurrent store writes within a stage.
pub const DEFAULT_CONCURRENCY: usize = 4;

/// Default number of labels listed in the report.
pub const DEFAULT_TOP_LABELS: usize = 5;

/// Default age after which an in-progress run is considered abandoned (6 hours).
pub const DEFAULT_STALE_RUN_TIMEOUT_SECS: u64 = 6 * 60 * 60;

/// Lower value threshold: values below it are `Low`.
pub const DEFAULT_VALUE_LOW_THRESHOLD: f64 = 50_000.0;

/// Upper value threshold: values at or above it are `High`.
pub const DEFAULT_VALUE_HIGH_THRESHOLD: f64 = 200_000.0;

/// Pipeline configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub database: DatabaseConfig,
    pub storage: StorageConfig,
    pub search: SearchConfig,
    pub pipeline: PipelineSettings,
    pub enrichment: EnrichmentRules,
}

/// Database configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
    pub connect_timeout_secs: u64,
    pub idle_timeout_secs: u64,
}

/// Object storage configuration for the raw zone
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    pub endpoint: Option<String>,
    pub region: String,
    pub bucket: String,
    pub access_key: String,
    pub secret_key: String,
    pub path_style: bool,
}

impl StorageConfig {
    pub fn for_minio(endpoint: impl Into<String>, bucket: impl Into<String>) -> Self {
        Self {
            endpoint: Some(endpoint.into()),
            region: DEFAULT_S3_REGION.to_string(),
            bucket: bucket.into(),
            access_key: "minioadmin".to_string(),
            secret_key: "minioadmin".to_string(),
            path_style: true,
        }
    }
}

/// Search engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchConfig {
    pub url: String,
    pub index_name: String,
    pub timeout_secs: u64,
}

/// Run-level settings shared by every stage
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineSettings {
    pub dataset_key: String,
    pub raw_prefix: String,
    /// Local file uploaded by the raw step when no source is given
    pub raw_file_path: Option<PathBuf>,
    pub collection: String,
    pub report_path: PathBuf,
    pub batch_size: usize,
    pub concurrency: usize,
    pub top_labels: usize,
    pub retry: RetryPolicy,
    pub stale_run_timeout_secs: u64,
}

impl PipelineSettings {
    pub fn stale_run_timeout(&self) -> Duration {
        Duration::from_secs(self.stale_run_timeout_secs)
    }
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            dataset_key: DEFAULT_DATASET_KEY.to_string(),
            raw_prefix: DEFAULT_RAW_PREFIX.to_string(),
            raw_file_path: None,
            collection: DEFAULT_COLLECTION.to_string(),
            report_path: PathBuf::from(DEFAULT_REPORT_PATH),
            batch_size: DEFAULT_BATCH_SIZE,
            concurrency: DEFAULT_CONCURRENCY,
            top_labels: DEFAULT_TOP_LABELS,
            retry: RetryPolicy::default(),
            stale_run_timeout_secs: DEFAULT_STALE_RUN_TIMEOUT_SECS,
        }
    }
}

// ============================================================================
// Enrichment rules
// ============================================================================

/// Value-category thresholds: `value < low` is Low, `value >= high` is High
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ValueThresholds {
    pub low: f64,
    pub high: f64,
}

/// A label and the description phrases that select it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LabelRule {
    pub label: String,
    pub keywords: Vec<String>,
}

impl LabelRule {
    fn new(label: &str, keywords: &[&str]) -> Self {
        Self {
            label: label.to_string(),
            keywords: keywords.iter().map(|k| k.to_string()).collect(),
        }
    }
}

/// Plausible region for permit coordinates, inclusive on all edges
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub min_lat: f64,
    pub max_lat: f64,
    pub min_lon: f64,
    pub max_lon: f64,
}

impl BoundingBox {
    pub fn contains(&self, lat: f64, lon: f64) -> bool {
        (self.min_lat..=self.max_lat).contains(&lat) && (self.min_lon..=self.max_lon).contains(&lon)
    }
}

/// Fixed inputs of the curation derivation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnrichmentRules {
    pub thresholds: ValueThresholds,
    pub vocabulary: Vec<LabelRule>,
    pub bounding_box: BoundingBox,
}

impl Default for EnrichmentRules {
    fn default() -> Self {
        Self {
            thresholds: ValueThresholds {
                low: DEFAULT_VALUE_LOW_THRESHOLD,
                high: DEFAULT_VALUE_HIGH_THRESHOLD,
            },
            vocabulary: vec![
                LabelRule::new("pool", &["pool", "spa", "hot tub"]),
                LabelRule::new("garage", &["garage"]),
                LabelRule::new("deck", &["deck"]),
                LabelRule::new("plumbing", &["plumbing"]),
                LabelRule::new("basement", &["basement"]),
                LabelRule::new("roofing", &["roof", "roofing"]),
                LabelRule::new("solar", &["solar"]),
                LabelRule::new("shed", &["shed"]),
                LabelRule::new("porch", &["porch"]),
                LabelRule::new("fireplace", &["fireplace"]),
                LabelRule::new("addition", &["addition", "extension"]),
                LabelRule::new("rowhouse", &["rowhouse"]),
                LabelRule::new("stacked_dwelling", &["stacked dwelling", "stacked"]),
                LabelRule::new("tenant_fitup", &["tenant fit", "fit-up", "fitup"]),
            ],
            // City of Ottawa limits, rounded outwards
            bounding_box: BoundingBox {
                min_lat: 44.96,
                max_lat: 45.54,
                min_lon: -76.36,
                max_lon: -75.24,
            },
        }
    }
}

impl EnrichmentRules {
    /// Load rules from a TOML file
    ///
    /// ```toml
    /// [thresholds]
    /// low = 250000.0
    /// high = 1000000.0
    ///
    /// [bounding_box]
    /// min_lat = 44.96
    /// max_lat = 45.54
    /// min_lon = -76.36
    /// max_lon = -75.24
    ///
    /// [[vocabulary]]
    /// label = "pool"
    /// keywords = ["pool", "hot tub"]
    /// ```
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let settings = config::Config::builder()
            .add_source(config::File::from(path.to_path_buf()).format(config::FileFormat::Toml))
            .build()
            .map_err(|e| {
                PipelineError::config(format!("failed to read enrichment rules {}: {}", path.display(), e))
            })?;

        let rules: EnrichmentRules = settings.try_deserialize().map_err(|e| {
            PipelineError::config(format!("invalid enrichment rules {}: {}", path.display(), e))
        })?;

        rules.validate()?;
        Ok(rules)
    }

    pub fn validate(&self) -> Result<()> {
        let ValueThresholds { low, high } = self.thresholds;
        if !low.is_finite() || !high.is_finite() || low >= high {
            return Err(PipelineError::config(format!(
                "value thresholds must be finite with low < high (got low={}, high={})",
                low, high
            )));
        }

        let bbox = &self.bounding_box;
        if bbox.min_lat >= bbox.max_lat || bbox.min_lon >= bbox.max_lon {
            return Err(PipelineError::config("bounding box minimums must be below maximums"));
        }

        for rule in &self.vocabulary {
            if rule.label.trim().is_empty() {
                return Err(PipelineError::config("vocabulary label cannot be empty"));
            }
            if rule.keywords.iter().all(|k| k.trim().is_empty()) {
                return Err(PipelineError::config(format!(
                    "vocabulary label '{}' has no keywords",
                    rule.label
                )));
            }
        }

        Ok(())
    }
}

// ============================================================================
// Loading
// ============================================================================

fn env_or<T: FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

fn env_string(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

impl Config {
    /// Load configuration from environment and defaults
    pub fn load() -> Result<Self> {
        dotenvy::dotenv().ok();

        let enrichment = match std::env::var("PERMITS_ENRICHMENT_RULES") {
            Ok(path) => EnrichmentRules::from_file(path)?,
            Err(_) => EnrichmentRules::default(),
        };

        let defaults = PipelineSettings::default();
        let config = Config {
            database: DatabaseConfig {
                url: env_string("DATABASE_URL", DEFAULT_DATABASE_URL),
                max_connections: env_or("DATABASE_MAX_CONNECTIONS", DEFAULT_DATABASE_MAX_CONNECTIONS),
                min_connections: env_or("DATABASE_MIN_CONNECTIONS", DEFAULT_DATABASE_MIN_CONNECTIONS),
                connect_timeout_secs: env_or(
                    "DATABASE_CONNECT_TIMEOUT",
                    DEFAULT_DATABASE_CONNECT_TIMEOUT_SECS,
                ),
                idle_timeout_secs: env_or("DATABASE_IDLE_TIMEOUT", DEFAULT_DATABASE_IDLE_TIMEOUT_SECS),
            },
            storage: StorageConfig {
                endpoint: std::env::var("S3_ENDPOINT").ok(),
                region: env_string("S3_REGION", DEFAULT_S3_REGION),
                bucket: env_string("S3_BUCKET", DEFAULT_S3_BUCKET),
                access_key: std::env::var("S3_ACCESS_KEY")
                    .or_else(|_| std::env::var("AWS_ACCESS_KEY_ID"))
                    .unwrap_or_else(|_| "minioadmin".to_string()),
                secret_key: std::env::var("S3_SECRET_KEY")
                    .or_else(|_| std::env::var("AWS_SECRET_ACCESS_KEY"))
                    .unwrap_or_else(|_| "minioadmin".to_string()),
                path_style: env_or("S3_PATH_STYLE", false),
            },
            search: SearchConfig {
                url: env_string("ES_URL", DEFAULT_ES_URL),
                index_name: env_string("ES_INDEX", DEFAULT_INDEX_NAME),
                timeout_secs: env_or("ES_TIMEOUT", DEFAULT_ES_TIMEOUT_SECS),
            },
            pipeline: PipelineSettings {
                dataset_key: env_string("PERMITS_DATASET_KEY", DEFAULT_DATASET_KEY),
                raw_prefix: env_string("PERMITS_RAW_PREFIX", DEFAULT_RAW_PREFIX),
                raw_file_path: std::env::var("PERMITS_RAW_FILE").ok().map(PathBuf::from),
                collection: env_string("PERMITS_COLLECTION", DEFAULT_COLLECTION),
                report_path: std::env::var("PERMITS_REPORT_PATH")
                    .map(PathBuf::from)
                    .unwrap_or(defaults.report_path),
                batch_size: env_or("PERMITS_BATCH_SIZE", DEFAULT_BATCH_SIZE),
                concurrency: env_or("PERMITS_CONCURRENCY", DEFAULT_CONCURRENCY),
                top_labels: env_or("PERMITS_TOP_LABELS", DEFAULT_TOP_LABELS),
                retry: RetryPolicy {
                    max_attempts: env_or("PERMITS_RETRY_MAX_ATTEMPTS", defaults.retry.max_attempts),
                    initial_backoff_ms: env_or(
                        "PERMITS_RETRY_INITIAL_BACKOFF_MS",
                        defaults.retry.initial_backoff_ms,
                    ),
                    max_backoff_ms: env_or("PERMITS_RETRY_MAX_BACKOFF_MS", defaults.retry.max_backoff_ms),
                    call_timeout_secs: env_or(
                        "PERMITS_CALL_TIMEOUT_SECS",
                        defaults.retry.call_timeout_secs,
                    ),
                },
                stale_run_timeout_secs: env_or(
                    "PERMITS_STALE_RUN_TIMEOUT_SECS",
                    DEFAULT_STALE_RUN_TIMEOUT_SECS,
                ),
            },
            enrichment,
        };

        config.validate()?;

        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.database.url.is_empty() {
            return Err(PipelineError::config("Database URL cannot be empty"));
        }

        if self.database.max_connections == 0 {
            return Err(PipelineError::config("Database max_connections must be greater than 0"));
        }

        if self.database.min_connections > self.database.max_connections {
            return Err(PipelineError::config(format!(
                "Database min_connections ({}) cannot be greater than max_connections ({})",
                self.database.min_connections, self.database.max_connections
            )));
        }

        if self.storage.bucket.is_empty() {
            return Err(PipelineError::config("S3 bucket cannot be empty"));
        }

        if self.search.index_name.is_empty() || self.search.index_name != self.search.index_name.to_lowercase() {
            return Err(PipelineError::config(format!(
                "Index name '{}' must be non-empty and lowercase",
                self.search.index_name
            )));
        }

        let pipeline = &self.pipeline;
        if pipeline.dataset_key.trim().is_empty() {
            return Err(PipelineError::config("Dataset key cannot be empty"));
        }
        if pipeline.batch_size == 0 || pipeline.concurrency == 0 {
            return Err(PipelineError::config("Batch size and concurrency must be greater than 0"));
        }
        if pipeline.retry.max_attempts == 0 {
            return Err(PipelineError::config("Retry max_attempts must be at least 1"));
        }
        if pipeline.retry.call_timeout_secs == 0 {
            return Err(PipelineError::config("Call timeout must be greater than 0"));
        }

        self.enrichment.validate()?;

        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database: DatabaseConfig {
                url: DEFAULT_DATABASE_URL.to_string(),
                max_connections: DEFAULT_DATABASE_MAX_CONNECTIONS,
                min_connections: DEFAULT_DATABASE_MIN_CONNECTIONS,
                connect_timeout_secs: DEFAULT_DATABASE_CONNECT_TIMEOUT_SECS,
                idle_timeout_secs: DEFAULT_DATABASE_IDLE_TIMEOUT_SECS,
            },
            storage: StorageConfig {
                endpoint: None,
                region: DEFAULT_S3_REGION.to_string(),
                bucket: DEFAULT_S3_BUCKET.to_string(),
                access_key: "minioadmin".to_string(),
                secret_key: "minioadmin".to_string(),
                path_style: false,
            },
            search: SearchConfig {
                url: DEFAULT_ES_URL.to_string(),
                index_name: DEFAULT_INDEX_NAME.to_string(),
                timeout_secs: DEFAULT_ES_TIMEOUT_SECS,
            },
            pipeline: PipelineSettings::default(),
            enrichment: EnrichmentRules::default(),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config_is_valid() {
        Config::default().validate().unwrap();
    }

    #[test]
    fn test_rejects_inverted_thresholds() {
        let mut rules = EnrichmentRules::default();
        rules.thresholds = ValueThresholds { low: 10.0, high: 10.0 };
        assert!(rules.validate().is_err());
    }

    #[test]
    fn test_pool_settings_validated() {
        let mut config = Config::default();
        config.database.min_connections = 20;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_bounding_box_inclusive() {
        let bbox = EnrichmentRules::default().bounding_box;
        assert!(bbox.contains(45.42, -75.69));
        assert!(bbox.contains(bbox.min_lat, bbox.max_lon));
        assert!(!bbox.contains(43.65, -79.38));
    }

    #[test]
    fn test_rules_from_toml_file() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            r#"
[thresholds]
low = 250000.0
high = 1000000.0

[bounding_box]
min_lat = 44.0
max_lat = 46.0
min_lon = -77.0
max_lon = -75.0

[[vocabulary]]
label = "pool"
keywords = ["pool", "hot tub"]

[[vocabulary]]
label = "deck"
keywords = ["deck"]
"#
        )
        .unwrap();

        let rules = EnrichmentRules::from_file(file.path()).unwrap();
        assert_eq!(rules.thresholds, ValueThresholds { low: 250_000.0, high: 1_000_000.0 });
        assert_eq!(rules.vocabulary.len(), 2);
        assert_eq!(rules.vocabulary[0].keywords, vec!["pool", "hot tub"]);
    }

    #[test]
    fn test_shipped_rules_match_defaults() {
        let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("../../config/enrichment.toml");
        assert_eq!(EnrichmentRules::from_file(path).unwrap(), EnrichmentRules::default());
    }
}
