//! Postgres-backed staging table, curated collection and run records

use async_trait::async_trait;
use permits_common::{PipelineError, Result, RunStage, RunStatus};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::types::Json;
use sqlx::{Postgres, QueryBuilder, Row};
use std::collections::BTreeSet;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use super::{
    abandoned_reason, run_closed, DocumentFilter, DocumentStore, RelationalStore, RunStore, SnapshotOutcome,
    StagingSummary,
};
use crate::config::DatabaseConfig;
use crate::models::{
    CuratedDocument, FailureReason, RejectedRecord, RunKind, RunRecord, StagingRow,
};

const SERVICE: &str = "postgres";

/// Rows per multi-row INSERT, well under the 65535 bind-parameter limit
const INSERT_CHUNK: usize = 1000;

/// Classify a sqlx error at the store boundary
fn classify(target: &str, err: sqlx::Error) -> PipelineError {
    match &err {
        sqlx::Error::Database(db) => match db.code().as_deref() {
            // connection exceptions, admin shutdown, too many connections
            Some(code) if code.starts_with("08") || code == "57P01" || code == "53300" => {
                PipelineError::connectivity(SERVICE, &err)
            }
            // serialization failure, deadlock
            Some("40001" | "40P01") => PipelineError::connectivity(SERVICE, &err),
            _ => PipelineError::schema(target, &err),
        },
        sqlx::Error::Io(_)
        | sqlx::Error::Tls(_)
        | sqlx::Error::Protocol(_)
        | sqlx::Error::PoolTimedOut
        | sqlx::Error::PoolClosed
        | sqlx::Error::WorkerCrashed => PipelineError::connectivity(SERVICE, &err),
        sqlx::Error::ColumnNotFound(_)
        | sqlx::Error::ColumnDecode { .. }
        | sqlx::Error::ColumnIndexOutOfBounds { .. }
        | sqlx::Error::Decode(_)
        | sqlx::Error::TypeNotFound { .. } => PipelineError::schema(target, &err),
        sqlx::Error::RowNotFound => PipelineError::not_found(target.to_string()),
        sqlx::Error::Configuration(_) => PipelineError::config(err.to_string()),
        _ => PipelineError::connectivity(SERVICE, &err),
    }
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db) if db.code().as_deref() == Some("23505"))
}

/// Staging, curated and run-record stores sharing one pool
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
    collection: String,
}

impl PgStore {
    pub fn new(pool: PgPool, collection: impl Into<String>) -> Self {
        Self {
            pool,
            collection: collection.into(),
        }
    }

    /// Open a pool and apply pending migrations
    pub async fn connect(config: &DatabaseConfig, collection: impl Into<String>) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(Duration::from_secs(config.connect_timeout_secs))
            .idle_timeout(Duration::from_secs(config.idle_timeout_secs))
            .connect(&config.url)
            .await
            .map_err(|e| classify("connection", e))?;

        info!("Database connection pool established");

        sqlx::migrate!("../../migrations")
            .run(&pool)
            .await
            .map_err(|e| PipelineError::schema("migrations", e))?;

        info!("Database migrations applied");

        Ok(Self::new(pool, collection))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

// ============================================================================
// Row mapping
// ============================================================================

fn staging_row(row: &PgRow) -> std::result::Result<StagingRow, sqlx::Error> {
    Ok(StagingRow {
        permit_id: row.try_get("permit_id")?,
        application_type: row.try_get("application_type")?,
        building_type: row.try_get("building_type")?,
        value: row.try_get("value")?,
        ward: row.try_get("ward")?,
        description: row.try_get("description")?,
        issued_date: row.try_get("issued_date")?,
        location: row.try_get("location")?,
        contractor: row.try_get("contractor")?,
        geometry_type: row.try_get("geometry_type")?,
        coordinates: row.try_get("coordinates")?,
    })
}

fn run_record(row: &PgRow) -> Result<RunRecord> {
    let decode = |e| classify("pipeline_runs", e);
    let kind: String = row.try_get("kind").map_err(decode)?;
    let stage: String = row.try_get("stage").map_err(decode)?;
    let status: String = row.try_get("status").map_err(decode)?;
    let failure: Option<Json<FailureReason>> = row.try_get("failure").map_err(decode)?;

    Ok(RunRecord {
        run_id: row.try_get("run_id").map_err(decode)?,
        dataset_key: row.try_get("dataset_key").map_err(decode)?,
        kind: kind.parse()?,
        stage: stage.parse()?,
        status: status.parse()?,
        rejected_count: row.try_get("rejected_count").map_err(decode)?,
        failure: failure.map(|Json(f)| f),
        started_at: row.try_get("started_at").map_err(decode)?,
        updated_at: row.try_get("updated_at").map_err(decode)?,
        completed_at: row.try_get("completed_at").map_err(decode)?,
    })
}

const RUN_COLUMNS: &str = "run_id, dataset_key, kind, stage, status, rejected_count, failure, \
                           started_at, updated_at, completed_at";

// ============================================================================
// Staging
// ============================================================================

#[async_trait]
impl RelationalStore for PgStore {
    #[instrument(skip(self, rows, rejects), fields(rows = rows.len(), rejects = rejects.len()))]
    async fn replace_snapshot(
        &self,
        run_id: Uuid,
        rows: &[StagingRow],
        rejects: &[RejectedRecord],
    ) -> Result<SnapshotOutcome> {
        let target = "permits_staging";
        let mut tx = self.pool.begin().await.map_err(|e| classify(target, e))?;

        let ids: Vec<String> = rows.iter().map(|r| r.permit_id.clone()).collect();
        let pruned = sqlx::query("DELETE FROM permits_staging WHERE NOT (permit_id = ANY($1))")
            .bind(&ids)
            .execute(&mut *tx)
            .await
            .map_err(|e| classify(target, e))?
            .rows_affected() as usize;

        for chunk in rows.chunks(INSERT_CHUNK) {
            let mut builder: QueryBuilder<Postgres> = QueryBuilder::new(
                "INSERT INTO permits_staging (permit_id, application_type, building_type, value, ward, \
                 description, issued_date, location, contractor, geometry_type, coordinates, loaded_run_id) ",
            );
            builder.push_values(chunk, |mut b, row| {
                b.push_bind(row.permit_id.clone())
                    .push_bind(row.application_type.clone())
                    .push_bind(row.building_type.clone())
                    .push_bind(row.value)
                    .push_bind(row.ward.clone())
                    .push_bind(row.description.clone())
                    .push_bind(row.issued_date)
                    .push_bind(row.location.clone())
                    .push_bind(row.contractor.clone())
                    .push_bind(row.geometry_type.clone())
                    .push_bind(row.coordinates.clone())
                    .push_bind(run_id);
            });
            builder.push(
                " ON CONFLICT (permit_id) DO UPDATE SET \
                 application_type = EXCLUDED.application_type, \
                 building_type = EXCLUDED.building_type, \
                 value = EXCLUDED.value, \
                 ward = EXCLUDED.ward, \
                 description = EXCLUDED.description, \
                 issued_date = EXCLUDED.issued_date, \
                 location = EXCLUDED.location, \
                 contractor = EXCLUDED.contractor, \
                 geometry_type = EXCLUDED.geometry_type, \
                 coordinates = EXCLUDED.coordinates, \
                 loaded_run_id = EXCLUDED.loaded_run_id",
            );
            builder
                .build()
                .execute(&mut *tx)
                .await
                .map_err(|e| classify(target, e))?;
        }

        sqlx::query("DELETE FROM permits_rejected WHERE run_id = $1")
            .bind(run_id)
            .execute(&mut *tx)
            .await
            .map_err(|e| classify("permits_rejected", e))?;

        for chunk in rejects.chunks(INSERT_CHUNK) {
            let mut builder: QueryBuilder<Postgres> =
                QueryBuilder::new("INSERT INTO permits_rejected (run_id, position, permit_id, reason, raw) ");
            builder.push_values(chunk, |mut b, reject| {
                b.push_bind(run_id)
                    .push_bind(reject.position)
                    .push_bind(reject.permit_id.clone())
                    .push_bind(reject.reason.clone())
                    .push_bind(Json(reject.raw.clone()));
            });
            builder
                .build()
                .execute(&mut *tx)
                .await
                .map_err(|e| classify("permits_rejected", e))?;
        }

        tx.commit().await.map_err(|e| classify(target, e))?;

        debug!(upserted = rows.len(), pruned, "Staging snapshot committed");

        Ok(SnapshotOutcome {
            upserted: rows.len(),
            pruned,
        })
    }

    async fn fetch_rows(&self) -> Result<Vec<StagingRow>> {
        let rows = sqlx::query(
            "SELECT permit_id, application_type, building_type, value, ward, description, issued_date, \
             location, contractor, geometry_type, coordinates \
             FROM permits_staging ORDER BY permit_id COLLATE \"C\"",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| classify("permits_staging", e))?;

        rows.iter()
            .map(staging_row)
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| classify("permits_staging", e))
    }

    async fn summary(&self) -> Result<StagingSummary> {
        let row = sqlx::query("SELECT COUNT(*) AS row_count, AVG(value) AS average_value FROM permits_staging")
            .fetch_one(&self.pool)
            .await
            .map_err(|e| classify("permits_staging", e))?;

        let row_count: i64 = row.try_get("row_count").map_err(|e| classify("permits_staging", e))?;
        let average_value: Option<f64> = row
            .try_get("average_value")
            .map_err(|e| classify("permits_staging", e))?;

        Ok(StagingSummary {
            row_count: row_count.max(0) as u64,
            average_value,
        })
    }

    async fn rejected(&self, run_id: Uuid) -> Result<Vec<RejectedRecord>> {
        let rows = sqlx::query(
            "SELECT position, permit_id, reason, raw FROM permits_rejected WHERE run_id = $1 ORDER BY position",
        )
        .bind(run_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| classify("permits_rejected", e))?;

        rows.iter()
            .map(|row| {
                let Json(raw): Json<serde_json::Value> = row.try_get("raw")?;
                Ok(RejectedRecord {
                    position: row.try_get("position")?,
                    permit_id: row.try_get("permit_id")?,
                    reason: row.try_get("reason")?,
                    raw,
                })
            })
            .collect::<std::result::Result<Vec<_>, sqlx::Error>>()
            .map_err(|e| classify("permits_rejected", e))
    }
}

// ============================================================================
// Curated documents
// ============================================================================

impl PgStore {
    /// Why a guarded run transition matched no row
    async fn refused_transition(&self, run_id: Uuid) -> PipelineError {
        match self.get_run(run_id).await {
            Ok(Some(run)) => run_closed(&run),
            Ok(None) => PipelineError::not_found(format!("run {}", run_id)),
            Err(e) => e,
        }
    }

    async fn upsert_documents(
        &self,
        tx: &mut sqlx::Transaction<'_, Postgres>,
        docs: &[CuratedDocument],
    ) -> Result<()> {
        for chunk in docs.chunks(INSERT_CHUNK) {
            let mut builder: QueryBuilder<Postgres> =
                QueryBuilder::new("INSERT INTO curated_documents (collection, permit_id, document) ");
            builder.push_values(chunk, |mut b, doc| {
                b.push_bind(self.collection.clone())
                    .push_bind(doc.permit_id.clone())
                    .push_bind(Json(doc.clone()));
            });
            builder.push(" ON CONFLICT (collection, permit_id) DO UPDATE SET document = EXCLUDED.document");
            builder
                .build()
                .execute(&mut **tx)
                .await
                .map_err(|e| classify("curated_documents", e))?;
        }
        Ok(())
    }

    async fn prune_documents(
        &self,
        tx: &mut sqlx::Transaction<'_, Postgres>,
        keep: &[String],
    ) -> Result<usize> {
        let result = sqlx::query(
            "DELETE FROM curated_documents WHERE collection = $1 AND NOT (permit_id = ANY($2))",
        )
        .bind(&self.collection)
        .bind(keep)
        .execute(&mut **tx)
        .await
        .map_err(|e| classify("curated_documents", e))?;
        Ok(result.rows_affected() as usize)
    }
}

#[async_trait]
impl DocumentStore for PgStore {
    #[instrument(skip(self, docs), fields(collection = %self.collection, docs = docs.len()))]
    async fn upsert_batch(&self, docs: &[CuratedDocument]) -> Result<usize> {
        let mut tx = self.pool.begin().await.map_err(|e| classify("curated_documents", e))?;
        self.upsert_documents(&mut tx, docs).await?;
        tx.commit().await.map_err(|e| classify("curated_documents", e))?;
        Ok(docs.len())
    }

    async fn delete_except(&self, keep: &BTreeSet<String>) -> Result<usize> {
        let keep: Vec<String> = keep.iter().cloned().collect();
        let mut tx = self.pool.begin().await.map_err(|e| classify("curated_documents", e))?;
        let pruned = self.prune_documents(&mut tx, &keep).await?;
        tx.commit().await.map_err(|e| classify("curated_documents", e))?;
        Ok(pruned)
    }

    #[instrument(skip(self, docs), fields(collection = %self.collection, docs = docs.len()))]
    async fn replace_all(&self, docs: &[CuratedDocument]) -> Result<SnapshotOutcome> {
        let keep: Vec<String> = docs.iter().map(|d| d.permit_id.clone()).collect();
        let mut tx = self.pool.begin().await.map_err(|e| classify("curated_documents", e))?;
        let pruned = self.prune_documents(&mut tx, &keep).await?;
        self.upsert_documents(&mut tx, docs).await?;
        tx.commit().await.map_err(|e| classify("curated_documents", e))?;

        Ok(SnapshotOutcome {
            upserted: docs.len(),
            pruned,
        })
    }

    async fn find(&self, filter: &DocumentFilter) -> Result<Vec<CuratedDocument>> {
        let mut builder: QueryBuilder<Postgres> =
            QueryBuilder::new("SELECT document FROM curated_documents WHERE collection = ");
        builder.push_bind(self.collection.clone());

        if let Some(ids) = &filter.permit_ids {
            builder.push(" AND permit_id = ANY(").push_bind(ids.clone()).push(")");
        }
        if let Some(category) = filter.value_category {
            builder
                .push(" AND document->>'value_category' = ")
                .push_bind(category.as_str().to_string());
        }
        if let Some(label) = &filter.label {
            builder
                .push(" AND document->'labels' @> jsonb_build_array(")
                .push_bind(label.clone())
                .push("::text)");
        }
        builder.push(" ORDER BY permit_id COLLATE \"C\"");

        let rows = builder
            .build()
            .fetch_all(&self.pool)
            .await
            .map_err(|e| classify("curated_documents", e))?;

        rows.iter()
            .map(|row| row.try_get::<Json<CuratedDocument>, _>("document").map(|Json(doc)| doc))
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| classify("curated_documents", e))
    }

    async fn count(&self) -> Result<u64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM curated_documents WHERE collection = $1")
            .bind(&self.collection)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| classify("curated_documents", e))?;
        Ok(count.max(0) as u64)
    }
}

// ============================================================================
// Run records
// ============================================================================

#[async_trait]
impl RunStore for PgStore {
    #[instrument(skip(self))]
    async fn begin_run(&self, dataset_key: &str, kind: RunKind, stale_after: Duration) -> Result<RunRecord> {
        let target = "pipeline_runs";
        let mut tx = self.pool.begin().await.map_err(|e| classify(target, e))?;

        let active = sqlx::query(&format!(
            "SELECT {} FROM pipeline_runs WHERE dataset_key = $1 AND status = 'in_progress' FOR UPDATE",
            RUN_COLUMNS
        ))
        .bind(dataset_key)
        .fetch_all(&mut *tx)
        .await
        .map_err(|e| classify(target, e))?;

        let now = chrono::Utc::now();
        for row in &active {
            let run = run_record(row)?;
            if !run.is_stale(now, stale_after) {
                return Err(PipelineError::ConcurrencyConflict {
                    dataset_key: dataset_key.to_string(),
                    run_id: run.run_id.to_string(),
                });
            }

            warn!(run_id = %run.run_id, stage = %run.stage, "Marking stale run as abandoned");
            sqlx::query(
                "UPDATE pipeline_runs SET status = 'failed', stage = 'failed', failure = $2, \
                 updated_at = now(), completed_at = now() WHERE run_id = $1",
            )
            .bind(run.run_id)
            .bind(Json(abandoned_reason(&run)))
            .execute(&mut *tx)
            .await
            .map_err(|e| classify(target, e))?;
        }

        let run = RunRecord::new(dataset_key, kind);
        let inserted = sqlx::query(
            "INSERT INTO pipeline_runs (run_id, dataset_key, kind, stage, status, rejected_count, \
             started_at, updated_at) VALUES ($1, $2, $3, $4, $5, 0, $6, $6)",
        )
        .bind(run.run_id)
        .bind(&run.dataset_key)
        .bind(run.kind.as_str())
        .bind(run.stage.as_str())
        .bind(run.status.as_str())
        .bind(run.started_at)
        .execute(&mut *tx)
        .await;

        match inserted {
            Ok(_) => {}
            // Another process opened a run between our check and insert
            Err(err) if is_unique_violation(&err) => {
                return Err(PipelineError::ConcurrencyConflict {
                    dataset_key: dataset_key.to_string(),
                    run_id: "unknown".to_string(),
                })
            }
            Err(err) => return Err(classify(target, err)),
        }

        tx.commit().await.map_err(|e| classify(target, e))?;

        Ok(run)
    }

    async fn record_stage(&self, run_id: Uuid, stage: RunStage, rejected_count: Option<i64>) -> Result<RunRecord> {
        let row = sqlx::query(&format!(
            "UPDATE pipeline_runs SET stage = $2, rejected_count = COALESCE($3, rejected_count), \
             updated_at = now() WHERE run_id = $1 AND status = 'in_progress' RETURNING {}",
            RUN_COLUMNS
        ))
        .bind(run_id)
        .bind(stage.as_str())
        .bind(rejected_count)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| classify("pipeline_runs", e))?;

        match row {
            Some(row) => run_record(&row),
            None => Err(self.refused_transition(run_id).await),
        }
    }

    async fn finish_run(
        &self,
        run_id: Uuid,
        status: RunStatus,
        failure: Option<FailureReason>,
    ) -> Result<RunRecord> {
        let row = sqlx::query(&format!(
            "UPDATE pipeline_runs SET status = $2, \
             stage = CASE WHEN $2 = 'failed' THEN 'failed' ELSE stage END, \
             failure = $3, updated_at = now(), completed_at = now() \
             WHERE run_id = $1 AND status = 'in_progress' RETURNING {}",
            RUN_COLUMNS
        ))
        .bind(run_id)
        .bind(status.as_str())
        .bind(failure.map(Json))
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| classify("pipeline_runs", e))?;

        match row {
            Some(row) => run_record(&row),
            None => Err(self.refused_transition(run_id).await),
        }
    }

    async fn get_run(&self, run_id: Uuid) -> Result<Option<RunRecord>> {
        sqlx::query(&format!("SELECT {} FROM pipeline_runs WHERE run_id = $1", RUN_COLUMNS))
            .bind(run_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| classify("pipeline_runs", e))?
            .as_ref()
            .map(run_record)
            .transpose()
    }

    async fn latest_run(&self, dataset_key: &str) -> Result<Option<RunRecord>> {
        sqlx::query(&format!(
            "SELECT {} FROM pipeline_runs WHERE dataset_key = $1 ORDER BY started_at DESC LIMIT 1",
            RUN_COLUMNS
        ))
        .bind(dataset_key)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| classify("pipeline_runs", e))?
        .as_ref()
        .map(run_record)
        .transpose()
    }

    async fn latest_succeeded(&self, dataset_key: &str, kind: RunKind) -> Result<Option<RunRecord>> {
        sqlx::query(&format!(
            "SELECT {} FROM pipeline_runs WHERE dataset_key = $1 AND kind = $2 AND status = 'succeeded' \
             ORDER BY started_at DESC LIMIT 1",
            RUN_COLUMNS
        ))
        .bind(dataset_key)
        .bind(kind.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| classify("pipeline_runs", e))?
        .as_ref()
        .map(run_record)
        .transpose()
    }
}
