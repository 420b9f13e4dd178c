//! Pipeline coordinator
//!
//! Drives a run through the zone transitions:
//! 1. Raw: store the source snapshot under the dataset key
//! 2. Staging: validate and replace the staging table
//! 3. Curation: derive the curated collection
//! 4. Indexing: sync the search index with curated
//! 5. Reporting: aggregate all zones into the report artifact
//!
//! Each step starts only once its predecessor is durably recorded on the run
//! record. A step is retried as a whole on connectivity errors; any other
//! error, or exhausted retries, fails the run and records why. Run-record
//! transitions are retried the same way, and failing to record one also
//! fails the run.

use permits_common::{ErrorKind, PipelineError, Result, RunStage, RunStatus, Step};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

use crate::config::{Config, PipelineSettings};
use crate::models::{FailureReason, RunKind, RunRecord};
use crate::retry::{with_timeout, Exhausted};
use crate::stages::{
    write_report, AnalysisReport, CurationEnricher, CurationOutcome, IndexMode, IndexOutcome, Indexer,
    RawStore, ReportAggregator, StagingLoader, StagingOutcome,
};
use crate::stores::Stores;

/// Where the raw step takes its snapshot from
#[derive(Debug, Clone)]
pub enum RawSource {
    /// Upload a local file
    File(PathBuf),
    /// Upload bytes already in memory
    Bytes(Vec<u8>),
    /// Reuse the snapshot already stored under the dataset key
    Stored,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RawOutcome {
    pub key: String,
    pub checksum: String,
    pub size: u64,
    pub uploaded: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "step", rename_all = "snake_case")]
pub enum StepOutcome {
    Raw(RawOutcome),
    Staging(StagingOutcome),
    Curation(CurationOutcome),
    Indexing(IndexOutcome),
    Reporting(Box<AnalysisReport>),
}

impl StepOutcome {
    /// Records carried forward to the next step, when the step knows it
    fn records(&self) -> Option<i64> {
        match self {
            StepOutcome::Staging(o) => Some(o.loaded as i64),
            StepOutcome::Curation(o) => Some(o.documents as i64),
            StepOutcome::Indexing(o) => Some((o.upserted + o.unchanged) as i64),
            StepOutcome::Raw(_) | StepOutcome::Reporting(_) => None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run: RunRecord,
    pub outcomes: Vec<StepOutcome>,
}

pub struct PipelineCoordinator {
    stores: Stores,
    settings: PipelineSettings,
    raw: RawStore,
    staging: StagingLoader,
    curation: CurationEnricher,
    indexer: Indexer,
    reports: ReportAggregator,
    cancel: CancellationToken,
}

impl PipelineCoordinator {
    pub fn new(stores: Stores, config: &Config) -> Self {
        let settings = config.pipeline.clone();
        let timeout = settings.retry.call_timeout();

        let raw = RawStore::new(Arc::clone(&stores.objects), settings.raw_prefix.clone(), timeout);
        let staging = StagingLoader::new(Arc::clone(&stores.staging), timeout);
        let curation = CurationEnricher::new(
            Arc::clone(&stores.staging),
            Arc::clone(&stores.documents),
            config.enrichment.clone(),
            settings.batch_size,
            settings.concurrency,
            timeout,
        );
        let indexer = Indexer::new(
            Arc::clone(&stores.index),
            Arc::clone(&stores.documents),
            config.search.index_name.clone(),
            settings.batch_size,
            settings.concurrency,
            timeout,
        );
        let reports = ReportAggregator::new(
            raw.clone(),
            Arc::clone(&stores.staging),
            Arc::clone(&stores.documents),
            Arc::clone(&stores.index),
            config.search.index_name.clone(),
            settings.top_labels,
            timeout,
        );

        Self {
            stores,
            settings,
            raw,
            staging,
            curation,
            indexer,
            reports,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    /// Token that aborts the current run at the next step boundary
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn settings(&self) -> &PipelineSettings {
        &self.settings
    }

    /// Open a pipeline run, taking the dataset lock
    pub async fn begin(&self, dataset_key: &str) -> Result<RunRecord> {
        self.begin_kind(dataset_key, RunKind::Pipeline).await
    }

    async fn begin_kind(&self, dataset_key: &str, kind: RunKind) -> Result<RunRecord> {
        let timeout = self.settings.retry.call_timeout();
        let run = with_timeout(
            "run store",
            timeout,
            self.stores
                .runs
                .begin_run(dataset_key, kind, self.settings.stale_run_timeout()),
        )
        .await?;
        info!(run_id = %run.run_id, dataset_key, kind = run.kind.as_str(), "Run started");
        Ok(run)
    }

    /// Run every step in order under one run record
    #[instrument(skip(self, source))]
    pub async fn run(&self, dataset_key: &str, source: RawSource) -> Result<RunSummary> {
        let run = self.begin(dataset_key).await?;
        let mut outcomes = Vec::with_capacity(Step::ORDER.len());
        let mut in_flight = 0i64;

        for step in Step::ORDER {
            let outcome = self.advance(&run, step, &source, in_flight).await?;
            in_flight = outcome.records().unwrap_or(in_flight);
            outcomes.push(outcome);
        }

        let run = self.complete(&run).await?;
        Ok(RunSummary { run, outcomes })
    }

    /// Run a single step of an open run, as invoked by an external scheduler
    #[instrument(skip(self, source))]
    pub async fn run_step(&self, run_id: Uuid, step: Step, source: &RawSource) -> Result<StepOutcome> {
        let run = self
            .stores
            .runs
            .get_run(run_id)
            .await?
            .ok_or_else(|| PipelineError::not_found(format!("run {}", run_id)))?;

        if run.status.is_terminal() {
            return Err(PipelineError::consistency(format!(
                "run {} is {}, not in progress",
                run_id, run.status
            )));
        }
        if run.stage != step.requires() {
            let detail = if run.stage.has_reached(step.completes()) {
                "already completed"
            } else {
                "not ready"
            };
            return Err(PipelineError::consistency(format!(
                "step {} is {}: it requires stage {}, run {} is at {}",
                step,
                detail,
                step.requires(),
                run_id,
                run.stage
            )));
        }

        let outcome = self.advance(&run, step, source, 0).await?;
        if step == Step::Reporting {
            self.complete(&run).await?;
        }
        Ok(outcome)
    }

    /// Drop and rebuild the search index from curated, under the dataset lock
    #[instrument(skip(self))]
    pub async fn rebuild_index(&self, dataset_key: &str) -> Result<IndexOutcome> {
        let run = self.begin_kind(dataset_key, RunKind::IndexRebuild).await?;

        match self
            .settings
            .retry
            .run("index rebuild", move || self.indexer.sync(IndexMode::FullRebuild))
            .await
        {
            Ok(outcome) => {
                let affected = (outcome.upserted + outcome.unchanged) as i64;
                self.settle(&run, RunStage::Indexed, Step::Indexing, affected).await?;
                Ok(outcome)
            }
            Err(exhausted) => Err(self.fail(&run, Step::Indexing, exhausted, 0).await),
        }
    }

    /// Recompute and write the report outside a pipeline run, under the dataset lock
    #[instrument(skip(self))]
    pub async fn report(&self, dataset_key: &str) -> Result<AnalysisReport> {
        let rejected = self
            .stores
            .runs
            .latest_succeeded(dataset_key, RunKind::Pipeline)
            .await?
            .map_or(0, |pipeline| pipeline.rejected_count);
        let run = self.begin_kind(dataset_key, RunKind::Report).await?;

        let run_id = run.run_id;
        let report_path = self.settings.report_path.as_path();
        let result = self
            .settings
            .retry
            .run("report", move || async move {
                let report = self.reports.compute(run_id, dataset_key, rejected).await?;
                write_report(&report, report_path).await?;
                Ok::<_, PipelineError>(report)
            })
            .await;

        match result {
            Ok(report) => {
                let affected = report.data_zones.curated_documents as i64;
                self.settle(&run, RunStage::Reported, Step::Reporting, affected).await?;
                Ok(report)
            }
            Err(exhausted) => Err(self.fail(&run, Step::Reporting, exhausted, 0).await),
        }
    }

    /// Latest run record for a dataset
    pub async fn status(&self, dataset_key: &str) -> Result<Option<RunRecord>> {
        self.stores.runs.latest_run(dataset_key).await
    }

    // ------------------------------------------------------------------------
    // Step execution
    // ------------------------------------------------------------------------

    /// Execute one step with retries and record its outcome on the run
    async fn advance(&self, run: &RunRecord, step: Step, source: &RawSource, in_flight: i64) -> Result<StepOutcome> {
        if self.cancel.is_cancelled() {
            return Err(self.cancel_run(run, step, in_flight).await);
        }

        info!(run_id = %run.run_id, step = step.as_str(), "Step starting");
        let outcome = match self
            .settings
            .retry
            .run(step.as_str(), move || self.execute(run, step, source))
            .await
        {
            Ok(outcome) => outcome,
            Err(exhausted) => return Err(self.fail(run, step, exhausted, in_flight).await),
        };

        let rejected = match &outcome {
            StepOutcome::Staging(staging) => Some(staging.rejected as i64),
            _ => None,
        };
        let affected = outcome.records().unwrap_or(in_flight);
        if let Err(exhausted) = self.record_stage(run.run_id, step.completes(), rejected).await {
            return Err(self.fail(run, step, exhausted, affected).await);
        }
        info!(run_id = %run.run_id, step = step.as_str(), stage = %step.completes(), "Step complete");

        Ok(outcome)
    }

    async fn execute(&self, run: &RunRecord, step: Step, source: &RawSource) -> Result<StepOutcome> {
        let dataset_key = run.dataset_key.as_str();
        match step {
            Step::Raw => self.execute_raw(dataset_key, source).await.map(StepOutcome::Raw),
            Step::Staging => {
                let bytes = self.raw.get_key(&self.raw.object_key(dataset_key)).await?;
                self.staging.load(run.run_id, &bytes).await.map(StepOutcome::Staging)
            }
            Step::Curation => self.curation.curate().await.map(StepOutcome::Curation),
            Step::Indexing => self.indexer.sync(IndexMode::Incremental).await.map(StepOutcome::Indexing),
            Step::Reporting => {
                let rejected = self
                    .stores
                    .runs
                    .get_run(run.run_id)
                    .await?
                    .map_or(run.rejected_count, |current| current.rejected_count);
                let report = self.reports.compute(run.run_id, dataset_key, rejected).await?;
                write_report(&report, &self.settings.report_path).await?;
                Ok(StepOutcome::Reporting(Box::new(report)))
            }
        }
    }

    async fn execute_raw(&self, dataset_key: &str, source: &RawSource) -> Result<RawOutcome> {
        let (object, uploaded) = match source {
            RawSource::File(path) => (self.raw.upload_file(dataset_key, path).await?, true),
            RawSource::Bytes(bytes) => (self.raw.put(dataset_key, bytes.clone()).await?, true),
            RawSource::Stored => {
                let key = self.raw.object_key(dataset_key);
                let bytes = self.raw.get_key(&key).await?;
                return Ok(RawOutcome {
                    key,
                    checksum: permits_common::checksum::sha256_hex(&bytes),
                    size: bytes.len() as u64,
                    uploaded: false,
                });
            }
        };

        Ok(RawOutcome {
            key: object.key,
            checksum: object.checksum,
            size: object.size,
            uploaded,
        })
    }

    // ------------------------------------------------------------------------
    // Run transitions
    // ------------------------------------------------------------------------

    async fn complete(&self, run: &RunRecord) -> Result<RunRecord> {
        let run = self.settle(run, RunStage::Complete, Step::Reporting, 0).await?;
        info!(run_id = %run.run_id, "Run complete");
        Ok(run)
    }

    /// Record the final stage and close the run as succeeded, failing it if
    /// the run store cannot be reached
    async fn settle(&self, run: &RunRecord, stage: RunStage, step: Step, affected: i64) -> Result<RunRecord> {
        let closed = match self.record_stage(run.run_id, stage, None).await {
            Ok(_) => self.finish_run(run.run_id, RunStatus::Succeeded, None).await,
            Err(exhausted) => Err(exhausted),
        };
        match closed {
            Ok(run) => Ok(run),
            Err(exhausted) => Err(self.fail(run, step, exhausted, affected).await),
        }
    }

    async fn record_stage(
        &self,
        run_id: Uuid,
        stage: RunStage,
        rejected: Option<i64>,
    ) -> std::result::Result<RunRecord, Exhausted> {
        let timeout = self.settings.retry.call_timeout();
        let runs = &self.stores.runs;
        self.settings
            .retry
            .run("record stage", move || {
                with_timeout("run store", timeout, runs.record_stage(run_id, stage, rejected))
            })
            .await
    }

    async fn finish_run(
        &self,
        run_id: Uuid,
        status: RunStatus,
        reason: Option<FailureReason>,
    ) -> std::result::Result<RunRecord, Exhausted> {
        let timeout = self.settings.retry.call_timeout();
        let runs = &self.stores.runs;
        self.settings
            .retry
            .run("finish run", move || {
                with_timeout("run store", timeout, runs.finish_run(run_id, status, reason.clone()))
            })
            .await
    }

    /// Mark the run failed and hand back the error that caused it
    async fn fail(&self, run: &RunRecord, step: Step, exhausted: Exhausted, affected: i64) -> PipelineError {
        let Exhausted { error, attempts } = exhausted;
        error!(
            run_id = %run.run_id,
            step = step.as_str(),
            kind = %error.kind(),
            attempts,
            error = %error,
            "Step failed"
        );

        let reason = FailureReason {
            step: step.as_str().to_string(),
            kind: error.kind(),
            affected_records: affected,
            attempts,
            message: error.to_string(),
        };
        if let Err(record_err) = self.finish_run(run.run_id, RunStatus::Failed, Some(reason)).await {
            error!(run_id = %run.run_id, error = %record_err.error, "Could not record run failure");
        }

        error
    }

    async fn cancel_run(&self, run: &RunRecord, step: Step, affected: i64) -> PipelineError {
        warn!(run_id = %run.run_id, step = step.as_str(), "Run cancelled before step");
        let reason = FailureReason {
            step: step.as_str().to_string(),
            kind: ErrorKind::Cancelled,
            affected_records: affected,
            attempts: 0,
            message: format!("cancelled before {}", step),
        };
        if let Err(record_err) = self.finish_run(run.run_id, RunStatus::Cancelled, Some(reason)).await {
            error!(run_id = %run.run_id, error = %record_err.error, "Could not record run cancellation");
        }

        PipelineError::Cancelled(format!("run {} cancelled before {}", run.run_id, step))
    }
}
