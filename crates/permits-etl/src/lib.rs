//! Permits ETL Library
#![deny(clippy::unwrap_used, clippy::expect_used)]
//!
//! Zone-transition pipeline for municipal building permits.
//!
//! # Overview
//!
//! A run moves one raw snapshot through four zones and a report:
//!
//! - **Raw**: the snapshot as received, in object storage (S3-compatible)
//! - **Staging**: validated rows in PostgreSQL, with rejects kept for audit
//! - **Curated**: enriched documents (value category, labels, geo point)
//! - **Indexed**: search entries in Elasticsearch
//! - **Report**: cross-zone analytics written as a JSON artifact
//!
//! The [`coordinator::PipelineCoordinator`] drives the stages in order under a
//! run record that doubles as the per-dataset lock.
//!
//! # Example
//!
//! ```no_run
//! use permits_etl::{config::Config, coordinator::{PipelineCoordinator, RawSource}, stores::Stores};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load()?;
//!     let stores = Stores::connect(&config).await?;
//!     let coordinator = PipelineCoordinator::new(stores, &config);
//!     let summary = coordinator
//!         .run(&config.pipeline.dataset_key, RawSource::File("permits.json".into()))
//!         .await?;
//!     println!("run {} finished at {}", summary.run.run_id, summary.run.stage);
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod coordinator;
pub mod models;
pub mod retry;
pub mod stages;
pub mod stores;

pub use config::Config;
pub use coordinator::{PipelineCoordinator, RawSource, RunSummary, StepOutcome};
pub use stores::Stores;

use clap::{Parser, Subcommand};
use permits_common::Step;
use std::path::PathBuf;
use uuid::Uuid;

/// Permits ETL - building permit zone pipeline
#[derive(Parser, Debug)]
#[command(name = "permits-etl")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Dataset key (defaults to PERMITS_DATASET_KEY or the built-in key)
    #[arg(short, long, global = true)]
    pub dataset: Option<String>,

    /// Use in-memory stores instead of Postgres, S3 and Elasticsearch
    #[arg(long, global = true)]
    pub in_memory: bool,

    /// Verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run every step for the dataset under a new run
    Run {
        /// Local snapshot to upload; reuses the stored snapshot when omitted
        #[arg(short, long)]
        source: Option<PathBuf>,
    },

    /// Open a run for a scheduler to drive step by step
    Begin,

    /// Run a single step of an open run
    Stage {
        /// raw, staging, curation, indexing or reporting
        step: Step,

        /// Run identifier returned by `begin`
        #[arg(long)]
        run_id: Uuid,

        /// Local snapshot to upload (raw step only)
        #[arg(short, long)]
        source: Option<PathBuf>,
    },

    /// Drop the search index and rebuild it from curated
    RebuildIndex,

    /// Recompute the analytics report from the current zones
    Report,

    /// Show the latest run record for the dataset
    Status,
}

impl Commands {
    pub fn raw_source(source: Option<&PathBuf>) -> RawSource {
        match source {
            Some(path) => RawSource::File(path.clone()),
            None => RawSource::Stored,
        }
    }
}
