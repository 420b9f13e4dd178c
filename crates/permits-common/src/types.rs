//! Pipeline steps and run state shared across the workspace

use serde::{Deserialize, Serialize};
use std::str::FromStr;

use crate::error::PipelineError;

/// Durable progress marker of a run.
///
/// Ordered: a run at `Curated` has also completed `RawUploaded` and
/// `StagingLoaded`. `Failed` sorts last but is not "further along".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStage {
    Pending,
    RawUploaded,
    StagingLoaded,
    Curated,
    Indexed,
    Reported,
    Complete,
    Failed,
}

impl RunStage {
    pub fn as_str(&self) -> &str {
        match self {
            RunStage::Pending => "pending",
            RunStage::RawUploaded => "raw_uploaded",
            RunStage::StagingLoaded => "staging_loaded",
            RunStage::Curated => "curated",
            RunStage::Indexed => "indexed",
            RunStage::Reported => "reported",
            RunStage::Complete => "complete",
            RunStage::Failed => "failed",
        }
    }

    /// Whether `self` is at or beyond `other` on the success path
    pub fn has_reached(&self, other: RunStage) -> bool {
        *self != RunStage::Failed && *self >= other
    }
}

impl FromStr for RunStage {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(RunStage::Pending),
            "raw_uploaded" => Ok(RunStage::RawUploaded),
            "staging_loaded" => Ok(RunStage::StagingLoaded),
            "curated" => Ok(RunStage::Curated),
            "indexed" => Ok(RunStage::Indexed),
            "reported" => Ok(RunStage::Reported),
            "complete" => Ok(RunStage::Complete),
            "failed" => Ok(RunStage::Failed),
            other => Err(PipelineError::schema(
                "pipeline_runs.stage",
                format!("unknown run stage '{}'", other),
            )),
        }
    }
}

impl std::fmt::Display for RunStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle status of a run record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    InProgress,
    Succeeded,
    Failed,
    Cancelled,
}

impl RunStatus {
    pub fn as_str(&self) -> &str {
        match self {
            RunStatus::InProgress => "in_progress",
            RunStatus::Succeeded => "succeeded",
            RunStatus::Failed => "failed",
            RunStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, RunStatus::InProgress)
    }
}

impl FromStr for RunStatus {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "in_progress" => Ok(RunStatus::InProgress),
            "succeeded" => Ok(RunStatus::Succeeded),
            "failed" => Ok(RunStatus::Failed),
            "cancelled" => Ok(RunStatus::Cancelled),
            other => Err(PipelineError::schema(
                "pipeline_runs.status",
                format!("unknown run status '{}'", other),
            )),
        }
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The five entry points a scheduler invokes, in fixed order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Step {
    Raw,
    Staging,
    Curation,
    Indexing,
    Reporting,
}

impl Step {
    pub const ORDER: [Step; 5] = [
        Step::Raw,
        Step::Staging,
        Step::Curation,
        Step::Indexing,
        Step::Reporting,
    ];

    pub fn as_str(&self) -> &str {
        match self {
            Step::Raw => "raw",
            Step::Staging => "staging",
            Step::Curation => "curation",
            Step::Indexing => "indexing",
            Step::Reporting => "reporting",
        }
    }

    /// Stage that must be durably recorded before this step may start
    pub fn requires(&self) -> RunStage {
        match self {
            Step::Raw => RunStage::Pending,
            Step::Staging => RunStage::RawUploaded,
            Step::Curation => RunStage::StagingLoaded,
            Step::Indexing => RunStage::Curated,
            Step::Reporting => RunStage::Indexed,
        }
    }

    /// Stage recorded once this step commits
    pub fn completes(&self) -> RunStage {
        match self {
            Step::Raw => RunStage::RawUploaded,
            Step::Staging => RunStage::StagingLoaded,
            Step::Curation => RunStage::Curated,
            Step::Indexing => RunStage::Indexed,
            Step::Reporting => RunStage::Reported,
        }
    }
}

impl FromStr for Step {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "raw" => Ok(Step::Raw),
            "staging" => Ok(Step::Staging),
            "curation" | "curated" => Ok(Step::Curation),
            "indexing" | "index" => Ok(Step::Indexing),
            "reporting" | "report" => Ok(Step::Reporting),
            other => Err(PipelineError::config(format!(
                "unknown step '{}': expected raw, staging, curation, indexing or reporting",
                other
            ))),
        }
    }
}

impl std::fmt::Display for Step {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
