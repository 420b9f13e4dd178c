//! The zone-transition stages, one module per zone plus reporting

pub mod curation;
pub mod indexer;
pub mod raw;
pub mod report;
pub mod staging;

pub use curation::{CurationEnricher, CurationOutcome};
pub use indexer::{IndexMode, IndexOutcome, Indexer};
pub use raw::RawStore;
pub use report::{write_report, AnalysisReport, ReportAggregator};
pub use staging::{StagingLoader, StagingOutcome};
