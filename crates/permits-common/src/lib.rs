//! Permits Common Library
#![deny(clippy::unwrap_used, clippy::expect_used)]
//!
//! Shared types, utilities, and error handling for the permits ETL workspace.
//!
//! # Overview
//!
//! - **Error Handling**: the pipeline error taxonomy and result alias
//! - **Checksums**: SHA-256 helpers for raw snapshots and derived-record fingerprints
//! - **Logging**: `tracing` subscriber initialisation shared by every binary
//! - **Types**: pipeline steps, run stages and run status
//!
//! # Example
//!
//! ```no_run
//! use permits_common::{PipelineError, Result};
//! use permits_common::checksum::sha256_hex;
//!
//! fn snapshot_id(bytes: &[u8]) -> Result<String> {
//!     if bytes.is_empty() {
//!         return Err(PipelineError::validation("empty snapshot"));
//!     }
//!     Ok(sha256_hex(bytes))
//! }
//! ```

pub mod checksum;
pub mod error;
pub mod logging;
pub mod types;

// Re-export commonly used types
pub use error::{ErrorKind, PipelineError, Result};
pub use types::{RunStage, RunStatus, Step};
