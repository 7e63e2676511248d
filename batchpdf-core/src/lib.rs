//! # batchpdf
//!
//! Batch file-operation pipeline: validate uploads, resolve page selections,
//! run one operation over many files with bounded concurrency, and aggregate
//! the results into statistics and a downloadable bundle.
//!
//! ## Features
//!
//! - **File Intake**: size and type checks with structured rejection details
//! - **Page Selections**: `"1-3,5,7-9"` expressions and fixed-size partitions
//! - **Batch Orchestration**: per-job state machine, timeouts, cancellation
//! - **Pluggable Engines**: any [`OperationEngine`]; [`CommandEngine`] runs an external program
//! - **Results**: byte statistics, reduction ratios and bundle manifests
//!
//! ## Quick Start
//!
//! ```rust
//! use batchpdf::pages::{parse_partition, parse_selection};
//!
//! # fn main() -> Result<(), batchpdf::pages::PageSelectionError> {
//! let selection = parse_selection("7-9, 1-3, 5", 10)?;
//! assert_eq!(selection.pages(), &[1, 2, 3, 5, 7, 8, 9]);
//!
//! let groups = parse_partition(10, 4)?;
//! assert_eq!(groups.len(), 3);
//! # Ok(())
//! # }
//! ```

pub mod batch;
pub mod engine;
pub mod error;
pub mod intake;
pub mod operation;
pub mod pages;

pub use batch::{
    BatchOptions, BatchProcessor, BatchRunHandle, BatchStatistics, BatchSummary, Job, JobFailure,
    JobState, SchedulingPolicy, Submission,
};
pub use engine::{CommandEngine, EngineOutput, OperationEngine, Packager};
pub use error::{BatchError, Result};
pub use intake::{FileRef, FileValidator, SizeConstraint, UploadedFile, ValidationError};
pub use operation::{OperationKind, OperationParameters, OperationRequest};
pub use pages::{PageRange, PageSelection, PageSelectionError, ResolvedPages};

/// Current version of batchpdf
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
