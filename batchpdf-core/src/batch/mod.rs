//! Batch orchestration
//!
//! A batch run applies one operation to many uploaded files. Each accepted
//! file becomes a [`Job`] that moves through
//! `Queued -> Uploading -> Processing -> Completed`, or ends in `Failed` from
//! any live state. A failing job never affects its siblings.
//!
//! # Features
//!
//! - **Bounded concurrency**: at most `parallelism` jobs hold an engine at once
//! - **Sequential scheduling**: one job at a time, in submission order
//! - **Progress tracking**: every transition is published to subscribers
//! - **Timeouts**: per-job budget covering upload and processing
//! - **Cancellation**: pending and running jobs end as `Failed(Cancelled)`
//! - **Result aggregation**: size statistics and a bundle manifest
//!
//! # Example
//!
//! ```rust,no_run
//! use batchpdf::batch::{BatchOptions, BatchProcessor, SchedulingPolicy};
//! use batchpdf::engine::CommandEngine;
//! use batchpdf::intake::UploadedFile;
//! use batchpdf::operation::{CompressionQuality, OperationParameters};
//!
//! # async fn run() -> batchpdf::Result<()> {
//! let engine = CommandEngine::new("/usr/local/bin/pdf-engine", "/tmp/out");
//! let processor = BatchProcessor::new(engine, BatchOptions::default().with_parallelism(4));
//!
//! let files = vec![
//!     UploadedFile::new("a.pdf", 120_000, "/tmp/in/a.pdf"),
//!     UploadedFile::new("b.pdf", 95_000, "/tmp/in/b.pdf"),
//! ];
//! let submission = processor.submit_batch(
//!     files,
//!     OperationParameters::Compress { quality: CompressionQuality::High },
//!     SchedulingPolicy::Parallel,
//! )?;
//!
//! let summary = submission.handle.wait().await;
//! println!("{summary}");
//! # Ok(())
//! # }
//! ```

use crate::engine::OperationEngine;
use crate::error::Result;
use crate::intake::{FileValidator, SizeConstraint, UploadedFile, ValidationError};
use crate::operation::{OperationKind, OperationParameters, OperationRequest};
use crate::pages::PageSelectionError;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::info;

pub mod job;
pub mod progress;
pub mod result;
pub mod run;
pub mod worker;

// Re-export main types
pub use job::{Job, JobFailure, JobState, JobStatus, TransitionError};
pub use progress::{BatchProgress, ProgressBar, ProgressCallback, ProgressInfo};
pub use result::{
    ArchiveManifest, BatchStatistics, BatchSummary, JobResult, ManifestEntry, ResultsAggregator,
};
pub use run::BatchRunHandle;
pub use worker::{WorkerOptions, WorkerPool};

/// Default per-job time budget
pub const DEFAULT_JOB_TIMEOUT: Duration = Duration::from_secs(300);

/// How the jobs of one run share the engine
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SchedulingPolicy {
    /// Up to `parallelism` jobs at once
    #[default]
    Parallel,
    /// One job at a time, in submission order
    Sequential,
}

/// Options for batch processing
#[derive(Clone)]
pub struct BatchOptions {
    /// Number of parallel workers
    pub parallelism: usize,
    /// Policy used when a submission does not pick one
    pub scheduling: SchedulingPolicy,
    /// Progress callback
    pub progress_callback: Option<Arc<dyn ProgressCallback>>,
    /// Timeout for individual jobs
    pub job_timeout: Option<Duration>,
    /// Overrides `job_timeout` for specific operations
    pub operation_timeouts: HashMap<OperationKind, Duration>,
    /// Per-file upload limit applied at submission
    pub size_constraint: SizeConstraint,
}

impl Default for BatchOptions {
    fn default() -> Self {
        Self {
            parallelism: num_cpus::get(),
            scheduling: SchedulingPolicy::Parallel,
            progress_callback: None,
            job_timeout: Some(DEFAULT_JOB_TIMEOUT),
            operation_timeouts: HashMap::new(),
            size_constraint: SizeConstraint::default(),
        }
    }
}

impl BatchOptions {
    /// Set the number of parallel workers
    pub fn with_parallelism(mut self, parallelism: usize) -> Self {
        self.parallelism = parallelism.max(1);
        self
    }

    pub fn with_scheduling(mut self, scheduling: SchedulingPolicy) -> Self {
        self.scheduling = scheduling;
        self
    }

    /// Set progress callback
    pub fn with_progress_callback<F>(mut self, callback: F) -> Self
    where
        F: Fn(&ProgressInfo) + Send + Sync + 'static,
    {
        self.progress_callback = Some(Arc::new(callback));
        self
    }

    /// Set job timeout
    pub fn with_job_timeout(mut self, timeout: Duration) -> Self {
        self.job_timeout = Some(timeout);
        self
    }

    /// Let jobs run for as long as the engine needs
    pub fn without_job_timeout(mut self) -> Self {
        self.job_timeout = None;
        self
    }

    pub fn with_operation_timeout(mut self, kind: OperationKind, timeout: Duration) -> Self {
        self.operation_timeouts.insert(kind, timeout);
        self
    }

    pub fn with_size_constraint(mut self, constraint: SizeConstraint) -> Self {
        self.size_constraint = constraint;
        self
    }

    /// Timeout a job of `kind` runs under
    pub fn timeout_for(&self, kind: OperationKind) -> Option<Duration> {
        self.operation_timeouts
            .get(&kind)
            .copied()
            .or(self.job_timeout)
    }

    /// Jobs allowed in flight under `policy`
    pub fn concurrency(&self, policy: SchedulingPolicy) -> usize {
        match policy {
            SchedulingPolicy::Parallel => self.parallelism.max(1),
            SchedulingPolicy::Sequential => 1,
        }
    }
}

/// Why a submitted file did not become a job
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum IntakeRejection {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    PageSelection(#[from] PageSelectionError),

    #[error("Could not determine the page count of {0}")]
    PageCountUnknown(String),
}

/// A file refused at submission, with the reason
#[derive(Debug, Clone)]
pub struct RejectedFile {
    pub file: UploadedFile,
    pub reason: IntakeRejection,
}

/// Outcome of submitting a batch
#[derive(Debug)]
pub struct Submission {
    pub handle: BatchRunHandle,
    /// Files that never became jobs
    pub rejected: Vec<RejectedFile>,
}

/// Runs batches of one operation against an engine
pub struct BatchProcessor<E> {
    engine: Arc<E>,
    options: BatchOptions,
}

impl<E: OperationEngine> BatchProcessor<E> {
    /// Create a new batch processor
    pub fn new(engine: E, options: BatchOptions) -> Self {
        Self::with_shared_engine(Arc::new(engine), options)
    }

    pub fn with_shared_engine(engine: Arc<E>, options: BatchOptions) -> Self {
        Self { engine, options }
    }

    pub fn options(&self) -> &BatchOptions {
        &self.options
    }

    pub fn engine(&self) -> &Arc<E> {
        &self.engine
    }

    /// Validate the files, create one job per accepted file and start the run.
    ///
    /// Invalid parameters reject the whole submission. Individual files that
    /// fail intake or page resolution are returned in
    /// [`Submission::rejected`] and the rest still run. Must be called from
    /// within a tokio runtime.
    pub fn submit_batch(
        &self,
        files: Vec<UploadedFile>,
        parameters: OperationParameters,
        policy: SchedulingPolicy,
    ) -> Result<Submission> {
        parameters.validate()?;

        let kind = parameters.kind();
        let validator = FileValidator::for_operation(kind, self.options.size_constraint);
        let timeout = self.options.timeout_for(kind);

        let mut jobs = Vec::with_capacity(files.len());
        let mut rejected = Vec::new();

        for file in files {
            match admit(&validator, &file, &parameters) {
                Ok(request) => jobs.push(Job::new(file, request).with_timeout(timeout)),
                Err(reason) => rejected.push(RejectedFile { file, reason }),
            }
        }

        let shared = Arc::new(run::BatchShared::new(
            parameters,
            policy,
            jobs,
            self.options.progress_callback.clone(),
        ));

        info!(
            batch = %shared.id(),
            operation = kind.as_str(),
            jobs = shared.job_count(),
            rejected = rejected.len(),
            ?policy,
            "Batch submitted"
        );

        let pool = WorkerPool::new(
            Arc::clone(&self.engine),
            WorkerOptions {
                num_workers: self.options.concurrency(policy),
            },
        );
        let driver = Arc::clone(&shared);
        tokio::spawn(async move {
            let id = driver.id();
            pool.run(driver).await;
            info!(batch = %id, "Batch finished");
        });

        Ok(Submission {
            handle: BatchRunHandle::new(shared),
            rejected,
        })
    }

    /// Start a new run over the files whose jobs failed in `run`
    pub fn resubmit_failed(
        &self,
        run: &BatchRunHandle,
        policy: SchedulingPolicy,
    ) -> Result<Submission> {
        let files = run.failed_files();
        info!(batch = %run.id(), files = files.len(), "Resubmitting failed files");
        self.submit_batch(files, run.parameters().clone(), policy)
    }
}

/// Intake checks plus page resolution for one file
fn admit(
    validator: &FileValidator,
    file: &UploadedFile,
    parameters: &OperationParameters,
) -> std::result::Result<OperationRequest, IntakeRejection> {
    validator.validate(Some(file))?;

    let pages = if parameters.kind().targets_pages() {
        let page_count = file
            .page_count
            .ok_or_else(|| IntakeRejection::PageCountUnknown(file.name.clone()))?;
        parameters.resolve(page_count)?
    } else {
        None
    };

    Ok(OperationRequest {
        parameters: parameters.clone(),
        pages,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[test]
    fn test_batch_options_default() {
        let options = BatchOptions::default();
        assert!(options.parallelism > 0);
        assert_eq!(options.scheduling, SchedulingPolicy::Parallel);
        assert_eq!(options.job_timeout, Some(DEFAULT_JOB_TIMEOUT));
    }

    #[test]
    fn test_batch_options_builder() {
        let called = Arc::new(AtomicBool::new(false));
        let called_clone = Arc::clone(&called);

        let options = BatchOptions::default()
            .with_parallelism(0)
            .with_job_timeout(Duration::from_secs(60))
            .with_operation_timeout(OperationKind::Ocr, Duration::from_secs(600))
            .with_progress_callback(move |_info| {
                called_clone.store(true, Ordering::SeqCst);
            });

        assert_eq!(options.parallelism, 1);
        assert_eq!(options.timeout_for(OperationKind::Compress), Some(Duration::from_secs(60)));
        assert_eq!(options.timeout_for(OperationKind::Ocr), Some(Duration::from_secs(600)));
        assert!(options.progress_callback.is_some());

        let options = options.without_job_timeout();
        assert_eq!(options.timeout_for(OperationKind::Rotate), None);
    }

    #[test]
    fn test_concurrency_by_policy() {
        let options = BatchOptions::default().with_parallelism(6);
        assert_eq!(options.concurrency(SchedulingPolicy::Parallel), 6);
        assert_eq!(options.concurrency(SchedulingPolicy::Sequential), 1);
    }

    #[test]
    fn test_admit_resolves_pages() {
        let validator = FileValidator::default();
        let parameters: OperationParameters = serde_json::from_value(serde_json::json!({
            "operation": "rotate",
            "angle": 90,
            "pages": "2-3"
        }))
        .unwrap();

        let file = UploadedFile::new("a.pdf", 10, "/a.pdf").with_page_count(5);
        let request = admit(&validator, &file, &parameters).unwrap();
        assert!(request.pages.is_some());

        let short = UploadedFile::new("b.pdf", 10, "/b.pdf").with_page_count(2);
        assert!(matches!(
            admit(&validator, &short, &parameters),
            Err(IntakeRejection::PageSelection(PageSelectionError::OutOfRange { page: 3, .. }))
        ));

        let unknown = UploadedFile::new("c.pdf", 10, "/c.pdf");
        assert_eq!(
            admit(&validator, &unknown, &parameters).unwrap_err(),
            IntakeRejection::PageCountUnknown("c.pdf".to_string())
        );
    }

    #[test]
    fn test_admit_whole_file_operation_ignores_page_count() {
        let validator = FileValidator::default();
        let parameters = OperationParameters::Compress {
            quality: Default::default(),
        };
        let file = UploadedFile::new("a.pdf", 10, "/a.pdf");
        assert_eq!(admit(&validator, &file, &parameters).unwrap().pages, None);

        let text = UploadedFile::new("a.txt", 10, "/a.txt");
        assert!(matches!(
            admit(&validator, &text, &parameters),
            Err(IntakeRejection::Validation(ValidationError::UnsupportedType { .. }))
        ));
    }
}
