//! Shared state of one batch run and the handle callers hold on to

use super::job::{Job, JobFailure, JobState, TransitionError};
use super::progress::{BatchProgress, ProgressCallback, ProgressInfo};
use super::result::{ArchiveManifest, BatchStatistics, BatchSummary, JobResult, ResultsAggregator};
use super::SchedulingPolicy;
use crate::engine::{EngineOutput, Packager};
use crate::error::{BatchError, Result};
use crate::intake::{FileRef, UploadedFile};
use crate::operation::{OperationKind, OperationParameters, OperationRequest};
use chrono::{DateTime, Utc};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// State shared between a run's workers and its handles
pub(crate) struct BatchShared {
    id: Uuid,
    parameters: OperationParameters,
    scheduling: SchedulingPolicy,
    created_at: DateTime<Utc>,
    jobs: Mutex<Vec<Job>>,
    progress: BatchProgress,
    aggregator: ResultsAggregator,
    cancel_tx: watch::Sender<bool>,
    callback: Option<Arc<dyn ProgressCallback>>,
}

impl BatchShared {
    pub(crate) fn new(
        parameters: OperationParameters,
        scheduling: SchedulingPolicy,
        jobs: Vec<Job>,
        callback: Option<Arc<dyn ProgressCallback>>,
    ) -> Self {
        let (cancel_tx, _) = watch::channel(false);
        Self {
            id: Uuid::new_v4(),
            parameters,
            scheduling,
            created_at: Utc::now(),
            progress: BatchProgress::new(jobs.len()),
            jobs: Mutex::new(jobs),
            aggregator: ResultsAggregator::new(),
            cancel_tx,
            callback,
        }
    }

    pub(crate) fn id(&self) -> Uuid {
        self.id
    }

    pub(crate) fn job_count(&self) -> usize {
        self.progress.get_info().total
    }

    pub(crate) fn cancel_signal(&self) -> watch::Receiver<bool> {
        self.cancel_tx.subscribe()
    }

    pub(crate) fn is_cancelled(&self) -> bool {
        *self.cancel_tx.borrow()
    }

    fn jobs(&self) -> MutexGuard<'_, Vec<Job>> {
        self.jobs.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Apply one transition to the job at `index` and publish the effect
    ///
    /// `index` always comes from the run's own job list.
    fn update<R>(
        &self,
        index: usize,
        apply: impl FnOnce(&mut Job) -> std::result::Result<R, TransitionError>,
    ) -> std::result::Result<R, TransitionError> {
        let (value, info) = {
            let mut jobs = self.jobs();
            self.transition(&mut jobs[index], apply)?
        };

        self.notify(&info);
        Ok(value)
    }

    /// Transition one job; the caller holds the jobs lock
    fn transition<R>(
        &self,
        job: &mut Job,
        apply: impl FnOnce(&mut Job) -> std::result::Result<R, TransitionError>,
    ) -> std::result::Result<(R, ProgressInfo), TransitionError> {
        let from = job.state();
        let value = apply(job)?;
        let to = job.state();
        debug!(job = %job.id, file = %job.file.name, %from, %to, "Job transition");

        if to.is_terminal() {
            self.aggregator.on_job_completed(job);
        }
        Ok((value, self.progress.record(from, to)))
    }

    fn notify(&self, info: &ProgressInfo) {
        if let Some(callback) = &self.callback {
            callback.on_progress(info);
        }
    }

    /// Queued -> Uploading; `None` if the job already ended
    pub(crate) fn begin_upload(&self, index: usize) -> Option<(UploadedFile, OperationRequest, Option<Duration>)> {
        self.update(index, |job| {
            job.begin_upload()?;
            Ok((job.file.clone(), job.request.clone(), job.timeout))
        })
        .ok()
    }

    pub(crate) fn begin_processing(&self, index: usize) -> std::result::Result<(), TransitionError> {
        self.update(index, Job::begin_processing)
    }

    /// Record the outcome of a job; late results for ended jobs are dropped
    pub(crate) fn finish(&self, index: usize, outcome: std::result::Result<EngineOutput, JobFailure>) {
        let applied = self.update(index, |job| match outcome {
            Ok(output) => job.complete(output),
            Err(failure) => job.fail(failure),
        });

        if let Err(e) = applied {
            warn!(batch = %self.id, index, "Discarding late job result: {e}");
        }
    }

    /// Fail a job left behind by a worker that stopped early
    pub(crate) fn abandon(&self, index: usize) {
        if self.jobs()[index].is_terminal() {
            return;
        }
        let _ = self.update(index, |job| {
            job.fail(JobFailure::Engine("worker stopped before the job finished".to_string()))
        });
    }

    /// Signal cancellation and fail every job that has not ended
    ///
    /// Runs under the jobs lock, so a worker woken by the signal finds its
    /// job already `Failed(Cancelled)`.
    pub(crate) fn cancel(&self) -> usize {
        let (cancelled, latest) = {
            let mut jobs = self.jobs();
            self.cancel_tx.send_replace(true);

            let mut cancelled = 0;
            let mut latest = None;
            for job in jobs.iter_mut().filter(|job| !job.is_terminal()) {
                if let Ok(((), info)) = self.transition(job, |job| job.fail(JobFailure::Cancelled)) {
                    cancelled += 1;
                    latest = Some(info);
                }
            }
            (cancelled, latest)
        };

        if let Some(info) = latest {
            self.notify(&info);
        }
        info!(batch = %self.id, cancelled, "Batch cancelled");
        cancelled
    }
}

/// Cheap, cloneable view of a running or finished batch
#[derive(Clone)]
pub struct BatchRunHandle {
    shared: Arc<BatchShared>,
}

impl BatchRunHandle {
    pub(crate) fn new(shared: Arc<BatchShared>) -> Self {
        Self { shared }
    }

    pub fn id(&self) -> Uuid {
        self.shared.id
    }

    pub fn operation(&self) -> OperationKind {
        self.shared.parameters.kind()
    }

    pub fn parameters(&self) -> &OperationParameters {
        &self.shared.parameters
    }

    pub fn scheduling(&self) -> SchedulingPolicy {
        self.shared.scheduling
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.shared.created_at
    }

    /// Current progress without waiting
    pub fn progress(&self) -> ProgressInfo {
        self.shared.progress.get_info()
    }

    /// Receiver that sees every job transition
    pub fn subscribe(&self) -> watch::Receiver<ProgressInfo> {
        self.shared.progress.subscribe()
    }

    /// Snapshot of every job in submission order
    pub fn jobs(&self) -> Vec<Job> {
        self.shared.jobs().clone()
    }

    pub fn job(&self, job_id: Uuid) -> Option<Job> {
        self.shared.jobs().iter().find(|job| job.id == job_id).cloned()
    }

    /// True once every job is `Completed` or `Failed`
    pub fn is_terminal(&self) -> bool {
        self.progress().is_complete()
    }

    pub fn is_cancelled(&self) -> bool {
        self.shared.is_cancelled()
    }

    /// True when at least one job failed
    pub fn has_failures(&self) -> bool {
        self.progress().failed > 0
    }

    /// Stop the run; returns how many jobs were cancelled
    pub fn cancel(&self) -> usize {
        self.shared.cancel()
    }

    /// Wait until every job has ended
    pub async fn wait(&self) -> BatchSummary {
        let mut rx = self.subscribe();
        // The sender lives as long as `self`
        let _ = rx.wait_for(ProgressInfo::is_complete).await;
        self.summary()
    }

    /// Running totals over the jobs completed so far
    pub fn statistics(&self) -> BatchStatistics {
        self.shared.aggregator.statistics()
    }

    /// Statistics once the run has ended
    pub async fn finalize(&self) -> BatchStatistics {
        self.wait().await.statistics
    }

    /// Manifest of the completed outputs
    pub fn bundle(&self) -> ArchiveManifest {
        ArchiveManifest::from_jobs(self.id(), &self.shared.jobs())
    }

    /// Package the completed outputs; refused while jobs are still running
    pub async fn package<P: Packager>(&self, packager: &P) -> Result<(ArchiveManifest, FileRef)> {
        if !self.is_terminal() {
            return Err(BatchError::Packaging(format!(
                "batch {} is still running",
                self.id()
            )));
        }

        let manifest = self.bundle();
        if manifest.is_empty() {
            return Err(BatchError::Packaging(format!(
                "batch {} has no completed outputs",
                self.id()
            )));
        }

        let bundle = packager.package(&manifest).await?;
        info!(
            batch = %self.id(),
            entries = manifest.entries.len(),
            warnings = manifest.has_warnings,
            "Bundle packaged"
        );
        Ok((manifest, bundle))
    }

    /// Files whose jobs ended in `Failed`, in submission order
    pub fn failed_files(&self) -> Vec<UploadedFile> {
        self.shared
            .jobs()
            .iter()
            .filter(|job| job.state() == JobState::Failed)
            .map(|job| job.file.clone())
            .collect()
    }

    pub fn summary(&self) -> BatchSummary {
        let jobs = self.jobs();
        let info = self.progress();
        let finished = jobs.iter().filter_map(|job| job.finished_at).max();
        let duration = finished
            .and_then(|finished| (finished - self.created_at()).to_std().ok())
            .unwrap_or_else(|| info.elapsed());

        BatchSummary {
            batch_id: self.id(),
            total_jobs: info.total,
            successful: info.completed,
            failed: info.failed,
            cancelled: self.is_cancelled(),
            duration,
            statistics: self.statistics(),
            results: jobs.iter().filter_map(JobResult::from_job).collect(),
        }
    }
}

impl std::fmt::Debug for BatchRunHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BatchRunHandle")
            .field("id", &self.id())
            .field("operation", &self.operation())
            .field("progress", &self.progress().to_string())
            .finish()
    }
}
