//! Worker pool for concurrent batch processing

use super::job::JobFailure;
use super::run::BatchShared;
use crate::engine::{EngineOutput, OperationEngine};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, error, warn};

/// Options for worker pool
#[derive(Debug, Clone)]
pub struct WorkerOptions {
    /// Jobs allowed in flight at once
    pub num_workers: usize,
}

/// Dispatches the jobs of one batch run onto the engine
///
/// Jobs are started in submission order, at most `num_workers` at a time.
/// With one worker every job ends before the next one starts.
pub struct WorkerPool<E> {
    engine: Arc<E>,
    options: WorkerOptions,
    permits: Arc<Semaphore>,
}

impl<E: OperationEngine> WorkerPool<E> {
    pub fn new(engine: Arc<E>, options: WorkerOptions) -> Self {
        let permits = Arc::new(Semaphore::new(options.num_workers.max(1)));
        Self {
            engine,
            options,
            permits,
        }
    }

    /// Drive every job of the run to a terminal state
    pub(crate) async fn run(self, shared: Arc<BatchShared>) {
        let mut cancel = shared.cancel_signal();
        let mut tasks = JoinSet::new();

        for index in 0..shared.job_count() {
            let permit = tokio::select! {
                biased;
                _ = cancelled(&mut cancel) => break,
                permit = Arc::clone(&self.permits).acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            let engine = Arc::clone(&self.engine);
            let shared = Arc::clone(&shared);
            let cancel = cancel.clone();

            tasks.spawn(async move {
                let _permit = permit;
                let _guard = AbandonGuard {
                    shared: &shared,
                    index,
                };
                run_job(engine.as_ref(), &shared, index, cancel).await;
            });
        }

        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                error!(batch = %shared.id(), "Worker task ended abnormally: {e}");
            }
        }
        debug!(batch = %shared.id(), "All workers finished");
    }
}

/// Fails the job if its worker unwinds before recording an outcome
struct AbandonGuard<'a> {
    shared: &'a BatchShared,
    index: usize,
}

impl Drop for AbandonGuard<'_> {
    fn drop(&mut self) {
        self.shared.abandon(self.index);
    }
}

/// Run one job through upload and processing
async fn run_job<E: OperationEngine>(
    engine: &E,
    shared: &BatchShared,
    index: usize,
    mut cancel: watch::Receiver<bool>,
) {
    let Some((file, request, timeout)) = shared.begin_upload(index) else {
        // Cancelled while queued
        return;
    };

    let work = async {
        let staged = engine.stage(&file).await?;
        shared
            .begin_processing(index)
            .map_err(|_| JobFailure::Cancelled)?;
        engine.process(&staged, &request).await
    };

    let outcome = tokio::select! {
        biased;
        // `BatchShared::cancel` fails the job itself
        _ = cancelled(&mut cancel) => return,
        outcome = with_timeout(timeout, work) => outcome,
    };

    if let Err(failure) = &outcome {
        warn!(file = %file.name, "Job failed: {failure}");
    }
    shared.finish(index, outcome);
}

async fn with_timeout<F>(timeout: Option<Duration>, work: F) -> Result<EngineOutput, JobFailure>
where
    F: Future<Output = Result<EngineOutput, JobFailure>>,
{
    match timeout {
        Some(limit) => tokio::time::timeout(limit, work)
            .await
            .unwrap_or(Err(JobFailure::Timeout)),
        None => work.await,
    }
}

/// Resolves once the run is cancelled
async fn cancelled(signal: &mut watch::Receiver<bool>) {
    if signal.wait_for(|cancelled| *cancelled).await.is_err() {
        // Sender gone: the run can no longer be cancelled
        std::future::pending::<()>().await;
    }
}
