//! Batch job definitions and the per-job state machine

use crate::engine::EngineOutput;
use crate::intake::UploadedFile;
use crate::operation::{OperationKind, OperationRequest};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

/// Lifecycle position of a job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    /// Waiting for a worker
    Queued,
    /// File is being handed to the engine
    Uploading,
    /// Engine call in flight
    Processing,
    /// Engine returned an output
    Completed,
    /// Job ended without an output
    Failed,
}

impl JobState {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobState::Completed | JobState::Failed)
    }

    /// Forward one step, or to `Failed` from any non-terminal state
    pub fn can_transition_to(self, next: JobState) -> bool {
        match (self, next) {
            (JobState::Queued, JobState::Uploading)
            | (JobState::Uploading, JobState::Processing)
            | (JobState::Processing, JobState::Completed) => true,
            (from, JobState::Failed) => !from.is_terminal(),
            _ => false,
        }
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobState::Queued => write!(f, "Queued"),
            JobState::Uploading => write!(f, "Uploading"),
            JobState::Processing => write!(f, "Processing"),
            JobState::Completed => write!(f, "Completed"),
            JobState::Failed => write!(f, "Failed"),
        }
    }
}

/// Why a job ended in `Failed`
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "reason", rename_all = "snake_case")]
pub enum JobFailure {
    /// The engine refused the input
    #[error("Validation error: {0}")]
    Validation(String),

    /// Opaque engine failure
    #[error("Engine error: {0}")]
    Engine(String),

    #[error("Operation timed out")]
    Timeout,

    #[error("Operation cancelled")]
    Cancelled,
}

/// Attempted move that the state machine forbids
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("cannot move job from {from} to {to}")]
pub struct TransitionError {
    pub from: JobState,
    pub to: JobState,
}

/// State plus the data that only exists in that state
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Uploading,
    Processing,
    Completed { output: EngineOutput },
    Failed { failure: JobFailure },
}

impl JobStatus {
    pub fn state(&self) -> JobState {
        match self {
            JobStatus::Queued => JobState::Queued,
            JobStatus::Uploading => JobState::Uploading,
            JobStatus::Processing => JobState::Processing,
            JobStatus::Completed { .. } => JobState::Completed,
            JobStatus::Failed { .. } => JobState::Failed,
        }
    }
}

/// One file travelling through one operation
#[derive(Debug, Clone, Serialize)]
pub struct Job {
    pub id: Uuid,
    pub file: UploadedFile,
    pub request: OperationRequest,
    #[serde(flatten)]
    status: JobStatus,
    /// Engine time budget for this job
    #[serde(skip)]
    pub timeout: Option<Duration>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl Job {
    pub fn new(file: UploadedFile, request: OperationRequest) -> Self {
        Self {
            id: Uuid::new_v4(),
            file,
            request,
            status: JobStatus::Queued,
            timeout: None,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn operation(&self) -> OperationKind {
        self.request.kind()
    }

    pub fn status(&self) -> &JobStatus {
        &self.status
    }

    pub fn state(&self) -> JobState {
        self.status.state()
    }

    pub fn is_terminal(&self) -> bool {
        self.state().is_terminal()
    }

    pub fn failure(&self) -> Option<&JobFailure> {
        match &self.status {
            JobStatus::Failed { failure } => Some(failure),
            _ => None,
        }
    }

    pub fn output(&self) -> Option<&EngineOutput> {
        match &self.status {
            JobStatus::Completed { output } => Some(output),
            _ => None,
        }
    }

    pub fn original_size_bytes(&self) -> u64 {
        self.file.size_bytes
    }

    /// Defined only once the job has completed
    pub fn result_size_bytes(&self) -> Option<u64> {
        self.output().map(|output| output.output_size_bytes)
    }

    /// Get a display name for the job
    pub fn display_name(&self) -> String {
        format!("{} {}", self.operation(), self.file.name)
    }

    /// Time spent between leaving the queue and reaching a terminal state
    pub fn duration(&self) -> Option<std::time::Duration> {
        let finished = self.finished_at?;
        let started = self.started_at.unwrap_or(finished);
        (finished - started).to_std().ok()
    }

    pub fn begin_upload(&mut self) -> Result<(), TransitionError> {
        self.transition(JobStatus::Uploading)
    }

    pub fn begin_processing(&mut self) -> Result<(), TransitionError> {
        self.transition(JobStatus::Processing)
    }

    pub fn complete(&mut self, output: EngineOutput) -> Result<(), TransitionError> {
        self.transition(JobStatus::Completed { output })
    }

    pub fn fail(&mut self, failure: JobFailure) -> Result<(), TransitionError> {
        self.transition(JobStatus::Failed { failure })
    }

    fn transition(&mut self, next: JobStatus) -> Result<(), TransitionError> {
        let from = self.state();
        let to = next.state();
        if !from.can_transition_to(to) {
            return Err(TransitionError { from, to });
        }

        self.status = next;
        match to {
            JobState::Uploading => self.started_at = Some(Utc::now()),
            state if state.is_terminal() => self.finished_at = Some(Utc::now()),
            _ => {}
        }
        Ok(())
    }
}
