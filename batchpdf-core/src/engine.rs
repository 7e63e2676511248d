//! Processing engine seam
//!
//! The orchestrator never touches document bytes itself. Each job hands its
//! staged file and resolved [`OperationRequest`] to an [`OperationEngine`],
//! which reports either an [`EngineOutput`] or a [`JobFailure`].
//!
//! [`CommandEngine`] is the stock implementation: it runs an external
//! program once per job as
//!
//! ```text
//! <program> [args..] <operation> <input> <output> <request-json>
//! ```
//!
//! Exit status 0 means success and the file at `<output>` is the result.
//! Exit status 65 (`EX_DATAERR`) means the input was refused. Any other
//! status is reported as an engine failure with the program's stderr.

use crate::batch::job::JobFailure;
use crate::error::Result;
use crate::intake::{FileRef, UploadedFile};
use crate::operation::{OperationKind, OperationRequest};
use crate::batch::result::ArchiveManifest;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::process::Command;
use tracing::debug;
use uuid::Uuid;

/// Exit status an engine program uses to refuse its input
pub const EXIT_INVALID_INPUT: i32 = 65;

/// What an engine produced for one job
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineOutput {
    pub output_ref: FileRef,
    pub output_size_bytes: u64,
}

/// Performs one operation on one file
///
/// Dropping the returned future must abandon the work; the orchestrator
/// relies on this for timeouts and cancellation.
pub trait OperationEngine: Send + Sync + 'static {
    /// Make an uploaded file available to the engine.
    ///
    /// The default treats the intake reference as directly readable.
    fn stage(
        &self,
        file: &UploadedFile,
    ) -> impl Future<Output = std::result::Result<FileRef, JobFailure>> + Send {
        let file_ref = file.file_ref.clone();
        async move { Ok(file_ref) }
    }

    fn process(
        &self,
        file: &FileRef,
        request: &OperationRequest,
    ) -> impl Future<Output = std::result::Result<EngineOutput, JobFailure>> + Send;
}

/// Turns a batch manifest into a single downloadable artifact
pub trait Packager: Send + Sync {
    fn package(&self, manifest: &ArchiveManifest) -> impl Future<Output = Result<FileRef>> + Send;
}

/// Engine backed by an external program
#[derive(Debug, Clone)]
pub struct CommandEngine {
    program: PathBuf,
    args: Vec<String>,
    output_dir: PathBuf,
}

impl CommandEngine {
    pub fn new(program: impl Into<PathBuf>, output_dir: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            output_dir: output_dir.into(),
        }
    }

    /// Parse a whitespace separated command line such as `"python3 engine.py"`
    pub fn from_command_line(command_line: &str, output_dir: impl Into<PathBuf>) -> Option<Self> {
        let mut parts = command_line.split_whitespace();
        let program = parts.next()?;
        Some(Self::new(program, output_dir).with_args(parts))
    }

    /// Arguments placed before the per-job arguments
    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn program(&self) -> &Path {
        &self.program
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    fn output_path(&self, input: &Path, kind: OperationKind) -> PathBuf {
        let stem = input
            .file_stem()
            .and_then(|stem| stem.to_str())
            .unwrap_or("output");
        // Split produces several documents, delivered as one archive
        let extension = match kind {
            OperationKind::Split => "zip",
            _ => input
                .extension()
                .and_then(|ext| ext.to_str())
                .unwrap_or("pdf"),
        };
        self.output_dir.join(format!(
            "{stem}-{}-{}.{extension}",
            kind.as_str(),
            Uuid::new_v4().simple()
        ))
    }
}

impl OperationEngine for CommandEngine {
    async fn process(
        &self,
        file: &FileRef,
        request: &OperationRequest,
    ) -> std::result::Result<EngineOutput, JobFailure> {
        let kind = request.kind();
        let output = self.output_path(file.as_path(), kind);
        let request_json =
            serde_json::to_string(request).map_err(|e| JobFailure::Engine(e.to_string()))?;

        tokio::fs::create_dir_all(&self.output_dir)
            .await
            .map_err(|e| JobFailure::Engine(format!("cannot create output directory: {e}")))?;

        debug!(
            program = %self.program.display(),
            operation = kind.as_str(),
            input = %file,
            "Invoking engine"
        );

        let result = Command::new(&self.program)
            .args(&self.args)
            .arg(kind.as_str())
            .arg(file.as_path())
            .arg(&output)
            .arg(request_json)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| {
                JobFailure::Engine(format!("failed to start {}: {e}", self.program.display()))
            })?;

        if !result.status.success() {
            let stderr = String::from_utf8_lossy(&result.stderr).trim().to_string();
            let reason = if stderr.is_empty() {
                format!("engine exited with {}", result.status)
            } else {
                stderr
            };
            return Err(match result.status.code() {
                Some(EXIT_INVALID_INPUT) => JobFailure::Validation(reason),
                _ => JobFailure::Engine(reason),
            });
        }

        let metadata = tokio::fs::metadata(&output)
            .await
            .map_err(|e| JobFailure::Engine(format!("engine produced no output: {e}")))?;

        Ok(EngineOutput {
            output_ref: FileRef::from(output),
            output_size_bytes: metadata.len(),
        })
    }
}
