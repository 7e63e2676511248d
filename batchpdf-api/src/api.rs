use crate::config::ServerConfig;
use crate::packager::ZipPackager;
use axum::{
    extract::{DefaultBodyLimit, Json, Multipart, Path, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Router,
};
use batchpdf::batch::{BatchStatistics, IntakeRejection, RejectedFile, Submission};
use batchpdf::intake::{count_pdf_pages, format_file_size, SizeDetails};
use batchpdf::{
    BatchError, BatchProcessor, BatchRunHandle, FileValidator, Job, JobState, OperationEngine,
    OperationKind, OperationParameters, SchedulingPolicy, UploadedFile, ValidationError,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path as FsPath;
use std::sync::Arc;
use tempfile::TempDir;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::sync::RwLock;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Multipart field carrying the files of a batch
pub const FILES_FIELD: &str = "files";
/// Multipart field carrying the single file of a validation request
pub const FILE_FIELD: &str = "file";

/// Standard error response structure
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    /// Human-readable error message describing what went wrong
    pub error: String,
    /// Size context for oversize uploads, or the cause of an internal failure
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

/// Request-level failure while reading an upload
#[derive(Error, Debug)]
pub enum ExtractionError {
    #[error("Failed to parse form data")]
    MalformedFormData(String),

    #[error("Failed to store upload")]
    Storage(#[from] std::io::Error),
}

impl ExtractionError {
    fn details(&self) -> String {
        match self {
            ExtractionError::MalformedFormData(cause) => cause.clone(),
            ExtractionError::Storage(e) => e.to_string(),
        }
    }
}

/// Application-specific error types for the API
#[derive(Error, Debug)]
pub enum AppError {
    /// Upload refused at intake
    #[error(transparent)]
    Validation(#[from] ValidationError),
    /// Malformed parameters or page selections
    #[error("{0}")]
    BadRequest(String),
    #[error(transparent)]
    Extraction(#[from] ExtractionError),
    #[error("Batch {0} not found")]
    NotFound(Uuid),
    /// Request does not fit the batch's current state
    #[error("{0}")]
    Conflict(String),
    #[error("{0}")]
    Internal(String),
}

impl From<BatchError> for AppError {
    fn from(err: BatchError) -> Self {
        match err {
            BatchError::Validation(e) => AppError::Validation(e),
            BatchError::PageSelection(_) | BatchError::Parameters(_) => {
                AppError::BadRequest(err.to_string())
            }
            BatchError::Packaging(message) => AppError::Conflict(message),
            other => AppError::Internal(other.to_string()),
        }
    }
}

impl From<IntakeRejection> for AppError {
    fn from(rejection: IntakeRejection) -> Self {
        match rejection {
            IntakeRejection::Validation(e) => AppError::Validation(e),
            other => AppError::BadRequest(other.to_string()),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, details) = match &self {
            AppError::Validation(e) => (
                StatusCode::BAD_REQUEST,
                e.size_details().and_then(|d| serde_json::to_value(d).ok()),
            ),
            AppError::BadRequest(_) => (StatusCode::BAD_REQUEST, None),
            AppError::Extraction(e) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                Some(serde_json::Value::String(e.details())),
            ),
            AppError::NotFound(_) => (StatusCode::NOT_FOUND, None),
            AppError::Conflict(_) => (StatusCode::CONFLICT, None),
            AppError::Internal(_) => (StatusCode::INTERNAL_SERVER_ERROR, None),
        };

        if status.is_server_error() {
            warn!("Request failed: {self}");
        }

        let error_response = ErrorResponse {
            error: self.to_string(),
            details,
        };

        (status, Json(error_response)).into_response()
    }
}

/// Files and text fields read from one multipart request
#[derive(Debug, Default)]
pub struct FormUpload {
    pub files: Vec<UploadedFile>,
    pub fields: HashMap<String, String>,
}

impl FormUpload {
    pub fn field(&self, name: &str) -> Option<&str> {
        self.fields.get(name).map(String::as_str)
    }
}

/// Outcome of [`extract_and_validate`]
#[derive(Debug)]
pub struct FileIntake {
    pub file: Option<UploadedFile>,
    pub validation: Result<(), ValidationError>,
    pub fields: HashMap<String, String>,
}

/// Stream every file part named `file_field` into `storage_dir`
///
/// Other parts are collected as text fields. Page counts are filled in for
/// PDF uploads that `lopdf` can read.
pub async fn extract_uploads(
    multipart: &mut Multipart,
    file_field: &str,
    storage_dir: &FsPath,
) -> Result<FormUpload, ExtractionError> {
    let mut upload = FormUpload::default();

    while let Some(mut field) = multipart
        .next_field()
        .await
        .map_err(|e| ExtractionError::MalformedFormData(e.to_string()))?
    {
        let name = field.name().unwrap_or_default().to_string();

        if name != file_field {
            let text = field
                .text()
                .await
                .map_err(|e| ExtractionError::MalformedFormData(e.to_string()))?;
            upload.fields.insert(name, text);
            continue;
        }

        let file_name = sanitize_file_name(field.file_name().unwrap_or("upload"));
        let content_type = field.content_type().map(str::to_string);
        let path = storage_dir.join(format!("{}-{file_name}", Uuid::new_v4().simple()));

        let mut out = tokio::fs::File::create(&path).await?;
        let mut size_bytes = 0u64;
        while let Some(chunk) = field
            .chunk()
            .await
            .map_err(|e| ExtractionError::MalformedFormData(e.to_string()))?
        {
            size_bytes += chunk.len() as u64;
            out.write_all(&chunk).await?;
        }
        out.flush().await?;

        let mut file = UploadedFile::new(file_name, size_bytes, path);
        if let Some(content_type) = content_type {
            file = file.with_content_type(content_type);
        }
        if file.is_pdf() {
            if let Some(pages) = page_count(file.file_ref.as_path()).await {
                file = file.with_page_count(pages);
            }
        }

        debug!(file = %file.name, size = size_bytes, pages = ?file.page_count, "Stored upload");
        upload.files.push(file);
    }

    Ok(upload)
}

/// Read the upload in `field_name` and run it through the validator `choose` picks
///
/// `choose` sees the text fields, which may follow the file in the form. A
/// missing, oversize or mistyped file is an expected outcome reported in
/// [`FileIntake::validation`]; only a broken request or a refused form field
/// is an error.
pub async fn extract_and_validate<F>(
    multipart: &mut Multipart,
    field_name: &str,
    storage_dir: &FsPath,
    choose: F,
) -> Result<FileIntake, AppError>
where
    F: FnOnce(&FormUpload) -> Result<FileValidator, AppError>,
{
    let upload = extract_uploads(multipart, field_name, storage_dir).await?;
    let validator = choose(&upload)?;
    let file = upload.files.into_iter().next();
    let validation = validator.validate(file.as_ref());

    Ok(FileIntake {
        file,
        validation,
        fields: upload.fields,
    })
}

async fn page_count(path: &FsPath) -> Option<u32> {
    let bytes = tokio::fs::read(path).await.ok()?;
    tokio::task::spawn_blocking(move || count_pdf_pages(&bytes))
        .await
        .ok()
        .flatten()
}

/// Keep the final path component and drop anything that is not portable
fn sanitize_file_name(name: &str) -> String {
    let base = name.rsplit(['/', '\\']).next().unwrap_or_default();
    let cleaned: String = base
        .chars()
        .map(|c| if c.is_control() { '_' } else { c })
        .collect();
    let cleaned = cleaned.trim().trim_start_matches('.').to_string();
    if cleaned.is_empty() {
        "upload".to_string()
    } else {
        cleaned
    }
}

/// A batch run the server is tracking, with the directory holding its uploads
#[derive(Clone)]
pub struct BatchRecord {
    pub handle: BatchRunHandle,
    storage: Arc<TempDir>,
}

impl BatchRecord {
    pub fn storage_dir(&self) -> &FsPath {
        self.storage.path()
    }
}

pub type Registry = Arc<RwLock<HashMap<Uuid, BatchRecord>>>;

/// Shared handler state
pub struct AppState<E> {
    processor: Arc<BatchProcessor<E>>,
    runs: Registry,
    config: Arc<ServerConfig>,
}

impl<E> Clone for AppState<E> {
    fn clone(&self) -> Self {
        Self {
            processor: Arc::clone(&self.processor),
            runs: Arc::clone(&self.runs),
            config: Arc::clone(&self.config),
        }
    }
}

impl<E: OperationEngine> AppState<E> {
    pub fn new(engine: E, config: ServerConfig) -> Self {
        let processor = BatchProcessor::new(engine, config.batch_options());
        Self {
            processor: Arc::new(processor),
            runs: Registry::default(),
            config: Arc::new(config),
        }
    }

    pub fn runs(&self) -> Registry {
        Arc::clone(&self.runs)
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    fn new_storage(&self) -> Result<TempDir, AppError> {
        std::fs::create_dir_all(&self.config.storage_dir)
            .and_then(|_| {
                tempfile::Builder::new()
                    .prefix("batch-")
                    .tempdir_in(&self.config.storage_dir)
            })
            .map_err(|e| AppError::Extraction(ExtractionError::Storage(e)))
    }

    async fn record(&self, id: Uuid) -> Result<BatchRecord, AppError> {
        self.runs
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or(AppError::NotFound(id))
    }

    async fn register(&self, submission: &Submission, storage: Arc<TempDir>) {
        let record = BatchRecord {
            handle: submission.handle.clone(),
            storage,
        };
        self.runs.write().await.insert(record.handle.id(), record);
    }
}

/// Build the application router with all routes configured
pub fn app<E: OperationEngine>(state: AppState<E>) -> Router {
    let body_limit = state.config.max_request_bytes;

    Router::new()
        .route("/api/health", get(health_check))
        .route("/api/validate", post(validate_upload::<E>))
        // Batch runs
        .route("/api/batch", post(submit_batch::<E>))
        .route("/api/batch/{id}", get(batch_status::<E>))
        .route("/api/batch/{id}/cancel", post(cancel_batch::<E>))
        .route("/api/batch/{id}/retry", post(retry_batch::<E>))
        .route("/api/batch/{id}/bundle", get(download_bundle::<E>))
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Health check endpoint for monitoring and load balancing
pub async fn health_check() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "service": "batchpdf API",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

/// Accepted upload as reported back to the client
#[derive(Debug, Serialize)]
pub struct FileInfo {
    pub name: String,
    pub size_bytes: u64,
    pub size_formatted: String,
    pub page_count: Option<u32>,
}

impl From<&UploadedFile> for FileInfo {
    fn from(file: &UploadedFile) -> Self {
        Self {
            name: file.name.clone(),
            size_bytes: file.size_bytes,
            size_formatted: format_file_size(file.size_bytes),
            page_count: file.page_count,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ValidateResponse {
    pub valid: bool,
    pub file: FileInfo,
}

/// Check a single upload against the intake rules without starting a batch
///
/// An optional `operation` field selects that operation's accepted types.
pub async fn validate_upload<E: OperationEngine>(
    State(state): State<AppState<E>>,
    mut multipart: Multipart,
) -> Result<Json<ValidateResponse>, AppError> {
    let scratch = state.new_storage()?;
    let constraint = state.config.size_constraint();

    let intake = extract_and_validate(&mut multipart, FILE_FIELD, scratch.path(), |upload| {
        match upload.field("operation") {
            Some(raw) => raw
                .parse::<OperationKind>()
                .map(|kind| FileValidator::for_operation(kind, constraint))
                .map_err(|e| AppError::BadRequest(e.to_string())),
            None => Ok(FileValidator::new(constraint)),
        }
    })
    .await?;

    intake.validation?;
    let file = intake.file.ok_or(ValidationError::NoFileProvided)?;

    Ok(Json(ValidateResponse {
        valid: true,
        file: FileInfo::from(&file),
    }))
}

#[derive(Debug, Serialize)]
pub struct JobSummary {
    pub id: Uuid,
    pub file_name: String,
    pub state: JobState,
}

#[derive(Debug, Serialize)]
pub struct RejectionResponse {
    pub file_name: String,
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<SizeDetails>,
}

impl From<&RejectedFile> for RejectionResponse {
    fn from(rejected: &RejectedFile) -> Self {
        let details = match &rejected.reason {
            IntakeRejection::Validation(e) => e.size_details(),
            _ => None,
        };
        Self {
            file_name: rejected.file.name.clone(),
            error: rejected.reason.to_string(),
            details,
        }
    }
}

/// Response for a started batch run
#[derive(Debug, Serialize)]
pub struct BatchSubmittedResponse {
    pub batch_id: Uuid,
    pub operation: OperationKind,
    pub scheduling: SchedulingPolicy,
    pub jobs: Vec<JobSummary>,
    pub rejected: Vec<RejectionResponse>,
}

impl From<&Submission> for BatchSubmittedResponse {
    fn from(submission: &Submission) -> Self {
        let handle = &submission.handle;
        Self {
            batch_id: handle.id(),
            operation: handle.operation(),
            scheduling: handle.scheduling(),
            jobs: handle
                .jobs()
                .iter()
                .map(|job| JobSummary {
                    id: job.id,
                    file_name: job.file.name.clone(),
                    state: job.state(),
                })
                .collect(),
            rejected: submission.rejected.iter().map(RejectionResponse::from).collect(),
        }
    }
}

/// Start a batch run
///
/// Multipart fields: `files` (one part per file), `parameters` (JSON
/// operation parameters) and an optional `scheduling`
/// (`parallel` or `sequential`).
pub async fn submit_batch<E: OperationEngine>(
    State(state): State<AppState<E>>,
    mut multipart: Multipart,
) -> Result<(StatusCode, Json<BatchSubmittedResponse>), AppError> {
    let storage = state.new_storage()?;
    let upload = extract_uploads(&mut multipart, FILES_FIELD, storage.path()).await?;

    let parameters: OperationParameters = match upload.field("parameters") {
        Some(raw) => serde_json::from_str(raw)
            .map_err(|e| AppError::BadRequest(format!("Invalid parameters: {e}")))?,
        None => return Err(AppError::BadRequest("Missing parameters field".to_string())),
    };
    let scheduling = match upload.field("scheduling") {
        Some(raw) => serde_json::from_value(serde_json::Value::String(raw.trim().to_string()))
            .map_err(|_| AppError::BadRequest(format!("Unknown scheduling policy: {raw}")))?,
        None => state.processor.options().scheduling,
    };

    if upload.files.is_empty() {
        return Err(ValidationError::NoFileProvided.into());
    }

    let mut submission = state
        .processor
        .submit_batch(upload.files, parameters, scheduling)?;

    if submission.handle.jobs().is_empty() {
        // Nothing runnable: report the first rejection as the request's error
        if let Some(first) = submission.rejected.drain(..).next() {
            return Err(first.reason.into());
        }
    }

    state.register(&submission, Arc::new(storage)).await;
    info!(
        batch = %submission.handle.id(),
        jobs = submission.handle.jobs().len(),
        rejected = submission.rejected.len(),
        "Batch accepted"
    );

    Ok((
        StatusCode::ACCEPTED,
        Json(BatchSubmittedResponse::from(&submission)),
    ))
}

#[derive(Debug, Serialize)]
pub struct ProgressResponse {
    pub total: usize,
    pub queued: usize,
    pub uploading: usize,
    pub processing: usize,
    pub completed: usize,
    pub failed: usize,
    pub overall_progress: f64,
}

/// Snapshot of a batch run
#[derive(Debug, Serialize)]
pub struct BatchStatusResponse {
    pub batch_id: Uuid,
    pub operation: OperationKind,
    pub scheduling: SchedulingPolicy,
    pub created_at: DateTime<Utc>,
    pub terminal: bool,
    pub cancelled: bool,
    pub progress: ProgressResponse,
    pub statistics: BatchStatistics,
    pub jobs: Vec<Job>,
}

impl From<&BatchRunHandle> for BatchStatusResponse {
    fn from(handle: &BatchRunHandle) -> Self {
        let info = handle.progress();
        Self {
            batch_id: handle.id(),
            operation: handle.operation(),
            scheduling: handle.scheduling(),
            created_at: handle.created_at(),
            terminal: info.is_complete(),
            cancelled: handle.is_cancelled(),
            progress: ProgressResponse {
                total: info.total,
                queued: info.queued,
                uploading: info.uploading,
                processing: info.processing,
                completed: info.completed,
                failed: info.failed,
                overall_progress: info.overall_progress(),
            },
            statistics: handle.statistics(),
            jobs: handle.jobs(),
        }
    }
}

pub async fn batch_status<E: OperationEngine>(
    State(state): State<AppState<E>>,
    Path(id): Path<Uuid>,
) -> Result<Json<BatchStatusResponse>, AppError> {
    let record = state.record(id).await?;
    Ok(Json(BatchStatusResponse::from(&record.handle)))
}

#[derive(Debug, Serialize)]
pub struct CancelResponse {
    pub batch_id: Uuid,
    pub cancelled_jobs: usize,
}

pub async fn cancel_batch<E: OperationEngine>(
    State(state): State<AppState<E>>,
    Path(id): Path<Uuid>,
) -> Result<Json<CancelResponse>, AppError> {
    let record = state.record(id).await?;
    let cancelled_jobs = record.handle.cancel();

    Ok(Json(CancelResponse {
        batch_id: id,
        cancelled_jobs,
    }))
}

/// Start a new run over the files whose jobs failed
pub async fn retry_batch<E: OperationEngine>(
    State(state): State<AppState<E>>,
    Path(id): Path<Uuid>,
) -> Result<(StatusCode, Json<BatchSubmittedResponse>), AppError> {
    let record = state.record(id).await?;
    let handle = &record.handle;

    if !handle.is_terminal() {
        return Err(AppError::Conflict(format!("Batch {id} is still running")));
    }
    if !handle.has_failures() {
        return Err(AppError::Conflict(format!("Batch {id} has no failed jobs")));
    }

    let submission = state
        .processor
        .resubmit_failed(handle, handle.scheduling())?;
    state.register(&submission, Arc::clone(&record.storage)).await;

    Ok((
        StatusCode::ACCEPTED,
        Json(BatchSubmittedResponse::from(&submission)),
    ))
}

/// Download the completed outputs as a zip
///
/// The `X-Batch-Warnings` header is set when some jobs failed and are
/// missing from the archive.
pub async fn download_bundle<E: OperationEngine>(
    State(state): State<AppState<E>>,
    Path(id): Path<Uuid>,
) -> Result<Response, AppError> {
    let record = state.record(id).await?;
    let packager = ZipPackager::new(record.storage_dir());

    let (manifest, bundle) = record.handle.package(&packager).await?;
    let bytes = tokio::fs::read(bundle.as_path())
        .await
        .map_err(|e| AppError::Internal(format!("Failed to read bundle: {e}")))?;

    let mut response = (
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, "application/zip".to_string()),
            (
                header::CONTENT_DISPOSITION,
                format!("attachment; filename=\"batch-{id}.zip\""),
            ),
        ],
        bytes,
    )
        .into_response();

    if manifest.has_warnings {
        let warning = format!("{} job(s) failed and are not included", manifest.failed_count);
        if let Ok(value) = warning.parse() {
            response.headers_mut().insert("x-batch-warnings", value);
        }
    }

    Ok(response)
}

/// Remove runs older than `retention`, cancelling any still running
///
/// Upload directories are deleted once no remaining run refers to them.
pub async fn sweep_expired(runs: &Registry, retention: std::time::Duration) -> usize {
    let now = Utc::now();
    let expired: Vec<BatchRecord> = {
        let mut runs = runs.write().await;
        let ids: Vec<Uuid> = runs
            .iter()
            .filter(|(_, record)| {
                (now - record.handle.created_at())
                    .to_std()
                    .map(|age| age >= retention)
                    .unwrap_or(false)
            })
            .map(|(id, _)| *id)
            .collect();
        ids.iter().filter_map(|id| runs.remove(id)).collect()
    };

    for record in &expired {
        if !record.handle.is_terminal() {
            record.handle.cancel();
        }
        for entry in record.handle.bundle().entries {
            if let Err(e) = tokio::fs::remove_file(entry.output_ref.as_path()).await {
                debug!(output = %entry.output_ref, "Could not remove output: {e}");
            }
        }
        info!(batch = %record.handle.id(), "Expired batch removed");
    }

    expired.len()
}

/// Run [`sweep_expired`] every `interval`
pub fn spawn_retention_sweeper(
    runs: Registry,
    retention: std::time::Duration,
    interval: std::time::Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            let removed = sweep_expired(&runs, retention).await;
            if removed > 0 {
                debug!(removed, "Retention sweep finished");
            }
        }
    })
}

