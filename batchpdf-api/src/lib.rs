//! # batchpdf-api
//!
//! REST API server for batchpdf batch runs
//!

mod api;
pub mod config;
pub mod packager;

pub use api::{
    app, batch_status, cancel_batch, download_bundle, extract_and_validate, extract_uploads,
    health_check, retry_batch, spawn_retention_sweeper, submit_batch, sweep_expired,
    validate_upload, AppError, AppState, BatchRecord, BatchStatusResponse,
    BatchSubmittedResponse, ErrorResponse, ExtractionError, FileIntake, FormUpload, Registry,
    FILES_FIELD, FILE_FIELD,
};
pub use config::{ConfigError, ServerConfig};
pub use packager::{ZipPackager, MANIFEST_NAME};
