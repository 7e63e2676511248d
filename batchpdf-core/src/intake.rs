//! File intake validation
//!
//! Every uploaded file passes through a [`FileValidator`] exactly once before
//! it can become a batch job. Validation is a pure function of the file's
//! metadata and the injected [`SizeConstraint`]; it never touches storage.
//!
//! Checks run in a fixed order: presence, size, then type. A file exactly at
//! the configured maximum is accepted.
//!
//! # Example
//!
//! ```rust
//! use batchpdf::intake::{FileValidator, SizeConstraint, UploadedFile, ValidationError};
//!
//! let validator = FileValidator::new(SizeConstraint::new(1024));
//! let file = UploadedFile::new("report.pdf", 2048, "/tmp/report.pdf");
//!
//! match validator.validate(Some(&file)) {
//!     Err(ValidationError::FileTooLarge { provided_size, max_size }) => {
//!         assert_eq!(provided_size, 2048);
//!         assert_eq!(max_size, 1024);
//!     }
//!     other => panic!("unexpected: {other:?}"),
//! }
//! ```

use crate::operation::OperationKind;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use thiserror::Error;
use uuid::Uuid;

/// Default per-file upload limit (50 MiB)
pub const DEFAULT_MAX_FILE_SIZE: u64 = 52_428_800;

/// Upper bound on the size of a single uploaded file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SizeConstraint {
    /// Largest accepted size in bytes (inclusive)
    pub max_bytes: u64,
}

impl Default for SizeConstraint {
    fn default() -> Self {
        Self {
            max_bytes: DEFAULT_MAX_FILE_SIZE,
        }
    }
}

impl SizeConstraint {
    pub fn new(max_bytes: u64) -> Self {
        Self { max_bytes }
    }

    /// Whether a file of `size_bytes` fits under this constraint
    pub fn admits(&self, size_bytes: u64) -> bool {
        size_bytes <= self.max_bytes
    }
}

/// Opaque reference to a stored file, handed to engines and packagers
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FileRef(String);

impl FileRef {
    pub fn new(reference: impl Into<String>) -> Self {
        Self(reference.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Interpret the reference as a local filesystem path
    pub fn as_path(&self) -> &Path {
        Path::new(&self.0)
    }
}

impl fmt::Display for FileRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<PathBuf> for FileRef {
    fn from(path: PathBuf) -> Self {
        Self(path.to_string_lossy().into_owned())
    }
}

impl From<&str> for FileRef {
    fn from(reference: &str) -> Self {
        Self(reference.to_string())
    }
}

/// Metadata of a file received at intake
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UploadedFile {
    pub id: Uuid,
    /// Client-supplied file name
    pub name: String,
    pub size_bytes: u64,
    /// MIME type reported by the client, if any
    pub content_type: Option<String>,
    /// Known once the document has been inspected; required by page-targeted operations
    pub page_count: Option<u32>,
    pub file_ref: FileRef,
}

impl UploadedFile {
    pub fn new(name: impl Into<String>, size_bytes: u64, file_ref: impl Into<FileRef>) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            size_bytes,
            content_type: None,
            page_count: None,
            file_ref: file_ref.into(),
        }
    }

    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }

    pub fn with_page_count(mut self, page_count: u32) -> Self {
        self.page_count = Some(page_count);
        self
    }

    /// Lower-cased extension including the leading dot (`".pdf"`)
    pub fn extension(&self) -> Option<String> {
        let dot = self.name.rfind('.')?;
        let extension = &self.name[dot..];
        if extension.len() < 2 {
            return None;
        }
        Some(extension.to_ascii_lowercase())
    }

    /// A `.pdf` name or an `application/pdf` content type
    pub fn is_pdf(&self) -> bool {
        self.extension().as_deref() == Some(".pdf")
            || self
                .content_type
                .as_deref()
                .is_some_and(|mime| mime.trim().eq_ignore_ascii_case("application/pdf"))
    }
}

/// Reasons an uploaded file is refused at intake
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("No file provided")]
    NoFileProvided,

    #[error(
        "File size {} exceeds the maximum allowed size of {}",
        size_label(.provided_size),
        size_label(.max_size)
    )]
    FileTooLarge { provided_size: u64, max_size: u64 },

    #[error("Invalid file type: {file_name}. Accepted types: {}", .accepted.join(", "))]
    UnsupportedType {
        file_name: String,
        accepted: Vec<String>,
    },
}

fn size_label(bytes: &u64) -> String {
    format_file_size(*bytes)
}

/// Size context attached to a `FileTooLarge` response
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SizeDetails {
    pub provided_size: u64,
    pub max_size: u64,
    pub provided_size_formatted: String,
    pub max_size_formatted: String,
}

impl ValidationError {
    /// Structured size details, only present for oversize files
    pub fn size_details(&self) -> Option<SizeDetails> {
        match self {
            ValidationError::FileTooLarge {
                provided_size,
                max_size,
            } => Some(SizeDetails {
                provided_size: *provided_size,
                max_size: *max_size,
                provided_size_formatted: format_file_size(*provided_size),
                max_size_formatted: format_file_size(*max_size),
            }),
            _ => None,
        }
    }
}

/// Gate applied to every uploaded file before it is admitted into a batch
#[derive(Debug, Clone)]
pub struct FileValidator {
    constraint: SizeConstraint,
    accepted_types: Vec<String>,
}

impl Default for FileValidator {
    fn default() -> Self {
        Self::new(SizeConstraint::default())
    }
}

impl FileValidator {
    /// Validator accepting PDF documents only
    pub fn new(constraint: SizeConstraint) -> Self {
        Self {
            constraint,
            accepted_types: vec![".pdf".to_string(), "application/pdf".to_string()],
        }
    }

    /// Validator using the allow-list of the given operation
    pub fn for_operation(kind: OperationKind, constraint: SizeConstraint) -> Self {
        Self::new(constraint).with_accepted_types(kind.accepted_types().iter().copied())
    }

    /// Replace the accepted extensions (`".pdf"`) and MIME types (`"application/pdf"`)
    pub fn with_accepted_types<I, S>(mut self, types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.accepted_types = types
            .into_iter()
            .map(|t| t.into().to_ascii_lowercase())
            .collect();
        self
    }

    pub fn constraint(&self) -> SizeConstraint {
        self.constraint
    }

    pub fn accepted_types(&self) -> &[String] {
        &self.accepted_types
    }

    /// Check one file against presence, size and type rules
    pub fn validate(&self, file: Option<&UploadedFile>) -> Result<(), ValidationError> {
        let file = file.ok_or(ValidationError::NoFileProvided)?;

        if !self.constraint.admits(file.size_bytes) {
            return Err(ValidationError::FileTooLarge {
                provided_size: file.size_bytes,
                max_size: self.constraint.max_bytes,
            });
        }

        if !self.type_accepted(file) {
            return Err(ValidationError::UnsupportedType {
                file_name: file.name.clone(),
                accepted: self.accepted_types.clone(),
            });
        }

        Ok(())
    }

    fn type_accepted(&self, file: &UploadedFile) -> bool {
        let extension = file.extension();
        let mime = file
            .content_type
            .as_deref()
            .map(|m| m.trim().to_ascii_lowercase());

        self.accepted_types.iter().any(|accepted| {
            if accepted.starts_with('.') {
                extension.as_deref() == Some(accepted.as_str())
            } else {
                mime.as_deref() == Some(accepted.as_str())
            }
        })
    }
}

/// Render a byte count for humans ("50 MB", "1.5 KB")
pub fn format_file_size(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["Bytes", "KB", "MB", "GB", "TB"];

    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }

    let rounded = (value * 100.0).round() / 100.0;
    format!("{rounded} {}", UNITS[unit])
}

/// Count the pages of a PDF held in memory, `None` when it cannot be parsed
pub fn count_pdf_pages(bytes: &[u8]) -> Option<u32> {
    match lopdf::Document::load_mem(bytes) {
        Ok(document) => u32::try_from(document.get_pages().len()).ok(),
        Err(e) => {
            tracing::debug!("could not read page count: {e}");
            None
        }
    }
}
