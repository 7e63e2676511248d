//! Operation types and their typed parameters
//!
//! Each operation carries its own parameter variant. Options are checked
//! against fixed tables at intake ([`OperationParameters::validate`]) and page
//! parameters are resolved per document ([`OperationParameters::resolve`]),
//! so engines only ever receive well-formed requests.

use crate::pages::{self, PageSelectionError, ResolvedPages};
use lazy_static::lazy_static;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

lazy_static! {
    /// Recognition languages offered by the OCR tool, keyed by engine code
    static ref OCR_LANGUAGES: BTreeMap<&'static str, &'static str> = BTreeMap::from([
        ("ara", "Arabic"),
        ("chi_sim", "Chinese (Simplified)"),
        ("deu", "German"),
        ("eng", "English"),
        ("fra", "French"),
        ("hin", "Hindi"),
        ("ita", "Italian"),
        ("jpn", "Japanese"),
        ("kor", "Korean"),
        ("nld", "Dutch"),
        ("por", "Portuguese"),
        ("rus", "Russian"),
        ("spa", "Spanish"),
    ]);
}

const PDF_TYPES: &[&str] = &[".pdf", "application/pdf"];
const COMPRESSIBLE_TYPES: &[&str] = &[
    ".pdf",
    "application/pdf",
    ".jpg",
    ".jpeg",
    "image/jpeg",
    ".png",
    "image/png",
];

/// Operation parameters rejected against the options table
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ParameterError {
    #[error("Invalid value for {field}: {value} (expected {expected})")]
    InvalidValue {
        field: &'static str,
        value: String,
        expected: String,
    },

    #[error("Invalid rotation angle: {0} (must be 90, 180, or 270)")]
    InvalidRotation(i32),

    #[error("Unknown operation: {0}")]
    UnknownOperation(String),
}

/// Kind of operation applied to every file of a batch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    Compress,
    Split,
    Rotate,
    Watermark,
    PageNumbers,
    Ocr,
}

impl OperationKind {
    pub const ALL: [OperationKind; 6] = [
        OperationKind::Compress,
        OperationKind::Split,
        OperationKind::Rotate,
        OperationKind::Watermark,
        OperationKind::PageNumbers,
        OperationKind::Ocr,
    ];

    /// Stable identifier used on the wire and when invoking engines
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationKind::Compress => "compress",
            OperationKind::Split => "split",
            OperationKind::Rotate => "rotate",
            OperationKind::Watermark => "watermark",
            OperationKind::PageNumbers => "page_numbers",
            OperationKind::Ocr => "ocr",
        }
    }

    /// Extensions and MIME types admitted at intake
    pub fn accepted_types(&self) -> &'static [&'static str] {
        match self {
            OperationKind::Compress => COMPRESSIBLE_TYPES,
            _ => PDF_TYPES,
        }
    }

    /// Whether the operation needs the document's page count
    pub fn targets_pages(&self) -> bool {
        matches!(
            self,
            OperationKind::Split
                | OperationKind::Rotate
                | OperationKind::Watermark
                | OperationKind::PageNumbers
        )
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OperationKind::Compress => write!(f, "Compress"),
            OperationKind::Split => write!(f, "Split"),
            OperationKind::Rotate => write!(f, "Rotate"),
            OperationKind::Watermark => write!(f, "Watermark"),
            OperationKind::PageNumbers => write!(f, "Page numbers"),
            OperationKind::Ocr => write!(f, "OCR"),
        }
    }
}

impl FromStr for OperationKind {
    type Err = ParameterError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase().replace('-', "_");
        OperationKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == normalized)
            .ok_or_else(|| ParameterError::UnknownOperation(s.to_string()))
    }
}

/// Compression quality tier
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompressionQuality {
    Low,
    #[default]
    Medium,
    High,
}

/// Rotation angle, clockwise
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "i32", into = "i32")]
pub enum RotationAngle {
    Clockwise90,
    Rotate180,
    Clockwise270,
}

impl RotationAngle {
    /// Create from degrees; multiples of 360 are not a rotation and are refused
    pub fn from_degrees(degrees: i32) -> Result<Self, ParameterError> {
        match degrees.rem_euclid(360) {
            90 => Ok(RotationAngle::Clockwise90),
            180 => Ok(RotationAngle::Rotate180),
            270 => Ok(RotationAngle::Clockwise270),
            _ => Err(ParameterError::InvalidRotation(degrees)),
        }
    }

    pub fn to_degrees(self) -> i32 {
        match self {
            RotationAngle::Clockwise90 => 90,
            RotationAngle::Rotate180 => 180,
            RotationAngle::Clockwise270 => 270,
        }
    }
}

impl TryFrom<i32> for RotationAngle {
    type Error = ParameterError;

    fn try_from(degrees: i32) -> Result<Self, Self::Error> {
        RotationAngle::from_degrees(degrees)
    }
}

impl From<RotationAngle> for i32 {
    fn from(angle: RotationAngle) -> Self {
        angle.to_degrees()
    }
}

/// Anchor for stamped content (watermarks, page numbers)
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Position {
    TopLeft,
    TopCenter,
    TopRight,
    MiddleLeft,
    #[default]
    Center,
    MiddleRight,
    BottomLeft,
    BottomCenter,
    BottomRight,
}

/// Page number rendering style
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NumberFormat {
    #[default]
    Numeric,
    Roman,
    Alphabetic,
}

/// How a split divides each document
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SplitMode {
    /// Extract the selected pages into one document
    Extract(String),
    /// One document per `N` consecutive pages
    Every(u32),
}

fn all_pages() -> String {
    "all".to_string()
}

fn default_watermark_opacity() -> u8 {
    30
}

fn default_watermark_rotation() -> i32 {
    45
}

fn default_font_size() -> u32 {
    48
}

fn default_number_position() -> Position {
    Position::BottomCenter
}

fn default_start_number() -> u32 {
    1
}

fn default_language() -> String {
    "eng".to_string()
}

/// Parameters of one operation, shared by every file of a batch
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "operation", rename_all = "snake_case")]
pub enum OperationParameters {
    Compress {
        #[serde(default)]
        quality: CompressionQuality,
    },

    Split {
        mode: SplitMode,
    },

    Rotate {
        angle: RotationAngle,
        #[serde(default = "all_pages")]
        pages: String,
    },

    Watermark {
        text: String,
        #[serde(default)]
        position: Position,
        #[serde(default = "default_watermark_opacity")]
        opacity: u8,
        #[serde(default = "default_watermark_rotation")]
        rotation: i32,
        #[serde(default = "default_font_size")]
        font_size: u32,
        #[serde(default = "all_pages")]
        pages: String,
    },

    PageNumbers {
        #[serde(default)]
        format: NumberFormat,
        #[serde(default = "default_number_position")]
        position: Position,
        #[serde(default = "default_start_number")]
        start_number: u32,
        #[serde(default)]
        pages: String,
        #[serde(default)]
        skip_first_page: bool,
        #[serde(default)]
        prefix: String,
        #[serde(default)]
        suffix: String,
    },

    Ocr {
        #[serde(default = "default_language")]
        language: String,
        #[serde(default)]
        enhance_scanned: bool,
        #[serde(default)]
        preserve_layout: bool,
    },
}

impl OperationParameters {
    pub fn kind(&self) -> OperationKind {
        match self {
            OperationParameters::Compress { .. } => OperationKind::Compress,
            OperationParameters::Split { .. } => OperationKind::Split,
            OperationParameters::Rotate { .. } => OperationKind::Rotate,
            OperationParameters::Watermark { .. } => OperationKind::Watermark,
            OperationParameters::PageNumbers { .. } => OperationKind::PageNumbers,
            OperationParameters::Ocr { .. } => OperationKind::Ocr,
        }
    }

    /// Check option values against the supported ranges and tables
    pub fn validate(&self) -> Result<(), ParameterError> {
        match self {
            OperationParameters::Compress { .. } | OperationParameters::Rotate { .. } => Ok(()),

            OperationParameters::Split { mode } => match mode {
                SplitMode::Every(0) => Err(ParameterError::InvalidValue {
                    field: "every",
                    value: "0".to_string(),
                    expected: "at least 1 page per file".to_string(),
                }),
                _ => Ok(()),
            },

            OperationParameters::Watermark {
                text,
                opacity,
                rotation,
                font_size,
                ..
            } => {
                if text.trim().is_empty() {
                    return Err(ParameterError::InvalidValue {
                        field: "text",
                        value: String::new(),
                        expected: "non-empty watermark text".to_string(),
                    });
                }
                check_range("opacity", i64::from(*opacity), 0, 100)?;
                check_range("rotation", i64::from(*rotation), -360, 360)?;
                check_range("font_size", i64::from(*font_size), 1, 500)
            }

            OperationParameters::PageNumbers { start_number, .. } => {
                check_range("start_number", i64::from(*start_number), 1, i64::from(u32::MAX))
            }

            OperationParameters::Ocr { language, .. } => {
                if OCR_LANGUAGES.contains_key(language.as_str()) {
                    Ok(())
                } else {
                    Err(ParameterError::InvalidValue {
                        field: "language",
                        value: language.clone(),
                        expected: format!(
                            "one of {}",
                            supported_ocr_languages().collect::<Vec<_>>().join(", ")
                        ),
                    })
                }
            }
        }
    }

    /// Resolve page parameters against a document with `page_count` pages
    ///
    /// Returns `Ok(None)` for operations that act on the whole file.
    pub fn resolve(&self, page_count: u32) -> Result<Option<ResolvedPages>, PageSelectionError> {
        let resolved = match self {
            OperationParameters::Compress { .. } | OperationParameters::Ocr { .. } => {
                return Ok(None)
            }

            OperationParameters::Split { mode } => match mode {
                SplitMode::Extract(expr) => ResolvedPages::Selection {
                    pages: pages::parse_selection(expr, page_count)?,
                },
                SplitMode::Every(group_size) => ResolvedPages::Partition {
                    groups: pages::parse_partition(page_count, *group_size)?,
                },
            },

            OperationParameters::Rotate { pages, .. }
            | OperationParameters::Watermark { pages, .. } => ResolvedPages::Selection {
                pages: pages::parse_selection(pages, page_count)?,
            },

            OperationParameters::PageNumbers {
                pages,
                skip_first_page,
                ..
            } => {
                let mut selection = pages::parse_selection(pages, page_count)?;
                if *skip_first_page {
                    selection = selection.skip_first_page()?;
                }
                ResolvedPages::Selection { pages: selection }
            }
        };

        Ok(Some(resolved))
    }
}

fn check_range(field: &'static str, value: i64, min: i64, max: i64) -> Result<(), ParameterError> {
    if (min..=max).contains(&value) {
        Ok(())
    } else {
        Err(ParameterError::InvalidValue {
            field,
            value: value.to_string(),
            expected: format!("{min}..={max}"),
        })
    }
}

/// Language codes accepted by the OCR operation
pub fn supported_ocr_languages() -> impl Iterator<Item = &'static str> {
    OCR_LANGUAGES.keys().copied()
}

/// Fully resolved request handed to an engine for one file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationRequest {
    pub parameters: OperationParameters,
    /// Resolved pages, absent for whole-file operations
    pub pages: Option<ResolvedPages>,
}

impl OperationRequest {
    pub fn kind(&self) -> OperationKind {
        self.parameters.kind()
    }
}
