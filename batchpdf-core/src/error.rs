use crate::batch::job::TransitionError;
use crate::intake::ValidationError;
use crate::operation::ParameterError;
use crate::pages::PageSelectionError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum BatchError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("Page selection error: {0}")]
    PageSelection(#[from] PageSelectionError),

    #[error("Invalid operation parameters: {0}")]
    Parameters(#[from] ParameterError),

    #[error("Invalid job transition: {0}")]
    Transition(#[from] TransitionError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Packaging error: {0}")]
    Packaging(String),
}

pub type Result<T> = std::result::Result<T, BatchError>;
