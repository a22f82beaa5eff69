//! Error kinds shared by every stage of the pipeline.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    /// A path escaped the vault root or matched an exclusion rule.
    #[error("path rejected: {path} ({reason})")]
    PathRejected { path: String, reason: String },

    /// A vault, embedding, or vector-store backend could not be reached.
    #[error("backend unavailable: {0}")]
    BackendUnavailable(String),

    /// A PDF or markdown source could not be turned into text.
    #[error("extraction failed: {0}")]
    ExtractionFailed(String),

    #[error("invalid configuration: {0}")]
    ConfigInvalid(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    pub fn path_rejected(path: impl Into<String>, reason: impl Into<String>) -> Self {
        Error::PathRejected {
            path: path.into(),
            reason: reason.into(),
        }
    }

    pub fn is_path_rejected(&self) -> bool {
        matches!(self, Error::PathRejected { .. })
    }
}

pub type Result<T> = std::result::Result<T, Error>;
