//! Model validation errors.

use thiserror::Error;

pub type ModelResult<T> = Result<T, ModelError>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ModelError {
    #[error("Invalid path segment: {0:?}")]
    InvalidPathSegment(String),

    #[error("Unknown job kind: {0}")]
    UnknownJobKind(String),
}

impl ModelError {
    pub fn invalid_path_segment(segment: impl Into<String>) -> Self {
        Self::InvalidPathSegment(segment.into())
    }
}
