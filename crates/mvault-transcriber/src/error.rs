//! Transcription error types.

use std::path::PathBuf;
use thiserror::Error;

pub type TranscribeResult<T> = Result<T, TranscribeError>;

#[derive(Debug, Error)]
pub enum TranscribeError {
    #[error("Audio file {path} is {size} bytes, limit is {limit}")]
    FileTooLarge { path: PathBuf, size: u64, limit: u64 },

    #[error("Transcription service rate limited the request")]
    RateLimited,

    #[error("Transcription service returned {status}: {message}")]
    Api { status: u16, message: String },

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error("Missing configuration: {0}")]
    MissingConfig(&'static str),

    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl TranscribeError {
    pub fn is_retryable(&self) -> bool {
        match self {
            TranscribeError::RateLimited | TranscribeError::Network(_) => true,
            TranscribeError::Api { status, .. } => *status >= 500,
            _ => false,
        }
    }
}
