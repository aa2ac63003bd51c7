//! Error types for media operations.

use std::path::PathBuf;
use thiserror::Error;

/// Result type for media operations.
pub type MediaResult<T> = Result<T, MediaError>;

/// Errors that can occur during fetching and transcoding.
#[derive(Debug, Error)]
pub enum MediaError {
    #[error("FFmpeg not found in PATH")]
    FfmpegNotFound,

    #[error("FFprobe not found in PATH")]
    FfprobeNotFound,

    #[error("FFmpeg command failed: {message}")]
    FfmpegFailed {
        message: String,
        stderr: Option<String>,
        exit_code: Option<i32>,
    },

    #[error("FFprobe command failed: {message}")]
    FfprobeFailed {
        message: String,
        stderr: Option<String>,
    },

    #[error("Fetch failed for {url}: {message}")]
    FetchFailed { url: String, message: String },

    #[error("Fetch of {url} returned HTTP {status}")]
    HttpStatus { url: String, status: u16 },

    #[error("Unsupported URL: {0}")]
    UnsupportedUrl(String),

    #[error("File not found: {0}")]
    FileNotFound(PathBuf),

    #[error("Output is empty: {0}")]
    EmptyOutput(PathBuf),

    #[error("Operation timed out after {0} seconds")]
    Timeout(u64),

    #[error("Resource limit exceeded: {0}")]
    ResourceLimit(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON parse error: {0}")]
    JsonParse(#[from] serde_json::Error),
}

impl MediaError {
    /// Create an FFmpeg failure error.
    pub fn ffmpeg_failed(
        message: impl Into<String>,
        stderr: Option<String>,
        exit_code: Option<i32>,
    ) -> Self {
        Self::FfmpegFailed {
            message: message.into(),
            stderr,
            exit_code,
        }
    }

    /// Create a fetch failure error.
    pub fn fetch_failed(url: impl Into<String>, message: impl Into<String>) -> Self {
        Self::FetchFailed {
            url: url.into(),
            message: message.into(),
        }
    }

    /// Whether another attempt could succeed.
    ///
    /// Missing binaries and unsupported inputs are permanent; transport,
    /// server-side and process failures are not.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::FfmpegNotFound | Self::FfprobeNotFound | Self::UnsupportedUrl(_) => false,
            Self::HttpStatus { status, .. } => *status == 429 || *status >= 500,
            _ => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(!MediaError::FfmpegNotFound.is_retryable());
        assert!(MediaError::HttpStatus {
            url: "u".into(),
            status: 503
        }
        .is_retryable());
        assert!(!MediaError::HttpStatus {
            url: "u".into(),
            status: 404
        }
        .is_retryable());
        assert!(MediaError::Timeout(10).is_retryable());
    }
}
