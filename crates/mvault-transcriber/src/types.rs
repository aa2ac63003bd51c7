//! Transcriber capability and result type.

use std::path::Path;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::TranscribeResult;

/// Largest audio upload the service accepts (25 MiB).
pub const MAX_UPLOAD_BYTES: u64 = 25 * 1024 * 1024;

/// Text plus the service's raw response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranscriptionResult {
    pub text: String,
    pub raw: serde_json::Value,
}

/// Converts an audio file to text.
///
/// Implementations reject inputs above their upload limit instead of
/// sending them; callers split large audio first.
#[async_trait]
pub trait Transcriber: Send + Sync {
    async fn transcribe(&self, audio: &Path) -> TranscribeResult<TranscriptionResult>;

    /// Largest input accepted by [`Transcriber::transcribe`].
    fn max_upload_bytes(&self) -> u64 {
        MAX_UPLOAD_BYTES
    }
}
