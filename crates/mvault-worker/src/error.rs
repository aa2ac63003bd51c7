//! Worker error types.

use thiserror::Error;

use crate::pipeline::{PipelineState, Stage};

pub type WorkerResult<T> = Result<T, WorkerError>;

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("Job failed: {0}")]
    JobFailed(String),

    #[error("{stage} stage failed after {reached}: {source}")]
    StageFailed {
        stage: Stage,
        reached: PipelineState,
        #[source]
        source: Box<WorkerError>,
    },

    #[error("Job timed out after {0} seconds")]
    Timeout(u64),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Invalid job: {0}")]
    InvalidJob(String),

    #[error("Media error: {0}")]
    Media(#[from] mvault_media::MediaError),

    #[error("Transcription error: {0}")]
    Transcribe(#[from] mvault_transcriber::TranscribeError),

    #[error("Store error: {0}")]
    Store(#[from] mvault_store::StoreError),

    #[error("Queue error: {0}")]
    Queue(#[from] mvault_queue::QueueError),

    #[error("Model error: {0}")]
    Model(#[from] mvault_models::ModelError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl WorkerError {
    pub fn job_failed(msg: impl Into<String>) -> Self {
        Self::JobFailed(msg.into())
    }

    pub fn config_error(msg: impl Into<String>) -> Self {
        Self::ConfigError(msg.into())
    }

    pub fn invalid_job(msg: impl Into<String>) -> Self {
        Self::InvalidJob(msg.into())
    }

    pub fn stage_failed(stage: Stage, reached: PipelineState, source: WorkerError) -> Self {
        Self::StageFailed {
            stage,
            reached,
            source: Box::new(source),
        }
    }

    /// Whether another attempt could succeed.
    ///
    /// Failed jobs are retried by the queue regardless; this only feeds logs
    /// so operators can spot poison jobs early.
    pub fn is_retryable(&self) -> bool {
        match self {
            WorkerError::StageFailed { source, .. } => source.is_retryable(),
            WorkerError::Media(e) => e.is_retryable(),
            WorkerError::Transcribe(e) => e.is_retryable(),
            WorkerError::Store(e) => e.is_retryable(),
            WorkerError::Queue(e) => e.is_retryable(),
            WorkerError::Timeout(_) | WorkerError::Io(_) | WorkerError::JobFailed(_) => true,
            WorkerError::ConfigError(_)
            | WorkerError::InvalidJob(_)
            | WorkerError::Model(_)
            | WorkerError::Json(_) => false,
        }
    }
}
