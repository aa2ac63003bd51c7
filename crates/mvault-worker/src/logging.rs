//! Structured job logging and subscriber setup.

use tracing::{error, info, warn, Span};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use mvault_models::{JobId, JobKind};

use crate::error::{WorkerError, WorkerResult};

/// Job logger for structured lifecycle events.
///
/// Every event carries the job id and kind so a job can be followed across
/// redeliveries.
#[derive(Debug, Clone)]
pub struct JobLogger {
    job_id: String,
    kind: String,
}

impl JobLogger {
    pub fn new(job_id: &JobId, kind: JobKind) -> Self {
        Self {
            job_id: job_id.to_string(),
            kind: kind.as_str().to_string(),
        }
    }

    pub fn log_start(&self, subject: &str, attempt: u32) {
        info!(
            job_id = %self.job_id,
            kind = %self.kind,
            attempt,
            "Job started: {}", subject
        );
    }

    pub fn log_progress(&self, message: &str) {
        info!(
            job_id = %self.job_id,
            kind = %self.kind,
            "Job progress: {}", message
        );
    }

    pub fn log_warning(&self, message: &str) {
        warn!(
            job_id = %self.job_id,
            kind = %self.kind,
            "Job warning: {}", message
        );
    }

    pub fn log_error(&self, message: &str) {
        error!(
            job_id = %self.job_id,
            kind = %self.kind,
            "Job error: {}", message
        );
    }

    pub fn log_completion(&self, message: &str) {
        info!(
            job_id = %self.job_id,
            kind = %self.kind,
            "Job completed: {}", message
        );
    }

    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    pub fn kind(&self) -> &str {
        &self.kind
    }

    /// Span wrapping everything a job does, including stage logs.
    pub fn create_span(&self) -> Span {
        tracing::info_span!(
            "job",
            job_id = %self.job_id,
            kind = %self.kind
        )
    }
}

/// Install the global subscriber.
///
/// `LOG_FORMAT=json` selects JSON lines; anything else gets ANSI output.
/// `RUST_LOG` is honoured on top of `default_directive`.
pub fn init_tracing(default_directive: &str) -> WorkerResult<()> {
    let use_json = std::env::var("LOG_FORMAT")
        .map(|v| v.to_lowercase() == "json")
        .unwrap_or(false);

    let directive = default_directive
        .parse()
        .map_err(|e| WorkerError::config_error(format!("invalid log directive: {}", e)))?;
    let env_filter = EnvFilter::from_default_env().add_directive(directive);

    let result = if use_json {
        tracing_subscriber::registry()
            .with(fmt::layer().json())
            .with(env_filter)
            .try_init()
    } else {
        tracing_subscriber::registry()
            .with(
                fmt::layer()
                    .with_ansi(true)
                    .with_target(true)
                    .with_thread_ids(false)
                    .with_file(false)
                    .with_line_number(false),
            )
            .with(env_filter)
            .try_init()
    };
    result.map_err(|e| WorkerError::config_error(format!("failed to install subscriber: {}", e)))
}
