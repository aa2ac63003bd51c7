//! Worker metrics.

use std::net::SocketAddr;
use std::time::Duration;

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;

use mvault_queue::QueueCounts;

use crate::error::{WorkerError, WorkerResult};

pub mod names {
    /// Finished jobs by kind and outcome.
    pub const JOBS_TOTAL: &str = "mvault_jobs_total";

    /// Job wall time in seconds by kind.
    pub const JOB_DURATION_SECONDS: &str = "mvault_job_duration_seconds";

    /// Stage wall time in seconds by stage.
    pub const STAGE_DURATION_SECONDS: &str = "mvault_stage_duration_seconds";

    /// Stages skipped by their guard.
    pub const STAGE_SKIPPED_TOTAL: &str = "mvault_stage_skipped_total";

    /// Bytes fetched from remote sources.
    pub const DOWNLOAD_BYTES_TOTAL: &str = "mvault_download_bytes_total";

    /// Transcription calls by mode (single or chunk).
    pub const TRANSCRIPTION_REQUESTS_TOTAL: &str = "mvault_transcription_requests_total";

    /// Queue depth by job state.
    pub const QUEUE_JOBS: &str = "mvault_queue_jobs";
}

/// How a job ended from the worker's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobOutcome {
    Completed,
    Retrying,
    Failed,
    DeadLettered,
    /// Ownership moved to another worker; the outcome was discarded.
    Superseded,
}

impl JobOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobOutcome::Completed => "completed",
            JobOutcome::Retrying => "retrying",
            JobOutcome::Failed => "failed",
            JobOutcome::DeadLettered => "dead_lettered",
            JobOutcome::Superseded => "superseded",
        }
    }
}

pub fn record_job(kind: &str, outcome: JobOutcome, elapsed: Duration) {
    counter!(
        names::JOBS_TOTAL,
        "kind" => kind.to_string(),
        "outcome" => outcome.as_str()
    )
    .increment(1);

    histogram!(
        names::JOB_DURATION_SECONDS,
        "kind" => kind.to_string()
    )
    .record(elapsed.as_secs_f64());
}

pub fn record_stage(stage: &str, skipped: bool, elapsed: Duration) {
    if skipped {
        counter!(names::STAGE_SKIPPED_TOTAL, "stage" => stage.to_string()).increment(1);
    }
    histogram!(
        names::STAGE_DURATION_SECONDS,
        "stage" => stage.to_string()
    )
    .record(elapsed.as_secs_f64());
}

pub fn record_download(bytes: u64) {
    counter!(names::DOWNLOAD_BYTES_TOTAL).increment(bytes);
}

pub fn record_transcription(mode: &'static str) {
    counter!(names::TRANSCRIPTION_REQUESTS_TOTAL, "mode" => mode).increment(1);
}

pub fn record_queue_counts(counts: &QueueCounts) {
    for (state, value) in [
        ("waiting", counts.waiting),
        ("active", counts.active),
        ("delayed", counts.delayed),
        ("failed", counts.failed),
    ] {
        gauge!(names::QUEUE_JOBS, "state" => state).set(value as f64);
    }
}

/// Serve Prometheus metrics on `addr`.
pub fn install_exporter(addr: &str) -> WorkerResult<()> {
    let addr: SocketAddr = addr
        .parse()
        .map_err(|e| WorkerError::config_error(format!("invalid METRICS_ADDR {}: {}", addr, e)))?;
    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .map_err(|e| WorkerError::config_error(format!("failed to install metrics exporter: {}", e)))
}
