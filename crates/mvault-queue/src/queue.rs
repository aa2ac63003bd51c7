//! Queue abstraction and configuration.

use std::time::Duration;

use async_trait::async_trait;

use mvault_models::{BackoffKind, BackoffPolicy, JobId, JobOptions};

use crate::error::QueueResult;
use crate::job::{Delivery, FailOutcome, JobEnvelope, QueueCounts, QueueJob};

/// Queue configuration.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Redis URL
    pub redis_url: String,
    /// Key prefix for all queue structures
    pub prefix: String,
    /// Options applied when a producer does not supply its own
    pub default_options: JobOptions,
    /// How long completed job records are kept
    pub completed_ttl: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            redis_url: "redis://localhost:6379".to_string(),
            prefix: "mvault".to_string(),
            default_options: JobOptions::default(),
            completed_ttl: Duration::from_secs(86400),
        }
    }
}

impl QueueConfig {
    /// Create config from environment variables.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let backoff_kind = match std::env::var("QUEUE_BACKOFF_TYPE").ok().as_deref() {
            Some("fixed") => BackoffKind::Fixed,
            _ => BackoffKind::Exponential,
        };
        let backoff_delay = std::env::var("QUEUE_BACKOFF_DELAY_MS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(defaults.default_options.backoff.delay_ms);
        let attempts = std::env::var("QUEUE_DEFAULT_ATTEMPTS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(defaults.default_options.attempts);

        Self {
            redis_url: std::env::var("REDIS_URL").unwrap_or(defaults.redis_url),
            prefix: std::env::var("QUEUE_PREFIX").unwrap_or(defaults.prefix),
            default_options: JobOptions::new(
                attempts,
                BackoffPolicy {
                    kind: backoff_kind,
                    delay_ms: backoff_delay,
                },
            ),
            completed_ttl: Duration::from_secs(
                std::env::var("QUEUE_COMPLETED_TTL_SECS")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(86400),
            ),
        }
    }
}

/// At-least-once job queue.
///
/// A consumed job stays owned by its consumer until it is acked, failed or
/// dead-lettered. Deliveries that go without a heartbeat become claimable by
/// other consumers through [`JobQueue::claim_stalled`]; after that, settling
/// the superseded copy fails with `DeliveryLost` and changes nothing.
#[async_trait]
pub trait JobQueue: Send + Sync {
    /// Submit a job. Returns its id.
    async fn enqueue(&self, job: QueueJob, options: JobOptions) -> QueueResult<JobId>;

    /// Take up to `count` waiting jobs, blocking up to `block` when none are ready.
    async fn consume(&self, consumer: &str, block: Duration, count: usize) -> QueueResult<Vec<Delivery>>;

    /// Mark a delivery as completed.
    async fn ack(&self, delivery: &Delivery) -> QueueResult<()>;

    /// Record a failed attempt. The job is either scheduled for retry with
    /// backoff or parked in the failed set once attempts are exhausted.
    async fn fail(&self, delivery: &Delivery, error: &str) -> QueueResult<FailOutcome>;

    /// Park a delivery in the failed set without further retries.
    async fn dead_letter(&self, delivery: &Delivery, error: &str) -> QueueResult<()>;

    /// Take over deliveries left unsettled for at least `min_idle`.
    async fn claim_stalled(
        &self,
        consumer: &str,
        min_idle: Duration,
        count: usize,
    ) -> QueueResult<Vec<Delivery>>;

    /// Reset the idle clock of a running delivery so it is not claimed as
    /// stalled. Returns false once another consumer has taken it over.
    async fn heartbeat(&self, delivery: &Delivery) -> QueueResult<bool>;

    /// Move retries whose backoff has elapsed back to waiting.
    async fn promote_delayed(&self) -> QueueResult<usize>;

    /// Look up a job record.
    async fn get(&self, job_id: &JobId) -> QueueResult<Option<JobEnvelope>>;

    /// Failed jobs, most recent first.
    async fn list_failed(&self, limit: usize) -> QueueResult<Vec<JobEnvelope>>;

    /// Re-submit one failed job with a fresh attempt budget.
    async fn retry(&self, job_id: &JobId) -> QueueResult<()>;

    /// Re-submit every failed job. Returns how many were re-submitted.
    async fn retry_all_failed(&self) -> QueueResult<usize>;

    async fn counts(&self) -> QueueResult<QueueCounts>;
}
