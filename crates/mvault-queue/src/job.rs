//! Job types for the queue.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use mvault_models::{JobId, JobKind, JobOptions, JobStatus, ProcessMediaPayload, ProfileImagePayload};

use crate::error::{QueueError, QueueResult};

/// Typed job as submitted by producers and executed by the worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "payload", rename_all = "kebab-case")]
pub enum QueueJob {
    /// Legacy kind name for the media pipeline
    TranscribeMedia(ProcessMediaPayload),
    /// Download, transcribe, optimize and persist a post media item
    ProcessMedia(ProcessMediaPayload),
    /// Store a profile image and fan it out to posts
    ProcessProfileImage(ProfileImagePayload),
}

impl QueueJob {
    pub fn kind(&self) -> JobKind {
        match self {
            QueueJob::TranscribeMedia(_) => JobKind::TranscribeMedia,
            QueueJob::ProcessMedia(_) => JobKind::ProcessMedia,
            QueueJob::ProcessProfileImage(_) => JobKind::ProcessProfileImage,
        }
    }

    /// Short human-readable subject for logs.
    pub fn subject(&self) -> String {
        match self {
            QueueJob::TranscribeMedia(p) | QueueJob::ProcessMedia(p) => {
                format!("media:{}", p.media_id)
            }
            QueueJob::ProcessProfileImage(p) => {
                format!("profile:{}:{}", p.context_username, p.username)
            }
        }
    }

    fn payload_value(&self) -> QueueResult<serde_json::Value> {
        let value = match self {
            QueueJob::TranscribeMedia(p) | QueueJob::ProcessMedia(p) => serde_json::to_value(p)?,
            QueueJob::ProcessProfileImage(p) => serde_json::to_value(p)?,
        };
        Ok(value)
    }
}

/// Stored job record.
///
/// The payload is kept as raw JSON so a malformed submission can still be
/// parked in the failed set with its original content.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobEnvelope {
    pub id: JobId,
    pub kind: JobKind,
    pub payload: serde_json::Value,
    pub options: JobOptions,
    #[serde(default)]
    pub attempts_made: u32,
    pub status: JobStatus,
    pub enqueued_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

impl JobEnvelope {
    pub fn new(job: &QueueJob, options: JobOptions) -> QueueResult<Self> {
        Ok(Self {
            id: JobId::new(),
            kind: job.kind(),
            payload: job.payload_value()?,
            options,
            attempts_made: 0,
            status: JobStatus::Waiting,
            enqueued_at: Utc::now(),
            last_error: None,
            finished_at: None,
        })
    }

    /// Decode the typed job.
    pub fn decode(&self) -> QueueResult<QueueJob> {
        let tagged = serde_json::json!({
            "kind": self.kind,
            "payload": self.payload,
        });
        serde_json::from_value(tagged)
            .map_err(|e| QueueError::malformed(format!("{} job {}: {}", self.kind, self.id, e)))
    }

    /// Attempt number of the current delivery (1-based).
    pub fn current_attempt(&self) -> u32 {
        self.attempts_made + 1
    }

    /// Record a failed attempt and decide what happens next.
    pub fn record_failure(&mut self, error: &str) -> FailOutcome {
        self.attempts_made += 1;
        self.last_error = Some(error.to_string());
        if self.attempts_made < self.options.attempts {
            self.status = JobStatus::Delayed;
            FailOutcome::Retrying {
                attempt: self.attempts_made,
                delay: self.options.backoff.delay_for_attempt(self.attempts_made),
            }
        } else {
            self.status = JobStatus::Failed;
            self.finished_at = Some(Utc::now());
            FailOutcome::Failed {
                attempts: self.attempts_made,
            }
        }
    }

    /// Park the job without consuming the remaining attempts.
    pub fn mark_dead(&mut self, error: &str) {
        self.attempts_made += 1;
        self.last_error = Some(error.to_string());
        self.status = JobStatus::Failed;
        self.finished_at = Some(Utc::now());
    }

    /// Reset a failed job for manual re-submission.
    pub fn reset_for_retry(&mut self) {
        self.attempts_made = 0;
        self.status = JobStatus::Waiting;
        self.finished_at = None;
    }
}

/// A job handed to a consumer.
///
/// `receipt` identifies this delivery to the backend (a stream entry id for
/// Redis) and must be passed back to ack or fail it. Settling only succeeds
/// while `consumer` still owns the delivery; once another consumer claims
/// it, the original copy is rejected with [`QueueError::DeliveryLost`].
#[derive(Debug, Clone)]
pub struct Delivery {
    pub envelope: JobEnvelope,
    pub receipt: String,
    pub consumer: String,
}

impl Delivery {
    pub fn job_id(&self) -> &JobId {
        &self.envelope.id
    }

    pub fn kind(&self) -> JobKind {
        self.envelope.kind
    }
}

/// What the queue did with a failed delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailOutcome {
    /// Scheduled for another attempt after `delay`.
    Retrying { attempt: u32, delay: Duration },
    /// Attempts exhausted; parked in the failed set.
    Failed { attempts: u32 },
}

/// Number of jobs per state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueCounts {
    pub waiting: u64,
    pub active: u64,
    pub delayed: u64,
    pub completed: u64,
    pub failed: u64,
}
