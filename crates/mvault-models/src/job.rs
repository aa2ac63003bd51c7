//! Queue job identity, kinds, payloads and retry policy.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use uuid::Uuid;

use crate::account::PostId;
use crate::error::ModelError;
use crate::media::{MediaId, MediaType};

/// Unique identifier for a queued job.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(transparent)]
pub struct JobId(pub String);

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn from_string(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for JobId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Named job kinds understood by the worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "kebab-case")]
pub enum JobKind {
    /// Legacy name for `ProcessMedia`; runs the same pipeline.
    TranscribeMedia,
    ProcessMedia,
    ProcessProfileImage,
}

impl JobKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobKind::TranscribeMedia => "transcribe-media",
            JobKind::ProcessMedia => "process-media",
            JobKind::ProcessProfileImage => "process-profile-image",
        }
    }

    pub fn is_media_pipeline(&self) -> bool {
        matches!(self, JobKind::TranscribeMedia | JobKind::ProcessMedia)
    }
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for JobKind {
    type Err = ModelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "transcribe-media" => Ok(JobKind::TranscribeMedia),
            "process-media" => Ok(JobKind::ProcessMedia),
            "process-profile-image" => Ok(JobKind::ProcessProfileImage),
            other => Err(ModelError::UnknownJobKind(other.to_string())),
        }
    }
}

/// Lifecycle status of a job as seen by the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Waiting,
    /// Scheduled for a retry after a backoff delay.
    Delayed,
    Active,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Waiting => "waiting",
            JobStatus::Delayed => "delayed",
            JobStatus::Active => "active",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum BackoffKind {
    Exponential,
    Fixed,
}

/// Retry delay policy attached to a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct BackoffPolicy {
    #[serde(rename = "type")]
    pub kind: BackoffKind,
    /// Base delay in milliseconds.
    #[serde(rename = "delay")]
    pub delay_ms: u64,
}

impl BackoffPolicy {
    pub fn exponential(delay_ms: u64) -> Self {
        Self {
            kind: BackoffKind::Exponential,
            delay_ms,
        }
    }

    pub fn fixed(delay_ms: u64) -> Self {
        Self {
            kind: BackoffKind::Fixed,
            delay_ms,
        }
    }

    /// Delay before retry number `attempt` (1-based): `delay * factor^(attempt-1)`.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(30);
        let millis = match self.kind {
            BackoffKind::Exponential => self.delay_ms.saturating_mul(1u64 << exp),
            BackoffKind::Fixed => self.delay_ms,
        };
        Duration::from_millis(millis)
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::exponential(5000)
    }
}

/// Options supplied at enqueue time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct JobOptions {
    /// Total attempts including the first.
    pub attempts: u32,
    pub backoff: BackoffPolicy,
}

impl JobOptions {
    pub fn new(attempts: u32, backoff: BackoffPolicy) -> Self {
        Self {
            attempts: attempts.max(1),
            backoff,
        }
    }
}

impl Default for JobOptions {
    fn default() -> Self {
        Self {
            attempts: 3,
            backoff: BackoffPolicy::default(),
        }
    }
}

/// Payload of `process-media` / `transcribe-media` jobs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ProcessMediaPayload {
    pub post_id: PostId,
    pub media_id: MediaId,
    /// Remote source URL.
    pub url: String,
    #[serde(rename = "type")]
    pub media_type: MediaType,
    /// Context account the post belongs to.
    pub username: String,
}

/// Payload of `process-profile-image` jobs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ProfileImagePayload {
    /// Account whose image is downloaded.
    pub username: String,
    pub url: String,
    /// Account under whose storage tree the image is kept.
    pub context_username: String,
}

impl ProfileImagePayload {
    pub fn is_self_profile(&self) -> bool {
        self.username == self.context_username
    }
}
