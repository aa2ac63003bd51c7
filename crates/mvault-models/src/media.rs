//! Media records and the storage URL monotonicity rule.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::account::PostId;

/// Unique identifier for a media item.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(transparent)]
pub struct MediaId(pub String);

impl MediaId {
    /// Generate a new random media ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Create from an existing string.
    pub fn from_string(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    /// Get the inner string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for MediaId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for MediaId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for MediaId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Kind of media referenced by a post.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum MediaType {
    Image,
    Video,
}

impl MediaType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MediaType::Image => "image",
            MediaType::Video => "video",
        }
    }

    /// Extension used when the source URL carries none.
    pub fn default_extension(&self) -> &'static str {
        match self {
            MediaType::Image => "jpg",
            MediaType::Video => "mp4",
        }
    }

    pub fn is_video(&self) -> bool {
        matches!(self, MediaType::Video)
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "image" => Some(MediaType::Image),
            "video" => Some(MediaType::Video),
            _ => None,
        }
    }
}

impl fmt::Display for MediaType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A media item belonging to a post.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Media {
    pub id: MediaId,
    pub post_id: PostId,
    #[serde(rename = "type")]
    pub media_type: MediaType,
    /// Remote origin URL until the pipeline stores the asset locally.
    pub storage_url: String,
    /// Position within the post (carousel order).
    #[serde(default)]
    pub index: u32,
}

impl Media {
    pub fn new(
        post_id: PostId,
        media_type: MediaType,
        storage_url: impl Into<String>,
        index: u32,
    ) -> Self {
        Self {
            id: MediaId::new(),
            post_id,
            media_type,
            storage_url: storage_url.into(),
            index,
        }
    }

    pub fn is_stored_locally(&self) -> bool {
        is_local_storage_url(&self.storage_url)
    }
}

/// True if the URL points at an asset we host.
///
/// Public `/content/...` paths, absolute filesystem paths and `file://` URLs
/// are local. `http(s)://` URLs are remote.
pub fn is_local_storage_url(url: &str) -> bool {
    let url = url.trim();
    if url.is_empty() {
        return false;
    }
    url.starts_with('/') || url.starts_with("file://")
}

/// Outcome of comparing a stored URL with a candidate replacement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageUrlDecision {
    /// Write the candidate.
    Replace,
    /// Candidate equals the current value.
    Unchanged,
    /// Current value is local and the candidate is remote.
    KeepLocal,
}

/// Decide whether `candidate` may replace `current`.
///
/// A local URL is never regressed back to a remote one.
pub fn decide_storage_url(current: &str, candidate: &str) -> StorageUrlDecision {
    if current == candidate {
        return StorageUrlDecision::Unchanged;
    }
    if is_local_storage_url(current) && !is_local_storage_url(candidate) {
        return StorageUrlDecision::KeepLocal;
    }
    StorageUrlDecision::Replace
}
