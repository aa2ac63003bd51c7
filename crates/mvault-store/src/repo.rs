//! Narrow per-entity repository traits.
//!
//! The pipeline depends on these rather than on a concrete backend, so the
//! worker can run against Firestore in production and [`crate::MemoryStore`]
//! in tests.

use async_trait::async_trait;

use mvault_models::{
    Account, Media, MediaId, MediaType, NewTranscript, Post, PostId, StorageUrlDecision,
    Transcript, TranscriptOwner,
};

use crate::error::StoreResult;

/// Outcome of a create-if-absent transcript write.
#[derive(Debug, Clone, PartialEq)]
pub enum TranscriptSave {
    /// No transcript existed; this one was written.
    Created(Transcript),
    /// A transcript for the owner already existed and was left untouched.
    Existing(Transcript),
}

impl TranscriptSave {
    pub fn transcript(&self) -> &Transcript {
        match self {
            Self::Created(t) | Self::Existing(t) => t,
        }
    }

    pub fn created(&self) -> bool {
        matches!(self, Self::Created(_))
    }
}

#[async_trait]
pub trait MediaRepo: Send + Sync {
    async fn get(&self, id: &MediaId) -> StoreResult<Option<Media>>;

    /// Point the media at `url`, never regressing a local URL to a remote one.
    ///
    /// Missing media is an error; the pipeline only runs for registered items.
    async fn set_storage_url(&self, id: &MediaId, url: &str) -> StoreResult<StorageUrlDecision>;

    /// Create the media at `(post_id, index)` or re-match the existing one,
    /// updating its URL under the same local-wins rule.
    async fn register_remote(
        &self,
        post_id: &PostId,
        index: u32,
        media_type: MediaType,
        url: &str,
    ) -> StoreResult<Media>;
}

#[async_trait]
pub trait TranscriptRepo: Send + Sync {
    /// Transcript of the owner. Media-owned lookups fall back to a
    /// transcript recorded against the whole post.
    async fn find_by_owner(&self, owner: &TranscriptOwner) -> StoreResult<Option<Transcript>>;

    /// Write the transcript unless one already exists for its owner.
    async fn create_if_absent(&self, transcript: NewTranscript) -> StoreResult<TranscriptSave>;
}

#[async_trait]
pub trait AccountRepo: Send + Sync {
    async fn get(&self, username: &str) -> StoreResult<Option<Account>>;

    async fn set_profile_image(&self, username: &str, url: &str) -> StoreResult<()>;
}

#[async_trait]
pub trait PostRepo: Send + Sync {
    /// Posts whose context account is `username`.
    async fn list_by_username(&self, username: &str) -> StoreResult<Vec<Post>>;

    /// Set the profile picture of `collaborator` on one post.
    /// Returns false when the post does not reference that collaborator.
    async fn patch_collaborator_pic(
        &self,
        post_id: &PostId,
        collaborator: &str,
        url: &str,
    ) -> StoreResult<bool>;
}
