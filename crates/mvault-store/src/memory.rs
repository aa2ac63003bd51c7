//! In-memory entity store.
//!
//! Backs local runs (`STORE_BACKEND=memory`) and the pipeline tests. All
//! check-then-write sequences run under one lock, so concurrent callers see
//! the same create-if-absent and local-wins outcomes as the Firestore store.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use tracing::debug;

use mvault_models::{
    decide_storage_url, Account, Media, MediaId, MediaType, NewTranscript, Post, PostId,
    StorageUrlDecision, Transcript, TranscriptOwner,
};

use crate::error::{StoreError, StoreResult};
use crate::repo::{AccountRepo, MediaRepo, PostRepo, TranscriptRepo, TranscriptSave};

#[derive(Default)]
struct State {
    media: HashMap<MediaId, Media>,
    /// Keyed by [`TranscriptOwner::document_id`]
    transcripts: HashMap<String, Transcript>,
    accounts: HashMap<String, Account>,
    posts: Vec<Post>,
}

impl State {
    fn find_transcript(&self, owner: &TranscriptOwner) -> Option<Transcript> {
        if let Some(found) = self.transcripts.get(&owner.document_id()) {
            return Some(found.clone());
        }
        match owner {
            TranscriptOwner::Media { post_id, .. } => self
                .transcripts
                .get(&TranscriptOwner::Post(post_id.clone()).document_id())
                .cloned(),
            TranscriptOwner::Post(_) => None,
        }
    }
}

/// Entity store held in process memory.
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<State>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn insert_media(&self, media: Media) {
        self.lock().media.insert(media.id.clone(), media);
    }

    pub fn insert_account(&self, account: Account) {
        self.lock().accounts.insert(account.username.clone(), account);
    }

    /// Insert or replace a post by id.
    pub fn insert_post(&self, post: Post) {
        let mut state = self.lock();
        state.posts.retain(|p| p.id != post.id);
        state.posts.push(post);
    }

    pub fn post(&self, id: &PostId) -> Option<Post> {
        self.lock().posts.iter().find(|p| &p.id == id).cloned()
    }

    pub fn transcript_count(&self) -> usize {
        self.lock().transcripts.len()
    }
}

#[async_trait]
impl MediaRepo for MemoryStore {
    async fn get(&self, id: &MediaId) -> StoreResult<Option<Media>> {
        Ok(self.lock().media.get(id).cloned())
    }

    async fn set_storage_url(&self, id: &MediaId, url: &str) -> StoreResult<StorageUrlDecision> {
        let mut state = self.lock();
        let media = state
            .media
            .get_mut(id)
            .ok_or_else(|| StoreError::not_found(format!("media/{}", id)))?;

        let decision = decide_storage_url(&media.storage_url, url);
        if decision == StorageUrlDecision::Replace {
            media.storage_url = url.to_string();
        }
        Ok(decision)
    }

    async fn register_remote(
        &self,
        post_id: &PostId,
        index: u32,
        media_type: MediaType,
        url: &str,
    ) -> StoreResult<Media> {
        let mut state = self.lock();
        let existing = state
            .media
            .values_mut()
            .find(|m| &m.post_id == post_id && m.index == index);

        if let Some(media) = existing {
            if decide_storage_url(&media.storage_url, url) == StorageUrlDecision::Replace {
                media.storage_url = url.to_string();
            }
            media.media_type = media_type;
            return Ok(media.clone());
        }

        let media = Media::new(post_id.clone(), media_type, url, index);
        debug!(media_id = %media.id, post_id = %post_id, index, "Registered media");
        state.media.insert(media.id.clone(), media.clone());
        Ok(media)
    }
}

#[async_trait]
impl TranscriptRepo for MemoryStore {
    async fn find_by_owner(&self, owner: &TranscriptOwner) -> StoreResult<Option<Transcript>> {
        Ok(self.lock().find_transcript(owner))
    }

    async fn create_if_absent(&self, transcript: NewTranscript) -> StoreResult<TranscriptSave> {
        let mut state = self.lock();
        if let Some(existing) = state.find_transcript(&transcript.owner) {
            return Ok(TranscriptSave::Existing(existing));
        }
        let record = transcript.into_transcript();
        state.transcripts.insert(record.id.clone(), record.clone());
        Ok(TranscriptSave::Created(record))
    }
}

#[async_trait]
impl AccountRepo for MemoryStore {
    async fn get(&self, username: &str) -> StoreResult<Option<Account>> {
        Ok(self.lock().accounts.get(username).cloned())
    }

    async fn set_profile_image(&self, username: &str, url: &str) -> StoreResult<()> {
        let mut state = self.lock();
        let account = state
            .accounts
            .entry(username.to_string())
            .or_insert_with(|| Account::new(username));
        account.profile_image_url = Some(url.to_string());
        Ok(())
    }
}

#[async_trait]
impl PostRepo for MemoryStore {
    async fn list_by_username(&self, username: &str) -> StoreResult<Vec<Post>> {
        Ok(self
            .lock()
            .posts
            .iter()
            .filter(|p| p.username == username)
            .cloned()
            .collect())
    }

    async fn patch_collaborator_pic(
        &self,
        post_id: &PostId,
        collaborator: &str,
        url: &str,
    ) -> StoreResult<bool> {
        let mut state = self.lock();
        let post = state
            .posts
            .iter_mut()
            .find(|p| &p.id == post_id)
            .ok_or_else(|| StoreError::not_found(format!("posts/{}", post_id)))?;
        Ok(post.patch_collaborator_pic(collaborator, url))
    }
}
