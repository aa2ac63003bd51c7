//! Repository implementations over the Firestore REST client.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use mvault_models::{
    decide_storage_url, Account, CollaboratorRef, Media, MediaId, MediaType, NewTranscript, Post,
    PostId, StorageUrlDecision, Transcript, TranscriptOwner,
};

use crate::error::{StoreError, StoreResult};
use crate::firestore::client::FirestoreClient;
use crate::firestore::types::{Document, FromFirestoreValue, StructuredQuery, ToFirestoreValue, Value};
use crate::repo::{AccountRepo, MediaRepo, PostRepo, TranscriptRepo, TranscriptSave};

pub const MEDIA_COLLECTION: &str = "media";
pub const TRANSCRIPTS_COLLECTION: &str = "transcripts";
pub const ACCOUNTS_COLLECTION: &str = "accounts";
pub const POSTS_COLLECTION: &str = "posts";

/// Conditional writes give up after this many lost races.
const MAX_CONDITIONAL_ATTEMPTS: u32 = 5;

/// Entity store backed by Firestore.
#[derive(Clone)]
pub struct FirestoreStore {
    client: FirestoreClient,
}

impl FirestoreStore {
    pub fn new(client: FirestoreClient) -> Self {
        Self { client }
    }

    pub async fn from_env() -> StoreResult<Self> {
        Ok(Self::new(FirestoreClient::from_env().await?))
    }

    async fn get_transcript_doc(&self, owner: &TranscriptOwner) -> StoreResult<Option<Transcript>> {
        let doc_id = owner.document_id();
        self.client
            .get_document(TRANSCRIPTS_COLLECTION, &doc_id)
            .await?
            .map(|doc| document_to_transcript(&doc, &doc_id))
            .transpose()
    }
}

#[async_trait]
impl MediaRepo for FirestoreStore {
    async fn get(&self, id: &MediaId) -> StoreResult<Option<Media>> {
        self.client
            .get_document(MEDIA_COLLECTION, id.as_str())
            .await?
            .map(|doc| document_to_media(&doc, id.as_str()))
            .transpose()
    }

    async fn set_storage_url(&self, id: &MediaId, url: &str) -> StoreResult<StorageUrlDecision> {
        for attempt in 1..=MAX_CONDITIONAL_ATTEMPTS {
            let doc = self
                .client
                .get_document(MEDIA_COLLECTION, id.as_str())
                .await?
                .ok_or_else(|| StoreError::not_found(format!("{}/{}", MEDIA_COLLECTION, id)))?;
            let current: String = doc.get("storageUrl").unwrap_or_default();

            let decision = decide_storage_url(&current, url);
            if decision != StorageUrlDecision::Replace {
                return Ok(decision);
            }

            let mut fields = HashMap::new();
            fields.insert("storageUrl".to_string(), url.to_firestore_value());
            match self
                .client
                .update_document_with_precondition(
                    MEDIA_COLLECTION,
                    id.as_str(),
                    fields,
                    &["storageUrl"],
                    doc.update_time.as_deref(),
                )
                .await
            {
                Ok(_) => {
                    debug!(media_id = %id, storage_url = %url, "Updated media storage URL");
                    return Ok(decision);
                }
                Err(e) if e.is_precondition_failed() => {
                    warn!(media_id = %id, attempt, "Media changed concurrently, re-reading");
                }
                Err(e) => return Err(e),
            }
        }

        Err(StoreError::PreconditionFailed(format!(
            "{}/{}: storage URL update lost {} races",
            MEDIA_COLLECTION, id, MAX_CONDITIONAL_ATTEMPTS
        )))
    }

    async fn register_remote(
        &self,
        post_id: &PostId,
        index: u32,
        media_type: MediaType,
        url: &str,
    ) -> StoreResult<Media> {
        let query = StructuredQuery::collection(MEDIA_COLLECTION)
            .where_equal(vec![
                ("postId", post_id.as_str().to_firestore_value()),
                ("index", index.to_firestore_value()),
            ])
            .limit(1);
        let existing = self.client.run_query(query).await?;

        if let Some(doc) = existing.first() {
            let id = doc
                .id()
                .ok_or_else(|| StoreError::invalid_response("media document without a name"))?
                .to_string();
            let mut media = document_to_media(doc, &id)?;
            // Re-matched: only the URL may move, and never from local back to remote
            if self.set_storage_url(&media.id, url).await? == StorageUrlDecision::Replace {
                media.storage_url = url.to_string();
            }
            return Ok(media);
        }

        let media = Media::new(post_id.clone(), media_type, url, index);
        self.client
            .create_document(MEDIA_COLLECTION, media.id.as_str(), media_to_fields(&media))
            .await?;
        info!(media_id = %media.id, post_id = %post_id, index, "Registered media");
        Ok(media)
    }
}

#[async_trait]
impl TranscriptRepo for FirestoreStore {
    async fn find_by_owner(&self, owner: &TranscriptOwner) -> StoreResult<Option<Transcript>> {
        if let Some(found) = self.get_transcript_doc(owner).await? {
            return Ok(Some(found));
        }
        match owner {
            TranscriptOwner::Media { post_id, .. } => {
                self.get_transcript_doc(&TranscriptOwner::Post(post_id.clone()))
                    .await
            }
            TranscriptOwner::Post(_) => Ok(None),
        }
    }

    async fn create_if_absent(&self, transcript: NewTranscript) -> StoreResult<TranscriptSave> {
        let owner = transcript.owner.clone();
        if let Some(existing) = self.find_by_owner(&owner).await? {
            return Ok(TranscriptSave::Existing(existing));
        }

        let record = transcript.into_transcript();
        match self
            .client
            .create_document(TRANSCRIPTS_COLLECTION, &record.id, transcript_to_fields(&record))
            .await
        {
            Ok(_) => {
                info!(transcript_id = %record.id, post_id = %record.post_id, "Created transcript");
                Ok(TranscriptSave::Created(record))
            }
            Err(StoreError::AlreadyExists(_)) => {
                // Lost a race with a redelivered job
                debug!(transcript_id = %record.id, "Transcript created concurrently");
                self.find_by_owner(&owner)
                    .await?
                    .map(TranscriptSave::Existing)
                    .ok_or_else(|| {
                        StoreError::invalid_response(format!(
                            "{} reported as existing but not readable",
                            record.id
                        ))
                    })
            }
            Err(e) => Err(e),
        }
    }
}

#[async_trait]
impl AccountRepo for FirestoreStore {
    async fn get(&self, username: &str) -> StoreResult<Option<Account>> {
        Ok(self
            .client
            .get_document(ACCOUNTS_COLLECTION, username)
            .await?
            .map(|doc| document_to_account(&doc, username)))
    }

    async fn set_profile_image(&self, username: &str, url: &str) -> StoreResult<()> {
        let mut fields = HashMap::new();
        fields.insert("username".to_string(), username.to_firestore_value());
        fields.insert("profileImageUrl".to_string(), url.to_firestore_value());
        self.client
            .update_document(
                ACCOUNTS_COLLECTION,
                username,
                fields,
                &["username", "profileImageUrl"],
            )
            .await?;
        debug!(username, "Updated account profile image");
        Ok(())
    }
}

#[async_trait]
impl PostRepo for FirestoreStore {
    async fn list_by_username(&self, username: &str) -> StoreResult<Vec<Post>> {
        let query = StructuredQuery::collection(POSTS_COLLECTION)
            .where_equal(vec![("username", username.to_firestore_value())]);

        let mut posts = Vec::new();
        for doc in self.client.run_query(query).await? {
            match doc.id() {
                Some(id) => posts.push(document_to_post(&doc, id)),
                None => warn!(username, "Skipping post document without a name"),
            }
        }
        Ok(posts)
    }

    async fn patch_collaborator_pic(
        &self,
        post_id: &PostId,
        collaborator: &str,
        url: &str,
    ) -> StoreResult<bool> {
        for attempt in 1..=MAX_CONDITIONAL_ATTEMPTS {
            let doc = self
                .client
                .get_document(POSTS_COLLECTION, post_id.as_str())
                .await?
                .ok_or_else(|| StoreError::not_found(format!("{}/{}", POSTS_COLLECTION, post_id)))?;

            let mut post = document_to_post(&doc, post_id.as_str());
            if !post.patch_collaborator_pic(collaborator, url) {
                return Ok(false);
            }

            let mut fields = HashMap::new();
            fields.insert("collaborators".to_string(), collaborators_to_value(&post.collaborators));
            match self
                .client
                .update_document_with_precondition(
                    POSTS_COLLECTION,
                    post_id.as_str(),
                    fields,
                    &["collaborators"],
                    doc.update_time.as_deref(),
                )
                .await
            {
                Ok(_) => return Ok(true),
                Err(e) if e.is_precondition_failed() => {
                    warn!(post_id = %post_id, attempt, "Post changed concurrently, re-reading");
                }
                Err(e) => return Err(e),
            }
        }

        Err(StoreError::PreconditionFailed(format!(
            "{}/{}: collaborator patch lost {} races",
            POSTS_COLLECTION, post_id, MAX_CONDITIONAL_ATTEMPTS
        )))
    }
}

// =============================================================================
// Field mapping
// =============================================================================

fn media_to_fields(media: &Media) -> HashMap<String, Value> {
    let mut fields = HashMap::new();
    fields.insert("postId".to_string(), media.post_id.as_str().to_firestore_value());
    fields.insert("type".to_string(), media.media_type.as_str().to_firestore_value());
    fields.insert("storageUrl".to_string(), media.storage_url.to_firestore_value());
    fields.insert("index".to_string(), media.index.to_firestore_value());
    fields
}

fn document_to_media(doc: &Document, id: &str) -> StoreResult<Media> {
    let media_type = doc
        .get::<String>("type")
        .and_then(|t| MediaType::parse(&t))
        .ok_or_else(|| StoreError::invalid_response(format!("media/{} has no valid type", id)))?;

    Ok(Media {
        id: MediaId::from_string(id),
        post_id: PostId::from_string(doc.get::<String>("postId").unwrap_or_default()),
        media_type,
        storage_url: doc.get("storageUrl").unwrap_or_default(),
        index: doc.get("index").unwrap_or(0),
    })
}

fn transcript_to_fields(transcript: &Transcript) -> HashMap<String, Value> {
    let mut fields = HashMap::new();
    fields.insert("postId".to_string(), transcript.post_id.as_str().to_firestore_value());
    fields.insert(
        "mediaId".to_string(),
        transcript.media_id.as_ref().map(|m| m.as_str()).to_firestore_value(),
    );
    fields.insert("text".to_string(), transcript.text.to_firestore_value());
    fields.insert("originalText".to_string(), transcript.original_text.to_firestore_value());
    fields.insert("rawApiResult".to_string(), transcript.raw_api_result.to_firestore_value());
    fields.insert("createdAt".to_string(), transcript.created_at.to_firestore_value());
    fields
}

fn document_to_transcript(doc: &Document, id: &str) -> StoreResult<Transcript> {
    let post_id = doc
        .get::<String>("postId")
        .ok_or_else(|| StoreError::invalid_response(format!("transcripts/{} has no postId", id)))?;

    Ok(Transcript {
        id: id.to_string(),
        post_id: PostId::from_string(post_id),
        media_id: doc.get::<String>("mediaId").map(MediaId::from_string),
        text: doc.get("text").unwrap_or_default(),
        original_text: doc.get("originalText"),
        raw_api_result: doc.get("rawApiResult").unwrap_or(serde_json::Value::Null),
        created_at: doc.get::<DateTime<Utc>>("createdAt").unwrap_or_else(Utc::now),
    })
}

fn document_to_account(doc: &Document, username: &str) -> Account {
    Account {
        username: doc.get("username").unwrap_or_else(|| username.to_string()),
        profile_image_url: doc.get("profileImageUrl"),
        last_scraped_at: doc.get("lastScrapedAt"),
    }
}

fn collaborators_to_value(collaborators: &[CollaboratorRef]) -> Value {
    Value::array(
        collaborators
            .iter()
            .map(|c| {
                let mut fields = HashMap::new();
                fields.insert("username".to_string(), c.username.to_firestore_value());
                fields.insert("profilePicUrl".to_string(), c.profile_pic_url.to_firestore_value());
                fields.insert("role".to_string(), c.role.to_firestore_value());
                Value::map(fields)
            })
            .collect(),
    )
}

fn value_to_collaborator(value: &Value) -> Option<CollaboratorRef> {
    let fields = value.as_map()?;
    let get = |key: &str| fields.get(key).and_then(String::from_firestore_value);
    Some(CollaboratorRef {
        username: get("username")?,
        profile_pic_url: get("profilePicUrl"),
        role: get("role").unwrap_or_default(),
    })
}

fn document_to_post(doc: &Document, id: &str) -> Post {
    Post {
        id: PostId::from_string(id),
        username: doc.get("username").unwrap_or_default(),
        collaborators: doc
            .field("collaborators")
            .and_then(Value::as_array)
            .map(|values| values.iter().filter_map(value_to_collaborator).collect())
            .unwrap_or_default(),
    }
}
