//! Speech transcripts.

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::account::PostId;
use crate::media::MediaId;

/// Entity a transcript belongs to.
///
/// A transcript is keyed by its owner so the store can enforce at most one
/// transcript per media item (or per post when no media id is known).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TranscriptOwner {
    Media { post_id: PostId, media_id: MediaId },
    Post(PostId),
}

impl TranscriptOwner {
    pub fn post_id(&self) -> &PostId {
        match self {
            TranscriptOwner::Media { post_id, .. } => post_id,
            TranscriptOwner::Post(post_id) => post_id,
        }
    }

    pub fn media_id(&self) -> Option<&MediaId> {
        match self {
            TranscriptOwner::Media { media_id, .. } => Some(media_id),
            TranscriptOwner::Post(_) => None,
        }
    }

    /// Deterministic record id derived from the owner.
    pub fn document_id(&self) -> String {
        match self {
            TranscriptOwner::Media { media_id, .. } => format!("media_{}", media_id),
            TranscriptOwner::Post(post_id) => format!("post_{}", post_id),
        }
    }
}

/// A stored transcript.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Transcript {
    pub id: String,
    pub post_id: PostId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media_id: Option<MediaId>,
    pub text: String,
    /// Text before any manual edit.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original_text: Option<String>,
    /// Raw response(s) from the transcription service.
    #[serde(default)]
    pub raw_api_result: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

impl Transcript {
    pub fn owner(&self) -> TranscriptOwner {
        match &self.media_id {
            Some(media_id) => TranscriptOwner::Media {
                post_id: self.post_id.clone(),
                media_id: media_id.clone(),
            },
            None => TranscriptOwner::Post(self.post_id.clone()),
        }
    }
}

/// Input for creating a transcript.
#[derive(Debug, Clone, PartialEq)]
pub struct NewTranscript {
    pub owner: TranscriptOwner,
    pub text: String,
    pub raw_api_result: serde_json::Value,
}

impl NewTranscript {
    pub fn new(owner: TranscriptOwner, text: impl Into<String>, raw: serde_json::Value) -> Self {
        Self {
            owner,
            text: text.into(),
            raw_api_result: raw,
        }
    }

    /// Materialize the record as it will be stored.
    pub fn into_transcript(self) -> Transcript {
        let id = self.owner.document_id();
        let text = self.text.trim().to_string();
        Transcript {
            id,
            post_id: self.owner.post_id().clone(),
            media_id: self.owner.media_id().cloned(),
            original_text: Some(text.clone()),
            text,
            raw_api_result: self.raw_api_result,
            created_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_document_id_is_owner_derived() {
        let owner = TranscriptOwner::Media {
            post_id: PostId::from("p1"),
            media_id: MediaId::from("m1"),
        };
        assert_eq!(owner.document_id(), "media_m1");
        assert_eq!(TranscriptOwner::Post(PostId::from("p1")).document_id(), "post_p1");
    }

    #[test]
    fn test_into_transcript_trims_text() {
        let owner = TranscriptOwner::Post(PostId::from("p1"));
        let transcript =
            NewTranscript::new(owner.clone(), "  hello world ", serde_json::json!({})).into_transcript();
        assert_eq!(transcript.text, "hello world");
        assert_eq!(transcript.owner(), owner);
    }
}
