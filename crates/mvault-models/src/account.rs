//! Accounts, posts and embedded collaborator references.

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Unique identifier for a post.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(transparent)]
pub struct PostId(pub String);

impl PostId {
    /// Generate a new random post ID.
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

impl Default for PostId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for PostId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for PostId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// A scraped account.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Account {
    pub username: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub profile_image_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_scraped_at: Option<DateTime<Utc>>,
}

impl Account {
    pub fn new(username: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            profile_image_url: None,
            last_scraped_at: None,
        }
    }
}

/// Denormalized collaborator entry embedded on a post.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct CollaboratorRef {
    pub username: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub profile_pic_url: Option<String>,
    #[serde(default)]
    pub role: String,
}

impl CollaboratorRef {
    pub fn new(username: impl Into<String>, role: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            profile_pic_url: None,
            role: role.into(),
        }
    }

    pub fn with_profile_pic(mut self, url: impl Into<String>) -> Self {
        self.profile_pic_url = Some(url.into());
        self
    }
}

/// A post under a context account.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Post {
    pub id: PostId,
    /// Account the post was scraped under.
    pub username: String,
    #[serde(default)]
    pub collaborators: Vec<CollaboratorRef>,
}

impl Post {
    pub fn new(username: impl Into<String>) -> Self {
        Self {
            id: PostId::new(),
            username: username.into(),
            collaborators: Vec::new(),
        }
    }

    pub fn with_collaborator(mut self, collaborator: CollaboratorRef) -> Self {
        self.collaborators.push(collaborator);
        self
    }

    pub fn references_collaborator(&self, username: &str) -> bool {
        self.collaborators.iter().any(|c| c.username == username)
    }

    /// Point every entry for `username` at `url`.
    ///
    /// Returns true if any entry changed.
    pub fn patch_collaborator_pic(&mut self, username: &str, url: &str) -> bool {
        let mut changed = false;
        for collaborator in self.collaborators.iter_mut().filter(|c| c.username == username) {
            if collaborator.profile_pic_url.as_deref() != Some(url) {
                collaborator.profile_pic_url = Some(url.to_string());
                changed = true;
            }
        }
        changed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_patch_collaborator_only_touches_matching_entries() {
        let mut post = Post::new("ctx")
            .with_collaborator(CollaboratorRef::new("x", "coauthor").with_profile_pic("https://cdn/x.jpg"))
            .with_collaborator(CollaboratorRef::new("y", "coauthor").with_profile_pic("https://cdn/y.jpg"));

        assert!(post.patch_collaborator_pic("x", "/content/ctx/profiles/x.jpg"));
        assert_eq!(
            post.collaborators[0].profile_pic_url.as_deref(),
            Some("/content/ctx/profiles/x.jpg")
        );
        assert_eq!(post.collaborators[1].profile_pic_url.as_deref(), Some("https://cdn/y.jpg"));

        // Second patch is a no-op
        assert!(!post.patch_collaborator_pic("x", "/content/ctx/profiles/x.jpg"));
    }

    #[test]
    fn test_post_serde_camel_case() {
        let post = Post::new("ctx").with_collaborator(CollaboratorRef::new("x", "owner"));
        let json = serde_json::to_value(&post).unwrap();
        assert!(json["collaborators"][0].get("profilePicUrl").is_none());
        assert_eq!(json["collaborators"][0]["role"], "owner");
    }
}
