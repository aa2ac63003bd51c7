//! Storage root layout and public URL mapping.
//!
//! Final assets live under the storage root:
//! - `<root>/<username>/posts/<mediaId>.<ext>`
//! - `<root>/<contextUsername>/profiles/<username>.<ext>`
//!
//! and are exposed at `<public_prefix>/<same relative path>`.

use std::path::{Path, PathBuf};

use url::Url;

use crate::error::{ModelError, ModelResult};
use crate::media::MediaId;

/// Longest extension accepted from a source URL.
const MAX_EXTENSION_LEN: usize = 5;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageLayout {
    root: PathBuf,
    public_prefix: String,
}

impl StorageLayout {
    pub fn new(root: impl Into<PathBuf>, public_prefix: impl Into<String>) -> Self {
        let prefix = public_prefix.into();
        let trimmed = prefix.trim_end_matches('/');
        let public_prefix = if trimmed.starts_with('/') {
            trimmed.to_string()
        } else {
            format!("/{}", trimmed)
        };
        Self {
            root: root.into(),
            public_prefix,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn public_prefix(&self) -> &str {
        &self.public_prefix
    }

    /// Relative path of a post media asset.
    pub fn media_relative(&self, username: &str, media_id: &MediaId, ext: &str) -> ModelResult<String> {
        validate_path_segment(username)?;
        validate_path_segment(media_id.as_str())?;
        validate_path_segment(ext)?;
        Ok(format!("{}/posts/{}.{}", username, media_id, ext))
    }

    /// Relative path of a profile image stored under a context account.
    pub fn profile_relative(&self, context_username: &str, username: &str, ext: &str) -> ModelResult<String> {
        validate_path_segment(context_username)?;
        validate_path_segment(username)?;
        validate_path_segment(ext)?;
        Ok(format!("{}/profiles/{}.{}", context_username, username, ext))
    }

    pub fn absolute(&self, relative: &str) -> PathBuf {
        self.root.join(relative)
    }

    pub fn public_url(&self, relative: &str) -> String {
        format!("{}/{}", self.public_prefix, relative.trim_start_matches('/'))
    }
}

/// Reject segments that could escape their directory.
pub fn validate_path_segment(segment: &str) -> ModelResult<()> {
    let invalid = segment.is_empty()
        || segment == "."
        || segment == ".."
        || segment.contains('/')
        || segment.contains('\\')
        || segment.contains('\0');
    if invalid {
        return Err(ModelError::invalid_path_segment(segment));
    }
    Ok(())
}

/// File extension of the URL path, lowercased, or `fallback`.
///
/// Query strings and fragments are ignored. Extensions that are not short
/// alphanumeric strings fall back.
pub fn extension_from_url(source: &str, fallback: &str) -> String {
    let path = match Url::parse(source) {
        Ok(url) => url.path().to_string(),
        Err(_) => source
            .split(['?', '#'])
            .next()
            .unwrap_or_default()
            .to_string(),
    };

    let file_name = path.rsplit('/').next().unwrap_or_default();
    match file_name.rsplit_once('.') {
        Some((stem, ext))
            if !stem.is_empty()
                && !ext.is_empty()
                && ext.len() <= MAX_EXTENSION_LEN
                && ext.chars().all(|c| c.is_ascii_alphanumeric()) =>
        {
            ext.to_ascii_lowercase()
        }
        _ => fallback.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn layout() -> StorageLayout {
        StorageLayout::new("/srv/storage", "/content/")
    }

    #[test]
    fn test_media_paths() {
        let layout = layout();
        let rel = layout
            .media_relative("alice", &MediaId::from("m1"), "mp4")
            .unwrap();
        assert_eq!(rel, "alice/posts/m1.mp4");
        assert_eq!(layout.absolute(&rel), PathBuf::from("/srv/storage/alice/posts/m1.mp4"));
        assert_eq!(layout.public_url(&rel), "/content/alice/posts/m1.mp4");
    }

    #[test]
    fn test_profile_paths() {
        let layout = StorageLayout::new("/srv/storage", "content");
        let rel = layout.profile_relative("ctx", "x", "jpg").unwrap();
        assert_eq!(rel, "ctx/profiles/x.jpg");
        assert_eq!(layout.public_url(&rel), "/content/ctx/profiles/x.jpg");
    }

    #[test]
    fn test_rejects_traversal() {
        let layout = layout();
        assert!(layout.media_relative("..", &MediaId::from("m1"), "mp4").is_err());
        assert!(layout.profile_relative("ctx", "a/b", "jpg").is_err());
        assert!(validate_path_segment("").is_err());
    }

    #[test]
    fn test_extension_from_url() {
        assert_eq!(extension_from_url("https://cdn/v/abc.MP4?sig=1", "bin"), "mp4");
        assert_eq!(extension_from_url("https://cdn/v/abc", "mp4"), "mp4");
        assert_eq!(extension_from_url("https://cdn/v/abc.jpg#frag", "x"), "jpg");
        assert_eq!(extension_from_url("https://cdn/v/abc.toolongext", "jpg"), "jpg");
        assert_eq!(extension_from_url("/local/file.webp", "jpg"), "webp");
    }
}
