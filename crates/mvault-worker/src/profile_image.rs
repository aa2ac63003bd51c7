//! Collaborator/profile image processor.

use tracing::{debug, info};

use mvault_media::{move_file, remove_if_exists};
use mvault_models::{extension_from_url, MediaType, ProfileImagePayload};

use crate::context::ProcessingContext;
use crate::error::WorkerResult;
use crate::metrics::record_download;
use crate::workdir::ProfileWorkDir;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProfileImageReport {
    pub public_url: String,
    pub account_updated: bool,
    /// Posts whose collaborator entry changed.
    pub posts_patched: usize,
}

/// Runs `process-profile-image` jobs.
///
/// The image is stored under the context account's tree. The account record
/// is only touched for a self profile; posts of the context account that
/// list the user as a collaborator get the new URL either way.
pub struct CollaboratorImageProcessor<'a> {
    ctx: &'a ProcessingContext,
}

impl<'a> CollaboratorImageProcessor<'a> {
    pub fn new(ctx: &'a ProcessingContext) -> Self {
        Self { ctx }
    }

    pub async fn process(&self, payload: &ProfileImagePayload) -> WorkerResult<ProfileImageReport> {
        let ctx = self.ctx;
        let ext = extension_from_url(&payload.url, MediaType::Image.default_extension());
        let relative = ctx
            .layout
            .profile_relative(&payload.context_username, &payload.username, &ext)?;
        let dest = ctx.layout.absolute(&relative);
        let public_url = ctx.layout.public_url(&relative);

        let work = ProfileWorkDir::new(
            &ctx.config.work_dir,
            &payload.context_username,
            &payload.username,
        )?;
        work.ensure().await?;

        // Profile pictures change upstream, so the file is always refreshed.
        // The stored copy is replaced only by a complete download.
        let staging = work.staging_for(&dest);
        let fetched = match ctx.fetcher.fetch_to_file(&payload.url, &staging).await {
            Ok(bytes) => move_file(&staging, &dest).await.map(|()| bytes),
            Err(e) => Err(e),
        };
        let bytes = match fetched {
            Ok(bytes) => bytes,
            Err(e) => {
                let _ = remove_if_exists(&staging).await;
                return Err(e.into());
            }
        };
        work.remove_artifacts().await?;
        record_download(bytes);
        debug!(bytes, path = %dest.display(), "Stored profile image");

        let account_updated = payload.is_self_profile();
        if account_updated {
            ctx.accounts
                .set_profile_image(&payload.username, &public_url)
                .await?;
        }

        let posts = ctx.posts.list_by_username(&payload.context_username).await?;
        let mut posts_patched = 0;
        for post in posts
            .iter()
            .filter(|p| p.references_collaborator(&payload.username))
        {
            if ctx
                .posts
                .patch_collaborator_pic(&post.id, &payload.username, &public_url)
                .await?
            {
                posts_patched += 1;
            }
        }

        info!(
            username = %payload.username,
            context = %payload.context_username,
            account_updated,
            posts_patched,
            "Profile image processed"
        );
        Ok(ProfileImageReport {
            public_url,
            account_updated,
            posts_patched,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;
    use std::time::Duration;

    use mvault_models::{CollaboratorRef, Post};
    use mvault_store::AccountRepo;
    use tempfile::TempDir;
    use tokio::fs;

    use super::*;
    use crate::testing::{files_under, Harness};

    fn payload(username: &str, context: &str) -> ProfileImagePayload {
        ProfileImagePayload {
            username: username.to_string(),
            url: format!("https://cdn.example.com/pp/{}.webp?x=1", username),
            context_username: context.to_string(),
        }
    }

    #[tokio::test]
    async fn test_self_profile_updates_account_and_posts() {
        let tmp = TempDir::new().unwrap();
        let harness = Harness::new(tmp.path());
        let post = Post::new("alice").with_collaborator(CollaboratorRef::new("alice", "owner"));
        let post_id = post.id.clone();
        harness.store.insert_post(post);

        let report = CollaboratorImageProcessor::new(&harness.ctx)
            .process(&payload("alice", "alice"))
            .await
            .unwrap();

        assert_eq!(report.public_url, "/content/alice/profiles/alice.webp");
        assert!(report.account_updated);
        assert_eq!(report.posts_patched, 1);
        assert!(harness.ctx.layout.absolute("alice/profiles/alice.webp").exists());

        let account = AccountRepo::get(harness.store.as_ref(), "alice")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(account.profile_image_url.as_deref(), Some(report.public_url.as_str()));
        let post = harness.store.post(&post_id).unwrap();
        assert_eq!(
            post.collaborators[0].profile_pic_url.as_deref(),
            Some(report.public_url.as_str())
        );
    }

    #[tokio::test]
    async fn test_collaborator_fan_out_touches_only_matching_posts() {
        let tmp = TempDir::new().unwrap();
        let harness = Harness::new(tmp.path());

        let with_bob = Post::new("alice")
            .with_collaborator(CollaboratorRef::new("alice", "owner"))
            .with_collaborator(CollaboratorRef::new("bob", "coauthor"));
        let without_bob = Post::new("alice")
            .with_collaborator(CollaboratorRef::new("carol", "coauthor").with_profile_pic("/old.jpg"));
        let other_context = Post::new("dave").with_collaborator(CollaboratorRef::new("bob", "coauthor"));
        let (with_id, without_id, other_id) = (
            with_bob.id.clone(),
            without_bob.id.clone(),
            other_context.id.clone(),
        );
        harness.store.insert_post(with_bob);
        harness.store.insert_post(without_bob.clone());
        harness.store.insert_post(other_context.clone());

        let report = CollaboratorImageProcessor::new(&harness.ctx)
            .process(&payload("bob", "alice"))
            .await
            .unwrap();

        assert!(!report.account_updated);
        assert_eq!(report.posts_patched, 1);
        assert_eq!(report.public_url, "/content/alice/profiles/bob.webp");
        assert!(AccountRepo::get(harness.store.as_ref(), "bob").await.unwrap().is_none());

        let patched = harness.store.post(&with_id).unwrap();
        assert_eq!(patched.collaborators[0].profile_pic_url, None);
        assert_eq!(
            patched.collaborators[1].profile_pic_url.as_deref(),
            Some("/content/alice/profiles/bob.webp")
        );
        assert_eq!(harness.store.post(&without_id).unwrap(), without_bob);
        assert_eq!(harness.store.post(&other_id).unwrap(), other_context);
    }

    #[tokio::test]
    async fn test_repeat_is_a_no_op_for_posts() {
        let tmp = TempDir::new().unwrap();
        let harness = Harness::new(tmp.path());
        harness
            .store
            .insert_post(Post::new("alice").with_collaborator(CollaboratorRef::new("bob", "coauthor")));

        let processor = CollaboratorImageProcessor::new(&harness.ctx);
        processor.process(&payload("bob", "alice")).await.unwrap();
        let second = processor.process(&payload("bob", "alice")).await.unwrap();

        assert_eq!(second.posts_patched, 0);
        assert_eq!(harness.fetcher.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_interrupted_download_keeps_previous_image() {
        let tmp = TempDir::new().unwrap();
        let harness = Harness::new(tmp.path());
        let processor = CollaboratorImageProcessor::new(&harness.ctx);
        processor.process(&payload("bob", "alice")).await.unwrap();
        let stored = harness.ctx.layout.absolute("alice/profiles/bob.webp");
        assert_eq!(fs::read(&stored).await.unwrap(), b"remote-bytes");

        harness.fetcher.stall.store(true, Ordering::SeqCst);
        let interrupted = tokio::time::timeout(
            Duration::from_millis(100),
            processor.process(&payload("bob", "alice")),
        )
        .await;
        assert!(interrupted.is_err());

        // Only the finished image is visible in storage
        assert_eq!(fs::read(&stored).await.unwrap(), b"remote-bytes");
        assert_eq!(files_under(&harness.ctx.config.storage_root), vec![stored.clone()]);

        harness.fetcher.stall.store(false, Ordering::SeqCst);
        processor.process(&payload("bob", "alice")).await.unwrap();
        assert_eq!(files_under(&harness.ctx.config.storage_root), vec![stored]);
        assert!(!harness.ctx.config.work_dir.join("profiles/alice/bob").exists());
    }

    #[tokio::test]
    async fn test_rejects_unsafe_names() {
        let tmp = TempDir::new().unwrap();
        let harness = Harness::new(tmp.path());

        let result = CollaboratorImageProcessor::new(&harness.ctx)
            .process(&payload("../bob", "alice"))
            .await;
        assert!(result.is_err());
        assert_eq!(harness.fetcher.calls.load(Ordering::SeqCst), 0);
    }
}
