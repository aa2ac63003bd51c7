//! Stage executors of the media pipeline.
//!
//! Each stage starts with a guard that detects finished work from an earlier
//! attempt, and publishes its output atomically so the guard never sees a
//! half-written file.

use std::path::Path;

use serde::{Deserialize, Serialize};
use tokio::fs;
use tracing::{debug, info, warn};

use mvault_media::{
    file_size_if_present, move_file, remove_if_exists, temp_sibling, Fetcher, MediaError,
    MediaResult, Transcoder,
};
use mvault_models::{MediaType, NewTranscript, ProcessMediaPayload, StorageUrlDecision, TranscriptOwner};
use mvault_store::{MediaRepo, StoreError, TranscriptRepo};
use mvault_transcriber::Transcriber;

use crate::error::WorkerResult;
use crate::metrics::{record_download, record_transcription};
use crate::pipeline::state::StageOutcome;
use crate::workdir::MediaWorkDir;

/// Length of each audio piece when the track is too large to upload whole.
pub const CHUNK_SECONDS: u32 = 600;

/// On-disk result of the transcription stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TranscriptCache {
    pub text: String,
    pub raw_api_result: serde_json::Value,
}

impl TranscriptCache {
    /// Load the cache; an unreadable file counts as absent.
    pub async fn load(path: &Path) -> WorkerResult<Option<Self>> {
        if file_size_if_present(path).await?.is_none() {
            return Ok(None);
        }
        let bytes = fs::read(path).await?;
        match serde_json::from_slice(&bytes) {
            Ok(cache) => Ok(Some(cache)),
            Err(e) => {
                warn!(path = %path.display(), "Ignoring unreadable transcript cache: {}", e);
                Ok(None)
            }
        }
    }

    pub async fn store(&self, path: &Path) -> WorkerResult<()> {
        let tmp = temp_sibling(path);
        fs::write(&tmp, serde_json::to_vec_pretty(self)?).await?;
        if let Err(e) = fs::rename(&tmp, path).await {
            let _ = fs::remove_file(&tmp).await;
            return Err(e.into());
        }
        Ok(())
    }
}

/// Move a finished temp output into place, or discard it.
async fn publish(result: MediaResult<()>, tmp: &Path, dest: &Path) -> WorkerResult<()> {
    let published = match result {
        Ok(()) => match file_size_if_present(tmp).await? {
            Some(_) => move_file(tmp, dest).await,
            None => Err(MediaError::EmptyOutput(dest.to_path_buf())),
        },
        Err(e) => Err(e),
    };
    if published.is_err() {
        let _ = remove_if_exists(tmp).await;
    }
    Ok(published?)
}

pub async fn download(fetcher: &dyn Fetcher, url: &str, dest: &Path) -> WorkerResult<StageOutcome> {
    if let Some(bytes) = file_size_if_present(dest).await? {
        debug!(bytes, path = %dest.display(), "Source already downloaded");
        return Ok(StageOutcome::Skipped);
    }

    let bytes = fetcher.fetch_to_file(url, dest).await?;
    record_download(bytes);
    info!(bytes, "Downloaded source");
    Ok(StageOutcome::Ran)
}

pub async fn extract_audio(
    transcoder: &dyn Transcoder,
    source: &Path,
    audio: &Path,
) -> WorkerResult<StageOutcome> {
    if file_size_if_present(audio).await?.is_some() {
        debug!(path = %audio.display(), "Audio already extracted");
        return Ok(StageOutcome::Skipped);
    }

    let tmp = temp_sibling(audio);
    let result = transcoder.to_audio(source, &tmp).await;
    publish(result, &tmp, audio).await?;
    info!("Extracted audio");
    Ok(StageOutcome::Ran)
}

pub async fn transcribe(
    transcoder: &dyn Transcoder,
    transcriber: &dyn Transcriber,
    work: &MediaWorkDir,
) -> WorkerResult<(StageOutcome, TranscriptCache)> {
    let cache_path = work.transcript_cache();
    if let Some(cache) = TranscriptCache::load(&cache_path).await? {
        debug!(path = %cache_path.display(), "Transcript cache hit");
        return Ok((StageOutcome::Skipped, cache));
    }

    let audio = work.audio();
    let size = file_size_if_present(&audio)
        .await?
        .ok_or_else(|| MediaError::FileNotFound(audio.clone()))?;

    let cache = if size > transcriber.max_upload_bytes() {
        transcribe_chunked(transcoder, transcriber, work, size).await?
    } else {
        let result = transcriber.transcribe(&audio).await?;
        record_transcription("single");
        TranscriptCache {
            text: result.text,
            raw_api_result: result.raw,
        }
    };

    // Written before any later stage so a retry never pays for this twice
    cache.store(&cache_path).await?;
    info!(chars = cache.text.len(), "Transcribed audio");
    Ok((StageOutcome::Ran, cache))
}

/// Split, then transcribe pieces strictly in order.
///
/// Piece texts are trimmed and joined with single spaces; pieces that come
/// back empty (silence) add nothing to the text but keep their raw result.
/// Each piece is deleted as soon as its text is in hand. A failure aborts
/// the loop; the next attempt splits again from scratch.
async fn transcribe_chunked(
    transcoder: &dyn Transcoder,
    transcriber: &dyn Transcriber,
    work: &MediaWorkDir,
    size: u64,
) -> WorkerResult<TranscriptCache> {
    let chunks = transcoder
        .split_by_segment_duration(&work.audio(), CHUNK_SECONDS, &work.audio_chunks())
        .await?;
    info!(
        bytes = size,
        chunks = chunks.len(),
        "Audio exceeds upload limit, transcribing in chunks"
    );

    let mut texts = Vec::with_capacity(chunks.len());
    let mut raws = Vec::with_capacity(chunks.len());
    for (index, chunk) in chunks.iter().enumerate() {
        let result = transcriber.transcribe(chunk).await?;
        record_transcription("chunk");
        debug!(chunk = index, "Chunk transcribed");

        let text = result.text.trim();
        if !text.is_empty() {
            texts.push(text.to_string());
        }
        raws.push(result.raw);
        remove_if_exists(chunk).await?;
    }

    Ok(TranscriptCache {
        text: texts.join(" "),
        raw_api_result: serde_json::json!({ "chunks": raws }),
    })
}

/// Produce the final asset at its storage path.
///
/// The output is rendered into the work directory and moved into storage
/// only once complete, so an interrupted attempt leaves nothing public.
pub async fn optimize(
    transcoder: &dyn Transcoder,
    media_type: MediaType,
    work: &MediaWorkDir,
    dest: &Path,
) -> WorkerResult<StageOutcome> {
    if file_size_if_present(dest).await?.is_some() {
        debug!(path = %dest.display(), "Final asset already stored");
        return Ok(StageOutcome::Skipped);
    }

    let source = work.source();
    let staging = work.staging_for(dest);
    let result = match media_type {
        MediaType::Video => transcoder.optimize_video(&source, &staging).await,
        MediaType::Image => fs::copy(&source, &staging)
            .await
            .map(|_| ())
            .map_err(MediaError::from),
    };
    publish(result, &staging, dest).await?;
    info!(path = %dest.display(), "Stored final asset");
    Ok(StageOutcome::Ran)
}

/// Record the transcript and the local storage URL.
///
/// Skipped means every record was already up to date.
pub async fn persist(
    media: &dyn MediaRepo,
    transcripts: &dyn TranscriptRepo,
    payload: &ProcessMediaPayload,
    transcript: Option<&TranscriptCache>,
    public_url: &str,
) -> WorkerResult<StageOutcome> {
    let mut wrote = false;

    if let Some(cache) = transcript {
        let owner = TranscriptOwner::Media {
            post_id: payload.post_id.clone(),
            media_id: payload.media_id.clone(),
        };
        let saved = transcripts
            .create_if_absent(NewTranscript::new(
                owner,
                cache.text.clone(),
                cache.raw_api_result.clone(),
            ))
            .await?;
        if saved.created() {
            info!(transcript_id = %saved.transcript().id, "Transcript saved");
            wrote = true;
        } else {
            debug!(transcript_id = %saved.transcript().id, "Transcript already exists");
        }
    }

    match media.set_storage_url(&payload.media_id, public_url).await {
        Ok(StorageUrlDecision::Replace) => {
            info!(url = %public_url, "Storage URL updated");
            wrote = true;
        }
        Ok(decision) => debug!(?decision, "Storage URL left as is"),
        // Retrying cannot create the record
        Err(StoreError::NotFound(path)) => {
            warn!(record = %path, "Media record missing, storage URL not recorded")
        }
        Err(e) => return Err(e.into()),
    }

    Ok(if wrote {
        StageOutcome::Ran
    } else {
        StageOutcome::Skipped
    })
}

pub async fn cleanup(work: &MediaWorkDir) -> WorkerResult<StageOutcome> {
    if !fs::try_exists(work.path()).await? {
        return Ok(StageOutcome::Skipped);
    }
    work.remove_artifacts().await?;
    debug!(dir = %work.path().display(), "Work directory cleaned");
    Ok(StageOutcome::Ran)
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;
    use crate::testing::{files_under, Harness};

    #[tokio::test]
    async fn test_overlapping_downloads_publish_whole_file() {
        let tmp = TempDir::new().unwrap();
        let harness = Harness::new(tmp.path());
        let dest = tmp.path().join("work/media/m1/source.mp4");
        let url = "https://cdn.example.com/v.mp4";

        let (first, second) = tokio::join!(
            download(harness.fetcher.as_ref(), url, &dest),
            download(harness.fetcher.as_ref(), url, &dest)
        );
        first.unwrap();
        second.unwrap();

        assert_eq!(fs::read(&dest).await.unwrap(), b"remote-bytes");
        assert_eq!(files_under(&tmp.path().join("work")), vec![dest.clone()]);
        assert_eq!(
            download(harness.fetcher.as_ref(), url, &dest).await.unwrap(),
            StageOutcome::Skipped
        );
    }

    #[tokio::test]
    async fn test_image_copy_is_staged_in_work_dir() {
        let tmp = TempDir::new().unwrap();
        let harness = Harness::new(tmp.path());
        let work = MediaWorkDir::new(&tmp.path().join("work"), &"m2".into(), "png").unwrap();
        work.ensure().await.unwrap();
        fs::write(work.source(), b"pixels").await.unwrap();
        let dest = tmp.path().join("storage/alice/posts/m2.png");

        let outcome = optimize(harness.transcoder.as_ref(), MediaType::Image, &work, &dest)
            .await
            .unwrap();

        assert_eq!(outcome, StageOutcome::Ran);
        assert_eq!(fs::read(&dest).await.unwrap(), b"pixels");
        assert_eq!(files_under(work.path()), vec![work.source()]);
    }

    #[tokio::test]
    async fn test_failed_render_is_discarded() {
        let tmp = TempDir::new().unwrap();
        let harness = Harness::new(tmp.path());
        harness
            .transcoder
            .fail_optimize
            .store(true, std::sync::atomic::Ordering::SeqCst);
        let work = MediaWorkDir::new(&tmp.path().join("work"), &"m1".into(), "mp4").unwrap();
        work.ensure().await.unwrap();
        fs::write(work.source(), b"video").await.unwrap();
        let dest = tmp.path().join("storage/alice/posts/m1.mp4");

        assert!(optimize(harness.transcoder.as_ref(), MediaType::Video, &work, &dest)
            .await
            .is_err());
        assert!(files_under(&tmp.path().join("storage")).is_empty());
        assert_eq!(files_under(work.path()), vec![work.source()]);
    }
}
