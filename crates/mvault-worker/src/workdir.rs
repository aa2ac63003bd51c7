//! Deterministic per-media work directories.
//!
//! Every artifact path is a pure function of the media id, so a redelivered
//! job finds the artifacts of earlier attempts and the stage guards can skip
//! finished work. Final outputs are staged here too, so public storage only
//! ever receives finished files by rename.

use std::path::{Path, PathBuf};

use tokio::fs;
use tracing::{debug, warn};

use mvault_media::{remove_if_exists, temp_sibling, ChunkPattern};
use mvault_models::{validate_path_segment, MediaId};

use crate::error::WorkerResult;

const SOURCE_STEM: &str = "source";
const AUDIO_FILE: &str = "audio.mp3";
const TRANSCRIPT_CACHE_FILE: &str = "transcript.json";

/// Work directory of one media item: `<work_root>/media/<media_id>/`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaWorkDir {
    dir: PathBuf,
    source_ext: String,
}

impl MediaWorkDir {
    pub fn new(work_root: &Path, media_id: &MediaId, source_ext: &str) -> WorkerResult<Self> {
        validate_path_segment(media_id.as_str())?;
        validate_path_segment(source_ext)?;
        Ok(Self {
            dir: work_root.join("media").join(media_id.as_str()),
            source_ext: source_ext.to_string(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.dir
    }

    /// Raw download.
    pub fn source(&self) -> PathBuf {
        self.dir.join(format!("{}.{}", SOURCE_STEM, self.source_ext))
    }

    /// Extracted MP3 audio track.
    pub fn audio(&self) -> PathBuf {
        self.dir.join(AUDIO_FILE)
    }

    /// Cached `{text, rawApiResult}` of the transcription stage.
    pub fn transcript_cache(&self) -> PathBuf {
        self.dir.join(TRANSCRIPT_CACHE_FILE)
    }

    /// Unique staging path for a final output that will be moved to `dest`.
    pub fn staging_for(&self, dest: &Path) -> PathBuf {
        staging_in(&self.dir, dest)
    }

    /// Naming of audio pieces when the track is too large to upload whole.
    pub fn audio_chunks(&self) -> ChunkPattern {
        ChunkPattern::new(self.dir.clone(), "audio", "mp3")
    }

    pub async fn ensure(&self) -> WorkerResult<()> {
        fs::create_dir_all(&self.dir).await?;
        Ok(())
    }

    /// Delete every artifact and then the directory itself.
    ///
    /// Temp files abandoned by crashed attempts are swept too. Returns false
    /// when the directory could not be removed because something unknown is
    /// still inside.
    pub async fn remove_artifacts(&self) -> WorkerResult<bool> {
        for path in [self.source(), self.audio(), self.transcript_cache()] {
            remove_if_exists(&path).await?;
        }
        self.audio_chunks().clear().await?;
        sweep_and_remove(&self.dir).await
    }
}

/// Staging directory of one profile image:
/// `<work_root>/profiles/<context_username>/<username>/`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProfileWorkDir {
    dir: PathBuf,
}

impl ProfileWorkDir {
    pub fn new(work_root: &Path, context_username: &str, username: &str) -> WorkerResult<Self> {
        validate_path_segment(context_username)?;
        validate_path_segment(username)?;
        Ok(Self {
            dir: work_root.join("profiles").join(context_username).join(username),
        })
    }

    pub fn path(&self) -> &Path {
        &self.dir
    }

    pub fn staging_for(&self, dest: &Path) -> PathBuf {
        staging_in(&self.dir, dest)
    }

    pub async fn ensure(&self) -> WorkerResult<()> {
        fs::create_dir_all(&self.dir).await?;
        Ok(())
    }

    /// Sweep staged downloads and remove the directory.
    pub async fn remove_artifacts(&self) -> WorkerResult<bool> {
        sweep_and_remove(&self.dir).await
    }
}

fn staging_in(dir: &Path, dest: &Path) -> PathBuf {
    let name = dest.file_name().unwrap_or_else(|| std::ffi::OsStr::new("final"));
    temp_sibling(&dir.join(name))
}

/// Delete temp files left by crashed attempts, then the directory itself.
///
/// Returns false when something unknown is still inside.
async fn sweep_and_remove(dir: &Path) -> WorkerResult<bool> {
    sweep_temp_files(dir).await?;
    match fs::remove_dir(dir).await {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(true),
        Err(e) => {
            warn!(dir = %dir.display(), "Work directory not removed: {}", e);
            Ok(false)
        }
    }
}

async fn sweep_temp_files(dir: &Path) -> WorkerResult<()> {
    let mut entries = match fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e.into()),
    };
    while let Some(entry) = entries.next_entry().await? {
        let name = entry.file_name().to_string_lossy().to_string();
        if name.starts_with('.') && name.contains(".tmp") {
            debug!(file = %name, "Removing abandoned temp file");
            remove_if_exists(entry.path()).await?;
        }
    }
    Ok(())
}
