//! Transcoding capability used by the pipeline stages.
//!
//! Implementations write straight to the paths they are given; callers are
//! responsible for pointing them at temp files and publishing by rename.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::fs;
use tracing::{debug, info, warn};

use crate::command::{FfmpegCommand, FfmpegRunner};
use crate::error::{MediaError, MediaResult};
use crate::fs_utils::remove_if_exists;
use crate::probe::{probe_media, segment_count};

/// Audio, segmenting and video re-encode operations.
#[async_trait]
pub trait Transcoder: Send + Sync {
    /// Extract the audio track of `input` as MP3.
    async fn to_audio(&self, input: &Path, output: &Path) -> MediaResult<()>;

    /// Split `input` into `segment_secs` long pieces named after `pattern`,
    /// without re-encoding. Returns the pieces in playback order.
    async fn split_by_segment_duration(
        &self,
        input: &Path,
        segment_secs: u32,
        pattern: &ChunkPattern,
    ) -> MediaResult<Vec<PathBuf>>;

    /// Re-encode a video for storage.
    async fn optimize_video(&self, input: &Path, output: &Path) -> MediaResult<()>;
}

/// Deterministic naming for split segments: `<dir>/<stem>_chunk_000.<ext>`, ...
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkPattern {
    dir: PathBuf,
    stem: String,
    ext: String,
}

impl ChunkPattern {
    pub fn new(dir: impl Into<PathBuf>, stem: impl Into<String>, ext: impl Into<String>) -> Self {
        Self {
            dir: dir.into(),
            stem: stem.into(),
            ext: ext.into(),
        }
    }

    fn prefix(&self) -> String {
        format!("{}_chunk_", self.stem)
    }

    fn suffix(&self) -> String {
        format!(".{}", self.ext)
    }

    /// printf-style pattern handed to the FFmpeg segment muxer.
    pub fn ffmpeg_pattern(&self) -> PathBuf {
        self.dir.join(format!("{}%03d{}", self.prefix(), self.suffix()))
    }

    /// Path of the `index`-th chunk.
    pub fn chunk_path(&self, index: usize) -> PathBuf {
        self.dir.join(format!("{}{:03}{}", self.prefix(), index, self.suffix()))
    }

    fn matches(&self, name: &str) -> bool {
        let prefix = self.prefix();
        let suffix = self.suffix();
        name.len() > prefix.len() + suffix.len()
            && name.starts_with(&prefix)
            && name.ends_with(&suffix)
            && name[prefix.len()..name.len() - suffix.len()]
                .chars()
                .all(|c| c.is_ascii_digit())
    }

    /// Existing chunks, sorted by index.
    pub async fn list(&self) -> MediaResult<Vec<PathBuf>> {
        let mut entries = match fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut chunks = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().to_string();
            if self.matches(&name) {
                chunks.push(entry.path());
            }
        }
        // Zero-padded indices sort lexicographically
        chunks.sort();
        Ok(chunks)
    }

    /// Delete every existing chunk. Returns how many were removed.
    pub async fn clear(&self) -> MediaResult<usize> {
        let mut removed = 0;
        for chunk in self.list().await? {
            if remove_if_exists(&chunk).await? {
                removed += 1;
            }
        }
        Ok(removed)
    }
}

/// Storage re-encode settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OptimizeSettings {
    pub video_codec: String,
    pub crf: u8,
    pub preset: String,
    /// Maximum output height. Shorter sources keep their height; width
    /// follows the aspect ratio rounded to even.
    pub height: u32,
    pub audio_codec: String,
    pub audio_bitrate: String,
}

impl Default for OptimizeSettings {
    fn default() -> Self {
        Self {
            video_codec: "libx264".to_string(),
            crf: 28,
            preset: "slow".to_string(),
            height: 720,
            audio_codec: "aac".to_string(),
            audio_bitrate: "128k".to_string(),
        }
    }
}

impl OptimizeSettings {
    /// Downscale to `height`, never upscale, keep both dimensions even.
    fn scale_filter(&self) -> String {
        format!("scale=-2:'min({},trunc(ih/2)*2)'", self.height)
    }

    fn apply(&self, cmd: FfmpegCommand) -> FfmpegCommand {
        cmd.video_codec(&self.video_codec)
            .crf(self.crf)
            .preset(&self.preset)
            .video_filter(self.scale_filter())
            .audio_codec(&self.audio_codec)
            .audio_bitrate(&self.audio_bitrate)
    }
}

/// [`Transcoder`] backed by the FFmpeg CLI.
#[derive(Clone)]
pub struct FfmpegTranscoder {
    runner: FfmpegRunner,
    settings: OptimizeSettings,
}

impl FfmpegTranscoder {
    pub fn new(runner: FfmpegRunner) -> Self {
        Self {
            runner,
            settings: OptimizeSettings::default(),
        }
    }

    pub fn with_settings(mut self, settings: OptimizeSettings) -> Self {
        self.settings = settings;
        self
    }

    fn audio_command(input: &Path, output: &Path) -> FfmpegCommand {
        FfmpegCommand::new(input, output)
            .no_video()
            .audio_codec("libmp3lame")
            .format("mp3")
    }

    fn split_command(input: &Path, segment_secs: u32, pattern: &ChunkPattern) -> FfmpegCommand {
        FfmpegCommand::new(input, pattern.ffmpeg_pattern())
            .segment(segment_secs)
            .stream_copy()
    }

    fn optimize_command(&self, input: &Path, output: &Path) -> FfmpegCommand {
        self.settings.apply(FfmpegCommand::new(input, output))
    }
}

#[async_trait]
impl Transcoder for FfmpegTranscoder {
    async fn to_audio(&self, input: &Path, output: &Path) -> MediaResult<()> {
        debug!("Extracting audio: {} -> {}", input.display(), output.display());
        self.runner.run(&Self::audio_command(input, output)).await
    }

    async fn split_by_segment_duration(
        &self,
        input: &Path,
        segment_secs: u32,
        pattern: &ChunkPattern,
    ) -> MediaResult<Vec<PathBuf>> {
        // Leftovers from an interrupted run would be mixed into the listing
        let stale = pattern.clear().await?;
        if stale > 0 {
            debug!(stale, "Removed leftover chunks before splitting");
        }

        self.runner
            .run(&Self::split_command(input, segment_secs, pattern))
            .await?;

        let chunks = pattern.list().await?;
        if chunks.is_empty() {
            return Err(MediaError::EmptyOutput(pattern.ffmpeg_pattern()));
        }
        match probe_media(input).await {
            Ok(probe) => {
                let expected = segment_count(probe.duration, segment_secs);
                if expected != chunks.len() {
                    warn!(
                        expected,
                        produced = chunks.len(),
                        duration = probe.duration,
                        "Chunk count differs from duration"
                    );
                }
            }
            Err(e) => debug!("Skipping chunk count check: {}", e),
        }
        info!(count = chunks.len(), "Split {} into chunks", input.display());
        Ok(chunks)
    }

    async fn optimize_video(&self, input: &Path, output: &Path) -> MediaResult<()> {
        debug!("Optimizing video: {} -> {}", input.display(), output.display());
        self.runner.run(&self.optimize_command(input, output)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_optimize_command_matches_storage_settings() {
        let transcoder = FfmpegTranscoder::new(FfmpegRunner::new(1));
        let args = transcoder
            .optimize_command(Path::new("in.mp4"), Path::new("out.mp4"))
            .build_args()
            .join(" ");
        assert!(args.contains(
            "-c:v libx264 -crf 28 -preset slow -vf scale=-2:'min(720,trunc(ih/2)*2)' -c:a aac -b:a 128k"
        ));
    }

    #[test]
    fn test_audio_command() {
        let args = FfmpegTranscoder::audio_command(Path::new("v.mp4"), Path::new("a.mp3"))
            .build_args()
            .join(" ");
        assert!(args.contains("-vn -c:a libmp3lame -f mp3"));
    }

    #[test]
    fn test_chunk_pattern_names() {
        let pattern = ChunkPattern::new("/w/m1", "audio", "mp3");
        assert_eq!(pattern.ffmpeg_pattern(), PathBuf::from("/w/m1/audio_chunk_%03d.mp3"));
        assert_eq!(pattern.chunk_path(7), PathBuf::from("/w/m1/audio_chunk_007.mp3"));
        assert!(pattern.matches("audio_chunk_012.mp3"));
        assert!(!pattern.matches("audio.mp3"));
        assert!(!pattern.matches("audio_chunk_.mp3"));
        assert!(!pattern.matches("audio_chunk_001.mp3.tmp"));
        assert!(!pattern.matches("other_chunk_001.mp3"));
    }

    #[tokio::test]
    async fn test_chunk_listing_sorted_and_cleared() {
        let dir = TempDir::new().unwrap();
        let pattern = ChunkPattern::new(dir.path(), "audio", "mp3");
        for i in [2usize, 0, 10, 1] {
            fs::write(pattern.chunk_path(i), b"x").await.unwrap();
        }
        fs::write(dir.path().join("audio.mp3"), b"full").await.unwrap();

        let listed = pattern.list().await.unwrap();
        let names: Vec<_> = listed
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().to_string())
            .collect();
        assert_eq!(
            names,
            vec![
                "audio_chunk_000.mp3",
                "audio_chunk_001.mp3",
                "audio_chunk_002.mp3",
                "audio_chunk_010.mp3"
            ]
        );

        assert_eq!(pattern.clear().await.unwrap(), 4);
        assert!(pattern.list().await.unwrap().is_empty());
        assert!(dir.path().join("audio.mp3").exists());
    }
}
