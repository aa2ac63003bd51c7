//! FFmpeg integration tests.

use std::path::Path;

use mvault_media::{
    probe_media, segment_count, ChunkPattern, FfmpegRunner, FfmpegTranscoder, Transcoder,
};
use tempfile::TempDir;
use tokio::process::Command;

/// Five seconds of tone over a black picture of `size` (`WxH`).
async fn synth_clip(path: &Path, size: &str) {
    let picture = format!("color=c=black:s={}:d=5", size);
    let status = Command::new("ffmpeg")
        .args(["-y", "-v", "error"])
        .args(["-f", "lavfi", "-i", "sine=frequency=440:duration=5"])
        .args(["-f", "lavfi", "-i", picture.as_str()])
        .args(["-shortest", "-c:v", "libx264", "-c:a", "aac"])
        .arg(path)
        .status()
        .await
        .expect("ffmpeg not runnable");
    assert!(status.success());
}

fn transcoder() -> FfmpegTranscoder {
    FfmpegTranscoder::new(FfmpegRunner::new(2))
}

#[tokio::test]
#[ignore = "requires ffmpeg"]
async fn test_audio_extraction_and_chunking() {
    let tmp = TempDir::new().unwrap();
    let clip = tmp.path().join("source.mp4");
    let audio = tmp.path().join("audio.mp3");
    synth_clip(&clip, "320x240").await;

    transcoder().to_audio(&clip, &audio).await.unwrap();
    let info = probe_media(&audio).await.unwrap();
    assert!(info.has_audio);
    assert!(!info.has_video);

    let pattern = ChunkPattern::new(tmp.path(), "audio", "mp3");
    let chunks = transcoder()
        .split_by_segment_duration(&audio, 2, &pattern)
        .await
        .unwrap();
    assert_eq!(chunks.len(), segment_count(info.duration, 2));
    assert_eq!(chunks[0], pattern.chunk_path(0));

    // Resplitting replaces the previous pieces
    let again = transcoder()
        .split_by_segment_duration(&audio, 2, &pattern)
        .await
        .unwrap();
    assert_eq!(again, chunks);
}

#[tokio::test]
#[ignore = "requires ffmpeg"]
async fn test_optimize_caps_height_at_720() {
    let tmp = TempDir::new().unwrap();
    let clip = tmp.path().join("source.mp4");
    let out = tmp.path().join("optimized.mp4");
    synth_clip(&clip, "1280x960").await;

    transcoder().optimize_video(&clip, &out).await.unwrap();

    let info = probe_media(&out).await.unwrap();
    assert!(info.has_video);
    assert!(info.has_audio);
    assert!((info.duration - 5.0).abs() < 0.5);
    assert_eq!(info.height, Some(720));
    assert_eq!(info.width, Some(960));
}

#[tokio::test]
#[ignore = "requires ffmpeg"]
async fn test_optimize_keeps_small_sources_small() {
    let tmp = TempDir::new().unwrap();
    let clip = tmp.path().join("source.mp4");
    let out = tmp.path().join("optimized.mp4");
    synth_clip(&clip, "320x240").await;

    transcoder().optimize_video(&clip, &out).await.unwrap();

    let info = probe_media(&out).await.unwrap();
    assert_eq!(info.height, Some(240));
    assert_eq!(info.width, Some(320));
}
