//! Media tooling for the ingestion pipeline.
//!
//! This crate provides:
//! - Type-safe FFmpeg command building and a bounded, timed runner
//! - FFprobe duration probing
//! - The [`Transcoder`] capability (audio extraction, segmenting, optimizing)
//! - The [`Fetcher`] capability (streamed HTTP downloads with atomic publish)
//! - Cross-device safe file moves

pub mod command;
pub mod error;
pub mod fetch;
pub mod fs_utils;
pub mod probe;
pub mod transcoder;

pub use command::{check_ffmpeg, check_ffprobe, FfmpegCommand, FfmpegRunner};
pub use error::{MediaError, MediaResult};
pub use fetch::{FetchConfig, Fetcher, HttpFetcher, DEFAULT_USER_AGENT};
pub use fs_utils::{copy_atomic, file_size_if_present, move_file, remove_if_exists, temp_sibling};
pub use probe::{probe_media, segment_count, MediaInfo};
pub use transcoder::{ChunkPattern, FfmpegTranscoder, OptimizeSettings, Transcoder};
