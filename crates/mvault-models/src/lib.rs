//! Shared data models for the media ingestion pipeline.
//!
//! This crate provides Serde-serializable types for:
//! - Media, transcripts, accounts and posts
//! - Queue job payloads, kinds and retry policies
//! - The storage layout convention and the local-wins storage URL rule

pub mod account;
pub mod error;
pub mod job;
pub mod media;
pub mod storage;
pub mod transcript;

// Re-export common types
pub use account::{Account, CollaboratorRef, Post, PostId};
pub use error::{ModelError, ModelResult};
pub use job::{
    BackoffKind, BackoffPolicy, JobId, JobKind, JobOptions, JobStatus, ProcessMediaPayload,
    ProfileImagePayload,
};
pub use media::{
    decide_storage_url, is_local_storage_url, Media, MediaId, MediaType, StorageUrlDecision,
};
pub use storage::{extension_from_url, validate_path_segment, StorageLayout};
pub use transcript::{NewTranscript, Transcript, TranscriptOwner};
