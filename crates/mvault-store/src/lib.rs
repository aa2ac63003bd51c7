//! Entity store for the media ingestion pipeline.
//!
//! This crate provides:
//! - Narrow repository traits for media, transcripts, accounts and posts
//! - A Firestore REST implementation (service account or emulator auth)
//! - An in-memory implementation for local runs and tests

pub mod error;
pub mod firestore;
pub mod memory;
pub mod repo;

pub use error::{StoreError, StoreResult};
pub use firestore::{FirestoreClient, FirestoreConfig, FirestoreStore};
pub use memory::MemoryStore;
pub use repo::{AccountRepo, MediaRepo, PostRepo, TranscriptRepo, TranscriptSave};
