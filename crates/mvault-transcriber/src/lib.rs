//! Speech-to-text for the ingestion pipeline.
//!
//! [`Transcriber`] is the capability the worker depends on;
//! [`WhisperClient`] implements it against an OpenAI-compatible
//! `/audio/transcriptions` endpoint.

pub mod client;
pub mod error;
pub mod types;

pub use client::{WhisperClient, WhisperConfig};
pub use error::{TranscribeError, TranscribeResult};
pub use types::{Transcriber, TranscriptionResult, MAX_UPLOAD_BYTES};
