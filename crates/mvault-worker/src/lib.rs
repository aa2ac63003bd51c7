//! Media ingestion worker.
//!
//! This crate provides:
//! - Job executor with bounded concurrency, stalled-job claiming and graceful shutdown
//! - The resumable media pipeline (download, audio, transcription, optimize, persist, cleanup)
//! - The collaborator/profile image processor
//! - Structured job logging and Prometheus metrics
//! - Operator commands for inspecting and re-submitting failed jobs

pub mod admin;
pub mod config;
pub mod context;
pub mod error;
pub mod executor;
pub mod logging;
pub mod metrics;
pub mod pipeline;
pub mod profile_image;
pub mod workdir;

#[cfg(test)]
mod testing;

pub use admin::AdminCommand;
pub use config::{QueueBackend, StoreBackend, WorkerConfig};
pub use context::ProcessingContext;
pub use error::{WorkerError, WorkerResult};
pub use executor::{process_job, JobExecutor};
pub use logging::{init_tracing, JobLogger};
pub use pipeline::{MediaJobProcessor, MediaJobReport, PipelineState, Stage};
pub use profile_image::{CollaboratorImageProcessor, ProfileImageReport};
pub use workdir::MediaWorkDir;
