//! Job queue for the media ingestion pipeline.
//!
//! This crate provides:
//! - The [`JobQueue`] trait used by the worker and the admin tooling
//! - A Redis Streams implementation with delayed retries and a failed set
//! - An in-memory implementation for tests and single-process runs

pub mod error;
pub mod job;
pub mod memory;
pub mod queue;
pub mod redis_queue;

pub use error::{QueueError, QueueResult};
pub use job::{Delivery, FailOutcome, JobEnvelope, QueueCounts, QueueJob};
pub use memory::MemoryJobQueue;
pub use queue::{JobQueue, QueueConfig};
pub use redis_queue::RedisJobQueue;
