//! Media pipeline: stage executors, state tracking and the job processor.

pub mod processor;
pub mod stages;
pub mod state;

pub use processor::{MediaJobProcessor, MediaJobReport};
pub use stages::{TranscriptCache, CHUNK_SECONDS};
pub use state::{PipelineProgress, PipelineState, Stage, StageOutcome, StageRecord};
