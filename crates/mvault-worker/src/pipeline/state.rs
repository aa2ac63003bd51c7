//! Per-job pipeline state and stage timings.

use std::fmt;
use std::time::Duration;

use crate::metrics::record_stage;

/// Pipeline stages in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    Download,
    ExtractAudio,
    Transcribe,
    Optimize,
    Persist,
    Cleanup,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Download => "download",
            Stage::ExtractAudio => "extract_audio",
            Stage::Transcribe => "transcribe",
            Stage::Optimize => "optimize",
            Stage::Persist => "persist",
            Stage::Cleanup => "cleanup",
        }
    }

    /// State reached once this stage has succeeded.
    pub fn completes(&self) -> PipelineState {
        match self {
            Stage::Download => PipelineState::Downloaded,
            Stage::ExtractAudio => PipelineState::AudioExtracted,
            Stage::Transcribe => PipelineState::Transcribed,
            Stage::Optimize => PipelineState::Optimized,
            Stage::Persist => PipelineState::Persisted,
            Stage::Cleanup => PipelineState::CleanedUp,
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where a media job is in its state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PipelineState {
    Pending,
    Downloaded,
    AudioExtracted,
    Transcribed,
    Optimized,
    Persisted,
    CleanedUp,
    Failed,
}

impl PipelineState {
    pub fn as_str(&self) -> &'static str {
        match self {
            PipelineState::Pending => "pending",
            PipelineState::Downloaded => "downloaded",
            PipelineState::AudioExtracted => "audio_extracted",
            PipelineState::Transcribed => "transcribed",
            PipelineState::Optimized => "optimized",
            PipelineState::Persisted => "persisted",
            PipelineState::CleanedUp => "cleaned_up",
            PipelineState::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, PipelineState::CleanedUp | PipelineState::Failed)
    }
}

impl fmt::Display for PipelineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Whether a stage did work or was skipped by its guard.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageOutcome {
    Ran,
    Skipped,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageRecord {
    pub stage: Stage,
    pub outcome: StageOutcome,
    pub elapsed: Duration,
}

/// Progress of one job through the pipeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineProgress {
    state: PipelineState,
    stages: Vec<StageRecord>,
}

impl Default for PipelineProgress {
    fn default() -> Self {
        Self::new()
    }
}

impl PipelineProgress {
    pub fn new() -> Self {
        Self {
            state: PipelineState::Pending,
            stages: Vec::new(),
        }
    }

    pub fn state(&self) -> PipelineState {
        self.state
    }

    pub fn stages(&self) -> &[StageRecord] {
        &self.stages
    }

    pub fn outcome_of(&self, stage: Stage) -> Option<StageOutcome> {
        self.stages.iter().find(|r| r.stage == stage).map(|r| r.outcome)
    }

    /// Record a finished stage and advance the state.
    pub fn complete(&mut self, stage: Stage, outcome: StageOutcome, elapsed: Duration) {
        record_stage(stage.as_str(), outcome == StageOutcome::Skipped, elapsed);
        self.stages.push(StageRecord {
            stage,
            outcome,
            elapsed,
        });
        self.state = stage.completes();
    }

    /// Mark the job failed, returning the last state reached before failing.
    pub fn fail(&mut self) -> PipelineState {
        let reached = self.state;
        self.state = PipelineState::Failed;
        reached
    }

    pub fn total_elapsed(&self) -> Duration {
        self.stages.iter().map(|r| r.elapsed).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_progress_advances_through_stages() {
        let mut progress = PipelineProgress::new();
        assert_eq!(progress.state(), PipelineState::Pending);

        progress.complete(Stage::Download, StageOutcome::Skipped, Duration::ZERO);
        progress.complete(Stage::ExtractAudio, StageOutcome::Ran, Duration::from_millis(20));
        assert_eq!(progress.state(), PipelineState::AudioExtracted);
        assert_eq!(progress.outcome_of(Stage::Download), Some(StageOutcome::Skipped));
        assert_eq!(progress.outcome_of(Stage::Persist), None);
        assert_eq!(progress.total_elapsed(), Duration::from_millis(20));
    }

    #[test]
    fn test_fail_reports_last_reached_state() {
        let mut progress = PipelineProgress::new();
        progress.complete(Stage::Download, StageOutcome::Ran, Duration::ZERO);
        assert_eq!(progress.fail(), PipelineState::Downloaded);
        assert_eq!(progress.state(), PipelineState::Failed);
        assert!(progress.state().is_terminal());
    }
}
