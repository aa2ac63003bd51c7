//! Media job processor.

use std::future::Future;
use std::time::Instant;

use tracing::{info, info_span, warn, Instrument};

use mvault_models::{extension_from_url, MediaType, ProcessMediaPayload};

use crate::context::ProcessingContext;
use crate::error::{WorkerError, WorkerResult};
use crate::pipeline::stages;
use crate::pipeline::state::{PipelineProgress, Stage, StageOutcome};
use crate::workdir::MediaWorkDir;

/// Result of a successful media job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaJobReport {
    pub progress: PipelineProgress,
    pub public_url: String,
}

/// Runs `process-media` (and legacy `transcribe-media`) jobs.
///
/// Video: download, extract audio, transcribe, optimize, persist, clean up.
/// Image: download, copy into storage, persist, clean up.
pub struct MediaJobProcessor<'a> {
    ctx: &'a ProcessingContext,
}

impl<'a> MediaJobProcessor<'a> {
    pub fn new(ctx: &'a ProcessingContext) -> Self {
        Self { ctx }
    }

    pub async fn process(&self, payload: &ProcessMediaPayload) -> WorkerResult<MediaJobReport> {
        let ctx = self.ctx;
        let source_ext = extension_from_url(&payload.url, payload.media_type.default_extension());
        let final_ext = match payload.media_type {
            MediaType::Video => "mp4",
            MediaType::Image => source_ext.as_str(),
        };
        let relative = ctx
            .layout
            .media_relative(&payload.username, &payload.media_id, final_ext)?;
        let dest = ctx.layout.absolute(&relative);
        let public_url = ctx.layout.public_url(&relative);

        let work = MediaWorkDir::new(&ctx.config.work_dir, &payload.media_id, &source_ext)?;
        work.ensure().await?;

        let mut progress = PipelineProgress::new();
        let source = work.source();

        run_stage(
            &mut progress,
            Stage::Download,
            stages::download(ctx.fetcher.as_ref(), &payload.url, &source),
        )
        .await?;

        let transcript = if payload.media_type.is_video() {
            run_stage(
                &mut progress,
                Stage::ExtractAudio,
                stages::extract_audio(ctx.transcoder.as_ref(), &source, &work.audio()),
            )
            .await?;

            let cache = run_stage_with(
                &mut progress,
                Stage::Transcribe,
                stages::transcribe(ctx.transcoder.as_ref(), ctx.transcriber.as_ref(), &work),
            )
            .await?;
            Some(cache)
        } else {
            None
        };

        run_stage(
            &mut progress,
            Stage::Optimize,
            stages::optimize(ctx.transcoder.as_ref(), payload.media_type, &work, &dest),
        )
        .await?;

        run_stage(
            &mut progress,
            Stage::Persist,
            stages::persist(
                ctx.media.as_ref(),
                ctx.transcripts.as_ref(),
                payload,
                transcript.as_ref(),
                &public_url,
            ),
        )
        .await?;

        run_stage(&mut progress, Stage::Cleanup, stages::cleanup(&work)).await?;

        info!(
            media_id = %payload.media_id,
            state = %progress.state(),
            elapsed_ms = progress.total_elapsed().as_millis() as u64,
            "Media processed"
        );
        Ok(MediaJobReport {
            progress,
            public_url,
        })
    }
}

async fn run_stage<F>(progress: &mut PipelineProgress, stage: Stage, fut: F) -> WorkerResult<()>
where
    F: Future<Output = WorkerResult<StageOutcome>>,
{
    run_stage_with(progress, stage, async move { fut.await.map(|outcome| (outcome, ())) }).await
}

/// Run one stage, recording its timing or the state it failed from.
async fn run_stage_with<T, F>(progress: &mut PipelineProgress, stage: Stage, fut: F) -> WorkerResult<T>
where
    F: Future<Output = WorkerResult<(StageOutcome, T)>>,
{
    let started = Instant::now();
    match fut.instrument(info_span!("stage", stage = stage.as_str())).await {
        Ok((outcome, value)) => {
            progress.complete(stage, outcome, started.elapsed());
            Ok(value)
        }
        Err(e) => {
            let reached = progress.fail();
            warn!(stage = %stage, reached = %reached, "Stage failed: {}", e);
            Err(WorkerError::stage_failed(stage, reached, e))
        }
    }
}
