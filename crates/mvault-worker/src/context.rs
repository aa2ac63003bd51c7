//! Shared dependencies of the job processors.

use std::sync::Arc;

use tracing::info;

use mvault_media::{FetchConfig, Fetcher, FfmpegRunner, FfmpegTranscoder, HttpFetcher, Transcoder};
use mvault_models::StorageLayout;
use mvault_store::{AccountRepo, FirestoreStore, MediaRepo, MemoryStore, PostRepo, TranscriptRepo};
use mvault_transcriber::{Transcriber, WhisperClient};

use crate::config::{StoreBackend, WorkerConfig};
use crate::error::WorkerResult;

/// Capabilities and repositories injected into every job.
#[derive(Clone)]
pub struct ProcessingContext {
    pub config: WorkerConfig,
    pub layout: StorageLayout,
    pub fetcher: Arc<dyn Fetcher>,
    pub transcoder: Arc<dyn Transcoder>,
    pub transcriber: Arc<dyn Transcriber>,
    pub media: Arc<dyn MediaRepo>,
    pub transcripts: Arc<dyn TranscriptRepo>,
    pub accounts: Arc<dyn AccountRepo>,
    pub posts: Arc<dyn PostRepo>,
}

impl ProcessingContext {
    /// Build a context around one store implementing every repository.
    pub fn new<S>(
        config: WorkerConfig,
        fetcher: Arc<dyn Fetcher>,
        transcoder: Arc<dyn Transcoder>,
        transcriber: Arc<dyn Transcriber>,
        store: Arc<S>,
    ) -> Self
    where
        S: MediaRepo + TranscriptRepo + AccountRepo + PostRepo + 'static,
    {
        let layout = config.storage_layout();
        Self {
            config,
            layout,
            fetcher,
            transcoder,
            transcriber,
            media: store.clone(),
            transcripts: store.clone(),
            accounts: store.clone(),
            posts: store,
        }
    }

    /// Production wiring: HTTP fetcher, FFmpeg, Whisper and the configured store.
    pub async fn from_config(config: &WorkerConfig) -> WorkerResult<Self> {
        let fetcher: Arc<dyn Fetcher> = Arc::new(HttpFetcher::new(FetchConfig::from_env())?);
        let runner = FfmpegRunner::new(config.max_ffmpeg_processes).with_timeout(config.job_timeout);
        let transcoder: Arc<dyn Transcoder> = Arc::new(FfmpegTranscoder::new(runner));
        let transcriber: Arc<dyn Transcriber> = Arc::new(WhisperClient::from_env()?);

        let ctx = match config.store_backend {
            StoreBackend::Firestore => {
                let store = Arc::new(FirestoreStore::from_env().await?);
                info!("Using Firestore entity store");
                Self::new(config.clone(), fetcher, transcoder, transcriber, store)
            }
            StoreBackend::Memory => {
                info!("Using in-memory entity store; records are lost on exit");
                let store = Arc::new(MemoryStore::new());
                Self::new(config.clone(), fetcher, transcoder, transcriber, store)
            }
        };
        Ok(ctx)
    }
}
