//! Counting test doubles for the pipeline capabilities.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::fs;
use tokio::io::AsyncWriteExt;

use mvault_media::{temp_sibling, ChunkPattern, Fetcher, MediaError, MediaResult, Transcoder};
use mvault_store::MemoryStore;
use mvault_transcriber::{
    TranscribeError, TranscribeResult, Transcriber, TranscriptionResult, MAX_UPLOAD_BYTES,
};

use crate::config::WorkerConfig;
use crate::context::ProcessingContext;

/// Streams its body in two writes to a temp sibling, then renames.
pub(crate) struct CountingFetcher {
    pub calls: AtomicUsize,
    /// Hang forever after the first half of the body.
    pub stall: AtomicBool,
    body: Vec<u8>,
}

#[async_trait]
impl Fetcher for CountingFetcher {
    async fn fetch_to_file(&self, _url: &str, dest: &Path) -> MediaResult<u64> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent).await?;
        }
        let tmp = temp_sibling(dest);
        let (head, tail) = self.body.split_at(self.body.len() / 2);
        let mut file = fs::File::create(&tmp).await?;
        file.write_all(head).await?;
        file.flush().await?;
        if self.stall.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        tokio::task::yield_now().await;
        file.write_all(tail).await?;
        file.flush().await?;
        drop(file);
        fs::rename(&tmp, dest).await?;
        Ok(self.body.len() as u64)
    }
}

pub(crate) struct FakeTranscoder {
    pub audio_calls: AtomicUsize,
    pub split_calls: AtomicUsize,
    pub optimize_calls: AtomicUsize,
    pub fail_optimize: AtomicBool,
    /// Write part of the output, then hang forever.
    pub stall_optimize: AtomicBool,
    chunk_count: usize,
}

#[async_trait]
impl Transcoder for FakeTranscoder {
    async fn to_audio(&self, _input: &Path, output: &Path) -> MediaResult<()> {
        self.audio_calls.fetch_add(1, Ordering::SeqCst);
        fs::write(output, b"audio-track").await?;
        Ok(())
    }

    async fn split_by_segment_duration(
        &self,
        _input: &Path,
        _segment_secs: u32,
        pattern: &ChunkPattern,
    ) -> MediaResult<Vec<PathBuf>> {
        self.split_calls.fetch_add(1, Ordering::SeqCst);
        pattern.clear().await?;
        for index in 0..self.chunk_count {
            fs::write(pattern.chunk_path(index), format!("chunk-{}", index)).await?;
        }
        pattern.list().await
    }

    async fn optimize_video(&self, _input: &Path, output: &Path) -> MediaResult<()> {
        self.optimize_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_optimize.load(Ordering::SeqCst) {
            return Err(MediaError::ffmpeg_failed("encoder crashed", None, Some(1)));
        }
        if self.stall_optimize.load(Ordering::SeqCst) {
            fs::write(output, b"optim").await?;
            std::future::pending::<()>().await;
        }
        fs::write(output, b"optimized").await?;
        Ok(())
    }
}

/// Answers `heard <file contents>`.
pub(crate) struct FakeTranscriber {
    calls: AtomicUsize,
    /// 1-based call number that fails; 0 never fails.
    pub fail_on: AtomicUsize,
    /// 1-based call number that hears nothing; 0 never.
    pub silent_on: AtomicUsize,
    transcribed: Mutex<Vec<String>>,
    limit: u64,
}

impl FakeTranscriber {
    /// Contents of every successfully transcribed file, in call order.
    pub fn transcribed(&self) -> Vec<String> {
        self.transcribed.lock().unwrap().clone()
    }
}

#[async_trait]
impl Transcriber for FakeTranscriber {
    async fn transcribe(&self, audio: &Path) -> TranscribeResult<TranscriptionResult> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        let content = fs::read_to_string(audio).await?;
        let size = content.len() as u64;
        if size > self.limit {
            return Err(TranscribeError::FileTooLarge {
                path: audio.to_path_buf(),
                size,
                limit: self.limit,
            });
        }
        if self.fail_on.load(Ordering::SeqCst) == call {
            return Err(TranscribeError::Api {
                status: 503,
                message: "unavailable".to_string(),
            });
        }
        self.transcribed.lock().unwrap().push(content.clone());
        if self.silent_on.load(Ordering::SeqCst) == call {
            return Ok(TranscriptionResult {
                text: "  ".to_string(),
                raw: serde_json::json!({ "source": content, "segments": [] }),
            });
        }
        Ok(TranscriptionResult {
            text: format!("heard {}", content),
            raw: serde_json::json!({ "source": content }),
        })
    }

    fn max_upload_bytes(&self) -> u64 {
        self.limit
    }
}

/// A [`ProcessingContext`] over temp directories, doubles and a memory store.
pub(crate) struct Harness {
    pub ctx: ProcessingContext,
    pub store: Arc<MemoryStore>,
    pub fetcher: Arc<CountingFetcher>,
    pub transcoder: Arc<FakeTranscoder>,
    pub transcriber: Arc<FakeTranscriber>,
}

impl Harness {
    pub fn new(root: &Path) -> Self {
        Self::with_limits(root, MAX_UPLOAD_BYTES, 2)
    }

    pub fn with_limits(root: &Path, max_upload_bytes: u64, chunk_count: usize) -> Self {
        let config = WorkerConfig {
            work_dir: root.join("work"),
            storage_root: root.join("storage"),
            ..WorkerConfig::default()
        };
        let store = Arc::new(MemoryStore::new());
        let fetcher = Arc::new(CountingFetcher {
            calls: AtomicUsize::new(0),
            stall: AtomicBool::new(false),
            body: b"remote-bytes".to_vec(),
        });
        let transcoder = Arc::new(FakeTranscoder {
            audio_calls: AtomicUsize::new(0),
            split_calls: AtomicUsize::new(0),
            optimize_calls: AtomicUsize::new(0),
            fail_optimize: AtomicBool::new(false),
            stall_optimize: AtomicBool::new(false),
            chunk_count,
        });
        let transcriber = Arc::new(FakeTranscriber {
            calls: AtomicUsize::new(0),
            fail_on: AtomicUsize::new(0),
            silent_on: AtomicUsize::new(0),
            transcribed: Mutex::new(Vec::new()),
            limit: max_upload_bytes,
        });

        let ctx = ProcessingContext::new(
            config,
            fetcher.clone(),
            transcoder.clone(),
            transcriber.clone(),
            store.clone(),
        );
        Self {
            ctx,
            store,
            fetcher,
            transcoder,
            transcriber,
        }
    }
}

/// Every regular file below `root`, sorted. Empty when `root` is missing.
pub(crate) fn files_under(root: &Path) -> Vec<PathBuf> {
    let mut files = Vec::new();
    let mut pending = vec![root.to_path_buf()];
    while let Some(dir) = pending.pop() {
        let Ok(entries) = std::fs::read_dir(&dir) else {
            continue;
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if path.is_dir() {
                pending.push(path);
            } else {
                files.push(path);
            }
        }
    }
    files.sort();
    files
}
