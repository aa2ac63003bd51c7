//! Worker configuration.

use std::path::PathBuf;
use std::time::Duration;

use mvault_models::StorageLayout;

/// Entity store implementation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreBackend {
    Firestore,
    Memory,
}

/// Job queue implementation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueBackend {
    Redis,
    Memory,
}

/// Worker configuration.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Maximum concurrent jobs
    pub max_concurrent_jobs: usize,
    /// Maximum concurrent FFmpeg processes across all jobs
    pub max_ffmpeg_processes: usize,
    /// Job timeout
    pub job_timeout: Duration,
    /// Graceful shutdown timeout
    pub shutdown_timeout: Duration,
    /// Root for per-media work directories
    pub work_dir: PathBuf,
    /// Root for final assets
    pub storage_root: PathBuf,
    /// Public URL prefix mapped onto the storage root
    pub public_prefix: String,
    /// How often the worker scans for stalled deliveries
    pub claim_interval: Duration,
    /// Minimum idle time before a delivery can be claimed (crash recovery)
    pub claim_min_idle: Duration,
    /// Interval for refreshing job ownership while processing (prevents premature reclamation)
    pub job_heartbeat_interval: Duration,
    /// How long a consume call blocks when the queue is empty
    pub poll_block: Duration,
    /// How often due retries are moved back to waiting
    pub promote_interval: Duration,
    pub store_backend: StoreBackend,
    pub queue_backend: QueueBackend,
    /// Prometheus listener address, e.g. `0.0.0.0:9090`
    pub metrics_addr: Option<String>,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            max_concurrent_jobs: 2,
            max_ffmpeg_processes: 2,
            job_timeout: Duration::from_secs(3600), // 1 hour
            shutdown_timeout: Duration::from_secs(60),
            work_dir: PathBuf::from("./temp"),
            storage_root: PathBuf::from("./storage"),
            public_prefix: "/content".to_string(),
            claim_interval: Duration::from_secs(30),
            claim_min_idle: Duration::from_secs(300), // 5 minutes
            job_heartbeat_interval: Duration::from_secs(30),
            poll_block: Duration::from_millis(1000),
            promote_interval: Duration::from_millis(1000),
            store_backend: StoreBackend::Firestore,
            queue_backend: QueueBackend::Redis,
            metrics_addr: None,
        }
    }
}

impl WorkerConfig {
    /// Create config from environment variables.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let claim_min_idle = env_parse("WORKER_CLAIM_MIN_IDLE_SECS")
            .map(Duration::from_secs)
            .unwrap_or(defaults.claim_min_idle);
        let job_heartbeat_interval = env_parse("WORKER_HEARTBEAT_INTERVAL_SECS")
            .map(Duration::from_secs)
            .unwrap_or(defaults.job_heartbeat_interval);
        Self {
            max_concurrent_jobs: env_parse("WORKER_MAX_JOBS")
                .unwrap_or(defaults.max_concurrent_jobs)
                .max(1),
            max_ffmpeg_processes: env_parse("WORKER_MAX_FFMPEG")
                .unwrap_or(defaults.max_ffmpeg_processes)
                .max(1),
            job_timeout: env_parse("WORKER_JOB_TIMEOUT")
                .map(Duration::from_secs)
                .unwrap_or(defaults.job_timeout),
            shutdown_timeout: env_parse("WORKER_SHUTDOWN_TIMEOUT")
                .map(Duration::from_secs)
                .unwrap_or(defaults.shutdown_timeout),
            work_dir: std::env::var("WORKER_WORK_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.work_dir),
            storage_root: std::env::var("STORAGE_ROOT")
                .map(PathBuf::from)
                .unwrap_or(defaults.storage_root),
            public_prefix: std::env::var("STORAGE_PUBLIC_PREFIX").unwrap_or(defaults.public_prefix),
            claim_interval: env_parse("WORKER_CLAIM_INTERVAL_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.claim_interval),
            claim_min_idle,
            // A heartbeat slower than the claim threshold lets live jobs be stolen
            job_heartbeat_interval: if job_heartbeat_interval.is_zero()
                || job_heartbeat_interval >= claim_min_idle
            {
                claim_min_idle / 3
            } else {
                job_heartbeat_interval
            },
            poll_block: env_parse("WORKER_POLL_BLOCK_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.poll_block),
            promote_interval: env_parse("WORKER_PROMOTE_INTERVAL_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.promote_interval),
            store_backend: match std::env::var("STORE_BACKEND").ok().as_deref() {
                Some("memory") => StoreBackend::Memory,
                _ => StoreBackend::Firestore,
            },
            queue_backend: match std::env::var("QUEUE_BACKEND").ok().as_deref() {
                Some("memory") => QueueBackend::Memory,
                _ => QueueBackend::Redis,
            },
            metrics_addr: std::env::var("METRICS_ADDR").ok().filter(|s| !s.is_empty()),
        }
    }

    pub fn storage_layout(&self) -> StorageLayout {
        StorageLayout::new(self.storage_root.clone(), self.public_prefix.clone())
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|s| s.parse().ok())
}
