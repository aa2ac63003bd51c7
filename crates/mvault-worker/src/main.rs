//! Media ingestion worker binary.

use std::sync::Arc;

use anyhow::Context;
use tracing::info;

use mvault_queue::{JobQueue, MemoryJobQueue, RedisJobQueue};
use mvault_worker::{init_tracing, metrics, JobExecutor, ProcessingContext, QueueBackend, WorkerConfig};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Install rustls crypto provider (required for TLS/HTTPS)
    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|_| anyhow::anyhow!("Failed to install rustls crypto provider"))?;

    dotenvy::dotenv().ok();
    init_tracing("mvault=info")?;

    info!("Starting mvault-worker");

    let config = WorkerConfig::from_env();
    info!("Worker config: {:?}", config);

    if let Some(addr) = &config.metrics_addr {
        metrics::install_exporter(addr)?;
        info!("Serving metrics on {}", addr);
    }

    let queue: Arc<dyn JobQueue> = match config.queue_backend {
        QueueBackend::Redis => {
            let queue = RedisJobQueue::from_env().context("Failed to create job queue")?;
            queue.init().await.context("Failed to initialize job queue")?;
            Arc::new(queue)
        }
        QueueBackend::Memory => {
            info!("Using in-memory job queue; only jobs submitted in-process will run");
            Arc::new(MemoryJobQueue::new())
        }
    };

    let ctx = ProcessingContext::from_config(&config)
        .await
        .context("Failed to create processing context")?;
    let executor = Arc::new(JobExecutor::new(config, queue, Arc::new(ctx)));

    let signal_executor = Arc::clone(&executor);
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("Received shutdown signal");
        signal_executor.shutdown();
    });

    executor.run().await.context("Executor error")?;

    info!("Worker shutdown complete");
    Ok(())
}
