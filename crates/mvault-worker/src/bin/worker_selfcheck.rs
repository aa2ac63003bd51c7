use std::path::Path;

use mvault_media::{check_ffmpeg, check_ffprobe};
use mvault_worker::{QueueBackend, StoreBackend, WorkerConfig};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let config = WorkerConfig::from_env();

    println!(
        "worker-selfcheck: starting with work_dir={} storage_root={}",
        config.work_dir.display(),
        config.storage_root.display()
    );
    ensure_writable(&config.work_dir).await?;
    ensure_writable(&config.storage_root).await?;

    let ffmpeg = check_ffmpeg().map_err(|e| anyhow::anyhow!("ffmpeg not available: {}", e))?;
    let ffprobe = check_ffprobe().map_err(|e| anyhow::anyhow!("ffprobe not available: {}", e))?;
    println!(
        "worker-selfcheck: ffmpeg={} ffprobe={}",
        ffmpeg.display(),
        ffprobe.display()
    );

    let mut required = vec!["OPENAI_API_KEY"];
    if config.queue_backend == QueueBackend::Redis {
        required.push("REDIS_URL");
    }
    if config.store_backend == StoreBackend::Firestore {
        required.push("GCP_PROJECT_ID");
    }
    ensure_env_present(&required)?;

    println!("worker-selfcheck: ok");
    Ok(())
}

async fn ensure_writable(path: &Path) -> anyhow::Result<()> {
    tokio::fs::create_dir_all(path).await?;
    let probe = path.join(".selfcheck");
    tokio::fs::write(&probe, b"ok")
        .await
        .map_err(|e| anyhow::anyhow!("{} is not writable: {}", path.display(), e))?;
    tokio::fs::remove_file(&probe).await?;
    Ok(())
}

fn ensure_env_present(vars: &[&str]) -> anyhow::Result<()> {
    for var in vars {
        if std::env::var(var).is_err() {
            return Err(anyhow::anyhow!("missing required env var {}", var));
        }
    }
    Ok(())
}
