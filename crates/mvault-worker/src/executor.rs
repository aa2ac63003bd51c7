//! Job executor.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{watch, Semaphore};
use tracing::{debug, error, info, warn, Instrument};
use uuid::Uuid;

use mvault_queue::{Delivery, FailOutcome, JobQueue, QueueError, QueueJob};

use crate::config::WorkerConfig;
use crate::context::ProcessingContext;
use crate::error::{WorkerError, WorkerResult};
use crate::logging::JobLogger;
use crate::metrics::{record_job, record_queue_counts, JobOutcome};
use crate::pipeline::MediaJobProcessor;
use crate::profile_image::CollaboratorImageProcessor;

/// Most deliveries taken per consume or claim call.
const MAX_BATCH: usize = 5;

/// Pulls jobs from the queue and runs them on a bounded pool.
pub struct JobExecutor {
    config: WorkerConfig,
    queue: Arc<dyn JobQueue>,
    ctx: Arc<ProcessingContext>,
    job_semaphore: Arc<Semaphore>,
    shutdown: watch::Sender<bool>,
    consumer_name: String,
}

impl JobExecutor {
    pub fn new(config: WorkerConfig, queue: Arc<dyn JobQueue>, ctx: Arc<ProcessingContext>) -> Self {
        let job_semaphore = Arc::new(Semaphore::new(config.max_concurrent_jobs));
        let (shutdown, _) = watch::channel(false);
        let consumer_name = format!("worker-{}", Uuid::new_v4());

        Self {
            config,
            queue,
            ctx,
            job_semaphore,
            shutdown,
            consumer_name,
        }
    }

    pub fn consumer_name(&self) -> &str {
        &self.consumer_name
    }

    /// Run until [`JobExecutor::shutdown`] is called.
    pub async fn run(&self) -> WorkerResult<()> {
        info!(
            "Starting job executor '{}' with {} max concurrent jobs",
            self.consumer_name, self.config.max_concurrent_jobs
        );

        let claim_task = self.spawn_claim_task();
        let promote_task = self.spawn_promote_task();
        let mut shutdown_rx = self.shutdown.subscribe();

        loop {
            tokio::select! {
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("Shutdown signal received, stopping executor");
                        break;
                    }
                }
                result = self.consume_jobs() => {
                    if let Err(e) = result {
                        error!("Error consuming jobs: {}", e);
                        tokio::time::sleep(Duration::from_secs(5)).await;
                    }
                }
            }
        }

        claim_task.abort();
        promote_task.abort();

        info!("Waiting for in-flight jobs to complete...");
        if tokio::time::timeout(self.config.shutdown_timeout, self.wait_for_jobs())
            .await
            .is_err()
        {
            // Unsettled deliveries are reclaimed by another worker
            warn!(
                "In-flight jobs still running after {:?}, exiting anyway",
                self.config.shutdown_timeout
            );
        }

        info!("Job executor stopped");
        Ok(())
    }

    /// Signal shutdown.
    pub fn shutdown(&self) {
        let _ = self.shutdown.send(true);
    }

    async fn consume_jobs(&self) -> WorkerResult<()> {
        let available = self.job_semaphore.available_permits();
        if available == 0 {
            tokio::time::sleep(Duration::from_millis(100)).await;
            return Ok(());
        }

        let deliveries = self
            .queue
            .consume(&self.consumer_name, self.config.poll_block, available.min(MAX_BATCH))
            .await?;
        if deliveries.is_empty() {
            return Ok(());
        }

        debug!("Consumed {} jobs from queue", deliveries.len());
        for delivery in deliveries {
            let permit = self
                .job_semaphore
                .clone()
                .acquire_owned()
                .await
                .map_err(|_| WorkerError::job_failed("Semaphore closed"))?;
            let ctx = Arc::clone(&self.ctx);
            let queue = Arc::clone(&self.queue);
            let limits = JobLimits::from_config(&self.config);

            tokio::spawn(async move {
                let _permit = permit;
                execute_job(ctx, queue, delivery, limits).await;
            });
        }
        Ok(())
    }

    fn spawn_claim_task(&self) -> tokio::task::JoinHandle<()> {
        let queue = Arc::clone(&self.queue);
        let ctx = Arc::clone(&self.ctx);
        let semaphore = Arc::clone(&self.job_semaphore);
        let consumer_name = self.consumer_name.clone();
        let mut shutdown_rx = self.shutdown.subscribe();
        let interval = self.config.claim_interval;
        let min_idle = self.config.claim_min_idle;
        let limits = JobLimits::from_config(&self.config);

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = shutdown_rx.changed() => {
                        if *shutdown_rx.borrow() {
                            break;
                        }
                    }
                    _ = ticker.tick() => {
                        let count = semaphore.available_permits().min(MAX_BATCH);
                        if count == 0 {
                            continue;
                        }
                        match queue.claim_stalled(&consumer_name, min_idle, count).await {
                            Ok(deliveries) if !deliveries.is_empty() => {
                                info!("Claimed {} stalled jobs", deliveries.len());
                                for delivery in deliveries {
                                    let Ok(permit) = semaphore.clone().acquire_owned().await else {
                                        break;
                                    };
                                    let ctx = Arc::clone(&ctx);
                                    let queue = Arc::clone(&queue);
                                    tokio::spawn(async move {
                                        let _permit = permit;
                                        execute_job(ctx, queue, delivery, limits).await;
                                    });
                                }
                            }
                            Ok(_) => {}
                            Err(e) => warn!("Failed to claim stalled jobs: {}", e),
                        }
                    }
                }
            }
        })
    }

    /// Move due retries back to waiting and publish queue depth.
    fn spawn_promote_task(&self) -> tokio::task::JoinHandle<()> {
        let queue = Arc::clone(&self.queue);
        let mut shutdown_rx = self.shutdown.subscribe();
        let interval = self.config.promote_interval;

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = shutdown_rx.changed() => {
                        if *shutdown_rx.borrow() {
                            break;
                        }
                    }
                    _ = ticker.tick() => {
                        match queue.promote_delayed().await {
                            Ok(0) => {}
                            Ok(n) => debug!("Promoted {} delayed jobs", n),
                            Err(e) => warn!("Failed to promote delayed jobs: {}", e),
                        }
                        if let Ok(counts) = queue.counts().await {
                            record_queue_counts(&counts);
                        }
                    }
                }
            }
        })
    }

    async fn wait_for_jobs(&self) {
        loop {
            let available = self.job_semaphore.available_permits();
            if available == self.config.max_concurrent_jobs {
                break;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }
}

/// Time limits applied to every delivery.
#[derive(Debug, Clone, Copy)]
struct JobLimits {
    timeout: Duration,
    heartbeat: Duration,
}

impl JobLimits {
    fn from_config(config: &WorkerConfig) -> Self {
        Self {
            timeout: config.job_timeout,
            heartbeat: config.job_heartbeat_interval,
        }
    }
}

/// Refresh ownership of `delivery` until another consumer takes it over.
async fn hold_ownership(queue: &dyn JobQueue, delivery: &Delivery, period: Duration) {
    let period = period.max(Duration::from_millis(1));
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
    loop {
        ticker.tick().await;
        match queue.heartbeat(delivery).await {
            Ok(true) => {}
            Ok(false) => return,
            // A missed beat only shortens the claim window
            Err(e) => warn!(job_id = %delivery.job_id(), "Heartbeat failed: {}", e),
        }
    }
}

/// Run one delivery and settle it with the queue.
///
/// The job is abandoned without settling once the delivery is claimed by
/// another consumer; the new owner decides the outcome.
async fn execute_job(
    ctx: Arc<ProcessingContext>,
    queue: Arc<dyn JobQueue>,
    delivery: Delivery,
    limits: JobLimits,
) {
    let JobLimits { timeout, heartbeat } = limits;
    let logger = JobLogger::new(delivery.job_id(), delivery.kind());
    let kind = delivery.kind().as_str();
    let started = Instant::now();

    let job = match delivery.envelope.decode() {
        Ok(job) => job,
        Err(e) => {
            // Retrying cannot fix a bad payload
            logger.log_error(&format!("Malformed job, parking it: {}", e));
            if let Err(qe) = queue.dead_letter(&delivery, &e.to_string()).await {
                error!(job_id = %logger.job_id(), "Failed to park malformed job: {}", qe);
            }
            record_job(kind, JobOutcome::DeadLettered, started.elapsed());
            return;
        }
    };

    let span = logger.create_span();
    let run = async {
        logger.log_start(&job.subject(), delivery.envelope.current_attempt());
        match tokio::time::timeout(timeout, process_job(&ctx, &job)).await {
            Ok(result) => result,
            Err(_) => Err(WorkerError::Timeout(timeout.as_secs())),
        }
    }
    .instrument(span);

    let result = tokio::select! {
        result = run => result,
        _ = hold_ownership(queue.as_ref(), &delivery, heartbeat) => {
            logger.log_warning("Job was claimed by another worker, abandoning this attempt");
            record_job(kind, JobOutcome::Superseded, started.elapsed());
            return;
        }
    };

    match result {
        Ok(summary) => match queue.ack(&delivery).await {
            Ok(()) => {
                logger.log_completion(&summary);
                record_job(kind, JobOutcome::Completed, started.elapsed());
            }
            Err(QueueError::DeliveryLost(_)) => {
                logger.log_warning("Finished after another worker took over, result left to the new owner");
                record_job(kind, JobOutcome::Superseded, started.elapsed());
            }
            Err(e) => {
                error!(job_id = %logger.job_id(), "Failed to ack job: {}", e);
                record_job(kind, JobOutcome::Completed, started.elapsed());
            }
        },
        Err(e) => {
            let message = e.to_string();
            if !e.is_retryable() {
                logger.log_warning("Failure looks permanent; later attempts will likely fail too");
            }
            match queue.fail(&delivery, &message).await {
                Ok(FailOutcome::Retrying { attempt, delay }) => {
                    logger.log_warning(&format!(
                        "Attempt {} failed, retrying in {:?}: {}",
                        attempt, delay, message
                    ));
                    record_job(kind, JobOutcome::Retrying, started.elapsed());
                }
                Ok(FailOutcome::Failed { attempts }) => {
                    logger.log_error(&format!("Failed after {} attempts: {}", attempts, message));
                    record_job(kind, JobOutcome::Failed, started.elapsed());
                }
                Err(QueueError::DeliveryLost(_)) => {
                    logger.log_warning(&format!(
                        "Attempt failed after another worker took over, not recording it: {}",
                        message
                    ));
                    record_job(kind, JobOutcome::Superseded, started.elapsed());
                }
                Err(qe) => {
                    error!(job_id = %logger.job_id(), "Failed to record job failure ({}): {}", message, qe);
                }
            }
        }
    }
}

/// Dispatch by kind, returning a one-line summary.
pub async fn process_job(ctx: &ProcessingContext, job: &QueueJob) -> WorkerResult<String> {
    match job {
        QueueJob::TranscribeMedia(payload) | QueueJob::ProcessMedia(payload) => {
            let report = MediaJobProcessor::new(ctx).process(payload).await?;
            Ok(format!("media {} stored at {}", payload.media_id, report.public_url))
        }
        QueueJob::ProcessProfileImage(payload) => {
            let report = CollaboratorImageProcessor::new(ctx).process(payload).await?;
            Ok(format!(
                "profile image {} stored, {} posts patched",
                report.public_url, report.posts_patched
            ))
        }
    }
}

#[cfg(test)]
mod tests {
    use mvault_models::{
        BackoffPolicy, JobOptions, MediaId, MediaType, PostId, ProcessMediaPayload,
        ProfileImagePayload,
    };
    use mvault_queue::MemoryJobQueue;
    use tempfile::TempDir;

    use super::*;
    use crate::testing::Harness;

    fn media_job() -> QueueJob {
        QueueJob::ProcessMedia(ProcessMediaPayload {
            post_id: PostId::from("p1"),
            media_id: MediaId::from("m1"),
            url: "https://cdn.example.com/v.mp4".to_string(),
            media_type: MediaType::Video,
            username: "alice".to_string(),
        })
    }

    fn fast_config(harness: &Harness) -> WorkerConfig {
        WorkerConfig {
            poll_block: Duration::from_millis(20),
            promote_interval: Duration::from_millis(10),
            shutdown_timeout: Duration::from_secs(5),
            ..harness.ctx.config.clone()
        }
    }

    fn test_limits(heartbeat: Duration) -> JobLimits {
        JobLimits {
            timeout: Duration::from_secs(5),
            heartbeat,
        }
    }

    /// Consume as a worker that stalls, then claim as a rescuer.
    async fn stale_and_claimed(queue: &Arc<dyn JobQueue>) -> (Delivery, Delivery) {
        queue.enqueue(media_job(), JobOptions::new(3, BackoffPolicy::fixed(0))).await.unwrap();
        let stale = queue
            .consume("stalled-worker", Duration::from_millis(10), 1)
            .await
            .unwrap()
            .remove(0);
        let claimed = queue
            .claim_stalled("rescuer", Duration::ZERO, 1)
            .await
            .unwrap()
            .remove(0);
        (stale, claimed)
    }

    async fn wait_until<F, Fut>(mut check: F)
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = bool>,
    {
        for _ in 0..200 {
            if check().await {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached");
    }

    #[tokio::test]
    async fn test_executor_completes_jobs_and_shuts_down() {
        let tmp = TempDir::new().unwrap();
        let harness = Harness::new(tmp.path());
        let queue = Arc::new(MemoryJobQueue::new());
        queue.enqueue(media_job(), JobOptions::default()).await.unwrap();
        queue
            .enqueue(
                QueueJob::ProcessProfileImage(ProfileImagePayload {
                    username: "bob".to_string(),
                    url: "https://cdn.example.com/bob.jpg".to_string(),
                    context_username: "alice".to_string(),
                }),
                JobOptions::default(),
            )
            .await
            .unwrap();

        let executor = Arc::new(JobExecutor::new(
            fast_config(&harness),
            queue.clone(),
            Arc::new(harness.ctx.clone()),
        ));
        let runner = tokio::spawn({
            let executor = Arc::clone(&executor);
            async move { executor.run().await }
        });

        let q = &queue;
        wait_until(move || async move { q.counts().await.unwrap().completed == 2 }).await;
        executor.shutdown();
        runner.await.unwrap().unwrap();

        assert_eq!(harness.store.transcript_count(), 1);
    }

    #[tokio::test]
    async fn test_failed_job_is_retried_then_parked() {
        let tmp = TempDir::new().unwrap();
        let harness = Harness::new(tmp.path());
        harness.transcoder.fail_optimize.store(true, std::sync::atomic::Ordering::SeqCst);
        let queue = Arc::new(MemoryJobQueue::new());
        let job_id = queue
            .enqueue(media_job(), JobOptions::new(2, BackoffPolicy::fixed(10)))
            .await
            .unwrap();

        let executor = Arc::new(JobExecutor::new(
            fast_config(&harness),
            queue.clone(),
            Arc::new(harness.ctx.clone()),
        ));
        let runner = tokio::spawn({
            let executor = Arc::clone(&executor);
            async move { executor.run().await }
        });

        let q = &queue;
        wait_until(move || async move { q.counts().await.unwrap().failed == 1 }).await;
        executor.shutdown();
        runner.await.unwrap().unwrap();

        let failed = queue.list_failed(10).await.unwrap();
        assert_eq!(failed[0].id, job_id);
        assert_eq!(failed[0].attempts_made, 2);
        assert!(failed[0].last_error.as_deref().unwrap().contains("optimize"));
        // Second attempt resumed from the work directory
        assert_eq!(harness.fetcher.calls.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_malformed_payload_is_parked_without_retry() {
        let tmp = TempDir::new().unwrap();
        let harness = Harness::new(tmp.path());
        let queue: Arc<dyn JobQueue> = Arc::new(MemoryJobQueue::new());
        queue.enqueue(media_job(), JobOptions::default()).await.unwrap();

        let mut delivery = queue
            .consume("test", Duration::from_millis(10), 1)
            .await
            .unwrap()
            .remove(0);
        delivery.envelope.payload = serde_json::json!({ "postId": "p1" });

        execute_job(
            Arc::new(harness.ctx.clone()),
            Arc::clone(&queue),
            delivery,
            test_limits(Duration::from_secs(30)),
        )
        .await;

        let failed = queue.list_failed(10).await.unwrap();
        assert_eq!(failed.len(), 1);
        assert!(failed[0].last_error.as_deref().unwrap().contains("Malformed"));
        assert_eq!(harness.fetcher.calls.load(std::sync::atomic::Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_failure_of_superseded_delivery_does_not_schedule_rerun() {
        let tmp = TempDir::new().unwrap();
        let harness = Harness::new(tmp.path());
        harness.transcoder.fail_optimize.store(true, std::sync::atomic::Ordering::SeqCst);
        let queue: Arc<dyn JobQueue> = Arc::new(MemoryJobQueue::new());
        let (stale, claimed) = stale_and_claimed(&queue).await;

        execute_job(
            Arc::new(harness.ctx.clone()),
            Arc::clone(&queue),
            stale,
            test_limits(Duration::from_secs(30)),
        )
        .await;

        let counts = queue.counts().await.unwrap();
        assert_eq!(counts.delayed, 0);
        assert_eq!(counts.failed, 0);
        assert_eq!(queue.promote_delayed().await.unwrap(), 0);

        // The rescuer still owns the job and settles it
        queue.ack(&claimed).await.unwrap();
        let counts = queue.counts().await.unwrap();
        assert_eq!(counts.completed, 1);
        assert_eq!(counts.delayed, 0);
        assert!(queue
            .consume("other", Duration::from_millis(10), 1)
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_stalled_job_is_abandoned_once_claimed_elsewhere() {
        let tmp = TempDir::new().unwrap();
        let harness = Harness::new(tmp.path());
        harness.transcoder.stall_optimize.store(true, std::sync::atomic::Ordering::SeqCst);
        let queue: Arc<dyn JobQueue> = Arc::new(MemoryJobQueue::new());
        let (stale, claimed) = stale_and_claimed(&queue).await;

        tokio::time::timeout(
            Duration::from_secs(2),
            execute_job(
                Arc::new(harness.ctx.clone()),
                Arc::clone(&queue),
                stale,
                test_limits(Duration::from_millis(10)),
            ),
        )
        .await
        .expect("superseded job kept running");

        let counts = queue.counts().await.unwrap();
        assert_eq!(counts.delayed, 0);
        assert_eq!(counts.failed, 0);
        assert!(queue.heartbeat(&claimed).await.unwrap());
    }

    #[tokio::test]
    async fn test_heartbeat_keeps_long_job_owned() {
        let tmp = TempDir::new().unwrap();
        let harness = Harness::new(tmp.path());
        let queue: Arc<dyn JobQueue> = Arc::new(MemoryJobQueue::new());
        queue.enqueue(media_job(), JobOptions::default()).await.unwrap();
        let delivery = queue
            .consume("busy-worker", Duration::from_millis(10), 1)
            .await
            .unwrap()
            .remove(0);

        let holder = tokio::spawn({
            let queue = Arc::clone(&queue);
            let delivery = delivery.clone();
            async move { hold_ownership(queue.as_ref(), &delivery, Duration::from_millis(10)).await }
        });
        tokio::time::sleep(Duration::from_millis(120)).await;

        let claimed = queue
            .claim_stalled("rescuer", Duration::from_millis(60), 1)
            .await
            .unwrap();
        assert!(claimed.is_empty());
        holder.abort();

        execute_job(
            Arc::new(harness.ctx.clone()),
            Arc::clone(&queue),
            delivery,
            test_limits(Duration::from_millis(10)),
        )
        .await;
        assert_eq!(queue.counts().await.unwrap().completed, 1);
    }
}
