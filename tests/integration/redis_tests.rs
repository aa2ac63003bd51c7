//! Redis queue integration tests.

use std::time::Duration;

use mvault_models::{BackoffPolicy, JobOptions, MediaId, MediaType, PostId, ProcessMediaPayload};
use mvault_queue::{FailOutcome, JobQueue, QueueConfig, QueueError, QueueJob, RedisJobQueue};

async fn test_queue() -> RedisJobQueue {
    dotenvy::dotenv().ok();
    let config = QueueConfig {
        prefix: format!("mvault-test-{}", uuid::Uuid::new_v4().simple()),
        ..QueueConfig::from_env()
    };
    let queue = RedisJobQueue::new(config).expect("Failed to create queue");
    queue.init().await.expect("Failed to initialize queue");
    queue
}

fn media_job(media_id: &str) -> QueueJob {
    QueueJob::ProcessMedia(ProcessMediaPayload {
        post_id: PostId::from("p1"),
        media_id: MediaId::from(media_id),
        url: "https://cdn.example.com/v.mp4".to_string(),
        media_type: MediaType::Video,
        username: "alice".to_string(),
    })
}

#[tokio::test]
#[ignore = "requires Redis"]
async fn test_enqueue_consume_ack() {
    let queue = test_queue().await;

    let job_id = queue
        .enqueue(media_job("m1"), JobOptions::default())
        .await
        .expect("Failed to enqueue");

    let deliveries = queue
        .consume("test-consumer", Duration::from_millis(500), 1)
        .await
        .expect("Failed to consume");
    assert_eq!(deliveries.len(), 1);
    assert_eq!(deliveries[0].job_id(), &job_id);
    assert_eq!(deliveries[0].envelope.decode().unwrap(), media_job("m1"));

    queue.ack(&deliveries[0]).await.expect("Failed to ack");
    let counts = queue.counts().await.unwrap();
    assert_eq!(counts.completed, 1);
    assert_eq!(counts.waiting, 0);
}

#[tokio::test]
#[ignore = "requires Redis"]
async fn test_failure_backoff_then_failed_set_and_retry() {
    let queue = test_queue().await;
    let job_id = queue
        .enqueue(media_job("m2"), JobOptions::new(2, BackoffPolicy::fixed(50)))
        .await
        .unwrap();

    let first = queue
        .consume("c1", Duration::from_millis(500), 1)
        .await
        .unwrap()
        .remove(0);
    let outcome = queue.fail(&first, "fetch returned 503").await.unwrap();
    assert!(matches!(outcome, FailOutcome::Retrying { attempt: 1, .. }));

    // Not visible until the backoff elapses and it is promoted
    assert!(queue
        .consume("c1", Duration::from_millis(10), 1)
        .await
        .unwrap()
        .is_empty());
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(queue.promote_delayed().await.unwrap(), 1);

    let second = queue
        .consume("c1", Duration::from_millis(500), 1)
        .await
        .unwrap()
        .remove(0);
    assert_eq!(second.envelope.attempts_made, 1);
    let outcome = queue.fail(&second, "fetch returned 503 again").await.unwrap();
    assert_eq!(outcome, FailOutcome::Failed { attempts: 2 });

    let failed = queue.list_failed(10).await.unwrap();
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].id, job_id);
    assert_eq!(failed[0].last_error.as_deref(), Some("fetch returned 503 again"));

    queue.retry(&job_id).await.unwrap();
    let counts = queue.counts().await.unwrap();
    assert_eq!(counts.failed, 0);
    assert_eq!(counts.waiting, 1);
}

#[tokio::test]
#[ignore = "requires Redis"]
async fn test_stalled_delivery_is_claimed_by_another_consumer() {
    let queue = test_queue().await;
    queue.enqueue(media_job("m3"), JobOptions::default()).await.unwrap();

    let abandoned = queue
        .consume("crashed-worker", Duration::from_millis(500), 1)
        .await
        .unwrap()
        .remove(0);
    tokio::time::sleep(Duration::from_millis(50)).await;

    let claimed = queue
        .claim_stalled("rescuer", Duration::from_millis(10), 5)
        .await
        .unwrap();
    assert_eq!(claimed.len(), 1);
    assert_eq!(claimed[0].job_id(), abandoned.job_id());

    queue.ack(&claimed[0]).await.unwrap();
    assert_eq!(queue.counts().await.unwrap().completed, 1);
}

#[tokio::test]
#[ignore = "requires Redis"]
async fn test_superseded_delivery_cannot_settle() {
    let queue = test_queue().await;
    queue
        .enqueue(media_job("m5"), JobOptions::new(3, BackoffPolicy::fixed(0)))
        .await
        .unwrap();

    let stale = queue
        .consume("slow-worker", Duration::from_millis(500), 1)
        .await
        .unwrap()
        .remove(0);
    tokio::time::sleep(Duration::from_millis(50)).await;
    let claimed = queue
        .claim_stalled("rescuer", Duration::from_millis(10), 1)
        .await
        .unwrap()
        .remove(0);
    assert_eq!(claimed.consumer, "rescuer");

    // The slow worker fails while the rescuer still runs the job
    let err = queue.fail(&stale, "late failure").await.unwrap_err();
    assert!(matches!(err, QueueError::DeliveryLost(_)));

    queue.ack(&claimed).await.unwrap();

    // And again after the job is settled
    let err = queue.fail(&stale, "late failure").await.unwrap_err();
    assert!(matches!(err, QueueError::DeliveryLost(_)));
    assert!(matches!(
        queue.ack(&stale).await,
        Err(QueueError::DeliveryLost(_))
    ));

    let counts = queue.counts().await.unwrap();
    assert_eq!(counts.delayed, 0);
    assert_eq!(counts.failed, 0);
    assert_eq!(counts.completed, 1);
    assert_eq!(queue.promote_delayed().await.unwrap(), 0);
    assert!(queue
        .consume("other", Duration::from_millis(100), 1)
        .await
        .unwrap()
        .is_empty());

    let record = queue.get(claimed.job_id()).await.unwrap().unwrap();
    assert!(record.last_error.is_none());
}

#[tokio::test]
#[ignore = "requires Redis"]
async fn test_heartbeat_defers_claim_until_ownership_moves() {
    let queue = test_queue().await;
    queue.enqueue(media_job("m6"), JobOptions::default()).await.unwrap();

    let delivery = queue
        .consume("busy-worker", Duration::from_millis(500), 1)
        .await
        .unwrap()
        .remove(0);
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert!(queue.heartbeat(&delivery).await.unwrap());

    let claimed = queue
        .claim_stalled("rescuer", Duration::from_millis(100), 1)
        .await
        .unwrap();
    assert!(claimed.is_empty());

    tokio::time::sleep(Duration::from_millis(150)).await;
    let claimed = queue
        .claim_stalled("rescuer", Duration::from_millis(100), 1)
        .await
        .unwrap();
    assert_eq!(claimed.len(), 1);
    assert!(!queue.heartbeat(&delivery).await.unwrap());
    assert!(queue.heartbeat(&claimed[0]).await.unwrap());
}

#[tokio::test]
#[ignore = "requires Redis"]
async fn test_dead_letter_skips_remaining_attempts() {
    let queue = test_queue().await;
    queue.enqueue(media_job("m4"), JobOptions::default()).await.unwrap();

    let delivery = queue
        .consume("c1", Duration::from_millis(500), 1)
        .await
        .unwrap()
        .remove(0);
    queue.dead_letter(&delivery, "malformed payload").await.unwrap();

    let failed = queue.list_failed(10).await.unwrap();
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].attempts_made, 1);
    assert_eq!(queue.retry_all_failed().await.unwrap(), 1);
}
