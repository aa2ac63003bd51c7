//! Job queue using Redis Streams.
//!
//! Layout under the configured prefix:
//! - `<prefix>:jobs`: stream of ready job ids, read through a consumer group
//! - `<prefix>:job:<id>`: JSON job record
//! - `<prefix>:delayed`: sorted set of retries keyed by due time (ms)
//! - `<prefix>:failed`: sorted set of parked jobs keyed by failure time (ms)
//! - `<prefix>:stats:completed`: completed counter

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use redis::aio::MultiplexedConnection;
use redis::streams::{StreamClaimReply, StreamId, StreamPendingCountReply, StreamPendingReply, StreamReadReply};
use redis::AsyncCommands;
use tracing::{debug, info, warn};

use mvault_models::{JobId, JobOptions, JobStatus};

use crate::error::{QueueError, QueueResult};
use crate::job::{Delivery, FailOutcome, JobEnvelope, QueueCounts, QueueJob};
use crate::queue::{JobQueue, QueueConfig};

/// Max delayed jobs promoted per call.
const PROMOTE_BATCH: isize = 100;

/// Ack an entry and record its outcome, only while `consumer` still owns it.
///
/// KEYS: stream, job record, delayed/failed set or completed counter.
/// ARGV: group, entry id, consumer, record JSON, mode, score or TTL, job id.
const SETTLE_SCRIPT: &str = r#"
local owned = redis.call('XPENDING', KEYS[1], ARGV[1], ARGV[2], ARGV[2], 1, ARGV[3])
if #owned == 0 then
  return 0
end
redis.call('XACK', KEYS[1], ARGV[1], ARGV[2])
redis.call('XDEL', KEYS[1], ARGV[2])
if ARGV[5] == 'completed' then
  redis.call('SET', KEYS[2], ARGV[4], 'EX', ARGV[6])
  redis.call('INCR', KEYS[3])
else
  redis.call('SET', KEYS[2], ARGV[4])
  redis.call('ZADD', KEYS[3], ARGV[6], ARGV[7])
end
return 1
"#;

/// Reset the idle time of an entry still owned by `consumer`.
///
/// KEYS: stream. ARGV: group, entry id, consumer.
const HEARTBEAT_SCRIPT: &str = r#"
local owned = redis.call('XPENDING', KEYS[1], ARGV[1], ARGV[2], ARGV[2], 1, ARGV[3])
if #owned == 0 then
  return 0
end
redis.call('XCLAIM', KEYS[1], ARGV[1], ARGV[3], 0, ARGV[2], 'JUSTID')
return 1
"#;

/// Redis-backed job queue.
pub struct RedisJobQueue {
    client: redis::Client,
    config: QueueConfig,
    settle_script: redis::Script,
    heartbeat_script: redis::Script,
}

impl RedisJobQueue {
    /// Create a new job queue.
    pub fn new(config: QueueConfig) -> QueueResult<Self> {
        let client = redis::Client::open(config.redis_url.as_str())?;
        Ok(Self {
            client,
            config,
            settle_script: redis::Script::new(SETTLE_SCRIPT),
            heartbeat_script: redis::Script::new(HEARTBEAT_SCRIPT),
        })
    }

    /// Create from environment variables.
    pub fn from_env() -> QueueResult<Self> {
        Self::new(QueueConfig::from_env())
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    fn stream_key(&self) -> String {
        format!("{}:jobs", self.config.prefix)
    }

    fn group_name(&self) -> String {
        format!("{}:workers", self.config.prefix)
    }

    fn job_key(&self, job_id: &JobId) -> String {
        format!("{}:job:{}", self.config.prefix, job_id)
    }

    fn delayed_key(&self) -> String {
        format!("{}:delayed", self.config.prefix)
    }

    fn failed_key(&self) -> String {
        format!("{}:failed", self.config.prefix)
    }

    fn completed_key(&self) -> String {
        format!("{}:stats:completed", self.config.prefix)
    }

    async fn conn(&self) -> QueueResult<MultiplexedConnection> {
        self.client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| QueueError::connection_failed(e.to_string()))
    }

    /// Initialize the queue (create consumer group if not exists).
    pub async fn init(&self) -> QueueResult<()> {
        let mut conn = self.conn().await?;

        let result: Result<(), redis::RedisError> = redis::cmd("XGROUP")
            .arg("CREATE")
            .arg(self.stream_key())
            .arg(self.group_name())
            .arg("0")
            .arg("MKSTREAM")
            .query_async(&mut conn)
            .await;

        match result {
            Ok(_) => info!("Created consumer group: {}", self.group_name()),
            Err(e) if e.to_string().contains("BUSYGROUP") => {
                debug!("Consumer group already exists: {}", self.group_name());
            }
            Err(e) => return Err(QueueError::Redis(e)),
        }

        Ok(())
    }

    async fn load(&self, conn: &mut MultiplexedConnection, job_id: &JobId) -> QueueResult<Option<JobEnvelope>> {
        let raw: Option<String> = conn.get(self.job_key(job_id)).await?;
        match raw {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    async fn save(&self, conn: &mut MultiplexedConnection, envelope: &JobEnvelope) -> QueueResult<()> {
        let payload = serde_json::to_string(envelope)?;
        conn.set::<_, _, ()>(self.job_key(&envelope.id), payload).await?;
        Ok(())
    }

    async fn push_ready(&self, conn: &mut MultiplexedConnection, job_id: &JobId) -> QueueResult<String> {
        let message_id: String = redis::cmd("XADD")
            .arg(self.stream_key())
            .arg("*")
            .arg("job_id")
            .arg(job_id.as_str())
            .query_async(conn)
            .await?;
        Ok(message_id)
    }

    /// Ack and delete a stream entry and write the updated record, atomically.
    ///
    /// Fails with [`QueueError::DeliveryLost`] when the entry has been claimed
    /// by another consumer or already settled; nothing is written then.
    async fn settle(
        &self,
        conn: &mut MultiplexedConnection,
        delivery: &Delivery,
        envelope: &JobEnvelope,
        schedule: Settle,
    ) -> QueueResult<()> {
        let payload = serde_json::to_string(envelope)?;
        let (mode, target, score) = match schedule {
            Settle::Completed => (
                "completed",
                self.completed_key(),
                self.config.completed_ttl.as_secs().max(1) as i64,
            ),
            Settle::Delayed { due_ms } => ("delayed", self.delayed_key(), due_ms),
            Settle::Failed { failed_ms } => ("failed", self.failed_key(), failed_ms),
        };

        let mut invocation = self.settle_script.prepare_invoke();
        invocation
            .key(self.stream_key())
            .key(self.job_key(&envelope.id))
            .key(target)
            .arg(self.group_name())
            .arg(&delivery.receipt)
            .arg(&delivery.consumer)
            .arg(payload)
            .arg(mode)
            .arg(score)
            .arg(envelope.id.as_str());
        let settled: i64 = invocation.invoke_async(conn).await?;

        if settled == 0 {
            warn!(
                job_id = %envelope.id,
                consumer = %delivery.consumer,
                "Delivery no longer owned, outcome discarded"
            );
            return Err(QueueError::delivery_lost(envelope.id.as_str()));
        }
        Ok(())
    }

    async fn ack_raw(&self, conn: &mut MultiplexedConnection, receipt: &str) -> QueueResult<()> {
        redis::pipe()
            .atomic()
            .cmd("XACK")
            .arg(self.stream_key())
            .arg(self.group_name())
            .arg(receipt)
            .ignore()
            .cmd("XDEL")
            .arg(self.stream_key())
            .arg(receipt)
            .ignore()
            .query_async::<()>(conn)
            .await?;
        Ok(())
    }

    /// Resolve stream entries into deliveries, dropping entries whose record is gone.
    async fn to_deliveries(
        &self,
        conn: &mut MultiplexedConnection,
        consumer: &str,
        entries: Vec<StreamId>,
    ) -> QueueResult<Vec<Delivery>> {
        let mut deliveries = Vec::with_capacity(entries.len());

        for entry in entries {
            let receipt = entry.id.clone();
            let Some(job_id) = entry.get::<String>("job_id") else {
                warn!(receipt = %receipt, "Stream entry without job_id, dropping");
                self.ack_raw(conn, &receipt).await?;
                continue;
            };
            let job_id = JobId::from_string(job_id);

            let mut envelope = match self.load(conn, &job_id).await {
                Ok(Some(envelope)) => envelope,
                Ok(None) => {
                    warn!(job_id = %job_id, "Job record missing, dropping stream entry");
                    self.ack_raw(conn, &receipt).await?;
                    continue;
                }
                Err(QueueError::Json(e)) => {
                    warn!(job_id = %job_id, "Unreadable job record, dropping: {}", e);
                    self.ack_raw(conn, &receipt).await?;
                    continue;
                }
                Err(e) => return Err(e),
            };

            envelope.status = JobStatus::Active;
            self.save(conn, &envelope).await?;
            deliveries.push(Delivery {
                envelope,
                receipt,
                consumer: consumer.to_string(),
            });
        }

        Ok(deliveries)
    }
}

enum Settle {
    Completed,
    Delayed { due_ms: i64 },
    Failed { failed_ms: i64 },
}

#[async_trait]
impl JobQueue for RedisJobQueue {
    async fn enqueue(&self, job: QueueJob, options: JobOptions) -> QueueResult<JobId> {
        let mut conn = self.conn().await?;
        let envelope = JobEnvelope::new(&job, options)?;

        self.save(&mut conn, &envelope).await?;
        let message_id = self
            .push_ready(&mut conn, &envelope.id)
            .await
            .map_err(|e| QueueError::enqueue_failed(e.to_string()))?;

        info!(
            job_id = %envelope.id,
            kind = %envelope.kind,
            "Enqueued {} with message ID {}",
            job.subject(),
            message_id
        );
        Ok(envelope.id)
    }

    async fn consume(&self, consumer: &str, block: Duration, count: usize) -> QueueResult<Vec<Delivery>> {
        let mut conn = self.conn().await?;

        let reply: Option<StreamReadReply> = redis::cmd("XREADGROUP")
            .arg("GROUP")
            .arg(self.group_name())
            .arg(consumer)
            .arg("COUNT")
            .arg(count.max(1))
            .arg("BLOCK")
            .arg(block.as_millis() as u64)
            .arg("STREAMS")
            .arg(self.stream_key())
            .arg(">")
            .query_async(&mut conn)
            .await?;

        let entries: Vec<StreamId> = reply
            .map(|r| r.keys.into_iter().flat_map(|k| k.ids).collect())
            .unwrap_or_default();

        let deliveries = self.to_deliveries(&mut conn, consumer, entries).await?;
        for delivery in &deliveries {
            debug!(job_id = %delivery.job_id(), "Consumed job from stream");
        }
        Ok(deliveries)
    }

    async fn ack(&self, delivery: &Delivery) -> QueueResult<()> {
        let mut conn = self.conn().await?;
        let mut envelope = delivery.envelope.clone();
        envelope.status = JobStatus::Completed;
        envelope.finished_at = Some(Utc::now());
        self.settle(&mut conn, delivery, &envelope, Settle::Completed)
            .await?;
        debug!(job_id = %envelope.id, "Acknowledged job");
        Ok(())
    }

    async fn fail(&self, delivery: &Delivery, error: &str) -> QueueResult<FailOutcome> {
        let mut conn = self.conn().await?;
        let mut envelope = delivery.envelope.clone();
        let outcome = envelope.record_failure(error);

        let schedule = match outcome {
            FailOutcome::Retrying { delay, .. } => Settle::Delayed {
                due_ms: Utc::now().timestamp_millis() + delay.as_millis() as i64,
            },
            FailOutcome::Failed { .. } => Settle::Failed {
                failed_ms: Utc::now().timestamp_millis(),
            },
        };
        self.settle(&mut conn, delivery, &envelope, schedule)
            .await?;

        match outcome {
            FailOutcome::Retrying { attempt, delay } => info!(
                job_id = %envelope.id,
                attempt,
                delay_ms = delay.as_millis() as u64,
                "Scheduled retry"
            ),
            FailOutcome::Failed { attempts } => {
                warn!(job_id = %envelope.id, attempts, "Moved job to failed set: {}", error)
            }
        }
        Ok(outcome)
    }

    async fn dead_letter(&self, delivery: &Delivery, error: &str) -> QueueResult<()> {
        let mut conn = self.conn().await?;
        let mut envelope = delivery.envelope.clone();
        envelope.mark_dead(error);
        self.settle(
            &mut conn,
            delivery,
            &envelope,
            Settle::Failed {
                failed_ms: Utc::now().timestamp_millis(),
            },
        )
        .await?;
        warn!(job_id = %envelope.id, "Dead-lettered job: {}", error);
        Ok(())
    }

    async fn claim_stalled(
        &self,
        consumer: &str,
        min_idle: Duration,
        count: usize,
    ) -> QueueResult<Vec<Delivery>> {
        let mut conn = self.conn().await?;
        let min_idle_ms = min_idle.as_millis() as u64;

        let summary: StreamPendingReply = redis::cmd("XPENDING")
            .arg(self.stream_key())
            .arg(self.group_name())
            .query_async(&mut conn)
            .await?;
        if summary.count() == 0 {
            return Ok(Vec::new());
        }

        let pending: StreamPendingCountReply = redis::cmd("XPENDING")
            .arg(self.stream_key())
            .arg(self.group_name())
            .arg("IDLE")
            .arg(min_idle_ms)
            .arg("-")
            .arg("+")
            .arg(count.max(1))
            .query_async(&mut conn)
            .await?;
        if pending.ids.is_empty() {
            return Ok(Vec::new());
        }

        let mut cmd = redis::cmd("XCLAIM");
        cmd.arg(self.stream_key())
            .arg(self.group_name())
            .arg(consumer)
            .arg(min_idle_ms);
        for entry in &pending.ids {
            cmd.arg(&entry.id);
        }
        let claimed: StreamClaimReply = cmd.query_async(&mut conn).await?;

        let deliveries = self.to_deliveries(&mut conn, consumer, claimed.ids).await?;
        for delivery in &deliveries {
            info!(job_id = %delivery.job_id(), "Claimed stalled job");
        }
        Ok(deliveries)
    }

    async fn heartbeat(&self, delivery: &Delivery) -> QueueResult<bool> {
        let mut conn = self.conn().await?;
        let mut invocation = self.heartbeat_script.prepare_invoke();
        invocation
            .key(self.stream_key())
            .arg(self.group_name())
            .arg(&delivery.receipt)
            .arg(&delivery.consumer);
        let owned: i64 = invocation.invoke_async(&mut conn).await?;
        Ok(owned == 1)
    }

    async fn promote_delayed(&self) -> QueueResult<usize> {
        let mut conn = self.conn().await?;
        let now_ms = Utc::now().timestamp_millis();

        let due: Vec<String> = conn
            .zrangebyscore_limit(self.delayed_key(), "-inf", now_ms, 0, PROMOTE_BATCH)
            .await?;

        let mut promoted = 0;
        for job_id in due {
            // Only the caller that removes the entry re-queues it
            let removed: i64 = conn.zrem(self.delayed_key(), &job_id).await?;
            if removed == 0 {
                continue;
            }
            let job_id = JobId::from_string(job_id);
            if let Some(mut envelope) = self.load(&mut conn, &job_id).await? {
                envelope.status = JobStatus::Waiting;
                self.save(&mut conn, &envelope).await?;
                self.push_ready(&mut conn, &job_id).await?;
                promoted += 1;
            }
        }

        if promoted > 0 {
            debug!(promoted, "Promoted delayed jobs");
        }
        Ok(promoted)
    }

    async fn get(&self, job_id: &JobId) -> QueueResult<Option<JobEnvelope>> {
        let mut conn = self.conn().await?;
        self.load(&mut conn, job_id).await
    }

    async fn list_failed(&self, limit: usize) -> QueueResult<Vec<JobEnvelope>> {
        let mut conn = self.conn().await?;
        if limit == 0 {
            return Ok(Vec::new());
        }
        let ids: Vec<String> = conn
            .zrevrange(self.failed_key(), 0, limit as isize - 1)
            .await?;

        let mut jobs = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(envelope) = self.load(&mut conn, &JobId::from_string(id)).await? {
                jobs.push(envelope);
            }
        }
        Ok(jobs)
    }

    async fn retry(&self, job_id: &JobId) -> QueueResult<()> {
        let mut conn = self.conn().await?;

        let removed: i64 = conn.zrem(self.failed_key(), job_id.as_str()).await?;
        if removed == 0 {
            return match self.load(&mut conn, job_id).await? {
                Some(envelope) => Err(QueueError::InvalidState {
                    job_id: job_id.to_string(),
                    expected: JobStatus::Failed.as_str(),
                    actual: envelope.status.as_str(),
                }),
                None => Err(QueueError::job_not_found(job_id.as_str())),
            };
        }

        let mut envelope = self
            .load(&mut conn, job_id)
            .await?
            .ok_or_else(|| QueueError::job_not_found(job_id.as_str()))?;
        envelope.reset_for_retry();
        self.save(&mut conn, &envelope).await?;
        self.push_ready(&mut conn, job_id).await?;

        info!(job_id = %job_id, "Re-submitted failed job");
        Ok(())
    }

    async fn retry_all_failed(&self) -> QueueResult<usize> {
        let mut conn = self.conn().await?;
        let ids: Vec<String> = conn.zrange(self.failed_key(), 0, -1).await?;
        drop(conn);

        let mut retried = 0;
        for id in ids {
            match self.retry(&JobId::from_string(id.clone())).await {
                Ok(()) => retried += 1,
                Err(QueueError::JobNotFound(_)) | Err(QueueError::InvalidState { .. }) => {
                    debug!(job_id = %id, "Skipped job no longer in failed set");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(retried)
    }

    async fn counts(&self) -> QueueResult<QueueCounts> {
        let mut conn = self.conn().await?;

        let len: u64 = conn.xlen(self.stream_key()).await?;
        let pending: StreamPendingReply = redis::cmd("XPENDING")
            .arg(self.stream_key())
            .arg(self.group_name())
            .query_async(&mut conn)
            .await?;
        let active = pending.count() as u64;
        let delayed: u64 = conn.zcard(self.delayed_key()).await?;
        let failed: u64 = conn.zcard(self.failed_key()).await?;
        let completed: Option<u64> = conn.get(self.completed_key()).await?;

        Ok(QueueCounts {
            waiting: len.saturating_sub(active),
            active,
            delayed,
            completed: completed.unwrap_or(0),
            failed,
        })
    }
}
