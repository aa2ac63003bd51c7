//! In-process job queue.
//!
//! Same semantics as the Redis queue (at-least-once delivery, backoff,
//! failed set) without persistence. Used by tests and by single-process
//! deployments with `QUEUE_BACKEND=memory`.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use mvault_models::{JobId, JobOptions, JobStatus};

use crate::error::{QueueError, QueueResult};
use crate::job::{Delivery, FailOutcome, JobEnvelope, QueueCounts, QueueJob};
use crate::queue::JobQueue;

#[derive(Default)]
struct State {
    jobs: HashMap<JobId, JobEnvelope>,
    waiting: VecDeque<JobId>,
    /// receipt -> (job, delivered at)
    active: HashMap<String, (JobId, Instant)>,
    delayed: Vec<(Instant, JobId)>,
    /// Oldest first.
    failed: Vec<JobId>,
    completed: u64,
}

/// In-memory job queue.
#[derive(Default)]
pub struct MemoryJobQueue {
    state: Mutex<State>,
    ready: Notify,
    next_receipt: AtomicU64,
}

impl MemoryJobQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        // A poisoned lock only means another task panicked mid-update;
        // the state itself stays structurally valid.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn receipt(&self, job_id: &JobId) -> String {
        let n = self.next_receipt.fetch_add(1, Ordering::Relaxed);
        format!("{}#{}", job_id, n)
    }

    fn take_ready(&self, consumer: &str, count: usize) -> Vec<Delivery> {
        let mut state = self.lock();
        let mut deliveries = Vec::new();

        while deliveries.len() < count {
            let Some(job_id) = state.waiting.pop_front() else {
                break;
            };
            let receipt = self.receipt(&job_id);
            let Some(envelope) = state.jobs.get_mut(&job_id) else {
                continue;
            };
            envelope.status = JobStatus::Active;
            let envelope = envelope.clone();
            state.active.insert(receipt.clone(), (job_id, Instant::now()));
            deliveries.push(Delivery {
                envelope,
                receipt,
                consumer: consumer.to_string(),
            });
        }
        deliveries
    }

    /// Remove an active delivery, returning the stored record.
    ///
    /// A receipt superseded by a claim is rejected without touching the job.
    fn settle(state: &mut State, delivery: &Delivery) -> QueueResult<JobEnvelope> {
        if state.active.remove(&delivery.receipt).is_none() {
            return Err(QueueError::delivery_lost(delivery.job_id().as_str()));
        }
        state
            .jobs
            .get(delivery.job_id())
            .cloned()
            .ok_or_else(|| QueueError::job_not_found(delivery.job_id().as_str()))
    }
}

#[async_trait]
impl JobQueue for MemoryJobQueue {
    async fn enqueue(&self, job: QueueJob, options: JobOptions) -> QueueResult<JobId> {
        let envelope = JobEnvelope::new(&job, options)?;
        let job_id = envelope.id.clone();
        {
            let mut state = self.lock();
            state.jobs.insert(job_id.clone(), envelope);
            state.waiting.push_back(job_id.clone());
        }
        self.ready.notify_waiters();
        debug!(job_id = %job_id, "Enqueued {}", job.subject());
        Ok(job_id)
    }

    async fn consume(&self, consumer: &str, block: Duration, count: usize) -> QueueResult<Vec<Delivery>> {
        let count = count.max(1);
        let deadline = Instant::now() + block;

        loop {
            let notified = self.ready.notified();
            let deliveries = self.take_ready(consumer, count);
            if !deliveries.is_empty() {
                return Ok(deliveries);
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(Vec::new());
            }
        }
    }

    async fn ack(&self, delivery: &Delivery) -> QueueResult<()> {
        let mut state = self.lock();
        Self::settle(&mut state, delivery)?;
        if let Some(envelope) = state.jobs.get_mut(delivery.job_id()) {
            envelope.status = JobStatus::Completed;
            envelope.finished_at = Some(Utc::now());
        }
        state.completed += 1;
        Ok(())
    }

    async fn fail(&self, delivery: &Delivery, error: &str) -> QueueResult<FailOutcome> {
        let mut state = self.lock();
        let mut envelope = Self::settle(&mut state, delivery)?;
        let outcome = envelope.record_failure(error);

        match outcome {
            FailOutcome::Retrying { attempt, delay } => {
                state.delayed.push((Instant::now() + delay, envelope.id.clone()));
                debug!(job_id = %envelope.id, attempt, "Scheduled retry");
            }
            FailOutcome::Failed { attempts } => {
                state.failed.push(envelope.id.clone());
                warn!(job_id = %envelope.id, attempts, "Moved job to failed set: {}", error);
            }
        }
        state.jobs.insert(envelope.id.clone(), envelope);
        Ok(outcome)
    }

    async fn dead_letter(&self, delivery: &Delivery, error: &str) -> QueueResult<()> {
        let mut state = self.lock();
        let mut envelope = Self::settle(&mut state, delivery)?;
        envelope.mark_dead(error);
        state.failed.push(envelope.id.clone());
        state.jobs.insert(envelope.id.clone(), envelope);
        Ok(())
    }

    async fn claim_stalled(
        &self,
        consumer: &str,
        min_idle: Duration,
        count: usize,
    ) -> QueueResult<Vec<Delivery>> {
        let mut state = self.lock();
        let now = Instant::now();

        let stalled: Vec<String> = state
            .active
            .iter()
            .filter(|(_, (_, since))| now.duration_since(*since) >= min_idle)
            .map(|(receipt, _)| receipt.clone())
            .take(count)
            .collect();

        let mut deliveries = Vec::with_capacity(stalled.len());
        for old_receipt in stalled {
            let Some((job_id, _)) = state.active.remove(&old_receipt) else {
                continue;
            };
            let Some(envelope) = state.jobs.get(&job_id).cloned() else {
                continue;
            };
            let receipt = self.receipt(&job_id);
            state.active.insert(receipt.clone(), (job_id.clone(), now));
            info!(job_id = %job_id, "Claimed stalled job");
            deliveries.push(Delivery {
                envelope,
                receipt,
                consumer: consumer.to_string(),
            });
        }
        Ok(deliveries)
    }

    async fn heartbeat(&self, delivery: &Delivery) -> QueueResult<bool> {
        let mut state = self.lock();
        match state.active.get_mut(&delivery.receipt) {
            Some((_, since)) => {
                *since = Instant::now();
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn promote_delayed(&self) -> QueueResult<usize> {
        let promoted = {
            let mut state = self.lock();
            let now = Instant::now();
            let (due, pending): (Vec<_>, Vec<_>) =
                state.delayed.drain(..).partition(|(at, _)| *at <= now);
            state.delayed = pending;

            for (_, job_id) in &due {
                if let Some(envelope) = state.jobs.get_mut(job_id) {
                    envelope.status = JobStatus::Waiting;
                }
                state.waiting.push_back(job_id.clone());
            }
            due.len()
        };

        if promoted > 0 {
            self.ready.notify_waiters();
        }
        Ok(promoted)
    }

    async fn get(&self, job_id: &JobId) -> QueueResult<Option<JobEnvelope>> {
        Ok(self.lock().jobs.get(job_id).cloned())
    }

    async fn list_failed(&self, limit: usize) -> QueueResult<Vec<JobEnvelope>> {
        let state = self.lock();
        Ok(state
            .failed
            .iter()
            .rev()
            .take(limit)
            .filter_map(|id| state.jobs.get(id).cloned())
            .collect())
    }

    async fn retry(&self, job_id: &JobId) -> QueueResult<()> {
        {
            let mut state = self.lock();
            let Some(pos) = state.failed.iter().position(|id| id == job_id) else {
                return match state.jobs.get(job_id) {
                    Some(envelope) => Err(QueueError::InvalidState {
                        job_id: job_id.to_string(),
                        expected: JobStatus::Failed.as_str(),
                        actual: envelope.status.as_str(),
                    }),
                    None => Err(QueueError::job_not_found(job_id.as_str())),
                };
            };
            state.failed.remove(pos);
            if let Some(envelope) = state.jobs.get_mut(job_id) {
                envelope.reset_for_retry();
            }
            state.waiting.push_back(job_id.clone());
        }
        self.ready.notify_waiters();
        Ok(())
    }

    async fn retry_all_failed(&self) -> QueueResult<usize> {
        let retried = {
            let mut state = self.lock();
            let failed: Vec<JobId> = state.failed.drain(..).collect();
            for job_id in &failed {
                if let Some(envelope) = state.jobs.get_mut(job_id) {
                    envelope.reset_for_retry();
                }
                state.waiting.push_back(job_id.clone());
            }
            failed.len()
        };
        if retried > 0 {
            self.ready.notify_waiters();
        }
        Ok(retried)
    }

    async fn counts(&self) -> QueueResult<QueueCounts> {
        let state = self.lock();
        Ok(QueueCounts {
            waiting: state.waiting.len() as u64,
            active: state.active.len() as u64,
            delayed: state.delayed.len() as u64,
            completed: state.completed,
            failed: state.failed.len() as u64,
        })
    }
}
