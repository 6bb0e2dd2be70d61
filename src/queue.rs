//! At-least-once job queue for settlement, expiry and compensation work.
//!
//! Jobs live in a table owned by the queue, not by the request that enqueued
//! them, so a request finishing (or failing) after `enqueue` returns cannot
//! lose the job. A pool of workers claims ready jobs; a failed attempt is
//! rescheduled with backoff until the job's attempts run out, at which point
//! the handler's [`JobHandler::exhausted`] hook runs before the job is marked
//! failed.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::{Notify, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::Amount;
use crate::backend::{Availability, BackendError};
use crate::model::{RequesterId, ReservationId, ResourceId};

pub type JobId = u64;

/// Payload of a settlement attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SettlementJob {
    pub reservation_id: ReservationId,
    pub resource_id: ResourceId,
    pub requester_id: RequesterId,
    pub quantity: u32,
    pub amount: Amount,
    pub idempotency_key: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Job {
    /// Collect payment and confirm the reservation.
    Settle(SettlementJob),
    /// Cancel the reservation if it is still unsettled.
    Expire { reservation_id: ReservationId },
    /// Finish an interrupted cancellation.
    Compensate {
        reservation_id: ReservationId,
        reason: String,
    },
}

impl Job {
    pub fn reservation_id(&self) -> ReservationId {
        match self {
            Job::Settle(job) => job.reservation_id,
            Job::Expire { reservation_id } | Job::Compensate { reservation_id, .. } => {
                *reservation_id
            }
        }
    }

    fn name(&self) -> &'static str {
        match self {
            Job::Settle(_) => "settle",
            Job::Expire { .. } => "expire",
            Job::Compensate { .. } => "compensate",
        }
    }

    /// Expiry jobs sit in the queue for the whole reservation lifetime and do
    /// not hold up [`SettlementQueue::wait_settled`].
    fn blocks_settled(&self) -> bool {
        !matches!(self, Job::Expire { .. })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Backoff {
    Fixed(Duration),
    /// `base`, `2 * base`, `4 * base`, ... capped at `max`.
    Exponential { base: Duration, max: Duration },
}

impl Backoff {
    /// Delay before the retry that follows `failed_attempts` failures.
    pub fn delay(&self, failed_attempts: u32) -> Duration {
        match *self {
            Backoff::Fixed(delay) => delay,
            Backoff::Exponential { base, max } => {
                let exponent = failed_attempts.saturating_sub(1).min(31);
                base.checked_mul(1u32 << exponent).unwrap_or(max).min(max)
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct JobOptions {
    /// Total tries, including the first. `u32::MAX` retries indefinitely.
    pub attempts: u32,
    pub backoff: Backoff,
    /// Hold the job back this long before its first attempt.
    pub delay: Duration,
}

impl JobOptions {
    pub fn new(attempts: u32, backoff: Backoff) -> Self {
        Self {
            attempts: attempts.max(1),
            backoff,
            delay: Duration::ZERO,
        }
    }

    pub fn delayed(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct JobError {
    pub message: String,
}

impl JobError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum QueueError {
    #[error(transparent)]
    Backend(#[from] BackendError),
}

/// Executes jobs claimed by workers.
#[async_trait]
pub trait JobHandler: Send + Sync {
    /// One attempt. `attempt` starts at 1.
    async fn run(&self, job: &Job, attempt: u32) -> Result<(), JobError>;

    /// Runs once after the last attempt failed, before the job is marked
    /// failed.
    async fn exhausted(&self, job: &Job, error: &JobError);
}

/// Counts by job state, readable without draining the queue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    /// Ready to run now.
    pub waiting: usize,
    /// Scheduled for later (initial delay or retry backoff).
    pub delayed: usize,
    pub active: usize,
    pub completed: u64,
    pub failed: u64,
}

/// A job whose attempts ran out.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FailedJob {
    pub id: JobId,
    pub job: Job,
    pub attempts_made: u32,
    pub error: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum JobState {
    Waiting,
    Active,
    Failed,
}

#[derive(Debug)]
struct JobRecord {
    job: Job,
    options: JobOptions,
    attempts_made: u32,
    state: JobState,
    ready_at: Instant,
    last_error: Option<String>,
}

#[derive(Debug, Default)]
struct JobTable {
    jobs: HashMap<JobId, JobRecord>,
    next_id: JobId,
    completed: u64,
    failed: u64,
}

enum Poll {
    Claimed {
        id: JobId,
        job: Job,
        attempt: u32,
        options: JobOptions,
    },
    /// Nothing ready; the earliest scheduled job, if any.
    Idle(Option<Instant>),
}

impl JobTable {
    fn poll(&mut self, now: Instant) -> Poll {
        let next = self
            .jobs
            .iter()
            .filter(|(_, record)| record.state == JobState::Waiting)
            .min_by_key(|(id, record)| (record.ready_at, **id))
            .map(|(id, record)| (*id, record.ready_at));

        match next {
            Some((id, ready_at)) if ready_at <= now => {
                let Some(record) = self.jobs.get_mut(&id) else {
                    return Poll::Idle(None);
                };
                record.state = JobState::Active;
                record.attempts_made += 1;
                Poll::Claimed {
                    id,
                    job: record.job.clone(),
                    attempt: record.attempts_made,
                    options: record.options,
                }
            }
            Some((_, ready_at)) => Poll::Idle(Some(ready_at)),
            None => Poll::Idle(None),
        }
    }

    fn unsettled(&self) -> usize {
        self.jobs
            .values()
            .filter(|r| r.state != JobState::Failed && r.job.blocks_settled())
            .count()
    }
}

struct Shared {
    table: Mutex<JobTable>,
    /// Signalled when a job becomes claimable.
    wakeup: Notify,
    /// Signalled whenever a job changes state.
    changed: Notify,
    availability: Availability,
}

/// Handle to the job table. Cheap to clone.
#[derive(Clone)]
pub struct SettlementQueue {
    shared: Arc<Shared>,
}

impl SettlementQueue {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                table: Mutex::new(JobTable::default()),
                wakeup: Notify::new(),
                changed: Notify::new(),
                availability: Availability::new("queue"),
            }),
        }
    }

    pub fn availability(&self) -> &Availability {
        &self.shared.availability
    }

    pub fn enqueue(&self, job: Job, options: JobOptions) -> Result<JobId, QueueError> {
        self.shared.availability.check()?;
        let id = {
            let mut table = self.shared.table.lock();
            table.next_id += 1;
            let id = table.next_id;
            debug!(job = id, kind = job.name(), reservation = %job.reservation_id(), "job enqueued");
            table.jobs.insert(
                id,
                JobRecord {
                    job,
                    options,
                    attempts_made: 0,
                    state: JobState::Waiting,
                    ready_at: Instant::now() + options.delay,
                    last_error: None,
                },
            );
            id
        };
        self.shared.wakeup.notify_one();
        self.shared.changed.notify_waiters();
        Ok(id)
    }

    pub fn stats(&self) -> QueueStats {
        let now = Instant::now();
        let table = self.shared.table.lock();
        let mut stats = QueueStats {
            completed: table.completed,
            failed: table.failed,
            ..QueueStats::default()
        };
        for record in table.jobs.values() {
            match record.state {
                JobState::Waiting if record.ready_at <= now => stats.waiting += 1,
                JobState::Waiting => stats.delayed += 1,
                JobState::Active => stats.active += 1,
                JobState::Failed => {}
            }
        }
        stats
    }

    pub fn failed_jobs(&self) -> Vec<FailedJob> {
        let table = self.shared.table.lock();
        let mut failed: Vec<_> = table
            .jobs
            .iter()
            .filter(|(_, r)| r.state == JobState::Failed)
            .map(|(id, r)| FailedJob {
                id: *id,
                job: r.job.clone(),
                attempts_made: r.attempts_made,
                error: r.last_error.clone().unwrap_or_default(),
            })
            .collect();
        failed.sort_by_key(|f| f.id);
        failed
    }

    /// Wait until no settlement or compensation job is waiting, delayed or
    /// active. Pending expiry jobs are ignored.
    pub async fn wait_settled(&self) {
        loop {
            if self.shared.table.lock().unsettled() == 0 {
                return;
            }
            // the timeout covers a notification racing the check above
            tokio::select! {
                _ = self.shared.changed.notified() => {}
                _ = tokio::time::sleep(Duration::from_millis(10)) => {}
            }
        }
    }

    /// Spawn `workers` tasks running jobs through `handler`.
    pub fn start(&self, handler: Arc<dyn JobHandler>, workers: usize) -> WorkerPool {
        let (shutdown, signal) = watch::channel(false);
        let handles = (0..workers.max(1))
            .map(|worker| {
                let queue = self.clone();
                let handler = handler.clone();
                let signal = signal.clone();
                tokio::spawn(async move { queue.work(worker, handler, signal).await })
            })
            .collect();
        info!(workers = workers.max(1), "settlement workers started");
        WorkerPool { shutdown, handles }
    }

    async fn work(
        &self,
        worker: usize,
        handler: Arc<dyn JobHandler>,
        mut signal: watch::Receiver<bool>,
    ) {
        loop {
            if *signal.borrow() {
                break;
            }
            let poll = self.shared.table.lock().poll(Instant::now());
            match poll {
                Poll::Claimed {
                    id,
                    job,
                    attempt,
                    options,
                } => {
                    self.shared.changed.notify_waiters();
                    self.execute(worker, handler.as_ref(), id, job, attempt, options)
                        .await;
                }
                Poll::Idle(next) => {
                    let sleep = match next {
                        Some(at) => tokio::time::sleep_until(at),
                        None => tokio::time::sleep(Duration::from_secs(3600)),
                    };
                    tokio::select! {
                        _ = self.shared.wakeup.notified() => {}
                        _ = sleep => {}
                        changed = signal.changed() => {
                            // pool handle dropped
                            if changed.is_err() {
                                break;
                            }
                        }
                    }
                }
            }
        }
        debug!(worker, "settlement worker stopped");
    }

    async fn execute(
        &self,
        worker: usize,
        handler: &dyn JobHandler,
        id: JobId,
        job: Job,
        attempt: u32,
        options: JobOptions,
    ) {
        debug!(worker, job = id, kind = job.name(), attempt, "job started");
        let error = match handler.run(&job, attempt).await {
            Ok(()) => {
                let mut table = self.shared.table.lock();
                table.jobs.remove(&id);
                table.completed += 1;
                drop(table);
                debug!(worker, job = id, kind = job.name(), attempt, "job completed");
                self.shared.changed.notify_waiters();
                return;
            }
            Err(error) => error,
        };

        if attempt < options.attempts {
            let delay = options.backoff.delay(attempt);
            {
                let mut table = self.shared.table.lock();
                if let Some(record) = table.jobs.get_mut(&id) {
                    record.state = JobState::Waiting;
                    record.ready_at = Instant::now() + delay;
                    record.last_error = Some(error.message.clone());
                }
            }
            info!(
                job = id,
                kind = job.name(),
                reservation = %job.reservation_id(),
                attempt,
                retry_in_ms = delay.as_millis() as u64,
                reason = %error,
                "job attempt failed, retrying"
            );
            self.shared.wakeup.notify_one();
            self.shared.changed.notify_waiters();
            return;
        }

        warn!(
            job = id,
            kind = job.name(),
            reservation = %job.reservation_id(),
            attempts = attempt,
            reason = %error,
            "job exhausted its attempts"
        );
        handler.exhausted(&job, &error).await;
        {
            let mut table = self.shared.table.lock();
            table.failed += 1;
            if let Some(record) = table.jobs.get_mut(&id) {
                record.state = JobState::Failed;
                record.last_error = Some(error.message);
            }
        }
        self.shared.changed.notify_waiters();
    }
}

impl Default for SettlementQueue {
    fn default() -> Self {
        Self::new()
    }
}

/// Running workers. Dropping the pool stops idle workers; call
/// [`shutdown`](Self::shutdown) to also wait for in-flight jobs.
pub struct WorkerPool {
    shutdown: watch::Sender<bool>,
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Stop claiming jobs and wait for in-flight jobs to finish.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        for handle in self.handles {
            if let Err(e) = handle.await {
                warn!(reason = %e, "settlement worker ended abnormally");
            }
        }
        info!("settlement workers stopped");
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use uuid::Uuid;

    use super::*;

    /// Fails the first `failures` attempts of every job.
    #[derive(Default)]
    struct Flaky {
        failures: u32,
        runs: AtomicU32,
        exhausted: AtomicU32,
    }

    #[async_trait]
    impl JobHandler for Flaky {
        async fn run(&self, _job: &Job, attempt: u32) -> Result<(), JobError> {
            self.runs.fetch_add(1, Ordering::SeqCst);
            if attempt <= self.failures {
                Err(JobError::new(format!("attempt {attempt} failed")))
            } else {
                Ok(())
            }
        }

        async fn exhausted(&self, _job: &Job, _error: &JobError) {
            self.exhausted.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn compensate() -> Job {
        Job::Compensate {
            reservation_id: Uuid::new_v4(),
            reason: "test".into(),
        }
    }

    fn fast(attempts: u32) -> JobOptions {
        JobOptions::new(
            attempts,
            Backoff::Exponential {
                base: Duration::from_millis(1),
                max: Duration::from_millis(10),
            },
        )
    }

    #[test]
    fn exponential_backoff_doubles_and_caps() {
        let backoff = Backoff::Exponential {
            base: Duration::from_secs(2),
            max: Duration::from_secs(10),
        };
        assert_eq!(backoff.delay(1), Duration::from_secs(2));
        assert_eq!(backoff.delay(2), Duration::from_secs(4));
        assert_eq!(backoff.delay(3), Duration::from_secs(8));
        assert_eq!(backoff.delay(4), Duration::from_secs(10));
        assert_eq!(backoff.delay(u32::MAX), Duration::from_secs(10));
        assert_eq!(
            Backoff::Fixed(Duration::from_secs(1)).delay(7),
            Duration::from_secs(1)
        );
    }

    #[test]
    fn stats_without_workers() {
        let queue = SettlementQueue::new();
        queue.enqueue(compensate(), fast(1)).unwrap();
        queue
            .enqueue(compensate(), fast(1).delayed(Duration::from_secs(60)))
            .unwrap();

        let stats = queue.stats();
        assert_eq!(stats.waiting, 1);
        assert_eq!(stats.delayed, 1);
        assert_eq!(stats.active, 0);
        assert_eq!(stats.completed, 0);
    }

    #[test]
    fn enqueue_fails_when_backend_down() {
        let queue = SettlementQueue::new();
        queue.availability().set_available(false);
        assert!(matches!(
            queue.enqueue(compensate(), fast(1)),
            Err(QueueError::Backend(_))
        ));
    }

    #[tokio::test]
    async fn successful_jobs_complete() {
        let queue = SettlementQueue::new();
        let handler = Arc::new(Flaky::default());
        let pool = queue.start(handler.clone(), 2);

        for _ in 0..5 {
            queue.enqueue(compensate(), fast(3)).unwrap();
        }
        queue.wait_settled().await;
        pool.shutdown().await;

        let stats = queue.stats();
        assert_eq!(stats.completed, 5);
        assert_eq!(stats.failed, 0);
        assert_eq!(handler.runs.load(Ordering::SeqCst), 5);
    }

    #[tokio::test]
    async fn failures_are_retried_until_success() {
        let queue = SettlementQueue::new();
        let handler = Arc::new(Flaky {
            failures: 2,
            ..Flaky::default()
        });
        let pool = queue.start(handler.clone(), 1);

        queue.enqueue(compensate(), fast(3)).unwrap();
        queue.wait_settled().await;
        pool.shutdown().await;

        assert_eq!(handler.runs.load(Ordering::SeqCst), 3);
        assert_eq!(handler.exhausted.load(Ordering::SeqCst), 0);
        assert_eq!(queue.stats().completed, 1);
    }

    #[tokio::test]
    async fn exhaustion_runs_hook_once_and_records_failure() {
        let queue = SettlementQueue::new();
        let handler = Arc::new(Flaky {
            failures: u32::MAX,
            ..Flaky::default()
        });
        let pool = queue.start(handler.clone(), 2);

        queue.enqueue(compensate(), fast(3)).unwrap();
        queue.wait_settled().await;
        pool.shutdown().await;

        assert_eq!(handler.runs.load(Ordering::SeqCst), 3);
        assert_eq!(handler.exhausted.load(Ordering::SeqCst), 1);
        let stats = queue.stats();
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.completed, 0);

        let failed = queue.failed_jobs();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].attempts_made, 3);
        assert_eq!(failed[0].error, "attempt 3 failed");
    }

    #[tokio::test]
    async fn delayed_jobs_wait_their_turn() {
        let queue = SettlementQueue::new();
        let handler = Arc::new(Flaky::default());
        let pool = queue.start(handler.clone(), 1);

        let expire = Job::Expire {
            reservation_id: Uuid::new_v4(),
        };
        queue
            .enqueue(expire, fast(1).delayed(Duration::from_millis(40)))
            .unwrap();
        // expiry jobs never block wait_settled
        queue.wait_settled().await;
        assert_eq!(handler.runs.load(Ordering::SeqCst), 0);
        assert_eq!(queue.stats().delayed, 1);

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(handler.runs.load(Ordering::SeqCst), 1);
        assert_eq!(queue.stats().completed, 1);
        pool.shutdown().await;
    }
}
