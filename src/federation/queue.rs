//! Task queue
//!
//! Inbound processing and outbound delivery are queued work. Two
//! implementations sit behind [`TaskQueue`]:
//! - [`DurableQueue`]: jobs persisted in SQLite, consumed by [`QueueWorker`]s
//! - [`InlineQueue`]: jobs run to completion on the enqueuing task
//!
//! Delivery is at-least-once. Jobs sharing an ordering key run strictly
//! in submission order; other jobs have no ordering guarantee.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::{Notify, Semaphore, watch};

use crate::data::{Database, JobRecord};
use crate::error::AppError;
use crate::metrics::{QUEUE_JOBS_TOTAL, QUEUE_WORKERS_BUSY};

/// Current time in epoch milliseconds
pub(crate) fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Named queues
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueueName {
    PersonalInbox,
    SharedInbox,
    Deliver,
}

impl QueueName {
    pub const ALL: [QueueName; 3] = [Self::PersonalInbox, Self::SharedInbox, Self::Deliver];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PersonalInbox => "inbox.personal",
            Self::SharedInbox => "inbox.shared",
            Self::Deliver => "deliver",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|name| name.as_str() == value)
    }
}

/// Job lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Pending,
    Running,
    Done,
    Failed,
    Dropped,
}

impl JobState {
    pub const ALL: [JobState; 5] = [
        Self::Pending,
        Self::Running,
        Self::Done,
        Self::Failed,
        Self::Dropped,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Done => "done",
            Self::Failed => "failed",
            Self::Dropped => "dropped",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(Self::Pending),
            "running" => Some(Self::Running),
            "done" => Some(Self::Done),
            "failed" => Some(Self::Failed),
            "dropped" => Some(Self::Dropped),
            _ => None,
        }
    }
}

/// Work to enqueue
#[derive(Debug, Clone)]
pub struct NewJob {
    pub queue: QueueName,
    pub payload: Value,
    /// Jobs with the same key run in submission order
    pub ordering_key: Option<String>,
    /// Destination host, used to drop work for blocked domains
    pub target_host: Option<String>,
}

impl NewJob {
    pub fn new(queue: QueueName, payload: Value) -> Self {
        Self {
            queue,
            payload,
            ordering_key: None,
            target_host: None,
        }
    }

    pub fn with_ordering_key(mut self, ordering_key: Option<String>) -> Self {
        self.ordering_key = ordering_key;
        self
    }

    pub fn with_target_host(mut self, target_host: Option<String>) -> Self {
        self.target_host = target_host;
        self
    }
}

/// A job handed to a [`JobHandler`]
#[derive(Debug, Clone)]
pub struct QueuedJob {
    /// Row id; 0 for inline jobs not yet recorded
    pub id: i64,
    pub queue: QueueName,
    pub payload: Value,
    /// 1 on the first attempt
    pub attempts: u32,
    pub ordering_key: Option<String>,
}

/// Result of one handler attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    Done { status: Option<u16> },
    /// Transient failure; retried while the attempt budget lasts
    Retry { error: String, status: Option<u16> },
    /// Permanent failure; never retried
    Failed { error: String, status: Option<u16> },
    /// Intentionally not executed (e.g. blocked destination)
    Dropped { reason: String },
}

/// Final or current state of a job after processing
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobReport {
    pub job_id: Option<i64>,
    pub state: JobState,
    pub attempts: u32,
    pub last_error: Option<String>,
    pub last_status: Option<u16>,
}

/// What `enqueue` did with the job
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnqueueReceipt {
    /// Persisted for a worker
    Queued { job_id: i64 },
    /// Executed immediately
    Completed(JobReport),
}

/// Consumer of one queue
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn handle(&self, job: &QueuedJob) -> JobOutcome;
}

/// Injected queue abstraction
#[async_trait]
pub trait TaskQueue: Send + Sync {
    /// Enqueue a job
    async fn enqueue(&self, job: NewJob) -> Result<EnqueueReceipt, AppError>;

    /// Give a failed or dropped job a fresh attempt budget.
    ///
    /// Returns None when the job does not exist or is not retryable.
    async fn retry(&self, job_id: i64) -> Result<Option<EnqueueReceipt>, AppError>;
}

/// Exponential backoff with a bounded attempt count
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts including the first
    pub max_attempts: u32,
    /// Delay after the first failed attempt
    pub base_delay: Duration,
    /// Maximum delay between retries
    pub max_delay: Duration,
    /// Multiplier for exponential backoff
    pub multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 8,
            base_delay: Duration::from_secs(30),
            max_delay: Duration::from_secs(6 * 3600),
            multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    pub fn from_config(config: &crate::config::FederationConfig) -> Self {
        Self {
            max_attempts: config.max_delivery_attempts,
            base_delay: Duration::from_secs(config.retry_base_seconds),
            max_delay: Duration::from_secs(config.retry_max_seconds),
            multiplier: 2.0,
        }
    }

    /// Delay before the next attempt once `attempts` attempts have failed.
    #[must_use]
    #[allow(clippy::cast_possible_wrap)]
    pub fn delay_for_attempt(&self, attempts: u32) -> Duration {
        let exponent = attempts.saturating_sub(1).min(30) as i32;
        let delay_secs = self.base_delay.as_secs_f64() * self.multiplier.powi(exponent);
        let delay = Duration::from_secs_f64(delay_secs.min(self.max_delay.as_secs_f64()));

        delay.min(self.max_delay)
    }

    /// Check if another attempt is allowed after `attempts` attempts.
    #[must_use]
    pub const fn should_retry(&self, attempts: u32) -> bool {
        attempts < self.max_attempts
    }
}

fn record_transition(queue: QueueName, state: JobState) {
    QUEUE_JOBS_TOTAL
        .with_label_values(&[queue.as_str(), state.as_str()])
        .inc();
}

fn status_to_i64(status: Option<u16>) -> Option<i64> {
    status.map(i64::from)
}

// =============================================================================
// Durable queue
// =============================================================================

/// SQLite-backed queue. Enqueue only persists; workers execute.
pub struct DurableQueue {
    db: Arc<Database>,
    notify: Arc<Notify>,
}

impl DurableQueue {
    pub fn new(db: Arc<Database>) -> Self {
        Self {
            db,
            notify: Arc::new(Notify::new()),
        }
    }

    /// Wakes idle workers when work arrives
    pub fn notifier(&self) -> Arc<Notify> {
        self.notify.clone()
    }
}

#[async_trait]
impl TaskQueue for DurableQueue {
    async fn enqueue(&self, job: NewJob) -> Result<EnqueueReceipt, AppError> {
        let now = now_ms();
        let job_id = self
            .db
            .insert_job(&JobRecord {
                id: 0,
                queue: job.queue.as_str().to_string(),
                payload: job.payload.to_string(),
                ordering_key: job.ordering_key,
                target_host: job.target_host,
                state: JobState::Pending.as_str().to_string(),
                attempts: 0,
                next_run_at_ms: now,
                locked_at_ms: None,
                last_error: None,
                last_status: None,
                created_at_ms: now,
                updated_at_ms: now,
            })
            .await?;

        record_transition(job.queue, JobState::Pending);
        tracing::debug!(queue = job.queue.as_str(), job_id, "Job enqueued");
        self.notify.notify_waiters();

        Ok(EnqueueReceipt::Queued { job_id })
    }

    async fn retry(&self, job_id: i64) -> Result<Option<EnqueueReceipt>, AppError> {
        if !self.db.requeue_job(job_id, now_ms()).await? {
            return Ok(None);
        }

        tracing::info!(job_id, "Job requeued");
        self.notify.notify_waiters();
        Ok(Some(EnqueueReceipt::Queued { job_id }))
    }
}

// =============================================================================
// Inline queue
// =============================================================================

struct Registration {
    handler: Arc<dyn JobHandler>,
    policy: RetryPolicy,
}

/// Runs each job on the caller's task, retrying transient failures
/// immediately up to the policy's attempt count.
///
/// Successful jobs leave no trace; terminal failures are stored in the
/// jobs table so they show up in the operator view.
pub struct InlineQueue {
    db: Arc<Database>,
    handlers: RwLock<HashMap<QueueName, Registration>>,
}

impl InlineQueue {
    pub fn new(db: Arc<Database>) -> Self {
        Self {
            db,
            handlers: RwLock::new(HashMap::new()),
        }
    }

    /// Register the consumer of a queue
    pub fn register(&self, queue: QueueName, handler: Arc<dyn JobHandler>, policy: RetryPolicy) {
        let mut handlers = self
            .handlers
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        handlers.insert(queue, Registration { handler, policy });
    }

    fn registration(&self, queue: QueueName) -> Result<(Arc<dyn JobHandler>, RetryPolicy), AppError> {
        let handlers = self
            .handlers
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        handlers
            .get(&queue)
            .map(|registration| (registration.handler.clone(), registration.policy.clone()))
            .ok_or_else(|| {
                AppError::Internal(anyhow::anyhow!(
                    "no handler registered for queue {}",
                    queue.as_str()
                ))
            })
    }

    async fn run(&self, mut job: QueuedJob) -> Result<JobReport, AppError> {
        let (handler, policy) = self.registration(job.queue)?;

        loop {
            job.attempts += 1;
            let outcome = handler.handle(&job).await;
            let (state, last_error, last_status) = match outcome {
                JobOutcome::Done { status } => (JobState::Done, None, status),
                JobOutcome::Retry { error, .. } if policy.should_retry(job.attempts) => {
                    tracing::debug!(
                        queue = job.queue.as_str(),
                        attempts = job.attempts,
                        error = %error,
                        "Inline job retrying"
                    );
                    continue;
                }
                JobOutcome::Retry { error, status } => (JobState::Failed, Some(error), status),
                JobOutcome::Failed { error, status } => (JobState::Failed, Some(error), status),
                JobOutcome::Dropped { reason } => (JobState::Dropped, Some(reason), None),
            };

            record_transition(job.queue, state);
            return Ok(JobReport {
                job_id: (job.id != 0).then_some(job.id),
                state,
                attempts: job.attempts,
                last_error,
                last_status,
            });
        }
    }

    async fn store_terminal(
        &self,
        job: &NewJob,
        report: &mut JobReport,
    ) -> Result<(), AppError> {
        if report.state == JobState::Done {
            return Ok(());
        }

        let now = now_ms();
        let job_id = self
            .db
            .insert_job(&JobRecord {
                id: 0,
                queue: job.queue.as_str().to_string(),
                payload: job.payload.to_string(),
                ordering_key: job.ordering_key.clone(),
                target_host: job.target_host.clone(),
                state: report.state.as_str().to_string(),
                attempts: i64::from(report.attempts),
                next_run_at_ms: now,
                locked_at_ms: None,
                last_error: report.last_error.clone(),
                last_status: status_to_i64(report.last_status),
                created_at_ms: now,
                updated_at_ms: now,
            })
            .await?;
        report.job_id = Some(job_id);
        Ok(())
    }
}

#[async_trait]
impl TaskQueue for InlineQueue {
    async fn enqueue(&self, job: NewJob) -> Result<EnqueueReceipt, AppError> {
        let mut report = self
            .run(QueuedJob {
                id: 0,
                queue: job.queue,
                payload: job.payload.clone(),
                attempts: 0,
                ordering_key: job.ordering_key.clone(),
            })
            .await?;
        self.store_terminal(&job, &mut report).await?;

        Ok(EnqueueReceipt::Completed(report))
    }

    async fn retry(&self, job_id: i64) -> Result<Option<EnqueueReceipt>, AppError> {
        let Some(record) = self.db.get_job(job_id).await? else {
            return Ok(None);
        };
        let Some(queue) = QueueName::parse(&record.queue) else {
            return Ok(None);
        };
        if !matches!(
            JobState::parse(&record.state),
            Some(JobState::Failed | JobState::Dropped)
        ) {
            return Ok(None);
        }
        let payload: Value = serde_json::from_str(&record.payload)?;

        let report = self
            .run(QueuedJob {
                id: record.id,
                queue,
                payload,
                attempts: 0,
                ordering_key: record.ordering_key,
            })
            .await?;

        let now = now_ms();
        match report.state {
            JobState::Done => {
                self.db
                    .complete_job(job_id, status_to_i64(report.last_status), now)
                    .await?
            }
            JobState::Dropped => {
                let reason = report.last_error.as_deref().unwrap_or("dropped");
                self.db.drop_job(job_id, reason, now).await?
            }
            _ => {
                let error = report.last_error.as_deref().unwrap_or("failed");
                self.db
                    .fail_job(job_id, error, status_to_i64(report.last_status), now)
                    .await?
            }
        }

        Ok(Some(EnqueueReceipt::Completed(report)))
    }
}

// =============================================================================
// Worker
// =============================================================================

/// Worker pool consuming one durable queue
pub struct QueueWorker {
    db: Arc<Database>,
    queue: QueueName,
    handler: Arc<dyn JobHandler>,
    policy: RetryPolicy,
    concurrency: usize,
    poll_interval: Duration,
    /// Running jobs older than this are reclaimed
    lease: Duration,
    notify: Arc<Notify>,
}

impl QueueWorker {
    pub fn new(
        db: Arc<Database>,
        queue: QueueName,
        handler: Arc<dyn JobHandler>,
        policy: RetryPolicy,
        notify: Arc<Notify>,
    ) -> Self {
        Self {
            db,
            queue,
            handler,
            policy,
            concurrency: 1,
            poll_interval: Duration::from_secs(1),
            lease: Duration::from_secs(600),
            notify,
        }
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn with_lease(mut self, lease: Duration) -> Self {
        self.lease = lease;
        self
    }

    fn stale_before(&self, now: i64) -> i64 {
        now - i64::try_from(self.lease.as_millis()).unwrap_or(i64::MAX)
    }

    /// Claim and execute the next runnable job as of `now`.
    ///
    /// Returns None when nothing is runnable. Backoff is computed from `now`.
    pub async fn process_next_at(&self, now: i64) -> Result<Option<JobReport>, AppError> {
        let Some(record) = self
            .db
            .claim_next_job(self.queue.as_str(), now, self.stale_before(now))
            .await?
        else {
            return Ok(None);
        };

        self.execute(record, Some(now)).await.map(Some)
    }

    /// Run until `shutdown` turns true, then wait for in-flight jobs.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let semaphore = Arc::new(Semaphore::new(self.concurrency));
        tracing::info!(
            queue = self.queue.as_str(),
            concurrency = self.concurrency,
            "Queue worker started"
        );

        loop {
            if *shutdown.borrow() {
                break;
            }

            let permit = tokio::select! {
                permit = semaphore.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
                _ = shutdown.changed() => continue,
            };

            let now = now_ms();
            let claimed = self
                .db
                .claim_next_job(self.queue.as_str(), now, self.stale_before(now))
                .await;

            match claimed {
                Ok(Some(record)) => {
                    let worker = self.clone();
                    tokio::spawn(async move {
                        let job_id = record.id;
                        if let Err(error) = worker.execute(record, None).await {
                            tracing::error!(
                                queue = worker.queue.as_str(),
                                job_id,
                                error = %error,
                                "Failed to record job outcome"
                            );
                        }
                        drop(permit);
                    });
                }
                Ok(None) => {
                    drop(permit);
                    tokio::select! {
                        _ = self.notify.notified() => {}
                        _ = tokio::time::sleep(self.poll_interval) => {}
                        _ = shutdown.changed() => {}
                    }
                }
                Err(error) => {
                    drop(permit);
                    tracing::warn!(queue = self.queue.as_str(), error = %error, "Job claim failed");
                    tokio::time::sleep(self.poll_interval).await;
                }
            }
        }

        // Wait for in-flight jobs
        let permits = u32::try_from(self.concurrency).unwrap_or(u32::MAX);
        let _ = semaphore.acquire_many(permits).await;
        tracing::info!(queue = self.queue.as_str(), "Queue worker stopped");
    }

    async fn execute(&self, record: JobRecord, now: Option<i64>) -> Result<JobReport, AppError> {
        let attempts = u32::try_from(record.attempts).unwrap_or(u32::MAX);
        record_transition(self.queue, JobState::Running);

        let payload: Value = match serde_json::from_str(&record.payload) {
            Ok(payload) => payload,
            Err(error) => {
                let message = format!("invalid payload: {}", error);
                self.db
                    .fail_job(record.id, &message, None, now.unwrap_or_else(now_ms))
                    .await?;
                record_transition(self.queue, JobState::Failed);
                return Ok(JobReport {
                    job_id: Some(record.id),
                    state: JobState::Failed,
                    attempts,
                    last_error: Some(message),
                    last_status: None,
                });
            }
        };

        let job = QueuedJob {
            id: record.id,
            queue: self.queue,
            payload,
            attempts,
            ordering_key: record.ordering_key,
        };

        let busy = QUEUE_WORKERS_BUSY.with_label_values(&[self.queue.as_str()]);
        busy.inc();
        let outcome = self.handler.handle(&job).await;
        busy.dec();

        let finished_at = now.unwrap_or_else(now_ms);
        let (state, last_error, last_status) = match outcome {
            JobOutcome::Done { status } => {
                self.db
                    .complete_job(job.id, status_to_i64(status), finished_at)
                    .await?;
                (JobState::Done, None, status)
            }
            JobOutcome::Retry { error, status } if self.policy.should_retry(attempts) => {
                let delay = self.policy.delay_for_attempt(attempts);
                let next_run_at =
                    finished_at + i64::try_from(delay.as_millis()).unwrap_or(i64::MAX / 2);
                self.db
                    .reschedule_job(job.id, next_run_at, &error, status_to_i64(status), finished_at)
                    .await?;
                tracing::info!(
                    queue = self.queue.as_str(),
                    job_id = job.id,
                    attempts,
                    retry_in_secs = delay.as_secs(),
                    error = %error,
                    "Job scheduled for retry"
                );
                (JobState::Pending, Some(error), status)
            }
            JobOutcome::Retry { error, status } => {
                let error = format!("gave up after {} attempts: {}", attempts, error);
                self.db
                    .fail_job(job.id, &error, status_to_i64(status), finished_at)
                    .await?;
                tracing::warn!(queue = self.queue.as_str(), job_id = job.id, error = %error, "Job failed");
                (JobState::Failed, Some(error), status)
            }
            JobOutcome::Failed { error, status } => {
                self.db
                    .fail_job(job.id, &error, status_to_i64(status), finished_at)
                    .await?;
                tracing::warn!(queue = self.queue.as_str(), job_id = job.id, error = %error, "Job failed");
                (JobState::Failed, Some(error), status)
            }
            JobOutcome::Dropped { reason } => {
                self.db.drop_job(job.id, &reason, finished_at).await?;
                tracing::info!(queue = self.queue.as_str(), job_id = job.id, reason = %reason, "Job dropped");
                (JobState::Dropped, Some(reason), None)
            }
        };

        record_transition(self.queue, state);
        Ok(JobReport {
            job_id: Some(job.id),
            state,
            attempts,
            last_error,
            last_status,
        })
    }
}
