use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::Notify;
use uuid::Uuid;

use stepwise_core::{Job, JobPayload, JobStatus, QueueConfig, StepwiseError};

/// Executes one stage for a payload and returns the follow-up payloads to
/// enqueue. Stage handlers are idempotent; the dispatcher may deliver the
/// same payload again after a partial failure.
pub trait StageRunner: Send + Sync {
    /// Run one job to completion.
    fn run(
        &self,
        payload: &JobPayload,
    ) -> impl Future<Output = Result<Vec<JobPayload>, StepwiseError>> + Send;
}

/// Receives job lifecycle transitions, exactly one terminal event per job.
///
/// The dispatcher owns all transitions: handlers report outcomes through
/// their return value and never touch status themselves.
pub trait StatusSink: Send + Sync {
    /// The job moved from queued to active.
    fn on_started(&self, payload: &JobPayload, attempt: u32);
    /// The job finished successfully.
    fn on_completed(&self, payload: &JobPayload);
    /// The job exhausted its attempts or hit a terminal error. Returned
    /// payloads are enqueued as compensating follow-up work.
    fn on_failed(&self, payload: &JobPayload, error: &StepwiseError) -> Vec<JobPayload>;
}

/// Retry and backoff limits.
#[derive(Debug, Clone)]
pub struct QueueOptions {
    /// Attempt cap before a job is marked failed.
    pub max_attempts: u32,
    /// Base delay for exponential backoff, in milliseconds.
    pub backoff_base_ms: u64,
    /// Upper bound on a single backoff delay, in milliseconds.
    pub backoff_cap_ms: u64,
}

impl Default for QueueOptions {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            backoff_base_ms: 200,
            backoff_cap_ms: 30_000,
        }
    }
}

impl From<&QueueConfig> for QueueOptions {
    fn from(config: &QueueConfig) -> Self {
        Self {
            max_attempts: config.max_attempts,
            backoff_base_ms: config.backoff_base_ms,
            backoff_cap_ms: config.backoff_cap_ms,
        }
    }
}

/// Delay before retry number `attempt` (1-based): `base * 2^(attempt-1)`,
/// capped.
///
/// # Examples
///
/// ```
/// use std::time::Duration;
/// use stepwise_queue::{backoff_delay, QueueOptions};
///
/// let options = QueueOptions::default();
/// assert_eq!(backoff_delay(1, &options), Duration::from_millis(200));
/// assert_eq!(backoff_delay(3, &options), Duration::from_millis(800));
/// ```
pub fn backoff_delay(attempt: u32, options: &QueueOptions) -> Duration {
    let exponent = attempt.saturating_sub(1).min(63);
    let delay = options
        .backoff_base_ms
        .saturating_mul(1u64.checked_shl(exponent).unwrap_or(u64::MAX))
        .min(options.backoff_cap_ms);
    Duration::from_millis(delay)
}

struct QueueState {
    pending: VecDeque<Uuid>,
    jobs: HashMap<Uuid, Job>,
    dedupe: HashMap<String, Uuid>,
    shutdown: bool,
}

/// In-process job dispatcher: FIFO delivery, per-payload dedupe,
/// exponential-backoff retries, and chaining of follow-up jobs.
pub struct Dispatcher<R> {
    runner: R,
    options: QueueOptions,
    state: Mutex<QueueState>,
    notify: Notify,
}

impl<R: StageRunner + StatusSink> Dispatcher<R> {
    /// Create a dispatcher over `runner`.
    pub fn new(runner: R, options: QueueOptions) -> Self {
        Self {
            runner,
            options,
            state: Mutex::new(QueueState {
                pending: VecDeque::new(),
                jobs: HashMap::new(),
                dedupe: HashMap::new(),
                shutdown: false,
            }),
            notify: Notify::new(),
        }
    }

    /// The stage runner this dispatcher delivers to.
    pub fn runner(&self) -> &R {
        &self.runner
    }

    /// Enqueue a payload.
    ///
    /// Returns `Ok(Some(id))` for a newly queued job and `Ok(None)` when an
    /// equivalent job (same dedupe key) is already queued, running, or
    /// completed. A previously failed job does not suppress re-enqueueing.
    ///
    /// # Errors
    ///
    /// Returns [`StepwiseError::QueueUnavailable`] after [`shutdown`]
    /// (see [`Dispatcher::shutdown`]).
    pub fn enqueue(&self, payload: JobPayload) -> Result<Option<Uuid>, StepwiseError> {
        let key = payload.dedupe_key();
        let mut state = self.state.lock().expect("queue state poisoned");
        if state.shutdown {
            return Err(StepwiseError::QueueUnavailable(
                "dispatcher is shut down".into(),
            ));
        }
        if let Some(existing_id) = state.dedupe.get(&key) {
            if let Some(existing) = state.jobs.get(existing_id) {
                if existing.status != JobStatus::Failed {
                    tracing::debug!(%key, "duplicate job suppressed");
                    return Ok(None);
                }
            }
        }
        let job = Job::new(payload);
        let id = job.id;
        tracing::debug!(%key, job_id = %id, "job enqueued");
        state.dedupe.insert(key, id);
        state.jobs.insert(id, job);
        state.pending.push_back(id);
        drop(state);
        self.notify.notify_one();
        Ok(Some(id))
    }

    /// Enqueue a payload bypassing duplicate suppression.
    ///
    /// For user-requested regeneration, where redoing completed work is the
    /// point. The new job takes over the dedupe key.
    ///
    /// # Errors
    ///
    /// Returns [`StepwiseError::QueueUnavailable`] after shutdown.
    pub fn reenqueue(&self, payload: JobPayload) -> Result<Uuid, StepwiseError> {
        let key = payload.dedupe_key();
        let mut state = self.state.lock().expect("queue state poisoned");
        if state.shutdown {
            return Err(StepwiseError::QueueUnavailable(
                "dispatcher is shut down".into(),
            ));
        }
        let job = Job::new(payload);
        let id = job.id;
        tracing::debug!(%key, job_id = %id, "job re-enqueued");
        state.dedupe.insert(key, id);
        state.jobs.insert(id, job);
        state.pending.push_back(id);
        drop(state);
        self.notify.notify_one();
        Ok(id)
    }

    /// Look up a job by id.
    pub fn job(&self, id: Uuid) -> Option<Job> {
        self.state
            .lock()
            .expect("queue state poisoned")
            .jobs
            .get(&id)
            .cloned()
    }

    /// Snapshot of every job the dispatcher has seen.
    pub fn jobs(&self) -> Vec<Job> {
        self.state
            .lock()
            .expect("queue state poisoned")
            .jobs
            .values()
            .cloned()
            .collect()
    }

    /// Stop accepting work. Pending jobs are abandoned; workers wake up and
    /// exit.
    pub fn shutdown(&self) {
        self.state.lock().expect("queue state poisoned").shutdown = true;
        self.notify.notify_waiters();
    }

    /// Deliver jobs one at a time until the queue drains.
    ///
    /// Chained payloads enqueued by completing jobs are processed too. Used
    /// by the CLI and tests; long-running services use
    /// [`run_workers`](Dispatcher::run_workers) instead.
    pub async fn run_until_idle(&self) {
        while let Some(id) = self.pop_pending() {
            self.deliver(id).await;
        }
    }

    /// Spawn `count` worker tasks that deliver jobs until
    /// [`shutdown`](Dispatcher::shutdown) is called.
    pub fn run_workers(self: &Arc<Self>, count: usize) -> Vec<tokio::task::JoinHandle<()>>
    where
        R: 'static,
    {
        (0..count.max(1))
            .map(|worker| {
                let dispatcher = Arc::clone(self);
                tokio::spawn(async move {
                    tracing::debug!(worker, "queue worker started");
                    loop {
                        match dispatcher.pop_pending() {
                            Some(id) => dispatcher.deliver(id).await,
                            None => {
                                if dispatcher.is_shut_down() {
                                    break;
                                }
                                dispatcher.notify.notified().await;
                            }
                        }
                    }
                    tracing::debug!(worker, "queue worker stopped");
                })
            })
            .collect()
    }

    fn is_shut_down(&self) -> bool {
        self.state.lock().expect("queue state poisoned").shutdown
    }

    fn pop_pending(&self) -> Option<Uuid> {
        let mut state = self.state.lock().expect("queue state poisoned");
        if state.shutdown {
            return None;
        }
        state.pending.pop_front()
    }

    fn start_attempt(&self, id: Uuid) -> Option<(JobPayload, u32)> {
        let mut state = self.state.lock().expect("queue state poisoned");
        let job = state.jobs.get_mut(&id)?;
        job.status = JobStatus::Active;
        job.attempts += 1;
        Some((job.payload.clone(), job.attempts))
    }

    fn finish(&self, id: Uuid, status: JobStatus, error: Option<String>) {
        let mut state = self.state.lock().expect("queue state poisoned");
        if let Some(job) = state.jobs.get_mut(&id) {
            job.status = status;
            job.last_error = error;
        }
    }

    fn requeue(&self, id: Uuid) {
        let mut state = self.state.lock().expect("queue state poisoned");
        if let Some(job) = state.jobs.get_mut(&id) {
            job.status = JobStatus::Queued;
        }
        state.pending.push_back(id);
        drop(state);
        self.notify.notify_one();
    }

    async fn deliver(&self, id: Uuid) {
        let Some((payload, attempt)) = self.start_attempt(id) else {
            return;
        };
        let job_type = payload.job_type();
        tracing::debug!(%job_type, job_id = %id, attempt, "delivering job");
        self.runner.on_started(&payload, attempt);

        match self.runner.run(&payload).await {
            Ok(next) => {
                self.finish(id, JobStatus::Completed, None);
                self.runner.on_completed(&payload);
                for chained in next {
                    if let Err(error) = self.enqueue(chained) {
                        tracing::warn!(%error, "dropping chained job");
                    }
                }
            }
            Err(error) if error.is_retryable() && attempt < self.options.max_attempts => {
                let delay = backoff_delay(attempt, &self.options);
                tracing::warn!(%job_type, job_id = %id, attempt, %error, ?delay, "job failed, will retry");
                self.finish(id, JobStatus::Queued, Some(error.to_string()));
                tokio::time::sleep(delay).await;
                self.requeue(id);
            }
            Err(error) => {
                tracing::error!(%job_type, job_id = %id, attempt, %error, "job failed permanently");
                self.finish(id, JobStatus::Failed, Some(error.to_string()));
                for chained in self.runner.on_failed(&payload, &error) {
                    if let Err(enqueue_error) = self.enqueue(chained) {
                        tracing::warn!(%enqueue_error, "dropping chained job");
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Stage runner whose behavior is keyed by dedupe key: fail the first N
    /// deliveries of a payload, optionally terminally, then succeed and
    /// chain the scripted follow-ups.
    #[derive(Default)]
    struct FakeRunner {
        fail_first: Mutex<HashMap<String, u32>>,
        terminal: Mutex<HashMap<String, bool>>,
        chain: Mutex<HashMap<String, Vec<JobPayload>>>,
        delivered: Mutex<Vec<String>>,
        started: AtomicU32,
        completed: AtomicU32,
        failed: AtomicU32,
    }

    impl FakeRunner {
        fn fail_first(&self, key: &str, times: u32, terminal: bool) {
            self.fail_first.lock().unwrap().insert(key.into(), times);
            self.terminal.lock().unwrap().insert(key.into(), terminal);
        }

        fn chain_after(&self, key: &str, next: Vec<JobPayload>) {
            self.chain.lock().unwrap().insert(key.into(), next);
        }

        fn delivered(&self) -> Vec<String> {
            self.delivered.lock().unwrap().clone()
        }
    }

    impl StageRunner for FakeRunner {
        async fn run(&self, payload: &JobPayload) -> Result<Vec<JobPayload>, StepwiseError> {
            let key = payload.dedupe_key();
            self.delivered.lock().unwrap().push(key.clone());
            let mut failures = self.fail_first.lock().unwrap();
            if let Some(remaining) = failures.get_mut(&key) {
                if *remaining > 0 {
                    *remaining -= 1;
                    let terminal = *self.terminal.lock().unwrap().get(&key).unwrap_or(&false);
                    return Err(if terminal {
                        StepwiseError::EmptyDiff
                    } else {
                        StepwiseError::UpstreamFetch {
                            message: "503 from host".into(),
                            retryable: true,
                        }
                    });
                }
            }
            Ok(self.chain.lock().unwrap().remove(&key).unwrap_or_default())
        }
    }

    impl StatusSink for FakeRunner {
        fn on_started(&self, _payload: &JobPayload, _attempt: u32) {
            self.started.fetch_add(1, Ordering::SeqCst);
        }

        fn on_completed(&self, _payload: &JobPayload) {
            self.completed.fetch_add(1, Ordering::SeqCst);
        }

        fn on_failed(&self, _payload: &JobPayload, _error: &StepwiseError) -> Vec<JobPayload> {
            self.failed.fetch_add(1, Ordering::SeqCst);
            Vec::new()
        }
    }

    fn fast_options() -> QueueOptions {
        QueueOptions {
            max_attempts: 3,
            backoff_base_ms: 1,
            backoff_cap_ms: 4,
        }
    }

    fn ingest_payload() -> JobPayload {
        JobPayload::IngestPr {
            session_id: Uuid::new_v4(),
        }
    }

    #[test]
    fn backoff_grows_and_caps() {
        let options = QueueOptions {
            max_attempts: 5,
            backoff_base_ms: 200,
            backoff_cap_ms: 1_000,
        };
        assert_eq!(backoff_delay(1, &options), Duration::from_millis(200));
        assert_eq!(backoff_delay(2, &options), Duration::from_millis(400));
        assert_eq!(backoff_delay(3, &options), Duration::from_millis(800));
        assert_eq!(backoff_delay(4, &options), Duration::from_millis(1_000));
        assert_eq!(backoff_delay(60, &options), Duration::from_millis(1_000));
    }

    #[tokio::test]
    async fn duplicate_enqueue_is_suppressed() {
        let dispatcher = Dispatcher::new(FakeRunner::default(), fast_options());
        let payload = ingest_payload();
        let first = dispatcher.enqueue(payload.clone()).unwrap();
        let second = dispatcher.enqueue(payload).unwrap();
        assert!(first.is_some());
        assert!(second.is_none());

        dispatcher.run_until_idle().await;
        assert_eq!(dispatcher.runner().delivered().len(), 1);
    }

    #[tokio::test]
    async fn completed_job_still_suppresses_duplicates() {
        let dispatcher = Dispatcher::new(FakeRunner::default(), fast_options());
        let payload = ingest_payload();
        dispatcher.enqueue(payload.clone()).unwrap();
        dispatcher.run_until_idle().await;
        assert!(dispatcher.enqueue(payload).unwrap().is_none());
    }

    #[tokio::test]
    async fn retryable_failure_is_retried_then_succeeds() {
        let runner = FakeRunner::default();
        let payload = ingest_payload();
        runner.fail_first(&payload.dedupe_key(), 2, false);

        let dispatcher = Dispatcher::new(runner, fast_options());
        let id = dispatcher.enqueue(payload).unwrap().unwrap();
        dispatcher.run_until_idle().await;

        let job = dispatcher.job(id).unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.attempts, 3);
        assert_eq!(dispatcher.runner().failed.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn retryable_failure_exhausts_attempts() {
        let runner = FakeRunner::default();
        let payload = ingest_payload();
        runner.fail_first(&payload.dedupe_key(), 10, false);

        let dispatcher = Dispatcher::new(runner, fast_options());
        let id = dispatcher.enqueue(payload).unwrap().unwrap();
        dispatcher.run_until_idle().await;

        let job = dispatcher.job(id).unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.attempts, 3);
        assert!(job.last_error.unwrap().contains("503"));
        assert_eq!(dispatcher.runner().failed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn terminal_failure_is_not_retried() {
        let runner = FakeRunner::default();
        let payload = ingest_payload();
        runner.fail_first(&payload.dedupe_key(), 10, true);

        let dispatcher = Dispatcher::new(runner, fast_options());
        let id = dispatcher.enqueue(payload).unwrap().unwrap();
        dispatcher.run_until_idle().await;

        let job = dispatcher.job(id).unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.attempts, 1);
    }

    #[tokio::test]
    async fn failed_job_can_be_enqueued_again() {
        let runner = FakeRunner::default();
        let payload = ingest_payload();
        runner.fail_first(&payload.dedupe_key(), 1, true);

        let dispatcher = Dispatcher::new(runner, fast_options());
        dispatcher.enqueue(payload.clone()).unwrap();
        dispatcher.run_until_idle().await;

        let id = dispatcher.enqueue(payload).unwrap();
        assert!(id.is_some());
        dispatcher.run_until_idle().await;
        assert_eq!(dispatcher.job(id.unwrap()).unwrap().status, JobStatus::Completed);
    }

    #[tokio::test]
    async fn completed_jobs_chain_follow_ups() {
        let runner = FakeRunner::default();
        let session_id = Uuid::new_v4();
        let first = JobPayload::IngestPr { session_id };
        let second = JobPayload::GenerateSteps { session_id };
        runner.chain_after(&first.dedupe_key(), vec![second.clone()]);

        let dispatcher = Dispatcher::new(runner, fast_options());
        dispatcher.enqueue(first.clone()).unwrap();
        dispatcher.run_until_idle().await;

        let delivered = dispatcher.runner().delivered();
        assert_eq!(delivered, vec![first.dedupe_key(), second.dedupe_key()]);
    }

    #[tokio::test]
    async fn shutdown_rejects_new_work() {
        let dispatcher = Dispatcher::new(FakeRunner::default(), fast_options());
        dispatcher.shutdown();
        let err = dispatcher.enqueue(ingest_payload()).unwrap_err();
        assert!(matches!(err, StepwiseError::QueueUnavailable(_)));
    }

    #[tokio::test]
    async fn workers_drain_jobs_until_shutdown() {
        let dispatcher = Arc::new(Dispatcher::new(FakeRunner::default(), fast_options()));
        let handles = dispatcher.run_workers(2);

        for _ in 0..4 {
            dispatcher.enqueue(ingest_payload()).unwrap();
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
        dispatcher.shutdown();
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(dispatcher.runner().delivered().len(), 4);
    }
}
