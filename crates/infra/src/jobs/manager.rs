//! Queue Manager: the scheduler proper.
//!
//! ## Responsibilities
//!
//! - Admission: validate against the job definition, resolve dedupe, persist `queued`
//! - Scheduling: per-owner lanes (one running job per owner), a global concurrency
//!   bound, priority-first ordering with a background starvation guard
//! - Execution: one supervisor task per attempt enforcing the definition's hard
//!   timeout around the execution hook
//! - Settlement: retry/backoff, fatal failure, result validation, lifecycle
//!   publication and idempotent hooks
//! - Cancellation and bounded shutdown drain
//!
//! ## Single writer
//!
//! Every state transition happens while holding the scheduler lock, and the lock
//! is never held across an `await`. A running attempt is tracked in `running`;
//! whoever removes it from that map (the supervisor settling normally, or a
//! forced cancellation) is the only party that may terminalize the attempt.
//! Readers (`get`, `list`) go straight to the store and never wait on a runner.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde::Serialize;
use serde_json::Value as JsonValue;
use thiserror::Error;
use tokio::sync::Notify;
use tokio::task::{AbortHandle, JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use conductor_core::{
    CoreError, DedupeOutcome, EnqueueReceipt, JobId, JobRequest, JobState, OwnerId,
};
use conductor_events::{
    EventBus, JobLifecycleEvent, JobSubmitter, LifecycleKind, Subscription,
};

use super::definition::{
    CancelStrategy, DedupeMode, JobContext, JobDefinition, JobDefinitionRegistry, ProgressSink,
};
use super::execution::ExecutionHook;
use super::lanes::{LaneScheduler, Pick};
use super::recovery::{RecoveryReport, recover};
use super::store::{JobFilter, JobStore, JobStoreError};
use super::types::{CancelReason, ErrorClass, Job, JobError};
use crate::config::QueueConfig;

/// Queue API failure.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum QueueError {
    #[error("job not found: {0}")]
    NotFound(JobId),
    #[error("job {job_id} is already {state}")]
    AlreadyTerminal { job_id: JobId, state: JobState },
    #[error("unknown job type '{0}'")]
    UnknownJobType(String),
    #[error("invalid payload: {0}")]
    InvalidPayload(String),
    #[error("queue is stopped")]
    Stopped,
    #[error("queue already started")]
    AlreadyStarted,
    #[error(transparent)]
    Store(#[from] JobStoreError),
    #[error(transparent)]
    Transition(#[from] CoreError),
}

/// Counts per state plus scheduler occupancy.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueStats {
    pub queued: usize,
    pub running: usize,
    pub completed: usize,
    pub failed: usize,
    pub canceled: usize,
    /// Owners with queued or running work.
    pub lanes: usize,
    /// Attempts currently executing.
    pub in_flight: usize,
}

/// What `stop` did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StopReport {
    /// Running jobs that settled within the drain budget.
    pub drained: usize,
    /// Running jobs force-terminalized with `shutdown_timeout`.
    pub forced: Vec<JobId>,
    /// Queued jobs canceled with `shutdown` (empty when `keep_queued_on_stop` is set).
    pub canceled_queued: Vec<JobId>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Created,
    Started,
    Stopped,
}

#[derive(Debug)]
struct RunningJob {
    owner_id: OwnerId,
    cancel: CancellationToken,
    /// Fired once the attempt has been settled (by anyone).
    done: CancellationToken,
    abort: Option<AbortHandle>,
    cancel_reason: Option<CancelReason>,
}

#[derive(Debug)]
struct SchedulerState {
    phase: Phase,
    lanes: LaneScheduler,
    running: HashMap<JobId, RunningJob>,
}

struct Inner {
    store: Arc<dyn JobStore>,
    registry: Arc<JobDefinitionRegistry>,
    bus: Arc<dyn EventBus<JobLifecycleEvent>>,
    execution: Arc<dyn ExecutionHook>,
    config: QueueConfig,
    state: Mutex<SchedulerState>,
    wake: Notify,
    shutdown: CancellationToken,
    scheduler: Mutex<Option<JoinHandle<()>>>,
}

/// The job queue.
///
/// Cheap to clone; all clones drive the same scheduler.
#[derive(Clone)]
pub struct QueueManager {
    inner: Arc<Inner>,
}

impl QueueManager {
    pub fn new(
        store: Arc<dyn JobStore>,
        registry: Arc<JobDefinitionRegistry>,
        bus: Arc<dyn EventBus<JobLifecycleEvent>>,
        execution: Arc<dyn ExecutionHook>,
        config: QueueConfig,
    ) -> Self {
        let lanes = LaneScheduler::new(config.lane_config());
        Self {
            inner: Arc::new(Inner {
                store,
                registry,
                bus,
                execution,
                config,
                state: Mutex::new(SchedulerState {
                    phase: Phase::Created,
                    lanes,
                    running: HashMap::new(),
                }),
                wake: Notify::new(),
                shutdown: CancellationToken::new(),
                scheduler: Mutex::new(None),
            }),
        }
    }

    pub fn config(&self) -> &QueueConfig {
        &self.inner.config
    }

    pub fn registry(&self) -> &JobDefinitionRegistry {
        &self.inner.registry
    }

    /// Lifecycle messages published from now on.
    pub fn subscribe(&self) -> Subscription<JobLifecycleEvent> {
        self.inner.bus.subscribe()
    }

    /// Admit a job, honoring the definition's dedupe policy.
    pub fn enqueue(&self, request: JobRequest) -> Result<EnqueueReceipt, QueueError> {
        let inner = &self.inner;
        let def = inner
            .registry
            .get(&request.job_type)
            .ok_or_else(|| QueueError::UnknownJobType(request.job_type.clone()))?;
        def.payload
            .validate(&request.payload)
            .map_err(QueueError::InvalidPayload)?;
        let dedupe_key = def.dedupe.key_for(&request.payload);

        let (receipt, admitted) = {
            let mut state = inner.lock();
            if state.phase == Phase::Stopped {
                return Err(QueueError::Stopped);
            }

            match dedupe_key
                .as_deref()
                .map(|key| inner.find_in_flight(&def.job_type, key))
                .transpose()?
                .flatten()
            {
                Some(existing) if def.dedupe.mode == DedupeMode::SingleFlight => {
                    (EnqueueReceipt::new(existing.id, DedupeOutcome::SingleFlight), None)
                }
                Some(existing) if def.dedupe.mode == DedupeMode::DropDuplicate => {
                    (EnqueueReceipt::new(existing.id, DedupeOutcome::Dropped), None)
                }
                Some(mut existing)
                    if def.dedupe.mode == DedupeMode::MergeDuplicate
                        && existing.state == JobState::Queued =>
                {
                    let merged = def.dedupe.merge(&existing.payload, &request.payload);
                    def.payload
                        .validate(&merged)
                        .map_err(QueueError::InvalidPayload)?;
                    existing.payload = merged;
                    existing.updated_at = Utc::now();
                    inner.store.update(&existing)?;
                    (EnqueueReceipt::new(existing.id, DedupeOutcome::Merged), None)
                }
                _ => {
                    let job = Job::new(request, def.version, dedupe_key, def.max_attempts());
                    inner.store.insert(&job)?;
                    state.lanes.push(
                        job.owner_id.clone(),
                        job.id,
                        job.priority,
                        job.created_at,
                        None,
                    );
                    (EnqueueReceipt::new(job.id, DedupeOutcome::Admitted), Some(job))
                }
            }
        };

        match admitted {
            Some(job) => {
                debug!(
                    job_id = %job.id,
                    job_type = %job.job_type,
                    owner_id = %job.owner_id,
                    priority = ?job.priority,
                    "job queued"
                );
                inner.publish(&job);
                inner.wake.notify_one();
            }
            None => debug!(
                job_id = %receipt.job_id,
                outcome = ?receipt.dedupe_outcome,
                "submission collapsed into in-flight job"
            ),
        }
        Ok(receipt)
    }

    pub fn get(&self, job_id: JobId) -> Result<Job, QueueError> {
        self.inner
            .store
            .get(job_id)?
            .ok_or(QueueError::NotFound(job_id))
    }

    pub fn list(&self, filter: &JobFilter) -> Result<Vec<Job>, QueueError> {
        Ok(self.inner.store.list(filter)?)
    }

    pub fn list_by_owner(
        &self,
        owner_id: &OwnerId,
        state: Option<JobState>,
    ) -> Result<Vec<Job>, QueueError> {
        let mut filter = JobFilter::for_owner(owner_id.clone());
        filter.state = state;
        self.list(&filter)
    }

    /// Cancel a job.
    ///
    /// Queued jobs are canceled synchronously. Running jobs are signalled; with
    /// the `Interrupt` strategy the runner gets the definition's graceful wait to
    /// settle before the job is force-canceled with reason `forced`.
    pub async fn cancel(&self, job_id: JobId) -> Result<Job, QueueError> {
        let inner = &self.inner;

        let path = {
            let mut state = inner.lock();
            let mut job = inner.store.get(job_id)?.ok_or(QueueError::NotFound(job_id))?;
            if job.is_terminal() {
                return Err(QueueError::AlreadyTerminal {
                    job_id,
                    state: job.state,
                });
            }

            match state.running.get_mut(&job_id) {
                Some(running) => {
                    job.request_cancel();
                    inner.store.update(&job)?;
                    running.cancel_reason.get_or_insert(CancelReason::Requested);
                    running.cancel.cancel();
                    CancelPath::Signalled(job, running.done.clone())
                }
                None => {
                    // Queued, or left `running` by a queue that never started.
                    state.lanes.remove(&job.owner_id, job_id);
                    job.mark_canceled(CancelReason::Requested)?;
                    inner.store.update(&job)?;
                    CancelPath::Canceled(job)
                }
            }
        };

        let (job, done) = match path {
            CancelPath::Canceled(job) => {
                info!(job_id = %job_id, owner_id = %job.owner_id, "job canceled");
                inner.publish(&job);
                if let Some(def) = inner.registry.get(&job.job_type) {
                    def.runner.on_canceled(&job).await;
                }
                return Ok(job);
            }
            CancelPath::Signalled(job, done) => (job, done),
        };
        let policy = inner
            .registry
            .get(&job.job_type)
            .map(|d| d.cancel)
            .unwrap_or_default();

        let (settled, reason) = match policy.strategy {
            CancelStrategy::Interrupt => (
                tokio::time::timeout(policy.graceful_wait, done.cancelled())
                    .await
                    .is_ok(),
                CancelReason::Forced,
            ),
            CancelStrategy::Immediate => (done.is_cancelled(), CancelReason::Requested),
        };

        if !settled {
            if reason == CancelReason::Forced {
                warn!(
                    job_id = %job_id,
                    graceful_wait_ms = policy.graceful_wait.as_millis() as u64,
                    "runner did not observe cancellation in time; forcing"
                );
            }
            inner.force_cancel(job_id, reason)?;
        }
        self.get(job_id)
    }

    /// Recover persisted jobs and start the scheduling loop.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(&self) -> Result<RecoveryReport, QueueError> {
        let inner = &self.inner;
        let recovered = {
            let mut state = inner.lock();
            match state.phase {
                Phase::Started => return Err(QueueError::AlreadyStarted),
                Phase::Stopped => return Err(QueueError::Stopped),
                Phase::Created => {}
            }

            let recovered = recover(inner.store.as_ref(), &inner.registry)?;
            let mut lanes = LaneScheduler::new(inner.config.lane_config());
            for job in &recovered.queued {
                lanes.push(
                    job.owner_id.clone(),
                    job.id,
                    job.priority,
                    job.created_at,
                    job.next_run_at,
                );
            }
            state.lanes = lanes;
            state.phase = Phase::Started;
            recovered
        };

        for job in &recovered.failed {
            inner.publish(job);
        }

        let handle = tokio::spawn(run_scheduler(Arc::clone(inner)));
        *inner
            .scheduler
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(handle);

        info!(
            max_concurrent = inner.config.max_concurrent,
            queued = recovered.report.queued,
            "queue manager started"
        );
        Ok(recovered.report)
    }

    /// Stop scheduling and drain running jobs within `drain_budget`.
    ///
    /// Queued jobs, including retries waiting on their delay, are canceled with
    /// `shutdown` unless `keep_queued_on_stop` is set. Returns within the budget
    /// (plus bookkeeping) even if a runner ignores its cancellation signal; such
    /// jobs end `canceled` with `shutdown_timeout`.
    pub async fn stop(&self, drain_budget: Duration) -> StopReport {
        let inner = &self.inner;

        let (waiters, canceled_queued) = {
            let mut state = inner.lock();
            if state.phase == Phase::Stopped {
                return StopReport::default();
            }
            state.phase = Phase::Stopped;
            inner.shutdown.cancel();

            let waiters: Vec<(JobId, CancellationToken)> = state
                .running
                .iter_mut()
                .map(|(id, running)| {
                    running.cancel_reason.get_or_insert(CancelReason::Shutdown);
                    running.cancel.cancel();
                    (*id, running.done.clone())
                })
                .collect();

            let mut canceled = Vec::new();
            if !inner.config.keep_queued_on_stop {
                for (_, job_id) in state.lanes.drain_queued() {
                    match inner.terminalize_queued(job_id, CancelReason::Shutdown) {
                        Ok(Some(job)) => canceled.push(job),
                        Ok(None) => {}
                        Err(err) => error!(job_id = %job_id, error = %err, "failed to cancel queued job on stop"),
                    }
                }
            }
            (waiters, canceled)
        };

        for job in &canceled_queued {
            inner.publish(job);
            inner.spawn_hooks(job.clone());
        }

        let drained = tokio::time::timeout(drain_budget, async {
            for (_, done) in &waiters {
                done.cancelled().await;
            }
        })
        .await
        .is_ok();

        let mut forced = Vec::new();
        if !drained {
            for (job_id, done) in &waiters {
                if done.is_cancelled() {
                    continue;
                }
                warn!(
                    job_id = %job_id,
                    drain_budget_ms = drain_budget.as_millis() as u64,
                    "job outlived the drain budget; force-terminalizing"
                );
                match inner.force_cancel(*job_id, CancelReason::ShutdownTimeout) {
                    Ok(Some(_)) => forced.push(*job_id),
                    Ok(None) => {}
                    Err(err) => error!(job_id = %job_id, error = %err, "force-terminalization failed"),
                }
            }
        }

        let handle = inner
            .scheduler
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            if let Err(err) = handle.await {
                warn!(error = %err, "scheduler loop ended abnormally");
            }
        }

        let report = StopReport {
            drained: waiters.len() - forced.len(),
            forced,
            canceled_queued: canceled_queued.iter().map(|j| j.id).collect(),
        };
        info!(
            drained = report.drained,
            forced = report.forced.len(),
            canceled_queued = report.canceled_queued.len(),
            "queue manager stopped"
        );
        report
    }

    pub fn stats(&self) -> Result<QueueStats, QueueError> {
        let mut stats = QueueStats::default();
        for job in self.inner.store.load()? {
            match job.state {
                JobState::Queued => stats.queued += 1,
                JobState::Running => stats.running += 1,
                JobState::Completed => stats.completed += 1,
                JobState::Failed => stats.failed += 1,
                JobState::Canceled => stats.canceled += 1,
            }
        }
        let state = self.inner.lock();
        stats.lanes = state.lanes.lane_count();
        stats.in_flight = state.running.len();
        Ok(stats)
    }
}

#[async_trait]
impl JobSubmitter for QueueManager {
    async fn submit(&self, request: JobRequest) -> Result<EnqueueReceipt, String> {
        self.enqueue(request).map_err(|err| err.to_string())
    }
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, SchedulerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn publish(&self, job: &Job) {
        self.publish_event(lifecycle_event(job, LifecycleKind::for_state(job.state)));
    }

    fn publish_event(&self, event: JobLifecycleEvent) {
        if let Err(err) = self.bus.publish(event) {
            warn!(error = %err, "failed to publish job lifecycle event");
        }
    }

    /// Non-terminal job of `job_type` with `key`, preferring a queued one.
    fn find_in_flight(&self, job_type: &str, key: &str) -> Result<Option<Job>, QueueError> {
        let mut candidates: Vec<Job> = self
            .store
            .list(&JobFilter::all().with_type(job_type))?
            .into_iter()
            .filter(|j| !j.is_terminal() && j.dedupe_key.as_deref() == Some(key))
            .collect();
        candidates.sort_by_key(|j| j.state != JobState::Queued);
        Ok(candidates.into_iter().next())
    }

    /// Start as many ready jobs as lanes and the global bound allow.
    ///
    /// Returns how long until the next delayed retry becomes ready.
    fn dispatch_ready(self: &Arc<Self>) -> Option<Duration> {
        let now = Utc::now();
        let mut started = Vec::new();
        let mut failed = Vec::new();

        let next_ready = {
            let mut state = self.lock();
            if state.phase != Phase::Started {
                return None;
            }
            while state.running.len() < self.config.max_concurrent.max(1) {
                let Some(pick) = state.lanes.pick_next(now) else {
                    break;
                };
                match self.claim(&mut state, &pick) {
                    Ok(Claim::Started(job, def, cancel)) => started.push((job, def, cancel)),
                    Ok(Claim::Failed(job)) => {
                        state.lanes.finish(&pick.owner_id, pick.job_id);
                        failed.push(job);
                    }
                    Ok(Claim::Stale) => state.lanes.finish(&pick.owner_id, pick.job_id),
                    Err(err) => {
                        error!(job_id = %pick.job_id, error = %err, "failed to claim job");
                        state.lanes.finish(&pick.owner_id, pick.job_id);
                    }
                }
            }
            state.lanes.next_ready_at(now)
        };

        for job in &failed {
            self.publish(job);
        }
        for (job, def, cancel) in started {
            self.publish(&job);
            tokio::spawn(supervise(Arc::clone(self), job, def, cancel));
        }

        next_ready.and_then(|at| (at - now).to_std().ok())
    }

    fn claim(&self, state: &mut SchedulerState, pick: &Pick) -> Result<Claim, QueueError> {
        let Some(mut job) = self.store.get(pick.job_id)? else {
            return Ok(Claim::Stale);
        };
        if job.state != JobState::Queued {
            return Ok(Claim::Stale);
        }

        let Some(def) = self.registry.get(&job.job_type) else {
            job.mark_failed(format!("unknown job type '{}'", job.job_type))?;
            self.store.update(&job)?;
            return Ok(Claim::Failed(job));
        };

        job.mark_running()?;
        self.store.update(&job)?;

        let cancel = CancellationToken::new();
        state.running.insert(
            job.id,
            RunningJob {
                owner_id: job.owner_id.clone(),
                cancel: cancel.clone(),
                done: CancellationToken::new(),
                abort: None,
                cancel_reason: None,
            },
        );
        debug!(
            job_id = %job.id,
            owner_id = %job.owner_id,
            priority = ?pick.priority,
            aged = pick.aged,
            "job claimed"
        );
        Ok(Claim::Started(job, def, cancel))
    }

    /// Apply an attempt's outcome. Only the caller that removed the job from
    /// `running` may call this.
    fn apply_outcome(
        &self,
        state: &mut SchedulerState,
        job_id: JobId,
        def: &JobDefinition,
        outcome: Result<JsonValue, JobError>,
        cancel_reason: Option<CancelReason>,
    ) -> Result<Job, QueueError> {
        let mut job = self.store.get(job_id)?.ok_or(QueueError::NotFound(job_id))?;

        match (outcome, cancel_reason) {
            (Ok(value), _) => match def.result.validate(&value) {
                Ok(()) => job.mark_completed(value)?,
                Err(reason) => job.mark_failed(format!("invalid_result:{reason}"))?,
            },
            (Err(_), Some(reason)) => job.mark_canceled(reason)?,
            (Err(JobError::Canceled), None) => job.mark_canceled(CancelReason::Requested)?,
            (Err(err), None) => {
                let settled = job.attempts + 1;
                let retryable = def.retry.classify(&err) == ErrorClass::Retryable;
                if retryable && settled < job.max_attempts {
                    let delay = def.retry.delay_for_attempt(settled);
                    let next_run_at =
                        Utc::now() + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero());
                    job.requeue_for_retry(err.to_string(), next_run_at)?;
                    state.lanes.push(
                        job.owner_id.clone(),
                        job.id,
                        job.priority,
                        job.created_at,
                        Some(next_run_at),
                    );
                } else {
                    job.mark_failed(err.to_string())?;
                }
            }
        }

        self.store.update(&job)?;
        Ok(job)
    }

    async fn settle(
        self: &Arc<Self>,
        job_id: JobId,
        def: &JobDefinition,
        outcome: Result<JsonValue, JobError>,
    ) {
        let settled = {
            let mut state = self.lock();
            let Some(running) = state.running.remove(&job_id) else {
                debug!(job_id = %job_id, "attempt finished after the job was force-terminalized");
                return;
            };
            state.lanes.finish(&running.owner_id, job_id);
            let settled = self.apply_outcome(&mut state, job_id, def, outcome, running.cancel_reason);
            running.done.cancel();
            settled
        };
        self.wake.notify_one();

        let job = match settled {
            Ok(job) => job,
            Err(err) => {
                error!(job_id = %job_id, error = %err, "failed to persist job settlement");
                return;
            }
        };

        self.publish(&job);
        match job.state {
            JobState::Completed => {
                info!(job_id = %job.id, job_type = %job.job_type, attempts = job.attempts, "job completed");
                def.runner.on_completed(&job).await;
            }
            JobState::Failed => {
                warn!(
                    job_id = %job.id,
                    job_type = %job.job_type,
                    attempts = job.attempts,
                    error = job.error.as_deref().unwrap_or_default(),
                    "job failed"
                );
                def.runner.on_failed(&job).await;
            }
            JobState::Canceled => {
                info!(job_id = %job.id, reason = ?job.cancel_reason, "job canceled");
                def.runner.on_canceled(&job).await;
            }
            JobState::Queued => info!(
                job_id = %job.id,
                attempts = job.attempts,
                next_run_at = ?job.next_run_at,
                error = job.error.as_deref().unwrap_or_default(),
                "job retry scheduled"
            ),
            JobState::Running => {}
        }
    }

    /// Terminalize a running attempt without waiting for its runner.
    ///
    /// Returns `None` when the attempt already settled.
    fn force_cancel(&self, job_id: JobId, reason: CancelReason) -> Result<Option<Job>, QueueError> {
        let job = {
            let mut state = self.lock();
            let Some(running) = state.running.remove(&job_id) else {
                return Ok(None);
            };
            state.lanes.finish(&running.owner_id, job_id);
            running.cancel.cancel();
            if let Some(abort) = &running.abort {
                abort.abort();
            }
            let result = self
                .store
                .get(job_id)
                .map_err(QueueError::from)
                .and_then(|job| job.ok_or(QueueError::NotFound(job_id)))
                .and_then(|mut job| {
                    job.mark_canceled(reason)?;
                    self.store.update(&job)?;
                    Ok(job)
                });
            running.done.cancel();
            result?
        };
        self.wake.notify_one();

        info!(job_id = %job_id, reason = %reason, "job force-canceled");
        self.publish(&job);
        self.spawn_hooks(job.clone());
        Ok(Some(job))
    }

    fn terminalize_queued(&self, job_id: JobId, reason: CancelReason) -> Result<Option<Job>, QueueError> {
        let Some(mut job) = self.store.get(job_id)? else {
            return Ok(None);
        };
        if job.state != JobState::Queued {
            return Ok(None);
        }
        job.mark_canceled(reason)?;
        self.store.update(&job)?;
        Ok(Some(job))
    }

    /// Run settlement hooks off the caller's path (used where the caller must
    /// stay bounded).
    fn spawn_hooks(&self, job: Job) {
        let Some(def) = self.registry.get(&job.job_type) else {
            return;
        };
        tokio::spawn(async move {
            match job.state {
                JobState::Completed => def.runner.on_completed(&job).await,
                JobState::Failed => def.runner.on_failed(&job).await,
                JobState::Canceled => def.runner.on_canceled(&job).await,
                JobState::Queued | JobState::Running => {}
            }
        });
    }

    fn update_running<F>(&self, job_id: JobId, mutate: F)
    where
        F: FnOnce(&mut Job),
    {
        let _state = self.lock();
        match self.store.get(job_id) {
            Ok(Some(mut job)) if job.state == JobState::Running => {
                mutate(&mut job);
                job.updated_at = Utc::now();
                if let Err(err) = self.store.update(&job) {
                    warn!(job_id = %job_id, error = %err, "failed to record running context");
                }
            }
            Ok(_) => {}
            Err(err) => warn!(job_id = %job_id, error = %err, "failed to load running job"),
        }
    }
}

impl ProgressSink for Inner {
    fn progress(&self, job: &Job, progress: JsonValue) {
        let current = match self.store.get(job.id) {
            Ok(Some(current)) if current.state == JobState::Running => current,
            _ => return,
        };
        self.publish_event(
            lifecycle_event(&current, LifecycleKind::JobProgress).with_progress(progress),
        );
    }

    fn step(&self, job: &Job, step_id: String) {
        self.update_running(job.id, |j| j.running_context.step_id = Some(step_id));
    }

    fn execution(&self, job: &Job, execution_id: String) {
        self.update_running(job.id, |j| j.running_context.execution_id = Some(execution_id));
    }
}

enum CancelPath {
    Canceled(Job),
    Signalled(Job, CancellationToken),
}

enum Claim {
    Started(Job, Arc<JobDefinition>, CancellationToken),
    Failed(Job),
    Stale,
}

fn lifecycle_event(job: &Job, kind: LifecycleKind) -> JobLifecycleEvent {
    JobLifecycleEvent::new(kind, job.id, job.owner_id.clone(), job.job_type.clone(), job.state)
        .with_source(job.source_id.clone())
        .with_result(job.result.clone())
        .with_error(job.error.clone())
}

async fn run_scheduler(inner: Arc<Inner>) {
    debug!("scheduler loop started");
    loop {
        let idle = inner
            .dispatch_ready()
            .map_or(inner.config.idle_poll, |d| d.min(inner.config.idle_poll));
        tokio::select! {
            _ = inner.shutdown.cancelled() => break,
            _ = inner.wake.notified() => {}
            _ = tokio::time::sleep(idle) => {}
        }
    }
    debug!("scheduler loop stopped");
}

/// Drive one attempt: run it on its own task under the hard timeout, then settle.
async fn supervise(
    inner: Arc<Inner>,
    job: Job,
    def: Arc<JobDefinition>,
    cancel: CancellationToken,
) {
    let progress: Arc<dyn ProgressSink> = inner.clone();
    let ctx = JobContext::new(job.clone(), cancel, progress);
    let execution = Arc::clone(&inner.execution);
    let task_def = Arc::clone(&def);
    let task = tokio::spawn(async move { execution.execute(&task_def, ctx).await });
    let abort = task.abort_handle();

    {
        let mut state = inner.lock();
        match state.running.get_mut(&job.id) {
            Some(running) => running.abort = Some(abort.clone()),
            None => abort.abort(),
        }
    }

    info!(
        job_id = %job.id,
        job_type = %job.job_type,
        owner_id = %job.owner_id,
        attempt = job.attempts + 1,
        "job started"
    );

    let outcome = match tokio::time::timeout(def.timeout, task).await {
        Ok(Ok(result)) => result,
        Ok(Err(join)) if join.is_panic() => Err(JobError::fatal("job runner panicked")),
        Ok(Err(_)) => Err(JobError::Canceled),
        Err(_) => {
            abort.abort();
            warn!(job_id = %job.id, timeout_ms = def.timeout.as_millis() as u64, "job attempt timed out");
            Err(JobError::Timeout(def.timeout))
        }
    };

    inner.settle(job.id, &def, outcome).await;
}
