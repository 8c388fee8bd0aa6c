//! Core job types and policies.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;

use conductor_core::{CoreError, CoreResult, JobId, JobRequest, JobState, OwnerId, Priority};

/// Why a job ended up `canceled`.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CancelReason {
    /// A caller asked for it and the runner settled in time.
    Requested,
    /// The runner ignored the cancellation signal past its graceful wait.
    Forced,
    /// The queue stopped and the runner settled within the drain budget.
    Shutdown,
    /// The queue stopped and the runner outlived the drain budget.
    ShutdownTimeout,
}

impl CancelReason {
    pub fn as_str(self) -> &'static str {
        match self {
            CancelReason::Requested => "requested",
            CancelReason::Forced => "forced",
            CancelReason::Shutdown => "shutdown",
            CancelReason::ShutdownTimeout => "shutdown_timeout",
        }
    }
}

impl fmt::Display for CancelReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where a running job is executing right now.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunningContext {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_id: Option<String>,
}

impl RunningContext {
    pub fn is_empty(&self) -> bool {
        self.execution_id.is_none() && self.step_id.is_none()
    }
}

/// A persisted unit of scheduled work.
///
/// Transitions go through the `mark_*` methods, which refuse anything the
/// lifecycle does not allow. Once terminal, a job never changes again.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    pub id: JobId,
    #[serde(rename = "type")]
    pub job_type: String,
    /// Definition version the job was admitted under.
    pub version: u32,
    pub owner_id: OwnerId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_id: Option<String>,
    pub priority: Priority,
    pub state: JobState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dedupe_key: Option<String>,
    #[serde(default)]
    pub payload: JsonValue,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<JsonValue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Attempts that have ended (successfully or not).
    pub attempts: u32,
    pub max_attempts: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cancel_requested_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cancel_reason: Option<CancelReason>,
    /// Earliest time a retry may start.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_run_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "RunningContext::is_empty")]
    pub running_context: RunningContext,
}

impl Job {
    /// Admit a request as a fresh `queued` job.
    pub fn new(
        request: JobRequest,
        version: u32,
        dedupe_key: Option<String>,
        max_attempts: u32,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: JobId::new(),
            job_type: request.job_type,
            version,
            owner_id: request.owner_id,
            source_id: request.source_id,
            priority: request.priority,
            state: JobState::Queued,
            dedupe_key,
            payload: request.payload,
            result: None,
            error: None,
            attempts: 0,
            max_attempts,
            created_at: now,
            updated_at: now,
            started_at: None,
            completed_at: None,
            cancel_requested_at: None,
            cancel_reason: None,
            next_run_at: None,
            running_context: RunningContext::default(),
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    /// Whether a queued job is eligible to start at `now`.
    pub fn is_ready(&self, now: DateTime<Utc>) -> bool {
        self.next_run_at.is_none_or(|at| now >= at)
    }

    fn transition(&mut self, next: JobState) -> CoreResult<()> {
        if !self.state.can_transition_to(next) {
            return Err(CoreError::invalid_transition(format!(
                "job {} cannot move from {} to {}",
                self.id, self.state, next
            )));
        }
        self.state = next;
        self.updated_at = Utc::now();
        Ok(())
    }

    /// `queued -> running`.
    pub fn mark_running(&mut self) -> CoreResult<()> {
        self.transition(JobState::Running)?;
        self.started_at = Some(self.updated_at);
        self.next_run_at = None;
        self.running_context = RunningContext::default();
        Ok(())
    }

    /// `running -> completed`.
    pub fn mark_completed(&mut self, result: JsonValue) -> CoreResult<()> {
        self.transition(JobState::Completed)?;
        self.attempts += 1;
        self.result = Some(result);
        self.error = None;
        self.completed_at = Some(self.updated_at);
        Ok(())
    }

    /// `running -> queued` after a retryable failure; the error of the failed
    /// attempt stays visible until the next attempt settles.
    pub fn requeue_for_retry(&mut self, error: String, next_run_at: DateTime<Utc>) -> CoreResult<()> {
        self.transition(JobState::Queued)?;
        self.attempts += 1;
        self.error = Some(error);
        self.next_run_at = Some(next_run_at);
        self.running_context = RunningContext::default();
        Ok(())
    }

    /// `running -> queued` after the process that ran the job died.
    pub fn requeue_after_crash(&mut self) -> CoreResult<()> {
        self.transition(JobState::Queued)?;
        self.attempts += 1;
        self.next_run_at = None;
        self.running_context = RunningContext::default();
        Ok(())
    }

    /// `queued|running -> failed`, preserving `error` verbatim.
    pub fn mark_failed(&mut self, error: impl Into<String>) -> CoreResult<()> {
        let was_running = self.state == JobState::Running;
        self.transition(JobState::Failed)?;
        if was_running {
            self.attempts += 1;
        }
        self.error = Some(error.into());
        self.completed_at = Some(self.updated_at);
        Ok(())
    }

    /// Record that cancellation was asked for; the state does not change.
    pub fn request_cancel(&mut self) {
        if self.cancel_requested_at.is_none() {
            self.cancel_requested_at = Some(Utc::now());
        }
    }

    /// `queued|running -> canceled`.
    pub fn mark_canceled(&mut self, reason: CancelReason) -> CoreResult<()> {
        let was_running = self.state == JobState::Running;
        self.transition(JobState::Canceled)?;
        if was_running {
            self.attempts += 1;
        }
        self.request_cancel();
        self.cancel_reason = Some(reason);
        if reason != CancelReason::Requested {
            self.error = Some(reason.as_str().to_string());
        }
        self.completed_at = Some(self.updated_at);
        Ok(())
    }
}

/// How a failure should be treated by the retry loop.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ErrorClass {
    Retryable,
    Fatal,
}

/// Failure reported by a job runner.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum JobError {
    /// Transient failure; eligible for retry.
    #[error("{0}")]
    Retryable(String),
    /// Unrecoverable failure; the job fails with this text.
    #[error("{0}")]
    Fatal(String),
    #[error("timed out after {}ms", .0.as_millis())]
    Timeout(Duration),
    #[error("canceled")]
    Canceled,
    /// The execution context the job ran against no longer exists.
    #[error("execution target no longer exists: {0}")]
    TargetGone(String),
    #[error("invalid payload: {0}")]
    InvalidPayload(String),
}

impl JobError {
    pub fn retryable(msg: impl Into<String>) -> Self {
        Self::Retryable(msg.into())
    }

    pub fn fatal(msg: impl Into<String>) -> Self {
        Self::Fatal(msg.into())
    }

    /// Classification used when a definition does not provide its own.
    pub fn default_class(&self) -> ErrorClass {
        match self {
            JobError::Retryable(_) | JobError::Timeout(_) | JobError::TargetGone(_) => {
                ErrorClass::Retryable
            }
            JobError::Fatal(_) | JobError::Canceled | JobError::InvalidPayload(_) => ErrorClass::Fatal,
        }
    }
}

/// Pluggable delay function: attempt number (1-indexed) to delay.
pub type DelayFn = Arc<dyn Fn(u32) -> Duration + Send + Sync>;

/// Backoff strategy for retries.
#[derive(Clone, Default)]
pub enum BackoffStrategy {
    /// Fixed delay between retries
    Fixed,
    /// Exponential backoff: base * 2^(attempt-1)
    #[default]
    Exponential,
    /// Linear backoff: base * attempt
    Linear,
    /// First retry runs immediately, later ones back off linearly: base * (attempt-1)
    ImmediateThenLinear,
    /// Caller-supplied delay function
    Custom(DelayFn),
}

impl fmt::Debug for BackoffStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackoffStrategy::Fixed => f.write_str("Fixed"),
            BackoffStrategy::Exponential => f.write_str("Exponential"),
            BackoffStrategy::Linear => f.write_str("Linear"),
            BackoffStrategy::ImmediateThenLinear => f.write_str("ImmediateThenLinear"),
            BackoffStrategy::Custom(_) => f.write_str("Custom(..)"),
        }
    }
}

/// Failure classifier.
pub type ClassifyFn = Arc<dyn Fn(&JobError) -> ErrorClass + Send + Sync>;

/// Retry policy configuration.
#[derive(Clone)]
pub struct RetryPolicy {
    /// Total attempts allowed, including the first one
    pub max_attempts: u32,
    /// Base delay between retries
    pub base_delay: Duration,
    /// Maximum delay cap
    pub max_delay: Duration,
    /// Backoff strategy
    pub strategy: BackoffStrategy,
    /// Jitter factor (0.0-1.0)
    pub jitter: f64,
    /// Decides retryable vs fatal
    pub classify: ClassifyFn,
}

impl fmt::Debug for RetryPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("max_attempts", &self.max_attempts)
            .field("base_delay", &self.base_delay)
            .field("max_delay", &self.max_delay)
            .field("strategy", &self.strategy)
            .field("jitter", &self.jitter)
            .finish_non_exhaustive()
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(60),
            strategy: BackoffStrategy::Exponential,
            jitter: 0.1,
            classify: Arc::new(JobError::default_class),
        }
    }
}

impl RetryPolicy {
    /// A single attempt, never retried.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Default::default()
        }
    }

    /// Create a policy with fixed delays.
    pub fn fixed(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay: delay,
            max_delay: delay,
            strategy: BackoffStrategy::Fixed,
            jitter: 0.0,
            ..Default::default()
        }
    }

    /// Create a policy with exponential backoff.
    pub fn exponential(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
            max_delay,
            strategy: BackoffStrategy::Exponential,
            jitter: 0.1,
            ..Default::default()
        }
    }

    /// Immediate first retry, then linear backoff.
    pub fn immediate_then_linear(max_attempts: u32, step: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay: step,
            max_delay,
            strategy: BackoffStrategy::ImmediateThenLinear,
            jitter: 0.0,
            ..Default::default()
        }
    }

    pub fn with_strategy(mut self, strategy: BackoffStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter.clamp(0.0, 1.0);
        self
    }

    pub fn with_classifier<F>(mut self, classify: F) -> Self
    where
        F: Fn(&JobError) -> ErrorClass + Send + Sync + 'static,
    {
        self.classify = Arc::new(classify);
        self
    }

    pub fn classify(&self, error: &JobError) -> ErrorClass {
        (self.classify)(error)
    }

    /// Calculate delay for a given attempt number (1-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let base_ms = self.base_delay.as_millis() as f64;
        let max_ms = self.max_delay.as_millis() as f64;

        let delay_ms = match &self.strategy {
            BackoffStrategy::Fixed => base_ms,
            BackoffStrategy::Exponential => {
                let exp = 2_f64.powi((attempt - 1).min(62) as i32);
                base_ms * exp
            }
            BackoffStrategy::Linear => base_ms * f64::from(attempt),
            BackoffStrategy::ImmediateThenLinear => base_ms * f64::from(attempt - 1),
            BackoffStrategy::Custom(f) => f(attempt).as_millis() as f64,
        }
        .min(max_ms);

        // Deterministic jitter derived from the attempt number
        let jitter_range = delay_ms * self.jitter;
        let jitter = if jitter_range > 0.0 {
            let pseudo_random = ((f64::from(attempt) * 17.0) % 100.0) / 100.0;
            jitter_range * (pseudo_random - 0.5) * 2.0
        } else {
            0.0
        };

        Duration::from_millis((delay_ms + jitter).clamp(0.0, max_ms.max(0.0)) as u64)
    }

    /// Whether another attempt is allowed after `settled_attempts` have ended.
    pub fn should_retry(&self, settled_attempts: u32) -> bool {
        settled_attempts < self.max_attempts
    }
}
