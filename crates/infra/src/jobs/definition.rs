//! Job definitions: the static catalog of what a job `type` means.
//!
//! A [`JobDefinition`] binds a type name to everything the queue needs to
//! schedule it:
//!
//! - payload and result validators (checked at enqueue, recovery and completion)
//! - a dedupe policy (key derivation + collapse mode)
//! - a retry policy (classification + backoff)
//! - a hard timeout and a cancellation strategy
//! - an optional worker binding (run inside a provisioned worker session)
//! - the [`JobRunner`] with its lifecycle hooks
//!
//! Definitions are registered once at startup into a [`JobDefinitionRegistry`],
//! which is then shared read-only.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde_json::Value as JsonValue;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use conductor_core::HandlerId;

use super::types::{Job, JobError, RetryPolicy};
use crate::workers::WorkerSessionHandle;

/// Structural check of a JSON document.
#[derive(Clone)]
pub struct Validator {
    check: Arc<dyn Fn(&JsonValue) -> Result<(), String> + Send + Sync>,
}

impl Validator {
    /// Accepts every document.
    pub fn any() -> Self {
        Self::custom(|_| Ok(()))
    }

    /// Accepts documents that deserialize into `T`.
    pub fn deserializes_as<T: DeserializeOwned + 'static>() -> Self {
        Self::custom(|value| {
            T::deserialize(value)
                .map(|_| ())
                .map_err(|err| err.to_string())
        })
    }

    pub fn custom<F>(check: F) -> Self
    where
        F: Fn(&JsonValue) -> Result<(), String> + Send + Sync + 'static,
    {
        Self {
            check: Arc::new(check),
        }
    }

    pub fn validate(&self, value: &JsonValue) -> Result<(), String> {
        (self.check)(value)
    }
}

impl Default for Validator {
    fn default() -> Self {
        Self::any()
    }
}

impl fmt::Debug for Validator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Validator(..)")
    }
}

/// How duplicate submissions collapse.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub enum DedupeMode {
    /// Always admit.
    #[default]
    None,
    /// Return the in-flight job's id.
    SingleFlight,
    /// Discard the new submission.
    DropDuplicate,
    /// Fold the new payload into the queued job.
    MergeDuplicate,
}

pub type DedupeKeyFn = Arc<dyn Fn(&JsonValue) -> Option<String> + Send + Sync>;
pub type MergeFn = Arc<dyn Fn(&JsonValue, &JsonValue) -> JsonValue + Send + Sync>;

/// Dedupe policy: key derivation plus collapse mode.
#[derive(Clone)]
pub struct DedupePolicy {
    pub mode: DedupeMode,
    key: Option<DedupeKeyFn>,
    merge: MergeFn,
}

impl DedupePolicy {
    pub fn none() -> Self {
        Self {
            mode: DedupeMode::None,
            key: None,
            merge: Arc::new(|_, incoming| incoming.clone()),
        }
    }

    pub fn new<F>(mode: DedupeMode, key: F) -> Self
    where
        F: Fn(&JsonValue) -> Option<String> + Send + Sync + 'static,
    {
        Self {
            mode,
            key: Some(Arc::new(key)),
            ..Self::none()
        }
    }

    pub fn single_flight<F>(key: F) -> Self
    where
        F: Fn(&JsonValue) -> Option<String> + Send + Sync + 'static,
    {
        Self::new(DedupeMode::SingleFlight, key)
    }

    pub fn drop_duplicate<F>(key: F) -> Self
    where
        F: Fn(&JsonValue) -> Option<String> + Send + Sync + 'static,
    {
        Self::new(DedupeMode::DropDuplicate, key)
    }

    /// Merge mode; `merge(existing, incoming)` yields the queued job's new payload.
    pub fn merge_duplicate<F, M>(key: F, merge: M) -> Self
    where
        F: Fn(&JsonValue) -> Option<String> + Send + Sync + 'static,
        M: Fn(&JsonValue, &JsonValue) -> JsonValue + Send + Sync + 'static,
    {
        Self {
            merge: Arc::new(merge),
            ..Self::new(DedupeMode::MergeDuplicate, key)
        }
    }

    /// Key derived from a top-level string field of the payload.
    pub fn field_key(field: &'static str) -> impl Fn(&JsonValue) -> Option<String> + Send + Sync {
        move |payload| payload.get(field).and_then(JsonValue::as_str).map(str::to_string)
    }

    pub fn key_for(&self, payload: &JsonValue) -> Option<String> {
        if self.mode == DedupeMode::None {
            return None;
        }
        self.key.as_ref().and_then(|key| key(payload))
    }

    pub fn merge(&self, existing: &JsonValue, incoming: &JsonValue) -> JsonValue {
        (self.merge)(existing, incoming)
    }
}

impl Default for DedupePolicy {
    fn default() -> Self {
        Self::none()
    }
}

impl fmt::Debug for DedupePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DedupePolicy")
            .field("mode", &self.mode)
            .field("keyed", &self.key.is_some())
            .finish()
    }
}

/// What cancelling a running job does.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum CancelStrategy {
    /// Signal the runner and wait up to the graceful wait for it to settle.
    Interrupt,
    /// Terminalize right away and abort the runner.
    Immediate,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct CancelPolicy {
    pub strategy: CancelStrategy,
    pub graceful_wait: Duration,
}

impl Default for CancelPolicy {
    fn default() -> Self {
        Self {
            strategy: CancelStrategy::Interrupt,
            graceful_wait: Duration::from_secs(5),
        }
    }
}

impl CancelPolicy {
    pub fn interrupt(graceful_wait: Duration) -> Self {
        Self {
            strategy: CancelStrategy::Interrupt,
            graceful_wait,
        }
    }

    pub fn immediate() -> Self {
        Self {
            strategy: CancelStrategy::Immediate,
            graceful_wait: Duration::ZERO,
        }
    }
}

/// One-time setup a handler wants in its worker session.
#[derive(Debug, Clone, PartialEq)]
pub struct Bootstrap {
    /// Distinct keys may coexist; each runs at most once per session.
    pub key: String,
    pub instructions: JsonValue,
}

/// Run the job inside the `(owner, handler)` worker session.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkerBinding {
    pub handler_id: HandlerId,
    pub bootstrap: Option<Bootstrap>,
}

impl WorkerBinding {
    pub fn new(handler_id: HandlerId) -> Self {
        Self {
            handler_id,
            bootstrap: None,
        }
    }

    pub fn with_bootstrap(mut self, key: impl Into<String>, instructions: JsonValue) -> Self {
        self.bootstrap = Some(Bootstrap {
            key: key.into(),
            instructions,
        });
        self
    }
}

/// Progress updates from a running job.
pub trait ProgressSink: Send + Sync {
    fn progress(&self, job: &Job, progress: JsonValue);
    fn step(&self, job: &Job, step_id: String);
    fn execution(&self, job: &Job, execution_id: String);
}

/// Sink that drops every update.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopProgress;

impl ProgressSink for NoopProgress {
    fn progress(&self, _job: &Job, _progress: JsonValue) {}
    fn step(&self, _job: &Job, _step_id: String) {}
    fn execution(&self, _job: &Job, _execution_id: String) {}
}

/// Everything a runner sees while executing one attempt.
#[derive(Clone)]
pub struct JobContext {
    job: Job,
    cancel: CancellationToken,
    session: Option<WorkerSessionHandle>,
    progress: Arc<dyn ProgressSink>,
}

impl JobContext {
    pub fn new(job: Job, cancel: CancellationToken, progress: Arc<dyn ProgressSink>) -> Self {
        Self {
            job,
            cancel,
            session: None,
            progress,
        }
    }

    pub fn with_session(mut self, session: WorkerSessionHandle) -> Self {
        self.session = Some(session);
        self
    }

    /// Snapshot of the job taken when the attempt started.
    pub fn job(&self) -> &Job {
        &self.job
    }

    pub fn payload(&self) -> &JsonValue {
        &self.job.payload
    }

    /// Typed view of the payload.
    pub fn payload_as<T: DeserializeOwned>(&self) -> Result<T, JobError> {
        T::deserialize(&self.job.payload).map_err(|err| JobError::InvalidPayload(err.to_string()))
    }

    pub fn session(&self) -> Option<&WorkerSessionHandle> {
        self.session.as_ref()
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Resolves once cancellation is requested.
    pub async fn cancelled(&self) {
        self.cancel.cancelled().await
    }

    pub fn report_progress(&self, progress: JsonValue) {
        self.progress.progress(&self.job, progress);
    }

    pub fn set_step(&self, step_id: impl Into<String>) {
        self.progress.step(&self.job, step_id.into());
    }

    pub fn set_execution(&self, execution_id: impl Into<String>) {
        self.progress.execution(&self.job, execution_id.into());
    }
}

impl fmt::Debug for JobContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobContext")
            .field("job_id", &self.job.id)
            .field("cancelled", &self.cancel.is_cancelled())
            .field("session", &self.session)
            .finish_non_exhaustive()
    }
}

/// The work a job type performs, plus idempotent settlement hooks.
#[async_trait]
pub trait JobRunner: Send + Sync {
    async fn run(&self, ctx: JobContext) -> Result<JsonValue, JobError>;

    async fn on_completed(&self, _job: &Job) {}

    async fn on_failed(&self, _job: &Job) {}

    async fn on_canceled(&self, _job: &Job) {}
}

/// Load-time descriptor of one job type.
#[derive(Clone)]
pub struct JobDefinition {
    pub job_type: String,
    pub version: u32,
    pub payload: Validator,
    pub result: Validator,
    pub dedupe: DedupePolicy,
    pub retry: RetryPolicy,
    pub timeout: Duration,
    pub cancel: CancelPolicy,
    pub worker: Option<WorkerBinding>,
    pub runner: Arc<dyn JobRunner>,
}

impl JobDefinition {
    pub fn new(job_type: impl Into<String>, runner: Arc<dyn JobRunner>) -> Self {
        Self {
            job_type: job_type.into(),
            version: 1,
            payload: Validator::any(),
            result: Validator::any(),
            dedupe: DedupePolicy::none(),
            retry: RetryPolicy::default(),
            timeout: Duration::from_secs(300),
            cancel: CancelPolicy::default(),
            worker: None,
            runner,
        }
    }

    pub fn with_version(mut self, version: u32) -> Self {
        self.version = version;
        self
    }

    pub fn with_payload(mut self, validator: Validator) -> Self {
        self.payload = validator;
        self
    }

    pub fn with_result(mut self, validator: Validator) -> Self {
        self.result = validator;
        self
    }

    pub fn with_dedupe(mut self, dedupe: DedupePolicy) -> Self {
        self.dedupe = dedupe;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_cancel(mut self, cancel: CancelPolicy) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_worker(mut self, worker: WorkerBinding) -> Self {
        self.worker = Some(worker);
        self
    }

    /// Attempts allowed for jobs of this type (never less than one).
    pub fn max_attempts(&self) -> u32 {
        self.retry.max_attempts.max(1)
    }
}

impl fmt::Debug for JobDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobDefinition")
            .field("job_type", &self.job_type)
            .field("version", &self.version)
            .field("dedupe", &self.dedupe)
            .field("retry", &self.retry)
            .field("timeout", &self.timeout)
            .field("cancel", &self.cancel)
            .field("worker", &self.worker)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DefinitionError {
    #[error("job type must not be blank")]
    BlankType,
    #[error("job type '{0}' is already registered")]
    Duplicate(String),
}

/// Immutable-after-startup catalog of job definitions.
#[derive(Debug, Default, Clone)]
pub struct JobDefinitionRegistry {
    definitions: BTreeMap<String, Arc<JobDefinition>>,
}

impl JobDefinitionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, definition: JobDefinition) -> Result<(), DefinitionError> {
        let job_type = definition.job_type.trim();
        if job_type.is_empty() || job_type != definition.job_type {
            return Err(DefinitionError::BlankType);
        }
        if self.definitions.contains_key(job_type) {
            return Err(DefinitionError::Duplicate(job_type.to_string()));
        }
        self.definitions
            .insert(definition.job_type.clone(), Arc::new(definition));
        Ok(())
    }

    /// Builder-style registration for startup code.
    pub fn with(mut self, definition: JobDefinition) -> Result<Self, DefinitionError> {
        self.register(definition)?;
        Ok(self)
    }

    pub fn get(&self, job_type: &str) -> Option<Arc<JobDefinition>> {
        self.definitions.get(job_type).cloned()
    }

    pub fn contains(&self, job_type: &str) -> bool {
        self.definitions.contains_key(job_type)
    }

    pub fn types(&self) -> impl Iterator<Item = &str> {
        self.definitions.keys().map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use serde::Deserialize;
    use serde_json::json;

    use super::*;

    struct Echo;

    #[async_trait]
    impl JobRunner for Echo {
        async fn run(&self, ctx: JobContext) -> Result<JsonValue, JobError> {
            Ok(ctx.payload().clone())
        }
    }

    #[derive(Deserialize)]
    #[serde(rename_all = "camelCase")]
    #[allow(dead_code)]
    struct SuggestReply {
        thread_id: String,
    }

    #[test]
    fn typed_validator_reports_serde_errors() {
        let v = Validator::deserializes_as::<SuggestReply>();
        assert!(v.validate(&json!({"threadId": "t1"})).is_ok());
        let err = v.validate(&json!({"thread": 1})).unwrap_err();
        assert!(err.contains("threadId"));
    }

    #[test]
    fn dedupe_key_ignored_when_mode_is_none() {
        let mut policy = DedupePolicy::single_flight(DedupePolicy::field_key("threadId"));
        assert_eq!(policy.key_for(&json!({"threadId": "t1"})).as_deref(), Some("t1"));
        assert_eq!(policy.key_for(&json!({})), None);

        policy.mode = DedupeMode::None;
        assert_eq!(policy.key_for(&json!({"threadId": "t1"})), None);
    }

    #[test]
    fn merge_policy_folds_payloads() {
        let policy = DedupePolicy::merge_duplicate(DedupePolicy::field_key("threadId"), |old, new| {
            let mut merged = old.clone();
            merged["count"] = json!(old["count"].as_u64().unwrap_or(1) + new["count"].as_u64().unwrap_or(1));
            merged
        });
        let merged = policy.merge(&json!({"threadId": "t", "count": 1}), &json!({"threadId": "t", "count": 2}));
        assert_eq!(merged["count"], 3);
    }

    #[test]
    fn registry_rejects_duplicates_and_blank_types() {
        let mut registry = JobDefinitionRegistry::new();
        registry.register(JobDefinition::new("echo", Arc::new(Echo))).unwrap();

        assert_eq!(
            registry.register(JobDefinition::new("echo", Arc::new(Echo))),
            Err(DefinitionError::Duplicate("echo".into()))
        );
        assert_eq!(
            registry.register(JobDefinition::new("  ", Arc::new(Echo))),
            Err(DefinitionError::BlankType)
        );
        assert!(registry.contains("echo"));
        assert_eq!(registry.types().collect::<Vec<_>>(), vec!["echo"]);
    }

    #[test]
    fn max_attempts_is_at_least_one() {
        let def = JobDefinition::new("echo", Arc::new(Echo)).with_retry(RetryPolicy {
            max_attempts: 0,
            ..Default::default()
        });
        assert_eq!(def.max_attempts(), 1);
    }
}
