//! Durable job queue: definitions, persistence, scheduling and recovery.
//!
//! ## Design
//!
//! - Jobs are owner-scoped and typed; every type has exactly one registered definition
//! - At most one running job per owner lane, bounded globally
//! - Retry policy with pluggable backoff; exhausted or fatal jobs end `failed`
//! - Every transition is persisted before it is published
//! - Startup recovery never drops a job silently
//!
//! ## Components
//!
//! - `JobDefinitionRegistry`: validators, dedupe/retry/timeout/cancel policies, runner
//! - `JobStore`: persistence (in-memory or the atomic JSON file store)
//! - `QueueManager`: admission, lanes, supervision, cancellation, drain
//! - `ExecutionHook`: where an attempt runs (in-process or inside a worker session)

pub mod definition;
pub mod execution;
pub mod file_store;
pub mod lanes;
pub mod manager;
pub mod recovery;
pub mod store;
pub mod types;

pub use definition::{
    Bootstrap, CancelPolicy, CancelStrategy, DedupeMode, DedupePolicy, DefinitionError,
    JobContext, JobDefinition, JobDefinitionRegistry, JobRunner, NoopProgress, ProgressSink,
    Validator, WorkerBinding,
};
pub use execution::{DirectExecution, ExecutionHook};
pub use file_store::FileJobStore;
pub use lanes::{LaneConfig, LaneScheduler};
pub use manager::{QueueError, QueueManager, QueueStats, StopReport};
pub use recovery::{RecoveryReport, recover};
pub use store::{InMemoryJobStore, JobFilter, JobStore, JobStoreError};
pub use types::{
    BackoffStrategy, CancelReason, ErrorClass, Job, JobError, RetryPolicy, RunningContext,
};
