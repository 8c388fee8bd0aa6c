//! Job vocabulary shared by the dispatcher, the queue and the HTTP surface.

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::error::CoreError;
use crate::id::{JobId, OwnerId};

/// Scheduling class of a job.
///
/// Ordering is meaningful: `Interactive < Background`, so sorting ascending
/// puts interactive work first.
#[derive(
    Debug, Copy, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Interactive,
    #[default]
    Background,
}

/// Lifecycle state of a job.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Queued,
    Running,
    Completed,
    Failed,
    Canceled,
}

impl JobState {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobState::Completed | JobState::Failed | JobState::Canceled)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            JobState::Queued => "queued",
            JobState::Running => "running",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
            JobState::Canceled => "canceled",
        }
    }

    /// Whether the lifecycle permits moving from `self` to `next`.
    ///
    /// `Running -> Queued` is allowed for retries and crash recovery; nothing
    /// leaves a terminal state.
    pub fn can_transition_to(self, next: JobState) -> bool {
        match (self, next) {
            (JobState::Queued, JobState::Running)
            | (JobState::Queued, JobState::Canceled)
            | (JobState::Queued, JobState::Failed) => true,
            (JobState::Running, JobState::Queued)
            | (JobState::Running, JobState::Completed)
            | (JobState::Running, JobState::Failed)
            | (JobState::Running, JobState::Canceled) => true,
            _ => false,
        }
    }
}

impl core::fmt::Display for JobState {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl core::str::FromStr for JobState {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(JobState::Queued),
            "running" => Ok(JobState::Running),
            "completed" => Ok(JobState::Completed),
            "failed" => Ok(JobState::Failed),
            "canceled" => Ok(JobState::Canceled),
            other => Err(CoreError::validation(format!("unknown job state '{other}'"))),
        }
    }
}

/// A request to enqueue a job, as produced by handlers or the HTTP surface.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobRequest {
    #[serde(rename = "type")]
    pub job_type: String,
    pub owner_id: OwnerId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_id: Option<String>,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default)]
    pub payload: JsonValue,
}

impl JobRequest {
    pub fn new(job_type: impl Into<String>, owner_id: OwnerId, payload: JsonValue) -> Self {
        Self {
            job_type: job_type.into(),
            owner_id,
            source_id: None,
            priority: Priority::default(),
            payload,
        }
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_source(mut self, source_id: impl Into<String>) -> Self {
        self.source_id = Some(source_id.into());
        self
    }
}

/// How an enqueue request was reconciled against in-flight jobs.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DedupeOutcome {
    /// A new job was persisted.
    Admitted,
    /// An in-flight job with the same key already exists; its id is returned.
    SingleFlight,
    /// The submission was discarded in favor of the in-flight job.
    Dropped,
    /// The payload was folded into the queued job with the same key.
    Merged,
}

/// External status of an enqueue call.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnqueueStatus {
    Queued,
    AlreadyQueued,
}

/// Result of `enqueue`: the job that now represents the request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnqueueReceipt {
    pub status: EnqueueStatus,
    pub job_id: JobId,
    pub dedupe_outcome: DedupeOutcome,
}

impl EnqueueReceipt {
    pub fn new(job_id: JobId, dedupe_outcome: DedupeOutcome) -> Self {
        let status = match dedupe_outcome {
            DedupeOutcome::Admitted => EnqueueStatus::Queued,
            _ => EnqueueStatus::AlreadyQueued,
        };
        Self {
            status,
            job_id,
            dedupe_outcome,
        }
    }
}
