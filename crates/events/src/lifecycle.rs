//! Job lifecycle messages published once per state transition.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use conductor_core::{JobId, JobState, OwnerId};

/// Which transition a lifecycle message describes.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleKind {
    JobQueued,
    JobStarted,
    JobProgress,
    JobCompleted,
    JobFailed,
    JobCanceled,
}

impl LifecycleKind {
    pub fn as_str(self) -> &'static str {
        match self {
            LifecycleKind::JobQueued => "job_queued",
            LifecycleKind::JobStarted => "job_started",
            LifecycleKind::JobProgress => "job_progress",
            LifecycleKind::JobCompleted => "job_completed",
            LifecycleKind::JobFailed => "job_failed",
            LifecycleKind::JobCanceled => "job_canceled",
        }
    }

    /// The lifecycle kind that announces a job entering `state`.
    pub fn for_state(state: JobState) -> Self {
        match state {
            JobState::Queued => LifecycleKind::JobQueued,
            JobState::Running => LifecycleKind::JobStarted,
            JobState::Completed => LifecycleKind::JobCompleted,
            JobState::Failed => LifecycleKind::JobFailed,
            JobState::Canceled => LifecycleKind::JobCanceled,
        }
    }
}

/// One lifecycle message, shaped for the transport fan-out layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobLifecycleEvent {
    #[serde(rename = "type")]
    pub kind: LifecycleKind,
    pub job_id: JobId,
    pub owner_id: OwnerId,
    pub job_type: String,
    pub state: JobState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<JsonValue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress: Option<JsonValue>,
    pub at: DateTime<Utc>,
}

impl JobLifecycleEvent {
    pub fn new(
        kind: LifecycleKind,
        job_id: JobId,
        owner_id: OwnerId,
        job_type: impl Into<String>,
        state: JobState,
    ) -> Self {
        Self {
            kind,
            job_id,
            owner_id,
            job_type: job_type.into(),
            state,
            source_id: None,
            result: None,
            error: None,
            progress: None,
            at: Utc::now(),
        }
    }

    pub fn with_source(mut self, source_id: Option<String>) -> Self {
        self.source_id = source_id;
        self
    }

    pub fn with_result(mut self, result: Option<JsonValue>) -> Self {
        self.result = result;
        self
    }

    pub fn with_error(mut self, error: Option<String>) -> Self {
        self.error = error;
        self
    }

    pub fn with_progress(mut self, progress: JsonValue) -> Self {
        self.progress = Some(progress);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serializes_with_transport_names() {
        let event = JobLifecycleEvent::new(
            LifecycleKind::JobFailed,
            JobId::new(),
            OwnerId::parse("p1").unwrap(),
            "suggest_reply",
            JobState::Failed,
        )
        .with_error(Some("boom".into()));

        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "job_failed");
        assert_eq!(json["state"], "failed");
        assert_eq!(json["ownerId"], "p1");
        assert_eq!(json["error"], "boom");
        assert!(json.get("result").is_none());
    }

    #[test]
    fn kind_for_state_matches_names() {
        assert_eq!(LifecycleKind::for_state(JobState::Running).as_str(), "job_started");
        assert_eq!(LifecycleKind::for_state(JobState::Canceled).as_str(), "job_canceled");
    }
}
