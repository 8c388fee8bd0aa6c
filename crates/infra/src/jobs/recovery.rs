//! Startup recovery of persisted jobs.
//!
//! Runs once before the scheduler starts, against whatever the store loaded:
//!
//! - `running` jobs belonged to a dead process: requeued with `attempts += 1`,
//!   or failed with `recovery_attempts_exhausted` when that was the last attempt
//! - jobs of a type no longer registered fail with `recovery_unknown_job_type:<type>`
//! - jobs whose payload no longer validates fail with `recovery_invalid_payload:<reason>`
//!
//! Nothing is dropped: every non-terminal job either stays schedulable or becomes
//! a visible failure.

use serde::Serialize;
use tracing::{info, warn};

use conductor_core::{JobId, JobState};

use super::definition::JobDefinitionRegistry;
use super::store::{JobStore, JobStoreError};
use super::types::Job;

pub const UNKNOWN_JOB_TYPE: &str = "recovery_unknown_job_type";
pub const INVALID_PAYLOAD: &str = "recovery_invalid_payload";
pub const ATTEMPTS_EXHAUSTED: &str = "recovery_attempts_exhausted";

/// What recovery did.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RecoveryReport {
    /// Previously running jobs put back in the queue.
    pub requeued: Vec<JobId>,
    /// Jobs failed during recovery, with their reason.
    pub failed: Vec<(JobId, String)>,
    /// Jobs that are queued after recovery (including requeued ones).
    pub queued: usize,
}

/// Outcome of recovery: the report plus the jobs the caller must act on.
#[derive(Debug, Default)]
pub struct Recovered {
    pub report: RecoveryReport,
    /// Every job left in `queued`, oldest first.
    pub queued: Vec<Job>,
    /// Jobs terminalized by recovery (for lifecycle publication).
    pub failed: Vec<Job>,
}

/// Reconcile persisted jobs with the current definitions.
pub fn recover(
    store: &dyn JobStore,
    registry: &JobDefinitionRegistry,
) -> Result<Recovered, JobStoreError> {
    let mut out = Recovered::default();

    for mut job in store.load()? {
        if job.is_terminal() {
            continue;
        }

        let failure = match registry.get(&job.job_type) {
            None => Some(format!("{UNKNOWN_JOB_TYPE}:{}", job.job_type)),
            Some(def) => match def.payload.validate(&job.payload) {
                Err(reason) => Some(format!("{INVALID_PAYLOAD}:{reason}")),
                Ok(()) if job.state == JobState::Running && job.attempts + 1 >= job.max_attempts => {
                    Some(ATTEMPTS_EXHAUSTED.to_string())
                }
                Ok(()) => None,
            },
        };

        match failure {
            Some(reason) => {
                warn!(job_id = %job.id, job_type = %job.job_type, reason = %reason, "job failed during recovery");
                if job.mark_failed(reason.clone()).is_err() {
                    continue;
                }
                store.update(&job)?;
                out.report.failed.push((job.id, reason));
                out.failed.push(job);
            }
            None => {
                if job.state == JobState::Running {
                    if job.requeue_after_crash().is_err() {
                        continue;
                    }
                    store.update(&job)?;
                    out.report.requeued.push(job.id);
                }
                out.queued.push(job);
            }
        }
    }

    out.report.queued = out.queued.len();
    info!(
        requeued = out.report.requeued.len(),
        failed = out.report.failed.len(),
        queued = out.report.queued,
        "job recovery complete"
    );
    Ok(out)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use async_trait::async_trait;
    use conductor_core::{JobRequest, OwnerId};
    use serde::Deserialize;
    use serde_json::{Value as JsonValue, json};

    use super::*;
    use crate::jobs::definition::{JobContext, JobDefinition, JobRunner, Validator};
    use crate::jobs::store::InMemoryJobStore;
    use crate::jobs::types::JobError;

    struct Noop;

    #[async_trait]
    impl JobRunner for Noop {
        async fn run(&self, _ctx: JobContext) -> Result<JsonValue, JobError> {
            Ok(JsonValue::Null)
        }
    }

    #[derive(Deserialize)]
    #[serde(rename_all = "camelCase")]
    #[allow(dead_code)]
    struct Payload {
        thread_id: String,
    }

    fn registry() -> JobDefinitionRegistry {
        JobDefinitionRegistry::new()
            .with(
                JobDefinition::new("suggest_reply", Arc::new(Noop))
                    .with_payload(Validator::deserializes_as::<Payload>()),
            )
            .unwrap()
    }

    fn job(job_type: &str, payload: JsonValue, max_attempts: u32) -> Job {
        Job::new(
            JobRequest::new(job_type, OwnerId::parse("p1").unwrap(), payload),
            1,
            None,
            max_attempts,
        )
    }

    fn running(mut j: Job) -> Job {
        j.mark_running().unwrap();
        j
    }

    #[test]
    fn running_jobs_are_requeued_with_an_extra_attempt() {
        let j = running(job("suggest_reply", json!({"threadId": "t"}), 3));
        let store = InMemoryJobStore::with_jobs([j.clone()]);

        let recovered = recover(&store, &registry()).unwrap();

        assert_eq!(recovered.report.requeued, vec![j.id]);
        let stored = store.get(j.id).unwrap().unwrap();
        assert_eq!(stored.state, JobState::Queued);
        assert_eq!(stored.attempts, 1);
        assert_eq!(recovered.queued.len(), 1);
    }

    #[test]
    fn unknown_types_and_invalid_payloads_fail_visibly() {
        let unknown = job("retired_type", json!({}), 3);
        let invalid = running(job("suggest_reply", json!({"thread": 1}), 3));
        let store = InMemoryJobStore::with_jobs([unknown.clone(), invalid.clone()]);

        let recovered = recover(&store, &registry()).unwrap();

        let unknown = store.get(unknown.id).unwrap().unwrap();
        assert_eq!(unknown.state, JobState::Failed);
        assert_eq!(unknown.error.as_deref(), Some("recovery_unknown_job_type:retired_type"));

        let invalid = store.get(invalid.id).unwrap().unwrap();
        assert_eq!(invalid.state, JobState::Failed);
        assert!(invalid.error.as_deref().unwrap().starts_with("recovery_invalid_payload:"));

        assert_eq!(recovered.failed.len(), 2);
        assert!(recovered.queued.is_empty());
    }

    #[test]
    fn last_attempt_is_not_requeued() {
        let j = running(job("suggest_reply", json!({"threadId": "t"}), 1));
        let store = InMemoryJobStore::with_jobs([j.clone()]);

        recover(&store, &registry()).unwrap();

        let stored = store.get(j.id).unwrap().unwrap();
        assert_eq!(stored.state, JobState::Failed);
        assert_eq!(stored.error.as_deref(), Some(ATTEMPTS_EXHAUSTED));
        assert_eq!(stored.attempts, 1);
    }

    #[test]
    fn terminal_and_queued_jobs_are_left_alone() {
        let queued = job("suggest_reply", json!({"threadId": "t"}), 3);
        let mut done = running(job("suggest_reply", json!({"threadId": "t"}), 3));
        done.mark_completed(json!("ok")).unwrap();
        let store = InMemoryJobStore::with_jobs([queued.clone(), done.clone()]);

        let recovered = recover(&store, &registry()).unwrap();

        assert_eq!(recovered.report.queued, 1);
        assert!(recovered.report.requeued.is_empty());
        assert_eq!(store.get(done.id).unwrap().unwrap(), done);
    }
}
