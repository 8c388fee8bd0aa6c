//! Request/response DTOs and mapping to engine types.

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use conductor_core::{EnqueueReceipt, JobRequest, JobState, OwnerId, Priority};
use conductor_events::{EmitResult, RuntimeEvent};
use conductor_infra::jobs::{Job, JobFilter};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateJobRequest {
    #[serde(rename = "type")]
    pub job_type: String,
    pub owner_id: String,
    #[serde(default)]
    pub source_id: Option<String>,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default)]
    pub payload: JsonValue,
}

impl CreateJobRequest {
    pub fn into_request(self) -> Result<JobRequest, String> {
        let owner_id = OwnerId::parse(self.owner_id).map_err(|e| e.to_string())?;
        let mut request =
            JobRequest::new(self.job_type, owner_id, self.payload).with_priority(self.priority);
        if let Some(source_id) = self.source_id {
            request = request.with_source(source_id);
        }
        Ok(request)
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateJobResponse {
    #[serde(flatten)]
    pub receipt: EnqueueReceipt,
    pub job: Job,
}

/// `GET /jobs` query string.
#[derive(Debug, Default, Deserialize)]
pub struct ListJobsQuery {
    pub owner_id: Option<String>,
    pub state: Option<String>,
    #[serde(rename = "type")]
    pub job_type: Option<String>,
}

impl ListJobsQuery {
    pub fn into_filter(self) -> Result<JobFilter, String> {
        let mut filter = JobFilter::all();
        if let Some(owner) = self.owner_id {
            filter.owner_id = Some(OwnerId::parse(owner).map_err(|e| e.to_string())?);
        }
        if let Some(state) = self.state {
            filter.state = Some(state.parse::<JobState>().map_err(|e| e.to_string())?);
        }
        filter.job_type = self.job_type;
        Ok(filter)
    }
}

#[derive(Debug, Serialize)]
pub struct ListJobsResponse {
    pub jobs: Vec<Job>,
}

#[derive(Debug, Default, Deserialize)]
pub struct StreamQuery {
    pub owner_id: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct ReloadRequest {
    /// Recorded in the audit log.
    #[serde(default)]
    pub actor: Option<String>,
}

/// Body of `POST /signals/{event}`.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignalRequest {
    #[serde(default)]
    pub owner_id: Option<String>,
    #[serde(default)]
    pub source_id: Option<String>,
    #[serde(default)]
    pub payload: JsonValue,
}

impl SignalRequest {
    pub fn into_event(self, name: String) -> Result<RuntimeEvent, String> {
        let mut event = RuntimeEvent::new(name, self.payload);
        if let Some(owner) = self.owner_id {
            event = event.with_owner(OwnerId::parse(owner).map_err(|e| e.to_string())?);
        }
        if let Some(source_id) = self.source_id {
            event = event.with_source(source_id);
        }
        Ok(event)
    }
}

#[derive(Debug, Serialize)]
pub struct SignalResponse {
    pub event: String,
    pub results: Vec<EmitResult>,
}
