use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Extension, Path, Query},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
};

use conductor_core::JobId;

use crate::app::services::{self, AppServices};
use crate::app::{dto, errors};

pub fn router() -> Router {
    Router::new()
        .route("/", get(list_jobs).post(create_job))
        .route("/stream", get(stream))
        .route("/:id", get(get_job))
        .route("/:id/cancel", post(cancel_job))
}

fn parse_job_id(raw: &str) -> Result<JobId, axum::response::Response> {
    raw.parse::<JobId>().map_err(|e| {
        errors::json_error(StatusCode::BAD_REQUEST, "invalid_id", e.to_string())
    })
}

pub async fn create_job(
    Extension(services): Extension<Arc<AppServices>>,
    Json(body): Json<dto::CreateJobRequest>,
) -> axum::response::Response {
    let request = match body.into_request() {
        Ok(r) => r,
        Err(msg) => return errors::json_error(StatusCode::BAD_REQUEST, "validation_error", msg),
    };

    let queue = services.orchestrator().queue();
    let receipt = match queue.enqueue(request) {
        Ok(r) => r,
        Err(e) => return errors::queue_error_to_response(e),
    };
    let job = match queue.get(receipt.job_id) {
        Ok(job) => job,
        Err(e) => return errors::queue_error_to_response(e),
    };

    let status = match receipt.status {
        conductor_core::EnqueueStatus::Queued => StatusCode::CREATED,
        conductor_core::EnqueueStatus::AlreadyQueued => StatusCode::OK,
    };
    (status, Json(dto::CreateJobResponse { receipt, job })).into_response()
}

pub async fn get_job(
    Extension(services): Extension<Arc<AppServices>>,
    Path(id): Path<String>,
) -> axum::response::Response {
    let job_id = match parse_job_id(&id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };
    match services.orchestrator().queue().get(job_id) {
        Ok(job) => (StatusCode::OK, Json(job)).into_response(),
        Err(e) => errors::queue_error_to_response(e),
    }
}

pub async fn list_jobs(
    Extension(services): Extension<Arc<AppServices>>,
    Query(query): Query<dto::ListJobsQuery>,
) -> axum::response::Response {
    let filter = match query.into_filter() {
        Ok(f) => f,
        Err(msg) => return errors::json_error(StatusCode::BAD_REQUEST, "validation_error", msg),
    };
    match services.orchestrator().queue().list(&filter) {
        Ok(jobs) => (StatusCode::OK, Json(dto::ListJobsResponse { jobs })).into_response(),
        Err(e) => errors::queue_error_to_response(e),
    }
}

pub async fn cancel_job(
    Extension(services): Extension<Arc<AppServices>>,
    Path(id): Path<String>,
) -> axum::response::Response {
    let job_id = match parse_job_id(&id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };
    match services.orchestrator().queue().cancel(job_id).await {
        Ok(job) => (StatusCode::OK, Json(job)).into_response(),
        Err(e) => errors::queue_error_to_response(e),
    }
}

pub async fn stream(
    Extension(services): Extension<Arc<AppServices>>,
    Query(query): Query<dto::StreamQuery>,
) -> axum::response::Response {
    let owner_id = match query.owner_id.map(conductor_core::OwnerId::parse).transpose() {
        Ok(owner) => owner,
        Err(e) => {
            return errors::json_error(StatusCode::BAD_REQUEST, "validation_error", e.to_string());
        }
    };
    services::lifecycle_sse_stream(services, owner_id).into_response()
}
