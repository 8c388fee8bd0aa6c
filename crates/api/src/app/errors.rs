use axum::http::StatusCode;
use axum::response::IntoResponse;
use serde_json::json;

use conductor_infra::extensions::ReloadError;
use conductor_infra::jobs::QueueError;

pub fn queue_error_to_response(err: QueueError) -> axum::response::Response {
    match err {
        QueueError::NotFound(id) => {
            json_error(StatusCode::NOT_FOUND, "not_found", format!("job {id} not found"))
        }
        e @ QueueError::AlreadyTerminal { .. } => {
            json_error(StatusCode::CONFLICT, "already_terminal", e.to_string())
        }
        e @ QueueError::UnknownJobType(_) => {
            json_error(StatusCode::UNPROCESSABLE_ENTITY, "unknown_job_type", e.to_string())
        }
        QueueError::InvalidPayload(msg) => {
            json_error(StatusCode::UNPROCESSABLE_ENTITY, "invalid_payload", msg)
        }
        e @ QueueError::Stopped => {
            json_error(StatusCode::SERVICE_UNAVAILABLE, "queue_stopped", e.to_string())
        }
        e @ QueueError::AlreadyStarted => json_error(StatusCode::CONFLICT, "conflict", e.to_string()),
        e @ QueueError::Transition(_) => {
            json_error(StatusCode::CONFLICT, "invalid_transition", e.to_string())
        }
        e @ QueueError::Store(_) => {
            json_error(StatusCode::INTERNAL_SERVER_ERROR, "store_error", e.to_string())
        }
    }
}

pub fn reload_error_to_response(err: ReloadError) -> axum::response::Response {
    match err {
        e @ ReloadError::InProgress => {
            json_error(StatusCode::CONFLICT, "reload_in_progress", e.to_string())
        }
        ReloadError::Validation {
            active_version,
            failures,
        } => (
            StatusCode::UNPROCESSABLE_ENTITY,
            axum::Json(json!({
                "error": "reload_failed",
                "message": format!("{} module(s) failed validation", failures.len()),
                "activeVersion": active_version,
                "failures": failures,
            })),
        )
            .into_response(),
    }
}

pub fn json_error(
    status: StatusCode,
    code: &'static str,
    message: impl Into<String>,
) -> axum::response::Response {
    (
        status,
        axum::Json(json!({
            "error": code,
            "message": message.into(),
        })),
    )
        .into_response()
}
