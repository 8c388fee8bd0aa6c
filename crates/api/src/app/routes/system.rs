use std::sync::Arc;

use axum::{Json, extract::Extension, http::StatusCode, response::IntoResponse};
use serde_json::json;

use crate::app::services::AppServices;

pub async fn health(Extension(services): Extension<Arc<AppServices>>) -> axum::response::Response {
    match services.orchestrator().queue().stats() {
        Ok(stats) => (StatusCode::OK, Json(json!({ "status": "ok", "queue": stats }))).into_response(),
        Err(e) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({ "status": "degraded", "message": e.to_string() })),
        )
            .into_response(),
    }
}
