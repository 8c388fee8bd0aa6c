use std::sync::Arc;

use axum::{Json, extract::Extension, http::StatusCode, response::IntoResponse};

use crate::app::services::AppServices;
use crate::app::{dto, errors};

/// Actor recorded for reloads that do not name one.
const DEFAULT_ACTOR: &str = "api";

pub async fn inventory(Extension(services): Extension<Arc<AppServices>>) -> impl IntoResponse {
    Json(services.orchestrator().governor().inventory())
}

pub async fn reload(
    Extension(services): Extension<Arc<AppServices>>,
    body: Option<Json<dto::ReloadRequest>>,
) -> axum::response::Response {
    let actor = body
        .and_then(|Json(req)| req.actor)
        .filter(|a| !a.trim().is_empty())
        .unwrap_or_else(|| DEFAULT_ACTOR.to_string());

    // Reload does filesystem discovery; keep it off the async workers.
    let governor = services.orchestrator().governor().clone();
    let outcome = tokio::task::spawn_blocking(move || governor.reload(&actor)).await;

    match outcome {
        Ok(Ok(summary)) => (StatusCode::OK, Json(summary)).into_response(),
        Ok(Err(e)) => errors::reload_error_to_response(e),
        Err(e) => errors::json_error(
            StatusCode::INTERNAL_SERVER_ERROR,
            "reload_aborted",
            e.to_string(),
        ),
    }
}
