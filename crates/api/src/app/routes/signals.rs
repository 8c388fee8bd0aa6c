use std::sync::Arc;

use axum::{
    Json,
    extract::{Extension, Path},
    http::StatusCode,
    response::IntoResponse,
};

use crate::app::services::AppServices;
use crate::app::{dto, errors};

/// Signal ingress: fan `event` out to every subscribed handler.
pub async fn emit(
    Extension(services): Extension<Arc<AppServices>>,
    Path(event): Path<String>,
    body: Option<Json<dto::SignalRequest>>,
) -> axum::response::Response {
    let body = body.map(|Json(b)| b).unwrap_or_default();
    let runtime_event = match body.into_event(event.clone()) {
        Ok(e) => e,
        Err(msg) => return errors::json_error(StatusCode::BAD_REQUEST, "validation_error", msg),
    };

    let results = services.orchestrator().emit(runtime_event).await;
    (StatusCode::OK, Json(dto::SignalResponse { event, results })).into_response()
}
