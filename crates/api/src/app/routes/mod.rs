use axum::{
    Router,
    routing::{get, post},
};

pub mod extensions;
pub mod jobs;
pub mod signals;
pub mod system;

/// Router for every engine endpoint.
pub fn router() -> Router {
    Router::new()
        .nest("/jobs", jobs::router())
        .route("/extensions", get(extensions::inventory))
        .route("/extensions/reload", post(extensions::reload))
        .route("/signals/:event", post(signals::emit))
}
