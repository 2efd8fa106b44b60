//! Top-level route registration: merges the proxy surface with the
//! admin surface under `/admin`, mirroring the teacher's router-merge
//! pattern in its app binary.

use std::sync::Arc;

use axum::Router;
use axum::http::StatusCode;
use axum::routing::{any, get};
use ccload_core::AppState;
use tokio::sync::watch;

pub fn build_router(state: Arc<AppState>, shutdown: watch::Sender<bool>) -> Router {
    Router::new()
        .route("/healthz", get(|| async { StatusCode::NO_CONTENT }))
        .route("/favicon.ico", get(|| async { StatusCode::NO_CONTENT }))
        .route("/{*path}", any(ccload_core::proxy_handler))
        .nest("/admin", ccload_admin::router(state.clone(), shutdown))
        .with_state(state)
}
