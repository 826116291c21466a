use crate::service_context::ServiceContext;
use axum::{extract::State, http::StatusCode, Json};
use std::sync::Arc;

/// 200 while the batch scheduler is alive, 503 before it starts, after it
/// dies, or once shutdown has begun.
pub async fn healthz(State(ctx): State<Arc<ServiceContext>>) -> (StatusCode, &'static str) {
    if ctx.is_shutting_down() {
        (StatusCode::SERVICE_UNAVAILABLE, "shutting down")
    } else if ctx.state.active_workers("inference") == 0 {
        (StatusCode::SERVICE_UNAVAILABLE, "scheduler not running")
    } else {
        (StatusCode::OK, "ok")
    }
}

/// Counters, per-stage progress and queue depths.
pub async fn stats(State(ctx): State<Arc<ServiceContext>>) -> Json<serde_json::Value> {
    Json(ctx.state.to_progress_json())
}
