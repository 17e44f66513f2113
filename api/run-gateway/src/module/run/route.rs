use super::controller;
use crate::app::AppState;
use axum::Router;
use axum::routing::{get, post};

pub fn register_routes(state: AppState) -> Router {
    Router::new()
        .route("/v1/runs", post(controller::create_run))
        .route("/v1/runs/:run_id", get(controller::get_run))
        .route("/v1/runs/:run_id/cancel", post(controller::cancel_run))
        .route("/v1/runs/:run_id/spans", get(controller::list_spans))
        .route(
            "/v1/runs/:run_id/guard-events",
            get(controller::list_guard_events),
        )
        .route("/v1/metrics", get(controller::metrics))
        .route("/v1/health", get(controller::health))
        .with_state(state)
}
