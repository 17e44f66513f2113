use super::controller;
use crate::app::AppState;
use axum::Router;
use axum::routing::get;

pub fn register_routes(state: AppState) -> Router {
    Router::new()
        .route("/v1/runs/:run_id/events", get(controller::stream_events))
        .with_state(state)
}
