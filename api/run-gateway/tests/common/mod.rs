#![allow(dead_code)]

use axum::Router;
use axum::body::{Body, to_bytes};
use http::{HeaderMap, Request, StatusCode};
use run_gateway::config::environment::AppConfig;
use run_gateway::module::run::schema::{
    CancelRunResponse, CreateRunResponse, GetRunResponse, GuardEventListResponse, RunView,
    SpanListResponse,
};
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::collections::HashMap;
use std::time::Duration;
use tower::util::ServiceExt;

pub fn test_config() -> AppConfig {
    AppConfig {
        rust_env: "test".to_string(),
        api_host: "127.0.0.1".to_string(),
        api_port: 0,
        redis_url: None,
        idempotency_ttl_seconds: 3600,
        backend_timeout_ms: 250,
        idempotency_wait_ms: 2_000,
        rate_limit_window_seconds: 60,
        rate_limit_max_requests: 1_000,
        rate_limit_fail_open: true,
        default_concurrency_limit: 50,
        tenant_plan_limits: HashMap::new(),
        max_body_bytes: 16 * 1024,
        privacy_mode: false,
        run_timeout_seconds: 10,
        run_retention_seconds: 3600,
        janitor_interval_seconds: 30,
        replay_window: 100,
        replay_buffer_capacity: 1000,
        max_connections_per_run: 4,
        stream_idle_timeout_seconds: 30,
        stream_keepalive_seconds: 15,
        judge_budget_ms: 500,
        judge_max_sentences: 24,
        judge_numeric_tolerance: 0.05,
        shield_block_threshold: 0.2,
        shield_approve_threshold: 0.8,
        internal_auth_enabled: false,
        internal_auth_secret: None,
    }
}

pub async fn send(app: Router, req: Request<Body>) -> (StatusCode, HeaderMap, Vec<u8>) {
    let resp = app.oneshot(req).await.expect("response");
    let status = resp.status();
    let headers = resp.headers().clone();
    let bytes = to_bytes(resp.into_body(), usize::MAX).await.expect("body");
    (status, headers, bytes.to_vec())
}

fn decode<T: DeserializeOwned>(bytes: &[u8]) -> T {
    serde_json::from_slice(bytes).expect("json body")
}

pub async fn create_run_raw(
    app: Router,
    tenant: &str,
    extra_headers: &[(&str, &str)],
    body: Vec<u8>,
) -> (StatusCode, HeaderMap, CreateRunResponse) {
    let mut builder = Request::builder()
        .method("POST")
        .uri("/v1/runs")
        .header("content-type", "application/json")
        .header("x-tenant-id", tenant);
    for (name, value) in extra_headers {
        builder = builder.header(*name, *value);
    }
    let req = builder.body(Body::from(body)).expect("request");
    let (status, headers, bytes) = send(app, req).await;
    (status, headers, decode(&bytes))
}

pub async fn create_run(
    app: Router,
    tenant: &str,
    body: &Value,
) -> (StatusCode, HeaderMap, CreateRunResponse) {
    create_run_raw(app, tenant, &[], serde_json::to_vec(body).expect("encode")).await
}

pub async fn get_run(app: Router, run_id: &str) -> (StatusCode, GetRunResponse) {
    let req = Request::builder()
        .method("GET")
        .uri(format!("/v1/runs/{run_id}"))
        .body(Body::empty())
        .expect("request");
    let (status, _, bytes) = send(app, req).await;
    (status, decode(&bytes))
}

pub async fn cancel_run(app: Router, run_id: &str) -> (StatusCode, CancelRunResponse) {
    let req = Request::builder()
        .method("POST")
        .uri(format!("/v1/runs/{run_id}/cancel"))
        .body(Body::empty())
        .expect("request");
    let (status, _, bytes) = send(app, req).await;
    (status, decode(&bytes))
}

pub async fn list_spans(app: Router, run_id: &str) -> (StatusCode, SpanListResponse) {
    let req = Request::builder()
        .method("GET")
        .uri(format!("/v1/runs/{run_id}/spans"))
        .body(Body::empty())
        .expect("request");
    let (status, _, bytes) = send(app, req).await;
    (status, decode(&bytes))
}

pub async fn list_guard_events(app: Router, run_id: &str) -> (StatusCode, GuardEventListResponse) {
    let req = Request::builder()
        .method("GET")
        .uri(format!("/v1/runs/{run_id}/guard-events"))
        .body(Body::empty())
        .expect("request");
    let (status, _, bytes) = send(app, req).await;
    (status, decode(&bytes))
}

/// Polls until the run is terminal and its terminal event has been emitted.
pub async fn wait_terminal(app: Router, run_id: &str) -> RunView {
    for _ in 0..200 {
        let (status, resp) = get_run(app.clone(), run_id).await;
        assert_eq!(status, StatusCode::OK);
        let run = resp.run.expect("run view");
        if run.status.is_terminal() && run.ended_at.is_some() {
            // Give the supervisor a moment to flush the terminal stream event.
            tokio::time::sleep(Duration::from_millis(20)).await;
            return run;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("run {run_id} did not reach a terminal state");
}

/// One parsed SSE frame.
#[derive(Debug, Clone)]
pub struct Frame {
    pub id: String,
    pub event: String,
    pub data: Value,
}

pub fn parse_frames(body: &str) -> Vec<Frame> {
    body.split("\n\n")
        .filter(|chunk| !chunk.trim().is_empty() && !chunk.starts_with(':'))
        .map(|chunk| {
            let mut id = String::new();
            let mut event = String::new();
            let mut data = Value::Null;
            for line in chunk.lines() {
                if let Some(v) = line.strip_prefix("id: ") {
                    id = v.to_string();
                } else if let Some(v) = line.strip_prefix("event: ") {
                    event = v.to_string();
                } else if let Some(v) = line.strip_prefix("data: ") {
                    data = serde_json::from_str(v).expect("frame data");
                }
            }
            Frame { id, event, data }
        })
        .collect()
}
