mod common;

use axum::Router;
use axum::body::{Body, to_bytes};
use common::{cancel_run, create_run, parse_frames, send, test_config, wait_terminal, Frame};
use http::{Request, StatusCode};
use run_gateway::app::{AppState, build_router};
use serde_json::json;
use tower::util::ServiceExt;

fn five_step_task() -> serde_json::Value {
    let steps = (1..=5)
        .map(|i| json!({"type": "tool_call", "output": format!("step {i} done")}))
        .collect::<Vec<_>>();
    json!({
        "name": "five-steps",
        "input": {
            "steps": steps,
            "evidence": [{"content": "step 5 done", "source": "log"}]
        }
    })
}

fn events_request(run_id: &str, query: &str, last_event_id: Option<&str>) -> Request<Body> {
    let mut builder = Request::builder()
        .method("GET")
        .uri(format!("/v1/runs/{run_id}/events{query}"));
    if let Some(id) = last_event_id {
        builder = builder.header("last-event-id", id);
    }
    builder.body(Body::empty()).expect("request")
}

async fn read_stream(app: Router, req: Request<Body>) -> (StatusCode, Vec<Frame>) {
    let (status, _, bytes) = send(app, req).await;
    (status, parse_frames(&String::from_utf8_lossy(&bytes)))
}

async fn finished_run(app: Router) -> String {
    let (status, _, created) = create_run(app.clone(), "acme", &five_step_task()).await;
    assert_eq!(status, StatusCode::CREATED);
    let run_id = created.run.expect("run").run_id;
    wait_terminal(app, &run_id).await;
    run_id
}

fn seqs(frames: &[Frame]) -> Vec<u64> {
    frames
        .iter()
        .map(|f| f.data["seq"].as_u64().expect("seq"))
        .collect()
}

#[tokio::test]
async fn full_replay_is_ordered_and_ends_with_terminal_event() {
    let app = build_router(AppState::new(test_config(), None));
    let run_id = finished_run(app.clone()).await;

    let (status, frames) = read_stream(app, events_request(&run_id, "", None)).await;
    assert_eq!(status, StatusCode::OK);

    let seqs = seqs(&frames);
    let expected = (1..=seqs.len() as u64).collect::<Vec<_>>();
    assert_eq!(seqs, expected);
    assert!(frames.iter().all(|f| f.event == "logs"));
    assert_eq!(frames[0].data["type"], "run.status");
    assert_eq!(frames[0].data["payload"]["status"], "queued");
    let spans = frames
        .iter()
        .filter(|f| f.data["type"] == "span.recorded")
        .count();
    assert_eq!(spans, 5);
    let last = frames.last().expect("terminal frame");
    assert_eq!(last.data["type"], "run.complete");
    assert_eq!(
        frames.iter().filter(|f| f.data["type"] == "run.complete").count(),
        1
    );
}

#[tokio::test]
async fn reconnect_with_last_event_id_resumes_after_it() {
    let app = build_router(AppState::new(test_config(), None));
    let run_id = finished_run(app.clone()).await;
    let last_seen = format!("{run_id}:logs:3");

    let (status, frames) =
        read_stream(app, events_request(&run_id, "", Some(&last_seen))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(frames[0].id, format!("{run_id}:logs:4"));
    assert_eq!(seqs(&frames)[0], 4);
    assert!(seqs(&frames).windows(2).all(|w| w[1] == w[0] + 1));
}

#[tokio::test]
async fn header_takes_precedence_over_query_cursor() {
    let app = build_router(AppState::new(test_config(), None));
    let run_id = finished_run(app.clone()).await;
    let query = format!("?channel=logs&last_event_id={run_id}:logs:1");
    let header = format!("{run_id}:logs:5");

    let (_, frames) = read_stream(app, events_request(&run_id, &query, Some(&header))).await;
    assert_eq!(seqs(&frames)[0], 6);
}

#[tokio::test]
async fn guard_channel_carries_verdict_and_decision() {
    let app = build_router(AppState::new(test_config(), None));
    let run_id = finished_run(app.clone()).await;

    let (status, frames) = read_stream(app, events_request(&run_id, "?channel=guard", None)).await;
    assert_eq!(status, StatusCode::OK);
    assert!(frames.iter().all(|f| f.event == "guard"));
    let types = frames
        .iter()
        .map(|f| f.data["type"].as_str().unwrap_or_default().to_string())
        .collect::<Vec<_>>();
    assert!(types.contains(&"judge.verdict".to_string()));
    assert!(types.contains(&"shield.decision".to_string()));
    assert_eq!(seqs(&frames)[0], 1);
}

#[tokio::test]
async fn bad_cursor_and_channel_are_rejected() {
    let app = build_router(AppState::new(test_config(), None));
    let run_id = finished_run(app.clone()).await;

    let (status, _, bytes) = send(app.clone(), events_request(&run_id, "", Some("garbage"))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    let body: serde_json::Value = serde_json::from_slice(&bytes).expect("json");
    assert_eq!(body["error_code"], "INVALID_LAST_EVENT_ID");

    let (status, _, bytes) = send(app.clone(), events_request(&run_id, "?channel=debug", None)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    let body: serde_json::Value = serde_json::from_slice(&bytes).expect("json");
    assert_eq!(body["error_code"], "INVALID_CHANNEL");

    let (status, _, _) = send(app, events_request("run_missing", "", None)).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn cursor_from_another_run_falls_back_to_window() {
    let app = build_router(AppState::new(test_config(), None));
    let run_id = finished_run(app.clone()).await;

    let (status, frames) =
        read_stream(app, events_request(&run_id, "", Some("run_other:logs:4"))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(seqs(&frames)[0], 1);
}

#[tokio::test]
async fn cursor_at_max_seq_replays_nothing_and_ends_cleanly() {
    let app = build_router(AppState::new(test_config(), None));
    let run_id = finished_run(app.clone()).await;
    let cursor = format!("{run_id}:logs:{}", u64::MAX);

    let (status, frames) = read_stream(app.clone(), events_request(&run_id, "", Some(&cursor))).await;
    assert_eq!(status, StatusCode::OK);
    assert!(frames.is_empty());

    // The connection slot was released and the stream is still served.
    let (status, frames) = read_stream(app, events_request(&run_id, "", None)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(seqs(&frames)[0], 1);
}

#[tokio::test]
async fn connection_ceiling_rejects_only_the_new_subscriber() {
    let mut config = test_config();
    config.max_connections_per_run = 1;
    let app = build_router(AppState::new(config, None));
    let (_, _, created) = create_run(
        app.clone(),
        "acme",
        &json!({"name": "slow", "input": {"steps": [{"delay_ms": 5_000, "output": "x"}]}}),
    )
    .await;
    let run_id = created.run.expect("run").run_id;

    let held = app
        .clone()
        .oneshot(events_request(&run_id, "", None))
        .await
        .expect("response");
    assert_eq!(held.status(), StatusCode::OK);

    let (status, headers, bytes) = send(app.clone(), events_request(&run_id, "", None)).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert!(headers.contains_key("retry-after"));
    let body: serde_json::Value = serde_json::from_slice(&bytes).expect("json");
    assert_eq!(body["error_code"], "STREAM_CAPACITY_EXCEEDED");

    // The held subscriber still receives the run through to its end.
    let (cancel_status, _) = cancel_run(app.clone(), &run_id).await;
    assert_eq!(cancel_status, StatusCode::ACCEPTED);
    let bytes = to_bytes(held.into_body(), usize::MAX).await.expect("body");
    let frames = parse_frames(&String::from_utf8_lossy(&bytes));
    assert_eq!(
        frames.last().map(|f| f.data["type"].clone()),
        Some(json!("run.cancelled"))
    );

    let (status, _) = read_stream(app, events_request(&run_id, "", None)).await;
    assert_eq!(status, StatusCode::OK);
}
