use super::schema::{StreamQuery, StreamRejectedResponse};
use crate::app::AppState;
use crate::module::run::error::AppError;
use crate::service::connection_service::ConnectionGuard;
use crate::service::correlation_service::{CORRELATION_HEADER, correlation_id_from};
use crate::service::metrics_service;
use crate::service::sequencer_service::{Channel, Sequencer, StreamError, StreamEvent, Subscription};
use axum::Json;
use axum::body::Body;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, HeaderValue, header};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use futures::Stream;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info, warn};

pub const LAST_EVENT_ID_HEADER: &str = "last-event-id";
const CAPACITY_RETRY_AFTER_SECONDS: u64 = 2;
const KEEP_ALIVE_FRAME: &[u8] = b": keep-alive\n\n";

pub async fn stream_events(
    State(state): State<AppState>,
    Path(run_id): Path<String>,
    Query(query): Query<StreamQuery>,
    headers: HeaderMap,
) -> Response {
    let correlation_id = correlation_id_from(&headers);

    let channel = match query.channel.as_deref() {
        None => Channel::Logs,
        Some(raw) => match Channel::parse(raw) {
            Some(channel) => channel,
            None => {
                return rejected(
                    &correlation_id,
                    &run_id,
                    query.channel.clone(),
                    AppError::bad_request("INVALID_CHANNEL", "channel must be logs or guard"),
                );
            }
        },
    };
    let last_event_id = headers
        .get(LAST_EVENT_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(ToOwned::to_owned)
        .or(query.last_event_id);
    let channel_name = Some(channel.as_str().to_string());

    if state.runs.handle(&run_id).is_err() {
        return rejected(
            &correlation_id,
            &run_id,
            channel_name,
            AppError::not_found("RUN_NOT_FOUND", format!("run {run_id} not found")),
        );
    }

    // Slot first: a refused subscriber must never touch the sequencer.
    let guard = match state.connections.acquire(&run_id) {
        Ok(guard) => guard,
        Err(err) => return rejected(&correlation_id, &run_id, channel_name, stream_error(err)),
    };
    let subscription = match state
        .sequencer
        .subscribe(&run_id, channel, last_event_id.as_deref())
    {
        Ok(sub) => sub,
        Err(err) => return rejected(&correlation_id, &run_id, channel_name, stream_error(err)),
    };

    info!(
        run_id = %run_id,
        channel = channel.as_str(),
        replay = subscription.replay.len(),
        cursor = subscription.cursor,
        resumed = last_event_id.is_some(),
        correlation_id = %correlation_id,
        "event stream opened"
    );

    let timing = StreamTiming {
        keepalive: Duration::from_secs(state.config.stream_keepalive_seconds.max(1) as u64),
        idle_timeout: Duration::from_secs(state.config.stream_idle_timeout_seconds.max(1) as u64),
    };
    let body = event_stream(
        Arc::clone(&state.sequencer),
        channel,
        subscription,
        guard,
        timing,
    );
    sse_response(&correlation_id, body)
}

#[derive(Debug, Clone, Copy)]
struct StreamTiming {
    keepalive: Duration,
    idle_timeout: Duration,
}

/// Replay, then live events. `cursor` is the highest seq written to this
/// connection; anything at or below it is a duplicate.
fn event_stream(
    sequencer: Arc<Sequencer>,
    channel: Channel,
    subscription: Subscription,
    guard: ConnectionGuard,
    timing: StreamTiming,
) -> impl Stream<Item = Result<Bytes, Infallible>> + Send + 'static {
    async_stream::stream! {
        let guard = guard;
        let run_id = guard.run_id().to_string();
        let Subscription { replay, live, mut cursor } = subscription;

        metrics_service::add_events_replayed(replay.len() as u64);
        for event in &replay {
            if let Some(frame) = frame(event) {
                yield Ok(frame);
            }
        }

        if let Some(mut live) = live {
            let mut last_activity = Instant::now();
            loop {
                match tokio::time::timeout(timing.keepalive, live.recv()).await {
                    Err(_) => {
                        if last_activity.elapsed() >= timing.idle_timeout {
                            debug!(run_id = %run_id, "event stream idle timeout");
                            break;
                        }
                        yield Ok(Bytes::from_static(KEEP_ALIVE_FRAME));
                    }
                    Ok(Ok(event)) => {
                        last_activity = Instant::now();
                        if event.seq <= cursor {
                            metrics_service::inc_duplicates_dropped();
                            continue;
                        }
                        cursor = event.seq;
                        metrics_service::inc_events_live();
                        if let Some(frame) = frame(&event) {
                            yield Ok(frame);
                        }
                    }
                    Ok(Err(RecvError::Lagged(skipped))) => {
                        warn!(run_id = %run_id, skipped, cursor, "subscriber lagged; refilling from buffer");
                        match sequencer.events_after(&run_id, channel, cursor) {
                            Ok(events) => {
                                for event in events {
                                    if event.seq <= cursor {
                                        continue;
                                    }
                                    cursor = event.seq;
                                    metrics_service::add_events_replayed(1);
                                    if let Some(frame) = frame(&event) {
                                        yield Ok(frame);
                                    }
                                }
                            }
                            Err(err) => {
                                warn!(run_id = %run_id, reason = %err, "lag recovery failed");
                                break;
                            }
                        }
                    }
                    Ok(Err(RecvError::Closed)) => break,
                }
            }
        }

        debug!(run_id = %run_id, channel = channel.as_str(), cursor, "event stream finished");
        drop(guard);
    }
}

fn frame(event: &StreamEvent) -> Option<Bytes> {
    match serde_json::to_string(event) {
        Ok(data) => Some(Bytes::from(format!(
            "id: {}\nevent: {}\ndata: {data}\n\n",
            event.event_id,
            event.channel.as_str()
        ))),
        Err(e) => {
            warn!(event_id = %event.event_id, error = %e, "failed to serialize stream event");
            None
        }
    }
}

fn sse_response<S>(correlation_id: &str, stream: S) -> Response
where
    S: Stream<Item = Result<Bytes, Infallible>> + Send + 'static,
{
    let mut headers = HeaderMap::new();
    headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("text/event-stream"));
    headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    headers.insert(header::CONNECTION, HeaderValue::from_static("keep-alive"));
    headers.insert("x-accel-buffering", HeaderValue::from_static("no"));
    if let Ok(value) = HeaderValue::from_str(correlation_id) {
        headers.insert(CORRELATION_HEADER, value);
    }
    (headers, Body::from_stream(stream)).into_response()
}

fn stream_error(err: StreamError) -> AppError {
    match &err {
        StreamError::Capacity { .. } => AppError::service_unavailable(
            err.code(),
            err.to_string(),
            Some(CAPACITY_RETRY_AFTER_SECONDS),
        ),
        StreamError::UnknownRun(_) => AppError::not_found(err.code(), err.to_string()),
        StreamError::MalformedEventId(_) => AppError::bad_request(err.code(), err.to_string()),
        StreamError::Closed(_) => AppError::conflict(err.code(), err.to_string()),
        StreamError::Poisoned => AppError::internal(err.code(), err.to_string()),
    }
}

fn rejected(
    correlation_id: &str,
    run_id: &str,
    channel: Option<String>,
    err: AppError,
) -> Response {
    warn!(run_id = %run_id, error_code = err.code, reason = %err.message, "event stream refused");
    let mut headers = HeaderMap::new();
    if let Ok(value) = HeaderValue::from_str(correlation_id) {
        headers.insert(CORRELATION_HEADER, value);
    }
    if let Some(seconds) = err.retry_after_seconds {
        headers.insert(header::RETRY_AFTER, HeaderValue::from(seconds));
    }
    (
        err.status,
        headers,
        Json(StreamRejectedResponse {
            subscribed: false,
            run_id: run_id.to_string(),
            channel,
            error_code: err.code.to_string(),
            retry_after_seconds: err.retry_after_seconds,
            reason: err.message,
        }),
    )
        .into_response()
}
