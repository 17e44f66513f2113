use super::crud::{self, Admission};
use super::error::AppError;
use super::schema::{
    CancelRunResponse, CreateRunResponse, GetRunResponse, GuardEventListResponse,
    SpanListResponse,
};
use crate::app::AppState;
use crate::service::correlation_service::{CORRELATION_HEADER, correlation_id_from};
use crate::service::internal_auth_service::{SIGNATURE_HEADER, verify_internal_signature};
use crate::service::metrics_service;
use axum::Json;
use axum::body::{Body, to_bytes};
use axum::extract::{Path, State};
use axum::http::{HeaderMap, HeaderValue, StatusCode, header};
use axum::response::IntoResponse;
use tracing::{error, info, warn};

pub const TENANT_HEADER: &str = "x-tenant-id";
pub const CALLER_HEADER: &str = "x-caller-id";
const DEFAULT_TENANT: &str = "default";

pub async fn create_run(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Body,
) -> impl IntoResponse {
    let admission = admission_from(&headers);
    let out_headers = response_headers(&admission.correlation_id);

    let bytes = match to_bytes(body, state.config.max_body_bytes).await {
        Ok(bytes) => bytes,
        Err(_) => {
            return error_create(
                out_headers,
                AppError::payload_too_large(
                    "PAYLOAD_TOO_LARGE",
                    format!("request body exceeds {} bytes", state.config.max_body_bytes),
                ),
            );
        }
    };
    if let Err(err) = verify_write_auth(&state, &headers, &bytes) {
        return error_create(out_headers, err);
    }

    match crud::create_run(&state, &admission, &headers, &bytes).await {
        Ok(admitted) => {
            let status = if admitted.fresh {
                StatusCode::CREATED
            } else {
                StatusCode::OK
            };
            if let Some(run) = &admitted.response.run {
                info!(
                    run_id = %run.run_id,
                    idempotent = admitted.response.idempotent,
                    correlation_id = %admission.correlation_id,
                    "create run answered"
                );
                if admitted.fresh {
                    crud::start_run(&state, &run.run_id).await;
                }
            }
            (status, out_headers, Json(admitted.response))
        }
        Err(err) => error_create(out_headers, err),
    }
}

pub async fn get_run(
    State(state): State<AppState>,
    Path(run_id): Path<String>,
    headers: HeaderMap,
) -> impl IntoResponse {
    let out_headers = response_headers(&correlation_id_from(&headers));
    match crud::get_run(&state, &run_id).await {
        Ok(resp) => (StatusCode::OK, out_headers, Json(resp)),
        Err(err) => error_get(out_headers, err),
    }
}

pub async fn cancel_run(
    State(state): State<AppState>,
    Path(run_id): Path<String>,
    headers: HeaderMap,
    body: Body,
) -> impl IntoResponse {
    let out_headers = response_headers(&correlation_id_from(&headers));
    let bytes = match to_bytes(body, state.config.max_body_bytes).await {
        Ok(bytes) => bytes,
        Err(_) => {
            return error_cancel(
                out_headers,
                &run_id,
                AppError::payload_too_large(
                    "PAYLOAD_TOO_LARGE",
                    format!("request body exceeds {} bytes", state.config.max_body_bytes),
                ),
            );
        }
    };
    if let Err(err) = verify_write_auth(&state, &headers, &bytes) {
        return error_cancel(out_headers, &run_id, err);
    }
    match crud::cancel_run(&state, &run_id).await {
        Ok(resp) => (StatusCode::ACCEPTED, out_headers, Json(resp)),
        Err(err) => error_cancel(out_headers, &run_id, err),
    }
}

pub async fn list_spans(
    State(state): State<AppState>,
    Path(run_id): Path<String>,
    headers: HeaderMap,
) -> impl IntoResponse {
    let out_headers = response_headers(&correlation_id_from(&headers));
    match crud::list_spans(&state, &run_id) {
        Ok(resp) => (StatusCode::OK, out_headers, Json(resp)),
        Err(err) => {
            log_rejection(&err, "span listing failed");
            (
                err.status,
                out_headers,
                Json(SpanListResponse {
                    found: false,
                    run_id,
                    spans: Vec::new(),
                    error_code: Some(err.code.to_string()),
                    reason: err.message,
                }),
            )
        }
    }
}

pub async fn list_guard_events(
    State(state): State<AppState>,
    Path(run_id): Path<String>,
    headers: HeaderMap,
) -> impl IntoResponse {
    let out_headers = response_headers(&correlation_id_from(&headers));
    match crud::list_guard_events(&state, &run_id) {
        Ok(resp) => (StatusCode::OK, out_headers, Json(resp)),
        Err(err) => {
            log_rejection(&err, "guard event listing failed");
            (
                err.status,
                out_headers,
                Json(GuardEventListResponse {
                    found: false,
                    run_id,
                    events: Vec::new(),
                    verdicts: Vec::new(),
                    decisions: Vec::new(),
                    error_code: Some(err.code.to_string()),
                    reason: err.message,
                }),
            )
        }
    }
}

pub async fn metrics() -> impl IntoResponse {
    (StatusCode::OK, Json(metrics_service::snapshot()))
}

pub async fn health(State(state): State<AppState>) -> impl IntoResponse {
    let resp = crud::health(&state).await;
    let status = if resp.ok {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(resp))
}

fn admission_from(headers: &HeaderMap) -> Admission {
    let tenant_id = header_value(headers, TENANT_HEADER).unwrap_or_else(|| DEFAULT_TENANT.to_string());
    let caller_id = header_value(headers, CALLER_HEADER).unwrap_or_else(|| tenant_id.clone());
    Admission {
        tenant_id,
        caller_id,
        correlation_id: correlation_id_from(headers),
    }
}

fn header_value(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty() && v.len() <= 128)
        .map(ToOwned::to_owned)
}

fn response_headers(correlation_id: &str) -> HeaderMap {
    let mut headers = HeaderMap::new();
    if let Ok(value) = HeaderValue::from_str(correlation_id) {
        headers.insert(CORRELATION_HEADER, value);
    }
    headers
}

/// Signature covers the exact bytes received, so no re-serialization.
fn verify_write_auth(state: &AppState, headers: &HeaderMap, body: &[u8]) -> Result<(), AppError> {
    if !state.config.internal_auth_enabled {
        return Ok(());
    }
    let secret = state
        .config
        .internal_auth_secret
        .as_deref()
        .ok_or_else(|| AppError::internal("AUTH_CONFIG_ERROR", "internal auth secret missing"))?;
    let sig = headers
        .get(SIGNATURE_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .ok_or_else(|| {
            AppError::unauthorized("AUTH_MISSING_SIGNATURE", "missing x-internal-signature")
        })?;
    verify_internal_signature(body, sig, secret)
        .map_err(|e| AppError::unauthorized("AUTH_INVALID_SIGNATURE", e))
}

fn log_rejection(err: &AppError, msg: &'static str) {
    if err.status.is_server_error() {
        error!(error_code = err.code, reason = %err.message, "{msg}");
    } else {
        warn!(error_code = err.code, reason = %err.message, "{msg}");
    }
}

fn with_retry_after(mut headers: HeaderMap, err: &AppError) -> HeaderMap {
    if let Some(seconds) = err.retry_after_seconds {
        headers.insert(header::RETRY_AFTER, HeaderValue::from(seconds));
    }
    headers
}

fn error_create(
    headers: HeaderMap,
    err: AppError,
) -> (StatusCode, HeaderMap, Json<CreateRunResponse>) {
    if err.is_policy_denial() {
        info!(error_code = err.code, reason = %err.message, "run admission denied by policy");
    } else {
        log_rejection(&err, "run admission rejected");
    }
    let headers = with_retry_after(headers, &err);
    (
        err.status,
        headers,
        Json(CreateRunResponse {
            accepted: false,
            idempotent: false,
            run: None,
            error_code: Some(err.code.to_string()),
            retry_after_seconds: err.retry_after_seconds,
            reason: err.message,
        }),
    )
}

fn error_get(headers: HeaderMap, err: AppError) -> (StatusCode, HeaderMap, Json<GetRunResponse>) {
    log_rejection(&err, "run lookup failed");
    (
        err.status,
        headers,
        Json(GetRunResponse {
            found: false,
            run: None,
            error_code: Some(err.code.to_string()),
            reason: err.message,
        }),
    )
}

fn error_cancel(
    headers: HeaderMap,
    run_id: &str,
    err: AppError,
) -> (StatusCode, HeaderMap, Json<CancelRunResponse>) {
    log_rejection(&err, "run cancel rejected");
    (
        err.status,
        headers,
        Json(CancelRunResponse {
            accepted: false,
            run_id: run_id.to_string(),
            status: None,
            error_code: Some(err.code.to_string()),
            reason: err.message,
        }),
    )
}
