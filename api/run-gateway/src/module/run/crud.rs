use super::error::AppError;
use super::model::RunRecord;
use super::schema::{
    CancelRunResponse, CreateRunRequest, CreateRunResponse, GetRunResponse,
    GuardEventListResponse, HealthResponse, RunStatus, RunStatusTransition, RunView,
    SpanListResponse,
};
use crate::app::AppState;
use crate::infra::InfraClients;
use crate::service::concurrency_service::SlotDecision;
use crate::service::executor_service::{self, EVENT_RUN_STATUS};
use crate::service::idempotency_service::{
    self, Claim, ClaimGuard, ClaimOutcome, RemoteReservation,
};
use crate::service::metrics_service;
use crate::service::precheck_service::precheck_input;
use crate::service::rate_limit_service::{self, RateDecision};
use crate::service::run_registry_service::{TransitionError, load_run_snapshot};
use crate::service::sequencer_service::Channel;
use crate::service::validation_service::{parse_create_request, resolve_idempotency_key};
use axum::http::HeaderMap;
use chrono::Utc;
use serde_json::json;
use std::time::{Duration, Instant};
use tracing::{info, warn};
use uuid::Uuid;

const CONCURRENCY_RETRY_AFTER_SECONDS: u64 = 2;
const IN_FLIGHT_RETRY_AFTER_SECONDS: u64 = 1;

/// Caller identity resolved from request headers.
#[derive(Debug, Clone)]
pub struct Admission {
    pub tenant_id: String,
    pub caller_id: String,
    pub correlation_id: String,
}

#[derive(Debug)]
pub struct Admitted {
    pub response: CreateRunResponse,
    pub fresh: bool,
}

/// Gate order: validation, safety precheck, idempotency, rate limit,
/// concurrency. Nothing is created until every gate passes.
pub async fn create_run(
    state: &AppState,
    admission: &Admission,
    headers: &HeaderMap,
    body: &[u8],
) -> Result<Admitted, AppError> {
    let req = parse_create_request(body, state.config.max_body_bytes)?;
    if let Err(err) = precheck_input(&req.name, &req.input) {
        metrics_service::inc_precheck_rejections();
        return Err(err);
    }

    let key = resolve_idempotency_key(&req, headers)?;
    let claim = match &key {
        Some(key) => {
            let scoped = scoped_key(&admission.tenant_id, key);
            match claim_key(state, &scoped).await? {
                KeyClaim::Existing(view) => {
                    metrics_service::inc_idempotency_hits();
                    return Ok(replayed(view));
                }
                KeyClaim::Creator(guard) => {
                    metrics_service::inc_idempotency_misses();
                    Some(guard)
                }
            }
        }
        None => None,
    };

    // From here on, any early return drops the claim guard, which frees the
    // key locally; the remote reservation is released explicitly.
    let admitted = admit_after_claim(state, admission, req, key.clone()).await;
    match (admitted, claim) {
        (Ok(view), Some(guard)) => {
            let scoped = guard.key().to_string();
            guard
                .commit(&view.run_id)
                .map_err(|e| AppError::internal("STORE_LOCK_ERROR", e))?;
            if let Some(infra) = &state.infra {
                if let Err(e) = idempotency_service::commit_remote(
                    infra,
                    &scoped,
                    &view.run_id,
                    state.config.idempotency_ttl_seconds,
                )
                .await
                {
                    warn!(run_id = %view.run_id, reason = %e, "idempotency commit not persisted");
                }
            }
            Ok(created(view))
        }
        (Ok(view), None) => Ok(created(view)),
        (Err(err), guard) => {
            if let (Some(guard), Some(infra)) = (&guard, &state.infra) {
                if let Err(e) = idempotency_service::release_remote(infra, guard.key()).await {
                    warn!(reason = %e, "idempotency reservation not released");
                }
            }
            drop(guard);
            Err(err)
        }
    }
}

enum KeyClaim {
    Existing(RunView),
    Creator(ClaimGuard),
}

async fn claim_key(state: &AppState, scoped: &str) -> Result<KeyClaim, AppError> {
    let wait = Duration::from_millis(state.config.idempotency_wait_ms.max(1));
    loop {
        let claim = state
            .idempotency
            .claim(scoped, Instant::now())
            .map_err(|e| AppError::internal("STORE_LOCK_ERROR", e))?;
        match claim {
            Claim::Existing(run_id) => match local_view(state, &run_id) {
                Some(view) => return Ok(KeyClaim::Existing(view)),
                None => state.idempotency.forget(scoped),
            },
            Claim::InFlight(mut rx) => {
                let settled = tokio::time::timeout(
                    wait,
                    rx.wait_for(|outcome| *outcome != ClaimOutcome::Pending),
                )
                .await;
                let outcome = match settled {
                    Ok(Ok(outcome)) => outcome.clone(),
                    Ok(Err(_)) => ClaimOutcome::Abandoned,
                    Err(_) => return Err(in_progress()),
                };
                if let ClaimOutcome::Committed(run_id) = outcome {
                    if let Some(view) = local_view(state, &run_id) {
                        return Ok(KeyClaim::Existing(view));
                    }
                }
            }
            Claim::Creator(guard) => {
                let Some(infra) = &state.infra else {
                    return Ok(KeyClaim::Creator(guard));
                };
                return claim_remote(state, infra, scoped, guard).await;
            }
        }
    }
}

/// The remote key can outlive the run snapshot it points at. Such a key is
/// stale: it is released and the reservation is tried once more.
async fn claim_remote(
    state: &AppState,
    infra: &InfraClients,
    scoped: &str,
    guard: ClaimGuard,
) -> Result<KeyClaim, AppError> {
    let ttl = state.config.idempotency_ttl_seconds;
    let mut stale_released = false;
    loop {
        let reservation = idempotency_service::reserve_remote(infra, scoped, ttl)
            .await
            .map_err(idempotency_backend_error)?;
        let run_id = match reservation {
            RemoteReservation::Reserved => return Ok(KeyClaim::Creator(guard)),
            RemoteReservation::InProgress => return Err(in_progress()),
            RemoteReservation::Existing(run_id) => run_id,
        };
        if let Some(view) = local_view(state, &run_id) {
            return Ok(KeyClaim::Existing(view));
        }
        match load_run_snapshot(infra, &run_id).await {
            Ok(Some(record)) => return Ok(KeyClaim::Existing(record.to_view())),
            Ok(None) if !stale_released => {
                info!(run_id = %run_id, "idempotency key points at an evicted run; releasing");
                idempotency_service::release_stale_remote(infra, scoped, &run_id)
                    .await
                    .map_err(idempotency_backend_error)?;
                stale_released = true;
            }
            Ok(None) => return Err(in_progress()),
            Err(e) => {
                warn!(run_id = %run_id, reason = %e, "run snapshot lookup failed");
                return Err(idempotency_backend_error(e));
            }
        }
    }
}

fn idempotency_backend_error(reason: String) -> AppError {
    warn!(reason = %reason, "idempotency backend unavailable");
    AppError::service_unavailable(
        "IDEMPOTENCY_BACKEND_UNAVAILABLE",
        "idempotency store unavailable; retry later",
        Some(IN_FLIGHT_RETRY_AFTER_SECONDS),
    )
}

async fn admit_after_claim(
    state: &AppState,
    admission: &Admission,
    req: CreateRunRequest,
    idempotency_key: Option<String>,
) -> Result<RunView, AppError> {
    check_rate_limit(state, &admission.caller_id).await?;

    let limit = state.config.concurrency_limit_for(&admission.tenant_id);
    let slot = state
        .concurrency
        .try_acquire(&admission.tenant_id, limit)
        .map_err(|e| AppError::internal("STORE_LOCK_ERROR", e))?;
    if let SlotDecision::Denied { in_flight, limit } = slot {
        metrics_service::inc_concurrency_denials();
        return Err(AppError::too_many_requests(
            "CONCURRENCY_LIMIT_REACHED",
            format!("tenant has {in_flight} of {limit} runs in flight"),
            CONCURRENCY_RETRY_AFTER_SECONDS,
        ));
    }

    match register_run(state, admission, req, idempotency_key) {
        Ok(view) => Ok(view),
        Err(err) => {
            state.concurrency.release(&admission.tenant_id);
            Err(err)
        }
    }
}

async fn check_rate_limit(state: &AppState, caller_id: &str) -> Result<(), AppError> {
    let window = Duration::from_secs(state.config.rate_limit_window_seconds.max(1) as u64);
    let decision = match &state.infra {
        Some(infra) => {
            rate_limit_service::check_remote(
                infra,
                caller_id,
                window,
                state.config.rate_limit_max_requests,
                Utc::now().timestamp_millis(),
            )
            .await
        }
        None => state.rate_limiter.check_and_record(caller_id, Instant::now()),
    };

    match decision {
        Ok(RateDecision::Allowed { .. }) => Ok(()),
        Ok(RateDecision::Limited { retry_after }) => {
            metrics_service::inc_rate_limit_rejections();
            let seconds = retry_after.as_secs() + u64::from(retry_after.subsec_nanos() > 0);
            Err(AppError::too_many_requests(
                "RATE_LIMITED",
                format!("rate limit of {} requests per window exceeded", state.config.rate_limit_max_requests),
                seconds,
            ))
        }
        Err(e) if state.config.rate_limit_fail_open => {
            metrics_service::inc_rate_limit_fail_open();
            warn!(caller_id = %caller_id, reason = %e, "rate limiter unavailable; failing open");
            Ok(())
        }
        Err(e) => {
            warn!(caller_id = %caller_id, reason = %e, "rate limiter unavailable; failing closed");
            Err(AppError::service_unavailable(
                "RATE_LIMIT_BACKEND_UNAVAILABLE",
                "rate limiter unavailable; retry later",
                Some(IN_FLIGHT_RETRY_AFTER_SECONDS),
            ))
        }
    }
}

fn register_run(
    state: &AppState,
    admission: &Admission,
    req: CreateRunRequest,
    idempotency_key: Option<String>,
) -> Result<RunView, AppError> {
    let now = Utc::now().timestamp_millis();
    let run_id = generate_run_id();
    let record = RunRecord {
        run_id: run_id.clone(),
        tenant_id: admission.tenant_id.clone(),
        caller_id: admission.caller_id.clone(),
        name: req.name.trim().to_string(),
        tags: req.tags.unwrap_or_default(),
        status: RunStatus::Queued,
        created_at: now,
        started_at: None,
        ended_at: None,
        idempotency_key: idempotency_key.map(|k| scoped_key(&admission.tenant_id, &k)),
        correlation_id: admission.correlation_id.clone(),
        error_code: None,
        error_message: None,
        shield_action: None,
        transitions: vec![RunStatusTransition {
            from_status: None,
            to_status: RunStatus::Queued,
            transitioned_at: now,
            error_code: None,
        }],
        slot_held: true,
        terminal_emitted: false,
        input: req.input,
        output: None,
    };

    state
        .spans
        .open_run(&run_id)
        .map_err(|e| AppError::internal("STORE_LOCK_ERROR", e))?;
    state
        .guard
        .open_run(&run_id)
        .map_err(|e| AppError::internal("STORE_LOCK_ERROR", e))?;
    state
        .sequencer
        .open_run(&run_id)
        .map_err(|e| AppError::internal(e.code(), e.to_string()))?;
    state
        .runs
        .insert(record.clone())
        .map_err(|e| AppError::internal(e.code(), e.to_string()))?;
    if let Err(e) = state.sequencer.publish(
        &run_id,
        Channel::Logs,
        EVENT_RUN_STATUS,
        json!({ "status": RunStatus::Queued.as_str() }),
    ) {
        warn!(run_id = %run_id, reason = %e, "queued event not streamed");
    }

    metrics_service::inc_runs_admitted();
    info!(
        run_id = %run_id,
        tenant_id = %admission.tenant_id,
        caller_id = %admission.caller_id,
        correlation_id = %admission.correlation_id,
        "run admitted"
    );
    Ok(record.to_view())
}

/// Called after the create response is built so the executor never races
/// the idempotency commit.
pub async fn start_run(state: &AppState, run_id: &str) {
    executor_service::persist_snapshot(state, run_id).await;
    executor_service::spawn_run(state.clone(), run_id.to_string());
}

pub async fn get_run(state: &AppState, run_id: &str) -> Result<GetRunResponse, AppError> {
    let view = match local_view(state, run_id) {
        Some(view) => view,
        None => remote_view(state, run_id).await?,
    };
    Ok(GetRunResponse {
        found: true,
        run: Some(view),
        error_code: None,
        reason: "run found".to_string(),
    })
}

pub async fn cancel_run(state: &AppState, run_id: &str) -> Result<CancelRunResponse, AppError> {
    let transition = state
        .runs
        .finish(run_id, RunStatus::Cancelled, None)
        .map_err(transition_error)?;
    executor_service::settle_terminal(state, &transition);
    executor_service::persist_snapshot(state, run_id).await;
    info!(
        run_id = %run_id,
        previous = transition.previous.as_str(),
        "run cancel accepted"
    );
    Ok(CancelRunResponse {
        accepted: true,
        run_id: run_id.to_string(),
        status: Some(RunStatus::Cancelled),
        error_code: None,
        reason: "run cancelled; executor signalled to stop".to_string(),
    })
}

pub fn list_spans(state: &AppState, run_id: &str) -> Result<SpanListResponse, AppError> {
    ensure_known(state, run_id)?;
    let spans = state.spans.list(run_id).unwrap_or_default();
    Ok(SpanListResponse {
        found: true,
        run_id: run_id.to_string(),
        reason: format!("{} spans recorded", spans.len()),
        spans,
        error_code: None,
    })
}

pub fn list_guard_events(state: &AppState, run_id: &str) -> Result<GuardEventListResponse, AppError> {
    ensure_known(state, run_id)?;
    let snapshot = state.guard.snapshot(run_id).unwrap_or_default();
    Ok(GuardEventListResponse {
        found: true,
        run_id: run_id.to_string(),
        reason: format!("{} guard events recorded", snapshot.events.len()),
        events: snapshot.events,
        verdicts: snapshot.verdicts,
        decisions: snapshot.decisions,
        error_code: None,
    })
}

pub async fn health(state: &AppState) -> HealthResponse {
    let redis_configured = state.infra.is_some();
    let (redis_available, reason) = match &state.infra {
        None => (false, "in-process stores only".to_string()),
        Some(infra) => match ping(infra).await {
            Ok(()) => (true, "redis reachable".to_string()),
            Err(e) => (false, e),
        },
    };
    HealthResponse {
        ok: !redis_configured || redis_available,
        redis_configured,
        redis_available,
        privacy_mode: state.config.privacy_mode,
        active_runs: state.runs.active_runs(),
        reason,
    }
}

async fn ping(infra: &InfraClients) -> Result<(), String> {
    let mut conn = infra.connection().await?;
    let pong: String = infra
        .bounded(redis::cmd("PING").query_async(&mut conn))
        .await?
        .map_err(|e| format!("redis ping failed: {e}"))?;
    if pong == "PONG" {
        Ok(())
    } else {
        Err("redis ping returned unexpected response".to_string())
    }
}

fn ensure_known(state: &AppState, run_id: &str) -> Result<(), AppError> {
    state
        .runs
        .handle(run_id)
        .map(|_| ())
        .map_err(transition_error)
}

fn local_view(state: &AppState, run_id: &str) -> Option<RunView> {
    state.runs.snapshot(run_id).ok().map(|r| r.to_view())
}

async fn remote_view(state: &AppState, run_id: &str) -> Result<RunView, AppError> {
    let not_found = || AppError::not_found("RUN_NOT_FOUND", format!("run {run_id} not found"));
    let Some(infra) = &state.infra else {
        return Err(not_found());
    };
    match load_run_snapshot(infra, run_id).await {
        Ok(Some(record)) => Ok(record.to_view()),
        Ok(None) => Err(not_found()),
        Err(e) => {
            warn!(run_id = %run_id, reason = %e, "run snapshot lookup failed");
            Err(not_found())
        }
    }
}

fn transition_error(err: TransitionError) -> AppError {
    match &err {
        TransitionError::NotFound(_) => AppError::not_found(err.code(), err.to_string()),
        TransitionError::AlreadyTerminal(_) | TransitionError::Invalid { .. } => {
            AppError::conflict(err.code(), err.to_string())
        }
        TransitionError::Poisoned => AppError::internal(err.code(), err.to_string()),
    }
}

fn in_progress() -> AppError {
    AppError {
        retry_after_seconds: Some(IN_FLIGHT_RETRY_AFTER_SECONDS),
        ..AppError::conflict(
            "IDEMPOTENCY_IN_PROGRESS",
            "a request with this idempotency key is still being admitted",
        )
    }
}

fn scoped_key(tenant_id: &str, key: &str) -> String {
    format!("{tenant_id}:{key}")
}

fn generate_run_id() -> String {
    format!("run_{}", Uuid::now_v7().simple())
}

fn created(view: RunView) -> Admitted {
    Admitted {
        response: CreateRunResponse {
            accepted: true,
            idempotent: false,
            run: Some(view),
            error_code: None,
            retry_after_seconds: None,
            reason: "run accepted and queued".to_string(),
        },
        fresh: true,
    }
}

fn replayed(view: RunView) -> Admitted {
    Admitted {
        response: CreateRunResponse {
            accepted: true,
            idempotent: true,
            run: Some(view),
            error_code: None,
            retry_after_seconds: None,
            reason: "idempotent replay of existing run".to_string(),
        },
        fresh: false,
    }
}
