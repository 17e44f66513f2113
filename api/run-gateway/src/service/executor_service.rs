use crate::app::AppState;
use crate::module::run::schema::RunStatus;
use crate::service::detector_service::{Finding, ScanContext};
use crate::service::guard_event_service::{EVENT_EXECUTION_FAILED, EVENT_RUN_CANCELLED};
use crate::service::judge_service::{Evidence, JudgeRequest};
use crate::service::metrics_service;
use crate::service::redaction_service::mask_credentials;
use crate::service::run_registry_service::{
    TerminalTransition, TransitionError, persist_run_snapshot,
};
use crate::service::sequencer_service::Channel;
use crate::service::span_service::{RecordingMode, Span, SpanDraft};
use async_trait::async_trait;
use chrono::Utc;
use serde::Deserialize;
use serde_json::{Value, json};
use std::sync::Mutex;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

pub const EVENT_SPAN_RECORDED: &str = "span.recorded";
pub const EVENT_RUN_STATUS: &str = "run.status";
const OUTPUT_SPAN_TYPE: &str = "output";

#[derive(Debug, Error)]
pub enum ExecutionError {
    #[error("step {step} failed: {message}")]
    StepFailed { step: u64, message: String },
    #[error("run exceeded its {0}s timeout")]
    Timeout(u64),
    #[error("run cancelled")]
    Cancelled,
    #[error("executor panicked")]
    Panicked,
    #[error("invalid task input: {0}")]
    InvalidInput(String),
    #[error("span recording failed: {0}")]
    Recording(String),
}

impl ExecutionError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::StepFailed { .. } => "EXECUTION_STEP_FAILED",
            Self::Timeout(_) => "EXECUTION_TIMEOUT",
            Self::Cancelled => "RUN_CANCELLED",
            Self::Panicked => "EXECUTOR_PANICKED",
            Self::InvalidInput(_) => "INVALID_TASK_INPUT",
            Self::Recording(_) => "SPAN_RECORDING_FAILED",
        }
    }

    /// Failure text that may carry step content is reduced to its shape.
    pub fn hash_only_message(&self) -> String {
        match self {
            Self::StepFailed { step, .. } => format!("step {step} failed; details recorded as hash only"),
            Self::InvalidInput(_) => "invalid task input; details recorded as hash only".to_string(),
            other => other.to_string(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ExecutionOutcome {
    pub output: Option<String>,
    pub evidence: Vec<Evidence>,
}

/// What an executor sees of its run. Spans go through `record_span`, which
/// stores, streams and scans them before returning.
pub struct ExecutionContext {
    state: AppState,
    run_id: String,
    input: Value,
    prompt: Option<String>,
    cancel: CancellationToken,
    findings: Mutex<Vec<Finding>>,
    last_output: Mutex<Option<String>>,
}

impl ExecutionContext {
    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    /// Run input with credentials masked.
    pub fn input(&self) -> &Value {
        &self.input
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub async fn cancelled(&self) {
        self.cancel.cancelled().await
    }

    pub fn record_span(&self, draft: SpanDraft) -> Result<Span, ExecutionError> {
        let state = &self.state;
        let output_text = draft.output.as_ref().map(value_text);
        let span = state
            .spans
            .append(&self.run_id, draft)
            .map_err(ExecutionError::Recording)?;

        let payload = serde_json::to_value(&span)
            .map_err(|e| ExecutionError::Recording(format!("span encode failed: {e}")))?;
        if let Err(err) = state
            .sequencer
            .publish(&self.run_id, Channel::Logs, EVENT_SPAN_RECORDED, payload)
        {
            warn!(run_id = %self.run_id, step = span.step, reason = %err, "span not streamed");
        }

        let ctx = ScanContext {
            prompt: self.prompt.as_deref(),
        };
        let report = state.detectors.scan_span(&span, &ctx);
        state
            .guard
            .record_skipped(&self.run_id, &span.id, span.step, &report.skipped)
            .map_err(ExecutionError::Recording)?;
        state
            .guard
            .record_findings(&self.run_id, &span.id, span.step, &report.findings)
            .map_err(ExecutionError::Recording)?;
        if let Ok(mut findings) = self.findings.lock() {
            findings.extend(report.findings);
        }
        if let Ok(mut last) = self.last_output.lock() {
            *last = output_text;
        }
        Ok(span)
    }

    /// Records the candidate output as its own span unless the latest span
    /// already carried exactly that text, so detectors see what the Judge
    /// and Shield will rule on.
    fn record_final_output(&self, output: &str) -> Result<(), ExecutionError> {
        if output.is_empty() {
            return Ok(());
        }
        let already_scanned = self
            .last_output
            .lock()
            .map(|last| last.as_deref() == Some(output))
            .unwrap_or(false);
        if already_scanned {
            return Ok(());
        }
        self.record_span(SpanDraft {
            span_type: OUTPUT_SPAN_TYPE.to_string(),
            input: None,
            output: Some(Value::String(output.to_string())),
            duration_ms: 0,
        })?;
        Ok(())
    }

    fn take_findings(&self) -> Vec<Finding> {
        self.findings
            .lock()
            .map(|mut f| std::mem::take(&mut *f))
            .unwrap_or_default()
    }
}

#[async_trait]
pub trait TaskExecutor: Send + Sync {
    async fn execute(&self, ctx: &ExecutionContext) -> Result<ExecutionOutcome, ExecutionError>;
}

#[derive(Debug, Deserialize, Default)]
struct ScriptedTask {
    #[serde(default)]
    steps: Vec<ScriptedStep>,
    #[serde(default)]
    output: Option<Value>,
    #[serde(default)]
    evidence: Vec<Evidence>,
}

#[derive(Debug, Deserialize)]
struct ScriptedStep {
    #[serde(rename = "type", default = "default_step_type")]
    step_type: String,
    #[serde(default)]
    input: Option<Value>,
    #[serde(default)]
    output: Option<Value>,
    #[serde(default)]
    delay_ms: u64,
    #[serde(default)]
    fail: bool,
    #[serde(default)]
    error: Option<String>,
}

fn default_step_type() -> String {
    "step".to_string()
}

/// Plays back the steps described in the run input, one span per step.
#[derive(Debug, Default)]
pub struct ScriptedTaskExecutor;

#[async_trait]
impl TaskExecutor for ScriptedTaskExecutor {
    async fn execute(&self, ctx: &ExecutionContext) -> Result<ExecutionOutcome, ExecutionError> {
        let task = match ctx.input() {
            Value::Object(_) => serde_json::from_value::<ScriptedTask>(ctx.input().clone())
                .map_err(|e| ExecutionError::InvalidInput(e.to_string()))?,
            _ => ScriptedTask::default(),
        };

        if task.steps.is_empty() {
            ctx.record_span(SpanDraft {
                span_type: "task".to_string(),
                input: Some(ctx.input().clone()),
                output: task.output.clone(),
                duration_ms: 0,
            })?;
        }

        let mut last_output = None;
        for step in task.steps {
            if step.delay_ms > 0 {
                tokio::select! {
                    _ = ctx.cancelled() => return Err(ExecutionError::Cancelled),
                    _ = sleep(Duration::from_millis(step.delay_ms)) => {}
                }
            }
            if step.fail {
                let message = step.error.unwrap_or_else(|| "step reported failure".to_string());
                let span = ctx.record_span(SpanDraft {
                    span_type: step.step_type,
                    input: step.input,
                    output: Some(json!({ "error": message })),
                    duration_ms: step.delay_ms,
                })?;
                return Err(ExecutionError::StepFailed {
                    step: span.step,
                    message,
                });
            }
            ctx.record_span(SpanDraft {
                span_type: step.step_type,
                input: step.input,
                output: step.output.clone(),
                duration_ms: step.delay_ms,
            })?;
            if step.output.is_some() {
                last_output = step.output;
            }
        }

        Ok(ExecutionOutcome {
            output: task.output.or(last_output).map(|v| value_text(&v)),
            evidence: task.evidence,
        })
    }
}

fn value_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Starts the run in the background. The supervising task always settles
/// the run, including when the worker panics.
pub fn spawn_run(state: AppState, run_id: String) {
    tokio::spawn(async move {
        let worker_state = state.clone();
        let worker_run_id = run_id.clone();
        let worker = tokio::spawn(async move { drive_run(&worker_state, &worker_run_id).await });
        let result = match worker.await {
            Ok(result) => result,
            Err(join_err) if join_err.is_panic() => Err(ExecutionError::Panicked),
            Err(_) => Err(ExecutionError::Cancelled),
        };
        finalize_run(&state, &run_id, result).await;
    });
}

async fn drive_run(state: &AppState, run_id: &str) -> Result<(), ExecutionError> {
    let record = match state.runs.mark_running(run_id) {
        Ok(record) => record,
        Err(TransitionError::AlreadyTerminal(_)) => return Err(ExecutionError::Cancelled),
        Err(err) => return Err(ExecutionError::Recording(err.to_string())),
    };
    metrics_service::inc_runs_started();
    metrics_service::inc_active_runs();
    publish_status(state, run_id, RunStatus::Running, None);
    persist_snapshot(state, run_id).await;

    let cancel = state
        .runs
        .handle(run_id)
        .map_err(|e| ExecutionError::Recording(e.to_string()))?
        .cancel_token();
    let ctx = ExecutionContext {
        state: state.clone(),
        run_id: run_id.to_string(),
        input: mask_credentials(&record.input),
        prompt: record
            .input
            .get("prompt")
            .and_then(Value::as_str)
            .map(str::to_string),
        cancel: cancel.clone(),
        findings: Mutex::new(Vec::new()),
        last_output: Mutex::new(None),
    };

    let limit = state.config.run_timeout_seconds.max(1) as u64;
    let executor = state.executor.clone();
    let outcome = tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(ExecutionError::Cancelled),
        result = timeout(Duration::from_secs(limit), executor.execute(&ctx)) => {
            result.unwrap_or(Err(ExecutionError::Timeout(limit)))
        }
    }?;

    let output = outcome.output.unwrap_or_default();
    ctx.record_final_output(&output)?;
    let verdict = state.judge.evaluate(&JudgeRequest {
        run_id,
        output: &output,
        evidence: &outcome.evidence,
        prompt: ctx.prompt.as_deref(),
        mode: state.spans.mode(),
    });
    state
        .guard
        .record_verdict(&verdict)
        .map_err(ExecutionError::Recording)?;

    let decision = state.shield.decide(&verdict, &ctx.take_findings());
    state
        .guard
        .record_decision(&decision)
        .map_err(ExecutionError::Recording)?;
    state
        .runs
        .set_outcome(run_id, Some(output), decision.action)
        .map_err(|e| ExecutionError::Recording(e.to_string()))?;
    info!(
        run_id = %run_id,
        groundedness = verdict.groundedness,
        action = decision.action.as_str(),
        policy = %decision.policy_applied,
        "shield decision recorded"
    );
    Ok(())
}

async fn finalize_run(state: &AppState, run_id: &str, result: Result<(), ExecutionError>) {
    let hash_only = state.spans.mode() == RecordingMode::HashOnly;
    let describe = |err: &ExecutionError| {
        if hash_only {
            err.hash_only_message()
        } else {
            err.to_string()
        }
    };
    let (status, error) = match &result {
        Ok(()) => (RunStatus::Complete, None),
        Err(ExecutionError::Cancelled) => (RunStatus::Cancelled, None),
        Err(err) => (RunStatus::Failed, Some((err.code(), describe(err)))),
    };

    if let Err(err) = &result {
        let event_type = if status == RunStatus::Cancelled {
            EVENT_RUN_CANCELLED
        } else {
            EVENT_EXECUTION_FAILED
        };
        if let Err(e) = state.guard.emit(
            run_id,
            event_type,
            json!({ "error_code": err.code(), "reason": describe(err) }),
        ) {
            warn!(run_id = %run_id, reason = %e, "terminal guard event not recorded");
        }
    }

    match state.runs.finish(run_id, status, error) {
        Ok(transition) => settle_terminal(state, &transition),
        Err(TransitionError::AlreadyTerminal(_)) => {}
        Err(err) => {
            error!(run_id = %run_id, error_code = err.code(), reason = %err, "run finalize failed");
        }
    }
    persist_snapshot(state, run_id).await;
    emit_terminal(state, run_id);
}

/// Slot release and counters for a run that just became terminal.
pub fn settle_terminal(state: &AppState, transition: &TerminalTransition) {
    let record = &transition.record;
    if transition.release_slot {
        state.concurrency.release(&record.tenant_id);
    }
    if transition.previous == RunStatus::Running {
        metrics_service::dec_active_runs();
    }
    match record.status {
        RunStatus::Complete => metrics_service::inc_runs_completed(),
        RunStatus::Failed => {
            metrics_service::inc_runs_failed();
            metrics_service::set_last_error_ts(Utc::now().timestamp());
        }
        RunStatus::Cancelled => metrics_service::inc_runs_cancelled(),
        _ => {}
    }
    info!(
        run_id = %record.run_id,
        tenant_id = %record.tenant_id,
        status = record.status.as_str(),
        error_code = record.error_code.as_deref().unwrap_or(""),
        "run reached terminal state"
    );
}

/// Publishes the single terminal `logs` event and closes both channels.
fn emit_terminal(state: &AppState, run_id: &str) {
    match state.runs.claim_terminal_emit(run_id) {
        Ok(true) => {}
        Ok(false) => return,
        Err(err) => {
            warn!(run_id = %run_id, reason = %err, "terminal event skipped");
            return;
        }
    }
    let Ok(record) = state.runs.snapshot(run_id) else {
        return;
    };
    let view = record.to_view();
    publish_status(
        state,
        run_id,
        record.status,
        Some(json!({
            "error_code": view.error_code,
            "shield_action": view.shield_action,
            "enforcement": view.enforcement,
        })),
    );
    if let Err(err) = state.sequencer.close_run(run_id) {
        warn!(run_id = %run_id, reason = %err, "stream close failed");
    }
}

fn publish_status(state: &AppState, run_id: &str, status: RunStatus, extra: Option<Value>) {
    let mut payload = json!({ "status": status.as_str() });
    if let (Some(Value::Object(extra)), Some(target)) = (extra, payload.as_object_mut()) {
        target.extend(extra);
    }
    let event_type = if status.is_terminal() {
        format!("run.{}", status.as_str())
    } else {
        EVENT_RUN_STATUS.to_string()
    };
    if let Err(err) = state
        .sequencer
        .publish(run_id, Channel::Logs, &event_type, payload)
    {
        warn!(run_id = %run_id, reason = %err, "status event not streamed");
    }
}

pub async fn persist_snapshot(state: &AppState, run_id: &str) {
    let Some(infra) = &state.infra else {
        return;
    };
    let Ok(record) = state.runs.snapshot(run_id) else {
        return;
    };
    let started = Instant::now();
    let ttl_seconds = state.config.run_retention_seconds.max(1) as u64;
    if let Err(err) = persist_run_snapshot(infra, &record, ttl_seconds).await {
        warn!(
            run_id = %run_id,
            elapsed_ms = started.elapsed().as_millis() as u64,
            reason = %err,
            "run snapshot not persisted"
        );
    }
}
