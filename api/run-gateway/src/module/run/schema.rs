use crate::service::guard_event_service::GuardEvent;
use crate::service::judge_service::Verdict;
use crate::service::shield_service::{ShieldAction, ShieldDecision};
use crate::service::span_service::Span;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Queued,
    Running,
    Complete,
    Failed,
    Cancelled,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Complete => "complete",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Complete | Self::Failed | Self::Cancelled)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateRunRequest {
    pub name: String,
    pub input: Value,
    #[serde(default, alias = "clientToken")]
    pub client_token: Option<String>,
    #[serde(default)]
    pub tags: Option<BTreeMap<String, String>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunStatusTransition {
    pub from_status: Option<RunStatus>,
    pub to_status: RunStatus,
    pub transitioned_at: i64,
    pub error_code: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunView {
    pub run_id: String,
    pub tenant_id: String,
    pub name: String,
    pub status: RunStatus,
    pub created_at: i64,
    pub started_at: Option<i64>,
    pub ended_at: Option<i64>,
    pub idempotency_key: Option<String>,
    pub tags: BTreeMap<String, String>,
    pub error_code: Option<String>,
    pub error_message: Option<String>,
    pub output: Option<String>,
    pub enforcement: Option<String>,
    pub shield_action: Option<ShieldAction>,
    pub transitions: Vec<RunStatusTransition>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateRunResponse {
    pub accepted: bool,
    pub idempotent: bool,
    pub run: Option<RunView>,
    pub error_code: Option<String>,
    pub retry_after_seconds: Option<u64>,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetRunResponse {
    pub found: bool,
    pub run: Option<RunView>,
    pub error_code: Option<String>,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CancelRunResponse {
    pub accepted: bool,
    pub run_id: String,
    pub status: Option<RunStatus>,
    pub error_code: Option<String>,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpanListResponse {
    pub found: bool,
    pub run_id: String,
    pub spans: Vec<Span>,
    pub error_code: Option<String>,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GuardEventListResponse {
    pub found: bool,
    pub run_id: String,
    pub events: Vec<GuardEvent>,
    pub verdicts: Vec<Verdict>,
    pub decisions: Vec<ShieldDecision>,
    pub error_code: Option<String>,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub ok: bool,
    pub redis_configured: bool,
    pub redis_available: bool,
    pub privacy_mode: bool,
    pub active_runs: u64,
    pub reason: String,
}
