use super::schema::{RunStatus, RunStatusTransition, RunView};
use crate::service::shield_service::ShieldAction;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunRecord {
    pub run_id: String,
    pub tenant_id: String,
    pub caller_id: String,
    pub name: String,
    pub tags: BTreeMap<String, String>,
    pub status: RunStatus,
    pub created_at: i64,
    pub started_at: Option<i64>,
    pub ended_at: Option<i64>,
    pub idempotency_key: Option<String>,
    pub correlation_id: String,
    pub error_code: Option<String>,
    pub error_message: Option<String>,
    pub shield_action: Option<ShieldAction>,
    pub transitions: Vec<RunStatusTransition>,
    /// Tenant concurrency slot still counted against the plan ceiling.
    pub slot_held: bool,
    pub terminal_emitted: bool,
    #[serde(skip)]
    pub input: Value,
    #[serde(skip)]
    pub output: Option<String>,
}

impl RunRecord {
    pub fn to_view(&self) -> RunView {
        let (output, enforcement) = match self.shield_action {
            Some(ShieldAction::Allow) => (self.output.clone(), None),
            Some(ShieldAction::RequireApproval) => (None, Some("awaiting_approval".to_string())),
            Some(ShieldAction::Block) => (None, Some("blocked".to_string())),
            None => (None, None),
        };
        RunView {
            run_id: self.run_id.clone(),
            tenant_id: self.tenant_id.clone(),
            name: self.name.clone(),
            status: self.status,
            created_at: self.created_at,
            started_at: self.started_at,
            ended_at: self.ended_at,
            idempotency_key: self.idempotency_key.clone(),
            tags: self.tags.clone(),
            error_code: self.error_code.clone(),
            error_message: self.error_message.clone(),
            output,
            enforcement,
            shield_action: self.shield_action,
            transitions: self.transitions.clone(),
        }
    }
}
