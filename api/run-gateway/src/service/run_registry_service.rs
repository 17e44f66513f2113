use crate::infra::{InfraClients, RUNS_PREFIX};
use crate::module::run::model::RunRecord;
use crate::module::run::schema::{RunStatus, RunStatusTransition};
use crate::service::shield_service::ShieldAction;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TransitionError {
    #[error("run {0} not found")]
    NotFound(String),
    #[error("run is already {}", .0.as_str())]
    AlreadyTerminal(RunStatus),
    #[error("cannot transition from {} to {}", .from.as_str(), .to.as_str())]
    Invalid { from: RunStatus, to: RunStatus },
    #[error("run store lock poisoned")]
    Poisoned,
}

impl TransitionError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "RUN_NOT_FOUND",
            Self::AlreadyTerminal(_) => "RUN_ALREADY_TERMINAL",
            Self::Invalid { .. } => "INVALID_STATE_TRANSITION",
            Self::Poisoned => "STORE_LOCK_ERROR",
        }
    }
}

/// Result of moving a run into a terminal state.
#[derive(Debug, Clone)]
pub struct TerminalTransition {
    pub record: RunRecord,
    pub previous: RunStatus,
    /// True for exactly one caller: the one that must release the tenant slot.
    pub release_slot: bool,
}

/// One run's state plus the token used to stop its executor.
#[derive(Debug)]
pub struct RunHandle {
    record: Mutex<RunRecord>,
    cancel: CancellationToken,
}

impl RunHandle {
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    fn lock(&self) -> Result<MutexGuard<'_, RunRecord>, TransitionError> {
        self.record.lock().map_err(|_| TransitionError::Poisoned)
    }
}

/// Run lifecycle store. The index lock is held only to find a run; every
/// state change takes that run's own lock.
#[derive(Debug, Default)]
pub struct RunRegistry {
    runs: RwLock<HashMap<String, Arc<RunHandle>>>,
}

impl RunRegistry {
    pub fn insert(&self, record: RunRecord) -> Result<Arc<RunHandle>, TransitionError> {
        let handle = Arc::new(RunHandle {
            record: Mutex::new(record),
            cancel: CancellationToken::new(),
        });
        let run_id = handle.lock()?.run_id.clone();
        let mut runs = self.runs.write().map_err(|_| TransitionError::Poisoned)?;
        runs.insert(run_id, Arc::clone(&handle));
        Ok(handle)
    }

    pub fn handle(&self, run_id: &str) -> Result<Arc<RunHandle>, TransitionError> {
        let runs = self.runs.read().map_err(|_| TransitionError::Poisoned)?;
        runs.get(run_id)
            .cloned()
            .ok_or_else(|| TransitionError::NotFound(run_id.to_string()))
    }

    pub fn snapshot(&self, run_id: &str) -> Result<RunRecord, TransitionError> {
        let handle = self.handle(run_id)?;
        let record = handle.lock()?;
        Ok(record.clone())
    }

    pub fn mark_running(&self, run_id: &str) -> Result<RunRecord, TransitionError> {
        let handle = self.handle(run_id)?;
        let mut record = handle.lock()?;
        match record.status {
            RunStatus::Queued => {}
            status if status.is_terminal() => return Err(TransitionError::AlreadyTerminal(status)),
            status => {
                return Err(TransitionError::Invalid {
                    from: status,
                    to: RunStatus::Running,
                });
            }
        }
        let now = Utc::now().timestamp_millis();
        record.started_at = Some(now);
        push_transition(&mut record, RunStatus::Running, now, None);
        Ok(record.clone())
    }

    /// Terminal transitions never re-enter: a second terminal signal gets
    /// `AlreadyTerminal`, which is how slot release stays exactly-once.
    pub fn finish(
        &self,
        run_id: &str,
        status: RunStatus,
        error: Option<(&str, String)>,
    ) -> Result<TerminalTransition, TransitionError> {
        let handle = self.handle(run_id)?;
        let mut record = handle.lock()?;
        let previous = record.status;
        if previous.is_terminal() {
            return Err(TransitionError::AlreadyTerminal(previous));
        }
        if !status.is_terminal() {
            return Err(TransitionError::Invalid {
                from: previous,
                to: status,
            });
        }

        let now = Utc::now().timestamp_millis();
        let error_code = error.as_ref().map(|(code, _)| code.to_string());
        record.ended_at = Some(now);
        record.error_code = error_code.clone();
        record.error_message = error.map(|(_, message)| message);
        push_transition(&mut record, status, now, error_code);
        let release_slot = std::mem::replace(&mut record.slot_held, false);
        let snapshot = record.clone();
        drop(record);

        if status == RunStatus::Cancelled {
            handle.cancel.cancel();
        }
        Ok(TerminalTransition {
            record: snapshot,
            previous,
            release_slot,
        })
    }

    pub fn set_outcome(
        &self,
        run_id: &str,
        output: Option<String>,
        action: ShieldAction,
    ) -> Result<(), TransitionError> {
        let handle = self.handle(run_id)?;
        let mut record = handle.lock()?;
        record.output = output;
        record.shield_action = Some(action);
        Ok(())
    }

    /// Returns true only for the first caller.
    pub fn claim_terminal_emit(&self, run_id: &str) -> Result<bool, TransitionError> {
        let handle = self.handle(run_id)?;
        let mut record = handle.lock()?;
        Ok(!std::mem::replace(&mut record.terminal_emitted, true))
    }

    /// Terminal runs that ended before `cutoff_ms`.
    pub fn expired(&self, cutoff_ms: i64) -> Vec<RunRecord> {
        let Ok(runs) = self.runs.read() else {
            return Vec::new();
        };
        runs.values()
            .filter_map(|handle| handle.lock().ok().map(|r| r.clone()))
            .filter(|r| r.status.is_terminal() && r.ended_at.is_some_and(|t| t < cutoff_ms))
            .collect()
    }

    pub fn remove(&self, run_id: &str) -> Option<Arc<RunHandle>> {
        self.runs.write().ok()?.remove(run_id)
    }

    pub fn active_runs(&self) -> u64 {
        let Ok(runs) = self.runs.read() else {
            return 0;
        };
        runs.values()
            .filter_map(|handle| handle.lock().ok().map(|r| r.status))
            .filter(|s| !s.is_terminal())
            .count() as u64
    }
}

fn push_transition(record: &mut RunRecord, to: RunStatus, at: i64, error_code: Option<String>) {
    let from = record.status;
    record.status = to;
    record.transitions.push(RunStatusTransition {
        from_status: Some(from),
        to_status: to,
        transitioned_at: at,
        error_code,
    });
}

/// Write-through copy under `runs:{run_id}` for operator lookup; expires
/// with the local retention window.
pub async fn persist_run_snapshot(
    infra: &InfraClients,
    record: &RunRecord,
    ttl_seconds: u64,
) -> Result<(), String> {
    let payload = serde_json::to_string(record).map_err(|e| format!("run encode failed: {e}"))?;
    let mut conn = infra.connection().await?;
    let _: () = infra
        .bounded(
            redis::cmd("SET")
                .arg(format!("{RUNS_PREFIX}{}", record.run_id))
                .arg(payload)
                .arg("EX")
                .arg(ttl_seconds.max(1))
                .query_async(&mut conn),
        )
        .await?
        .map_err(|e| format!("run snapshot write failed: {e}"))?;
    Ok(())
}

pub async fn load_run_snapshot(infra: &InfraClients, run_id: &str) -> Result<Option<RunRecord>, String> {
    let mut conn = infra.connection().await?;
    let raw: Option<String> = infra
        .bounded(
            redis::cmd("GET")
                .arg(format!("{RUNS_PREFIX}{run_id}"))
                .query_async(&mut conn),
        )
        .await?
        .map_err(|e| format!("run snapshot read failed: {e}"))?;
    raw.map(|raw| serde_json::from_str(&raw).map_err(|e| format!("run snapshot decode failed: {e}")))
        .transpose()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::BTreeMap;

    fn record(run_id: &str) -> RunRecord {
        RunRecord {
            run_id: run_id.to_string(),
            tenant_id: "acme".to_string(),
            caller_id: "acme".to_string(),
            name: "demo".to_string(),
            tags: BTreeMap::new(),
            status: RunStatus::Queued,
            created_at: 0,
            started_at: None,
            ended_at: None,
            idempotency_key: None,
            correlation_id: "req_1_abc".to_string(),
            error_code: None,
            error_message: None,
            shield_action: None,
            transitions: Vec::new(),
            slot_held: true,
            terminal_emitted: false,
            input: json!({}),
            output: None,
        }
    }

    #[test]
    fn lifecycle_moves_forward_only() {
        let registry = RunRegistry::default();
        registry.insert(record("r")).expect("insert");
        assert_eq!(registry.mark_running("r").expect("running").status, RunStatus::Running);
        let done = registry.finish("r", RunStatus::Complete, None).expect("finish");
        assert_eq!(done.previous, RunStatus::Running);
        assert!(done.release_slot);
        assert_eq!(
            registry.mark_running("r").expect_err("no re-entry"),
            TransitionError::AlreadyTerminal(RunStatus::Complete)
        );
    }

    #[test]
    fn duplicate_terminal_signals_release_once() {
        let registry = RunRegistry::default();
        registry.insert(record("r")).expect("insert");
        let first = registry
            .finish("r", RunStatus::Cancelled, None)
            .expect("cancel");
        assert!(first.release_slot);
        let second = registry.finish("r", RunStatus::Failed, Some(("X", "late".to_string())));
        assert_eq!(
            second.expect_err("second terminal"),
            TransitionError::AlreadyTerminal(RunStatus::Cancelled)
        );
        assert!(registry.handle("r").expect("handle").cancel_token().is_cancelled());
    }

    #[test]
    fn terminal_emit_is_claimed_once() {
        let registry = RunRegistry::default();
        registry.insert(record("r")).expect("insert");
        assert!(registry.claim_terminal_emit("r").expect("claim"));
        assert!(!registry.claim_terminal_emit("r").expect("claim"));
    }

    #[test]
    fn expired_lists_only_old_terminal_runs() {
        let registry = RunRegistry::default();
        registry.insert(record("old")).expect("insert");
        registry.insert(record("live")).expect("insert");
        registry.finish("old", RunStatus::Complete, None).expect("finish");
        let far_future = Utc::now().timestamp_millis() + 1_000;
        let expired = registry.expired(far_future);
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].run_id, "old");
        assert_eq!(registry.active_runs(), 1);
    }
}
