use crate::service::detector_service::Finding;
use crate::service::judge_service::Verdict;
use crate::service::redaction_service::mask_credentials;
use crate::service::sequencer_service::{Channel, Sequencer};
use crate::service::shield_service::ShieldDecision;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use tracing::warn;
use uuid::Uuid;

pub const EVENT_DETECTOR_FINDING: &str = "detector.finding";
pub const EVENT_DETECTOR_SKIPPED: &str = "detector.skipped";
pub const EVENT_VERDICT: &str = "judge.verdict";
pub const EVENT_SHIELD_DECISION: &str = "shield.decision";
pub const EVENT_EXECUTION_FAILED: &str = "execution.failed";
pub const EVENT_RUN_CANCELLED: &str = "run.cancelled";

/// Keys that can carry span plaintext; stripped from payloads in privacy mode.
const PLAINTEXT_KEYS: &[&str] = &["input", "output", "text", "content", "prompt", "sentence"];

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GuardEvent {
    pub id: String,
    pub run_id: String,
    #[serde(rename = "type")]
    pub event_type: String,
    pub timestamp: i64,
    pub payload: Value,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GuardSnapshot {
    pub events: Vec<GuardEvent>,
    pub verdicts: Vec<Verdict>,
    pub decisions: Vec<ShieldDecision>,
}

/// Append-only guard history per run, mirrored onto the `guard` stream.
#[derive(Debug)]
pub struct GuardEventLog {
    sequencer: Arc<Sequencer>,
    privacy_mode: bool,
    runs: RwLock<HashMap<String, Arc<Mutex<GuardSnapshot>>>>,
}

impl GuardEventLog {
    pub fn new(sequencer: Arc<Sequencer>, privacy_mode: bool) -> Self {
        Self {
            sequencer,
            privacy_mode,
            runs: RwLock::new(HashMap::new()),
        }
    }

    pub fn open_run(&self, run_id: &str) -> Result<(), String> {
        let mut runs = self
            .runs
            .write()
            .map_err(|_| "guard index lock poisoned".to_string())?;
        runs.entry(run_id.to_string()).or_default();
        Ok(())
    }

    pub fn emit(&self, run_id: &str, event_type: &str, payload: Value) -> Result<GuardEvent, String> {
        let record = self.record(run_id)?;
        let payload = self.sanitize(&payload);
        let event = GuardEvent {
            id: format!("guard_{}", Uuid::now_v7().simple()),
            run_id: run_id.to_string(),
            event_type: event_type.to_string(),
            timestamp: Utc::now().timestamp_millis(),
            payload,
        };

        // Holding the record lock across publish keeps list order and
        // stream order identical.
        let mut snapshot = record
            .lock()
            .map_err(|_| "guard record lock poisoned".to_string())?;
        snapshot.events.push(event.clone());
        let stream_payload = json!({ "guard_event_id": event.id, "data": event.payload });
        if let Err(err) = self
            .sequencer
            .publish(run_id, Channel::Guard, event_type, stream_payload)
        {
            warn!(run_id = %run_id, event_type = %event_type, reason = %err, "guard event not streamed");
        }
        Ok(event)
    }

    pub fn record_findings(&self, run_id: &str, span_id: &str, step: u64, findings: &[Finding]) -> Result<(), String> {
        for finding in findings.iter().filter(|f| f.detected) {
            self.emit(
                run_id,
                EVENT_DETECTOR_FINDING,
                json!({
                    "span_id": span_id,
                    "step": step,
                    "detector": finding.detector,
                    "kind": finding.kind,
                    "severity": finding.severity,
                    "patterns": finding.patterns,
                    "action_hint": finding.action_hint,
                }),
            )?;
        }
        Ok(())
    }

    pub fn record_skipped(&self, run_id: &str, span_id: &str, step: u64, detectors: &[&str]) -> Result<(), String> {
        if detectors.is_empty() {
            return Ok(());
        }
        self.emit(
            run_id,
            EVENT_DETECTOR_SKIPPED,
            json!({
                "span_id": span_id,
                "step": step,
                "detectors": detectors,
                "reason": "hash-only span",
            }),
        )?;
        Ok(())
    }

    pub fn record_verdict(&self, verdict: &Verdict) -> Result<(), String> {
        let payload = serde_json::to_value(verdict).map_err(|e| format!("verdict encode failed: {e}"))?;
        self.emit(&verdict.run_id, EVENT_VERDICT, payload)?;
        self.with_record(&verdict.run_id, |s| s.verdicts.push(verdict.clone()))
    }

    pub fn record_decision(&self, decision: &ShieldDecision) -> Result<(), String> {
        let payload = serde_json::to_value(decision).map_err(|e| format!("decision encode failed: {e}"))?;
        self.emit(&decision.run_id, EVENT_SHIELD_DECISION, payload)?;
        self.with_record(&decision.run_id, |s| s.decisions.push(decision.clone()))
    }

    pub fn snapshot(&self, run_id: &str) -> Option<GuardSnapshot> {
        let record = self.record(run_id).ok()?;
        let snapshot = record.lock().ok()?;
        Some(snapshot.clone())
    }

    pub fn evict(&self, run_id: &str) {
        if let Ok(mut runs) = self.runs.write() {
            runs.remove(run_id);
        }
    }

    fn with_record(&self, run_id: &str, f: impl FnOnce(&mut GuardSnapshot)) -> Result<(), String> {
        let record = self.record(run_id)?;
        let mut snapshot = record
            .lock()
            .map_err(|_| "guard record lock poisoned".to_string())?;
        f(&mut snapshot);
        Ok(())
    }

    fn record(&self, run_id: &str) -> Result<Arc<Mutex<GuardSnapshot>>, String> {
        let runs = self
            .runs
            .read()
            .map_err(|_| "guard index lock poisoned".to_string())?;
        runs.get(run_id)
            .cloned()
            .ok_or_else(|| format!("no guard log open for run {run_id}"))
    }

    fn sanitize(&self, payload: &Value) -> Value {
        let masked = mask_credentials(payload);
        if self.privacy_mode {
            strip_plaintext(&masked)
        } else {
            masked
        }
    }
}

fn strip_plaintext(value: &Value) -> Value {
    match value {
        Value::Object(map) => Value::Object(
            map.iter()
                .filter(|(k, _)| !PLAINTEXT_KEYS.contains(&k.to_ascii_lowercase().as_str()))
                .map(|(k, v)| (k.clone(), strip_plaintext(v)))
                .collect(),
        ),
        Value::Array(items) => Value::Array(items.iter().map(strip_plaintext).collect()),
        other => other.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn log(privacy_mode: bool) -> (Arc<Sequencer>, GuardEventLog) {
        let sequencer = Arc::new(Sequencer::new(100, 100));
        sequencer.open_run("r").expect("open stream");
        let log = GuardEventLog::new(Arc::clone(&sequencer), privacy_mode);
        log.open_run("r").expect("open guard");
        (sequencer, log)
    }

    #[test]
    fn events_are_listed_and_streamed_in_order() {
        let (sequencer, log) = log(false);
        log.emit("r", "a", json!({"n": 1})).expect("emit");
        log.emit("r", "b", json!({"n": 2})).expect("emit");
        let snapshot = log.snapshot("r").expect("snapshot");
        assert_eq!(
            snapshot.events.iter().map(|e| e.event_type.as_str()).collect::<Vec<_>>(),
            vec!["a", "b"]
        );
        let sub = sequencer.subscribe("r", Channel::Guard, None).expect("subscribe");
        assert_eq!(sub.replay.iter().map(|e| e.seq).collect::<Vec<_>>(), vec![1, 2]);
    }

    #[test]
    fn privacy_mode_strips_plaintext_fields() {
        let (_, log) = log(true);
        let event = log
            .emit("r", "x", json!({"output": "secret answer", "nested": {"input": "q"}, "score": 1}))
            .expect("emit");
        let text = event.payload.to_string();
        assert!(!text.contains("secret answer"));
        assert!(event.payload.get("nested").is_some());
        assert!(event.payload["nested"].get("input").is_none());
        assert_eq!(event.payload["score"], 1);
    }

    #[test]
    fn unknown_run_is_an_error() {
        let (_, log) = log(false);
        assert!(log.emit("missing", "x", json!({})).is_err());
    }
}
