use crate::service::hash_service::content_hash;
use crate::service::redaction_service::mask_credentials;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum RecordingMode {
    Plain,
    HashOnly,
}

impl RecordingMode {
    pub fn from_privacy_flag(privacy_mode: bool) -> Self {
        if privacy_mode {
            Self::HashOnly
        } else {
            Self::Plain
        }
    }
}

/// One recorded execution step. Immutable once appended.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Span {
    pub id: String,
    pub run_id: String,
    #[serde(rename = "type")]
    pub span_type: String,
    pub step: u64,
    pub timestamp: i64,
    pub duration_ms: u64,
    pub input: Option<Value>,
    pub output: Option<Value>,
    pub content_hash: Option<String>,
}

impl Span {
    pub fn is_hash_only(&self) -> bool {
        self.input.is_none() && self.output.is_none() && self.content_hash.is_some()
    }

    /// Text of the input side, for detectors that work on plaintext.
    pub fn input_text(&self) -> Option<String> {
        self.input.as_ref().map(value_text)
    }

    pub fn output_text(&self) -> Option<String> {
        self.output.as_ref().map(value_text)
    }
}

#[derive(Debug, Clone)]
pub struct SpanDraft {
    pub span_type: String,
    pub input: Option<Value>,
    pub output: Option<Value>,
    pub duration_ms: u64,
}

type SpanList = Arc<Mutex<Vec<Span>>>;

#[derive(Debug)]
pub struct SpanRecorder {
    mode: RecordingMode,
    runs: RwLock<HashMap<String, SpanList>>,
}

impl SpanRecorder {
    pub fn new(mode: RecordingMode) -> Self {
        Self {
            mode,
            runs: RwLock::new(HashMap::new()),
        }
    }

    pub fn mode(&self) -> RecordingMode {
        self.mode
    }

    pub fn open_run(&self, run_id: &str) -> Result<(), String> {
        let mut runs = self
            .runs
            .write()
            .map_err(|_| "span index lock poisoned".to_string())?;
        runs.entry(run_id.to_string()).or_default();
        Ok(())
    }

    /// Assigns the next step number and applies credential masking and, in
    /// hash-only mode, replaces both sides with a content hash.
    pub fn append(&self, run_id: &str, draft: SpanDraft) -> Result<Span, String> {
        let list = self.list_handle(run_id)?;
        let mut spans = list
            .lock()
            .map_err(|_| "span list lock poisoned".to_string())?;

        let input = draft.input.as_ref().map(mask_credentials);
        let output = draft.output.as_ref().map(mask_credentials);
        let hash = content_hash(input.as_ref(), output.as_ref());
        let (input, output) = match self.mode {
            RecordingMode::Plain => (input, output),
            RecordingMode::HashOnly => (None, None),
        };

        let span = Span {
            id: format!("span_{}", Uuid::now_v7().simple()),
            run_id: run_id.to_string(),
            span_type: draft.span_type,
            step: spans.len() as u64 + 1,
            timestamp: Utc::now().timestamp_millis(),
            duration_ms: draft.duration_ms,
            input,
            output,
            content_hash: Some(hash),
        };
        spans.push(span.clone());
        Ok(span)
    }

    pub fn list(&self, run_id: &str) -> Option<Vec<Span>> {
        let runs = self.runs.read().ok()?;
        let list = runs.get(run_id)?;
        let spans = list.lock().ok()?;
        Some(spans.clone())
    }

    pub fn evict(&self, run_id: &str) {
        if let Ok(mut runs) = self.runs.write() {
            runs.remove(run_id);
        }
    }

    fn list_handle(&self, run_id: &str) -> Result<SpanList, String> {
        let runs = self
            .runs
            .read()
            .map_err(|_| "span index lock poisoned".to_string())?;
        runs.get(run_id)
            .cloned()
            .ok_or_else(|| format!("no span list open for run {run_id}"))
    }
}

fn value_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn draft(input: Value, output: Value) -> SpanDraft {
        SpanDraft {
            span_type: "tool_call".to_string(),
            input: Some(input),
            output: Some(output),
            duration_ms: 5,
        }
    }

    #[test]
    fn steps_are_strictly_increasing_per_run() {
        let recorder = SpanRecorder::new(RecordingMode::Plain);
        recorder.open_run("r1").expect("open");
        recorder.open_run("r2").expect("open");
        let a = recorder.append("r1", draft(json!("a"), json!("b"))).expect("append");
        let b = recorder.append("r1", draft(json!("c"), json!("d"))).expect("append");
        let c = recorder.append("r2", draft(json!("e"), json!("f"))).expect("append");
        assert_eq!((a.step, b.step, c.step), (1, 2, 1));
        assert_eq!(recorder.list("r1").expect("list").len(), 2);
    }

    #[test]
    fn hash_only_mode_never_keeps_plaintext() {
        let recorder = SpanRecorder::new(RecordingMode::HashOnly);
        recorder.open_run("r").expect("open");
        let span = recorder
            .append("r", draft(json!({"q": "secret plan"}), json!("answer")))
            .expect("append");
        assert!(span.is_hash_only());
        let serialized = serde_json::to_string(&recorder.list("r").expect("list")).expect("json");
        assert!(!serialized.contains("secret plan"));
        assert!(!serialized.contains("answer"));
    }

    #[test]
    fn plain_mode_masks_credentials() {
        let recorder = SpanRecorder::new(RecordingMode::Plain);
        recorder.open_run("r").expect("open");
        let span = recorder
            .append("r", draft(json!({"api_key": "sk-live"}), json!("ok")))
            .expect("append");
        assert_eq!(span.input.expect("input")["api_key"], "***MASKED***");
    }

    #[test]
    fn append_to_unknown_run_fails() {
        let recorder = SpanRecorder::new(RecordingMode::Plain);
        assert!(recorder.append("missing", draft(json!(1), json!(2))).is_err());
    }
}
