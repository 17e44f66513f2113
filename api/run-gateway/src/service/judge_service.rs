use crate::service::metrics_service;
use crate::service::span_service::RecordingMode;
use crate::service::text_service::{content_terms, numeric_tokens, split_sentences};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::warn;
use uuid::Uuid;

pub const NEUTRAL_GROUNDEDNESS: f64 = 0.5;

/// Sentence score ceiling when a number disagrees with every evidence item.
const NUMERIC_MISMATCH_CAP: f64 = 0.1;
const NUMERIC_MATCH_BONUS: f64 = 0.25;
const SUPPORTED_OVERLAP: f64 = 0.5;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Evidence {
    pub content: String,
    pub source: String,
    #[serde(default = "default_relevance")]
    pub relevance: f64,
}

fn default_relevance() -> f64 {
    1.0
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Verdict {
    pub id: String,
    pub run_id: String,
    pub groundedness: f64,
    pub citation_coverage: f64,
    pub confidence: f64,
    pub sampled_sentences: usize,
    pub total_sentences: usize,
    pub mode: RecordingMode,
    /// Set when a neutral verdict replaced a failed scoring attempt.
    pub fallback_reason: Option<String>,
}

#[derive(Debug, Error)]
pub enum JudgeError {
    #[error("no evidence supplied")]
    EvidenceUnavailable,
    #[error("latency budget exhausted after {elapsed_ms}ms before any sentence was scored")]
    BudgetExhausted { elapsed_ms: u64 },
    #[error("internal scoring error: {0}")]
    Internal(String),
}

impl JudgeError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::EvidenceUnavailable => "EVIDENCE_UNAVAILABLE",
            Self::BudgetExhausted { .. } => "JUDGE_BUDGET_EXHAUSTED",
            Self::Internal(_) => "JUDGE_INTERNAL_ERROR",
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct JudgeConfig {
    pub budget: Duration,
    pub max_sentences: usize,
    pub numeric_tolerance: f64,
}

#[derive(Debug, Clone, Copy)]
pub struct JudgeRequest<'a> {
    pub run_id: &'a str,
    pub output: &'a str,
    pub evidence: &'a [Evidence],
    pub prompt: Option<&'a str>,
    pub mode: RecordingMode,
}

struct EvidenceIndex {
    terms: HashSet<String>,
    numbers: Vec<f64>,
}

#[derive(Debug, Clone)]
pub struct Judge {
    config: JudgeConfig,
}

impl Judge {
    pub fn new(config: JudgeConfig) -> Self {
        Self { config }
    }

    /// Never fails: scoring errors are replaced by a neutral verdict.
    pub fn evaluate(&self, request: &JudgeRequest<'_>) -> Verdict {
        let started = Instant::now();
        let verdict = match self.score(request, started + self.config.budget) {
            Ok(verdict) => verdict,
            Err(err) => {
                warn!(
                    run_id = %request.run_id,
                    error_code = err.code(),
                    reason = %err,
                    "judge fell back to neutral verdict"
                );
                metrics_service::inc_judge_fallbacks();
                neutral_verdict(request.run_id, request.mode, Some(err.code().to_string()))
            }
        };
        metrics_service::record_judge_duration_ms(started.elapsed().as_millis() as u64);
        metrics_service::inc_verdicts();
        verdict
    }

    pub fn score(&self, request: &JudgeRequest<'_>, deadline: Instant) -> Result<Verdict, JudgeError> {
        if request.mode == RecordingMode::HashOnly {
            return Ok(Verdict {
                confidence: 0.0,
                ..neutral_verdict(request.run_id, RecordingMode::HashOnly, None)
            });
        }
        if request.evidence.iter().all(|e| e.content.trim().is_empty()) {
            return Err(JudgeError::EvidenceUnavailable);
        }
        if !self.config.numeric_tolerance.is_finite() || self.config.numeric_tolerance < 0.0 {
            return Err(JudgeError::Internal("numeric tolerance must be non-negative".to_string()));
        }

        let sentences = split_sentences(request.output);
        let total = sentences.len();
        if total == 0 {
            return Ok(neutral_verdict(request.run_id, RecordingMode::Plain, None));
        }

        let index = request
            .evidence
            .iter()
            .filter(|e| !e.content.trim().is_empty())
            .map(|e| EvidenceIndex {
                terms: content_terms(&e.content).into_iter().collect(),
                numbers: numeric_tokens(&e.content),
            })
            .collect::<Vec<_>>();

        let mut scores = Vec::new();
        for i in sample_indices(total, self.config.max_sentences) {
            if Instant::now() >= deadline {
                break;
            }
            scores.push(self.score_sentence(&sentences[i], &index));
        }
        if scores.is_empty() {
            return Err(JudgeError::BudgetExhausted {
                elapsed_ms: self.config.budget.as_millis() as u64,
            });
        }

        let sampled = scores.len();
        let groundedness = scores.iter().sum::<f64>() / sampled as f64;
        let supported = scores.iter().filter(|s| **s >= SUPPORTED_OVERLAP).count();
        let relevance = request
            .evidence
            .iter()
            .map(|e| e.relevance.clamp(0.0, 1.0))
            .sum::<f64>()
            / request.evidence.len() as f64;
        let sampling_ratio = sampled as f64 / total as f64;

        Ok(Verdict {
            id: verdict_id(),
            run_id: request.run_id.to_string(),
            groundedness: groundedness.clamp(0.0, 1.0),
            citation_coverage: supported as f64 / sampled as f64,
            confidence: (0.5 * sampling_ratio + 0.5 * relevance).clamp(0.0, 1.0),
            sampled_sentences: sampled,
            total_sentences: total,
            mode: RecordingMode::Plain,
            fallback_reason: None,
        })
    }

    fn score_sentence(&self, sentence: &str, index: &[EvidenceIndex]) -> f64 {
        let terms = content_terms(sentence).into_iter().collect::<HashSet<_>>();
        let numbers = numeric_tokens(sentence);

        let overlap = if terms.is_empty() {
            0.0
        } else {
            index
                .iter()
                .map(|e| terms.intersection(&e.terms).count() as f64 / terms.len() as f64)
                .fold(0.0, f64::max)
        };

        if numbers.is_empty() {
            return overlap;
        }
        let all_matched = numbers.iter().all(|n| {
            index
                .iter()
                .any(|e| e.numbers.iter().any(|m| within_tolerance(*n, *m, self.config.numeric_tolerance)))
        });
        if all_matched {
            (overlap + NUMERIC_MATCH_BONUS).min(1.0)
        } else {
            overlap.min(NUMERIC_MISMATCH_CAP)
        }
    }
}

fn within_tolerance(a: f64, b: f64, tolerance: f64) -> bool {
    let scale = a.abs().max(b.abs());
    if scale == 0.0 {
        return true;
    }
    (a - b).abs() <= tolerance * scale
}

/// Evenly strided, deterministic subset of sentence indices.
fn sample_indices(total: usize, budget: usize) -> Vec<usize> {
    let budget = budget.max(1);
    if total <= budget {
        return (0..total).collect();
    }
    (0..budget).map(|i| i * total / budget).collect()
}

fn verdict_id() -> String {
    format!("verdict_{}", Uuid::now_v7().simple())
}

pub fn neutral_verdict(run_id: &str, mode: RecordingMode, fallback_reason: Option<String>) -> Verdict {
    Verdict {
        id: verdict_id(),
        run_id: run_id.to_string(),
        groundedness: NEUTRAL_GROUNDEDNESS,
        citation_coverage: 0.0,
        confidence: 0.0,
        sampled_sentences: 0,
        total_sentences: 0,
        mode,
        fallback_reason,
    }
}
