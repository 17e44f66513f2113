use crate::service::detector_service::{Finding, FindingKind, Severity};
use crate::service::judge_service::Verdict;
use crate::service::metrics_service;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const GROUNDEDNESS_POLICY: &str = "groundedness-v1";
pub const INJECTION_OVERRIDE_POLICY: &str = "injection-override";
pub const PII_FLOOR_POLICY: &str = "pii-approval-floor";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum ShieldAction {
    Allow,
    RequireApproval,
    Block,
}

impl ShieldAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Allow => "allow",
            Self::RequireApproval => "require_approval",
            Self::Block => "block",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShieldDecision {
    pub id: String,
    pub run_id: String,
    pub action: ShieldAction,
    pub reasoning: String,
    pub policy_applied: String,
    pub verdict_id: String,
}

/// Turns the latest verdict plus detector findings into the authoritative
/// enforcement action. Same inputs always give the same action.
#[derive(Debug, Clone, Copy)]
pub struct ShieldPolicy {
    pub block_threshold: f64,
    pub approve_threshold: f64,
}

impl ShieldPolicy {
    pub fn new(block_threshold: f64, approve_threshold: f64) -> Self {
        Self {
            block_threshold,
            approve_threshold,
        }
    }

    pub fn decide(&self, verdict: &Verdict, findings: &[Finding]) -> ShieldDecision {
        let (action, reasoning, policy) = self.evaluate(verdict, findings);
        match action {
            ShieldAction::Allow => metrics_service::inc_shield_allow(),
            ShieldAction::RequireApproval => metrics_service::inc_shield_require_approval(),
            ShieldAction::Block => metrics_service::inc_shield_block(),
        }
        ShieldDecision {
            id: format!("decision_{}", Uuid::now_v7().simple()),
            run_id: verdict.run_id.clone(),
            action,
            reasoning,
            policy_applied: policy.to_string(),
            verdict_id: verdict.id.clone(),
        }
    }

    fn evaluate(&self, verdict: &Verdict, findings: &[Finding]) -> (ShieldAction, String, &'static str) {
        let detected = findings.iter().filter(|f| f.detected);
        let mut high_injection = false;
        let mut pii = false;
        for finding in detected {
            match finding.kind {
                FindingKind::Injection if finding.severity == Severity::High => high_injection = true,
                FindingKind::Pii => pii = true,
                _ => {}
            }
        }

        if high_injection {
            return (
                ShieldAction::Block,
                "high severity injection finding".to_string(),
                INJECTION_OVERRIDE_POLICY,
            );
        }

        let g = verdict.groundedness;
        let (by_score, reasoning) = if g < self.block_threshold {
            (
                ShieldAction::Block,
                format!("groundedness {g:.3} below block threshold {:.3}", self.block_threshold),
            )
        } else if g < self.approve_threshold {
            (
                ShieldAction::RequireApproval,
                format!("groundedness {g:.3} below approve threshold {:.3}", self.approve_threshold),
            )
        } else {
            (
                ShieldAction::Allow,
                format!("groundedness {g:.3} meets approve threshold {:.3}", self.approve_threshold),
            )
        };

        if pii && by_score < ShieldAction::RequireApproval {
            return (
                ShieldAction::RequireApproval,
                format!("pii finding present; {reasoning}"),
                PII_FLOOR_POLICY,
            );
        }
        (by_score, reasoning, GROUNDEDNESS_POLICY)
    }
}
