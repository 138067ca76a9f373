//! Verifier-mode failure analysis and the bounded self-repair loop.
//!
//! This module provides:
//! - failure taxonomy classification for Act-phase signals
//! - structured PATCH artifacts (problem, cause, fix, verification plan)
//! - a bounded repair loop that never retries past its attempt cap

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Coarse failure taxonomy used when generating a patch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// The tool invocation itself errored.
    ToolError,
    /// The tool ran but its result contradicted the expected outcome.
    VerificationMismatch,
    /// No explicit failure, but confidence fell below the floor.
    LowConfidence,
    Unknown,
}

/// Structured failure signal from the Act phase.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActFailure {
    /// The action that failed (tool name or plan step).
    pub action: String,
    pub message: String,
    pub retry_count: u32,
    /// Confidence in [0,1] attached to the attempt.
    pub confidence: f64,
}

impl ActFailure {
    pub fn new(action: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            action: action.into(),
            message: message.into(),
            retry_count: 0,
            confidence: 0.0,
        }
    }
}

/// Classify a failure into a coarse category.
pub fn classify_failure(failure: &ActFailure) -> FailureKind {
    let msg = failure.message.to_lowercase();

    if msg.contains("tool")
        || msg.contains("timeout")
        || msg.contains("unavailable")
        || msg.contains("connection")
    {
        return FailureKind::ToolError;
    }
    if msg.contains("mismatch")
        || msg.contains("expected")
        || msg.contains("assertion")
        || msg.contains("verif")
    {
        return FailureKind::VerificationMismatch;
    }
    if msg.contains("confidence") || msg.is_empty() {
        return FailureKind::LowConfidence;
    }
    FailureKind::Unknown
}

/// Structured self-correction artifact produced in Verifier mode.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Patch {
    pub problem: String,
    pub cause: String,
    pub fix: String,
    /// How the fix will be checked before returning to Solver mode.
    pub verification: String,
}

/// Generate a patch proposal for a classified failure.
pub fn generate_patch(failure: &ActFailure, attempt: u32) -> Patch {
    let kind = classify_failure(failure);
    let (cause, fix) = match kind {
        FailureKind::ToolError => (
            format!("tool invocation for '{}' failed: {}", failure.action, failure.message),
            format!("retry '{}' with narrowed inputs and a fresh tool session", failure.action),
        ),
        FailureKind::VerificationMismatch => (
            format!("outcome of '{}' contradicted the expectation: {}", failure.action, failure.message),
            format!("re-derive the expectation for '{}' and adjust the plan step", failure.action),
        ),
        FailureKind::LowConfidence => (
            format!(
                "confidence {:.2} fell below the floor after {} retries",
                failure.confidence, failure.retry_count
            ),
            format!("gather more context before re-attempting '{}'", failure.action),
        ),
        FailureKind::Unknown => (
            format!("unclassified failure: {}", failure.message),
            format!("re-attempt '{}' under closer observation", failure.action),
        ),
    };

    Patch {
        problem: format!("act-phase failure in '{}' (attempt {attempt})", failure.action),
        cause,
        fix,
        verification: format!("re-run '{}' and compare against the expected outcome", failure.action),
    }
}

/// One applied patch and whether it verified.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatchAttempt {
    pub attempt: u32,
    pub patch: Patch,
    pub verified: bool,
}

/// Result of applying a single patch.
#[derive(Debug, Clone, PartialEq)]
pub struct RepairAttemptResult {
    pub verified: bool,
    /// The failure observed on re-verification, when it failed again.
    pub next_failure: Option<ActFailure>,
}

/// Repair loop final state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RepairOutcome {
    Repaired,
    Exhausted,
}

/// Full repair log for audit and the self-repair memory entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RepairLog {
    pub agent_id: String,
    pub initial_failure: ActFailure,
    pub attempts: Vec<PatchAttempt>,
    pub outcome: RepairOutcome,
    pub final_failure: Option<ActFailure>,
    pub evaluated_at: DateTime<Utc>,
}

impl RepairLog {
    /// Render the corrected reasoning for the self-repair memory entry.
    pub fn corrected_reasoning(&self) -> String {
        match self.attempts.last() {
            Some(last) => format!(
                "{} | cause: {} | fix: {} | verified via: {}",
                last.patch.problem, last.patch.cause, last.patch.fix, last.patch.verification
            ),
            None => format!("no patch generated for '{}'", self.initial_failure.action),
        }
    }
}

/// Run the bounded repair loop: analyze, patch, apply, re-verify.
///
/// `apply_patch` performs the apply + re-verify step for one patch
/// (typically a tool invocation, hence async). The loop stops at the first
/// verified patch or after `max_attempts`, whichever comes first. This is
/// the one path that must never retry unbounded.
pub async fn run_repair_loop<F, Fut>(
    agent_id: &str,
    initial_failure: ActFailure,
    max_attempts: u32,
    now: DateTime<Utc>,
    mut apply_patch: F,
) -> RepairLog
where
    F: FnMut(u32, Patch) -> Fut,
    Fut: std::future::Future<Output = RepairAttemptResult>,
{
    let mut current = initial_failure.clone();
    let mut attempts = Vec::new();

    for attempt in 1..=max_attempts {
        let patch = generate_patch(&current, attempt);
        let result = apply_patch(attempt, patch.clone()).await;

        attempts.push(PatchAttempt {
            attempt,
            patch,
            verified: result.verified,
        });

        if result.verified {
            return RepairLog {
                agent_id: agent_id.to_string(),
                initial_failure,
                attempts,
                outcome: RepairOutcome::Repaired,
                final_failure: None,
                evaluated_at: now,
            };
        }

        if let Some(next) = result.next_failure {
            current = next;
        }
    }

    RepairLog {
        agent_id: agent_id.to_string(),
        initial_failure,
        attempts,
        outcome: RepairOutcome::Exhausted,
        final_failure: Some(current),
        evaluated_at: now,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn failure(message: &str) -> ActFailure {
        ActFailure::new("deploy_service", message)
    }

    #[test]
    fn classification_covers_taxonomy() {
        assert_eq!(
            classify_failure(&failure("tool timeout while calling API")),
            FailureKind::ToolError
        );
        assert_eq!(
            classify_failure(&failure("verification mismatch: expected 200")),
            FailureKind::VerificationMismatch
        );
        assert_eq!(
            classify_failure(&failure("confidence below floor")),
            FailureKind::LowConfidence
        );
        assert_eq!(classify_failure(&failure("gremlins")), FailureKind::Unknown);
    }

    #[test]
    fn patch_names_problem_cause_fix_verification() {
        let p = generate_patch(&failure("tool timeout"), 1);
        assert!(p.problem.contains("deploy_service"));
        assert!(!p.cause.is_empty());
        assert!(!p.fix.is_empty());
        assert!(p.verification.contains("deploy_service"));
    }

    #[tokio::test]
    async fn repair_loop_stops_on_first_verified_patch() {
        let log = run_repair_loop(
            "agent-1",
            failure("tool timeout"),
            3,
            Utc::now(),
            |attempt, _| async move {
                RepairAttemptResult {
                    verified: attempt == 2,
                    next_failure: Some(failure("tool timeout again")),
                }
            },
        )
        .await;

        assert_eq!(log.outcome, RepairOutcome::Repaired);
        assert_eq!(log.attempts.len(), 2);
        assert!(log.attempts[1].verified);
        assert!(log.final_failure.is_none());
    }

    #[tokio::test]
    async fn repair_loop_exhausts_at_cap() {
        let applied = std::sync::atomic::AtomicU32::new(0);
        let log = run_repair_loop("agent-1", failure("mismatch"), 3, Utc::now(), |_, _| {
            applied.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            async {
                RepairAttemptResult {
                    verified: false,
                    next_failure: Some(failure("mismatch persists")),
                }
            }
        })
        .await;

        assert_eq!(
            applied.load(std::sync::atomic::Ordering::SeqCst),
            3,
            "never more than the cap"
        );
        assert_eq!(log.outcome, RepairOutcome::Exhausted);
        assert_eq!(log.attempts.len(), 3);
        assert!(log.final_failure.is_some());
    }

    #[tokio::test]
    async fn corrected_reasoning_reflects_last_patch() {
        let log = run_repair_loop("agent-1", failure("tool timeout"), 2, Utc::now(), |_, _| {
            async {
                RepairAttemptResult {
                    verified: true,
                    next_failure: None,
                }
            }
        })
        .await;
        let reasoning = log.corrected_reasoning();
        assert!(reasoning.contains("cause:"));
        assert!(reasoning.contains("fix:"));
    }

    #[tokio::test]
    async fn repair_log_serde_roundtrip() {
        let log = run_repair_loop("agent-1", failure("mismatch"), 1, Utc::now(), |_, _| {
            async {
                RepairAttemptResult {
                    verified: false,
                    next_failure: None,
                }
            }
        })
        .await;
        let json = serde_json::to_string(&log).unwrap();
        let back: RepairLog = serde_json::from_str(&json).unwrap();
        assert_eq!(back, log);
    }
}
