//! Gate enforcement authority: per-session verdict/retry state machine.
//!
//! ```text
//! pending --PASS--> cleared
//! pending --skip--> cleared
//! pending --FAIL (attempts == max)--> exhausted
//! exhausted --retry--> pending (attempts reset)
//! exhausted --skip--> cleared
//! any --abort--> session terminated
//! ```
//!
//! A failed chain is never dropped silently: once exhausted, only an explicit
//! [`RecoveryAction`] moves the review forward.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::core::clock::Clock;
use crate::core::types::{EnforcementMode, ValidationResult};
use crate::core::verdict::{GateVerdict, VerdictSource};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReviewStatus {
    Pending,
    Exhausted,
}

/// User-selectable recovery choices.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecoveryAction {
    Retry,
    Skip,
    Abort,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingGateReview {
    pub session_id: String,
    pub gate_ids: Vec<String>,
    pub instructions: String,
    pub attempt_count: u32,
    pub max_attempts: u32,
    pub prior_verdicts: Vec<GateVerdict>,
    pub status: ReviewStatus,
    pub enforcement: EnforcementMode,
    pub created_at_ms: u64,
    pub updated_at_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClearReason {
    Passed,
    Skipped,
}

/// Result of feeding a verdict or recovery action into the state machine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ReviewOutcome {
    Cleared {
        reason: ClearReason,
    },
    RetryRequired {
        attempt: u32,
        max_attempts: u32,
        feedback: String,
    },
    Exhausted {
        attempts: u32,
        actions: Vec<RecoveryAction>,
    },
    Aborted,
}

/// Whether the chain may proceed past the current gate review.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContinuationDecision {
    pub may_continue: bool,
    pub mode: Option<EnforcementMode>,
    pub message: Option<String>,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum EnforcementError {
    #[error("no pending gate review for session '{0}'")]
    NoPendingReview(String),
    #[error(
        "gate review for session '{session_id}' is exhausted after {attempts} attempts; choose retry, skip, or abort"
    )]
    ReviewExhausted { session_id: String, attempts: u32 },
    #[error("recovery action '{action:?}' is not valid while the review is {status:?}")]
    InvalidAction {
        action: RecoveryAction,
        status: ReviewStatus,
    },
}

/// Drives gate reviews for many concurrent sessions.
pub struct GateEnforcementAuthority {
    clock: Arc<dyn Clock>,
    reviews: Mutex<HashMap<String, PendingGateReview>>,
}

impl GateEnforcementAuthority {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            reviews: Mutex::new(HashMap::new()),
        }
    }

    /// Open (or replace) the pending review for a session.
    pub fn open_review(
        &self,
        session_id: &str,
        gate_ids: Vec<String>,
        instructions: impl Into<String>,
        max_attempts: u32,
        enforcement: EnforcementMode,
    ) -> PendingGateReview {
        let now = self.clock.now_ms();
        let review = PendingGateReview {
            session_id: session_id.to_string(),
            gate_ids,
            instructions: instructions.into(),
            attempt_count: 0,
            max_attempts: max_attempts.max(1),
            prior_verdicts: Vec::new(),
            status: ReviewStatus::Pending,
            enforcement,
            created_at_ms: now,
            updated_at_ms: now,
        };
        debug!(session_id, gates = ?review.gate_ids, max_attempts = review.max_attempts, "gate review opened");
        self.lock()
            .insert(session_id.to_string(), review.clone());
        review
    }

    pub fn review(&self, session_id: &str) -> Option<PendingGateReview> {
        self.lock().get(session_id).cloned()
    }

    /// Apply a parsed verdict to the session's pending review.
    pub fn record_verdict(
        &self,
        session_id: &str,
        verdict: GateVerdict,
    ) -> Result<ReviewOutcome, EnforcementError> {
        let now = self.clock.now_ms();
        let mut reviews = self.lock();
        let review = reviews
            .get_mut(session_id)
            .ok_or_else(|| EnforcementError::NoPendingReview(session_id.to_string()))?;

        if review.status == ReviewStatus::Exhausted {
            return Err(EnforcementError::ReviewExhausted {
                session_id: session_id.to_string(),
                attempts: review.attempt_count,
            });
        }

        review.updated_at_ms = now;
        if verdict.is_pass() {
            info!(session_id, rationale = %verdict.rationale, "gate review passed");
            reviews.remove(session_id);
            return Ok(ReviewOutcome::Cleared {
                reason: ClearReason::Passed,
            });
        }

        review.attempt_count += 1;
        let feedback = format!(
            "Gate review failed (attempt {}/{}): {}",
            review.attempt_count, review.max_attempts, verdict.rationale
        );
        review.prior_verdicts.push(verdict);

        if review.attempt_count >= review.max_attempts {
            review.status = ReviewStatus::Exhausted;
            warn!(
                session_id,
                attempts = review.attempt_count,
                "gate review exhausted, awaiting user action"
            );
            return Ok(ReviewOutcome::Exhausted {
                attempts: review.attempt_count,
                actions: vec![
                    RecoveryAction::Retry,
                    RecoveryAction::Skip,
                    RecoveryAction::Abort,
                ],
            });
        }

        debug!(session_id, attempt = review.attempt_count, "gate review failed, retry required");
        Ok(ReviewOutcome::RetryRequired {
            attempt: review.attempt_count,
            max_attempts: review.max_attempts,
            feedback,
        })
    }

    /// Convert validator output into a verdict and apply it.
    pub fn record_validation(
        &self,
        session_id: &str,
        results: &[ValidationResult],
    ) -> Result<ReviewOutcome, EnforcementError> {
        let verdict = verdict_from_results(results);
        self.record_verdict(session_id, verdict)
    }

    /// Apply an explicit user recovery choice.
    pub fn resolve(
        &self,
        session_id: &str,
        action: RecoveryAction,
    ) -> Result<ReviewOutcome, EnforcementError> {
        let now = self.clock.now_ms();
        let mut reviews = self.lock();
        let review = reviews
            .get_mut(session_id)
            .ok_or_else(|| EnforcementError::NoPendingReview(session_id.to_string()))?;

        match (action, review.status) {
            (RecoveryAction::Retry, ReviewStatus::Exhausted) => {
                review.attempt_count = 0;
                review.status = ReviewStatus::Pending;
                review.updated_at_ms = now;
                info!(session_id, "gate review reset by user");
                Ok(ReviewOutcome::RetryRequired {
                    attempt: 0,
                    max_attempts: review.max_attempts,
                    feedback: "Retry requested; the gate review starts over.".to_string(),
                })
            }
            (RecoveryAction::Retry, status) => Err(EnforcementError::InvalidAction { action, status }),
            (RecoveryAction::Skip, _) => {
                info!(session_id, "gate review skipped by user");
                reviews.remove(session_id);
                Ok(ReviewOutcome::Cleared {
                    reason: ClearReason::Skipped,
                })
            }
            (RecoveryAction::Abort, _) => {
                info!(session_id, "session aborted at gate review");
                reviews.remove(session_id);
                Ok(ReviewOutcome::Aborted)
            }
        }
    }

    /// Decide whether the chain may continue while a review is open.
    pub fn continuation(&self, session_id: &str) -> ContinuationDecision {
        let reviews = self.lock();
        let Some(review) = reviews.get(session_id) else {
            return ContinuationDecision {
                may_continue: true,
                mode: None,
                message: None,
            };
        };
        let gates = review.gate_ids.join(", ");
        match review.enforcement {
            EnforcementMode::Blocking => ContinuationDecision {
                may_continue: false,
                mode: Some(EnforcementMode::Blocking),
                message: Some(match review.status {
                    ReviewStatus::Pending => format!("Blocked until gate review passes: {gates}"),
                    ReviewStatus::Exhausted => format!(
                        "Gate review exhausted for {gates}; choose retry, skip, or abort"
                    ),
                }),
            },
            EnforcementMode::Advisory => ContinuationDecision {
                may_continue: true,
                mode: Some(EnforcementMode::Advisory),
                message: Some(format!("Warning: gate review not yet passed: {gates}")),
            },
            EnforcementMode::Informational => ContinuationDecision {
                may_continue: true,
                mode: Some(EnforcementMode::Informational),
                message: None,
            },
        }
    }

    pub fn clear_session(&self, session_id: &str) -> bool {
        self.lock().remove(session_id).is_some()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, PendingGateReview>> {
        self.reviews
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn verdict_from_results(results: &[ValidationResult]) -> GateVerdict {
    let failed: Vec<&ValidationResult> = results.iter().filter(|r| !r.passed).collect();
    if failed.is_empty() {
        return GateVerdict::pass(
            format!("{} gate(s) passed validation", results.len()),
            VerdictSource::GateProduced,
        );
    }
    let reasons: Vec<String> = failed
        .iter()
        .flat_map(|result| {
            result
                .failed_checks()
                .map(move |check| format!("{}: {}", result.gate_id, check.message))
        })
        .collect();
    GateVerdict::fail(reasons.join("; "), VerdictSource::GateProduced)
}

/// Reminder text shown to the reviewer while a gate review is open.
pub fn format_review_reminder(review: &PendingGateReview) -> String {
    let mut lines = vec![format!(
        "[Gate] {} - Respond: GATE_REVIEW: PASS|FAIL - <reason>",
        review.gate_ids.join(", ")
    )];
    if review.attempt_count > 0 {
        lines.push(format!(
            "  Attempt {}/{}",
            review.attempt_count, review.max_attempts
        ));
    }
    if review.status == ReviewStatus::Exhausted {
        lines.push("  Retries exhausted: choose retry, skip, or abort".to_string());
    }
    lines.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::clock::ManualClock;
    use crate::core::types::ValidationCheck;

    fn authority() -> GateEnforcementAuthority {
        GateEnforcementAuthority::new(Arc::new(ManualClock::new(0)))
    }

    fn fail(reason: &str) -> GateVerdict {
        GateVerdict::fail(reason, VerdictSource::UserSupplied)
    }

    #[test]
    fn pass_clears_review() {
        let auth = authority();
        auth.open_review("s1", vec!["g".into()], "check", 3, EnforcementMode::Blocking);
        let outcome = auth
            .record_verdict("s1", GateVerdict::pass("ok", VerdictSource::UserSupplied))
            .expect("verdict");
        assert_eq!(
            outcome,
            ReviewOutcome::Cleared {
                reason: ClearReason::Passed
            }
        );
        assert!(auth.review("s1").is_none());
    }

    #[test]
    fn failures_exhaust_at_ceiling_and_stay_exhausted() {
        let auth = authority();
        auth.open_review("s1", vec!["g".into()], "check", 2, EnforcementMode::Blocking);

        let first = auth.record_verdict("s1", fail("nope")).expect("first");
        assert!(matches!(first, ReviewOutcome::RetryRequired { attempt: 1, .. }));

        let second = auth.record_verdict("s1", fail("still no")).expect("second");
        assert!(matches!(second, ReviewOutcome::Exhausted { attempts: 2, .. }));

        let err = auth
            .record_verdict("s1", GateVerdict::pass("late", VerdictSource::UserSupplied))
            .expect_err("exhausted rejects verdicts");
        assert!(matches!(err, EnforcementError::ReviewExhausted { attempts: 2, .. }));
        assert_eq!(
            auth.review("s1").expect("review").status,
            ReviewStatus::Exhausted
        );
    }

    #[test]
    fn retry_resets_attempts_only_from_exhausted() {
        let auth = authority();
        auth.open_review("s1", vec!["g".into()], "check", 1, EnforcementMode::Blocking);

        let err = auth
            .resolve("s1", RecoveryAction::Retry)
            .expect_err("retry while pending");
        assert!(matches!(err, EnforcementError::InvalidAction { .. }));

        auth.record_verdict("s1", fail("no")).expect("fail");
        auth.resolve("s1", RecoveryAction::Retry).expect("retry");
        let review = auth.review("s1").expect("review");
        assert_eq!(review.status, ReviewStatus::Pending);
        assert_eq!(review.attempt_count, 0);
        assert_eq!(review.prior_verdicts.len(), 1);
    }

    #[test]
    fn skip_and_abort_remove_review() {
        let auth = authority();
        auth.open_review("a", vec!["g".into()], "", 3, EnforcementMode::Blocking);
        auth.open_review("b", vec!["g".into()], "", 3, EnforcementMode::Blocking);

        assert_eq!(
            auth.resolve("a", RecoveryAction::Skip).expect("skip"),
            ReviewOutcome::Cleared {
                reason: ClearReason::Skipped
            }
        );
        assert_eq!(
            auth.resolve("b", RecoveryAction::Abort).expect("abort"),
            ReviewOutcome::Aborted
        );
        assert!(auth.review("a").is_none());
        assert!(auth.review("b").is_none());
    }

    #[test]
    fn continuation_depends_on_enforcement_mode() {
        let auth = authority();
        assert!(auth.continuation("none").may_continue);

        auth.open_review("block", vec!["g".into()], "", 3, EnforcementMode::Blocking);
        auth.open_review("warn", vec!["g".into()], "", 3, EnforcementMode::Advisory);
        auth.open_review("info", vec!["g".into()], "", 3, EnforcementMode::Informational);

        assert!(!auth.continuation("block").may_continue);
        let warn = auth.continuation("warn");
        assert!(warn.may_continue);
        assert!(warn.message.is_some());
        assert!(auth.continuation("info").may_continue);
    }

    #[test]
    fn sessions_are_isolated() {
        let auth = authority();
        auth.open_review("a", vec!["g".into()], "", 3, EnforcementMode::Blocking);
        auth.open_review("b", vec!["g".into()], "", 3, EnforcementMode::Blocking);
        auth.record_verdict("a", fail("x")).expect("fail a");
        assert_eq!(auth.review("a").expect("a").attempt_count, 1);
        assert_eq!(auth.review("b").expect("b").attempt_count, 0);
    }

    #[test]
    fn validation_results_drive_verdict() {
        let auth = authority();
        auth.open_review("s", vec!["g".into()], "", 3, EnforcementMode::Blocking);
        let failing = ValidationResult::from_checks(
            "g",
            vec![ValidationCheck::fail("shell_verify", "exit 1")],
        );
        let outcome = auth.record_validation("s", &[failing]).expect("record");
        match outcome {
            ReviewOutcome::RetryRequired { feedback, .. } => assert!(feedback.contains("g: exit 1")),
            other => panic!("unexpected outcome {other:?}"),
        }

        let passing = ValidationResult::from_checks("g", Vec::new());
        assert!(matches!(
            auth.record_validation("s", &[passing]).expect("record"),
            ReviewOutcome::Cleared { .. }
        ));
    }

    #[test]
    fn reminder_mentions_verdict_format() {
        let auth = authority();
        let review = auth.open_review("s", vec!["code-quality".into()], "", 3, EnforcementMode::Blocking);
        let text = format_review_reminder(&review);
        assert!(text.contains("GATE_REVIEW: PASS|FAIL - <reason>"));
        assert!(text.contains("code-quality"));
    }

    #[test]
    fn missing_review_is_an_error() {
        let auth = authority();
        assert_eq!(
            auth.record_verdict("ghost", fail("x")).expect_err("missing"),
            EnforcementError::NoPendingReview("ghost".to_string())
        );
    }
}
