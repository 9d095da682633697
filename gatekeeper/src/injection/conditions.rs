//! Ordered `when -> then` rule evaluation.

use serde::{Deserialize, Serialize};

use crate::injection::types::{Condition, ConditionAction, ConditionPredicate, InjectionContext};

/// First condition that matched.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConditionMatch {
    pub index: usize,
    pub action: ConditionAction,
    pub reason: String,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ConditionEvaluator;

impl ConditionEvaluator {
    pub fn new() -> Self {
        Self
    }

    /// Walk `conditions` in order and return the first match, if any.
    pub fn evaluate(&self, conditions: &[Condition], ctx: &InjectionContext) -> Option<ConditionMatch> {
        conditions
            .iter()
            .enumerate()
            .find(|(_, condition)| predicate_holds(&condition.when, ctx))
            .map(|(index, condition)| ConditionMatch {
                index,
                action: condition.then,
                reason: condition
                    .reason
                    .clone()
                    .unwrap_or_else(|| describe(&condition.when)),
            })
    }
}

fn predicate_holds(predicate: &ConditionPredicate, ctx: &InjectionContext) -> bool {
    match predicate {
        ConditionPredicate::GateStatus { gate_id, status } => ctx
            .gate_statuses
            .get(gate_id)
            .is_some_and(|actual| actual.eq_ignore_ascii_case(status)),
        ConditionPredicate::StepType { value } => ctx
            .step_type
            .as_deref()
            .is_some_and(|actual| actual.eq_ignore_ascii_case(value)),
        ConditionPredicate::StepNumber { op, value } => op.holds(ctx.current_step, *value),
        ConditionPredicate::PreviousStepResult { value } => ctx
            .previous_step_result
            .as_deref()
            .is_some_and(|actual| actual.eq_ignore_ascii_case(value)),
        ConditionPredicate::ChainPosition { position } => ctx.chain_position() == *position,
        ConditionPredicate::Always => true,
    }
}

fn describe(predicate: &ConditionPredicate) -> String {
    match predicate {
        ConditionPredicate::GateStatus { gate_id, status } => format!("gate '{gate_id}' is {status}"),
        ConditionPredicate::StepType { value } => format!("step type is {value}"),
        ConditionPredicate::StepNumber { op, value } => format!("step number {op:?} {value}").to_lowercase(),
        ConditionPredicate::PreviousStepResult { value } => format!("previous step result is {value}"),
        ConditionPredicate::ChainPosition { position } => format!("chain position is {position:?}").to_lowercase(),
        ConditionPredicate::Always => "always".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::injection::types::{ChainPosition, Comparison};

    fn cond(when: ConditionPredicate, then: ConditionAction) -> Condition {
        Condition {
            when,
            then,
            reason: None,
        }
    }

    #[test]
    fn first_matching_condition_wins() {
        let mut ctx = InjectionContext::new("s", 3);
        ctx.previous_step_result = Some("failed".to_string());
        let conditions = vec![
            cond(
                ConditionPredicate::StepNumber {
                    op: Comparison::Lt,
                    value: 2,
                },
                ConditionAction::Skip,
            ),
            cond(
                ConditionPredicate::PreviousStepResult {
                    value: "FAILED".to_string(),
                },
                ConditionAction::Inject,
            ),
            cond(ConditionPredicate::Always, ConditionAction::Skip),
        ];
        let matched = ConditionEvaluator::new().evaluate(&conditions, &ctx).expect("match");
        assert_eq!(matched.index, 1);
        assert_eq!(matched.action, ConditionAction::Inject);
        assert_eq!(matched.reason, "previous step result is FAILED");
    }

    #[test]
    fn gate_status_step_type_and_position_predicates() {
        let mut ctx = InjectionContext::new("s", 4);
        ctx.total_steps = Some(4);
        ctx.step_type = Some("review".to_string());
        ctx.gate_statuses.insert("tests".to_string(), "failed".to_string());

        let evaluator = ConditionEvaluator::new();
        let holds = |when: ConditionPredicate| {
            evaluator
                .evaluate(&[cond(when, ConditionAction::Inject)], &ctx)
                .is_some()
        };
        assert!(holds(ConditionPredicate::GateStatus {
            gate_id: "tests".to_string(),
            status: "failed".to_string()
        }));
        assert!(!holds(ConditionPredicate::GateStatus {
            gate_id: "lint".to_string(),
            status: "failed".to_string()
        }));
        assert!(holds(ConditionPredicate::StepType {
            value: "review".to_string()
        }));
        assert!(holds(ConditionPredicate::ChainPosition {
            position: ChainPosition::Last
        }));
        assert!(holds(ConditionPredicate::StepNumber {
            op: Comparison::Gte,
            value: 4
        }));
    }

    #[test]
    fn no_match_returns_none_and_custom_reason_is_kept() {
        let ctx = InjectionContext::new("s", 1);
        let evaluator = ConditionEvaluator::new();
        assert!(evaluator
            .evaluate(
                &[cond(
                    ConditionPredicate::StepType {
                        value: "x".to_string()
                    },
                    ConditionAction::Inject
                )],
                &ctx
            )
            .is_none());

        let with_reason = Condition {
            when: ConditionPredicate::Always,
            then: ConditionAction::Inherit,
            reason: Some("defer to defaults".to_string()),
        };
        let matched = evaluator.evaluate(&[with_reason], &ctx).expect("match");
        assert_eq!(matched.reason, "defer to defaults");
    }
}
