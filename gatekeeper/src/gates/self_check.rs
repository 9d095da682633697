//! Pluggable semantic self-check.
//!
//! No model is invoked here. Without an enabled config and a wired-in
//! [`SemanticEvaluator`], `llm_self_check` criteria pass with a "skipped" message.

use anyhow::{Context, Result};
use minijinja::{Environment, context};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::core::types::{GateDefinition, ValidationCheck, ValidationContext};

const SELF_CHECK_TEMPLATE: &str = include_str!("prompts/self_check.md");
pub const CHECK_TYPE: &str = "llm_self_check";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SemanticEvaluationConfig {
    pub enabled: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
}

impl SemanticEvaluationConfig {
    pub fn is_eligible(&self) -> bool {
        self.enabled && self.endpoint.as_deref().is_some_and(|e| !e.trim().is_empty())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SemanticVerdict {
    pub passed: bool,
    pub score: Option<f64>,
    pub feedback: String,
}

/// Judges content against natural-language criteria.
pub trait SemanticEvaluator: Send + Sync {
    fn evaluate(&self, content: &str, criteria: &str) -> Result<SemanticVerdict>;
}

/// Render the evaluation prompt, using the criterion's own template when given.
pub fn render_self_check_prompt(
    gate: &GateDefinition,
    template: Option<&str>,
    ctx: &ValidationContext,
) -> Result<String> {
    let mut env = Environment::new();
    env.add_template("self_check", template.unwrap_or(SELF_CHECK_TEMPLATE))
        .context("parse self-check template")?;
    let rendered = env.get_template("self_check")?.render(context! {
        gate_id => &gate.id,
        gate_name => &gate.name,
        guidance => (!gate.guidance.trim().is_empty()).then(|| gate.guidance.trim()),
        category => ctx.category.as_deref(),
        content => &ctx.content,
    })?;
    Ok(rendered)
}

/// Evaluate one `llm_self_check` criterion.
pub fn run_self_check(
    evaluator: Option<&dyn SemanticEvaluator>,
    config: &SemanticEvaluationConfig,
    gate: &GateDefinition,
    template: Option<&str>,
    ctx: &ValidationContext,
) -> Result<ValidationCheck> {
    let Some(evaluator) = evaluator.filter(|_| config.is_eligible()) else {
        debug!(gate_id = %gate.id, "semantic evaluation not configured; skipping");
        return Ok(ValidationCheck::pass(
            CHECK_TYPE,
            "Semantic evaluation skipped: no evaluator configured",
        )
        .with_detail("skipped", true));
    };

    let criteria = render_self_check_prompt(gate, template, ctx)?;
    let verdict = evaluator
        .evaluate(&ctx.content, &criteria)
        .with_context(|| format!("semantic evaluation for gate '{}'", gate.id))?;

    let mut check = if verdict.passed {
        ValidationCheck::pass(CHECK_TYPE, verdict.feedback)
    } else {
        ValidationCheck::fail(CHECK_TYPE, verdict.feedback)
    };
    check.score = verdict.score;
    Ok(check)
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;

    struct Fixed(SemanticVerdict);

    impl SemanticEvaluator for Fixed {
        fn evaluate(&self, _content: &str, criteria: &str) -> Result<SemanticVerdict> {
            assert!(criteria.contains("Docs"));
            Ok(self.0.clone())
        }
    }

    struct Broken;

    impl SemanticEvaluator for Broken {
        fn evaluate(&self, _content: &str, _criteria: &str) -> Result<SemanticVerdict> {
            Err(anyhow!("endpoint unreachable"))
        }
    }

    fn enabled() -> SemanticEvaluationConfig {
        SemanticEvaluationConfig {
            enabled: true,
            endpoint: Some("http://localhost:1".to_string()),
        }
    }

    #[test]
    fn skips_without_evaluator_or_when_disabled() {
        let gate = GateDefinition::new("docs", "Docs");
        let ctx = ValidationContext::for_content("hello");
        let check = run_self_check(None, &enabled(), &gate, None, &ctx).expect("check");
        assert!(check.passed);
        assert!(check.message.contains("skipped"));

        let evaluator = Fixed(SemanticVerdict {
            passed: false,
            score: Some(0.1),
            feedback: "bad".to_string(),
        });
        let disabled = SemanticEvaluationConfig::default();
        let check = run_self_check(Some(&evaluator), &disabled, &gate, None, &ctx).expect("check");
        assert!(check.passed);
    }

    #[test]
    fn uses_evaluator_verdict_when_eligible() {
        let gate = GateDefinition::new("docs", "Docs");
        let ctx = ValidationContext::for_content("hello");
        let evaluator = Fixed(SemanticVerdict {
            passed: false,
            score: Some(0.25),
            feedback: "missing examples".to_string(),
        });
        let check = run_self_check(Some(&evaluator), &enabled(), &gate, None, &ctx).expect("check");
        assert!(!check.passed);
        assert_eq!(check.score, Some(0.25));
        assert_eq!(check.message, "missing examples");
    }

    #[test]
    fn evaluator_errors_propagate() {
        let gate = GateDefinition::new("docs", "Docs");
        let ctx = ValidationContext::for_content("hello");
        assert!(run_self_check(Some(&Broken), &enabled(), &gate, None, &ctx).is_err());
    }

    #[test]
    fn renders_custom_template() {
        let mut gate = GateDefinition::new("docs", "Docs");
        gate.guidance = "Cite sources.".to_string();
        let ctx = ValidationContext::for_content("body text");
        let prompt = render_self_check_prompt(&gate, Some("{{ gate_name }}|{{ guidance }}|{{ content }}"), &ctx)
            .expect("render");
        assert_eq!(prompt, "Docs|Cite sources.|body text");

        let default = render_self_check_prompt(&gate, None, &ctx).expect("render");
        assert!(default.contains("GATE_REVIEW: PASS"));
        assert!(default.contains("body text"));
    }
}
