//! Gate evaluation against step output.
//!
//! Only ground-truth command execution and pluggable semantic judgment produce
//! real signals. Every other criterion type passes with an explanation.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use crate::core::clock::Clock;
use crate::core::types::{
    GateDefinition, GateType, PassCriterion, ValidationCheck, ValidationContext, ValidationMetadata,
    ValidationResult,
};
use crate::gates::provider::GateProvider;
use crate::gates::self_check::{SemanticEvaluationConfig, SemanticEvaluator, run_self_check};
use crate::io::process::tail_chars;
use crate::io::shell_verify::{CommandVerifier, ShellVerifyConfig};

pub const DEFAULT_STATS_WINDOW: usize = 100;
const SHELL_CHECK: &str = "shell_verify";
const SYSTEM_ERROR_CHECK: &str = "system_error";
/// Characters of command output carried into a retry hint.
const HINT_OUTPUT_CHARS: usize = 500;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ValidationStatistics {
    pub total_validations: u64,
    pub successful_validations: u64,
    pub failed_validations: u64,
    /// Mean over the most recent validations (see `stats_window`).
    pub average_validation_ms: f64,
    pub retry_requests: u64,
}

#[derive(Debug, Default)]
struct StatsState {
    stats: ValidationStatistics,
    latencies: VecDeque<u64>,
}

pub struct GateValidator {
    provider: Arc<dyn GateProvider>,
    verifier: Arc<dyn CommandVerifier>,
    evaluator: Option<Arc<dyn SemanticEvaluator>>,
    semantic: SemanticEvaluationConfig,
    clock: Arc<dyn Clock>,
    stats_window: usize,
    stats: Mutex<StatsState>,
}

impl GateValidator {
    pub fn new(
        provider: Arc<dyn GateProvider>,
        verifier: Arc<dyn CommandVerifier>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            provider,
            verifier,
            evaluator: None,
            semantic: SemanticEvaluationConfig::default(),
            clock,
            stats_window: DEFAULT_STATS_WINDOW,
            stats: Mutex::new(StatsState::default()),
        }
    }

    pub fn with_semantic(
        mut self,
        config: SemanticEvaluationConfig,
        evaluator: Option<Arc<dyn SemanticEvaluator>>,
    ) -> Self {
        self.semantic = config;
        self.evaluator = evaluator;
        self
    }

    pub fn with_stats_window(mut self, window: usize) -> Self {
        self.stats_window = window.max(1);
        self
    }

    /// Load and validate one gate. Missing or malformed gates are skipped.
    #[instrument(skip(self, ctx))]
    pub fn validate_gate(&self, gate_id: &str, ctx: &ValidationContext) -> Option<ValidationResult> {
        let gate = match self.provider.load_gate(gate_id) {
            Ok(Some(gate)) => gate,
            Ok(None) => {
                warn!(gate_id, "gate not found; skipping validation");
                return None;
            }
            Err(err) => {
                warn!(gate_id, err = %format!("{err:#}"), "gate could not be loaded; skipping validation");
                return None;
            }
        };
        Some(self.validate_definition(&gate, ctx, self.provider.is_ephemeral()))
    }

    /// Validate a gate definition directly.
    ///
    /// `ephemeral` marks inline gates whose criteria are already surfaced to the
    /// author; their guidance text is not repeated in retry hints.
    pub fn validate_definition(
        &self,
        gate: &GateDefinition,
        ctx: &ValidationContext,
        ephemeral: bool,
    ) -> ValidationResult {
        let started = Instant::now();

        let mut result = if gate.gate_type == GateType::Guidance {
            debug!(gate_id = %gate.id, "guidance gate passes without evaluation");
            ValidationResult::from_checks(
                &gate.id,
                vec![ValidationCheck::pass("guidance", "Guidance gates never block")],
            )
        } else if !gate.activation.applies(
            ctx.category.as_deref(),
            ctx.framework.as_deref(),
            ctx.explicitly_requested,
        ) {
            debug!(gate_id = %gate.id, "gate not active for this context");
            ValidationResult::from_checks(&gate.id, Vec::new())
        } else {
            let checks = gate
                .pass_criteria
                .iter()
                .map(|criterion| {
                    self.run_criterion(gate, criterion, ctx).unwrap_or_else(|err| {
                        warn!(gate_id = %gate.id, criterion = criterion.type_name(), err = %format!("{err:#}"), "check failed internally");
                        ValidationCheck::fail(SYSTEM_ERROR_CHECK, format!("Internal error: {err:#}"))
                            .with_detail("criterion", criterion.type_name())
                    })
                })
                .collect();
            ValidationResult::from_checks(&gate.id, checks)
        };

        if !result.passed {
            result.retry_hints = retry_hints(gate, &result, ephemeral);
        }
        let duration_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
        result.metadata = ValidationMetadata {
            duration_ms,
            checks_run: result.checks.len(),
            validated_at_ms: self.clock.now_ms(),
        };
        self.record(result.passed, duration_ms);

        info!(gate_id = %gate.id, passed = result.passed, checks = result.checks.len(), duration_ms, "gate validated");
        result
    }

    /// Validate several gates, skipping any that cannot be loaded.
    pub fn validate_gates(&self, gate_ids: &[String], ctx: &ValidationContext) -> Vec<ValidationResult> {
        gate_ids
            .iter()
            .filter_map(|id| self.validate_gate(id, ctx))
            .collect()
    }

    /// True iff attempts remain and at least one result failed.
    pub fn should_retry(&self, results: &[ValidationResult], current_attempt: u32, max_attempts: u32) -> bool {
        let retry = current_attempt < max_attempts && results.iter().any(|r| !r.passed);
        if retry {
            self.lock_stats().stats.retry_requests += 1;
        }
        retry
    }

    pub fn statistics(&self) -> ValidationStatistics {
        self.lock_stats().stats.clone()
    }

    pub fn reset_statistics(&self) {
        *self.lock_stats() = StatsState::default();
    }

    fn run_criterion(
        &self,
        gate: &GateDefinition,
        criterion: &PassCriterion,
        ctx: &ValidationContext,
    ) -> Result<ValidationCheck> {
        match criterion {
            PassCriterion::ShellVerify { .. } => {
                let config = ShellVerifyConfig::from_criterion(criterion)
                    .ok_or_else(|| anyhow::anyhow!("shell_verify criterion without command"))?;
                Ok(self.shell_check(&config))
            }
            PassCriterion::LlmSelfCheck { prompt_template } => run_self_check(
                self.evaluator.as_deref(),
                &self.semantic,
                gate,
                prompt_template.as_deref(),
                ctx,
            ),
            PassCriterion::Unsupported => Ok(ValidationCheck::pass(
                "unsupported",
                "Criterion type is not evaluated; only command verification and semantic checks produce signals",
            )),
        }
    }

    fn shell_check(&self, config: &ShellVerifyConfig) -> ValidationCheck {
        let outcome = self.verifier.verify(config);
        let message = if outcome.passed {
            format!("Command passed: {}", config.command)
        } else if outcome.timed_out {
            format!("Command timed out: {}", config.command)
        } else {
            match outcome.exit_code {
                Some(code) => format!("Command failed with exit code {code}: {}", config.command),
                None => format!("Command could not run: {}", config.command),
            }
        };
        let check = if outcome.passed {
            ValidationCheck::pass(SHELL_CHECK, message)
        } else {
            ValidationCheck::fail(SHELL_CHECK, message)
        };
        check
            .with_detail("command", config.command.clone())
            .with_detail("exit_code", outcome.exit_code)
            .with_detail("timed_out", outcome.timed_out)
            .with_detail("duration_ms", outcome.duration_ms)
            .with_detail("stdout", outcome.stdout.clone())
            .with_detail("stderr", outcome.stderr.clone())
    }

    fn record(&self, passed: bool, duration_ms: u64) {
        let window = self.stats_window;
        let mut state = self.lock_stats();
        state.stats.total_validations += 1;
        if passed {
            state.stats.successful_validations += 1;
        } else {
            state.stats.failed_validations += 1;
        }
        state.latencies.push_back(duration_ms);
        while state.latencies.len() > window {
            state.latencies.pop_front();
        }
        let sum: u64 = state.latencies.iter().sum();
        state.stats.average_validation_ms = sum as f64 / state.latencies.len() as f64;
    }

    fn lock_stats(&self) -> MutexGuard<'_, StatsState> {
        self.stats.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn retry_hints(gate: &GateDefinition, result: &ValidationResult, ephemeral: bool) -> Vec<String> {
    let mut hints = Vec::new();
    if !ephemeral && gate.retry_config.improvement_hints && !gate.guidance.trim().is_empty() {
        hints.push(gate.guidance.trim().to_string());
    }
    for check in result.failed_checks() {
        let output = ["stderr", "stdout"]
            .iter()
            .filter_map(|key| check.details.get(*key).and_then(|v| v.as_str()))
            .find(|text| !text.trim().is_empty());
        match output {
            Some(text) => hints.push(format!(
                "{}: {}\n{}",
                check.check_type,
                check.message,
                tail_chars(text.trim(), HINT_OUTPUT_CHARS)
            )),
            None => hints.push(format!("{}: {}", check.check_type, check.message)),
        }
    }
    hints
}
