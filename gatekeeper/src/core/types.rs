//! Shared deterministic types for gate definitions and validation results.
//!
//! These types define stable contracts between the validator, the temporary
//! gate registry, and the enforcement authority. They do not perform I/O.

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Whether a gate can fail (`validation`) or only advises (`guidance`).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GateType {
    #[default]
    Validation,
    Guidance,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Critical,
    High,
    #[default]
    Medium,
    Low,
}

impl Severity {
    /// Enforcement mode applied when a gate does not set one explicitly.
    pub fn default_enforcement(self) -> EnforcementMode {
        match self {
            Severity::Critical => EnforcementMode::Blocking,
            Severity::High | Severity::Medium => EnforcementMode::Advisory,
            Severity::Low => EnforcementMode::Informational,
        }
    }
}

/// How a failing gate affects continuation of the chain.
///
/// Ordered from least to most strict so the strictest mode across a set of
/// gates is simply the maximum.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EnforcementMode {
    Informational,
    Advisory,
    Blocking,
}

/// Named verification presets (`:fast`, `:full`, `:extended`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VerifyPreset {
    Fast,
    Full,
    Extended,
}

impl VerifyPreset {
    pub fn max_iterations(self) -> u32 {
        match self {
            VerifyPreset::Fast => 1,
            VerifyPreset::Full => 5,
            VerifyPreset::Extended => 10,
        }
    }

    pub fn timeout_ms(self) -> u64 {
        match self {
            VerifyPreset::Fast => 30_000,
            VerifyPreset::Full => 300_000,
            VerifyPreset::Extended => 600_000,
        }
    }
}

/// A single pass criterion attached to a gate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PassCriterion {
    /// Ground-truth verification: run a command and require exit code 0.
    ShellVerify {
        command: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timeout_ms: Option<u64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        working_dir: Option<PathBuf>,
        #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
        env: BTreeMap<String, String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        preset: Option<VerifyPreset>,
    },
    /// Semantic self-check delegated to a pluggable evaluator.
    LlmSelfCheck {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        prompt_template: Option<String>,
    },
    /// Any criterion type this crate does not evaluate (content length, regex, ...).
    #[serde(other)]
    Unsupported,
}

impl PassCriterion {
    pub fn type_name(&self) -> &'static str {
        match self {
            PassCriterion::ShellVerify { .. } => "shell_verify",
            PassCriterion::LlmSelfCheck { .. } => "llm_self_check",
            PassCriterion::Unsupported => "unsupported",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_attempts: u32,
    /// Surface the gate's guidance as an improvement hint on failure.
    pub improvement_hints: bool,
    pub preserve_context: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            improvement_hints: true,
            preserve_context: true,
        }
    }
}

/// When a gate applies. Empty lists mean "any".
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Activation {
    pub prompt_categories: Vec<String>,
    pub framework_context: Vec<String>,
    /// Only apply when the caller explicitly requested this gate.
    pub explicit_request: bool,
}

impl Activation {
    pub fn applies(
        &self,
        category: Option<&str>,
        framework: Option<&str>,
        explicitly_requested: bool,
    ) -> bool {
        if self.explicit_request && !explicitly_requested {
            return false;
        }
        if !self.prompt_categories.is_empty()
            && !category.is_some_and(|c| self.prompt_categories.iter().any(|p| p == c))
        {
            return false;
        }
        if !self.framework_context.is_empty()
            && !framework.is_some_and(|f| {
                self.framework_context
                    .iter()
                    .any(|p| p.eq_ignore_ascii_case(f))
            })
        {
            return false;
        }
        true
    }
}

/// Gate definition document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GateDefinition {
    pub id: String,
    pub name: String,
    #[serde(rename = "type", default)]
    pub gate_type: GateType,
    #[serde(default)]
    pub severity: Severity,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enforcement_mode: Option<EnforcementMode>,
    #[serde(default)]
    pub guidance: String,
    #[serde(default)]
    pub pass_criteria: Vec<PassCriterion>,
    #[serde(default)]
    pub retry_config: RetryConfig,
    #[serde(default)]
    pub activation: Activation,
}

impl GateDefinition {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            gate_type: GateType::Validation,
            severity: Severity::Medium,
            enforcement_mode: None,
            guidance: String::new(),
            pass_criteria: Vec::new(),
            retry_config: RetryConfig::default(),
            activation: Activation::default(),
        }
    }

    pub fn enforcement(&self) -> EnforcementMode {
        self.enforcement_mode
            .unwrap_or_else(|| self.severity.default_enforcement())
    }
}

/// Outcome of a single criterion evaluation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationCheck {
    #[serde(rename = "type")]
    pub check_type: String,
    pub passed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub score: Option<f64>,
    pub message: String,
    #[serde(default)]
    pub details: Map<String, Value>,
}

impl ValidationCheck {
    pub fn pass(check_type: &str, message: impl Into<String>) -> Self {
        Self {
            check_type: check_type.to_string(),
            passed: true,
            score: None,
            message: message.into(),
            details: Map::new(),
        }
    }

    pub fn fail(check_type: &str, message: impl Into<String>) -> Self {
        Self {
            passed: false,
            ..Self::pass(check_type, message)
        }
    }

    pub fn with_detail(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.details.insert(key.to_string(), value.into());
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationMetadata {
    pub duration_ms: u64,
    pub checks_run: usize,
    pub validated_at_ms: u64,
}

/// Result of validating one gate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationResult {
    pub gate_id: String,
    pub passed: bool,
    pub checks: Vec<ValidationCheck>,
    pub retry_hints: Vec<String>,
    pub metadata: ValidationMetadata,
}

impl ValidationResult {
    /// Build a result whose `passed` is derived from `checks` (vacuously true).
    pub fn from_checks(gate_id: impl Into<String>, checks: Vec<ValidationCheck>) -> Self {
        let passed = checks.iter().all(|check| check.passed);
        let checks_run = checks.len();
        Self {
            gate_id: gate_id.into(),
            passed,
            checks,
            retry_hints: Vec::new(),
            metadata: ValidationMetadata {
                checks_run,
                ..ValidationMetadata::default()
            },
        }
    }

    pub fn failed_checks(&self) -> impl Iterator<Item = &ValidationCheck> {
        self.checks.iter().filter(|check| !check.passed)
    }
}

/// Request-time context used for activation and self-check rendering.
#[derive(Debug, Clone, Default)]
pub struct ValidationContext {
    /// Step output under evaluation.
    pub content: String,
    pub category: Option<String>,
    pub framework: Option<String>,
    pub session_id: Option<String>,
    pub explicitly_requested: bool,
}

impl ValidationContext {
    pub fn for_content(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            ..Self::default()
        }
    }
}
