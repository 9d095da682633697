//! Injection configuration, request context, and decision types.

use std::collections::{BTreeMap, HashMap};
use std::fmt;

use anyhow::{Result, bail};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum InjectionType {
    SystemPrompt,
    GateGuidance,
    StyleGuidance,
}

impl InjectionType {
    pub const ALL: [InjectionType; 3] = [
        InjectionType::SystemPrompt,
        InjectionType::GateGuidance,
        InjectionType::StyleGuidance,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            InjectionType::SystemPrompt => "system-prompt",
            InjectionType::GateGuidance => "gate-guidance",
            InjectionType::StyleGuidance => "style-guidance",
        }
    }
}

impl fmt::Display for InjectionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FrequencyMode {
    Every,
    FirstOnly,
    Never,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Frequency {
    pub mode: FrequencyMode,
    /// For `every`: minimum steps between injections.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interval: Option<u32>,
}

/// Where injected content goes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InjectionTarget {
    Steps,
    Gates,
    #[default]
    Both,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConditionAction {
    Inject,
    Skip,
    Inherit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Comparison {
    Eq,
    Gt,
    Lt,
    Gte,
    Lte,
}

impl Comparison {
    pub fn holds(self, left: u32, right: u32) -> bool {
        match self {
            Comparison::Eq => left == right,
            Comparison::Gt => left > right,
            Comparison::Lt => left < right,
            Comparison::Gte => left >= right,
            Comparison::Lte => left <= right,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChainPosition {
    First,
    Middle,
    Last,
}

impl ChainPosition {
    /// `first` wins for a single-step chain; unknown totals are never `last`.
    pub fn of(current_step: u32, total_steps: Option<u32>) -> Self {
        if current_step <= 1 {
            ChainPosition::First
        } else if total_steps.is_some_and(|total| current_step >= total) {
            ChainPosition::Last
        } else {
            ChainPosition::Middle
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ConditionPredicate {
    GateStatus { gate_id: String, status: String },
    StepType { value: String },
    StepNumber { op: Comparison, value: u32 },
    PreviousStepResult { value: String },
    ChainPosition { position: ChainPosition },
    Always,
}

/// One `when -> then` rule. Conditions are evaluated in order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Condition {
    pub when: ConditionPredicate,
    pub then: ConditionAction,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// A level's settings for one injection type. Unset fields inherit.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PartialRule {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub enabled: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub frequency: Option<Frequency>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target: Option<InjectionTarget>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
}

impl PartialRule {
    pub fn enabled(enabled: bool) -> Self {
        Self {
            enabled: Some(enabled),
            ..Self::default()
        }
    }
}

/// Per-type rules at one configuration level.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct TypeRules {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<PartialRule>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gate_guidance: Option<PartialRule>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub style_guidance: Option<PartialRule>,
}

impl TypeRules {
    pub fn get(&self, injection_type: InjectionType) -> Option<&PartialRule> {
        match injection_type {
            InjectionType::SystemPrompt => self.system_prompt.as_ref(),
            InjectionType::GateGuidance => self.gate_guidance.as_ref(),
            InjectionType::StyleGuidance => self.style_guidance.as_ref(),
        }
    }

    pub fn set(&mut self, injection_type: InjectionType, rule: PartialRule) {
        let slot = match injection_type {
            InjectionType::SystemPrompt => &mut self.system_prompt,
            InjectionType::GateGuidance => &mut self.gate_guidance,
            InjectionType::StyleGuidance => &mut self.style_guidance,
        };
        *slot = Some(rule);
    }

    pub fn with(mut self, injection_type: InjectionType, rule: PartialRule) -> Self {
        self.set(injection_type, rule);
        self
    }

    fn rules(&self) -> impl Iterator<Item = &PartialRule> {
        [&self.system_prompt, &self.gate_guidance, &self.style_guidance]
            .into_iter()
            .flatten()
    }
}

/// System default level: enabled flag per type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct InjectionDefaults {
    pub system_prompt: bool,
    pub gate_guidance: bool,
    pub style_guidance: bool,
}

impl Default for InjectionDefaults {
    fn default() -> Self {
        Self {
            system_prompt: true,
            gate_guidance: true,
            style_guidance: false,
        }
    }
}

impl InjectionDefaults {
    pub fn enabled(&self, injection_type: InjectionType) -> bool {
        match injection_type {
            InjectionType::SystemPrompt => self.system_prompt,
            InjectionType::GateGuidance => self.gate_guidance,
            InjectionType::StyleGuidance => self.style_guidance,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct InjectionConfig {
    pub defaults: InjectionDefaults,
    pub global: TypeRules,
    /// Keyed by category id.
    pub categories: BTreeMap<String, TypeRules>,
    /// Keyed by glob pattern over chain ids.
    pub chains: BTreeMap<String, TypeRules>,
    /// Keyed by step number or `first|last|odd|even`.
    pub steps: BTreeMap<String, TypeRules>,
}

impl InjectionConfig {
    pub fn validate(&self) -> Result<()> {
        if self.chains.keys().any(|pattern| pattern.trim().is_empty()) {
            bail!("injection.chains patterns must not be empty");
        }
        let levels = std::iter::once(&self.global)
            .chain(self.categories.values())
            .chain(self.chains.values())
            .chain(self.steps.values());
        for rules in levels {
            for rule in rules.rules() {
                if let Some(Frequency {
                    interval: Some(0), ..
                }) = rule.frequency
                {
                    bail!("injection frequency interval must be > 0");
                }
            }
        }
        Ok(())
    }

    /// Step keys that are neither a positive number nor a position keyword.
    pub fn unparseable_step_keys(&self) -> Vec<&str> {
        self.steps
            .keys()
            .filter(|key| StepKey::parse(key).is_none())
            .map(String::as_str)
            .collect()
    }
}

/// Parsed step-level key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepKey {
    Number(u32),
    First,
    Last,
    Odd,
    Even,
}

impl StepKey {
    pub fn parse(key: &str) -> Option<Self> {
        match key.trim().to_ascii_lowercase().as_str() {
            "first" => Some(StepKey::First),
            "last" => Some(StepKey::Last),
            "odd" => Some(StepKey::Odd),
            "even" => Some(StepKey::Even),
            other => other.parse::<u32>().ok().filter(|n| *n > 0).map(StepKey::Number),
        }
    }

    pub fn matches(self, current_step: u32, total_steps: Option<u32>) -> bool {
        match self {
            StepKey::Number(n) => n == current_step,
            StepKey::First => current_step == 1,
            StepKey::Last => total_steps == Some(current_step),
            StepKey::Odd => current_step % 2 == 1,
            StepKey::Even => current_step % 2 == 0,
        }
    }

    /// Lower ranks are more specific.
    pub fn specificity(self) -> u8 {
        match self {
            StepKey::Number(_) => 0,
            StepKey::First | StepKey::Last => 1,
            StepKey::Odd | StepKey::Even => 2,
        }
    }
}

/// Per-request modifiers that outrank all configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InjectionModifier {
    /// Skip every injection type.
    Clean,
    /// Skip system prompt and style guidance; keep gate guidance.
    Lean,
    /// Force every injection type.
    Guided,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DecisionSource {
    Modifier,
    RuntimeOverride,
    StepConfig,
    ChainConfig,
    CategoryConfig,
    GlobalConfig,
    SystemDefault,
}

impl DecisionSource {
    pub fn as_str(self) -> &'static str {
        match self {
            DecisionSource::Modifier => "modifier",
            DecisionSource::RuntimeOverride => "runtime-override",
            DecisionSource::StepConfig => "step-config",
            DecisionSource::ChainConfig => "chain-config",
            DecisionSource::CategoryConfig => "category-config",
            DecisionSource::GlobalConfig => "global-config",
            DecisionSource::SystemDefault => "system-default",
        }
    }
}

impl fmt::Display for DecisionSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Execution context for one injection decision.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct InjectionContext {
    pub session_id: String,
    /// 1-based.
    pub current_step: u32,
    pub total_steps: Option<u32>,
    pub previous_step_result: Option<String>,
    pub step_type: Option<String>,
    pub category_id: Option<String>,
    pub chain_id: Option<String>,
    pub gate_statuses: HashMap<String, String>,
    pub modifiers: Vec<InjectionModifier>,
}

impl InjectionContext {
    pub fn new(session_id: impl Into<String>, current_step: u32) -> Self {
        Self {
            session_id: session_id.into(),
            current_step,
            ..Self::default()
        }
    }

    pub fn chain_position(&self) -> ChainPosition {
        ChainPosition::of(self.current_step, self.total_steps)
    }

    /// Id a step-scoped override must carry to apply here: `<session>:<step>`.
    pub fn step_scope_id(&self) -> String {
        format!("{}:{}", self.session_id, self.current_step)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InjectionDecision {
    pub injection_type: InjectionType,
    pub inject: bool,
    pub reason: String,
    pub source: DecisionSource,
    pub decided_at_ms: u64,
    pub target: InjectionTarget,
}
