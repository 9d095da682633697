//! Single entry point for "should content X be injected into this step".
//!
//! Priority, highest first:
//!
//! 1. per-request modifiers (`clean`, `lean`, `guided`)
//! 2. runtime overrides (step > chain > session)
//! 3. step, chain, category, and global configuration
//! 4. the hardcoded system default
//!
//! Frequency filtering applies only to configuration-derived decisions.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, RwLock};

use tracing::{debug, instrument};

use crate::core::clock::Clock;
use crate::injection::conditions::ConditionEvaluator;
use crate::injection::hierarchy::{HierarchyResolver, ResolvedRule};
use crate::injection::overrides::SessionOverrideManager;
use crate::injection::types::{
    ConditionAction, DecisionSource, FrequencyMode, InjectionConfig, InjectionContext,
    InjectionDecision, InjectionModifier, InjectionTarget, InjectionType,
};

type CacheKey = (String, InjectionType, u32);

#[derive(Debug, Clone)]
struct CachedDecision {
    decision: InjectionDecision,
    config_generation: u64,
    override_generation: u64,
}

#[derive(Debug, Default, Clone, Copy)]
struct FrequencyTrack {
    last_injected_step: Option<u32>,
    injections: u32,
}

#[derive(Debug, Default)]
struct DecisionState {
    cache: HashMap<CacheKey, CachedDecision>,
    tracker: HashMap<(String, InjectionType), FrequencyTrack>,
    config_generation: u64,
}

pub struct InjectionDecisionService {
    clock: Arc<dyn Clock>,
    resolver: RwLock<HierarchyResolver>,
    evaluator: ConditionEvaluator,
    overrides: Arc<SessionOverrideManager>,
    state: Mutex<DecisionState>,
}

impl InjectionDecisionService {
    pub fn new(
        config: InjectionConfig,
        overrides: Arc<SessionOverrideManager>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            clock,
            resolver: RwLock::new(HierarchyResolver::new(config)),
            evaluator: ConditionEvaluator::new(),
            overrides,
            state: Mutex::new(DecisionState::default()),
        }
    }

    pub fn overrides(&self) -> &Arc<SessionOverrideManager> {
        &self.overrides
    }

    #[instrument(skip(self, ctx), fields(session_id = %ctx.session_id, step = ctx.current_step))]
    pub fn decide(&self, injection_type: InjectionType, ctx: &InjectionContext) -> InjectionDecision {
        let now = self.clock.now_ms();
        let resolved = self.read_resolver().resolve(injection_type, ctx);

        if let Some(decision) = modifier_decision(injection_type, ctx, resolved.target(), now) {
            debug!(%injection_type, inject = decision.inject, "decided by modifier");
            return decision;
        }

        self.overrides.prune_expired();
        let override_generation = self.overrides.generation();
        let key = (ctx.session_id.clone(), injection_type, ctx.current_step);

        let mut state = self.lock();
        let config_generation = state.config_generation;
        if let Some(cached) = state.cache.get(&key).filter(|cached| {
            cached.config_generation == config_generation
                && cached.override_generation == override_generation
        }) {
            return cached.decision.clone();
        }

        let decision = match self.overrides.active_override(injection_type, ctx) {
            Some(active) => InjectionDecision {
                injection_type,
                inject: active.enabled.unwrap_or(false),
                reason: format!("runtime override ({:?} scope)", active.scope).to_lowercase(),
                source: DecisionSource::RuntimeOverride,
                decided_at_ms: now,
                target: active.target.unwrap_or_else(|| resolved.target()),
            },
            None => {
                let base = self.config_decision(&resolved, ctx, now);
                let track = state
                    .tracker
                    .get(&(ctx.session_id.clone(), injection_type))
                    .copied()
                    .unwrap_or_default();
                let decision = apply_frequency(base, &resolved, ctx.current_step, track);
                if decision.inject {
                    let entry = state
                        .tracker
                        .entry((ctx.session_id.clone(), injection_type))
                        .or_default();
                    entry.last_injected_step = Some(ctx.current_step);
                    entry.injections += 1;
                }
                decision
            }
        };

        debug!(%injection_type, inject = decision.inject, source = %decision.source, reason = %decision.reason, "injection decided");
        state.cache.insert(
            key,
            CachedDecision {
                decision: decision.clone(),
                config_generation,
                override_generation,
            },
        );
        decision
    }

    /// Decide every injection type for one step.
    pub fn decide_all(&self, ctx: &InjectionContext) -> Vec<InjectionDecision> {
        InjectionType::ALL
            .iter()
            .map(|injection_type| self.decide(*injection_type, ctx))
            .collect()
    }

    /// Swap configuration and drop every cached decision.
    pub fn reload_config(&self, config: InjectionConfig) {
        *self
            .resolver
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = HierarchyResolver::new(config);
        let mut state = self.lock();
        state.cache.clear();
        state.config_generation += 1;
        debug!(generation = state.config_generation, "injection config reloaded");
    }

    /// Forget cached decisions and frequency history for one session.
    pub fn reset_session(&self, session_id: &str) {
        let mut state = self.lock();
        state.cache.retain(|(session, _, _), _| session != session_id);
        state.tracker.retain(|(session, _), _| session != session_id);
    }

    pub fn config(&self) -> InjectionConfig {
        self.read_resolver().config().clone()
    }

    fn config_decision(&self, resolved: &ResolvedRule, ctx: &InjectionContext, now: u64) -> InjectionDecision {
        let target = resolved.target();
        let make = |inject: bool, source: DecisionSource, reason: String| InjectionDecision {
            injection_type: resolved.injection_type,
            inject,
            reason,
            source,
            decided_at_ms: now,
            target,
        };

        // Levels are walked highest first. A matching condition decides before the
        // level's own flag; `inherit` hands the decision to the next level down.
        let mut inherited: Option<String> = None;
        for level in &resolved.levels {
            let source = level.level.source();
            if let Some(matched) = self.evaluator.evaluate(&level.rule.conditions, ctx) {
                match matched.action {
                    ConditionAction::Inject => {
                        return make(true, source, format!("condition matched: {}", matched.reason));
                    }
                    ConditionAction::Skip => {
                        return make(false, source, format!("condition matched: {}", matched.reason));
                    }
                    ConditionAction::Inherit => {
                        inherited.get_or_insert(matched.reason);
                        continue;
                    }
                }
            }
            if let Some(enabled) = level.rule.enabled {
                let reason = config_reason(resolved.injection_type, enabled, source, inherited.as_deref());
                return make(enabled, source, reason);
            }
        }

        let inject = resolved.default_enabled;
        let source = DecisionSource::SystemDefault;
        make(
            inject,
            source,
            config_reason(resolved.injection_type, inject, source, inherited.as_deref()),
        )
    }

    fn read_resolver(&self) -> std::sync::RwLockReadGuard<'_, HierarchyResolver> {
        self.resolver.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn lock(&self) -> MutexGuard<'_, DecisionState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn modifier_decision(
    injection_type: InjectionType,
    ctx: &InjectionContext,
    target: InjectionTarget,
    now: u64,
) -> Option<InjectionDecision> {
    let has = |modifier| ctx.modifiers.contains(&modifier);
    let (inject, reason) = if has(InjectionModifier::Clean) {
        (false, "clean modifier skips all injections")
    } else if has(InjectionModifier::Lean)
        && matches!(injection_type, InjectionType::SystemPrompt | InjectionType::StyleGuidance)
    {
        (false, "lean modifier skips system prompt and style guidance")
    } else if has(InjectionModifier::Guided) {
        (true, "guided modifier forces injection")
    } else {
        return None;
    };
    Some(InjectionDecision {
        injection_type,
        inject,
        reason: reason.to_string(),
        source: DecisionSource::Modifier,
        decided_at_ms: now,
        target,
    })
}

fn config_reason(
    injection_type: InjectionType,
    inject: bool,
    source: DecisionSource,
    inherited: Option<&str>,
) -> String {
    match (inherited, source) {
        (Some(reason), _) => format!("condition matched: {reason} (inherited from {source})"),
        (None, DecisionSource::SystemDefault) => format!("system default for {injection_type}"),
        (None, other) => format!("{} {}", other, if inject { "enables" } else { "disables" }),
    }
}

fn apply_frequency(
    mut decision: InjectionDecision,
    resolved: &ResolvedRule,
    current_step: u32,
    track: FrequencyTrack,
) -> InjectionDecision {
    let Some(frequency) = resolved.frequency() else {
        return decision;
    };
    if !decision.inject {
        return decision;
    }
    match frequency.mode {
        FrequencyMode::Every => {
            let interval = frequency.interval.unwrap_or(1);
            if let Some(last) = track
                .last_injected_step
                .filter(|last| current_step.saturating_sub(*last) < interval)
            {
                decision.inject = false;
                decision.reason = format!("frequency: every {interval} steps (last injected at step {last})");
            }
        }
        FrequencyMode::FirstOnly => {
            if current_step > 1 || track.injections > 0 {
                decision.inject = false;
                decision.reason = "frequency: first-only".to_string();
            }
        }
        FrequencyMode::Never => {
            decision.inject = false;
            decision.reason = "frequency: never".to_string();
        }
    }
    decision
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::clock::ManualClock;
    use crate::injection::overrides::{OverrideRequest, OverrideScope};
    use crate::injection::types::{
        Condition, ConditionPredicate, Frequency, PartialRule, TypeRules,
    };

    const SP: InjectionType = InjectionType::SystemPrompt;

    fn service(config: InjectionConfig) -> InjectionDecisionService {
        let clock: Arc<dyn Clock> = Arc::new(ManualClock::new(10));
        InjectionDecisionService::new(config, Arc::new(SessionOverrideManager::new(clock.clone())), clock)
    }

    fn with_global(rule: PartialRule) -> InjectionConfig {
        let mut config = InjectionConfig::default();
        config.global.set(SP, rule);
        config
    }

    #[test]
    fn global_rule_then_step_rule_flips_source() {
        let mut config = with_global(PartialRule::enabled(true));
        let svc = service(config.clone());
        let decision = svc.decide(SP, &InjectionContext::new("s", 2));
        assert!(decision.inject);
        assert_eq!(decision.source, DecisionSource::GlobalConfig);

        config
            .steps
            .insert("2".to_string(), TypeRules::default().with(SP, PartialRule::enabled(false)));
        svc.reload_config(config);
        let decision = svc.decide(SP, &InjectionContext::new("s", 2));
        assert!(!decision.inject);
        assert_eq!(decision.source, DecisionSource::StepConfig);
    }

    #[test]
    fn no_config_uses_system_default() {
        let svc = service(InjectionConfig::default());
        let ctx = InjectionContext::new("s", 1);
        let sp = svc.decide(SP, &ctx);
        assert!(sp.inject);
        assert_eq!(sp.source, DecisionSource::SystemDefault);
        let style = svc.decide(InjectionType::StyleGuidance, &ctx);
        assert!(!style.inject);
        assert_eq!(style.decided_at_ms, 10);
    }

    #[test]
    fn first_only_injects_on_step_one_only() {
        let svc = service(with_global(PartialRule {
            enabled: Some(true),
            frequency: Some(Frequency {
                mode: FrequencyMode::FirstOnly,
                interval: None,
            }),
            ..PartialRule::default()
        }));
        let injected: Vec<bool> = (1..=3)
            .map(|step| svc.decide(SP, &InjectionContext::new("chain-session", step)).inject)
            .collect();
        assert_eq!(injected, vec![true, false, false]);

        // Cached: asking for step 1 again does not count a second injection.
        assert!(svc.decide(SP, &InjectionContext::new("chain-session", 1)).inject);

        svc.reset_session("chain-session");
        assert!(svc.decide(SP, &InjectionContext::new("chain-session", 1)).inject);
    }

    #[test]
    fn every_with_interval() {
        let svc = service(with_global(PartialRule {
            enabled: Some(true),
            frequency: Some(Frequency {
                mode: FrequencyMode::Every,
                interval: Some(2),
            }),
            ..PartialRule::default()
        }));
        let injected: Vec<bool> = (1..=5)
            .map(|step| svc.decide(SP, &InjectionContext::new("s", step)).inject)
            .collect();
        assert_eq!(injected, vec![true, false, true, false, true]);
    }

    #[test]
    fn never_overrides_enabled() {
        let svc = service(with_global(PartialRule {
            enabled: Some(true),
            frequency: Some(Frequency {
                mode: FrequencyMode::Never,
                interval: None,
            }),
            ..PartialRule::default()
        }));
        let decision = svc.decide(SP, &InjectionContext::new("s", 1));
        assert!(!decision.inject);
        assert_eq!(decision.source, DecisionSource::GlobalConfig);
    }

    #[test]
    fn modifiers_outrank_everything() {
        let svc = service(with_global(PartialRule::enabled(false)));
        let mut ctx = InjectionContext::new("s", 1);
        ctx.modifiers = vec![InjectionModifier::Guided];
        let decision = svc.decide(SP, &ctx);
        assert!(decision.inject);
        assert_eq!(decision.source, DecisionSource::Modifier);

        ctx.modifiers = vec![InjectionModifier::Lean];
        assert!(!svc.decide(SP, &ctx).inject);
        let gate = svc.decide(InjectionType::GateGuidance, &ctx);
        assert!(gate.inject);
        assert_eq!(gate.source, DecisionSource::SystemDefault);

        ctx.modifiers = vec![InjectionModifier::Guided, InjectionModifier::Clean];
        assert!(!svc.decide(InjectionType::GateGuidance, &ctx).inject);
    }

    #[test]
    fn runtime_override_beats_config_and_invalidates_cache() {
        let svc = service(with_global(PartialRule::enabled(true)));
        let ctx = InjectionContext::new("s", 1);
        assert_eq!(svc.decide(SP, &ctx).source, DecisionSource::GlobalConfig);

        svc.overrides().set_override(OverrideRequest {
            injection_type: SP,
            enabled: Some(false),
            target: Some(InjectionTarget::Gates),
            scope: OverrideScope::Session,
            scope_id: Some("s".to_string()),
            expires_in_ms: None,
        });
        let decision = svc.decide(SP, &ctx);
        assert!(!decision.inject);
        assert_eq!(decision.source, DecisionSource::RuntimeOverride);
        assert_eq!(decision.target, InjectionTarget::Gates);

        svc.overrides().clear_scope(OverrideScope::Session, "s");
        assert_eq!(svc.decide(SP, &ctx).source, DecisionSource::GlobalConfig);
    }

    #[test]
    fn conditions_on_highest_level_decide() {
        let mut config = with_global(PartialRule::enabled(true));
        config.chains.insert(
            "review-*".to_string(),
            TypeRules::default().with(
                SP,
                PartialRule {
                    conditions: vec![
                        Condition {
                            when: ConditionPredicate::PreviousStepResult {
                                value: "failed".to_string(),
                            },
                            then: ConditionAction::Inject,
                            reason: Some("retrying after failure".to_string()),
                        },
                        Condition {
                            when: ConditionPredicate::Always,
                            then: ConditionAction::Skip,
                            reason: None,
                        },
                    ],
                    ..PartialRule::default()
                },
            ),
        );
        let svc = service(config);
        let mut ctx = InjectionContext::new("s", 2);
        ctx.chain_id = Some("review-api".to_string());
        let skipped = svc.decide(SP, &ctx);
        assert!(!skipped.inject);
        assert_eq!(skipped.source, DecisionSource::ChainConfig);

        ctx.current_step = 3;
        ctx.previous_step_result = Some("failed".to_string());
        let injected = svc.decide(SP, &ctx);
        assert!(injected.inject);
        assert!(injected.reason.contains("retrying after failure"));
    }

    #[test]
    fn inherit_takes_enabled_from_lower_levels() {
        let mut config = with_global(PartialRule::enabled(false));
        config.steps.insert(
            "first".to_string(),
            TypeRules::default().with(
                SP,
                PartialRule {
                    enabled: Some(true),
                    conditions: vec![Condition {
                        when: ConditionPredicate::Always,
                        then: ConditionAction::Inherit,
                        reason: Some("defer".to_string()),
                    }],
                    ..PartialRule::default()
                },
            ),
        );
        let svc = service(config);
        let decision = svc.decide(SP, &InjectionContext::new("s", 1));
        assert!(!decision.inject);
        assert_eq!(decision.source, DecisionSource::GlobalConfig);
        assert!(decision.reason.starts_with("condition matched: defer"));
    }

    fn when(predicate: ConditionPredicate, then: ConditionAction) -> PartialRule {
        PartialRule {
            conditions: vec![Condition {
                when: predicate,
                then,
                reason: None,
            }],
            ..PartialRule::default()
        }
    }

    #[test]
    fn step_flag_beats_global_conditions() {
        let mut config = with_global(when(ConditionPredicate::Always, ConditionAction::Inject));
        config
            .steps
            .insert("1".to_string(), TypeRules::default().with(SP, PartialRule::enabled(false)));
        let svc = service(config);

        let step_one = svc.decide(SP, &InjectionContext::new("s", 1));
        assert!(!step_one.inject);
        assert_eq!(step_one.source, DecisionSource::StepConfig);
        assert_eq!(step_one.reason, "step-config disables");

        let step_two = svc.decide(SP, &InjectionContext::new("s", 2));
        assert!(step_two.inject);
        assert_eq!(step_two.source, DecisionSource::GlobalConfig);
    }

    #[test]
    fn step_flag_beats_chain_conditions() {
        let mut config = InjectionConfig::default();
        config.chains.insert(
            "deploy-*".to_string(),
            TypeRules::default().with(SP, when(ConditionPredicate::Always, ConditionAction::Skip)),
        );
        config
            .steps
            .insert("last".to_string(), TypeRules::default().with(SP, PartialRule::enabled(true)));
        let svc = service(config);

        let mut ctx = InjectionContext::new("s", 3);
        ctx.total_steps = Some(3);
        ctx.chain_id = Some("deploy-prod".to_string());
        let last = svc.decide(SP, &ctx);
        assert!(last.inject);
        assert_eq!(last.source, DecisionSource::StepConfig);

        ctx.current_step = 2;
        let middle = svc.decide(SP, &ctx);
        assert!(!middle.inject);
        assert_eq!(middle.source, DecisionSource::ChainConfig);
    }

    #[test]
    fn unmatched_conditions_fall_back_to_the_same_level_flag() {
        let mut config = with_global(PartialRule::enabled(false));
        let mut chain_rule = when(
            ConditionPredicate::PreviousStepResult {
                value: "failed".to_string(),
            },
            ConditionAction::Skip,
        );
        chain_rule.enabled = Some(true);
        config
            .chains
            .insert("build".to_string(), TypeRules::default().with(SP, chain_rule));
        let svc = service(config);

        let mut ctx = InjectionContext::new("s", 2);
        ctx.chain_id = Some("build".to_string());
        let decision = svc.decide(SP, &ctx);
        assert!(decision.inject);
        assert_eq!(decision.source, DecisionSource::ChainConfig);

        ctx.current_step = 3;
        ctx.previous_step_result = Some("failed".to_string());
        let decision = svc.decide(SP, &ctx);
        assert!(!decision.inject);
        assert_eq!(decision.source, DecisionSource::ChainConfig);
    }

    #[test]
    fn levels_without_a_flag_defer_to_lower_conditions() {
        let mut config = with_global(when(ConditionPredicate::Always, ConditionAction::Skip));
        config.steps.insert(
            "2".to_string(),
            TypeRules::default().with(
                SP,
                PartialRule {
                    target: Some(InjectionTarget::Gates),
                    ..PartialRule::default()
                },
            ),
        );
        let svc = service(config);
        let decision = svc.decide(SP, &InjectionContext::new("s", 2));
        assert!(!decision.inject);
        assert_eq!(decision.source, DecisionSource::GlobalConfig);
        assert_eq!(decision.target, InjectionTarget::Gates);
    }

    #[test]
    fn inherit_hands_off_to_lower_level_conditions() {
        let mut config = with_global(PartialRule::enabled(false));
        config.steps.insert(
            "1".to_string(),
            TypeRules::default().with(SP, when(ConditionPredicate::Always, ConditionAction::Inherit)),
        );
        config.chains.insert(
            "docs".to_string(),
            TypeRules::default().with(SP, when(ConditionPredicate::Always, ConditionAction::Inject)),
        );
        let svc = service(config);
        let mut ctx = InjectionContext::new("s", 1);
        ctx.chain_id = Some("docs".to_string());
        let decision = svc.decide(SP, &ctx);
        assert!(decision.inject);
        assert_eq!(decision.source, DecisionSource::ChainConfig);
    }

    #[test]
    fn identical_inputs_give_identical_attribution() {
        let svc_a = service(with_global(PartialRule::enabled(true)));
        let svc_b = service(with_global(PartialRule::enabled(true)));
        let ctx = InjectionContext::new("s", 4);
        assert_eq!(svc_a.decide(SP, &ctx), svc_b.decide(SP, &ctx));
        assert_eq!(svc_a.decide_all(&ctx).len(), 3);
    }
}
