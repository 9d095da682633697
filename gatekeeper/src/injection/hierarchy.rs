//! Five-level configuration lookup: step, chain, category, global, default.

use serde::{Deserialize, Serialize};
use tracing::debug;
use wildmatch::WildMatch;

use crate::injection::types::{
    DecisionSource, Frequency, InjectionConfig, InjectionContext, InjectionTarget, InjectionType,
    PartialRule, StepKey,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConfigLevel {
    Step,
    Chain,
    Category,
    Global,
}

impl ConfigLevel {
    pub fn source(self) -> DecisionSource {
        match self {
            ConfigLevel::Step => DecisionSource::StepConfig,
            ConfigLevel::Chain => DecisionSource::ChainConfig,
            ConfigLevel::Category => DecisionSource::CategoryConfig,
            ConfigLevel::Global => DecisionSource::GlobalConfig,
        }
    }
}

/// A configuration level that has a rule for the requested type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatchedLevel {
    pub level: ConfigLevel,
    /// Step key, chain pattern, or category id that matched.
    pub key: String,
    pub rule: PartialRule,
}

/// Matched levels, highest priority first.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolvedRule {
    pub injection_type: InjectionType,
    pub levels: Vec<MatchedLevel>,
    pub default_enabled: bool,
}

impl ResolvedRule {
    /// Enabled flag from the first level at or after `start` that sets one.
    pub fn enabled_from(&self, start: usize) -> (bool, DecisionSource) {
        self.levels
            .iter()
            .skip(start)
            .find_map(|m| m.rule.enabled.map(|enabled| (enabled, m.level.source())))
            .unwrap_or((self.default_enabled, DecisionSource::SystemDefault))
    }

    pub fn enabled(&self) -> (bool, DecisionSource) {
        self.enabled_from(0)
    }

    pub fn frequency(&self) -> Option<Frequency> {
        self.levels.iter().find_map(|m| m.rule.frequency)
    }

    pub fn target(&self) -> InjectionTarget {
        self.levels
            .iter()
            .find_map(|m| m.rule.target)
            .unwrap_or_default()
    }

    /// Highest-priority level that defines conditions, with its index.
    pub fn conditioned_level(&self) -> Option<(usize, &MatchedLevel)> {
        self.levels
            .iter()
            .enumerate()
            .find(|(_, m)| !m.rule.conditions.is_empty())
    }

    /// Merged view: each field from the highest level that sets it.
    pub fn merged(&self) -> PartialRule {
        PartialRule {
            enabled: Some(self.enabled().0),
            frequency: self.frequency(),
            target: Some(self.target()),
            conditions: self
                .conditioned_level()
                .map(|(_, m)| m.rule.conditions.clone())
                .unwrap_or_default(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct HierarchyResolver {
    config: InjectionConfig,
}

impl HierarchyResolver {
    pub fn new(config: InjectionConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &InjectionConfig {
        &self.config
    }

    pub fn resolve(&self, injection_type: InjectionType, ctx: &InjectionContext) -> ResolvedRule {
        let mut levels = Vec::new();
        if let Some((key, rule)) = self.step_rule(injection_type, ctx) {
            levels.push(MatchedLevel {
                level: ConfigLevel::Step,
                key,
                rule,
            });
        }
        if let Some((key, rule)) = self.chain_rule(injection_type, ctx) {
            levels.push(MatchedLevel {
                level: ConfigLevel::Chain,
                key,
                rule,
            });
        }
        if let Some((category, rule)) = ctx.category_id.as_deref().and_then(|category| {
            self.config
                .categories
                .get(category)
                .and_then(|rules| rules.get(injection_type))
                .map(|rule| (category, rule))
        }) {
            levels.push(MatchedLevel {
                level: ConfigLevel::Category,
                key: category.to_string(),
                rule: rule.clone(),
            });
        }
        if let Some(rule) = self.config.global.get(injection_type) {
            levels.push(MatchedLevel {
                level: ConfigLevel::Global,
                key: "global".to_string(),
                rule: rule.clone(),
            });
        }

        debug!(
            %injection_type,
            levels = ?levels.iter().map(|m| m.level).collect::<Vec<_>>(),
            "resolved injection hierarchy"
        );
        ResolvedRule {
            injection_type,
            levels,
            default_enabled: self.config.defaults.enabled(injection_type),
        }
    }

    /// Exact step number beats `first`/`last`, which beat `odd`/`even`.
    fn step_rule(&self, injection_type: InjectionType, ctx: &InjectionContext) -> Option<(String, PartialRule)> {
        self.config
            .steps
            .iter()
            .filter_map(|(key, rules)| {
                let parsed = StepKey::parse(key)?;
                let rule = rules.get(injection_type)?;
                parsed
                    .matches(ctx.current_step, ctx.total_steps)
                    .then_some((parsed, key, rule))
            })
            .min_by_key(|(parsed, _, _)| (parsed.specificity(), *parsed != StepKey::First))
            .map(|(_, key, rule)| (key.clone(), rule.clone()))
    }

    /// Exact chain id beats patterns; among patterns the longest wins.
    fn chain_rule(&self, injection_type: InjectionType, ctx: &InjectionContext) -> Option<(String, PartialRule)> {
        let chain_id = ctx.chain_id.as_deref()?;
        if let Some(rule) = self
            .config
            .chains
            .get(chain_id)
            .and_then(|rules| rules.get(injection_type))
        {
            return Some((chain_id.to_string(), rule.clone()));
        }
        self.config
            .chains
            .iter()
            .filter(|(pattern, _)| WildMatch::new(pattern).matches(chain_id))
            .filter_map(|(pattern, rules)| rules.get(injection_type).map(|rule| (pattern, rule)))
            // BTreeMap order makes ties deterministic: the lexicographically first pattern wins.
            .fold(None::<(&String, &PartialRule)>, |best, candidate| match best {
                Some(current) if current.0.len() >= candidate.0.len() => Some(current),
                _ => Some(candidate),
            })
            .map(|(pattern, rule)| (pattern.clone(), rule.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::injection::types::{FrequencyMode, TypeRules};

    const SP: InjectionType = InjectionType::SystemPrompt;

    fn rules(rule: PartialRule) -> TypeRules {
        TypeRules::default().with(SP, rule)
    }

    #[test]
    fn falls_back_to_system_default() {
        let resolver = HierarchyResolver::default();
        let resolved = resolver.resolve(SP, &InjectionContext::new("s", 1));
        assert!(resolved.levels.is_empty());
        assert_eq!(resolved.enabled(), (true, DecisionSource::SystemDefault));
        let style = resolver.resolve(InjectionType::StyleGuidance, &InjectionContext::new("s", 1));
        assert_eq!(style.enabled(), (false, DecisionSource::SystemDefault));
    }

    #[test]
    fn fields_inherit_independently() {
        let mut config = InjectionConfig::default();
        config.global.set(
            SP,
            PartialRule {
                enabled: Some(true),
                frequency: Some(Frequency {
                    mode: FrequencyMode::Every,
                    interval: Some(2),
                }),
                target: Some(InjectionTarget::Steps),
                conditions: Vec::new(),
            },
        );
        config.steps.insert(
            "2".to_string(),
            rules(PartialRule {
                target: Some(InjectionTarget::Gates),
                ..PartialRule::default()
            }),
        );
        let resolved = HierarchyResolver::new(config).resolve(SP, &InjectionContext::new("s", 2));
        assert_eq!(resolved.levels.len(), 2);
        assert_eq!(resolved.enabled(), (true, DecisionSource::GlobalConfig));
        assert_eq!(resolved.target(), InjectionTarget::Gates);
        assert_eq!(resolved.frequency().map(|f| f.interval), Some(Some(2)));
    }

    #[test]
    fn step_key_precedence() {
        let mut config = InjectionConfig::default();
        config.steps.insert("odd".to_string(), rules(PartialRule::enabled(false)));
        config.steps.insert("first".to_string(), rules(PartialRule::enabled(true)));
        config.steps.insert("last".to_string(), rules(PartialRule::enabled(false)));
        config.steps.insert("bogus".to_string(), rules(PartialRule::enabled(false)));
        let resolver = HierarchyResolver::new(config.clone());

        let mut ctx = InjectionContext::new("s", 1);
        ctx.total_steps = Some(1);
        assert_eq!(resolver.resolve(SP, &ctx).levels[0].key, "first");

        ctx.current_step = 3;
        ctx.total_steps = Some(5);
        assert_eq!(resolver.resolve(SP, &ctx).levels[0].key, "odd");

        config.steps.insert("3".to_string(), rules(PartialRule::enabled(true)));
        assert_eq!(HierarchyResolver::new(config).resolve(SP, &ctx).levels[0].key, "3");
    }

    #[test]
    fn chain_exact_then_longest_glob() {
        let mut config = InjectionConfig::default();
        config.chains.insert("*".to_string(), rules(PartialRule::enabled(false)));
        config.chains.insert("release-*".to_string(), rules(PartialRule::enabled(true)));
        config.chains.insert("release-2024".to_string(), rules(PartialRule::enabled(false)));
        let resolver = HierarchyResolver::new(config);

        let mut ctx = InjectionContext::new("s", 1);
        ctx.chain_id = Some("release-2025".to_string());
        assert_eq!(resolver.resolve(SP, &ctx).levels[0].key, "release-*");
        ctx.chain_id = Some("release-2024".to_string());
        assert_eq!(resolver.resolve(SP, &ctx).levels[0].key, "release-2024");
        ctx.chain_id = Some("hotfix".to_string());
        assert_eq!(resolver.resolve(SP, &ctx).levels[0].key, "*");
        ctx.chain_id = None;
        assert!(resolver.resolve(SP, &ctx).levels.is_empty());
    }

    #[test]
    fn category_level_sits_between_chain_and_global() {
        let mut config = InjectionConfig::default();
        config.global.set(SP, PartialRule::enabled(true));
        config.categories.insert("docs".to_string(), rules(PartialRule::enabled(false)));
        let mut ctx = InjectionContext::new("s", 1);
        ctx.category_id = Some("docs".to_string());
        let resolved = HierarchyResolver::new(config).resolve(SP, &ctx);
        assert_eq!(resolved.enabled(), (false, DecisionSource::CategoryConfig));
        assert_eq!(resolved.enabled_from(1), (true, DecisionSource::GlobalConfig));
    }
}
