//! Short-lived runtime overrides scoped to a session, chain, or step.
//!
//! Overrides live in memory only and never touch the configuration documents.
//! Every mutation (including expiry pruning) bumps a generation counter so
//! decision caches can tell when they are stale.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::core::clock::Clock;
use crate::injection::types::{InjectionContext, InjectionTarget, InjectionType};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OverrideScope {
    Session,
    Chain,
    Step,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InjectionRuntimeOverride {
    pub injection_type: InjectionType,
    /// `None` means the override was cleared and no longer applies.
    pub enabled: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<InjectionTarget>,
    pub scope: OverrideScope,
    /// `None` applies to every id within the scope.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope_id: Option<String>,
    pub set_at_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at_ms: Option<u64>,
}

impl InjectionRuntimeOverride {
    fn is_expired(&self, now_ms: u64) -> bool {
        self.expires_at_ms.is_some_and(|at| now_ms >= at)
    }
}

/// Caller-facing override request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OverrideRequest {
    pub injection_type: InjectionType,
    pub enabled: Option<bool>,
    #[serde(default)]
    pub target: Option<InjectionTarget>,
    pub scope: OverrideScope,
    #[serde(default)]
    pub scope_id: Option<String>,
    #[serde(default)]
    pub expires_in_ms: Option<u64>,
}

type OverrideKey = (OverrideScope, Option<String>, InjectionType);

#[derive(Debug, Default)]
struct OverrideState {
    entries: HashMap<OverrideKey, InjectionRuntimeOverride>,
    generation: u64,
}

pub struct SessionOverrideManager {
    clock: Arc<dyn Clock>,
    state: Mutex<OverrideState>,
}

impl SessionOverrideManager {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            state: Mutex::new(OverrideState::default()),
        }
    }

    pub fn set_override(&self, request: OverrideRequest) -> InjectionRuntimeOverride {
        let now = self.clock.now_ms();
        let entry = InjectionRuntimeOverride {
            injection_type: request.injection_type,
            enabled: request.enabled,
            target: request.target,
            scope: request.scope,
            scope_id: request.scope_id,
            set_at_ms: now,
            expires_at_ms: request.expires_in_ms.map(|ttl| now.saturating_add(ttl)),
        };
        let mut state = self.lock();
        state.entries.insert(
            (entry.scope, entry.scope_id.clone(), entry.injection_type),
            entry.clone(),
        );
        state.generation += 1;
        info!(
            injection_type = %entry.injection_type,
            scope = ?entry.scope,
            scope_id = ?entry.scope_id,
            enabled = ?entry.enabled,
            "runtime injection override set"
        );
        entry
    }

    pub fn clear_override(
        &self,
        injection_type: InjectionType,
        scope: OverrideScope,
        scope_id: Option<&str>,
    ) -> bool {
        let mut state = self.lock();
        let removed = state
            .entries
            .remove(&(scope, scope_id.map(str::to_string), injection_type))
            .is_some();
        if removed {
            state.generation += 1;
        }
        removed
    }

    /// Drop every override attached to `(scope, scope_id)`. Returns how many were removed.
    pub fn clear_scope(&self, scope: OverrideScope, scope_id: &str) -> usize {
        let mut state = self.lock();
        let before = state.entries.len();
        state
            .entries
            .retain(|(s, id, _), _| !(*s == scope && id.as_deref() == Some(scope_id)));
        let removed = before - state.entries.len();
        if removed > 0 {
            state.generation += 1;
            debug!(?scope, scope_id, removed, "runtime overrides cleared");
        }
        removed
    }

    /// Most specific live override for this request: step, then chain, then session.
    pub fn active_override(
        &self,
        injection_type: InjectionType,
        ctx: &InjectionContext,
    ) -> Option<InjectionRuntimeOverride> {
        let now = self.clock.now_ms();
        let state = self.lock();
        let step_id = ctx.step_scope_id();
        let candidates = [
            (OverrideScope::Step, Some(step_id.as_str())),
            (OverrideScope::Chain, ctx.chain_id.as_deref()),
            (OverrideScope::Session, Some(ctx.session_id.as_str())),
        ];
        candidates.into_iter().find_map(|(scope, id)| {
            let exact = id.and_then(|id| {
                state
                    .entries
                    .get(&(scope, Some(id.to_string()), injection_type))
            });
            exact
                .into_iter()
                .chain(state.entries.get(&(scope, None, injection_type)))
                .find(|entry| entry.enabled.is_some() && !entry.is_expired(now))
                .cloned()
        })
    }

    /// Live overrides, most recent first.
    pub fn list(&self) -> Vec<InjectionRuntimeOverride> {
        let now = self.clock.now_ms();
        let mut entries: Vec<InjectionRuntimeOverride> = self
            .lock()
            .entries
            .values()
            .filter(|entry| !entry.is_expired(now))
            .cloned()
            .collect();
        entries.sort_by(|a, b| b.set_at_ms.cmp(&a.set_at_ms).then(a.scope.cmp(&b.scope)));
        entries
    }

    /// Remove expired overrides. Returns how many were removed.
    pub fn prune_expired(&self) -> usize {
        let now = self.clock.now_ms();
        let mut state = self.lock();
        let before = state.entries.len();
        state.entries.retain(|_, entry| !entry.is_expired(now));
        let removed = before - state.entries.len();
        if removed > 0 {
            state.generation += 1;
        }
        removed
    }

    pub fn generation(&self) -> u64 {
        self.lock().generation
    }

    fn lock(&self) -> MutexGuard<'_, OverrideState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::clock::ManualClock;

    fn request(scope: OverrideScope, scope_id: Option<&str>, enabled: Option<bool>) -> OverrideRequest {
        OverrideRequest {
            injection_type: InjectionType::SystemPrompt,
            enabled,
            target: None,
            scope,
            scope_id: scope_id.map(str::to_string),
            expires_in_ms: None,
        }
    }

    fn ctx() -> InjectionContext {
        let mut ctx = InjectionContext::new("s1", 2);
        ctx.chain_id = Some("chain-a".to_string());
        ctx
    }

    #[test]
    fn step_beats_chain_beats_session() {
        let mgr = SessionOverrideManager::new(Arc::new(ManualClock::new(0)));
        mgr.set_override(request(OverrideScope::Session, Some("s1"), Some(true)));
        assert_eq!(
            mgr.active_override(InjectionType::SystemPrompt, &ctx()).map(|o| o.scope),
            Some(OverrideScope::Session)
        );
        mgr.set_override(request(OverrideScope::Chain, Some("chain-a"), Some(false)));
        mgr.set_override(request(OverrideScope::Step, Some("s1:2"), Some(true)));
        let active = mgr.active_override(InjectionType::SystemPrompt, &ctx()).expect("override");
        assert_eq!(active.scope, OverrideScope::Step);

        assert!(mgr.clear_override(InjectionType::SystemPrompt, OverrideScope::Step, Some("s1:2")));
        let active = mgr.active_override(InjectionType::SystemPrompt, &ctx()).expect("override");
        assert_eq!((active.scope, active.enabled), (OverrideScope::Chain, Some(false)));
    }

    #[test]
    fn cleared_flag_and_other_sessions_do_not_apply() {
        let mgr = SessionOverrideManager::new(Arc::new(ManualClock::new(0)));
        mgr.set_override(request(OverrideScope::Session, Some("other"), Some(true)));
        mgr.set_override(request(OverrideScope::Session, Some("s1"), None));
        assert!(mgr.active_override(InjectionType::SystemPrompt, &ctx()).is_none());

        mgr.set_override(request(OverrideScope::Session, None, Some(false)));
        assert_eq!(
            mgr.active_override(InjectionType::SystemPrompt, &ctx()).and_then(|o| o.enabled),
            Some(false)
        );
    }

    #[test]
    fn expiry_and_generation() {
        let clock = Arc::new(ManualClock::new(100));
        let mgr = SessionOverrideManager::new(clock.clone());
        let g0 = mgr.generation();
        let mut req = request(OverrideScope::Session, Some("s1"), Some(true));
        req.expires_in_ms = Some(50);
        let entry = mgr.set_override(req);
        assert_eq!(entry.expires_at_ms, Some(150));
        assert!(mgr.generation() > g0);

        clock.advance_ms(50);
        assert!(mgr.active_override(InjectionType::SystemPrompt, &ctx()).is_none());
        assert!(mgr.list().is_empty());
        let g1 = mgr.generation();
        assert_eq!(mgr.prune_expired(), 1);
        assert!(mgr.generation() > g1);
        assert_eq!(mgr.prune_expired(), 0);
    }

    #[test]
    fn clear_scope_removes_all_types() {
        let mgr = SessionOverrideManager::new(Arc::new(ManualClock::new(0)));
        mgr.set_override(request(OverrideScope::Chain, Some("chain-a"), Some(true)));
        let mut style = request(OverrideScope::Chain, Some("chain-a"), Some(false));
        style.injection_type = InjectionType::StyleGuidance;
        mgr.set_override(style);
        mgr.set_override(request(OverrideScope::Chain, Some("chain-b"), Some(true)));
        assert_eq!(mgr.clear_scope(OverrideScope::Chain, "chain-a"), 2);
        assert_eq!(mgr.list().len(), 1);
    }
}
