//! In-memory registry of ephemeral gates.
//!
//! Gates are bucketed by `(scope, scope_id)` so a whole execution, session,
//! chain run, or step can be cleaned up in one call. Expiry is evaluated
//! against the injected [`Clock`]: expired gates are hidden from reads
//! immediately and physically removed by [`TemporaryGateRegistry::cleanup_expired_gates`],
//! which the optional sweeper thread calls on an interval.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::sync::{Arc, LazyLock, Mutex, MutexGuard, Weak};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use anyhow::Result;
use rand::Rng;
use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::core::clock::Clock;
use crate::core::types::{
    Activation, EnforcementMode, GateDefinition, GateType, PassCriterion, RetryConfig, Severity,
};
use crate::gates::provider::GateProvider;

static ID_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9_-]+$").expect("valid id regex"));
static GENERATED_ID_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^temp_\d+_[a-z0-9]+$").expect("valid generated id regex"));

const BASE36: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";
const DEFAULT_SCOPE_ID: &str = "default";
/// Separators that mark a step scope id as belonging to a chain or execution.
const SCOPE_SEPARATORS: [char; 4] = [':', '#', '/', '.'];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GateScope {
    Execution,
    Session,
    Chain,
    Step,
}

impl GateScope {
    pub fn as_str(self) -> &'static str {
        match self {
            GateScope::Execution => "execution",
            GateScope::Session => "session",
            GateScope::Chain => "chain",
            GateScope::Step => "step",
        }
    }
}

impl fmt::Display for GateScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GateSource {
    #[default]
    Manual,
    Automatic,
    Analysis,
}

impl GateSource {
    pub fn as_str(self) -> &'static str {
        match self {
            GateSource::Manual => "manual",
            GateSource::Automatic => "automatic",
            GateSource::Analysis => "analysis",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TemporaryGateDefinition {
    #[serde(flatten)]
    pub gate: GateDefinition,
    pub scope: GateScope,
    pub scope_id: String,
    pub created_at_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at_ms: Option<u64>,
    #[serde(default)]
    pub source: GateSource,
}

impl TemporaryGateDefinition {
    pub fn is_expired(&self, now_ms: u64) -> bool {
        self.expires_at_ms.is_some_and(|at| now_ms >= at)
    }
}

/// Request to register a temporary gate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewTemporaryGate {
    /// Caller-chosen id; generated when absent.
    #[serde(default)]
    pub id: Option<String>,
    pub name: String,
    #[serde(rename = "type", default)]
    pub gate_type: GateType,
    #[serde(default)]
    pub severity: Severity,
    #[serde(default)]
    pub enforcement_mode: Option<EnforcementMode>,
    #[serde(default)]
    pub guidance: String,
    #[serde(default)]
    pub pass_criteria: Vec<PassCriterion>,
    #[serde(default)]
    pub retry_config: RetryConfig,
    pub scope: GateScope,
    /// Overrides the registry's default TTL.
    #[serde(default)]
    pub ttl_ms: Option<u64>,
    #[serde(default)]
    pub source: GateSource,
}

impl NewTemporaryGate {
    pub fn new(name: impl Into<String>, scope: GateScope) -> Self {
        Self {
            id: None,
            name: name.into(),
            gate_type: GateType::Validation,
            severity: Severity::Medium,
            enforcement_mode: None,
            guidance: String::new(),
            pass_criteria: Vec::new(),
            retry_config: RetryConfig::default(),
            scope,
            ttl_ms: None,
            source: GateSource::Manual,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_ttl_ms(mut self, ttl_ms: u64) -> Self {
        self.ttl_ms = Some(ttl_ms);
        self
    }
}

/// Bulk-cleanup bucket for one `(scope, scope_id)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScopeInfo {
    pub scope: GateScope,
    pub scope_id: String,
    pub gate_ids: BTreeSet<String>,
    pub created_at_ms: u64,
    /// Latest gate expiry, or `None` while any gate in the bucket never expires.
    pub expires_at_ms: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    pub max_memory_gates: usize,
    /// TTL applied when a request does not set one. `None` keeps gates until cleanup.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default_ttl_ms: Option<u64>,
    pub sweep_interval_ms: u64,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            max_memory_gates: 100,
            default_ttl_ms: Some(60 * 60 * 1000),
            sweep_interval_ms: 60 * 1000,
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("invalid temporary gate id '{0}': use letters, digits, '-' or '_'")]
    InvalidId(String),
    #[error("temporary gate id '{0}' collides with the generated id format")]
    ReservedId(String),
    #[error("temporary gate '{0}' already exists")]
    DuplicateId(String),
    #[error("temporary gate registry is full (max {max})")]
    CapacityExhausted { max: usize },
    #[error("temporary gate registry has been destroyed")]
    Destroyed,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryStatistics {
    pub total_gates: usize,
    pub active_gates: usize,
    pub expired_gates: usize,
    pub scopes: usize,
    pub max_memory_gates: usize,
    pub by_scope: BTreeMap<String, usize>,
    pub by_source: BTreeMap<String, usize>,
    pub oldest_created_at_ms: Option<u64>,
    pub evicted_total: u64,
    pub expired_removed_total: u64,
}

#[derive(Debug)]
struct Entry {
    def: TemporaryGateDefinition,
    /// Insertion order; breaks creation-time ties during eviction.
    seq: u64,
}

#[derive(Debug, Default)]
struct RegistryState {
    gates: HashMap<String, Entry>,
    scopes: HashMap<String, ScopeInfo>,
    next_seq: u64,
    evicted_total: u64,
    expired_removed_total: u64,
    destroyed: bool,
}

struct Sweeper {
    stop: Sender<()>,
    handle: JoinHandle<()>,
}

pub struct TemporaryGateRegistry {
    clock: Arc<dyn Clock>,
    config: RegistryConfig,
    state: Mutex<RegistryState>,
    sweeper: Mutex<Option<Sweeper>>,
}

impl TemporaryGateRegistry {
    pub fn new(clock: Arc<dyn Clock>, config: RegistryConfig) -> Self {
        Self {
            clock,
            config,
            state: Mutex::new(RegistryState::default()),
            sweeper: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    /// Register a gate and return its id.
    pub fn create_temporary_gate(
        &self,
        request: NewTemporaryGate,
        scope_id: Option<&str>,
    ) -> Result<String, RegistryError> {
        let now = self.clock.now_ms();
        let max = self.config.max_memory_gates;
        let mut state = self.lock();
        if state.destroyed {
            return Err(RegistryError::Destroyed);
        }

        let id = match &request.id {
            Some(id) => {
                if !ID_RE.is_match(id) {
                    return Err(RegistryError::InvalidId(id.clone()));
                }
                if GENERATED_ID_RE.is_match(id) {
                    return Err(RegistryError::ReservedId(id.clone()));
                }
                match state.gates.get(id) {
                    Some(existing) if existing.def.is_expired(now) => {
                        remove_gate(&mut state, id);
                    }
                    Some(_) => return Err(RegistryError::DuplicateId(id.clone())),
                    None => {}
                }
                id.clone()
            }
            None => loop {
                let candidate = generate_id(now);
                if !state.gates.contains_key(&candidate) {
                    break candidate;
                }
            },
        };

        if max == 0 {
            return Err(RegistryError::CapacityExhausted { max });
        }
        if state.gates.len() >= max {
            let expired = sweep_expired(&mut state, now);
            if expired > 0 {
                debug!(expired, "swept expired gates before insert");
            }
        }
        if state.gates.len() >= max {
            let target = max * 8 / 10;
            let evicted = evict_oldest(&mut state, target);
            warn!(evicted, max, "temporary gate registry at capacity; evicted oldest gates");
        }

        let scope_id = scope_id.unwrap_or(DEFAULT_SCOPE_ID).to_string();
        let expires_at_ms = request
            .ttl_ms
            .or(self.config.default_ttl_ms)
            .map(|ttl| now.saturating_add(ttl));
        let def = TemporaryGateDefinition {
            gate: GateDefinition {
                id: id.clone(),
                name: request.name,
                gate_type: request.gate_type,
                severity: request.severity,
                enforcement_mode: request.enforcement_mode,
                guidance: request.guidance,
                pass_criteria: request.pass_criteria,
                retry_config: request.retry_config,
                activation: Activation::default(),
            },
            scope: request.scope,
            scope_id: scope_id.clone(),
            created_at_ms: now,
            expires_at_ms,
            source: request.source,
        };

        let key = scope_key(request.scope, &scope_id);
        let bucket = state.scopes.entry(key).or_insert_with(|| ScopeInfo {
            scope: request.scope,
            scope_id: scope_id.clone(),
            gate_ids: BTreeSet::new(),
            created_at_ms: now,
            expires_at_ms,
        });
        bucket.expires_at_ms = if bucket.gate_ids.is_empty() {
            expires_at_ms
        } else {
            bucket.expires_at_ms.zip(expires_at_ms).map(|(a, b)| a.max(b))
        };
        bucket.gate_ids.insert(id.clone());

        let seq = state.next_seq;
        state.next_seq += 1;
        state.gates.insert(id.clone(), Entry { def, seq });

        info!(gate_id = %id, scope = %request.scope, scope_id = %scope_id, ?expires_at_ms, "temporary gate created");
        Ok(id)
    }

    /// Live gate by id. Expired gates are invisible even before a sweep.
    pub fn get_temporary_gate(&self, id: &str) -> Option<TemporaryGateDefinition> {
        let now = self.clock.now_ms();
        self.lock()
            .gates
            .get(id)
            .filter(|entry| !entry.def.is_expired(now))
            .map(|entry| entry.def.clone())
    }

    /// Live gates in one bucket, oldest first.
    pub fn get_temporary_gates_for_scope(&self, scope: GateScope, scope_id: &str) -> Vec<TemporaryGateDefinition> {
        let now = self.clock.now_ms();
        let state = self.lock();
        let Some(bucket) = state.scopes.get(&scope_key(scope, scope_id)) else {
            return Vec::new();
        };
        let mut entries: Vec<&Entry> = bucket
            .gate_ids
            .iter()
            .filter_map(|id| state.gates.get(id))
            .filter(|entry| !entry.def.is_expired(now))
            .collect();
        entries.sort_by_key(|entry| (entry.def.created_at_ms, entry.seq));
        entries.into_iter().map(|entry| entry.def.clone()).collect()
    }

    pub fn scope_info(&self, scope: GateScope, scope_id: &str) -> Option<ScopeInfo> {
        self.lock().scopes.get(&scope_key(scope, scope_id)).cloned()
    }

    pub fn remove_temporary_gate(&self, id: &str) -> bool {
        let removed = remove_gate(&mut self.lock(), id);
        if removed {
            debug!(gate_id = id, "temporary gate removed");
        }
        removed
    }

    /// Remove every expired gate and empty bucket. Returns the number of gates removed.
    pub fn cleanup_expired_gates(&self) -> usize {
        let now = self.clock.now_ms();
        let removed = sweep_expired(&mut self.lock(), now);
        if removed > 0 {
            info!(removed, "expired temporary gates removed");
        }
        removed
    }

    /// Remove every gate in one bucket. Returns the number of gates removed.
    pub fn cleanup_scope(&self, scope: GateScope, scope_id: &str) -> usize {
        let removed = remove_buckets(&mut self.lock(), |info| {
            info.scope == scope && info.scope_id == scope_id
        });
        debug!(scope = %scope, scope_id, removed, "scope cleaned up");
        removed
    }

    /// Remove a chain run's gates, including step buckets that belong to it.
    pub fn cleanup_chain_execution(&self, chain_execution_id: &str) -> usize {
        let removed = remove_buckets(&mut self.lock(), |info| match info.scope {
            GateScope::Chain => info.scope_id == chain_execution_id,
            GateScope::Step => references(&info.scope_id, chain_execution_id),
            _ => false,
        });
        info!(chain_execution_id, removed, "chain execution gates cleaned up");
        removed
    }

    /// Remove an execution's (or session's) gates, including step buckets that belong to it.
    pub fn cleanup_execution_scope(&self, execution_id: &str) -> usize {
        let removed = remove_buckets(&mut self.lock(), |info| match info.scope {
            GateScope::Execution | GateScope::Session => info.scope_id == execution_id,
            GateScope::Step => references(&info.scope_id, execution_id),
            GateScope::Chain => false,
        });
        info!(execution_id, removed, "execution scope gates cleaned up");
        removed
    }

    pub fn statistics(&self) -> RegistryStatistics {
        let now = self.clock.now_ms();
        let state = self.lock();
        let mut stats = RegistryStatistics {
            total_gates: state.gates.len(),
            scopes: state.scopes.len(),
            max_memory_gates: self.config.max_memory_gates,
            evicted_total: state.evicted_total,
            expired_removed_total: state.expired_removed_total,
            ..RegistryStatistics::default()
        };
        for entry in state.gates.values() {
            if entry.def.is_expired(now) {
                stats.expired_gates += 1;
            } else {
                stats.active_gates += 1;
            }
            *stats.by_scope.entry(entry.def.scope.to_string()).or_default() += 1;
            *stats
                .by_source
                .entry(entry.def.source.as_str().to_string())
                .or_default() += 1;
            stats.oldest_created_at_ms = Some(
                stats
                    .oldest_created_at_ms
                    .map_or(entry.def.created_at_ms, |oldest| oldest.min(entry.def.created_at_ms)),
            );
        }
        stats
    }

    /// Stop the sweeper and drop all state. Later creations fail with `Destroyed`.
    pub fn destroy(&self) {
        self.stop_sweeper();
        let mut state = self.lock();
        let count = state.gates.len();
        state.gates.clear();
        state.scopes.clear();
        state.destroyed = true;
        info!(count, "temporary gate registry destroyed");
    }

    /// Start a background thread that calls `cleanup_expired_gates` every
    /// `sweep_interval_ms`. Returns `false` if one is already running.
    pub fn start_sweeper(self: &Arc<Self>) -> Result<bool> {
        let mut slot = self.sweeper.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if slot.is_some() {
            return Ok(false);
        }
        let interval = Duration::from_millis(self.config.sweep_interval_ms.max(1));
        let weak: Weak<Self> = Arc::downgrade(self);
        let (stop, rx) = mpsc::channel::<()>();
        let handle = thread::Builder::new()
            .name("gate-sweeper".to_string())
            .spawn(move || {
                loop {
                    match rx.recv_timeout(interval) {
                        Err(RecvTimeoutError::Timeout) => {
                            let Some(registry) = weak.upgrade() else { break };
                            registry.cleanup_expired_gates();
                        }
                        Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                    }
                }
                debug!("gate sweeper stopped");
            })?;
        *slot = Some(Sweeper { stop, handle });
        Ok(true)
    }

    pub fn sweeper_running(&self) -> bool {
        self.sweeper
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .is_some()
    }

    /// View used by the validator; gates served through it are ephemeral.
    pub fn as_gate_provider(self: &Arc<Self>) -> TemporaryGateProvider {
        TemporaryGateProvider {
            registry: Arc::clone(self),
        }
    }

    fn stop_sweeper(&self) {
        let sweeper = self
            .sweeper
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(Sweeper { stop, handle }) = sweeper {
            let _ = stop.send(());
            if handle.thread().id() != thread::current().id() && handle.join().is_err() {
                warn!("gate sweeper thread panicked");
            }
        }
    }

    fn lock(&self) -> MutexGuard<'_, RegistryState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Drop for TemporaryGateRegistry {
    fn drop(&mut self) {
        // Drop may run on the sweeper thread itself, so signal without joining.
        if let Some(sweeper) = self
            .sweeper
            .get_mut()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take()
        {
            let _ = sweeper.stop.send(());
        }
    }
}

pub struct TemporaryGateProvider {
    registry: Arc<TemporaryGateRegistry>,
}

impl GateProvider for TemporaryGateProvider {
    fn load_gate(&self, id: &str) -> Result<Option<GateDefinition>> {
        Ok(self.registry.get_temporary_gate(id).map(|temp| temp.gate))
    }

    fn is_ephemeral(&self) -> bool {
        true
    }
}

fn scope_key(scope: GateScope, scope_id: &str) -> String {
    format!("{scope}:{scope_id}")
}

fn references(step_scope_id: &str, owner_id: &str) -> bool {
    step_scope_id == owner_id
        || step_scope_id
            .strip_prefix(owner_id)
            .and_then(|rest| rest.chars().next())
            .is_some_and(|c| SCOPE_SEPARATORS.contains(&c))
}

fn generate_id(now_ms: u64) -> String {
    let mut rng = rand::thread_rng();
    let suffix: String = (0..9)
        .map(|_| char::from(BASE36[rng.gen_range(0..BASE36.len())]))
        .collect();
    format!("temp_{now_ms}_{suffix}")
}

fn remove_gate(state: &mut RegistryState, id: &str) -> bool {
    let Some(entry) = state.gates.remove(id) else {
        return false;
    };
    let key = scope_key(entry.def.scope, &entry.def.scope_id);
    if let Some(bucket) = state.scopes.get_mut(&key) {
        bucket.gate_ids.remove(id);
        if bucket.gate_ids.is_empty() {
            state.scopes.remove(&key);
        }
    }
    true
}

fn sweep_expired(state: &mut RegistryState, now: u64) -> usize {
    let expired: Vec<String> = state
        .gates
        .iter()
        .filter(|(_, entry)| entry.def.is_expired(now))
        .map(|(id, _)| id.clone())
        .collect();
    for id in &expired {
        remove_gate(state, id);
    }
    state
        .scopes
        .retain(|_, bucket| !bucket.gate_ids.is_empty() && !bucket.expires_at_ms.is_some_and(|at| now >= at));
    state.expired_removed_total += expired.len() as u64;
    expired.len()
}

fn evict_oldest(state: &mut RegistryState, target_len: usize) -> usize {
    let mut order: Vec<(u64, u64, String)> = state
        .gates
        .iter()
        .map(|(id, entry)| (entry.def.created_at_ms, entry.seq, id.clone()))
        .collect();
    order.sort();
    let excess = state.gates.len().saturating_sub(target_len);
    for (_, _, id) in order.iter().take(excess) {
        remove_gate(state, id);
    }
    state.evicted_total += excess as u64;
    excess
}

fn remove_buckets(state: &mut RegistryState, matches: impl Fn(&ScopeInfo) -> bool) -> usize {
    let keys: Vec<String> = state
        .scopes
        .iter()
        .filter(|(_, info)| matches(info))
        .map(|(key, _)| key.clone())
        .collect();
    let mut removed = 0;
    for key in keys {
        if let Some(bucket) = state.scopes.remove(&key) {
            for id in &bucket.gate_ids {
                if state.gates.remove(id).is_some() {
                    removed += 1;
                }
            }
        }
    }
    removed
}
