//! Gatekeeper configuration stored in `gatekeeper.toml`.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::gates::self_check::SemanticEvaluationConfig;
use crate::gates::temporary::RegistryConfig;
use crate::injection::types::InjectionConfig;
use crate::io::shell_verify::{DEFAULT_MAX_ITERATIONS, DEFAULT_OUTPUT_LIMIT_BYTES, DEFAULT_TIMEOUT_MS};
use crate::io::verify_state::DEFAULT_STATE_PATH;

pub const DEFAULT_CONFIG_FILE: &str = "gatekeeper.toml";

/// Top-level configuration (TOML).
///
/// Every section is optional; missing fields take the defaults below.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct GatekeeperConfig {
    pub verification: VerificationSettings,
    pub registry: RegistryConfig,
    pub validation: ValidationSettings,
    pub semantic: SemanticEvaluationConfig,
    pub injection: InjectionConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct VerificationSettings {
    /// Used when neither the command nor its preset sets a timeout.
    pub default_timeout_ms: u64,
    pub default_max_iterations: u32,
    /// Bytes captured per stream before tail truncation.
    pub output_limit_bytes: usize,
    /// Loop state file, relative to the working directory unless absolute.
    pub state_path: PathBuf,
}

impl Default for VerificationSettings {
    fn default() -> Self {
        Self {
            default_timeout_ms: DEFAULT_TIMEOUT_MS,
            default_max_iterations: DEFAULT_MAX_ITERATIONS,
            output_limit_bytes: DEFAULT_OUTPUT_LIMIT_BYTES,
            state_path: PathBuf::from(DEFAULT_STATE_PATH),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ValidationSettings {
    /// Samples kept for the rolling average latency.
    pub stats_window: usize,
    /// Directory of `<gate-id>.json` definitions.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gates_dir: Option<PathBuf>,
}

impl Default for ValidationSettings {
    fn default() -> Self {
        Self {
            stats_window: 100,
            gates_dir: None,
        }
    }
}

impl GatekeeperConfig {
    pub fn validate(&self) -> Result<()> {
        if self.verification.default_timeout_ms == 0 {
            return Err(anyhow!("verification.default_timeout_ms must be > 0"));
        }
        if self.verification.default_max_iterations == 0 {
            return Err(anyhow!("verification.default_max_iterations must be > 0"));
        }
        if self.verification.output_limit_bytes == 0 {
            return Err(anyhow!("verification.output_limit_bytes must be > 0"));
        }
        if self.verification.state_path.as_os_str().is_empty() {
            return Err(anyhow!("verification.state_path must not be empty"));
        }
        if self.validation.stats_window == 0 {
            return Err(anyhow!("validation.stats_window must be > 0"));
        }
        if self.registry.sweep_interval_ms == 0 {
            return Err(anyhow!("registry.sweep_interval_ms must be > 0"));
        }
        if self.semantic.enabled
            && self
                .semantic
                .endpoint
                .as_deref()
                .is_none_or(|endpoint| endpoint.trim().is_empty())
        {
            return Err(anyhow!("semantic.endpoint is required when semantic.enabled = true"));
        }
        self.injection.validate()?;
        for key in self.injection.unparseable_step_keys() {
            warn!(key, "ignoring injection step rule with unrecognized key");
        }
        Ok(())
    }

    /// Resolve the loop state path against `root` when it is relative.
    pub fn state_path(&self, root: &Path) -> PathBuf {
        if self.verification.state_path.is_absolute() {
            self.verification.state_path.clone()
        } else {
            root.join(&self.verification.state_path)
        }
    }
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `GatekeeperConfig::default()`.
pub fn load_config(path: &Path) -> Result<GatekeeperConfig> {
    if !path.exists() {
        let cfg = GatekeeperConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: GatekeeperConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()
        .with_context(|| format!("validate {}", path.display()))?;
    Ok(cfg)
}

/// Atomically write config to disk (temp file + rename).
pub fn write_config(path: &Path, cfg: &GatekeeperConfig) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    write_atomic(path, &buf)
}

fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("config path missing parent {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let tmp_path = path.with_extension("toml.tmp");
    fs::write(&tmp_path, contents)
        .with_context(|| format!("write temp config {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace config {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::injection::types::{FrequencyMode, InjectionType};

    #[test]
    fn load_missing_returns_default() {
        let temp = tempfile::tempdir().expect("tempdir");
        let cfg = load_config(&temp.path().join("missing.toml")).expect("load");
        assert_eq!(cfg, GatekeeperConfig::default());
        assert_eq!(cfg.verification.default_timeout_ms, 300_000);
        assert_eq!(cfg.registry.max_memory_gates, 100);
    }

    #[test]
    fn write_then_load_round_trips() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("gatekeeper.toml");
        let mut cfg = GatekeeperConfig::default();
        cfg.verification.default_max_iterations = 7;
        cfg.registry.max_memory_gates = 12;
        write_config(&path, &cfg).expect("write");
        assert_eq!(load_config(&path).expect("load"), cfg);
    }

    #[test]
    fn parses_injection_sections() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("gatekeeper.toml");
        fs::write(
            &path,
            r#"
[injection.defaults]
style-guidance = true

[injection.global.system-prompt]
enabled = true
frequency = { mode = "first-only" }

[injection.chains."release-*".gate-guidance]
enabled = false

[injection.steps.last.system-prompt]
enabled = true
target = "gates"

[[injection.steps.2.gate-guidance.conditions]]
when = { type = "previous-step-result", value = "failed" }
then = "inject"
"#,
        )
        .expect("write");

        let cfg = load_config(&path).expect("load");
        let injection = &cfg.injection;
        assert!(injection.defaults.enabled(InjectionType::StyleGuidance));
        let global = injection.global.get(InjectionType::SystemPrompt).expect("global rule");
        assert_eq!(
            global.frequency.as_ref().map(|f| f.mode),
            Some(FrequencyMode::FirstOnly)
        );
        assert!(injection.chains.contains_key("release-*"));
        let step2 = injection.steps["2"].get(InjectionType::GateGuidance).expect("step rule");
        assert_eq!(step2.conditions.len(), 1);
    }

    #[test]
    fn rejects_zero_timeout() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("gatekeeper.toml");
        fs::write(&path, "[verification]\ndefault_timeout_ms = 0\n").expect("write");
        let err = load_config(&path).expect_err("invalid");
        assert!(format!("{err:#}").contains("default_timeout_ms"));
    }

    #[test]
    fn semantic_requires_endpoint_when_enabled() {
        let mut cfg = GatekeeperConfig::default();
        cfg.semantic.enabled = true;
        assert!(cfg.validate().is_err());
        cfg.semantic.endpoint = Some("http://localhost:9000".to_string());
        cfg.validate().expect("valid");
    }

    #[test]
    fn relative_state_path_resolves_against_root() {
        let cfg = GatekeeperConfig::default();
        assert_eq!(
            cfg.state_path(Path::new("/srv/app")),
            PathBuf::from("/srv/app/runtime-state/verify-active.json")
        );
    }
}
