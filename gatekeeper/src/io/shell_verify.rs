//! Ground-truth verification by running a shell command.
//!
//! A verification passes iff the command exits with code 0 before its timeout.
//! Spawn failures and timeouts are reported as failing results, never as errors,
//! so the caller always gets a pass/fail signal.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::Command;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{info, instrument, warn};

use crate::core::types::{PassCriterion, VerifyPreset};
use crate::io::process::{run_command_with_timeout, tail_chars};

pub const DEFAULT_TIMEOUT_MS: u64 = 300_000;
pub const DEFAULT_MAX_ITERATIONS: u32 = 5;
/// Per-stream character budget kept in results (tail of the output).
pub const MAX_OUTPUT_CHARS: usize = 5_000;
pub const DEFAULT_OUTPUT_LIMIT_BYTES: usize = 1_000_000;

/// Environment variables inherited from the parent process.
pub const ENV_ALLOWLIST: &[&str] = &["PATH", "HOME", "USER", "SHELL", "LANG", "CI", "NODE_ENV"];

/// Verification command plus loop-extension settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ShellVerifyConfig {
    pub command: String,
    /// Timeout in milliseconds.
    #[serde(rename = "timeout", default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub env: BTreeMap<String, String>,
    /// Keep iterating until the command passes (autonomous loop mode).
    #[serde(rename = "loop", default)]
    pub loop_mode: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_iterations: Option<u32>,
    /// Stash tracked changes before each attempt.
    #[serde(default)]
    pub checkpoint: bool,
    /// Restore the checkpoint when an attempt fails.
    #[serde(default)]
    pub rollback: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preset: Option<VerifyPreset>,
}

impl ShellVerifyConfig {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            timeout_ms: None,
            working_dir: None,
            env: BTreeMap::new(),
            loop_mode: false,
            max_iterations: None,
            checkpoint: false,
            rollback: false,
            preset: None,
        }
    }

    /// Build a one-shot config from a gate's `shell_verify` criterion.
    pub fn from_criterion(criterion: &PassCriterion) -> Option<Self> {
        match criterion {
            PassCriterion::ShellVerify {
                command,
                timeout_ms,
                working_dir,
                env,
                preset,
            } => Some(Self {
                timeout_ms: *timeout_ms,
                working_dir: working_dir.clone(),
                env: env.clone(),
                preset: *preset,
                ..Self::new(command.clone())
            }),
            _ => None,
        }
    }

    /// Explicit timeout, else preset timeout, else the default.
    pub fn effective_timeout(&self, default_ms: u64) -> Duration {
        let ms = self
            .timeout_ms
            .or_else(|| self.preset.map(VerifyPreset::timeout_ms))
            .unwrap_or(default_ms);
        Duration::from_millis(ms.max(1))
    }

    pub fn effective_max_iterations(&self, default: u32) -> u32 {
        self.max_iterations
            .or_else(|| self.preset.map(VerifyPreset::max_iterations))
            .unwrap_or(default)
            .max(1)
    }
}

/// Outcome of one verification attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ShellVerifyResult {
    pub passed: bool,
    /// `None` when the process was killed or never started.
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub duration_ms: u64,
    pub timed_out: bool,
}

impl ShellVerifyResult {
    /// The most useful diagnostic text: stderr, else stdout.
    pub fn error_output(&self) -> &str {
        if !self.stderr.trim().is_empty() {
            &self.stderr
        } else if !self.stdout.trim().is_empty() {
            &self.stdout
        } else {
            "No output captured"
        }
    }
}

/// Seam between gate evaluation and the process that produces ground truth.
pub trait CommandVerifier: Send + Sync {
    fn verify(&self, config: &ShellVerifyConfig) -> ShellVerifyResult;
}

/// Runs verification commands via `sh -c`.
#[derive(Debug, Clone)]
pub struct ShellVerifyExecutor {
    default_timeout_ms: u64,
    output_limit_bytes: usize,
}

impl Default for ShellVerifyExecutor {
    fn default() -> Self {
        Self {
            default_timeout_ms: DEFAULT_TIMEOUT_MS,
            output_limit_bytes: DEFAULT_OUTPUT_LIMIT_BYTES,
        }
    }
}

impl ShellVerifyExecutor {
    pub fn new(default_timeout_ms: u64, output_limit_bytes: usize) -> Self {
        Self {
            default_timeout_ms,
            output_limit_bytes,
        }
    }

    #[instrument(skip_all, fields(command = %config.command))]
    pub fn execute(&self, config: &ShellVerifyConfig) -> ShellVerifyResult {
        let timeout = config.effective_timeout(self.default_timeout_ms);

        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(&config.command);
        cmd.env_clear();
        for key in ENV_ALLOWLIST {
            if let Ok(value) = std::env::var(key) {
                cmd.env(key, value);
            }
        }
        cmd.envs(&config.env);
        if let Some(dir) = &config.working_dir {
            cmd.current_dir(dir);
        }

        let output = match run_command_with_timeout(cmd, timeout, self.output_limit_bytes) {
            Ok(output) => output,
            Err(err) => {
                warn!(err = %format!("{err:#}"), "verification command could not run");
                return ShellVerifyResult {
                    passed: false,
                    exit_code: None,
                    stdout: String::new(),
                    stderr: format!("{err:#}"),
                    duration_ms: 0,
                    timed_out: false,
                };
            }
        };

        let duration_ms = u64::try_from(output.duration.as_millis()).unwrap_or(u64::MAX);
        if output.timed_out {
            warn!(timeout_ms = timeout.as_millis() as u64, "verification timed out");
            let mut stderr = tail_chars(&output.stderr_lossy(), MAX_OUTPUT_CHARS);
            if !stderr.is_empty() && !stderr.ends_with('\n') {
                stderr.push('\n');
            }
            stderr.push_str(&format!(
                "Command timed out after {}ms",
                timeout.as_millis()
            ));
            return ShellVerifyResult {
                passed: false,
                exit_code: None,
                stdout: tail_chars(&output.stdout_lossy(), MAX_OUTPUT_CHARS),
                stderr,
                duration_ms,
                timed_out: true,
            };
        }

        let exit_code = output.status.code();
        let passed = exit_code == Some(0);
        info!(?exit_code, passed, duration_ms, "verification finished");
        ShellVerifyResult {
            passed,
            exit_code,
            stdout: tail_chars(&output.stdout_lossy(), MAX_OUTPUT_CHARS),
            stderr: tail_chars(&output.stderr_lossy(), MAX_OUTPUT_CHARS),
            duration_ms,
            timed_out: false,
        }
    }
}

impl CommandVerifier for ShellVerifyExecutor {
    fn verify(&self, config: &ShellVerifyConfig) -> ShellVerifyResult {
        self.execute(config)
    }
}
