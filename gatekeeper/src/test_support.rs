//! Test-only helpers: scratch git repositories, scripted verifiers, and gate fixtures.

use std::collections::VecDeque;
use std::fs;
use std::path::Path;
use std::process::Command;
use std::sync::Mutex;

use anyhow::{Context, Result, bail};
use tempfile::TempDir;

use crate::core::types::{GateDefinition, PassCriterion};
use crate::io::shell_verify::{CommandVerifier, ShellVerifyConfig, ShellVerifyResult};

/// Throwaway git repository with a configured identity.
pub struct TestRepo {
    dir: TempDir,
}

impl TestRepo {
    pub fn new() -> Result<Self> {
        let dir = tempfile::tempdir().context("create temp dir")?;
        let repo = Self { dir };
        repo.git(&["init", "-q"])?;
        repo.git(&["config", "user.email", "gatekeeper@example.com"])?;
        repo.git(&["config", "user.name", "Gatekeeper Tests"])?;
        repo.git(&["config", "commit.gpgsign", "false"])?;
        Ok(repo)
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    pub fn write(&self, rel: &str, contents: &str) -> Result<()> {
        let path = self.path().join(rel);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&path, contents).with_context(|| format!("write {}", path.display()))
    }

    pub fn read(&self, rel: &str) -> Result<String> {
        let path = self.path().join(rel);
        fs::read_to_string(&path).with_context(|| format!("read {}", path.display()))
    }

    pub fn commit_all(&self, message: &str) -> Result<()> {
        self.git(&["add", "-A"])?;
        self.git(&["commit", "-q", "-m", message])
    }

    fn git(&self, args: &[&str]) -> Result<()> {
        let output = Command::new("git")
            .args(args)
            .current_dir(self.path())
            .output()
            .with_context(|| format!("spawn git {}", args.join(" ")))?;
        if !output.status.success() {
            bail!(
                "git {} failed: {}",
                args.join(" "),
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        Ok(())
    }
}

/// Verifier that replays queued results, then repeats a fallback.
pub struct ScriptedVerifier {
    script: Mutex<VecDeque<ShellVerifyResult>>,
    fallback: ShellVerifyResult,
    commands: Mutex<Vec<String>>,
}

impl ScriptedVerifier {
    pub fn passing() -> Self {
        Self::sequence(Vec::new(), verify_result(true, Some(0)))
    }

    pub fn failing(exit_code: i32) -> Self {
        Self::sequence(Vec::new(), verify_result(false, Some(exit_code)))
    }

    pub fn sequence(script: Vec<ShellVerifyResult>, fallback: ShellVerifyResult) -> Self {
        Self {
            script: Mutex::new(script.into()),
            fallback,
            commands: Mutex::new(Vec::new()),
        }
    }

    pub fn calls(&self) -> usize {
        self.commands.lock().expect("commands lock").len()
    }

    pub fn commands(&self) -> Vec<String> {
        self.commands.lock().expect("commands lock").clone()
    }
}

impl CommandVerifier for ScriptedVerifier {
    fn verify(&self, config: &ShellVerifyConfig) -> ShellVerifyResult {
        self.commands
            .lock()
            .expect("commands lock")
            .push(config.command.clone());
        self.script
            .lock()
            .expect("script lock")
            .pop_front()
            .unwrap_or_else(|| self.fallback.clone())
    }
}

/// Result with the given outcome and a short diagnostic on failure.
pub fn verify_result(passed: bool, exit_code: Option<i32>) -> ShellVerifyResult {
    ShellVerifyResult {
        passed,
        exit_code,
        stdout: String::new(),
        stderr: if passed {
            String::new()
        } else {
            format!("scripted failure ({exit_code:?})")
        },
        duration_ms: 3,
        timed_out: false,
    }
}

/// Validation gate with one `shell_verify` criterion.
pub fn shell_gate(id: &str, command: &str) -> GateDefinition {
    let mut gate = GateDefinition::new(id, format!("{id} gate"));
    gate.pass_criteria.push(PassCriterion::ShellVerify {
        command: command.to_string(),
        timeout_ms: None,
        working_dir: None,
        env: Default::default(),
        preset: None,
    });
    gate
}
