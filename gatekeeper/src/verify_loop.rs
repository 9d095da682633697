//! Per-session shell verification loop and the stop-hook decision.
//!
//! A step that declares a verification command opens a pending verification.
//! Each attempt optionally checkpoints tracked files, mirrors the loop state to
//! disk (loop mode), runs the command, and rolls back on failure when asked.
//! The pending entry and its on-disk mirror are destroyed on pass, exhaustion,
//! or abort.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::{Context, Result, bail};
use minijinja::{Environment, context};
use serde::{Deserialize, Serialize};
use tracing::{info, instrument, warn};

use crate::core::clock::Clock;
use crate::io::checkpoint::{CheckpointRef, GitCheckpoint};
use crate::io::shell_verify::{CommandVerifier, DEFAULT_MAX_ITERATIONS, ShellVerifyConfig, ShellVerifyResult};
use crate::io::verify_state::{LoopState, VerifyActiveState, VerifyActiveStateManager};

const FEEDBACK_TEMPLATE: &str = include_str!("prompts/verify_feedback.md");
/// Characters of error output shown in loop feedback.
pub const FEEDBACK_OUTPUT_CHARS: usize = 2_000;
/// Iteration ceiling the stop hook applies when the state file names none.
pub const STOP_HOOK_MAX_ITERATIONS: u32 = 10;

/// Verification in progress for one session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingShellVerification {
    pub session_id: String,
    pub config: ShellVerifyConfig,
    pub attempt_count: u32,
    pub max_attempts: u32,
    pub results: Vec<ShellVerifyResult>,
    pub checkpoint: Option<CheckpointRef>,
    pub started_at_ms: u64,
}

impl PendingShellVerification {
    pub fn last_result(&self) -> Option<&ShellVerifyResult> {
        self.results.last()
    }

    fn loop_state(&self) -> VerifyActiveState {
        VerifyActiveState {
            session_id: self.session_id.clone(),
            config: self.config.clone(),
            state: LoopState {
                iteration: self.attempt_count,
                last_result: self.results.last().cloned(),
                checkpoint: self.checkpoint.clone(),
                started_at: self.started_at_ms,
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttemptOutcome {
    Passed {
        iteration: u32,
        result: ShellVerifyResult,
    },
    /// Failed with attempts remaining; `feedback` goes back to the agent.
    Retry {
        iteration: u32,
        max_iterations: u32,
        result: ShellVerifyResult,
        feedback: String,
        rolled_back: bool,
    },
    Exhausted {
        iteration: u32,
        result: ShellVerifyResult,
        rolled_back: bool,
    },
}

impl AttemptOutcome {
    pub fn passed(&self) -> bool {
        matches!(self, AttemptOutcome::Passed { .. })
    }
}

pub struct ShellVerifyLoop {
    verifier: Arc<dyn CommandVerifier>,
    state_file: VerifyActiveStateManager,
    checkpoints: Option<GitCheckpoint>,
    clock: Arc<dyn Clock>,
    default_max_iterations: u32,
    pending: Mutex<HashMap<String, PendingShellVerification>>,
}

impl ShellVerifyLoop {
    pub fn new(
        verifier: Arc<dyn CommandVerifier>,
        state_file: VerifyActiveStateManager,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            verifier,
            state_file,
            checkpoints: None,
            clock,
            default_max_iterations: DEFAULT_MAX_ITERATIONS,
            pending: Mutex::new(HashMap::new()),
        }
    }

    /// Enable `checkpoint`/`rollback` handling against a git working tree.
    pub fn with_checkpoints(mut self, checkpoints: GitCheckpoint) -> Self {
        self.checkpoints = Some(checkpoints);
        self
    }

    pub fn with_default_max_iterations(mut self, max: u32) -> Self {
        self.default_max_iterations = max.max(1);
        self
    }

    pub fn state_file(&self) -> &VerifyActiveStateManager {
        &self.state_file
    }

    /// Open (or replace) the pending verification for `session_id`.
    #[instrument(skip(self, config), fields(command = %config.command))]
    pub fn begin(&self, session_id: &str, config: ShellVerifyConfig) -> Result<PendingShellVerification> {
        let max_attempts = config.effective_max_iterations(self.default_max_iterations);
        let mut config = config;
        config.max_iterations = Some(max_attempts);
        let pending = PendingShellVerification {
            session_id: session_id.to_string(),
            config,
            attempt_count: 0,
            max_attempts,
            results: Vec::new(),
            checkpoint: None,
            started_at_ms: self.clock.now_ms(),
        };

        let previous = self.lock().insert(session_id.to_string(), pending.clone());
        if let Some(previous) = previous {
            warn!(session_id, "replacing pending verification");
            self.release_checkpoint(previous.checkpoint.as_ref());
        }
        if pending.config.loop_mode {
            self.state_file
                .write(&pending.loop_state())
                .context("write verify state")?;
        }
        info!(session_id, max_attempts, loop_mode = pending.config.loop_mode, "verification opened");
        Ok(pending)
    }

    pub fn pending(&self, session_id: &str) -> Option<PendingShellVerification> {
        self.lock().get(session_id).cloned()
    }

    /// Run one attempt. Errors only when no verification is pending or the
    /// state file cannot be written.
    #[instrument(skip(self))]
    pub fn attempt(&self, session_id: &str) -> Result<AttemptOutcome> {
        let Some(mut pending) = self.pending(session_id) else {
            bail!("no pending verification for session '{session_id}'");
        };

        if pending.config.checkpoint {
            match &self.checkpoints {
                Some(checkpoints) => {
                    let label = format!("{session_id}-{}", pending.attempt_count + 1);
                    pending.checkpoint = checkpoints.create(&label);
                }
                None => warn!("checkpoint requested but no git working tree is configured"),
            }
        }
        if pending.config.loop_mode {
            if let Err(err) = self.state_file.write(&pending.loop_state()) {
                // Nothing ran yet; the stash only duplicates the working tree.
                self.release_checkpoint(pending.checkpoint.as_ref());
                return Err(err).context("write verify state");
            }
        }

        let result = self.verifier.verify(&pending.config);
        pending.attempt_count += 1;
        pending.results.push(result.clone());
        let iteration = pending.attempt_count;
        let checkpoint = pending.checkpoint.take();

        if result.passed {
            self.release_checkpoint(checkpoint.as_ref());
            self.finish(session_id)?;
            info!(iteration, "verification passed");
            return Ok(AttemptOutcome::Passed { iteration, result });
        }

        let rolled_back = match (&checkpoint, &self.checkpoints) {
            (Some(cp), Some(checkpoints)) if pending.config.rollback => checkpoints.rollback(cp),
            _ => {
                self.release_checkpoint(checkpoint.as_ref());
                false
            }
        };

        if iteration >= pending.max_attempts {
            self.finish(session_id)?;
            warn!(iteration, max_attempts = pending.max_attempts, "verification attempts exhausted");
            return Ok(AttemptOutcome::Exhausted {
                iteration,
                result,
                rolled_back,
            });
        }

        // The attempt counts even when the state write below fails.
        self.lock().insert(session_id.to_string(), pending.clone());
        if pending.config.loop_mode {
            self.state_file
                .write(&pending.loop_state())
                .context("write verify state")?;
        }
        let feedback = render_feedback(&pending.config, iteration, pending.max_attempts, &result, rolled_back)?;
        let max_iterations = pending.max_attempts;
        Ok(AttemptOutcome::Retry {
            iteration,
            max_iterations,
            result,
            feedback,
            rolled_back,
        })
    }

    /// Drop the pending verification. Returns whether one existed.
    pub fn abort(&self, session_id: &str) -> Result<bool> {
        let removed = self.lock().remove(session_id);
        if let Some(pending) = &removed {
            self.release_checkpoint(pending.checkpoint.as_ref());
            self.clear_state_for(session_id)?;
            info!(session_id, "verification aborted");
        }
        Ok(removed.is_some())
    }

    fn finish(&self, session_id: &str) -> Result<()> {
        self.lock().remove(session_id);
        self.clear_state_for(session_id)
    }

    /// Remove the state file only when it belongs to `session_id` (or is unreadable).
    fn clear_state_for(&self, session_id: &str) -> Result<()> {
        let owned = match self.state_file.read() {
            Ok(Some(state)) => state.session_id == session_id,
            Ok(None) => return Ok(()),
            Err(err) => {
                warn!(err = %format!("{err:#}"), "unreadable verify state; clearing");
                true
            }
        };
        if owned {
            self.state_file.clear()?;
        }
        Ok(())
    }

    fn release_checkpoint(&self, checkpoint: Option<&CheckpointRef>) {
        if let (Some(cp), Some(checkpoints)) = (checkpoint, &self.checkpoints) {
            checkpoints.discard(cp);
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, PendingShellVerification>> {
        self.pending.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Render the failure message shown to the agent after a failed attempt.
pub fn render_feedback(
    config: &ShellVerifyConfig,
    iteration: u32,
    max_iterations: u32,
    result: &ShellVerifyResult,
    rolled_back: bool,
) -> Result<String> {
    let mut env = Environment::new();
    env.add_template("verify_feedback", FEEDBACK_TEMPLATE)
        .context("parse verify feedback template")?;
    let error_output: String = result.error_output().chars().take(FEEDBACK_OUTPUT_CHARS).collect();
    let exit_code = result
        .exit_code
        .map_or_else(|| "none".to_string(), |code| code.to_string());
    let rendered = env.get_template("verify_feedback")?.render(context! {
        iteration => iteration,
        max_iterations => max_iterations,
        command => &config.command,
        exit_code => exit_code,
        timed_out => result.timed_out,
        error_output => error_output.trim_end(),
        rolled_back => rolled_back,
    })?;
    Ok(rendered)
}

/// One-line reminder for a session with a pending verification.
pub fn format_verify_reminder(pending: &PendingShellVerification) -> String {
    let mut line = format!(
        "[Verify] `{}` - attempt {}/{}",
        pending.config.command, pending.attempt_count, pending.max_attempts
    );
    if let Some(last) = pending.last_result() {
        line.push_str(if last.passed { " (last: passed)" } else { " (last: failed)" });
    }
    line
}

/// Input the agent host passes to the stop hook on stdin.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct StopHookInput {
    /// Set when the host is already continuing because of an earlier block.
    pub stop_hook_active: bool,
    pub session_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopDecision {
    /// Let the agent stop, optionally telling it why.
    Allow { message: Option<String> },
    /// Keep the agent working; `reason` is fed back to it.
    Block { reason: String },
}

impl StopDecision {
    /// Hook output, or `None` when a silent allow should print nothing.
    pub fn to_json(&self) -> Option<serde_json::Value> {
        match self {
            StopDecision::Allow { message: None } => None,
            StopDecision::Allow { message: Some(message) } => Some(serde_json::json!({
                "decision": null,
                "systemMessage": message,
            })),
            StopDecision::Block { reason } => Some(serde_json::json!({
                "decision": "block",
                "reason": reason,
            })),
        }
    }
}

/// Decide whether the agent may stop, running the loop's command once.
///
/// Any state-file error allows the stop: a broken hook must never trap the agent.
#[instrument(skip_all)]
pub fn evaluate_stop_hook(
    state_file: &VerifyActiveStateManager,
    verifier: &dyn CommandVerifier,
    input: &StopHookInput,
) -> StopDecision {
    match stop_hook_inner(state_file, verifier, input) {
        Ok(decision) => decision,
        Err(err) => {
            warn!(err = %format!("{err:#}"), "stop hook failed; allowing stop");
            StopDecision::Allow { message: None }
        }
    }
}

fn stop_hook_inner(
    state_file: &VerifyActiveStateManager,
    verifier: &dyn CommandVerifier,
    input: &StopHookInput,
) -> Result<StopDecision> {
    if input.stop_hook_active {
        return Ok(StopDecision::Allow { message: None });
    }
    let Some(mut active) = state_file.read()? else {
        return Ok(StopDecision::Allow { message: None });
    };

    let max_iterations = active.config.effective_max_iterations(STOP_HOOK_MAX_ITERATIONS);
    let iteration = active.state.iteration + 1;
    if iteration > max_iterations {
        state_file.clear()?;
        info!(max_iterations, "verify loop ceiling reached");
        return Ok(StopDecision::Allow {
            message: Some(format!("[Verify] Max iterations ({max_iterations}) reached. Stopping.")),
        });
    }

    let result = verifier.verify(&active.config);
    active.state.iteration = iteration;
    active.state.last_result = Some(result.clone());
    state_file.write(&active)?;

    if result.passed {
        state_file.clear()?;
        info!(iteration, "verify loop passed");
        return Ok(StopDecision::Allow {
            message: Some(format!("[Verify] PASSED on iteration {iteration}!")),
        });
    }

    let reason = render_feedback(&active.config, iteration, max_iterations, &result, false)?;
    Ok(StopDecision::Block { reason })
}
