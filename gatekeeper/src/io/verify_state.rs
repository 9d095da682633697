//! On-disk mirror of an active autonomous verification loop.
//!
//! The loop driver writes this file before every attempt; the stop hook reads it
//! to decide whether the agent may stop. It is removed on pass, exhaustion, or
//! abort.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::io::checkpoint::CheckpointRef;
use crate::io::shell_verify::{ShellVerifyConfig, ShellVerifyResult};

/// Default state file location, relative to the runtime root.
pub const DEFAULT_STATE_PATH: &str = "runtime-state/verify-active.json";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VerifyActiveState {
    pub session_id: String,
    pub config: ShellVerifyConfig,
    pub state: LoopState,
}

/// Mutable part of the loop state.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoopState {
    /// Attempts completed so far.
    #[serde(default)]
    pub iteration: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_result: Option<ShellVerifyResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checkpoint: Option<CheckpointRef>,
    /// Epoch milliseconds when the loop began.
    #[serde(default)]
    pub started_at: u64,
}

#[derive(Debug, Clone)]
pub struct VerifyActiveStateManager {
    path: PathBuf,
}

impl VerifyActiveStateManager {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Manager for `<root>/runtime-state/verify-active.json`.
    pub fn under(root: &Path) -> Self {
        Self::new(root.join(DEFAULT_STATE_PATH))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn write(&self, state: &VerifyActiveState) -> Result<()> {
        debug!(
            path = %self.path.display(),
            session_id = %state.session_id,
            iteration = state.state.iteration,
            "writing verify state"
        );
        let mut buf = serde_json::to_string_pretty(state)?;
        buf.push('\n');
        write_atomic(&self.path, &buf)
    }

    /// `Ok(None)` when no loop is active.
    pub fn read(&self) -> Result<Option<VerifyActiveState>> {
        let contents = match fs::read_to_string(&self.path) {
            Ok(contents) => contents,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
            Err(err) => {
                return Err(err).with_context(|| format!("read verify state {}", self.path.display()));
            }
        };
        let state = serde_json::from_str(&contents)
            .with_context(|| format!("parse verify state {}", self.path.display()))?;
        Ok(Some(state))
    }

    /// Remove the state file. Missing files are fine.
    pub fn clear(&self) -> Result<()> {
        match fs::remove_file(&self.path) {
            Ok(()) => {
                debug!(path = %self.path.display(), "verify state cleared");
                Ok(())
            }
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err).with_context(|| format!("remove verify state {}", self.path.display())),
        }
    }

    pub fn is_active(&self) -> bool {
        self.path.exists()
    }
}

fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("verify state path missing parent {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let tmp_path = path.with_extension("json.tmp");
    fs::write(&tmp_path, contents)
        .with_context(|| format!("write temp verify state {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace verify state {}", path.display()))?;
    Ok(())
}
