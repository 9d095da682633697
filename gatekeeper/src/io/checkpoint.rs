//! Stash-based checkpoints around verification attempts.
//!
//! Every failure here is downgraded to a warning: losing rollback capability
//! must not block the primary pass/fail signal.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::core::clock::Clock;
use crate::io::git::Git;

const CHECKPOINT_PREFIX: &str = "gatekeeper-checkpoint";

/// Reference to a saved pre-attempt state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckpointRef {
    /// Stash message used to locate the checkpoint later.
    pub name: String,
    /// Stash commit written by `git stash create`; `None` for a clean tree.
    pub stash_ref: Option<String>,
    /// HEAD when the checkpoint was taken.
    pub head: String,
    pub created_at_ms: u64,
    /// Tracked files with changes at checkpoint time.
    pub file_count: usize,
}

impl CheckpointRef {
    pub fn has_stash(&self) -> bool {
        self.stash_ref.is_some()
    }
}

pub struct GitCheckpoint {
    git: Git,
    clock: Arc<dyn Clock>,
}

impl GitCheckpoint {
    pub fn new(git: Git, clock: Arc<dyn Clock>) -> Self {
        Self { git, clock }
    }

    pub fn git(&self) -> &Git {
        &self.git
    }

    /// Save tracked changes under a timestamped name. The worktree is untouched.
    pub fn create(&self, label: &str) -> Option<CheckpointRef> {
        let now = self.clock.now_ms();
        let name = format!("{CHECKPOINT_PREFIX}-{}-{now}", sanitize_label(label));

        let result = (|| -> anyhow::Result<CheckpointRef> {
            let file_count = self.git.tracked_change_count()?;
            let head = self.git.head_sha()?;
            let stash_ref = self.git.stash_create()?;
            if let Some(sha) = &stash_ref {
                self.git.stash_store(sha, &name)?;
            }
            Ok(CheckpointRef {
                name: name.clone(),
                stash_ref,
                head,
                created_at_ms: now,
                file_count,
            })
        })();

        match result {
            Ok(checkpoint) => {
                debug!(name = %checkpoint.name, files = checkpoint.file_count, "checkpoint created");
                Some(checkpoint)
            }
            Err(err) => {
                warn!(err = %format!("{err:#}"), "checkpoint creation failed; continuing without rollback");
                None
            }
        }
    }

    /// Restore the pre-attempt state of tracked files. Returns `true` on success.
    pub fn rollback(&self, checkpoint: &CheckpointRef) -> bool {
        let result = (|| -> anyhow::Result<()> {
            self.git.reset_hard()?;
            if checkpoint.has_stash() {
                let entry = self
                    .git
                    .find_stash(&checkpoint.name)?
                    .ok_or_else(|| anyhow::anyhow!("checkpoint stash '{}' not found", checkpoint.name))?;
                self.git.stash_pop(&entry.selector)?;
            }
            Ok(())
        })();

        match result {
            Ok(()) => {
                info!(name = %checkpoint.name, "rolled back to checkpoint");
                true
            }
            Err(err) => {
                warn!(name = %checkpoint.name, err = %format!("{err:#}"), "rollback failed");
                false
            }
        }
    }

    /// Drop a checkpoint without applying it. Returns `true` on success.
    pub fn discard(&self, checkpoint: &CheckpointRef) -> bool {
        if !checkpoint.has_stash() {
            return true;
        }
        let result = (|| -> anyhow::Result<bool> {
            match self.git.find_stash(&checkpoint.name)? {
                Some(entry) => {
                    self.git.stash_drop(&entry.selector)?;
                    Ok(true)
                }
                None => Ok(false),
            }
        })();

        match result {
            Ok(found) => {
                debug!(name = %checkpoint.name, found, "checkpoint discarded");
                true
            }
            Err(err) => {
                warn!(name = %checkpoint.name, err = %format!("{err:#}"), "checkpoint discard failed");
                false
            }
        }
    }
}

fn sanitize_label(label: &str) -> String {
    let cleaned: String = label
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect();
    if cleaned.is_empty() {
        "attempt".to_string()
    } else {
        cleaned
    }
}
