//! Git adapter used by verification checkpoints.
//!
//! Checkpoints only ever touch tracked files, so every operation here is a thin,
//! explicit wrapper around a `git` subprocess call.

use std::path::{Path, PathBuf};
use std::process::{Command, Output};

use anyhow::{Context, Result, anyhow};
use tracing::{debug, instrument};

/// Parsed `git status --porcelain` entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusEntry {
    /// 2-letter XY code, or "??" for untracked.
    pub code: String,
    /// Path for the changed file.
    pub path: String,
}

impl StatusEntry {
    pub fn is_untracked(&self) -> bool {
        self.code == "??"
    }
}

/// Parsed `git stash list` entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StashEntry {
    /// Reflog selector, e.g. `stash@{0}`.
    pub selector: String,
    /// Stash message (without the `On <branch>:` prefix).
    pub message: String,
}

/// Wrapper for executing git commands in a working directory.
#[derive(Debug, Clone)]
pub struct Git {
    workdir: PathBuf,
}

impl Git {
    pub fn new(workdir: impl Into<PathBuf>) -> Self {
        Self {
            workdir: workdir.into(),
        }
    }

    pub fn workdir(&self) -> &Path {
        &self.workdir
    }

    /// True if `workdir` is inside a git work tree.
    pub fn is_repository(&self) -> bool {
        self.run(&["rev-parse", "--is-inside-work-tree"])
            .map(|out| out.status.success())
            .unwrap_or(false)
    }

    /// Get status entries (including untracked) in porcelain format.
    pub fn status_porcelain(&self) -> Result<Vec<StatusEntry>> {
        let out = self.run_capture(&["status", "--porcelain=v1", "-uall"])?;
        let mut entries = Vec::new();
        for line in out.lines() {
            if line.trim().is_empty() {
                continue;
            }
            entries.push(parse_status_line(line)?);
        }
        Ok(entries)
    }

    /// Count tracked files with uncommitted changes.
    pub fn tracked_change_count(&self) -> Result<usize> {
        Ok(self
            .status_porcelain()?
            .iter()
            .filter(|entry| !entry.is_untracked())
            .count())
    }

    /// Create a stash commit for tracked changes without touching the worktree.
    ///
    /// Returns `None` when there is nothing to stash.
    #[instrument(skip_all)]
    pub fn stash_create(&self) -> Result<Option<String>> {
        let out = self.run_capture(&["stash", "create"])?;
        let sha = out.trim();
        if sha.is_empty() {
            debug!("no tracked changes to stash");
            return Ok(None);
        }
        Ok(Some(sha.to_string()))
    }

    /// Record a stash commit in the stash reflog under `message`.
    pub fn stash_store(&self, sha: &str, message: &str) -> Result<()> {
        self.run_checked(&["stash", "store", "-m", message, sha])?;
        Ok(())
    }

    pub fn stash_list(&self) -> Result<Vec<StashEntry>> {
        let out = self.run_capture(&["stash", "list"])?;
        Ok(out.lines().filter_map(parse_stash_line).collect())
    }

    /// Find the stash whose message ends with `name`.
    pub fn find_stash(&self, name: &str) -> Result<Option<StashEntry>> {
        Ok(self
            .stash_list()?
            .into_iter()
            .find(|entry| entry.message == name || entry.message.ends_with(name)))
    }

    #[instrument(skip_all, fields(selector))]
    pub fn stash_pop(&self, selector: &str) -> Result<()> {
        debug!(selector, "popping stash");
        self.run_checked(&["stash", "pop", "--index", selector])?;
        Ok(())
    }

    pub fn stash_drop(&self, selector: &str) -> Result<()> {
        self.run_checked(&["stash", "drop", selector])?;
        Ok(())
    }

    /// Discard tracked modifications (untracked files are left alone).
    #[instrument(skip_all)]
    pub fn reset_hard(&self) -> Result<()> {
        self.run_checked(&["reset", "--hard", "--quiet"])?;
        Ok(())
    }

    pub fn head_sha(&self) -> Result<String> {
        Ok(self.run_capture(&["rev-parse", "HEAD"])?.trim().to_string())
    }

    fn run_capture(&self, args: &[&str]) -> Result<String> {
        let output = self.run_checked(args)?;
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }

    fn run_checked(&self, args: &[&str]) -> Result<Output> {
        let output = self.run(args)?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(anyhow!("git {} failed: {}", args.join(" "), stderr.trim()));
        }
        Ok(output)
    }

    fn run(&self, args: &[&str]) -> Result<Output> {
        Command::new("git")
            .args(args)
            .current_dir(&self.workdir)
            .output()
            .with_context(|| format!("spawn git {}", args.join(" ")))
    }
}

fn parse_status_line(line: &str) -> Result<StatusEntry> {
    if let Some(path) = line.strip_prefix("?? ") {
        return Ok(StatusEntry {
            code: "??".to_string(),
            path: path.trim().to_string(),
        });
    }
    if line.len() < 4 {
        return Err(anyhow!("unexpected porcelain line: '{line}'"));
    }
    let code = line[..2].to_string();
    let mut path = line[3..].trim().to_string();
    if let Some((_, new)) = path.split_once("->") {
        path = new.trim().to_string();
    }
    Ok(StatusEntry { code, path })
}

/// Parse `stash@{0}: On main: message` (or `WIP on ...`, or a bare message).
fn parse_stash_line(line: &str) -> Option<StashEntry> {
    let (selector, rest) = line.split_once(": ")?;
    if !selector.starts_with("stash@{") {
        return None;
    }
    let message = match rest.split_once(": ") {
        Some((prefix, msg)) if prefix.starts_with("On ") || prefix.starts_with("WIP on ") => msg,
        _ => rest,
    };
    Some(StashEntry {
        selector: selector.to_string(),
        message: message.trim().to_string(),
    })
}
