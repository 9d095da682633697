//! Side-effecting helpers: processes, git, and on-disk state.

pub mod checkpoint;
pub mod config;
pub mod git;
pub mod process;
pub mod shell_verify;
pub mod verify_state;
