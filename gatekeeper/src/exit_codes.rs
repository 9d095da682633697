//! Stable exit codes for gatekeeper CLI commands.

/// Command succeeded; verification or validation passed.
pub const OK: i32 = 0;
/// Invalid input, configuration, or an unexpected error.
pub const INVALID: i32 = 1;
/// A verification command or gate failed.
pub const GATE_FAILED: i32 = 2;
