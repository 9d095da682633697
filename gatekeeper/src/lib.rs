//! Quality-control plane for multi-step prompt execution.
//!
//! Before each step, [`injection`] decides which supplementary guidance to
//! inject. After each step, [`gates`] evaluates the output against quality
//! gates, [`core::enforcement`] tracks verdicts and retries per session, and
//! [`verify_loop`] drives ground-truth shell verification until it passes or
//! runs out of attempts.
//!
//! - **[`core`]**: pure logic (types, verdict parsing, enforcement state).
//! - **[`io`]**: processes, git checkpoints, config, and on-disk loop state.

pub mod core;
pub mod exit_codes;
pub mod gates;
pub mod injection;
pub mod io;
pub mod logging;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
pub mod verify_loop;
