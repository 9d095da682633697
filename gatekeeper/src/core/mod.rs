//! Deterministic logic shared by the gatekeeper services.
//!
//! Core modules perform no I/O. Time enters only through [`clock::Clock`].

pub mod clock;
pub mod enforcement;
pub mod types;
pub mod verdict;
