//! Gate loading, evaluation, and the ephemeral gate registry.

pub mod provider;
pub mod self_check;
pub mod temporary;
pub mod validator;
