pub mod conditions;
pub mod decision;
pub mod hierarchy;
pub mod overrides;
pub mod types;
