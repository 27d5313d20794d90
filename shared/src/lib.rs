//! Shared configuration, rule, and routing types for the flow engine
//!
//! This crate contains the configuration model, the topic formatter pipeline,
//! the rule-condition expression evaluator, and the crate-wide error type used
//! by the `flowd` engine binary.

pub mod config;
pub mod error;
pub mod expr;
pub mod topic;
pub mod utils;
pub mod yaml_tags;

pub use config::{ClientSpec, FlowConfig, PoolSpec, RuleSpec, TaskQueueSpec, TaskSpec};
pub use error::{FlowError, Result};
