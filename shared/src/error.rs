//! Crate-wide error type for the flow engine.

/// Result type alias used throughout the engine.
pub type Result<T> = anyhow::Result<T>;

/// Error kinds surfaced by the flow engine, per the error-handling design.
///
/// Configuration and task-resolution errors are fatal and raised at orchestrator
/// construction; the rest are caught and logged by the owning consumer loop and
/// never propagate upward (see the propagation policy).
#[derive(Debug, thiserror::Error)]
pub enum FlowError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("task '{0}' could not be resolved in the task registry")]
    UnknownTask(String),

    #[error("persistence unavailable: {0}")]
    Persistence(String),

    #[error("network error: {0}")]
    Network(String),

    #[error("task execution error: {0}")]
    TaskExecution(String),
}
