use thiserror::Error;

/// Errors returned to callers submitting work.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum EngineError {
    #[error("no handler registered for task kind {0}")]
    NoHandler(String),
    #[error("task engine is shut down")]
    ShutDown,
    #[error("task submission cancelled")]
    Cancelled,
}

/// Failure reported by a task handler. Logged and counted, never propagated.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TaskError {
    #[error("{0}")]
    Failed(String),
    #[error("task cancelled")]
    Cancelled,
    #[error("handler panicked: {0}")]
    Panicked(String),
}

impl TaskError {
    pub fn failed(message: impl std::fmt::Display) -> Self {
        Self::Failed(message.to_string())
    }
}
