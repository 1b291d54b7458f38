//! Error types for habitat-core.

use thiserror::Error;

/// Habitat error type.
#[derive(Error, Debug)]
pub enum Error {
    /// Position not found
    #[error("position not found: {id}")]
    PositionNotFound { id: String },

    /// Program definition not found for an existing position
    #[error("program not found: {id}")]
    ProgramNotFound { id: String },

    /// Task not found
    #[error("task not found: {id}")]
    TaskNotFound { id: String },

    /// Invalid concurrency limit
    #[error("concurrency limit must be at least 1, got {0}")]
    InvalidLimit(usize),

    /// Execution was cancelled (timeout or shutdown)
    #[error("execution cancelled for task {id}")]
    Cancelled { id: String },

    /// External executor reported a failure
    #[error("execution failed: {0}")]
    Execution(String),

    /// Route predicate or transform could not be evaluated
    #[error("route evaluation failed: {0}")]
    Route(String),

    /// Event handler failure
    #[error("event handler failed: {0}")]
    Handler(String),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Validation error
    #[error("validation error: {0}")]
    Validation(String),

    /// IO error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// YAML serialization error
    #[error("yaml error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

impl From<eyre::Report> for Error {
    fn from(e: eyre::Report) -> Self {
        Error::Config(e.to_string())
    }
}

/// Result type alias for habitat-core.
pub type Result<T> = std::result::Result<T, Error>;
