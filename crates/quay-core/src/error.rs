//! Error types for Quay

use thiserror::Error;

/// Failures surfaced by the deployment engine, grouped by phase
#[derive(Error, Debug)]
pub enum QuayError {
    #[error("Materialization failed: {0}")]
    Materialize(String),

    #[error("Unsupported source host: {0}")]
    UnsupportedHost(String),

    #[error("Fix failed: {0}")]
    Fix(String),

    #[error("Command `{command}` exited with code {code}")]
    CommandFailed { command: String, code: i32 },

    #[error("Publish failed: {0}")]
    Publish(String),

    #[error("Invalid project: {0}")]
    InvalidProject(String),

    #[error("Job not found: {0}")]
    JobNotFound(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, QuayError>;
