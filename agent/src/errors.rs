//! Error types for confdeploy

use std::time::Duration;

use thiserror::Error;

/// Main error type for deployment, backup and command-channel operations
#[derive(Error, Debug)]
pub enum DeployError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    YamlError(#[from] serde_yaml::Error),

    #[error("Validation error: {0}")]
    ValidationError(String),

    #[error("Duplicate task: {0} is already queued or in progress")]
    DuplicateTask(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Connection error on '{connection}': {message}")]
    Connection { connection: String, message: String },

    #[error("Command '{operation}' failed with exit code {exit_code}: {stderr}")]
    CommandExecution {
        operation: String,
        exit_code: i32,
        stderr: String,
    },

    #[error("Command '{operation}' timed out after {timeout:?}")]
    Timeout { operation: String, timeout: Duration },

    #[error("Integrity error: {0}")]
    Integrity(String),

    #[error("Capacity error: queue is full ({max_size} tasks)")]
    Capacity { max_size: usize },

    #[error("Permission error: {0}")]
    Permission(String),

    #[error("Unknown operation: {0}")]
    UnknownOperation(String),

    #[error("Retries exhausted for {id} after {attempts} attempts")]
    RetriesExhausted { id: String, attempts: u32 },

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Server error: {0}")]
    ServerError(String),

    #[error("Shutdown error: {0}")]
    ShutdownError(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl DeployError {
    /// Errors that the coordinator's health checks can recover from on their own
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            DeployError::Connection { .. } | DeployError::Timeout { .. }
        )
    }

    /// Short machine-readable kind, used in reports and API responses
    pub fn kind(&self) -> &'static str {
        match self {
            DeployError::IoError(_) => "io",
            DeployError::JsonError(_) => "json",
            DeployError::YamlError(_) => "yaml",
            DeployError::ValidationError(_) => "validation",
            DeployError::DuplicateTask(_) => "duplicate_task",
            DeployError::NotFound(_) => "not_found",
            DeployError::Connection { .. } => "connection",
            DeployError::CommandExecution { .. } => "command_execution",
            DeployError::Timeout { .. } => "timeout",
            DeployError::Integrity(_) => "integrity",
            DeployError::Capacity { .. } => "capacity",
            DeployError::Permission(_) => "permission",
            DeployError::UnknownOperation(_) => "unknown_operation",
            DeployError::RetriesExhausted { .. } => "retries_exhausted",
            DeployError::ConfigError(_) => "config",
            DeployError::ServerError(_) => "server",
            DeployError::ShutdownError(_) => "shutdown",
            DeployError::Internal(_) => "internal",
        }
    }
}

impl From<tokio::task::JoinError> for DeployError {
    fn from(err: tokio::task::JoinError) -> Self {
        DeployError::Internal(format!("background task failed: {}", err))
    }
}
