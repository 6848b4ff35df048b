use std::path::PathBuf;
use thiserror::Error;

/// Failure raised by handler code.
///
/// The variant decides how the task is reported: `NonRetryable` tells the
/// service not to retry (`FAILED_WITH_TERMINAL_ERROR`), `Failed` leaves
/// retries up to the service's own policy (`FAILED`).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HandlerError {
    #[error("{0}")]
    NonRetryable(String),

    #[error("{0}")]
    Failed(String),
}

impl HandlerError {
    /// Terminal failure: the task must not be retried
    pub fn terminal(reason: impl Into<String>) -> Self {
        HandlerError::NonRetryable(reason.into())
    }

    /// Transient failure: the service may retry the task
    pub fn failed(reason: impl Into<String>) -> Self {
        HandlerError::Failed(reason.into())
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, HandlerError::NonRetryable(_))
    }

    pub fn reason(&self) -> &str {
        match self {
            HandlerError::NonRetryable(reason) | HandlerError::Failed(reason) => reason,
        }
    }
}

impl From<anyhow::Error> for HandlerError {
    fn from(e: anyhow::Error) -> Self {
        HandlerError::Failed(e.to_string())
    }
}

impl From<serde_json::Error> for HandlerError {
    fn from(e: serde_json::Error) -> Self {
        HandlerError::Failed(e.to_string())
    }
}

impl From<String> for HandlerError {
    fn from(reason: String) -> Self {
        HandlerError::Failed(reason)
    }
}

impl From<&str> for HandlerError {
    fn from(reason: &str) -> Self {
        HandlerError::Failed(reason.to_string())
    }
}

/// Errors from building and running the worker fleet
#[derive(Error, Debug)]
pub enum WorkerError {
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("Client error: {0}")]
    Client(#[from] task_queue_client::ClientError),

    #[error("Invalid worker: {0}")]
    InvalidWorker(String),

    #[error("Failed to spawn process {name}: {source}")]
    Spawn {
        name: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid child process spec: {0}")]
    ChildSpec(String),

    #[error("Log socket {path:?}: {source}")]
    LogSocket {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Log channel error: {0}")]
    Protocol(#[from] task_queue_protocol::ProtocolError),

    #[error("Metrics error: {0}")]
    Metrics(#[from] prometheus::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, WorkerError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handler_error_kinds() {
        let terminal = HandlerError::terminal("invalid account");
        assert!(terminal.is_terminal());
        assert_eq!(terminal.reason(), "invalid account");

        let transient: HandlerError = anyhow::anyhow!("connection reset").into();
        assert!(!transient.is_terminal());
        assert_eq!(transient.reason(), "connection reset");
    }
}
