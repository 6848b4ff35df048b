mod http_client;
mod settings;

pub use http_client::TaskQueueHttpClient;
pub use settings::ClientSettings;

use async_trait::async_trait;
use task_queue_core::{Task, TaskResult};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ClientError {
    #[error("Transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("API error (status {status}): {body}")]
    Api { status: u16, body: String },

    #[error("Authentication failed: {0}")]
    Authentication(String),

    #[error("Invalid server URL: {0}")]
    InvalidUrl(String),

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),
}

pub type Result<T> = std::result::Result<T, ClientError>;

/// The remote task queue service as seen by a task runner.
///
/// Implementations are used from a single runner at a time; a call either
/// returns or fails, there is no retry inside a call.
#[async_trait]
pub trait TaskQueueService: Send + Sync {
    /// Fetch the next task of `task_type`, or `None` if there is nothing to do
    async fn poll(
        &self,
        task_type: &str,
        worker_id: Option<&str>,
        domain: Option<&str>,
    ) -> Result<Option<Task>>;

    /// Report the outcome of a task
    async fn update(&self, result: &TaskResult) -> Result<String>;
}
