mod task;
mod result;
mod error;

pub use task::{Task, TaskId, TaskType, TaskInput, TaskStatus};
pub use result::{TaskResult, TaskResultStatus, TaskExecLog, TaskOutput};
pub use error::{CoreError, Result};

/// Polling interval used when neither the worker nor the override file sets one
pub const DEFAULT_POLLING_INTERVAL_MS: u64 = 100;
