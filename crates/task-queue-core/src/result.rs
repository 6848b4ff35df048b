use crate::{Task, TaskId};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Output parameters reported back with a result
pub type TaskOutput = Map<String, Value>;

/// Status a worker may report for a task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskResultStatus {
    /// Worker needs to be called back later
    InProgress,
    /// Task completed successfully
    Completed,
    /// Task failed (the service may retry)
    Failed,
    /// Task failed and must not be retried
    FailedWithTerminalError,
}

impl TaskResultStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskResultStatus::InProgress => "IN_PROGRESS",
            TaskResultStatus::Completed => "COMPLETED",
            TaskResultStatus::Failed => "FAILED",
            TaskResultStatus::FailedWithTerminalError => "FAILED_WITH_TERMINAL_ERROR",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "IN_PROGRESS" => Some(TaskResultStatus::InProgress),
            "COMPLETED" => Some(TaskResultStatus::Completed),
            "FAILED" => Some(TaskResultStatus::Failed),
            "FAILED_WITH_TERMINAL_ERROR" => Some(TaskResultStatus::FailedWithTerminalError),
            _ => None,
        }
    }

    pub fn is_failure(&self) -> bool {
        matches!(
            self,
            TaskResultStatus::Failed | TaskResultStatus::FailedWithTerminalError
        )
    }
}

/// A log line attached to a task result
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskExecLog {
    pub log: String,
    pub task_id: TaskId,
    /// Epoch milliseconds
    pub created_time: i64,
}

/// Outcome of executing a task, sent once to the queue service
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskResult {
    pub task_id: TaskId,

    pub workflow_instance_id: String,

    pub status: TaskResultStatus,

    #[serde(default)]
    pub output_data: TaskOutput,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason_for_incompletion: Option<String>,

    /// Identity of the worker that produced this result
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worker_id: Option<String>,

    /// Only meaningful together with `IN_PROGRESS`
    #[serde(default)]
    pub callback_after_seconds: u64,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub logs: Vec<TaskExecLog>,
}

impl TaskResult {
    /// Create an `IN_PROGRESS` result with no output
    pub fn new(task_id: impl Into<TaskId>, workflow_instance_id: impl Into<String>) -> Self {
        TaskResult {
            task_id: task_id.into(),
            workflow_instance_id: workflow_instance_id.into(),
            status: TaskResultStatus::InProgress,
            output_data: TaskOutput::new(),
            reason_for_incompletion: None,
            worker_id: None,
            callback_after_seconds: 0,
            logs: Vec::new(),
        }
    }

    /// Create a result addressed to the given task
    pub fn for_task(task: &Task) -> Self {
        Self::new(task.task_id.clone(), task.workflow_instance_id.clone())
    }

    /// Create a result not yet addressed to any task; the worker stamps the
    /// task and workflow ids before reporting it
    pub fn unaddressed() -> Self {
        Self::new(String::new(), String::new())
    }

    pub fn complete(mut self) -> Self {
        self.status = TaskResultStatus::Completed;
        self
    }

    pub fn failed(mut self, reason: impl Into<String>) -> Self {
        self.status = TaskResultStatus::Failed;
        self.reason_for_incompletion = Some(reason.into());
        self
    }

    pub fn failed_with_terminal_error(mut self, reason: impl Into<String>) -> Self {
        self.status = TaskResultStatus::FailedWithTerminalError;
        self.reason_for_incompletion = Some(reason.into());
        self
    }

    pub fn in_progress(mut self, callback_after_seconds: u64) -> Self {
        self.status = TaskResultStatus::InProgress;
        self.callback_after_seconds = callback_after_seconds;
        self
    }

    pub fn with_output(mut self, output_data: TaskOutput) -> Self {
        self.output_data = output_data;
        self
    }

    pub fn add_output_data(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.output_data.insert(key.into(), value.into());
    }

    /// Append an execution log line for this task
    pub fn log(&mut self, message: impl Into<String>) {
        self.logs.push(TaskExecLog {
            log: message.into(),
            task_id: self.task_id.clone(),
            created_time: Utc::now().timestamp_millis(),
        });
    }

    /// Fill in the task/workflow ids if the producer left them empty
    pub fn stamp(&mut self, task: &Task) {
        if self.task_id.is_empty() {
            self.task_id = task.task_id.clone();
        }
        if self.workflow_instance_id.is_empty() {
            self.workflow_instance_id = task.workflow_instance_id.clone();
        }
        for log in self.logs.iter_mut().filter(|log| log.task_id.is_empty()) {
            log.task_id = self.task_id.clone();
        }
    }
}
