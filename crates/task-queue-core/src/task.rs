use crate::{CoreError, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Identifier assigned to a task by the queue service
pub type TaskId = String;

/// Task type name, the routing key used when polling
pub type TaskType = String;

/// Ordered input parameters of a task
pub type TaskInput = Map<String, Value>;

/// Task status as tracked by the queue service
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    Scheduled,
    InProgress,
    Canceled,
    Failed,
    FailedWithTerminalError,
    Completed,
    CompletedWithErrors,
    TimedOut,
    Skipped,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Scheduled => "SCHEDULED",
            TaskStatus::InProgress => "IN_PROGRESS",
            TaskStatus::Canceled => "CANCELED",
            TaskStatus::Failed => "FAILED",
            TaskStatus::FailedWithTerminalError => "FAILED_WITH_TERMINAL_ERROR",
            TaskStatus::Completed => "COMPLETED",
            TaskStatus::CompletedWithErrors => "COMPLETED_WITH_ERRORS",
            TaskStatus::TimedOut => "TIMED_OUT",
            TaskStatus::Skipped => "SKIPPED",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "SCHEDULED" => Some(TaskStatus::Scheduled),
            "IN_PROGRESS" => Some(TaskStatus::InProgress),
            "CANCELED" => Some(TaskStatus::Canceled),
            "FAILED" => Some(TaskStatus::Failed),
            "FAILED_WITH_TERMINAL_ERROR" => Some(TaskStatus::FailedWithTerminalError),
            "COMPLETED" => Some(TaskStatus::Completed),
            "COMPLETED_WITH_ERRORS" => Some(TaskStatus::CompletedWithErrors),
            "TIMED_OUT" => Some(TaskStatus::TimedOut),
            "SKIPPED" => Some(TaskStatus::Skipped),
            _ => None,
        }
    }

    /// Check if the queue service will not move the task any further
    pub fn is_terminal(&self) -> bool {
        !matches!(self, TaskStatus::Scheduled | TaskStatus::InProgress)
    }
}

/// Snapshot of one unit of work handed out by the queue service.
///
/// Only the fields a worker reads are modelled; anything else in the
/// service's JSON is ignored on deserialization.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    /// Unique task identifier
    pub task_id: TaskId,

    /// Workflow instance this task belongs to
    pub workflow_instance_id: String,

    /// Task type name (e.g., "send_email", "process_image")
    pub task_type: TaskType,

    /// Input parameters, in the order the service sent them
    #[serde(default)]
    pub input_data: TaskInput,

    /// Current status on the server side
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<TaskStatus>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reference_task_name: Option<String>,

    /// Current retry attempt number
    #[serde(default)]
    pub retry_count: u32,

    #[serde(default)]
    pub poll_count: u32,

    /// Epoch milliseconds
    #[serde(default)]
    pub scheduled_time: i64,

    /// Epoch milliseconds
    #[serde(default)]
    pub start_time: i64,

    /// Epoch milliseconds
    #[serde(default)]
    pub update_time: i64,

    #[serde(default)]
    pub response_timeout_seconds: i64,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,

    /// Domain the task was routed to, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub domain: Option<String>,

    /// Worker currently holding the task
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worker_id: Option<String>,
}

impl Task {
    /// Create a new task builder
    pub fn builder(task_id: impl Into<TaskId>, task_type: impl Into<TaskType>) -> TaskBuilder {
        TaskBuilder::new(task_id.into(), task_type.into())
    }

    /// Deserialize a task from the service's JSON representation
    pub fn from_json(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes).map_err(CoreError::from)
    }

    /// Look up a single input parameter
    pub fn input(&self, name: &str) -> Option<&Value> {
        self.input_data.get(name)
    }
}

/// Builder for tasks, mostly useful for stubs and tests since real tasks
/// come from the queue service
pub struct TaskBuilder {
    task_id: TaskId,
    task_type: TaskType,
    workflow_instance_id: String,
    input_data: TaskInput,
    status: Option<TaskStatus>,
    retry_count: u32,
    domain: Option<String>,
}

impl TaskBuilder {
    pub fn new(task_id: TaskId, task_type: TaskType) -> Self {
        TaskBuilder {
            task_id,
            task_type,
            workflow_instance_id: String::new(),
            input_data: TaskInput::new(),
            status: Some(TaskStatus::InProgress),
            retry_count: 0,
            domain: None,
        }
    }

    pub fn workflow_instance_id(mut self, workflow_instance_id: impl Into<String>) -> Self {
        self.workflow_instance_id = workflow_instance_id.into();
        self
    }

    pub fn input(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.input_data.insert(name.into(), value.into());
        self
    }

    pub fn input_data(mut self, input_data: TaskInput) -> Self {
        self.input_data = input_data;
        self
    }

    pub fn status(mut self, status: TaskStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn retry_count(mut self, retry_count: u32) -> Self {
        self.retry_count = retry_count;
        self
    }

    pub fn domain(mut self, domain: impl Into<String>) -> Self {
        self.domain = Some(domain.into());
        self
    }

    pub fn build(self) -> Task {
        Task {
            task_id: self.task_id,
            workflow_instance_id: self.workflow_instance_id,
            task_type: self.task_type,
            input_data: self.input_data,
            status: self.status,
            reference_task_name: None,
            retry_count: self.retry_count,
            poll_count: 0,
            scheduled_time: 0,
            start_time: 0,
            update_time: 0,
            response_timeout_seconds: 0,
            correlation_id: None,
            domain: self.domain,
            worker_id: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_task_from_service_json() {
        let body = json!({
            "taskId": "t-1",
            "workflowInstanceId": "wf-1",
            "taskType": "echo",
            "inputData": {"b": 2, "a": 1},
            "status": "IN_PROGRESS",
            "retryCount": 2,
            "pollCount": 1,
            "taskDefName": "echo",
            "someFieldWeIgnore": true
        });

        let task = Task::from_json(body.to_string().as_bytes()).unwrap();
        assert_eq!(task.task_id, "t-1");
        assert_eq!(task.workflow_instance_id, "wf-1");
        assert_eq!(task.task_type, "echo");
        assert_eq!(task.status, Some(TaskStatus::InProgress));
        assert_eq!(task.retry_count, 2);

        // Input order is preserved as sent
        let keys: Vec<&String> = task.input_data.keys().collect();
        assert_eq!(keys, vec!["b", "a"]);
    }

    #[test]
    fn test_missing_optional_fields() {
        let body = json!({
            "taskId": "t-2",
            "workflowInstanceId": "wf-2",
            "taskType": "noop"
        });

        let task = Task::from_json(body.to_string().as_bytes()).unwrap();
        assert!(task.input_data.is_empty());
        assert_eq!(task.status, None);
        assert_eq!(task.retry_count, 0);
    }

    #[test]
    fn test_task_builder() {
        let task = Task::builder("t-3", "echo")
            .workflow_instance_id("wf-3")
            .input("x", 21)
            .domain("blue")
            .build();

        assert_eq!(task.input("x"), Some(&json!(21)));
        assert_eq!(task.domain.as_deref(), Some("blue"));
        assert_eq!(task.status, Some(TaskStatus::InProgress));
    }

    #[test]
    fn test_status_strings() {
        for status in [
            TaskStatus::Scheduled,
            TaskStatus::InProgress,
            TaskStatus::FailedWithTerminalError,
            TaskStatus::CompletedWithErrors,
        ] {
            assert_eq!(TaskStatus::from_str(status.as_str()), Some(status));
        }
        assert_eq!(TaskStatus::from_str("bogus"), None);
        assert!(TaskStatus::Completed.is_terminal());
        assert!(!TaskStatus::Scheduled.is_terminal());
    }
}
