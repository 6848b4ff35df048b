use crate::error::HandlerError;
use crate::handler::Handler;
use std::any::Any;
use task_queue_core::{Task, TaskResult};
use tracing::instrument::WithSubscriber;
use tracing::{debug, error, warn};

/// Runs a handler against a task and turns every outcome into a result
#[derive(Debug, Clone)]
pub struct TaskExecutor {
    handler: Handler,
}

impl TaskExecutor {
    pub fn new(handler: Handler) -> Self {
        TaskExecutor { handler }
    }

    pub fn handler(&self) -> &Handler {
        &self.handler
    }

    /// Execute a task with panic recovery.
    ///
    /// The handler runs in its own tokio task so a panic unwinds there and
    /// comes back as a `JoinError`. Nothing escapes this call.
    pub async fn execute(&self, task: &Task) -> TaskResult {
        let handler = self.handler.clone();
        let owned = task.clone();

        let joined = tokio::spawn(
            async move { handler.invoke(&owned).await }.with_current_subscriber(),
        )
        .await;

        match joined {
            Ok(Ok(output)) => {
                debug!("Task {} handled", task.task_id);
                output.into_task_result(task)
            }
            Ok(Err(HandlerError::NonRetryable(reason))) => {
                warn!("Task {} failed terminally: {}", task.task_id, reason);
                TaskResult::for_task(task).failed_with_terminal_error(reason)
            }
            Ok(Err(HandlerError::Failed(reason))) => {
                warn!("Task {} failed: {}", task.task_id, reason);
                TaskResult::for_task(task).failed(reason)
            }
            Err(e) if e.is_panic() => {
                let reason = panic_message(e.into_panic());
                error!("Task {} panicked: {}", task.task_id, reason);
                TaskResult::for_task(task).failed(reason)
            }
            Err(e) => {
                error!("Task {} was cancelled", task.task_id);
                TaskResult::for_task(task).failed(e.to_string())
            }
        }
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "Handler panicked".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::Inputs;
    use task_queue_core::TaskResultStatus;

    fn task() -> Task {
        Task::builder("t-9", "charge")
            .workflow_instance_id("wf-9")
            .input("amount", 10)
            .build()
    }

    #[tokio::test]
    async fn test_terminal_error_mapping() {
        let executor = TaskExecutor::new(Handler::fields(["amount"], |_: Inputs| {
            Err::<(), _>(HandlerError::terminal("card declined"))
        }));

        let result = executor.execute(&task()).await;
        assert_eq!(result.status, TaskResultStatus::FailedWithTerminalError);
        assert_eq!(result.reason_for_incompletion.as_deref(), Some("card declined"));
        assert_eq!(result.task_id, "t-9");
        assert_eq!(result.workflow_instance_id, "wf-9");
    }

    #[tokio::test]
    async fn test_transient_error_mapping() {
        let executor = TaskExecutor::new(Handler::task_fn(|_: &Task| {
            Err(anyhow::anyhow!("gateway timeout").into())
        }));

        let result = executor.execute(&task()).await;
        assert_eq!(result.status, TaskResultStatus::Failed);
        assert_eq!(result.reason_for_incompletion.as_deref(), Some("gateway timeout"));
    }

    #[tokio::test]
    async fn test_panic_is_contained() {
        let executor = TaskExecutor::new(Handler::task_fn(
            |_: &Task| -> Result<TaskResult, HandlerError> { panic!("boom") },
        ));

        let result = executor.execute(&task()).await;
        assert_eq!(result.status, TaskResultStatus::Failed);
        assert_eq!(result.reason_for_incompletion.as_deref(), Some("boom"));
    }

    #[test]
    fn test_panic_message_formats() {
        assert_eq!(panic_message(Box::new("static")), "static");
        assert_eq!(panic_message(Box::new(String::from("owned"))), "owned");
        assert_eq!(panic_message(Box::new(7_u8)), "Handler panicked");
    }
}
