use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use task_queue_core::{Task, TaskResult};
use task_queue_worker::{
    Handler, HandlerError, Inputs, TaskFunction, TaskHandler, Worker, WorkerSettings,
};

/// Custom task handler for processing images; sees the whole task
struct ImageProcessor;

#[async_trait]
impl TaskFunction for ImageProcessor {
    async fn execute(&self, task: &Task) -> Result<TaskResult, HandlerError> {
        #[derive(Deserialize)]
        struct ImageTask {
            url: String,
            operations: Vec<String>,
        }

        let input: ImageTask =
            serde_json::from_value(serde_json::Value::Object(task.input_data.clone()))
                .map_err(|e| HandlerError::terminal(format!("Invalid task input: {}", e)))?;

        tracing::info!("Processing image {} with {:?}", input.url, input.operations);

        // Simulate image processing
        tokio::time::sleep(Duration::from_secs(2)).await;

        #[derive(Serialize)]
        struct ImageResult {
            processed_url: String,
            size_kb: u64,
        }

        let output = ImageResult {
            processed_url: format!("{}/processed", input.url),
            size_kb: 256,
        };

        let mut result = TaskResult::for_task(task).complete();
        result.add_output_data("image", serde_json::to_value(output)?);
        result.log(format!("Applied {} operation(s)", input.operations.len()));
        Ok(result)
    }
}

/// Custom task handler for sending notifications; receives only the
/// named inputs
fn notification_handler() -> Handler {
    Handler::fields_async(["user_id", "message", "channel"], |inputs: Inputs| async move {
        let user_id: String = inputs.require("user_id")?;
        let message: String = inputs.require("message")?;
        let channel: String = inputs.get_as("channel")?.unwrap_or_else(|| "email".to_string());

        tracing::info!("Sending {} notification to user {}: {}", channel, user_id, message);

        // Simulate notification sending
        tokio::time::sleep(Duration::from_millis(500)).await;

        Ok(serde_json::json!({ "delivered": true, "channel": channel }))
    })
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let settings = WorkerSettings::load(None)?;

    if !task_queue_worker::is_child_process() {
        tracing_subscriber::fmt::init();
    }

    let image = Worker::builder("process_image")
        .handler(Handler::full_task(ImageProcessor))
        .polling_interval(Duration::from_millis(250))
        .build()?;
    let notify = Worker::builder("send_notification")
        .task_name("send_reminder")
        .handler(notification_handler())
        .build()?;

    let mut handler = TaskHandler::new(vec![image, notify], &settings, false)?;

    println!("Starting custom worker for:");
    for task_type in handler.task_names() {
        println!("  - {}", task_type);
    }

    handler.start().await?;
    handler.join().await?;
    handler.stop().await;

    Ok(())
}
