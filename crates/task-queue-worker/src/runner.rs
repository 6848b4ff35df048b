use crate::metrics::RunnerMetrics;
use crate::worker::Worker;
use std::sync::Arc;
use std::time::Instant;
use task_queue_client::TaskQueueService;
use task_queue_core::TaskResult;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Drives one worker through the poll, execute, report, pace loop
pub struct TaskRunner {
    worker: Arc<Worker>,
    client: Arc<dyn TaskQueueService>,
    metrics: Option<RunnerMetrics>,
}

impl TaskRunner {
    pub fn new(worker: Arc<Worker>, client: Arc<dyn TaskQueueService>) -> Self {
        TaskRunner {
            worker,
            client,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: RunnerMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn worker(&self) -> &Worker {
        &self.worker
    }

    /// Loop until `shutdown` is cancelled. An in-flight iteration is
    /// abandoned at its next await point.
    pub async fn run(&self, shutdown: CancellationToken) {
        info!(
            "Polling for {:?} as {}",
            self.worker.task_names(),
            self.worker.identity()
        );

        loop {
            tokio::select! {
                _ = self.run_once() => {}
                _ = shutdown.cancelled() => break,
            }
        }

        if let Some(metrics) = &self.metrics {
            if let Err(e) = metrics.flush() {
                warn!("Failed to write final metrics: {}", e);
            }
        }
        info!("Stopped polling for {:?}", self.worker.task_names());
    }

    /// One iteration: poll the next task type, execute and report what came
    /// back, then sleep for that type's polling interval.
    ///
    /// Returns the result produced this iteration, whether or not it was
    /// reported successfully. Poll failures yield `None`.
    pub async fn run_once(&self) -> Option<TaskResult> {
        let task_type = self.worker.task_definition_name().to_string();
        let result = self.poll_and_execute(&task_type).await;

        if let Some(metrics) = &self.metrics {
            metrics.flush_if_due();
        }

        tokio::time::sleep(self.worker.polling_interval_for(&task_type)).await;
        result
    }

    async fn poll_and_execute(&self, task_type: &str) -> Option<TaskResult> {
        let domain = self.worker.domain_for(task_type);

        let started = Instant::now();
        let polled = self
            .client
            .poll(task_type, Some(self.worker.identity()), domain.as_deref())
            .await;
        if let Some(metrics) = &self.metrics {
            metrics.record_poll(task_type, started.elapsed(), polled.is_ok());
        }

        let task = match polled {
            Ok(Some(task)) => task,
            Ok(None) => return None,
            Err(e) => {
                warn!("Failed to poll for {}: {}", task_type, e);
                return None;
            }
        };
        debug!("Polled task {} of type {}", task.task_id, task_type);

        let started = Instant::now();
        let result = self.worker.execute(&task).await;
        if let Some(metrics) = &self.metrics {
            metrics.record_execute(task_type, started.elapsed(), result.status);
        }
        debug!(
            "Task {} finished with {}",
            task.task_id,
            result.status.as_str()
        );

        if let Err(e) = self.client.update(&result).await {
            warn!(
                "Failed to report result of task {}, dropping it: {}",
                result.task_id, e
            );
            if let Some(metrics) = &self.metrics {
                metrics.record_update_error(task_type);
            }
        }

        Some(result)
    }
}
