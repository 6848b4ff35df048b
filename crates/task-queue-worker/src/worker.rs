use crate::error::{Result, WorkerError};
use crate::executor::TaskExecutor;
use crate::handler::Handler;
use crate::runtime_config::WorkerRuntimeConfig;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use task_queue_core::{Task, TaskResult, DEFAULT_POLLING_INTERVAL_MS};

/// Execution logic bound to one or more task type names.
///
/// A worker bound to several names hands them out in round-robin order,
/// one per call to [`Worker::task_definition_name`].
#[derive(Debug)]
pub struct Worker {
    task_names: Vec<String>,
    cursor: AtomicUsize,
    executor: TaskExecutor,
    polling_interval: Option<Duration>,
    domain: Option<String>,
    worker_id: String,
    runtime_config: Arc<WorkerRuntimeConfig>,
}

impl Worker {
    /// Worker for a single task type with default settings
    pub fn new(task_name: impl Into<String>, handler: Handler) -> Self {
        Worker {
            task_names: vec![task_name.into()],
            cursor: AtomicUsize::new(0),
            executor: TaskExecutor::new(handler),
            polling_interval: None,
            domain: None,
            worker_id: default_worker_id(),
            runtime_config: Arc::new(WorkerRuntimeConfig::empty()),
        }
    }

    pub fn builder(task_name: impl Into<String>) -> WorkerBuilder {
        WorkerBuilder::new(task_name)
    }

    /// Next task type to poll. Advances the round-robin cursor.
    pub fn task_definition_name(&self) -> &str {
        let index = self.cursor.fetch_add(1, Ordering::Relaxed) % self.task_names.len();
        &self.task_names[index]
    }

    pub fn task_names(&self) -> &[String] {
        &self.task_names
    }

    /// First bound name, used to label the worker
    pub fn name(&self) -> &str {
        &self.task_names[0]
    }

    pub fn identity(&self) -> &str {
        &self.worker_id
    }

    pub fn handler(&self) -> &Handler {
        self.executor.handler()
    }

    /// Explicit value, then runtime overrides, then the built-in default
    pub fn polling_interval_for(&self, task_type: &str) -> Duration {
        self.polling_interval
            .or_else(|| self.runtime_config.polling_interval(task_type))
            .unwrap_or(Duration::from_millis(DEFAULT_POLLING_INTERVAL_MS))
    }

    pub fn polling_interval(&self) -> Duration {
        self.polling_interval_for(self.name())
    }

    /// Explicit value, then runtime overrides
    pub fn domain_for(&self, task_type: &str) -> Option<String> {
        self.domain
            .clone()
            .or_else(|| self.runtime_config.domain(task_type))
    }

    pub fn domain(&self) -> Option<String> {
        self.domain_for(self.name())
    }

    /// Resolve polling interval and domain against `config` from now on
    pub fn set_runtime_config(&mut self, config: Arc<WorkerRuntimeConfig>) {
        self.runtime_config = config;
    }

    /// Run the handler. Never fails: handler errors and panics come back
    /// as failed results carrying this worker's identity.
    pub async fn execute(&self, task: &Task) -> TaskResult {
        let mut result = self.executor.execute(task).await;
        if result.worker_id.is_none() {
            result.worker_id = Some(self.worker_id.clone());
        }
        result
    }
}

/// Builder for [`Worker`]
pub struct WorkerBuilder {
    task_names: Vec<String>,
    handler: Option<Handler>,
    polling_interval: Option<Duration>,
    domain: Option<String>,
    worker_id: Option<String>,
}

impl WorkerBuilder {
    pub fn new(task_name: impl Into<String>) -> Self {
        WorkerBuilder {
            task_names: vec![task_name.into()],
            handler: None,
            polling_interval: None,
            domain: None,
            worker_id: None,
        }
    }

    /// Bind one more task type, polled in turn with the others
    pub fn task_name(mut self, task_name: impl Into<String>) -> Self {
        self.task_names.push(task_name.into());
        self
    }

    pub fn handler(mut self, handler: Handler) -> Self {
        self.handler = Some(handler);
        self
    }

    pub fn polling_interval(mut self, interval: Duration) -> Self {
        self.polling_interval = Some(interval);
        self
    }

    pub fn domain(mut self, domain: impl Into<String>) -> Self {
        self.domain = Some(domain.into());
        self
    }

    pub fn worker_id(mut self, worker_id: impl Into<String>) -> Self {
        self.worker_id = Some(worker_id.into());
        self
    }

    pub fn build(self) -> Result<Worker> {
        if let Some(name) = self.task_names.iter().find(|name| name.trim().is_empty()) {
            return Err(WorkerError::InvalidWorker(format!(
                "Task name {:?} is empty",
                name
            )));
        }

        let handler = self.handler.ok_or_else(|| {
            WorkerError::InvalidWorker(format!("No handler for {}", self.task_names[0]))
        })?;

        Ok(Worker {
            task_names: self.task_names,
            cursor: AtomicUsize::new(0),
            executor: TaskExecutor::new(handler),
            polling_interval: self.polling_interval,
            domain: self.domain,
            worker_id: self.worker_id.unwrap_or_else(default_worker_id),
            runtime_config: Arc::new(WorkerRuntimeConfig::empty()),
        })
    }
}

/// Machine-derived identity shared by every worker process on this host
fn default_worker_id() -> String {
    hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "unknown".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::Inputs;

    fn noop() -> Handler {
        Handler::fields(Vec::<String>::new(), |_: Inputs| Ok(()))
    }

    #[test]
    fn test_single_name_is_fixed() {
        let worker = Worker::new("echo", noop());
        assert_eq!(worker.task_definition_name(), "echo");
        assert_eq!(worker.task_definition_name(), "echo");
    }

    #[test]
    fn test_builder_requires_handler() {
        assert!(matches!(
            Worker::builder("echo").build(),
            Err(WorkerError::InvalidWorker(_))
        ));
        assert!(Worker::builder(" ").handler(noop()).build().is_err());
    }

    #[test]
    fn test_explicit_values_win() {
        let config = WorkerRuntimeConfig::empty().with_env_vars([
            ("CONDUCTOR_WORKER_ECHO_POLLING_INTERVAL", "900"),
            ("CONDUCTOR_WORKER_ECHO_DOMAIN", "env"),
        ]);
        let mut worker = Worker::builder("echo")
            .handler(noop())
            .polling_interval(Duration::from_millis(50))
            .domain("explicit")
            .worker_id("w-1")
            .build()
            .unwrap();
        worker.set_runtime_config(Arc::new(config));

        assert_eq!(worker.polling_interval(), Duration::from_millis(50));
        assert_eq!(worker.domain().as_deref(), Some("explicit"));
        assert_eq!(worker.identity(), "w-1");
    }

    #[test]
    fn test_default_identity_is_hostname() {
        let worker = Worker::new("echo", noop());
        assert!(!worker.identity().is_empty());
        assert_eq!(worker.domain(), None);
        assert_eq!(worker.polling_interval(), Duration::from_millis(100));
    }

    #[tokio::test]
    async fn test_execute_stamps_worker_id() {
        let worker = Worker::builder("echo")
            .handler(noop())
            .worker_id("w-2")
            .build()
            .unwrap();
        let task = Task::builder("t-1", "echo").workflow_instance_id("wf").build();

        let result = worker.execute(&task).await;
        assert_eq!(result.worker_id.as_deref(), Some("w-2"));
        assert_eq!(result.task_id, "t-1");
    }
}
