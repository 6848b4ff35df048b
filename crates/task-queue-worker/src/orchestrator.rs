use crate::child;
use crate::config::{LoggingSettings, MetricsSettings, WorkerSettings};
use crate::error::Result;
use crate::logging;
use crate::process::{
    ChildRole, ChildSpec, ManagedProcess, ProcessSpawner, SelfExecSpawner, Termination,
};
use crate::registry;
use crate::runtime_config::WorkerRuntimeConfig;
use crate::worker::Worker;
use futures::future::join_all;
use futures::FutureExt;
use std::collections::HashSet;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use task_queue_client::ClientSettings;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Outcome of [`TaskHandler::stop`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StopSummary {
    /// Processes that exited after their stdin was closed
    pub graceful: usize,
    /// Processes that had to be killed
    pub killed: usize,
}

impl StopSummary {
    pub fn total(&self) -> usize {
        self.graceful + self.killed
    }

    fn record(&mut self, termination: Option<Termination>) {
        match termination {
            Some(Termination::Graceful) => self.graceful += 1,
            Some(Termination::Killed) => self.killed += 1,
            None => {}
        }
    }
}

/// Runs one process per worker, plus a logging sink and an optional
/// metrics sink, and starts and stops them as a unit.
///
/// Children re-execute the host binary. Inside a child, [`TaskHandler::start`]
/// runs the child's role and exits the process, so the host must build
/// the same handler with the same workers in the same order.
pub struct TaskHandler {
    workers: Vec<Worker>,
    child_spec: Option<ChildSpec>,
    processes: Vec<ManagedProcess>,
    log_sink: Option<ManagedProcess>,
    log_socket: PathBuf,
    spawner: Arc<dyn ProcessSpawner>,
    stop_timeout: Duration,
    started: bool,
    stopped: bool,
}

impl TaskHandler {
    /// Handler for `workers`, optionally adding every declared worker
    pub fn new(
        workers: Vec<Worker>,
        settings: &WorkerSettings,
        scan_for_annotated_workers: bool,
    ) -> Result<Self> {
        TaskHandler::builder()
            .settings(settings)
            .workers(workers)
            .scan_for_annotated_workers(scan_for_annotated_workers)
            .build()
    }

    pub fn builder() -> TaskHandlerBuilder {
        TaskHandlerBuilder::default()
    }

    pub fn workers(&self) -> &[Worker] {
        &self.workers
    }

    /// Task names of every worker, in process order
    pub fn task_names(&self) -> Vec<String> {
        self.workers.iter().map(|w| w.name().to_string()).collect()
    }

    /// Whether this process is a child started by a host handler
    pub fn is_child(&self) -> bool {
        self.child_spec.is_some()
    }

    pub fn log_socket(&self) -> &Path {
        &self.log_socket
    }

    /// Task runner and metrics processes
    pub fn processes(&self) -> &[ManagedProcess] {
        &self.processes
    }

    pub fn log_sink(&self) -> Option<&ManagedProcess> {
        self.log_sink.as_ref()
    }

    /// Start every process. Calling it again does nothing.
    ///
    /// In a child process this runs the child's role and never returns.
    pub async fn start(&mut self) -> Result<()> {
        if let Some(spec) = self.child_spec.take() {
            let workers = std::mem::take(&mut self.workers);
            let code = child::run(spec, workers).await;
            std::process::exit(code);
        }

        if self.started {
            return Ok(());
        }
        self.started = true;

        if let Some(sink) = self.log_sink.as_mut() {
            sink.start(self.spawner.as_ref())?;
        }
        for process in self.processes.iter_mut() {
            process.start(self.spawner.as_ref())?;
        }

        info!(
            "Started {} task runner(s) for {:?}",
            self.workers.len(),
            self.task_names()
        );
        Ok(())
    }

    /// Wait for every task runner and the metrics sink to exit. Ctrl-C
    /// while waiting stops everything.
    pub async fn join(&mut self) -> Result<()> {
        let interrupted = {
            let waits = join_all(self.processes.iter_mut().map(|process| async move {
                let status = process.wait().await;
                (process.name().to_string(), status)
            }));

            tokio::select! {
                exited = waits => {
                    for (name, status) in exited {
                        match status {
                            Some(status) if status.success() => debug!("{} exited", name),
                            Some(status) => warn!("{} exited with {}", name, status),
                            None => {}
                        }
                    }
                    false
                }
                _ = tokio::signal::ctrl_c() => true,
            }
        };

        if interrupted {
            info!("Interrupted, stopping workers");
            self.stop().await;
        }
        Ok(())
    }

    /// Close every child's stdin, kill those that do not exit within the
    /// stop timeout, then tell the logging sink to drain and exit.
    ///
    /// Safe to call more than once; later calls report nothing.
    pub async fn stop(&mut self) -> StopSummary {
        let mut summary = StopSummary::default();
        if !self.started || self.stopped {
            return summary;
        }
        self.stopped = true;

        let grace = self.stop_timeout;
        let terminations = join_all(
            self.processes
                .iter_mut()
                .map(|process| process.terminate(grace)),
        )
        .await;
        for termination in terminations {
            summary.record(termination);
        }

        if let Some(sink) = self.log_sink.as_mut() {
            if sink.is_running() {
                if let Err(e) = logging::send_shutdown(&self.log_socket).await {
                    debug!("Could not reach log sink: {}", e);
                }
                summary.record(sink.terminate(grace).await);
            }
        }
        let _ = std::fs::remove_file(&self.log_socket);

        info!(
            "Stopped {} process(es), {} killed",
            summary.total(),
            summary.killed
        );
        summary
    }

    /// Start, run `work`, then stop, even if `work` panics
    pub async fn run_until<F: Future>(&mut self, work: F) -> Result<F::Output> {
        if let Err(e) = self.start().await {
            self.stop().await;
            return Err(e);
        }

        let outcome = AssertUnwindSafe(work).catch_unwind().await;
        self.stop().await;

        match outcome {
            Ok(output) => Ok(output),
            Err(panic) => std::panic::resume_unwind(panic),
        }
    }
}

impl Drop for TaskHandler {
    fn drop(&mut self) {
        if !self.started || self.stopped {
            return;
        }
        for process in self.processes.iter_mut().chain(self.log_sink.as_mut()) {
            process.kill_now();
        }
        let _ = std::fs::remove_file(&self.log_socket);
    }
}

/// Builder for [`TaskHandler`]
pub struct TaskHandlerBuilder {
    workers: Vec<Worker>,
    scan: bool,
    runtime_config_path: PathBuf,
    runtime_config: Option<WorkerRuntimeConfig>,
    client: ClientSettings,
    logging: LoggingSettings,
    metrics: Option<MetricsSettings>,
    stop_timeout: Duration,
    spawner: Arc<dyn ProcessSpawner>,
    log_socket: Option<PathBuf>,
}

impl Default for TaskHandlerBuilder {
    fn default() -> Self {
        let settings = WorkerSettings::default();
        TaskHandlerBuilder {
            workers: Vec::new(),
            scan: false,
            runtime_config_path: settings.runtime_config_path,
            runtime_config: None,
            client: settings.client,
            logging: settings.logging,
            metrics: settings.metrics,
            stop_timeout: Duration::from_millis(settings.stop_timeout_ms),
            spawner: Arc::new(SelfExecSpawner),
            log_socket: None,
        }
    }
}

impl TaskHandlerBuilder {
    /// Take client, logging, metrics, override file and timeout from
    /// loaded settings
    pub fn settings(mut self, settings: &WorkerSettings) -> Self {
        self.client = settings.client.clone();
        self.logging = settings.logging.clone();
        self.metrics = settings.metrics.clone();
        self.runtime_config_path = settings.runtime_config_path.clone();
        self.stop_timeout = settings.stop_timeout();
        self
    }

    pub fn worker(mut self, worker: Worker) -> Self {
        self.workers.push(worker);
        self
    }

    pub fn workers(mut self, workers: impl IntoIterator<Item = Worker>) -> Self {
        self.workers.extend(workers);
        self
    }

    /// Also run every worker in the process-wide registry
    pub fn scan_for_annotated_workers(mut self, scan: bool) -> Self {
        self.scan = scan;
        self
    }

    pub fn runtime_config_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.runtime_config_path = path.into();
        self
    }

    /// Use these overrides instead of loading the override file
    pub fn runtime_config(mut self, config: WorkerRuntimeConfig) -> Self {
        self.runtime_config = Some(config);
        self
    }

    pub fn client_settings(mut self, client: ClientSettings) -> Self {
        self.client = client;
        self
    }

    pub fn logging(mut self, logging: LoggingSettings) -> Self {
        self.logging = logging;
        self
    }

    pub fn metrics(mut self, metrics: MetricsSettings) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn stop_timeout(mut self, timeout: Duration) -> Self {
        self.stop_timeout = timeout;
        self
    }

    pub fn spawner(mut self, spawner: impl ProcessSpawner + 'static) -> Self {
        self.spawner = Arc::new(spawner);
        self
    }

    pub fn log_socket(mut self, path: impl Into<PathBuf>) -> Self {
        self.log_socket = Some(path.into());
        self
    }

    /// Resolve overrides, merge declared workers and create (without
    /// starting) every process
    pub fn build(self) -> Result<TaskHandler> {
        let child_spec = ChildSpec::from_env()?;

        let runtime_config = match (&child_spec, self.runtime_config) {
            (Some(spec), _) => spec.runtime_config.clone(),
            (None, Some(config)) => config,
            (None, None) => WorkerRuntimeConfig::load(&self.runtime_config_path)?,
        };
        let runtime_config = Arc::new(runtime_config);

        let mut workers = self.workers;
        if self.scan {
            registry::register_declared_workers();
            let mut known: HashSet<String> = workers
                .iter()
                .flat_map(|w| w.task_names().iter().cloned())
                .collect();
            for worker in registry::discover_workers()? {
                if known.insert(worker.name().to_string()) {
                    workers.push(worker);
                } else {
                    debug!("Skipping declared worker {}, already present", worker.name());
                }
            }
        }
        for worker in workers.iter_mut() {
            worker.set_runtime_config(runtime_config.clone());
        }
        if workers.is_empty() {
            warn!("No workers to run");
        }

        let log_socket = self.log_socket.unwrap_or_else(default_log_socket);
        let spec = |role: ChildRole| ChildSpec {
            role,
            log_socket: log_socket.clone(),
            client: self.client.clone(),
            runtime_config: runtime_config.as_ref().clone(),
            logging: self.logging.clone(),
            metrics: self.metrics.clone(),
        };

        let (processes, log_sink) = if child_spec.is_some() {
            (Vec::new(), None)
        } else {
            let mut processes: Vec<ManagedProcess> = workers
                .iter()
                .enumerate()
                .map(|(worker_index, worker)| {
                    ManagedProcess::new(spec(ChildRole::TaskRunner {
                        worker_index,
                        task_names: worker.task_names().to_vec(),
                    }))
                })
                .collect();
            if self.metrics.is_some() {
                processes.push(ManagedProcess::new(spec(ChildRole::MetricsSink)));
            }
            (processes, Some(ManagedProcess::new(spec(ChildRole::LogSink))))
        };

        Ok(TaskHandler {
            workers,
            child_spec,
            processes,
            log_sink,
            log_socket,
            spawner: self.spawner,
            stop_timeout: self.stop_timeout,
            started: false,
            stopped: false,
        })
    }
}

fn default_log_socket() -> PathBuf {
    let suffix = Uuid::new_v4().simple().to_string();
    std::env::temp_dir().join(format!("tq-{}-{}.sock", std::process::id(), &suffix[..8]))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::{Handler, Inputs};

    fn worker(name: &str) -> Worker {
        Worker::new(name, Handler::fields(["x"], |_: Inputs| Ok(())))
    }

    #[test]
    fn test_processes_created_not_started() {
        let handler = TaskHandler::builder()
            .workers([worker("a"), worker("b")])
            .runtime_config(WorkerRuntimeConfig::empty())
            .build()
            .unwrap();

        assert!(!handler.is_child());
        assert_eq!(handler.task_names(), vec!["a", "b"]);
        assert_eq!(handler.processes().len(), 2);
        assert!(handler.processes().iter().all(|p| p.is_task_runner()));
        assert!(handler.processes().iter().all(|p| p.pid().is_none()));
        assert!(handler.log_sink().is_some());
    }

    #[test]
    fn test_metrics_adds_sink_process() {
        let dir = tempfile::tempdir().unwrap();
        let handler = TaskHandler::builder()
            .worker(worker("a"))
            .runtime_config(WorkerRuntimeConfig::empty())
            .metrics(MetricsSettings::new(dir.path()))
            .build()
            .unwrap();

        assert_eq!(handler.processes().len(), 2);
        assert!(!handler.processes()[1].is_task_runner());
    }

    #[test]
    fn test_runtime_config_applied_to_workers() {
        let config = WorkerRuntimeConfig::empty()
            .with_env_vars([("CONDUCTOR_WORKER_A_POLLING_INTERVAL", "1500")]);
        let handler = TaskHandler::builder()
            .worker(worker("a"))
            .runtime_config(config)
            .build()
            .unwrap();

        assert_eq!(
            handler.workers()[0].polling_interval(),
            Duration::from_millis(1500)
        );
    }

    #[tokio::test]
    async fn test_stop_before_start_is_noop() {
        let mut handler = TaskHandler::builder()
            .worker(worker("a"))
            .runtime_config(WorkerRuntimeConfig::empty())
            .build()
            .unwrap();

        assert_eq!(handler.stop().await, StopSummary::default());
    }
}
