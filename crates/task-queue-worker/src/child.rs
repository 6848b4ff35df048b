//! Entry point of a child process: run the role named in its spec until
//! stdin closes.

use crate::error::{Result, WorkerError};
use crate::logging::{self, bind_sink, forward_logs, run_log_sink};
use crate::metrics::{run_metrics_sink, RunnerMetrics};
use crate::process::{ChildRole, ChildSpec};
use crate::runner::TaskRunner;
use crate::worker::Worker;
use std::sync::Arc;
use std::time::Duration;
use task_queue_client::TaskQueueHttpClient;
use tokio::io::AsyncReadExt;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::instrument::WithSubscriber;
use tracing::{error, info};

const FORWARDER_FLUSH_TIMEOUT: Duration = Duration::from_secs(2);

/// Run the role and return the process exit code
pub(crate) async fn run(spec: ChildSpec, workers: Vec<Worker>) -> i32 {
    let result = match spec.role.clone() {
        ChildRole::TaskRunner {
            worker_index,
            task_names,
        } => match select_worker(workers, worker_index, &task_names) {
            Ok(worker) => run_task_runner(&spec, worker).await,
            Err(e) => Err(e),
        },
        ChildRole::LogSink => run_sink(&spec).await,
        ChildRole::MetricsSink => run_metrics(&spec).await,
    };

    match result {
        Ok(()) => 0,
        Err(e) => {
            eprintln!("{} failed: {}", spec.name(), e);
            1
        }
    }
}

/// The host and child build the same worker list, so the index must land
/// on the same task names
fn select_worker(mut workers: Vec<Worker>, index: usize, task_names: &[String]) -> Result<Worker> {
    if index >= workers.len() {
        return Err(WorkerError::ChildSpec(format!(
            "Worker index {} out of range, {} worker(s) known",
            index,
            workers.len()
        )));
    }

    let worker = workers.swap_remove(index);
    if worker.task_names() != task_names {
        return Err(WorkerError::ChildSpec(format!(
            "Worker {} is {:?}, expected {:?}",
            index,
            worker.task_names(),
            task_names
        )));
    }
    Ok(worker)
}

/// Cancel `token` once stdin reaches EOF
fn watch_stdin(token: CancellationToken) {
    tokio::spawn(async move {
        let mut stdin = tokio::io::stdin();
        let mut buf = [0u8; 256];
        while let Ok(n) = stdin.read(&mut buf).await {
            if n == 0 {
                break;
            }
        }
        token.cancel();
    });
}

struct Forwarder {
    close: CancellationToken,
    handle: JoinHandle<()>,
}

impl Forwarder {
    async fn flush(self) {
        self.close.cancel();
        let _ = tokio::time::timeout(FORWARDER_FLUSH_TIMEOUT, self.handle).await;
    }
}

fn start_forwarder(
    spec: &ChildSpec,
    source: &str,
) -> (tracing::Dispatch, Forwarder) {
    let (dispatch, receiver, _dropped) = logging::channel_dispatch(source, &spec.logging);
    let close = CancellationToken::new();
    let handle = tokio::spawn(forward_logs(
        spec.log_socket.clone(),
        receiver,
        close.clone(),
    ));
    (dispatch, Forwarder { close, handle })
}

async fn run_task_runner(spec: &ChildSpec, mut worker: Worker) -> Result<()> {
    worker.set_runtime_config(Arc::new(spec.runtime_config.clone()));
    let (dispatch, forwarder) = start_forwarder(spec, worker.name());

    let shutdown = CancellationToken::new();
    watch_stdin(shutdown.clone());

    let outcome = async {
        let client = TaskQueueHttpClient::new(spec.client.clone())?;
        let mut runner = TaskRunner::new(Arc::new(worker), Arc::new(client));
        if let Some(settings) = &spec.metrics {
            runner = runner.with_metrics(RunnerMetrics::new(settings, std::process::id())?);
        }

        runner.run(shutdown).await;
        Ok::<(), WorkerError>(())
    }
    .with_subscriber(dispatch.clone())
    .await;

    if let Err(e) = &outcome {
        tracing::dispatcher::with_default(&dispatch, || error!("Task runner failed: {}", e));
    }
    forwarder.flush().await;
    outcome
}

async fn run_sink(spec: &ChildSpec) -> Result<()> {
    let dispatch = logging::fmt_dispatch(&spec.logging);
    let listener = bind_sink(&spec.log_socket)?;

    let stop = CancellationToken::new();
    watch_stdin(stop.clone());

    run_log_sink(listener, stop).with_subscriber(dispatch).await;
    let _ = std::fs::remove_file(&spec.log_socket);
    Ok(())
}

async fn run_metrics(spec: &ChildSpec) -> Result<()> {
    let settings = spec
        .metrics
        .clone()
        .ok_or_else(|| {
            WorkerError::ChildSpec("Metrics sink started without settings".to_string())
        })?;
    let (dispatch, forwarder) = start_forwarder(spec, "metrics");

    let stop = CancellationToken::new();
    watch_stdin(stop.clone());

    async {
        info!("Merging metrics every {:?}", settings.update_interval());
        run_metrics_sink(settings, stop).await;
    }
    .with_subscriber(dispatch)
    .await;

    forwarder.flush().await;
    Ok(())
}
