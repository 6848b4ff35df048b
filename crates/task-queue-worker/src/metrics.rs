//! Per-runner prometheus metrics and the merged metrics file.
//!
//! Every Task Runner process owns a [`RunnerMetrics`] registry and drops a
//! text snapshot at `<directory>/runner-<pid>.prom`. The metrics sink
//! process folds all snapshots into one file every update interval.

use crate::config::MetricsSettings;
use crate::error::Result;
use parking_lot::Mutex;
use prometheus::{Encoder, HistogramOpts, HistogramVec, IntCounterVec, Opts, Registry, TextEncoder};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use task_queue_core::TaskResultStatus;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const RUNNER_FILE_PREFIX: &str = "runner-";
const RUNNER_FILE_SUFFIX: &str = ".prom";

/// Prometheus metrics for one Task Runner
pub struct RunnerMetrics {
    registry: Registry,

    poll_total: IntCounterVec,
    poll_error_total: IntCounterVec,
    execute_error_total: IntCounterVec,
    update_error_total: IntCounterVec,

    poll_time: HistogramVec,
    execute_time: HistogramVec,

    path: PathBuf,
    update_interval: Duration,
    last_flush: Mutex<Option<Instant>>,
}

impl RunnerMetrics {
    pub fn new(settings: &MetricsSettings, pid: u32) -> Result<Self> {
        let registry = Registry::new();
        let pid = pid.to_string();

        let poll_total = IntCounterVec::new(
            Opts::new("task_poll_total", "Number of polls issued")
                .const_label("worker_pid", pid.as_str()),
            &["task_type"],
        )?;
        registry.register(Box::new(poll_total.clone()))?;

        let poll_error_total = IntCounterVec::new(
            Opts::new("task_poll_error_total", "Number of failed polls")
                .const_label("worker_pid", pid.as_str()),
            &["task_type"],
        )?;
        registry.register(Box::new(poll_error_total.clone()))?;

        let execute_error_total = IntCounterVec::new(
            Opts::new("task_execute_error_total", "Number of tasks that did not complete")
                .const_label("worker_pid", pid.as_str()),
            &["task_type", "reason_kind"],
        )?;
        registry.register(Box::new(execute_error_total.clone()))?;

        let update_error_total = IntCounterVec::new(
            Opts::new("task_update_error_total", "Number of results that could not be reported")
                .const_label("worker_pid", pid.as_str()),
            &["task_type"],
        )?;
        registry.register(Box::new(update_error_total.clone()))?;

        let poll_time = HistogramVec::new(
            HistogramOpts::new("task_poll_time_seconds", "Poll round trip in seconds")
                .const_label("worker_pid", pid.as_str()),
            &["task_type"],
        )?;
        registry.register(Box::new(poll_time.clone()))?;

        let execute_time = HistogramVec::new(
            HistogramOpts::new("task_execute_time_seconds", "Handler execution time in seconds")
                .const_label("worker_pid", pid.as_str()),
            &["task_type"],
        )?;
        registry.register(Box::new(execute_time.clone()))?;

        Ok(RunnerMetrics {
            registry,
            poll_total,
            poll_error_total,
            execute_error_total,
            update_error_total,
            poll_time,
            execute_time,
            path: settings.directory.join(runner_file_name(&pid)),
            update_interval: settings.update_interval(),
            last_flush: Mutex::new(None),
        })
    }

    pub fn record_poll(&self, task_type: &str, elapsed: Duration, ok: bool) {
        self.poll_total.with_label_values(&[task_type]).inc();
        self.poll_time
            .with_label_values(&[task_type])
            .observe(elapsed.as_secs_f64());
        if !ok {
            self.poll_error_total.with_label_values(&[task_type]).inc();
        }
    }

    pub fn record_execute(&self, task_type: &str, elapsed: Duration, status: TaskResultStatus) {
        self.execute_time
            .with_label_values(&[task_type])
            .observe(elapsed.as_secs_f64());

        let reason_kind = match status {
            TaskResultStatus::Failed => "failed",
            TaskResultStatus::FailedWithTerminalError => "terminal",
            TaskResultStatus::Completed | TaskResultStatus::InProgress => return,
        };
        self.execute_error_total
            .with_label_values(&[task_type, reason_kind])
            .inc();
    }

    pub fn record_update_error(&self, task_type: &str) {
        self.update_error_total.with_label_values(&[task_type]).inc();
    }

    /// Text exposition of this runner's registry
    pub fn render(&self) -> Result<String> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        Ok(String::from_utf8_lossy(&buffer).into_owned())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write the snapshot file now
    pub fn flush(&self) -> Result<()> {
        let text = self.render()?;
        write_atomic(&self.path, text.as_bytes())?;
        *self.last_flush.lock() = Some(Instant::now());
        Ok(())
    }

    /// Write the snapshot file unless one was written within the update
    /// interval. Failures are logged only.
    pub fn flush_if_due(&self) {
        let due = match *self.last_flush.lock() {
            Some(last) => last.elapsed() >= self.update_interval,
            None => true,
        };
        if due {
            if let Err(e) = self.flush() {
                warn!("Failed to write metrics to {:?}: {}", self.path, e);
            }
        }
    }
}

fn runner_file_name(pid: &str) -> String {
    format!("{}{}{}", RUNNER_FILE_PREFIX, pid, RUNNER_FILE_SUFFIX)
}

fn write_atomic(path: &Path, contents: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let tmp = path.with_extension("tmp");
    fs::write(&tmp, contents)?;
    fs::rename(&tmp, path)?;
    Ok(())
}

struct Family {
    name: String,
    help: Option<String>,
    kind: Option<String>,
    samples: Vec<String>,
}

/// Merge exposition texts so each metric family has a single
/// `# HELP`/`# TYPE` header followed by the samples of every input
pub fn merge_expositions<'a>(texts: impl IntoIterator<Item = &'a str>) -> String {
    let mut families: Vec<Family> = Vec::new();
    let mut index: HashMap<String, usize> = HashMap::new();

    for text in texts {
        let mut current: Option<usize> = None;

        for line in text.lines().map(str::trim).filter(|l| !l.is_empty()) {
            let header = line
                .strip_prefix("# HELP ")
                .or_else(|| line.strip_prefix("# TYPE "));
            if let Some(rest) = header {
                let name = rest.split_whitespace().next().unwrap_or_default().to_string();
                let slot = *index.entry(name.clone()).or_insert_with(|| {
                    families.push(Family {
                        name,
                        help: None,
                        kind: None,
                        samples: Vec::new(),
                    });
                    families.len() - 1
                });

                let family = &mut families[slot];
                if line.starts_with("# HELP ") {
                    family.help.get_or_insert_with(|| line.to_string());
                } else {
                    family.kind.get_or_insert_with(|| line.to_string());
                }
                current = Some(slot);
            } else if line.starts_with('#') {
                continue;
            } else if let Some(slot) = current {
                families[slot].samples.push(line.to_string());
            }
        }
    }

    let mut merged = String::new();
    for family in families {
        for header in [family.help, family.kind].into_iter().flatten() {
            merged.push_str(&header);
            merged.push('\n');
        }
        for sample in family.samples {
            merged.push_str(&sample);
            merged.push('\n');
        }
        debug!("Merged metric family {}", family.name);
    }
    merged
}

/// Fold every runner snapshot in the metrics directory into the merged
/// file. Returns the number of snapshots read.
pub fn write_merged(settings: &MetricsSettings) -> Result<usize> {
    let mut paths: Vec<PathBuf> = match fs::read_dir(&settings.directory) {
        Ok(entries) => entries
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| {
                path.file_name()
                    .and_then(|n| n.to_str())
                    .map(|n| n.starts_with(RUNNER_FILE_PREFIX) && n.ends_with(RUNNER_FILE_SUFFIX))
                    .unwrap_or(false)
            })
            .collect(),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
        Err(e) => return Err(e.into()),
    };
    paths.sort();

    let mut texts = Vec::with_capacity(paths.len());
    for path in &paths {
        match fs::read_to_string(path) {
            Ok(text) => texts.push(text),
            // A runner may be replacing its file right now
            Err(e) => debug!("Skipping metrics file {:?}: {}", path, e),
        }
    }

    let merged = merge_expositions(texts.iter().map(String::as_str));
    write_atomic(&settings.file_path(), merged.as_bytes())?;
    Ok(texts.len())
}

/// Metrics sink loop: merge every update interval until cancelled, then
/// merge once more
pub async fn run_metrics_sink(settings: MetricsSettings, shutdown: CancellationToken) {
    info!("Metrics sink writing to {:?}", settings.file_path());
    let mut interval = tokio::time::interval(settings.update_interval());

    loop {
        tokio::select! {
            _ = interval.tick() => {
                if let Err(e) = write_merged(&settings) {
                    warn!("Failed to merge metrics: {}", e);
                }
            }
            _ = shutdown.cancelled() => break,
        }
    }

    if let Err(e) = write_merged(&settings) {
        warn!("Failed to merge metrics: {}", e);
    }
    info!("Metrics sink stopped");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_runner_snapshot_written() {
        let dir = tempfile::tempdir().unwrap();
        let settings = MetricsSettings::new(dir.path());
        let metrics = RunnerMetrics::new(&settings, 4242).unwrap();

        metrics.record_poll("echo", Duration::from_millis(3), true);
        metrics.record_poll("echo", Duration::from_millis(3), false);
        metrics.record_execute(
            "echo",
            Duration::from_millis(1),
            TaskResultStatus::FailedWithTerminalError,
        );
        metrics.flush().unwrap();

        assert_eq!(metrics.path(), dir.path().join("runner-4242.prom"));
        let text = fs::read_to_string(metrics.path()).unwrap();
        assert!(text.contains("task_poll_total{task_type=\"echo\",worker_pid=\"4242\"} 2"));
        assert!(text.contains("task_poll_error_total{task_type=\"echo\",worker_pid=\"4242\"} 1"));
        assert!(text.contains("reason_kind=\"terminal\""));
    }

    #[test]
    fn test_merge_groups_headers() {
        let a = "# HELP task_poll_total Polls\n# TYPE task_poll_total counter\ntask_poll_total{worker_pid=\"1\"} 3\n";
        let b = "# HELP task_poll_total Polls\n# TYPE task_poll_total counter\ntask_poll_total{worker_pid=\"2\"} 5\n";

        let merged = merge_expositions([a, b]);
        assert_eq!(merged.matches("# HELP task_poll_total").count(), 1);
        assert_eq!(merged.matches("# TYPE task_poll_total").count(), 1);
        assert!(merged.contains("task_poll_total{worker_pid=\"1\"} 3"));
        assert!(merged.contains("task_poll_total{worker_pid=\"2\"} 5"));
    }

    #[test]
    fn test_write_merged_from_two_runners() {
        let dir = tempfile::tempdir().unwrap();
        let settings = MetricsSettings::new(dir.path());

        for pid in [11, 12] {
            let metrics = RunnerMetrics::new(&settings, pid).unwrap();
            metrics.record_update_error("echo");
            metrics.flush().unwrap();
        }

        assert_eq!(write_merged(&settings).unwrap(), 2);
        let merged = fs::read_to_string(settings.file_path()).unwrap();
        assert_eq!(merged.matches("# TYPE task_update_error_total").count(), 1);
        assert!(merged.contains("worker_pid=\"11\""));
        assert!(merged.contains("worker_pid=\"12\""));
    }

    #[tokio::test]
    async fn test_sink_survives_zero_update_interval() {
        let dir = tempfile::tempdir().unwrap();
        let mut settings = MetricsSettings::new(dir.path());
        settings.update_interval_ms = 0;

        RunnerMetrics::new(&settings, 21).unwrap().flush().unwrap();
        let shutdown = CancellationToken::new();
        shutdown.cancel();

        tokio::spawn(run_metrics_sink(settings.clone(), shutdown))
            .await
            .unwrap();
        let merged = fs::read_to_string(settings.file_path()).unwrap();
        assert!(merged.contains("worker_pid=\"21\""));
    }

    #[test]
    fn test_missing_directory_is_empty_merge() {
        let dir = tempfile::tempdir().unwrap();
        let settings = MetricsSettings::new(dir.path().join("later"));
        assert_eq!(write_merged(&settings).unwrap(), 0);
    }
}
