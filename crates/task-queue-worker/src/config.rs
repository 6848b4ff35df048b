use crate::error::Result;
use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use task_queue_client::ClientSettings;

/// Settings for the host process running a [`TaskHandler`](crate::TaskHandler)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerSettings {
    pub client: ClientSettings,
    /// Per-task-type override file, relative to the working directory
    pub runtime_config_path: PathBuf,
    pub logging: LoggingSettings,
    /// Metrics sink is only started when this is set
    pub metrics: Option<MetricsSettings>,
    /// Grace period between closing a child's stdin and killing it
    pub stop_timeout_ms: u64,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        WorkerSettings {
            client: ClientSettings::default(),
            runtime_config_path: PathBuf::from("worker.ini"),
            logging: LoggingSettings::default(),
            metrics: None,
            stop_timeout_ms: 5000,
        }
    }
}

impl WorkerSettings {
    /// Load from an optional file, then `TQ__`-prefixed environment
    /// variables (`TQ__CLIENT__SERVER_URL`, `TQ__STOP_TIMEOUT_MS`, ...).
    /// `CONDUCTOR_*` client variables seed the defaults.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let client = ClientSettings::from_env()?;

        let mut builder = Config::builder()
            .set_default("client.server_url", client.server_url)?
            .set_default("client.request_timeout_ms", client.request_timeout_ms)?;
        if let Some(key) = client.auth_key {
            builder = builder.set_default("client.auth_key", key)?;
        }
        if let Some(secret) = client.auth_secret {
            builder = builder.set_default("client.auth_secret", secret)?;
        }
        if let Some(path) = path {
            builder = builder.add_source(File::from(path).required(false));
        }

        let config = builder
            .add_source(
                Environment::with_prefix("TQ")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        Ok(config.try_deserialize()?)
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_millis(self.stop_timeout_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    /// Default filter when `RUST_LOG` is unset
    pub level: String,
    pub json: bool,
    /// Records buffered per process before new ones are dropped
    pub channel_capacity: usize,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        LoggingSettings {
            level: "info".to_string(),
            json: false,
            channel_capacity: 1024,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsSettings {
    /// Where runners drop their snapshots and the merged file is written
    pub directory: PathBuf,
    pub file_name: String,
    pub update_interval_ms: u64,
}

impl Default for MetricsSettings {
    fn default() -> Self {
        MetricsSettings {
            directory: std::env::temp_dir().join("tq-metrics"),
            file_name: "metrics.log".to_string(),
            update_interval_ms: 100,
        }
    }
}

impl MetricsSettings {
    pub fn new(directory: impl Into<PathBuf>) -> Self {
        MetricsSettings {
            directory: directory.into(),
            ..Default::default()
        }
    }

    /// Merged exposition file
    pub fn file_path(&self) -> PathBuf {
        self.directory.join(&self.file_name)
    }

    /// Never shorter than 1 ms
    pub fn update_interval(&self) -> Duration {
        Duration::from_millis(self.update_interval_ms.max(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let settings = WorkerSettings::default();
        assert_eq!(settings.runtime_config_path, PathBuf::from("worker.ini"));
        assert_eq!(settings.stop_timeout(), Duration::from_secs(5));
        assert_eq!(settings.logging.channel_capacity, 1024);
        assert!(settings.metrics.is_none());
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            "runtime_config_path = \"conf/workers.ini\"\nstop_timeout_ms = 250\n\n[metrics]\ndirectory = \"/tmp/m\"\n"
        )
        .unwrap();

        let settings = WorkerSettings::load(Some(file.path())).unwrap();
        assert_eq!(settings.runtime_config_path, PathBuf::from("conf/workers.ini"));
        assert_eq!(settings.stop_timeout_ms, 250);

        let metrics = settings.metrics.unwrap();
        assert_eq!(metrics.file_path(), PathBuf::from("/tmp/m/metrics.log"));
        assert_eq!(metrics.update_interval(), Duration::from_millis(100));
    }

    #[test]
    fn test_zero_update_interval_clamped() {
        let mut metrics = MetricsSettings::new("/tmp/m");
        metrics.update_interval_ms = 0;
        assert_eq!(metrics.update_interval(), Duration::from_millis(1));
    }

    #[test]
    fn test_missing_file_uses_defaults() {
        let settings = WorkerSettings::load(Some(Path::new("/nonexistent/tq.toml"))).unwrap();
        assert_eq!(settings.logging.level, "info");
    }
}
