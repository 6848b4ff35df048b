//! Per-task-type overrides for polling interval and domain.
//!
//! Read once from an optional INI file (one `DEFAULT` section plus one
//! section per task type) and from `CONDUCTOR_WORKER_*` environment
//! variables. Lookups for a task type go: env specific, file specific,
//! env default, file default.

use crate::error::Result;
use config::{Config, File, FileFormat, Value};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;
use tracing::{debug, warn};

const DEFAULT_SECTION: &str = "default";
const ENV_PREFIX: &str = "CONDUCTOR_WORKER_";

/// Overrides from one section
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskOverrides {
    pub polling_interval: Option<Duration>,
    pub domain: Option<String>,
}

impl TaskOverrides {
    fn is_empty(&self) -> bool {
        self.polling_interval.is_none() && self.domain.is_none()
    }

    /// Apply one `key = value` pair, ignoring keys that are not overrides
    fn set(&mut self, key: &str, value: &str) {
        match normalize(key).as_str() {
            "pollinginterval" => match parse_millis(value) {
                Some(interval) => self.polling_interval = Some(interval),
                None => warn!("Ignoring invalid polling interval {:?}", value),
            },
            "domain" => {
                let value = value.trim();
                self.domain = (!value.is_empty()).then(|| value.to_string());
            }
            _ => {}
        }
    }
}

/// Resolved override tables, immutable after loading
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkerRuntimeConfig {
    file: HashMap<String, TaskOverrides>,
    env: HashMap<String, TaskOverrides>,
}

impl WorkerRuntimeConfig {
    /// Config with no overrides at all
    pub fn empty() -> Self {
        Self::default()
    }

    /// Load the override file at `path` (missing is fine) plus the
    /// process environment
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        Ok(Self::from_file(path)?.with_env_vars(std::env::vars()))
    }

    /// Load only the override file. A missing file yields an empty config.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.is_file() {
            debug!("No worker override file at {:?}", path);
            return Ok(Self::empty());
        }

        let config = Config::builder()
            .add_source(File::new(&path.to_string_lossy(), FileFormat::Ini).required(false))
            .build()?;
        let sections: HashMap<String, Value> = config.try_deserialize()?;

        let mut file = HashMap::new();
        for (name, value) in sections {
            // Keys outside any section are not overrides
            let Ok(table) = value.into_table() else {
                continue;
            };

            let mut overrides = TaskOverrides::default();
            for (key, value) in table {
                match value.into_string() {
                    Ok(value) => overrides.set(&key, &value),
                    Err(e) => warn!("Ignoring override {}.{}: {}", name, key, e),
                }
            }
            if !overrides.is_empty() {
                file.insert(name.to_lowercase(), overrides);
            }
        }

        debug!("Loaded {} override section(s) from {:?}", file.len(), path);
        Ok(WorkerRuntimeConfig {
            file,
            env: HashMap::new(),
        })
    }

    /// Layer `CONDUCTOR_WORKER_<TASK>_<PROP>` and `CONDUCTOR_WORKER_<PROP>`
    /// variables on top of the file
    pub fn with_env_vars<I, K, V>(mut self, vars: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        for (key, value) in vars {
            let Some(rest) = key.as_ref().strip_prefix(ENV_PREFIX) else {
                continue;
            };
            let rest = rest.to_lowercase();

            let (section, property) = if let Some(task) = rest.strip_suffix("_polling_interval") {
                (task.to_string(), "polling_interval")
            } else if let Some(task) = rest.strip_suffix("_domain") {
                (task.to_string(), "domain")
            } else if rest == "polling_interval" || rest == "domain" {
                (DEFAULT_SECTION.to_string(), rest.as_str())
            } else {
                continue;
            };

            self.env
                .entry(section)
                .or_default()
                .set(property, value.as_ref());
        }
        self.env.retain(|_, overrides| !overrides.is_empty());
        self
    }

    pub fn is_empty(&self) -> bool {
        self.file.is_empty() && self.env.is_empty()
    }

    /// Polling interval override for `task_type`, if any
    pub fn polling_interval(&self, task_type: &str) -> Option<Duration> {
        self.lookup(task_type, |overrides| overrides.polling_interval)
    }

    /// Domain override for `task_type`, if any
    pub fn domain(&self, task_type: &str) -> Option<String> {
        self.lookup(task_type, |overrides| overrides.domain.clone())
    }

    fn lookup<T>(&self, task_type: &str, get: impl Fn(&TaskOverrides) -> Option<T>) -> Option<T> {
        let task_type = task_type.to_lowercase();
        [
            self.env.get(&task_type),
            self.file.get(&task_type),
            self.env.get(DEFAULT_SECTION),
            self.file.get(DEFAULT_SECTION),
        ]
        .into_iter()
        .flatten()
        .find_map(get)
    }
}

/// Lowercase and drop separators so `pollingInterval`, `polling_interval`
/// and `POLLING_INTERVAL` compare equal
fn normalize(key: &str) -> String {
    key.chars()
        .filter(|c| *c != '_')
        .flat_map(char::to_lowercase)
        .collect()
}

fn parse_millis(value: &str) -> Option<Duration> {
    let millis: f64 = value.trim().parse().ok()?;
    if !millis.is_finite() || millis < 0.0 {
        return None;
    }
    Some(Duration::from_nanos((millis * 1_000_000.0).round() as u64))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_ini(contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::Builder::new().suffix(".ini").tempfile().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_missing_file_is_empty() {
        let config = WorkerRuntimeConfig::from_file("/nonexistent/worker.ini").unwrap();
        assert!(config.is_empty());
        assert_eq!(config.polling_interval("anything"), None);
    }

    #[test]
    fn test_file_sections_and_default() {
        let file = write_ini(
            "[DEFAULT]\npolling_interval = 2000\ndomain = shared\n\n[X]\npollingInterval = 5000\n",
        );
        let config = WorkerRuntimeConfig::from_file(file.path()).unwrap();

        assert_eq!(config.polling_interval("X"), Some(Duration::from_millis(5000)));
        assert_eq!(config.polling_interval("x"), Some(Duration::from_millis(5000)));
        assert_eq!(config.polling_interval("Y"), Some(Duration::from_millis(2000)));
        assert_eq!(config.domain("X"), Some("shared".to_string()));
    }

    #[test]
    fn test_invalid_interval_ignored() {
        let file = write_ini("[echo]\npolling_interval = soon\ndomain = red\n");
        let config = WorkerRuntimeConfig::from_file(file.path()).unwrap();

        assert_eq!(config.polling_interval("echo"), None);
        assert_eq!(config.domain("echo"), Some("red".to_string()));
    }

    #[test]
    fn test_fractional_interval() {
        let file = write_ini("[echo]\npolling_interval = 2.5\n");
        let config = WorkerRuntimeConfig::from_file(file.path()).unwrap();
        assert_eq!(config.polling_interval("echo"), Some(Duration::from_micros(2500)));
    }

    #[test]
    fn test_env_precedence() {
        let file =
            write_ini("[DEFAULT]\npolling_interval = 2000\n\n[X]\npolling_interval = 5000\n");
        let config = WorkerRuntimeConfig::from_file(file.path())
            .unwrap()
            .with_env_vars([
                ("CONDUCTOR_WORKER_X_POLLING_INTERVAL", "7000"),
                ("CONDUCTOR_WORKER_POLLING_INTERVAL", "3000"),
                ("CONDUCTOR_WORKER_SEND_EMAIL_DOMAIN", "mail"),
                ("UNRELATED", "1"),
            ]);

        assert_eq!(config.polling_interval("X"), Some(Duration::from_millis(7000)));
        assert_eq!(config.polling_interval("Y"), Some(Duration::from_millis(3000)));
        assert_eq!(config.domain("send_email"), Some("mail".to_string()));
        assert_eq!(config.domain("X"), None);
    }

    #[test]
    fn test_serde_round_trip_for_child_spec() {
        let config = WorkerRuntimeConfig::empty()
            .with_env_vars([("CONDUCTOR_WORKER_ECHO_DOMAIN", "blue")]);
        let json = serde_json::to_string(&config).unwrap();
        let back: WorkerRuntimeConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back, config);
    }
}
