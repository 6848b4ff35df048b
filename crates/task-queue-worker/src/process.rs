//! Child process handles.
//!
//! Every child is described by a [`ChildSpec`] and turned into an OS
//! process by a [`ProcessSpawner`]. The default spawner re-executes the
//! current binary with its [`ChildSpec`] in [`CHILD_SPEC_ENV`]; the child's
//! [`TaskHandler`](crate::TaskHandler) picks it up and runs the role.

use crate::config::{LoggingSettings, MetricsSettings};
use crate::error::{Result, WorkerError};
use crate::runtime_config::WorkerRuntimeConfig;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use task_queue_client::ClientSettings;
use tokio::process::{Child, ChildStdin, Command};
use tracing::{debug, info, warn};

/// Environment variable carrying the JSON spec of a child process
pub const CHILD_SPEC_ENV: &str = "TQ_WORKER_CHILD";

/// What a child process does
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ChildRole {
    /// Poll loop for the worker at `worker_index` in the host's list
    TaskRunner {
        worker_index: usize,
        task_names: Vec<String>,
    },
    LogSink,
    MetricsSink,
}

/// Everything a child needs to run its role
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChildSpec {
    pub role: ChildRole,
    pub log_socket: PathBuf,
    pub client: ClientSettings,
    pub runtime_config: WorkerRuntimeConfig,
    pub logging: LoggingSettings,
    pub metrics: Option<MetricsSettings>,
}

impl ChildSpec {
    /// Short name used in logs
    pub fn name(&self) -> String {
        match &self.role {
            ChildRole::TaskRunner {
                worker_index,
                task_names,
            } => format!("runner-{}-{}", worker_index, task_names.join("+")),
            ChildRole::LogSink => "log-sink".to_string(),
            ChildRole::MetricsSink => "metrics-sink".to_string(),
        }
    }

    pub fn to_env(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Spec of the current process, if it was started as a child
    pub fn from_env() -> Result<Option<Self>> {
        match std::env::var(CHILD_SPEC_ENV) {
            Ok(value) => serde_json::from_str(&value)
                .map(Some)
                .map_err(|e| WorkerError::ChildSpec(e.to_string())),
            Err(std::env::VarError::NotPresent) => Ok(None),
            Err(e) => Err(WorkerError::ChildSpec(e.to_string())),
        }
    }
}

/// Turns a [`ChildSpec`] into a running OS process.
///
/// Implementations should pipe the child's stdin: closing it is how the
/// orchestrator asks a child to exit.
pub trait ProcessSpawner: Send + Sync {
    fn spawn(&self, spec: &ChildSpec) -> io::Result<Child>;
}

/// Re-executes the current binary with the same arguments
#[derive(Debug, Default, Clone, Copy)]
pub struct SelfExecSpawner;

impl ProcessSpawner for SelfExecSpawner {
    fn spawn(&self, spec: &ChildSpec) -> io::Result<Child> {
        let exe = std::env::current_exe()?;
        let payload = spec.to_env().map_err(io::Error::other)?;

        Command::new(exe)
            .args(std::env::args_os().skip(1))
            .env(CHILD_SPEC_ENV, payload)
            .stdin(Stdio::piped())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
    }
}

/// How a child ended up stopping
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    Graceful,
    Killed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    Created,
    Running,
    Exited,
}

/// One child process owned by the orchestrator
pub struct ManagedProcess {
    spec: ChildSpec,
    name: String,
    state: ProcessState,
    child: Option<Child>,
    // Held apart from `child` so waiting never closes it
    stdin: Option<ChildStdin>,
}

impl ManagedProcess {
    pub fn new(spec: ChildSpec) -> Self {
        ManagedProcess {
            name: spec.name(),
            spec,
            state: ProcessState::Created,
            child: None,
            stdin: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn spec(&self) -> &ChildSpec {
        &self.spec
    }

    pub fn state(&self) -> ProcessState {
        self.state
    }

    pub fn is_running(&self) -> bool {
        self.state == ProcessState::Running
    }

    pub fn is_task_runner(&self) -> bool {
        matches!(self.spec.role, ChildRole::TaskRunner { .. })
    }

    pub fn pid(&self) -> Option<u32> {
        self.child.as_ref().and_then(Child::id)
    }

    /// Spawn the process. Only a created process is started.
    pub fn start(&mut self, spawner: &dyn ProcessSpawner) -> Result<()> {
        if self.state != ProcessState::Created {
            return Ok(());
        }

        let mut child = spawner.spawn(&self.spec).map_err(|source| WorkerError::Spawn {
            name: self.name.clone(),
            source,
        })?;
        self.stdin = child.stdin.take();
        debug!("Started {} (pid {:?})", self.name, child.id());

        self.child = Some(child);
        self.state = ProcessState::Running;
        Ok(())
    }

    /// Wait for the process to exit on its own
    pub async fn wait(&mut self) -> Option<ExitStatus> {
        if self.state != ProcessState::Running {
            return None;
        }
        let child = self.child.as_mut()?;

        match child.wait().await {
            Ok(status) => {
                self.state = ProcessState::Exited;
                self.stdin = None;
                Some(status)
            }
            Err(e) => {
                warn!("Failed to wait for {}: {}", self.name, e);
                None
            }
        }
    }

    /// Close stdin and give the process `grace` to exit, then kill it.
    /// Returns `None` when the process was not running.
    pub async fn terminate(&mut self, grace: Duration) -> Option<Termination> {
        if self.state != ProcessState::Running {
            return None;
        }
        let child = self.child.as_mut()?;
        self.stdin = None;

        let termination = match tokio::time::timeout(grace, child.wait()).await {
            Ok(Ok(status)) => {
                debug!("{} exited with {}", self.name, status);
                Termination::Graceful
            }
            Ok(Err(e)) => {
                warn!("Failed to wait for {}, killing it: {}", self.name, e);
                Self::kill(&self.name, child).await;
                Termination::Killed
            }
            Err(_) => {
                info!("{} did not exit within {:?}, killing it", self.name, grace);
                Self::kill(&self.name, child).await;
                Termination::Killed
            }
        };

        self.state = ProcessState::Exited;
        Some(termination)
    }

    async fn kill(name: &str, child: &mut Child) {
        if let Err(e) = child.kill().await {
            warn!("Failed to kill {}: {}", name, e);
        }
    }

    /// Send SIGKILL without waiting; used when dropping the orchestrator
    pub fn kill_now(&mut self) {
        if self.state != ProcessState::Running {
            return;
        }
        if let Some(child) = self.child.as_mut() {
            let _ = child.start_kill();
        }
        self.stdin = None;
        self.state = ProcessState::Exited;
    }
}

impl fmt::Debug for ManagedProcess {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ManagedProcess")
            .field("name", &self.name)
            .field("state", &self.state)
            .field("pid", &self.pid())
            .finish()
    }
}
