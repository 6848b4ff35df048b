//! Pull-based worker fleet for a remote task queue.
//!
//! A [`Worker`] binds handler logic to one or more task types. A
//! [`TaskHandler`] runs one OS process per worker, each driving a
//! [`TaskRunner`] loop that polls the queue, executes the handler and
//! reports the result.

mod child;
pub mod config;
pub mod error;
pub mod executor;
pub mod handler;
pub mod logging;
pub mod metrics;
pub mod orchestrator;
pub mod process;
pub mod registry;
pub mod runner;
pub mod runtime_config;
pub mod worker;

pub use config::{LoggingSettings, MetricsSettings, WorkerSettings};
pub use error::{HandlerError, Result, WorkerError};
pub use executor::TaskExecutor;
pub use handler::{Handler, HandlerKind, HandlerOutput, Inputs, TaskFunction};
pub use orchestrator::{StopSummary, TaskHandler, TaskHandlerBuilder};
pub use process::{ChildSpec, ProcessSpawner, SelfExecSpawner};
pub use registry::{
    discover_workers, register_declared_workers, register_worker, registered_task_types,
    WorkerDeclaration,
};
pub use runner::TaskRunner;
pub use runtime_config::WorkerRuntimeConfig;
pub use worker::{Worker, WorkerBuilder};

#[doc(hidden)]
pub use inventory;

/// Whether this process was started as a child of a [`TaskHandler`]
pub fn is_child_process() -> bool {
    std::env::var_os(process::CHILD_SPEC_ENV).is_some()
}
