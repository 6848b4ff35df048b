use clap::Parser;
use serde_json::json;
use std::path::PathBuf;
use task_queue_worker::{
    logging, worker_task, Handler, HandlerError, Inputs, TaskHandler, WorkerSettings,
};

#[derive(Parser, Debug)]
#[command(name = "tq-worker")]
#[command(about = "Task Queue Worker", long_about = None)]
struct Args {
    /// Path to a settings file (toml, yaml or json)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Base URL of the task queue API
    #[arg(long)]
    server_url: Option<String>,

    /// Per-task-type override file
    #[arg(long)]
    worker_ini: Option<PathBuf>,

    /// Do not run the workers declared in this binary
    #[arg(long)]
    no_scan: bool,
}

fn echo() -> Handler {
    Handler::fields(["x"], |inputs: Inputs| {
        let x: i64 = inputs.require("x")?;
        Ok(json!({ "value": x * 2 }))
    })
}

fn greet() -> Handler {
    Handler::fields(["name"], |inputs: Inputs| {
        let name: Option<String> = inputs.get_as("name")?;
        match name {
            Some(name) if !name.is_empty() => Ok(format!("Hello, {}", name)),
            _ => Err(HandlerError::terminal("name is required")),
        }
    })
}

worker_task!("echo" => echo);
worker_task!("greet" => greet, polling_interval_ms = 500);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut settings = WorkerSettings::load(args.config.as_deref())?;
    if let Some(server_url) = args.server_url {
        settings.client.server_url = server_url;
    }
    if let Some(worker_ini) = args.worker_ini {
        settings.runtime_config_path = worker_ini;
    }

    // Children install their own subscriber
    if !task_queue_worker::is_child_process() {
        tracing::dispatcher::set_global_default(logging::fmt_dispatch(&settings.logging))?;
    }

    let mut handler = TaskHandler::new(Vec::new(), &settings, !args.no_scan)?;
    tracing::info!("Running workers for {:?}", handler.task_names());

    handler.start().await?;
    handler.join().await?;
    handler.stop().await;

    Ok(())
}
