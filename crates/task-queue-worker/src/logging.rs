//! Cross-process log shipping.
//!
//! Child processes log through a [`ChannelLayer`], which pushes each event
//! into a bounded channel without blocking. [`forward_logs`] drains that
//! channel onto the sink's Unix socket. The sink process runs
//! [`run_log_sink`], re-emitting every record through its own subscriber
//! until it receives the [`Message::Shutdown`] sentinel.

use crate::config::LoggingSettings;
use crate::error::{Result, WorkerError};
use futures::{SinkExt, StreamExt};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use task_queue_protocol::{LogLevel, LogRecord, Message, MessageCodec};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;
use tracing::field::{Field, Visit};
use tracing::instrument::WithSubscriber;
use tracing::{debug, error, info, trace, warn, Dispatch, Event, Level, Subscriber};
use tracing_subscriber::layer::{Context, SubscriberExt};
use tracing_subscriber::{EnvFilter, Layer};

const CONNECT_ATTEMPTS: u32 = 100;
const CONNECT_BACKOFF: Duration = Duration::from_millis(50);
const DRAIN_TIMEOUT: Duration = Duration::from_millis(500);

/// Layer that turns events into [`LogRecord`]s on a bounded channel.
/// When the channel is full the record is dropped and counted.
pub struct ChannelLayer {
    sender: mpsc::Sender<LogRecord>,
    source: String,
    pid: u32,
    dropped: Arc<AtomicU64>,
}

impl ChannelLayer {
    pub fn new(sender: mpsc::Sender<LogRecord>, source: impl Into<String>) -> Self {
        ChannelLayer {
            sender,
            source: source.into(),
            pid: std::process::id(),
            dropped: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Counter of records dropped because the channel was full
    pub fn dropped(&self) -> Arc<AtomicU64> {
        self.dropped.clone()
    }
}

impl<S: Subscriber> Layer<S> for ChannelLayer {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let metadata = event.metadata();
        let mut visitor = MessageVisitor::default();
        event.record(&mut visitor);

        let record = LogRecord {
            timestamp_ms: chrono::Utc::now().timestamp_millis(),
            level: log_level(metadata.level()),
            target: metadata.target().to_string(),
            message: visitor.finish(),
            pid: self.pid,
            source: self.source.clone(),
        };

        if self.sender.try_send(record).is_err() {
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
    }
}

#[derive(Default)]
struct MessageVisitor {
    message: String,
    fields: Vec<String>,
}

impl MessageVisitor {
    fn finish(self) -> String {
        if self.fields.is_empty() {
            self.message
        } else {
            format!("{} {}", self.message, self.fields.join(" "))
        }
    }
}

impl Visit for MessageVisitor {
    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            self.message = value.to_string();
        } else {
            self.fields.push(format!("{}={}", field.name(), value));
        }
    }

    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        if field.name() == "message" {
            self.message = format!("{:?}", value);
        } else {
            self.fields.push(format!("{}={:?}", field.name(), value));
        }
    }
}

fn log_level(level: &Level) -> LogLevel {
    match *level {
        Level::TRACE => LogLevel::Trace,
        Level::DEBUG => LogLevel::Debug,
        Level::INFO => LogLevel::Info,
        Level::WARN => LogLevel::Warn,
        Level::ERROR => LogLevel::Error,
    }
}

fn env_filter(level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level))
}

/// Subscriber for a child process that ships everything to the sink.
/// Returns the dispatcher, the receiving end of its channel and the
/// dropped-record counter.
pub fn channel_dispatch(
    source: impl Into<String>,
    settings: &LoggingSettings,
) -> (Dispatch, mpsc::Receiver<LogRecord>, Arc<AtomicU64>) {
    let (sender, receiver) = mpsc::channel(settings.channel_capacity.max(1));
    let layer = ChannelLayer::new(sender, source);
    let dropped = layer.dropped();

    let subscriber = tracing_subscriber::registry()
        .with(env_filter(&settings.level))
        .with(layer);

    (Dispatch::new(subscriber), receiver, dropped)
}

/// Subscriber that writes to stderr, used by the host and the sink
pub fn fmt_dispatch(settings: &LoggingSettings) -> Dispatch {
    let registry = tracing_subscriber::registry().with(env_filter(&settings.level));
    if settings.json {
        Dispatch::new(registry.with(tracing_subscriber::fmt::layer().json().with_target(false)))
    } else {
        Dispatch::new(registry.with(tracing_subscriber::fmt::layer().with_target(false)))
    }
}

async fn connect(path: &Path) -> std::io::Result<UnixStream> {
    let mut attempt = 0;
    loop {
        match UnixStream::connect(path).await {
            Ok(stream) => return Ok(stream),
            Err(e) if attempt + 1 >= CONNECT_ATTEMPTS => return Err(e),
            Err(_) => {
                attempt += 1;
                tokio::time::sleep(CONNECT_BACKOFF).await;
            }
        }
    }
}

/// Ship records from `receiver` to the sink at `socket` until `close` is
/// cancelled, then send whatever is still buffered.
///
/// This task must not log through `tracing`: its own records would land
/// back in the channel it drains. Transport failures go to stderr.
pub async fn forward_logs(
    socket: PathBuf,
    mut receiver: mpsc::Receiver<LogRecord>,
    close: CancellationToken,
) {
    let stream = match connect(&socket).await {
        Ok(stream) => stream,
        Err(e) => {
            eprintln!("log forwarder: cannot reach sink at {:?}: {}", socket, e);
            return;
        }
    };
    let mut framed = FramedWrite::new(stream, MessageCodec);

    loop {
        let record = tokio::select! {
            record = receiver.recv() => record,
            _ = close.cancelled() => {
                receiver.close();
                receiver.recv().await
            }
        };
        let Some(record) = record else {
            break;
        };

        if let Err(e) = framed.send(Message::Log(record)).await {
            eprintln!("log forwarder: sink connection lost: {}", e);
            match connect(&socket).await {
                Ok(stream) => framed = FramedWrite::new(stream, MessageCodec),
                Err(_) => return,
            }
        }
    }

    let _ = framed.close().await;
}

/// Tell the sink at `socket` to drain and exit
pub async fn send_shutdown(socket: &Path) -> Result<()> {
    let stream = UnixStream::connect(socket)
        .await
        .map_err(|source| WorkerError::LogSocket {
            path: socket.to_path_buf(),
            source,
        })?;
    let mut framed = FramedWrite::new(stream, MessageCodec);
    framed.send(Message::Shutdown).await?;
    let _ = framed.close().await;
    Ok(())
}

/// Bind the sink socket, replacing a stale file left by a previous run
pub fn bind_sink(socket: &Path) -> Result<UnixListener> {
    if socket.exists() {
        let _ = std::fs::remove_file(socket);
    }
    UnixListener::bind(socket).map_err(|source| WorkerError::LogSocket {
        path: socket.to_path_buf(),
        source,
    })
}

/// Sink loop. Accepts producer connections and re-emits their records
/// until the shutdown sentinel arrives or `stop` is cancelled, then drains
/// open connections for a short while. Returns the number of records
/// re-emitted.
pub async fn run_log_sink(listener: UnixListener, stop: CancellationToken) -> u64 {
    let sentinel = CancellationToken::new();
    let mut connections: JoinSet<u64> = JoinSet::new();
    let mut emitted = 0;

    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, _)) => {
                    connections.spawn(
                        read_connection(stream, sentinel.clone()).with_current_subscriber(),
                    );
                }
                Err(e) => {
                    warn!("Log sink accept failed: {}", e);
                }
            },
            Some(done) = connections.join_next(), if !connections.is_empty() => {
                emitted += done.unwrap_or(0);
            }
            _ = sentinel.cancelled() => break,
            _ = stop.cancelled() => break,
        }
    }

    let drain = async {
        let mut drained = 0;
        while let Some(done) = connections.join_next().await {
            drained += done.unwrap_or(0);
        }
        drained
    };
    match tokio::time::timeout(DRAIN_TIMEOUT, drain).await {
        Ok(drained) => emitted += drained,
        Err(_) => {
            debug!("Log sink drain timed out, {} connection(s) open", connections.len());
            connections.abort_all();
        }
    }

    info!("Log sink stopped after {} record(s)", emitted);
    emitted
}

async fn read_connection(stream: UnixStream, sentinel: CancellationToken) -> u64 {
    let mut framed = FramedRead::new(stream, MessageCodec);
    let mut emitted = 0;

    while let Some(frame) = framed.next().await {
        match frame {
            Ok(Message::Log(record)) => {
                emit(&record);
                emitted += 1;
            }
            Ok(Message::Shutdown) => {
                sentinel.cancel();
                break;
            }
            Err(e) => {
                warn!("Dropping log connection: {}", e);
                break;
            }
        }
    }
    emitted
}

/// Re-emit a producer's record, keeping its own target and clock
fn emit(record: &LogRecord) {
    let pid = record.pid;
    let source = record.source.as_str();
    let origin = record.target.as_str();
    let ts_ms = record.timestamp_ms;
    let message = record.message.as_str();
    match record.level {
        LogLevel::Trace => trace!(pid, source, origin, ts_ms, "{}", message),
        LogLevel::Debug => debug!(pid, source, origin, ts_ms, "{}", message),
        LogLevel::Info => info!(pid, source, origin, ts_ms, "{}", message),
        LogLevel::Warn => warn!(pid, source, origin, ts_ms, "{}", message),
        LogLevel::Error => error!(pid, source, origin, ts_ms, "{}", message),
    }
}
