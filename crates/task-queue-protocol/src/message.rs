use serde::{Deserialize, Serialize};

/// Message types on the log channel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageType {
    Log = 1,
    Shutdown = 2,
}

impl MessageType {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(MessageType::Log),
            2 => Some(MessageType::Shutdown),
            _ => None,
        }
    }

    pub fn as_u8(&self) -> u8 {
        *self as u8
    }
}

/// Log channel messages
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Message {
    /// One log record produced by a child process
    Log(LogRecord),

    /// Sentinel telling the sink to drain and exit
    Shutdown,
}

impl Message {
    pub fn message_type(&self) -> MessageType {
        match self {
            Message::Log(_) => MessageType::Log,
            Message::Shutdown => MessageType::Shutdown,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Trace => "TRACE",
            LogLevel::Debug => "DEBUG",
            LogLevel::Info => "INFO",
            LogLevel::Warn => "WARN",
            LogLevel::Error => "ERROR",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogRecord {
    /// Epoch milliseconds at the producer
    pub timestamp_ms: i64,
    pub level: LogLevel,
    /// `tracing` target of the original event
    pub target: String,
    pub message: String,
    /// Producer process id
    pub pid: u32,
    /// Producer role, e.g. the worker's task type or "metrics"
    pub source: String,
}
