//! Wire format of the cross-process log channel.
//!
//! Task runner processes ship their log records to the single logging sink
//! process over a local stream socket; each frame carries one [`Message`].

mod message;
mod codec;

pub use message::{Message, MessageType, LogRecord, LogLevel};
pub use codec::MessageCodec;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("Invalid message type: {0}")]
    InvalidMessageType(u8),

    #[error("Message too large: {0} bytes")]
    MessageTooLarge(usize),

    #[error("Frame length is zero")]
    EmptyFrame,

    #[error("Serialization error: {0}")]
    SerializationError(#[from] bincode::Error),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, ProtocolError>;

/// Maximum frame size: 1MB, far above any sane log line
pub const MAX_MESSAGE_SIZE: usize = 1024 * 1024;
