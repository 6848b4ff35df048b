use crate::{Message, MessageType, ProtocolError, Result, MAX_MESSAGE_SIZE};
use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

/// Codec for encoding/decoding messages with length-prefixed framing
///
/// Frame format: [4-byte length (big-endian)] [1-byte message type] [payload]
#[derive(Debug, Default, Clone, Copy)]
pub struct MessageCodec;

impl Decoder for MessageCodec {
    type Item = Message;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>> {
        // Need at least 5 bytes for length prefix + message type
        if src.len() < 5 {
            return Ok(None);
        }

        let mut length_bytes = [0u8; 4];
        length_bytes.copy_from_slice(&src[0..4]);
        let length = u32::from_be_bytes(length_bytes) as usize;

        if length > MAX_MESSAGE_SIZE {
            return Err(ProtocolError::MessageTooLarge(length));
        }
        // The length covers the type byte, so it is never zero
        if length == 0 {
            return Err(ProtocolError::EmptyFrame);
        }

        if src.len() < 4 + length {
            src.reserve(4 + length - src.len());
            return Ok(None);
        }

        src.advance(4);

        let msg_type_byte = src.get_u8();
        let msg_type = MessageType::from_u8(msg_type_byte)
            .ok_or(ProtocolError::InvalidMessageType(msg_type_byte))?;

        let payload = src.split_to(length - 1);

        let message = match msg_type {
            MessageType::Log => Message::Log(bincode::deserialize(&payload)?),
            MessageType::Shutdown => Message::Shutdown,
        };

        Ok(Some(message))
    }
}

impl Encoder<Message> for MessageCodec {
    type Error = ProtocolError;

    fn encode(&mut self, item: Message, dst: &mut BytesMut) -> Result<()> {
        let payload = match &item {
            Message::Log(record) => bincode::serialize(record)?,
            Message::Shutdown => Vec::new(),
        };

        let total_length = 1 + payload.len();
        if total_length > MAX_MESSAGE_SIZE {
            return Err(ProtocolError::MessageTooLarge(total_length));
        }

        dst.reserve(4 + total_length);
        dst.put_u32(total_length as u32);
        dst.put_u8(item.message_type().as_u8());
        dst.put_slice(&payload);

        Ok(())
    }
}
