//! Codec for encoding/decoding control messages
//!
//! The control connection is message-framed by the transport (one WebSocket
//! binary frame per message), so the codec only serializes a single payload.

use crate::messages::ControlMessage;
use bytes::Bytes;
use thiserror::Error;

/// Codec errors
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("Serialization error: {0}")]
    SerializationError(#[from] bincode::Error),

    #[error("Message too large: {0} bytes")]
    MessageTooLarge(usize),

    #[error("Empty frame")]
    EmptyFrame,
}

/// Control message codec
pub struct ControlCodec;

impl ControlCodec {
    /// Maximum message size (16MB)
    pub const MAX_MESSAGE_SIZE: usize = crate::MAX_FRAME_SIZE;

    /// Encode a control message into a single frame payload
    pub fn encode(msg: &ControlMessage) -> Result<Bytes, CodecError> {
        let payload = bincode::serialize(msg)?;

        if payload.len() > Self::MAX_MESSAGE_SIZE {
            return Err(CodecError::MessageTooLarge(payload.len()));
        }

        Ok(Bytes::from(payload))
    }

    /// Decode a control message from a single frame payload
    pub fn decode(frame: &[u8]) -> Result<ControlMessage, CodecError> {
        if frame.is_empty() {
            return Err(CodecError::EmptyFrame);
        }

        if frame.len() > Self::MAX_MESSAGE_SIZE {
            return Err(CodecError::MessageTooLarge(frame.len()));
        }

        Ok(bincode::deserialize(frame)?)
    }
}
