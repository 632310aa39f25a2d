//! Framing codec for control messages

use crate::messages::TunnelMessage;
use bytes::{Bytes, BytesMut};
use thiserror::Error;

/// Codec errors
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("Serialization error: {0}")]
    SerializationError(#[from] bincode::Error),

    #[error("Message too large: {0} bytes")]
    MessageTooLarge(usize),
}

/// Length-prefixed bincode framing for [`TunnelMessage`]
///
/// Format: `[length: u32 big-endian][payload: bincode]`. Control messages are
/// small; relay payloads never go through this codec.
pub struct TunnelCodec;

impl TunnelCodec {
    /// Maximum control message size (64KB)
    pub const MAX_MESSAGE_SIZE: usize = 64 * 1024;

    /// Encode a control message to bytes
    pub fn encode(msg: &TunnelMessage) -> Result<Bytes, CodecError> {
        let payload = bincode::serialize(msg)?;

        if payload.len() > Self::MAX_MESSAGE_SIZE {
            return Err(CodecError::MessageTooLarge(payload.len()));
        }

        let mut buf = BytesMut::with_capacity(4 + payload.len());
        buf.extend_from_slice(&(payload.len() as u32).to_be_bytes());
        buf.extend_from_slice(&payload);

        Ok(buf.freeze())
    }

    /// Decode one control message from the front of `buf`
    ///
    /// Returns `Ok(Some(message))` when a complete frame was consumed,
    /// `Ok(None)` when more data is needed.
    pub fn decode(buf: &mut BytesMut) -> Result<Option<TunnelMessage>, CodecError> {
        if buf.len() < 4 {
            return Ok(None);
        }

        let mut length_bytes = [0u8; 4];
        length_bytes.copy_from_slice(&buf[..4]);
        let length = u32::from_be_bytes(length_bytes) as usize;

        if length > Self::MAX_MESSAGE_SIZE {
            return Err(CodecError::MessageTooLarge(length));
        }

        if buf.len() < 4 + length {
            return Ok(None);
        }

        let _ = buf.split_to(4);
        let msg_bytes = buf.split_to(length);

        let msg: TunnelMessage = bincode::deserialize(&msg_bytes)?;

        Ok(Some(msg))
    }
}
