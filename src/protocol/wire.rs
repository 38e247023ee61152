//! Wire protocols: how a [`Message`] becomes a frame payload and back.
//!
//! Framing (sync marker and length) is handled by
//! [`FrameCodec`](crate::core::codec::FrameCodec); a wire protocol only sees
//! complete payloads. Decoding failures here are per-message errors and never
//! end the connection on their own.

use std::fmt::Debug;

use crate::config::WIRE_VERSION;
use crate::error::{ProtocolError, Result};
use crate::protocol::message::Message;

/// Pluggable payload serialization
pub trait WireProtocol: Debug + Send + Sync + 'static {
    fn encode(&self, message: &Message) -> Result<Vec<u8>>;

    fn decode(&self, payload: &[u8]) -> Result<Message>;
}

/// Default protocol: one version byte followed by the bincode encoding of the message.
#[derive(Debug, Clone, Copy, Default)]
pub struct BinaryWireProtocol;

impl WireProtocol for BinaryWireProtocol {
    fn encode(&self, message: &Message) -> Result<Vec<u8>> {
        let body =
            bincode::serialize(message).map_err(|e| ProtocolError::SerializeError(e.to_string()))?;

        let mut payload = Vec::with_capacity(1 + body.len());
        payload.push(WIRE_VERSION);
        payload.extend_from_slice(&body);
        Ok(payload)
    }

    fn decode(&self, payload: &[u8]) -> Result<Message> {
        let (&version, body) = payload
            .split_first()
            .ok_or_else(|| ProtocolError::DeserializeError("empty payload".to_string()))?;

        if version != WIRE_VERSION {
            return Err(ProtocolError::UnsupportedVersion(version));
        }

        bincode::deserialize(body).map_err(|e| ProtocolError::DeserializeError(e.to_string()))
    }
}
