//! # Codec
//!
//! This file is part of the SCS Transport project.
//!
//! It defines the frame codec used on every channel. `FrameCodec` implements the
//! [`Decoder`] and [`Encoder`] traits from [`tokio_util::codec`], so a socket
//! half wrapped in `FramedRead`/`FramedWrite` yields and accepts whole [`Packet`]s.
//!
//! ## Responsibilities
//! - Validate the sync marker of every frame
//! - Read the signed length header and wait until the full payload is buffered
//! - Reject negative and oversized lengths before allocating
//! - Report a stream that ends inside a frame as truncated
//!
//! A stream that ends cleanly between frames is not an error: the framed reader
//! yields `None`, which the channel treats as the peer closing the connection.

use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::config::{MAX_PAYLOAD_SIZE, SYNC_MARKER};
use crate::core::packet::{Packet, HEADER_SIZE, LENGTH_FIELD_SIZE};
use crate::error::{ProtocolError, Result};

#[derive(Debug, Clone, Copy)]
pub struct FrameCodec {
    max_payload_size: usize,
}

impl FrameCodec {
    pub fn new(max_payload_size: usize) -> Self {
        Self { max_payload_size }
    }

    pub fn max_payload_size(&self) -> usize {
        self.max_payload_size
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new(MAX_PAYLOAD_SIZE)
    }
}

impl Decoder for FrameCodec {
    type Item = Packet;
    type Error = ProtocolError;

    /// Decodes a packet from the byte stream
    ///
    /// Returns `None` if there aren't enough bytes to form a complete packet.
    ///
    /// # Errors
    /// Returns `ProtocolError::FrameCorrupt` on a sync marker mismatch or a
    /// negative length, and `ProtocolError::OversizedPacket` when the length
    /// exceeds the configured maximum.
    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Packet>> {
        let marker_len = SYNC_MARKER.len();
        if src.len() < marker_len {
            return Ok(None);
        }

        if src[..marker_len] != SYNC_MARKER {
            return Err(ProtocolError::FrameCorrupt(format!(
                "sync marker mismatch: {:02x?}",
                &src[..marker_len]
            )));
        }

        if src.len() < HEADER_SIZE {
            return Ok(None);
        }

        let mut length_bytes = [0u8; LENGTH_FIELD_SIZE];
        length_bytes.copy_from_slice(&src[marker_len..HEADER_SIZE]);
        let declared = i32::from_be_bytes(length_bytes);

        let len = usize::try_from(declared)
            .map_err(|_| ProtocolError::FrameCorrupt(format!("negative frame length {declared}")))?;
        if len > self.max_payload_size {
            return Err(ProtocolError::OversizedPacket(len));
        }

        let total_len = HEADER_SIZE + len;
        if src.len() < total_len {
            src.reserve(total_len - src.len());
            return Ok(None); // Wait for full frame
        }

        src.advance(HEADER_SIZE);
        let payload = src.split_to(len).freeze();
        Ok(Some(Packet { payload }))
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Packet>> {
        match self.decode(src)? {
            Some(packet) => Ok(Some(packet)),
            None if src.is_empty() => Ok(None),
            None => Err(ProtocolError::FrameCorrupt(format!(
                "stream ended inside a frame ({} bytes buffered)",
                src.len()
            ))),
        }
    }
}

impl Encoder<Packet> for FrameCodec {
    type Error = ProtocolError;

    /// Encodes a packet into the byte stream
    ///
    /// # Errors
    /// Returns `ProtocolError::OversizedPacket` if the payload exceeds the
    /// configured maximum or cannot be described by the signed length field.
    fn encode(&mut self, packet: Packet, dst: &mut BytesMut) -> Result<()> {
        let len = packet.payload.len();
        if len > self.max_payload_size {
            return Err(ProtocolError::OversizedPacket(len));
        }
        let declared = i32::try_from(len).map_err(|_| ProtocolError::OversizedPacket(len))?;

        dst.reserve(HEADER_SIZE + len);
        dst.put_slice(&SYNC_MARKER);
        dst.put_i32(declared);
        dst.put_slice(&packet.payload);

        Ok(())
    }
}
