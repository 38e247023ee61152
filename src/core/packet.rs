//! # Packet
//!
//! This file is part of the SCS Transport project.
//!
//! It defines the `Packet` structure: the payload of exactly one frame, as
//! carried between the frame codec and the wire protocol.
//!
//! Frame layout on the wire:
//!
//! ```text
//! +--------+--------+--------+--------+--------+--------+----------------------+
//! | sync marker     | payload length (i32, big-endian)  | payload (N bytes)    |
//! | 0x53   | 0x43   |                                   |                      |
//! +--------+--------+--------+--------+--------+--------+----------------------+
//! ```
//!
//! The payload itself is opaque at this level; the wire protocol decides how a
//! [`Message`](crate::protocol::message::Message) maps onto it.
use bytes::Bytes;

use crate::config::SYNC_MARKER;

/// Length of the length field
pub const LENGTH_FIELD_SIZE: usize = 4;

/// Total size of the fixed-length header
pub const HEADER_SIZE: usize = SYNC_MARKER.len() + LENGTH_FIELD_SIZE; // 2 marker + 4 length

/// The payload of one frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub payload: Bytes,
}

impl Packet {
    pub fn new(payload: impl Into<Bytes>) -> Self {
        Self {
            payload: payload.into(),
        }
    }

    pub fn len(&self) -> usize {
        self.payload.len()
    }

    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }
}
