//! # Error
//!
//! This file is part of the SCS Transport project.
//!
//! It defines the error types used throughout the messaging layer.
//!
//! Errors fall into two families:
//! - transport-level failures (dial, framing, I/O) which end a channel and are
//!   observed by higher layers as a disconnect
//! - call-level failures (timeout, cancellation, remote exceptions) which are
//!   returned only to the caller of the operation that failed
//!
//! It uses the `thiserror` crate for ergonomic error definition.
//!
//! A custom `Result<T>` alias is provided to simplify signatures across the stack.
//!
//! # Example Usage
//! ```rust
//! use scs_transport::error::{ProtocolError, Result};
//!
//! fn check_len(len: usize) -> Result<()> {
//!     if len > 16 {
//!         return Err(ProtocolError::OversizedPacket(len));
//!     }
//!     Ok(())
//! }
//!
//! assert!(check_len(4).is_ok());
//! assert!(matches!(check_len(64), Err(ProtocolError::OversizedPacket(64))));
//! ```

use std::io;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, ProtocolError>;

#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Not connected")]
    NotConnected,

    #[error("Corrupt frame: {0}")]
    FrameCorrupt(String),

    #[error("Packet too large: {0} bytes")]
    OversizedPacket(usize),

    #[error("Serialize error: {0}")]
    SerializeError(String),

    #[error("Deserialize error: {0}")]
    DeserializeError(String),

    #[error("Unsupported wire version: {0}")]
    UnsupportedVersion(u8),

    #[error("Timeout occurred")]
    Timeout,

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Remote invocation failed ({kind}): {message}")]
    RemoteInvocation { kind: String, message: String },

    #[error("Unexpected message type")]
    UnexpectedMessage,

    #[error("Dispatch queue full (capacity {0})")]
    QueueFull(usize),

    #[error("Already started")]
    AlreadyStarted,

    #[error("Message handler is owned by a serving messenger")]
    HandlerInUse,

    #[error("Configuration error: {0}")]
    Config(String),
}

impl ProtocolError {
    /// Whether this error leaves the underlying stream unusable.
    ///
    /// Fatal errors end the receive loop and disconnect the channel; the rest
    /// are reported per message while the connection stays up.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ProtocolError::Io(_)
                | ProtocolError::ConnectionClosed
                | ProtocolError::FrameCorrupt(_)
                | ProtocolError::OversizedPacket(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatal_classification() {
        assert!(ProtocolError::FrameCorrupt("bad marker".into()).is_fatal());
        assert!(ProtocolError::ConnectionClosed.is_fatal());
        assert!(ProtocolError::Io(io::Error::other("reset")).is_fatal());

        assert!(!ProtocolError::DeserializeError("garbage".into()).is_fatal());
        assert!(!ProtocolError::UnsupportedVersion(9).is_fatal());
        assert!(!ProtocolError::Timeout.is_fatal());
    }

    #[test]
    fn test_remote_invocation_display() {
        let err = ProtocolError::RemoteInvocation {
            kind: "DivideByZero".into(),
            message: "cannot divide 4 by zero".into(),
        };
        assert_eq!(
            err.to_string(),
            "Remote invocation failed (DivideByZero): cannot divide 4 by zero"
        );
    }
}
