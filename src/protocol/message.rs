//! Message envelope exchanged over a channel.
//!
//! Every message carries a unique [`MessageId`] generated at construction and an
//! optional replied-message id. A reply's `replied_id` equals the id of the
//! request it answers; that is the only correlation key.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::error::{ProtocolError, Result};

/// Globally unique message identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MessageId(Uuid);

impl MessageId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for MessageId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// A single serialized value: one invocation parameter or a return value.
///
/// Values are encoded with bincode so that each position in a parameter list
/// round-trips losslessly into the type the receiving side expects.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncodedValue(Vec<u8>);

impl EncodedValue {
    pub fn encode<T: Serialize + ?Sized>(value: &T) -> Result<Self> {
        bincode::serialize(value)
            .map(Self)
            .map_err(|e| ProtocolError::SerializeError(e.to_string()))
    }

    pub fn decode<T: DeserializeOwned>(&self) -> Result<T> {
        bincode::deserialize(&self.0).map_err(|e| ProtocolError::DeserializeError(e.to_string()))
    }

    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

/// Error information captured on the remote side of an invocation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteException {
    /// Short classification, e.g. `MethodNotFound` or a service-defined name
    pub kind: String,
    pub message: String,
}

impl RemoteException {
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
        }
    }

    pub fn service_not_found(service: &str) -> Self {
        Self::new("ServiceNotFound", format!("no service named '{service}'"))
    }

    pub fn method_not_found(service: &str, method: &str) -> Self {
        Self::new(
            "MethodNotFound",
            format!("service '{service}' has no method '{method}'"),
        )
    }

    pub fn invalid_arguments(reason: impl fmt::Display) -> Self {
        Self::new("InvalidArguments", reason.to_string())
    }
}

impl fmt::Display for RemoteException {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

impl std::error::Error for RemoteException {}

impl From<ProtocolError> for RemoteException {
    fn from(err: ProtocolError) -> Self {
        match err {
            ProtocolError::SerializeError(_) | ProtocolError::DeserializeError(_) => {
                Self::invalid_arguments(err)
            }
            ProtocolError::RemoteInvocation { kind, message } => Self { kind, message },
            other => Self::new("ProtocolError", other.to_string()),
        }
    }
}

impl From<RemoteException> for ProtocolError {
    fn from(ex: RemoteException) -> Self {
        ProtocolError::RemoteInvocation {
            kind: ex.kind,
            message: ex.message,
        }
    }
}

/// Message variants. The serde variant tag is the type discriminator on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageBody {
    /// Content-free keep-alive
    Ping,
    Raw(Vec<u8>),
    Text(String),
    RemoteInvoke {
        service_name: String,
        method_name: String,
        parameters: Vec<EncodedValue>,
    },
    RemoteInvokeReturn {
        return_value: Option<EncodedValue>,
        remote_exception: Option<RemoteException>,
    },
}

impl MessageBody {
    /// Short name used in logs
    pub fn kind(&self) -> &'static str {
        match self {
            MessageBody::Ping => "PING",
            MessageBody::Raw(_) => "RAW",
            MessageBody::Text(_) => "TEXT",
            MessageBody::RemoteInvoke { .. } => "INVOKE",
            MessageBody::RemoteInvokeReturn { .. } => "INVOKE_RETURN",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub replied_id: Option<MessageId>,
    pub body: MessageBody,
}

impl Message {
    pub fn new(body: MessageBody) -> Self {
        Self {
            id: MessageId::new(),
            replied_id: None,
            body,
        }
    }

    /// A new message answering `request`
    pub fn reply_to(request: &Message, body: MessageBody) -> Self {
        Self {
            id: MessageId::new(),
            replied_id: Some(request.id),
            body,
        }
    }

    pub fn ping() -> Self {
        Self::new(MessageBody::Ping)
    }

    pub fn raw(bytes: impl Into<Vec<u8>>) -> Self {
        Self::new(MessageBody::Raw(bytes.into()))
    }

    pub fn text(text: impl Into<String>) -> Self {
        Self::new(MessageBody::Text(text.into()))
    }

    pub fn invoke(
        service_name: impl Into<String>,
        method_name: impl Into<String>,
        parameters: Vec<EncodedValue>,
    ) -> Self {
        Self::new(MessageBody::RemoteInvoke {
            service_name: service_name.into(),
            method_name: method_name.into(),
            parameters,
        })
    }

    /// Reply to an invocation with either its return value or the captured exception
    pub fn invoke_return(
        request: &Message,
        outcome: std::result::Result<EncodedValue, RemoteException>,
    ) -> Self {
        let body = match outcome {
            Ok(value) => MessageBody::RemoteInvokeReturn {
                return_value: Some(value),
                remote_exception: None,
            },
            Err(ex) => MessageBody::RemoteInvokeReturn {
                return_value: None,
                remote_exception: Some(ex),
            },
        };
        Self::reply_to(request, body)
    }

    pub fn is_reply(&self) -> bool {
        self.replied_id.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ids_are_unique() {
        let a = Message::ping();
        let b = Message::ping();
        assert_ne!(a.id, b.id);
    }

    #[test]
    fn test_reply_correlates_to_request() {
        let request = Message::text("question");
        let reply = Message::reply_to(&request, MessageBody::Text("answer".into()));

        assert_eq!(reply.replied_id, Some(request.id));
        assert_ne!(reply.id, request.id);
        assert!(reply.is_reply());
        assert!(!request.is_reply());
    }

    #[test]
    fn test_encoded_value_keeps_type() {
        let value = EncodedValue::encode(&(7i64, "seven".to_string())).unwrap();
        let decoded: (i64, String) = value.decode().unwrap();
        assert_eq!(decoded, (7, "seven".to_string()));

        let wrong: Result<Vec<u64>> = EncodedValue::from_bytes(vec![0xff]).decode();
        assert!(matches!(wrong, Err(ProtocolError::DeserializeError(_))));
    }

    #[test]
    fn test_exception_conversion() {
        let err: ProtocolError = RemoteException::new("Boom", "it broke").into();
        match err {
            ProtocolError::RemoteInvocation { kind, message } => {
                assert_eq!(kind, "Boom");
                assert_eq!(message, "it broke");
            }
            other => panic!("unexpected {other:?}"),
        }
    }
}
