//! # SCS Transport
//! This file is part of the SCS Transport project.
//!
//! It provides a point-to-point messaging and RPC transport: length-prefixed
//! frames over TCP or Unix sockets, client and server connection managers,
//! a request/reply messenger that correlates replies by message id, and
//! typed remote-invocation proxies.
//!
//! The main components include:
//! - Core: frame layout and codec
//! - Protocol: message model, wire encoding, keep-alive, service dispatch
//! - Transport: endpoints, channels, TCP and UDS helpers
//! - Service: client, server, messenger and proxy
//! - Utils: event slots, logging, timeouts
pub mod config;
pub mod error;

pub mod core {
    pub mod codec;
    pub mod packet;
}

pub mod protocol;
pub mod service;
pub mod transport;
pub mod utils;

pub use config::NetworkConfig;
pub use self::core::codec::FrameCodec;
pub use self::core::packet::Packet;
pub use error::{ProtocolError, Result};
pub use protocol::dispatcher::{MethodTable, RemoteService, ServiceDispatcher};
pub use protocol::message::{EncodedValue, Message, MessageBody, MessageId, RemoteException};
pub use service::client::ScsClient;
pub use service::daemon::{ScsServer, ServerClient};
pub use service::messenger::RequestReplyMessenger;
pub use service::proxy::{create_service_proxy, RemoteInterface, ServiceProxy};
pub use transport::channel::CommunicationChannel;
pub use transport::{ConnectionState, Endpoint};
