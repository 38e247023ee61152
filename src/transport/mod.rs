//! # Transport Layer
//!
//! This file is part of the SCS Transport project.
//!
//! It defines the transport layer: endpoints, the per-connection
//! [`CommunicationChannel`](channel::CommunicationChannel), and the dial/listen
//! helpers for TCP and Unix domain sockets.
//!
//! ## Responsibilities
//! - Parse endpoints (`tcp://host:port`, `unix:///path`, bare `host:port`)
//! - Dial with a bounded connection-attempt timeout
//! - Accept inbound connections and wrap them in channels
//! - Provide the [`MessageTransport`] seam that messengers are built on
pub mod channel;
#[cfg(unix)]
pub mod local;
pub mod remote;

use futures::future::BoxFuture;
use std::fmt;
#[cfg(unix)]
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
#[cfg(unix)]
use tokio::net::UnixListener;
use tokio::sync::watch;

use crate::config::TransportConfig;
use crate::error::{ProtocolError, Result};
use crate::protocol::message::Message;
use channel::{ChannelOptions, CommunicationChannel};

/// Callback receiving inbound messages
pub type MessageHandler = Arc<dyn Fn(Message) + Send + Sync>;

/// Connection state of a channel or connection manager
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connected,
}

/// Anything that can carry messages for a request/reply messenger:
/// a raw channel, a client, or a server-side client handle.
pub trait MessageTransport: Send + Sync + 'static {
    /// Send one message. Fails fast with `NotConnected` when disconnected.
    fn send_message(&self, message: Message) -> BoxFuture<'_, Result<()>>;

    /// Route every inbound application message to `handler`
    fn set_message_handler(&self, handler: MessageHandler);

    /// Observe connection state changes
    fn subscribe_state(&self) -> watch::Receiver<ConnectionState>;

    /// Number of connections lost so far. Every disconnect bumps it, so a
    /// reconnect that lands before the observer wakes cannot hide one.
    fn subscribe_disconnects(&self) -> watch::Receiver<u64>;

    fn state(&self) -> ConnectionState {
        *self.subscribe_state().borrow()
    }
}

/// Where to dial or listen
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    Tcp(String),
    #[cfg(unix)]
    Unix(PathBuf),
}

impl FromStr for Endpoint {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        if let Some(addr) = s.strip_prefix("tcp://") {
            return Ok(Endpoint::Tcp(addr.to_string()));
        }
        if let Some(path) = s.strip_prefix("unix://") {
            #[cfg(unix)]
            return Ok(Endpoint::Unix(PathBuf::from(path)));
            #[cfg(not(unix))]
            return Err(ProtocolError::Config(format!(
                "unix sockets are not supported on this platform: {path}"
            )));
        }
        if s.contains("://") {
            return Err(ProtocolError::Config(format!("unknown endpoint scheme: {s}")));
        }
        if s.is_empty() {
            return Err(ProtocolError::Config("empty endpoint".to_string()));
        }
        Ok(Endpoint::Tcp(s.to_string()))
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Endpoint::Tcp(addr) => write!(f, "tcp://{addr}"),
            #[cfg(unix)]
            Endpoint::Unix(path) => write!(f, "unix://{}", path.display()),
        }
    }
}

/// Dial `endpoint` and wrap the stream in a channel that is not started yet
pub async fn dial(
    endpoint: &Endpoint,
    connect_timeout: Duration,
    config: &TransportConfig,
    options: ChannelOptions,
) -> Result<Arc<CommunicationChannel>> {
    match endpoint {
        Endpoint::Tcp(addr) => {
            let stream = remote::connect(addr, connect_timeout, config.no_delay).await?;
            Ok(CommunicationChannel::new(stream, addr.clone(), options))
        }
        #[cfg(unix)]
        Endpoint::Unix(path) => {
            let stream = local::connect(path, connect_timeout).await?;
            Ok(CommunicationChannel::new(
                stream,
                path.display().to_string(),
                options,
            ))
        }
    }
}

/// A bound listening socket
#[derive(Debug)]
pub enum Listener {
    Tcp(TcpListener),
    #[cfg(unix)]
    Unix(UnixListener, PathBuf),
}

impl Listener {
    pub async fn bind(endpoint: &Endpoint) -> Result<Self> {
        match endpoint {
            Endpoint::Tcp(addr) => Ok(Listener::Tcp(remote::bind(addr).await?)),
            #[cfg(unix)]
            Endpoint::Unix(path) => Ok(Listener::Unix(local::bind(path).await?, path.clone())),
        }
    }

    /// Accept one connection as a channel that is not started yet
    pub async fn accept(
        &self,
        config: &TransportConfig,
        options: ChannelOptions,
    ) -> Result<Arc<CommunicationChannel>> {
        match self {
            Listener::Tcp(listener) => {
                let (stream, peer) = remote::accept(listener, config.no_delay).await?;
                Ok(CommunicationChannel::new(stream, peer, options))
            }
            #[cfg(unix)]
            Listener::Unix(listener, _) => {
                let (stream, peer) = local::accept(listener).await?;
                Ok(CommunicationChannel::new(stream, peer, options))
            }
        }
    }

    /// The endpoint actually bound, useful when binding port 0
    pub fn local_endpoint(&self) -> Result<Endpoint> {
        match self {
            Listener::Tcp(listener) => Ok(Endpoint::Tcp(listener.local_addr()?.to_string())),
            #[cfg(unix)]
            Listener::Unix(_, path) => Ok(Endpoint::Unix(path.clone())),
        }
    }

    /// Release resources tied to the endpoint (the socket file for UDS)
    pub fn cleanup(&self) {
        match self {
            Listener::Tcp(_) => {}
            #[cfg(unix)]
            Listener::Unix(_, path) => local::cleanup(path),
        }
    }
}
