//! # Remote Transport
//!
//! This file is part of the SCS Transport project.
//!
//! TCP dial and listen helpers. Every dial attempt is bounded by a timeout, and
//! every failure to reach the peer is reported as
//! [`ProtocolError::ConnectionFailed`] so callers see a single error kind.
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, instrument};

use crate::error::{ProtocolError, Result};
use crate::utils::timeout::with_timeout_error;

/// Connect to a TCP endpoint within `connect_timeout`
#[instrument(skip(connect_timeout, no_delay), fields(address = %addr))]
pub async fn connect(addr: &str, connect_timeout: Duration, no_delay: bool) -> Result<TcpStream> {
    let attempt = async {
        TcpStream::connect(addr)
            .await
            .map_err(|e| ProtocolError::ConnectionFailed(format!("{addr}: {e}")))
    };
    let stream = with_timeout_error(attempt, connect_timeout)
        .await
        .map_err(|e| match e {
            ProtocolError::Timeout => ProtocolError::ConnectionFailed(format!(
                "{addr}: no answer within {connect_timeout:?}"
            )),
            other => other,
        })?;

    if let Err(e) = stream.set_nodelay(no_delay) {
        debug!(error = %e, "Could not set TCP_NODELAY");
    }
    debug!("Connected");
    Ok(stream)
}

/// Bind a TCP listener
#[instrument(fields(address = %addr))]
pub async fn bind(addr: &str) -> Result<TcpListener> {
    let listener = TcpListener::bind(addr)
        .await
        .map_err(|e| ProtocolError::ConnectionFailed(format!("bind {addr}: {e}")))?;
    info!(local = ?listener.local_addr().ok(), "Listening");
    Ok(listener)
}

/// Accept one connection, returning the stream and the peer address
pub async fn accept(listener: &TcpListener, no_delay: bool) -> Result<(TcpStream, String)> {
    let (stream, peer) = listener.accept().await?;
    if let Err(e) = stream.set_nodelay(no_delay) {
        debug!(peer = %peer, error = %e, "Could not set TCP_NODELAY");
    }
    Ok((stream, peer.to_string()))
}
