use std::path::Path;
use std::time::Duration;
use tokio::net::{UnixListener, UnixStream};
use tracing::{debug, info, warn};

use crate::error::{ProtocolError, Result};
use crate::utils::timeout::with_timeout_error;

/// Connect to a local UDS socket within `connect_timeout`
pub async fn connect<P: AsRef<Path>>(path: P, connect_timeout: Duration) -> Result<UnixStream> {
    let path = path.as_ref();
    let attempt = async {
        UnixStream::connect(path)
            .await
            .map_err(|e| ProtocolError::ConnectionFailed(format!("{}: {e}", path.display())))
    };
    with_timeout_error(attempt, connect_timeout)
        .await
        .map_err(|e| match e {
            ProtocolError::Timeout => ProtocolError::ConnectionFailed(format!(
                "{}: no answer within {connect_timeout:?}",
                path.display()
            )),
            other => other,
        })
}

/// Bind a UDS listener, replacing a stale socket file left by a previous run
pub async fn bind<P: AsRef<Path>>(path: P) -> Result<UnixListener> {
    let path = path.as_ref();
    if path.exists() {
        tokio::fs::remove_file(path).await.ok();
    }

    let listener = UnixListener::bind(path)
        .map_err(|e| ProtocolError::ConnectionFailed(format!("bind {}: {e}", path.display())))?;
    info!(path = %path.display(), "Listening");
    Ok(listener)
}

pub async fn accept(listener: &UnixListener) -> Result<(UnixStream, String)> {
    let (stream, addr) = listener.accept().await?;
    let peer = addr
        .as_pathname()
        .map(|p| p.display().to_string())
        .unwrap_or_else(|| "unix:unnamed".to_string());
    debug!(peer = %peer, "Accepted");
    Ok((stream, peer))
}

/// Remove the socket file once the listener is gone
pub fn cleanup<P: AsRef<Path>>(path: P) {
    let path = path.as_ref();
    if let Err(e) = std::fs::remove_file(path) {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!(path = %path.display(), error = %e, "Could not remove socket file");
        }
    }
}
