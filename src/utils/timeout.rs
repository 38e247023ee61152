use std::time::Duration;
use tokio::time;

use crate::error::{ProtocolError, Result};

/// Default bound on a single dial attempt (15 seconds)
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(15);

/// Default keep-alive timer period (30 seconds)
pub const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(30);

/// Idle time after which the keep-alive timer actually sends a ping (60 seconds)
pub const KEEPALIVE_IDLE_THRESHOLD: Duration = Duration::from_secs(60);

/// Default wait for a correlated reply (60 seconds)
pub const RESPONSE_TIMEOUT: Duration = Duration::from_millis(60_000);

/// Wrap an async operation with a timeout, converting Elapsed errors to ProtocolError::Timeout
pub async fn with_timeout_error<T>(
    operation: impl std::future::Future<Output = Result<T>>,
    duration: Duration,
) -> Result<T> {
    match time::timeout(duration, operation).await {
        Ok(result) => result,
        Err(_) => Err(ProtocolError::Timeout),
    }
}
