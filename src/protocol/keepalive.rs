use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, instrument};

use crate::protocol::heartbeat::build_ping;
use crate::protocol::message::Message;
use crate::utils::timeout::{KEEPALIVE_IDLE_THRESHOLD, KEEPALIVE_INTERVAL};

/// Keep-alive policy for an outbound connection.
///
/// The timer fires every `ping_interval`, but a ping is only worth sending
/// when the channel has been silent in both directions for `idle_threshold`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeepAliveManager {
    /// Interval of the keep-alive timer
    pub ping_interval: Duration,
    /// Minimum silence in both directions before a ping is sent
    pub idle_threshold: Duration,
}

impl KeepAliveManager {
    /// Create a new keep-alive manager with default settings
    pub fn new() -> Self {
        Self {
            ping_interval: KEEPALIVE_INTERVAL,
            idle_threshold: KEEPALIVE_IDLE_THRESHOLD,
        }
    }

    /// Create a new keep-alive manager with custom settings
    pub fn with_settings(ping_interval: Duration, idle_threshold: Duration) -> Self {
        Self {
            ping_interval,
            idle_threshold,
        }
    }

    /// Get the ping interval duration
    pub fn ping_interval(&self) -> Duration {
        self.ping_interval
    }

    /// Check whether a ping should go out at `now`
    pub fn should_ping(&self, last_sent: Instant, last_received: Instant, now: Instant) -> bool {
        now.saturating_duration_since(last_sent) >= self.idle_threshold
            && now.saturating_duration_since(last_received) >= self.idle_threshold
    }

    /// Build a ping message for keep-alive
    #[instrument]
    pub fn build_ping_message() -> Message {
        debug!("Building ping message for keep-alive");
        build_ping()
    }
}

impl Default for KeepAliveManager {
    fn default() -> Self {
        Self::new()
    }
}
