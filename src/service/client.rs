//! # Client Connection Manager
//!
//! This file is part of the SCS Transport project.
//!
//! [`ScsClient`] owns one outbound connection at a time. `connect` dials the
//! endpoint and builds a fresh [`CommunicationChannel`]; a keep-alive task then
//! pings the server whenever the channel has been silent in both directions
//! for the idle threshold. Inbound application messages are re-surfaced to the
//! handler registered on the client, which survives reconnects.

use futures::future::BoxFuture;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::watch;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, instrument};

use crate::config::{ClientConfig, NetworkConfig, TransportConfig};
use crate::error::{ProtocolError, Result};
use crate::protocol::keepalive::KeepAliveManager;
use crate::protocol::message::Message;
use crate::transport::channel::{ChannelOptions, CommunicationChannel};
use crate::transport::{self, ConnectionState, Endpoint, MessageHandler, MessageTransport};
use crate::utils::events::EventSlot;

/// State shared with the callbacks installed on each channel
struct Shared {
    /// Current channel, tagged with the generation it was created in
    current: Mutex<Option<(u64, Arc<CommunicationChannel>)>>,
    generation: AtomicU64,
    state: watch::Sender<ConnectionState>,
    /// Bumped once per lost channel
    disconnects: watch::Sender<u64>,
    on_message: EventSlot<Message>,
    on_disconnected: EventSlot<()>,
}

impl Shared {
    fn current(&self) -> Option<Arc<CommunicationChannel>> {
        self.current
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map(|(_, channel)| Arc::clone(channel))
    }

    fn channel_closed(&self, generation: u64) {
        {
            let mut current = self.current.lock().unwrap_or_else(PoisonError::into_inner);
            match current.as_ref() {
                Some((active, _)) if *active == generation => *current = None,
                _ => return,
            }
            self.disconnects.send_modify(|count| *count += 1);
            self.state.send_replace(ConnectionState::Disconnected);
        }
        info!("Client disconnected");
        self.on_disconnected.emit(());
    }
}

pub struct ScsClient {
    endpoint: Endpoint,
    config: ClientConfig,
    transport: TransportConfig,
    keepalive: KeepAliveManager,
    shared: Arc<Shared>,
    connecting: tokio::sync::Mutex<()>,
}

impl ScsClient {
    pub fn new(endpoint: Endpoint, config: ClientConfig, transport: TransportConfig) -> Self {
        let keepalive = KeepAliveManager::with_settings(
            config.keepalive_interval,
            config.keepalive_idle_threshold,
        );
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        let (disconnects, _) = watch::channel(0);

        Self {
            endpoint,
            config,
            transport,
            keepalive,
            shared: Arc::new(Shared {
                current: Mutex::new(None),
                generation: AtomicU64::new(0),
                state,
                disconnects,
                on_message: EventSlot::new("message_received"),
                on_disconnected: EventSlot::new("disconnected"),
            }),
            connecting: tokio::sync::Mutex::new(()),
        }
    }

    /// Build a client for `config.client.address`
    pub fn from_config(config: &NetworkConfig) -> Result<Self> {
        let endpoint = config.client.address.parse()?;
        Ok(Self::new(
            endpoint,
            config.client.clone(),
            config.transport.clone(),
        ))
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// Dial the endpoint and start a fresh channel.
    ///
    /// Does nothing when already connected. Dial failures are returned as
    /// `ConnectionFailed`.
    #[instrument(skip(self), fields(endpoint = %self.endpoint))]
    pub async fn connect(&self) -> Result<()> {
        let _connecting = self.connecting.lock().await;
        if self.is_connected() {
            debug!("Already connected");
            return Ok(());
        }

        let options = ChannelOptions::from_config(&self.transport);
        let channel = transport::dial(
            &self.endpoint,
            self.config.connection_timeout,
            &self.transport,
            options,
        )
        .await?;

        let generation = self.shared.generation.fetch_add(1, Ordering::AcqRel) + 1;

        let shared = Arc::clone(&self.shared);
        channel.on_message(move |message| {
            if !shared.on_message.emit(message) {
                debug!("No message handler installed, message dropped");
            }
        });
        let shared = Arc::clone(&self.shared);
        channel.on_disconnected(move |()| shared.channel_closed(generation));

        {
            let mut current = self
                .shared
                .current
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            *current = Some((generation, Arc::clone(&channel)));
            channel.start()?;
            if channel.is_connected() {
                self.shared.state.send_replace(ConnectionState::Connected);
            }
        }

        tokio::spawn(keepalive_loop(Arc::clone(&channel), self.keepalive));
        info!(peer = %channel.remote_endpoint(), "Client connected");
        Ok(())
    }

    /// Close the current channel, if any
    pub async fn disconnect(&self) {
        if let Some(channel) = self.shared.current() {
            channel.disconnect().await;
        }
    }

    /// Send one message on the current channel
    pub async fn send(&self, message: Message) -> Result<()> {
        match self.shared.current() {
            Some(channel) => channel.send(message).await,
            None => Err(ProtocolError::NotConnected),
        }
    }

    pub fn state(&self) -> ConnectionState {
        *self.shared.state.borrow()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state.subscribe()
    }

    pub fn on_message<F>(&self, handler: F)
    where
        F: Fn(Message) + Send + Sync + 'static,
    {
        self.shared.on_message.set(handler);
    }

    /// Fired once per lost connection, whatever the cause
    pub fn on_disconnected<F>(&self, handler: F)
    where
        F: Fn(()) + Send + Sync + 'static,
    {
        self.shared.on_disconnected.set(handler);
    }

    /// The live channel, if connected
    pub fn channel(&self) -> Option<Arc<CommunicationChannel>> {
        self.shared.current()
    }
}

impl MessageTransport for ScsClient {
    fn send_message(&self, message: Message) -> BoxFuture<'_, Result<()>> {
        Box::pin(self.send(message))
    }

    fn set_message_handler(&self, handler: MessageHandler) {
        self.shared.on_message.set_arc(handler);
    }

    fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state.subscribe()
    }

    fn subscribe_disconnects(&self) -> watch::Receiver<u64> {
        self.shared.disconnects.subscribe()
    }

    fn state(&self) -> ConnectionState {
        ScsClient::state(self)
    }
}

impl std::fmt::Debug for ScsClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScsClient")
            .field("endpoint", &self.endpoint)
            .field("state", &self.state())
            .finish()
    }
}

/// Ping the server whenever the channel has gone quiet. Send failures are
/// ignored: a broken socket surfaces through the disconnect path.
async fn keepalive_loop(channel: Arc<CommunicationChannel>, policy: KeepAliveManager) {
    let period = policy.ping_interval();
    let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = channel.closed() => break,
            _ = ticker.tick() => {}
        }

        if policy.should_ping(channel.last_sent(), channel.last_received(), Instant::now()) {
            debug!(peer = %channel.remote_endpoint(), "Connection idle, sending keep-alive");
            if let Err(e) = channel.send(KeepAliveManager::build_ping_message()).await {
                debug!(error = %e, "Keep-alive not sent");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::codec::FrameCodec;
    use crate::protocol::message::MessageBody;
    use crate::protocol::wire::{BinaryWireProtocol, WireProtocol};
    use futures::StreamExt;
    use std::time::Duration;
    use tokio::net::TcpListener;
    use tokio::sync::mpsc;
    use tokio::time::timeout;
    use tokio_util::codec::FramedRead;

    fn client_for(addr: &str, interval: Duration, idle: Duration) -> ScsClient {
        let config = ClientConfig {
            address: addr.to_string(),
            connection_timeout: Duration::from_secs(2),
            keepalive_interval: interval,
            keepalive_idle_threshold: idle,
        };
        ScsClient::new(
            Endpoint::Tcp(addr.to_string()),
            config,
            TransportConfig::default(),
        )
    }

    /// Accept one connection and forward every decoded message it carries
    async fn recording_peer() -> (String, mpsc::UnboundedReceiver<Message>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let (tx, rx) = mpsc::unbounded_channel();

        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut frames = FramedRead::new(stream, FrameCodec::default());
            while let Some(Ok(packet)) = frames.next().await {
                if let Ok(message) = BinaryWireProtocol.decode(&packet.payload) {
                    let _ = tx.send(message);
                }
            }
        });

        (addr, rx)
    }

    #[tokio::test]
    async fn test_dial_failure_is_returned_to_caller() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);

        let client = client_for(&addr, Duration::from_secs(30), Duration::from_secs(60));
        assert!(matches!(
            client.connect().await,
            Err(ProtocolError::ConnectionFailed(_))
        ));
        assert!(!client.is_connected());
        assert!(matches!(
            client.send(Message::text("nobody home")).await,
            Err(ProtocolError::NotConnected)
        ));
    }

    #[tokio::test]
    async fn test_idle_connection_gets_keepalive() {
        let (addr, mut received) = recording_peer().await;
        let client = client_for(&addr, Duration::from_millis(50), Duration::from_millis(100));
        client.connect().await.unwrap();

        let message = timeout(Duration::from_secs(3), received.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(message.body, MessageBody::Ping);
        assert!(message.replied_id.is_none());
    }

    #[tokio::test]
    async fn test_recent_traffic_suppresses_keepalive() {
        let (addr, mut received) = recording_peer().await;
        let client = client_for(&addr, Duration::from_millis(50), Duration::from_millis(400));
        client.connect().await.unwrap();

        for i in 0..12 {
            client.send(Message::text(format!("tick-{i}"))).await.unwrap();
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        client.disconnect().await;

        let mut seen = 0;
        while let Ok(Some(message)) = timeout(Duration::from_secs(2), received.recv()).await {
            assert_ne!(message.body, MessageBody::Ping, "ping sent on a busy connection");
            seen += 1;
        }
        assert_eq!(seen, 12);
    }

    #[tokio::test]
    async fn test_remote_close_is_observed_and_reconnect_builds_new_channel() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let client = client_for(&addr, Duration::from_secs(30), Duration::from_secs(60));

        let (fired_tx, mut fired) = mpsc::unbounded_channel();
        client.on_disconnected(move |()| {
            let _ = fired_tx.send(());
        });

        let (connected, accepted) = tokio::join!(client.connect(), listener.accept());
        connected.unwrap();
        let first = client.channel().unwrap();
        assert!(client.is_connected());

        drop(accepted.unwrap().0);
        timeout(Duration::from_secs(2), fired.recv()).await.unwrap().unwrap();
        assert_eq!(client.state(), ConnectionState::Disconnected);
        assert!(!first.is_connected());

        let (connected, _accepted) = tokio::join!(client.connect(), listener.accept());
        connected.unwrap();
        let second = client.channel().unwrap();
        assert!(!Arc::ptr_eq(&first, &second));
        assert!(client.is_connected());

        // A stale channel closing again must not disturb the new one
        first.disconnect().await;
        assert!(client.is_connected());
        assert_eq!(*client.subscribe_disconnects().borrow(), 1);
    }
}
