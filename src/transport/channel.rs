//! # Communication Channel
//!
//! One live duplex connection. A channel owns the two framed halves of its
//! stream, runs a background receive loop once started, and converges every
//! failure path (remote close, read error, write error, local close) onto a
//! single disconnect transition.
//!
//! ```text
//! Disconnected --start--> Connected --(close | read error | write error)--> Disconnected
//! ```
//!
//! The final `Disconnected` state is terminal: reconnecting means building a
//! new channel.

use futures::future::BoxFuture;
use futures::{SinkExt, StreamExt};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::{watch, Mutex};
use tokio::time::Instant;
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::config::{TransportConfig, MAX_PAYLOAD_SIZE};
use crate::core::codec::FrameCodec;
use crate::core::packet::Packet;
use crate::error::{ProtocolError, Result};
use crate::protocol::heartbeat::{build_ping_reply, is_ping, is_ping_request};
use crate::protocol::message::Message;
use crate::protocol::wire::{BinaryWireProtocol, WireProtocol};
use crate::transport::{ConnectionState, MessageHandler, MessageTransport};
use crate::utils::events::EventSlot;

type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Per-channel settings
#[derive(Debug, Clone)]
pub struct ChannelOptions {
    pub protocol: Arc<dyn WireProtocol>,
    pub max_payload_size: usize,
    /// Answer inbound pings with a correlated ping (server side)
    pub answer_keepalive: bool,
}

impl Default for ChannelOptions {
    fn default() -> Self {
        Self {
            protocol: Arc::new(BinaryWireProtocol),
            max_payload_size: MAX_PAYLOAD_SIZE,
            answer_keepalive: false,
        }
    }
}

impl ChannelOptions {
    pub fn from_config(config: &TransportConfig) -> Self {
        Self {
            max_payload_size: config.max_payload_size,
            ..Self::default()
        }
    }

    pub fn with_protocol(mut self, protocol: Arc<dyn WireProtocol>) -> Self {
        self.protocol = protocol;
        self
    }

    pub fn answering_keepalive(mut self, answer: bool) -> Self {
        self.answer_keepalive = answer;
        self
    }
}

/// Last-send / last-receive timestamps, stored as microseconds since creation
#[derive(Debug)]
struct Activity {
    origin: Instant,
    last_sent: AtomicU64,
    last_received: AtomicU64,
}

impl Activity {
    fn new() -> Self {
        Self {
            origin: Instant::now(),
            last_sent: AtomicU64::new(0),
            last_received: AtomicU64::new(0),
        }
    }

    fn now_offset(&self) -> u64 {
        u64::try_from(self.origin.elapsed().as_micros()).unwrap_or(u64::MAX)
    }

    fn touch_sent(&self) {
        self.last_sent.store(self.now_offset(), Ordering::Release);
    }

    fn touch_received(&self) {
        self.last_received.store(self.now_offset(), Ordering::Release);
    }

    fn at(&self, offset: &AtomicU64) -> Instant {
        self.origin + std::time::Duration::from_micros(offset.load(Ordering::Acquire))
    }
}

pub struct CommunicationChannel {
    remote: String,
    options: ChannelOptions,
    reader: StdMutex<Option<FramedRead<BoxedReader, FrameCodec>>>,
    writer: Mutex<Option<FramedWrite<BoxedWriter, FrameCodec>>>,
    state: watch::Sender<ConnectionState>,
    disconnects: watch::Sender<u64>,
    disconnected: AtomicBool,
    shutdown: CancellationToken,
    activity: Activity,
    on_message: EventSlot<Message>,
    on_disconnected: EventSlot<()>,
}

impl CommunicationChannel {
    /// Wrap a connected stream. The channel stays `Disconnected` until [`start`](Self::start).
    pub fn new<S>(stream: S, remote: impl Into<String>, options: ChannelOptions) -> Arc<Self>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (read_half, write_half) = tokio::io::split(stream);
        let codec = FrameCodec::new(options.max_payload_size);
        let reader: BoxedReader = Box::new(read_half);
        let writer: BoxedWriter = Box::new(write_half);
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        let (disconnects, _) = watch::channel(0);

        Arc::new(Self {
            remote: remote.into(),
            options,
            reader: StdMutex::new(Some(FramedRead::new(reader, codec))),
            writer: Mutex::new(Some(FramedWrite::new(writer, codec))),
            state,
            disconnects,
            disconnected: AtomicBool::new(false),
            shutdown: CancellationToken::new(),
            activity: Activity::new(),
            on_message: EventSlot::new("message_received"),
            on_disconnected: EventSlot::new("disconnected"),
        })
    }

    /// Address of the peer, for logging and diagnostics
    pub fn remote_endpoint(&self) -> &str {
        &self.remote
    }

    /// Start the background receive loop and enter `Connected`
    pub fn start(self: &Arc<Self>) -> Result<()> {
        if self.disconnected.load(Ordering::Acquire) {
            return Err(ProtocolError::ConnectionClosed);
        }
        let reader = self
            .reader
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .ok_or(ProtocolError::AlreadyStarted)?;

        self.state.send_replace(ConnectionState::Connected);
        info!(peer = %self.remote, "Channel connected");

        tokio::spawn(Arc::clone(self).receive_loop(reader));
        Ok(())
    }

    /// Write one frame.
    ///
    /// Fails fast with `NotConnected` on a channel that is not connected, and
    /// with `OversizedPacket`/`SerializeError` for messages that cannot be
    /// framed. An I/O failure while writing is not returned: it disconnects
    /// the channel and is observed through the disconnect notification.
    pub async fn send(&self, message: Message) -> Result<()> {
        if !self.is_connected() {
            return Err(ProtocolError::NotConnected);
        }

        let payload = self.options.protocol.encode(&message)?;
        if payload.len() > self.options.max_payload_size {
            return Err(ProtocolError::OversizedPacket(payload.len()));
        }

        let mut guard = self.writer.lock().await;
        let Some(writer) = guard.as_mut() else {
            return Err(ProtocolError::NotConnected);
        };

        let result = tokio::select! {
            result = writer.send(Packet::new(payload)) => result,
            _ = self.shutdown.cancelled() => Err(ProtocolError::ConnectionClosed),
        };

        match result {
            Ok(()) => {
                self.activity.touch_sent();
                trace!(
                    peer = %self.remote,
                    message_id = %message.id,
                    kind = message.body.kind(),
                    "Message sent"
                );
                Ok(())
            }
            Err(e) => {
                drop(guard);
                warn!(peer = %self.remote, error = %e, "Write failed, disconnecting");
                self.close(&format!("write failed: {e}")).await;
                Ok(())
            }
        }
    }

    /// Close the connection. Idempotent.
    pub async fn disconnect(&self) {
        self.close("local close").await;
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    /// Resolves once the channel has disconnected
    pub async fn closed(&self) {
        self.shutdown.cancelled().await;
    }

    pub fn last_sent(&self) -> Instant {
        self.activity.at(&self.activity.last_sent)
    }

    pub fn last_received(&self) -> Instant {
        self.activity.at(&self.activity.last_received)
    }

    /// Install the handler for inbound application messages
    pub fn on_message<F>(&self, handler: F)
    where
        F: Fn(Message) + Send + Sync + 'static,
    {
        self.on_message.set(handler);
    }

    /// Install the handler fired once when the channel disconnects
    pub fn on_disconnected<F>(&self, handler: F)
    where
        F: Fn(()) + Send + Sync + 'static,
    {
        self.on_disconnected.set(handler);
    }

    async fn receive_loop(self: Arc<Self>, mut reader: FramedRead<BoxedReader, FrameCodec>) {
        let reason = loop {
            let frame = tokio::select! {
                _ = self.shutdown.cancelled() => break "local close".to_string(),
                frame = reader.next() => frame,
            };

            match frame {
                Some(Ok(packet)) => {
                    self.activity.touch_received();
                    match self.options.protocol.decode(&packet.payload) {
                        Ok(message) => self.handle_inbound(message).await,
                        Err(e) if e.is_fatal() => {
                            warn!(peer = %self.remote, error = %e, "Wire protocol failure");
                            break e.to_string();
                        }
                        Err(e) => {
                            warn!(
                                peer = %self.remote,
                                error = %e,
                                bytes = packet.len(),
                                "Dropping undecodable message"
                            );
                        }
                    }
                }
                Some(Err(e)) => {
                    warn!(peer = %self.remote, error = %e, "Receive failed");
                    break e.to_string();
                }
                None => break "closed by peer".to_string(),
            }
        };

        drop(reader);
        self.close(&reason).await;
    }

    async fn handle_inbound(&self, message: Message) {
        trace!(
            peer = %self.remote,
            message_id = %message.id,
            kind = message.body.kind(),
            "Message received"
        );

        if is_ping(&message) {
            if self.options.answer_keepalive && is_ping_request(&message) {
                if let Err(e) = self.send(build_ping_reply(&message)).await {
                    debug!(peer = %self.remote, error = %e, "Ping reply not sent");
                }
            }
            return;
        }

        if !self.on_message.emit(message) {
            debug!(peer = %self.remote, "No message handler installed, message dropped");
        }
    }

    async fn close(&self, reason: &str) {
        self.mark_disconnected(reason);

        let reader = self
            .reader
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        drop(reader);

        if let Some(mut writer) = self.writer.lock().await.take() {
            if let Err(e) = writer.get_mut().shutdown().await {
                debug!(peer = %self.remote, error = %e, "Socket shutdown failed");
            }
        }
    }

    fn mark_disconnected(&self, reason: &str) {
        if self.disconnected.swap(true, Ordering::AcqRel) {
            return;
        }
        self.shutdown.cancel();
        self.disconnects.send_modify(|count| *count += 1);
        self.state.send_replace(ConnectionState::Disconnected);
        info!(peer = %self.remote, reason, "Channel disconnected");
        self.on_disconnected.emit(());
    }
}

impl MessageTransport for CommunicationChannel {
    fn send_message(&self, message: Message) -> BoxFuture<'_, Result<()>> {
        Box::pin(self.send(message))
    }

    fn set_message_handler(&self, handler: MessageHandler) {
        self.on_message.set_arc(handler);
    }

    fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    fn subscribe_disconnects(&self) -> watch::Receiver<u64> {
        self.disconnects.subscribe()
    }

    fn state(&self) -> ConnectionState {
        CommunicationChannel::state(self)
    }
}

impl std::fmt::Debug for CommunicationChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommunicationChannel")
            .field("remote", &self.remote)
            .field("state", &self.state())
            .finish()
    }
}
