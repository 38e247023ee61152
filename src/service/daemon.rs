//! # Server Connection Manager
//!
//! This file is part of the SCS Transport project.
//!
//! [`ScsServer`] listens on an endpoint and turns every accepted connection
//! into a [`ServerClient`] with a server-assigned id. Clients live in a
//! registry keyed by that id until their channel disconnects.
//!
//! For each accepted connection the server:
//! 1. assigns the next id (ids start at 1 and never repeat)
//! 2. registers the client
//! 3. attaches a serving messenger when services are hosted
//! 4. raises "client connected"
//! 5. starts the channel's receive loop
//!
//! Raising the notification before the receive loop starts lets handlers
//! install per-client callbacks without missing the first message.

use futures::future::BoxFuture;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::config::{MessengerConfig, NetworkConfig, ServerConfig, TransportConfig};
use crate::error::{ProtocolError, Result};
use crate::protocol::dispatcher::ServiceDispatcher;
use crate::protocol::message::Message;
use crate::service::messenger::RequestReplyMessenger;
use crate::transport::channel::{ChannelOptions, CommunicationChannel};
use crate::transport::{ConnectionState, Endpoint, Listener, MessageHandler, MessageTransport};
use crate::utils::events::EventSlot;

/// Back-off after a failed accept so a persistent error does not spin
const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(100);

/// One connected client, as seen by the server
pub struct ServerClient {
    id: u64,
    channel: Arc<CommunicationChannel>,
    /// Set once a hosted-services messenger owns the inbound stream
    served: AtomicBool,
}

impl ServerClient {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn remote_endpoint(&self) -> &str {
        self.channel.remote_endpoint()
    }

    pub async fn send(&self, message: Message) -> Result<()> {
        self.channel.send(message).await
    }

    pub async fn disconnect(&self) {
        self.channel.disconnect().await;
    }

    pub fn is_connected(&self) -> bool {
        self.channel.is_connected()
    }

    /// Route this client's inbound messages to `handler`.
    ///
    /// When the server hosts services the serving messenger owns the stream
    /// and this fails with `HandlerInUse`; install unsolicited-message
    /// handling on [`ScsServer::messenger`] instead.
    pub fn on_message<F>(&self, handler: F) -> Result<()>
    where
        F: Fn(Message) + Send + Sync + 'static,
    {
        if self.served.load(Ordering::Acquire) {
            warn!(client_id = self.id, "Message handler kept by the serving messenger");
            return Err(ProtocolError::HandlerInUse);
        }
        self.channel.on_message(handler);
        Ok(())
    }

    pub fn channel(&self) -> &Arc<CommunicationChannel> {
        &self.channel
    }
}

impl MessageTransport for ServerClient {
    fn send_message(&self, message: Message) -> BoxFuture<'_, Result<()>> {
        Box::pin(self.channel.send(message))
    }

    fn set_message_handler(&self, handler: MessageHandler) {
        self.channel.set_message_handler(handler);
    }

    fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.channel.subscribe_state()
    }

    fn subscribe_disconnects(&self) -> watch::Receiver<u64> {
        self.channel.subscribe_disconnects()
    }

    fn state(&self) -> ConnectionState {
        self.channel.state()
    }
}

impl std::fmt::Debug for ServerClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerClient")
            .field("id", &self.id)
            .field("remote", &self.channel.remote_endpoint())
            .finish()
    }
}

struct Hosting {
    dispatcher: Arc<ServiceDispatcher>,
    config: MessengerConfig,
}

struct ServerShared {
    clients: Mutex<BTreeMap<u64, Arc<ServerClient>>>,
    messengers: Mutex<BTreeMap<u64, RequestReplyMessenger>>,
    hosting: RwLock<Option<Hosting>>,
    next_id: AtomicU64,
    max_connections: usize,
    on_client_connected: EventSlot<Arc<ServerClient>>,
    on_client_disconnected: EventSlot<Arc<ServerClient>>,
}

impl ServerShared {
    fn clients(&self) -> std::sync::MutexGuard<'_, BTreeMap<u64, Arc<ServerClient>>> {
        self.clients.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn messengers(&self) -> std::sync::MutexGuard<'_, BTreeMap<u64, RequestReplyMessenger>> {
        self.messengers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn admit(self: &Arc<Self>, channel: Arc<CommunicationChannel>) {
        if self.clients().len() >= self.max_connections {
            warn!(
                peer = %channel.remote_endpoint(),
                max_connections = self.max_connections,
                "Connection limit reached, dropping connection"
            );
            return;
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let client = Arc::new(ServerClient {
            id,
            channel: Arc::clone(&channel),
            served: AtomicBool::new(false),
        });

        let weak = Arc::downgrade(self);
        channel.on_disconnected(move |()| {
            if let Some(shared) = weak.upgrade() {
                shared.remove(id);
            }
        });

        self.clients().insert(id, Arc::clone(&client));
        self.attach_messenger(&client);
        info!(client_id = id, peer = %channel.remote_endpoint(), "Client connected");
        self.on_client_connected.emit(Arc::clone(&client));

        if let Err(e) = channel.start() {
            error!(client_id = id, error = %e, "Could not start client channel");
            self.remove(id);
        }
    }

    fn attach_messenger(&self, client: &Arc<ServerClient>) {
        let hosting = self.hosting.read().unwrap_or_else(PoisonError::into_inner);
        let Some(hosting) = hosting.as_ref() else {
            return;
        };

        let messenger = RequestReplyMessenger::new(client.clone(), hosting.config.clone());
        messenger.serve(Arc::clone(&hosting.dispatcher));
        if let Err(e) = messenger.start() {
            error!(client_id = client.id, error = %e, "Could not start client messenger");
            return;
        }
        client.served.store(true, Ordering::Release);
        self.messengers().insert(client.id, messenger);
    }

    /// Drop a client from the registry. Safe to call more than once.
    fn remove(&self, id: u64) {
        let removed = self.clients().remove(&id);
        let messenger = self.messengers().remove(&id);
        if let Some(messenger) = messenger {
            messenger.stop();
        }
        if let Some(client) = removed {
            info!(client_id = id, peer = %client.remote_endpoint(), "Client disconnected");
            self.on_client_disconnected.emit(client);
        }
    }
}

struct Running {
    shutdown: CancellationToken,
    local: Endpoint,
    accept_task: JoinHandle<()>,
}

pub struct ScsServer {
    endpoint: Endpoint,
    transport: TransportConfig,
    shared: Arc<ServerShared>,
    running: Mutex<Option<Running>>,
}

impl ScsServer {
    pub fn new(endpoint: Endpoint, config: ServerConfig, transport: TransportConfig) -> Self {
        Self {
            endpoint,
            transport,
            shared: Arc::new(ServerShared {
                clients: Mutex::new(BTreeMap::new()),
                messengers: Mutex::new(BTreeMap::new()),
                hosting: RwLock::new(None),
                next_id: AtomicU64::new(1),
                max_connections: config.max_connections,
                on_client_connected: EventSlot::new("client_connected"),
                on_client_disconnected: EventSlot::new("client_disconnected"),
            }),
            running: Mutex::new(None),
        }
    }

    /// Build a server for `config.server.address`
    pub fn from_config(config: &NetworkConfig) -> Result<Self> {
        let endpoint = config.server.address.parse()?;
        Ok(Self::new(
            endpoint,
            config.server.clone(),
            config.transport.clone(),
        ))
    }

    /// Answer remote invocations from every client connecting after this call.
    ///
    /// Each client gets its own messenger, reachable through
    /// [`messenger`](Self::messenger) for calls in the other direction.
    pub fn host_services(&self, dispatcher: Arc<ServiceDispatcher>, config: MessengerConfig) {
        *self
            .shared
            .hosting
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(Hosting { dispatcher, config });
    }

    /// Bind the endpoint and start accepting connections
    #[instrument(skip(self), fields(endpoint = %self.endpoint))]
    pub async fn start(&self) -> Result<()> {
        if self.is_running() {
            return Err(ProtocolError::AlreadyStarted);
        }

        let listener = Listener::bind(&self.endpoint).await?;
        let local = listener.local_endpoint()?;

        let mut running = self.running.lock().unwrap_or_else(PoisonError::into_inner);
        if running.is_some() {
            listener.cleanup();
            return Err(ProtocolError::AlreadyStarted);
        }

        let shutdown = CancellationToken::new();
        let accept_task = tokio::spawn(accept_loop(
            listener,
            Arc::clone(&self.shared),
            self.transport.clone(),
            shutdown.clone(),
        ));
        info!(local = %local, "Server started");

        *running = Some(Running {
            shutdown,
            local,
            accept_task,
        });
        Ok(())
    }

    /// Stop accepting, then disconnect every registered client
    pub async fn stop(&self) {
        let running = self
            .running
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(running) = running else {
            return;
        };

        running.shutdown.cancel();
        if let Err(e) = running.accept_task.await {
            warn!(error = %e, "Accept loop ended abnormally");
        }

        let clients: Vec<Arc<ServerClient>> = self.shared.clients().values().cloned().collect();
        for client in clients {
            client.disconnect().await;
        }
        info!(local = %running.local, "Server stopped");
    }

    pub fn is_running(&self) -> bool {
        self.running
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    /// The bound endpoint while running (resolves port 0)
    pub fn local_addr(&self) -> Option<Endpoint> {
        self.running
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map(|running| running.local.clone())
    }

    pub fn client(&self, id: u64) -> Option<Arc<ServerClient>> {
        self.shared.clients().get(&id).cloned()
    }

    /// Connected clients ordered by id
    pub fn clients(&self) -> Vec<Arc<ServerClient>> {
        self.shared.clients().values().cloned().collect()
    }

    pub fn client_count(&self) -> usize {
        self.shared.clients().len()
    }

    /// Messenger attached to a client when services are hosted
    pub fn messenger(&self, id: u64) -> Option<RequestReplyMessenger> {
        self.shared.messengers().get(&id).cloned()
    }

    pub fn on_client_connected<F>(&self, handler: F)
    where
        F: Fn(Arc<ServerClient>) + Send + Sync + 'static,
    {
        self.shared.on_client_connected.set(handler);
    }

    pub fn on_client_disconnected<F>(&self, handler: F)
    where
        F: Fn(Arc<ServerClient>) + Send + Sync + 'static,
    {
        self.shared.on_client_disconnected.set(handler);
    }
}

impl std::fmt::Debug for ScsServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScsServer")
            .field("endpoint", &self.endpoint)
            .field("clients", &self.client_count())
            .finish()
    }
}

async fn accept_loop(
    listener: Listener,
    shared: Arc<ServerShared>,
    transport: TransportConfig,
    shutdown: CancellationToken,
) {
    let options = ChannelOptions::from_config(&transport).answering_keepalive(true);

    loop {
        let accepted = tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept(&transport, options.clone()) => accepted,
        };

        match accepted {
            Ok(channel) => shared.admit(channel),
            Err(e) => {
                warn!(error = %e, "Accept failed");
                tokio::time::sleep(ACCEPT_RETRY_DELAY).await;
            }
        }
    }

    listener.cleanup();
    debug!("Accept loop stopped");
}
