//! # Request/Reply Messenger
//!
//! This file is part of the SCS Transport project.
//!
//! It adds synchronous call semantics on top of any [`MessageTransport`]:
//! [`RequestReplyMessenger::send_and_wait`] sends a message and suspends until
//! the reply carrying its id arrives, the deadline passes, or the messenger is
//! torn down.
//!
//! Inbound messages take one of two paths:
//! - a reply whose `replied_id` matches a pending call resolves that call
//!   directly, so reply latency never depends on queue depth
//! - everything else goes through a FIFO queue drained by a single worker that
//!   runs the registered handler one message at a time
//!
//! Replies are matched by id only; they may arrive in any order.
//!
//! ## Example
//! ```rust,no_run
//! use std::sync::Arc;
//! use scs_transport::config::{ClientConfig, MessengerConfig, TransportConfig};
//! use scs_transport::protocol::message::Message;
//! use scs_transport::service::client::ScsClient;
//! use scs_transport::service::messenger::RequestReplyMessenger;
//!
//! # async fn run() -> scs_transport::error::Result<()> {
//! let client = Arc::new(ScsClient::new(
//!     "tcp://127.0.0.1:10101".parse()?,
//!     ClientConfig::default(),
//!     TransportConfig::default(),
//! ));
//! let messenger = RequestReplyMessenger::new(client.clone(), MessengerConfig::default());
//! messenger.start()?;
//! client.connect().await?;
//!
//! let reply = messenger.send_and_wait(Message::text("status?"), None).await?;
//! println!("{:?}", reply.body);
//! # Ok(())
//! # }
//! ```

use futures::future::BoxFuture;
use futures::FutureExt;
use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock, Weak};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::config::MessengerConfig;
use crate::error::{ProtocolError, Result};
use crate::protocol::dispatcher::ServiceDispatcher;
use crate::protocol::message::{Message, MessageId};
use crate::transport::MessageTransport;

/// Async handler for unsolicited inbound messages
pub type AsyncMessageHandler = Arc<dyn Fn(Message) -> BoxFuture<'static, ()> + Send + Sync>;

enum WaitOutcome {
    Response(Message),
    Cancelled,
}

/// One blocked caller, tagged with the disconnect count seen when it registered
struct Waiter {
    disconnects: u64,
    reply: oneshot::Sender<WaitOutcome>,
}

#[derive(Default)]
struct PendingTable {
    stopped: bool,
    waits: HashMap<MessageId, Waiter>,
}

enum QueueSender {
    Unbounded(mpsc::UnboundedSender<Message>),
    Bounded(mpsc::Sender<Message>, usize),
}

enum QueueReceiver {
    Unbounded(mpsc::UnboundedReceiver<Message>),
    Bounded(mpsc::Receiver<Message>),
}

impl QueueReceiver {
    async fn recv(&mut self) -> Option<Message> {
        match self {
            QueueReceiver::Unbounded(rx) => rx.recv().await,
            QueueReceiver::Bounded(rx) => rx.recv().await,
        }
    }
}

fn queue(capacity: Option<usize>) -> (QueueSender, QueueReceiver) {
    match capacity {
        Some(capacity) if capacity > 0 => {
            let (tx, rx) = mpsc::channel(capacity);
            (QueueSender::Bounded(tx, capacity), QueueReceiver::Bounded(rx))
        }
        _ => {
            let (tx, rx) = mpsc::unbounded_channel();
            (QueueSender::Unbounded(tx), QueueReceiver::Unbounded(rx))
        }
    }
}

struct Inner {
    transport: Arc<dyn MessageTransport>,
    config: MessengerConfig,
    pending: Mutex<PendingTable>,
    queue: QueueSender,
    queue_rx: Mutex<Option<QueueReceiver>>,
    disconnects: watch::Receiver<u64>,
    handler: RwLock<Option<AsyncMessageHandler>>,
    started: AtomicBool,
    shutdown: CancellationToken,
}

impl Inner {
    fn pending(&self) -> std::sync::MutexGuard<'_, PendingTable> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn handler(&self) -> Option<AsyncMessageHandler> {
        self.handler
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn on_inbound(&self, message: Message) {
        if let Some(replied_id) = message.replied_id {
            let waiter = self.pending().waits.remove(&replied_id);
            if let Some(waiter) = waiter {
                // The caller may have given up between removal and delivery
                if let Err(WaitOutcome::Response(returned)) =
                    waiter.reply.send(WaitOutcome::Response(message))
                {
                    self.dispatch(returned);
                }
                return;
            }
            debug!(replied_id = %replied_id, "Reply without a waiting caller, queueing");
        }
        self.dispatch(message);
    }

    fn dispatch(&self, message: Message) {
        let message_id = message.id;
        if let Err(e) = self.enqueue(message) {
            warn!(message_id = %message_id, error = %e, "Inbound message rejected");
        }
    }

    /// Queue an unsolicited message for the worker. A full bounded queue
    /// rejects it with `QueueFull`.
    fn enqueue(&self, message: Message) -> Result<()> {
        if self.shutdown.is_cancelled() {
            debug!(message_id = %message.id, "Messenger stopped, inbound message dropped");
            return Ok(());
        }
        match &self.queue {
            QueueSender::Unbounded(tx) => {
                if tx.send(message).is_err() {
                    debug!("Dispatch queue closed");
                }
                Ok(())
            }
            QueueSender::Bounded(tx, capacity) => match tx.try_send(message) {
                Ok(()) => Ok(()),
                Err(mpsc::error::TrySendError::Full(_)) => Err(ProtocolError::QueueFull(*capacity)),
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    debug!("Dispatch queue closed");
                    Ok(())
                }
            },
        }
    }

    /// Refuse new calls and cancel every pending one
    fn cancel_all(&self) {
        let waits = {
            let mut pending = self.pending();
            pending.stopped = true;
            std::mem::take(&mut pending.waits)
        };
        if !waits.is_empty() {
            info!(count = waits.len(), "Messenger stopped, cancelling pending calls");
        }
        for (_, waiter) in waits {
            let _ = waiter.reply.send(WaitOutcome::Cancelled);
        }
    }

    /// Cancel every call registered before the `disconnects`-th lost connection
    fn cancel_disconnected(&self, disconnects: u64) {
        let stale: Vec<Waiter> = {
            let mut pending = self.pending();
            let ids: Vec<MessageId> = pending
                .waits
                .iter()
                .filter(|(_, waiter)| waiter.disconnects < disconnects)
                .map(|(id, _)| *id)
                .collect();
            ids.iter()
                .filter_map(|id| pending.waits.remove(id))
                .collect()
        };
        if !stale.is_empty() {
            info!(count = stale.len(), "Transport disconnected, cancelling pending calls");
        }
        for waiter in stale {
            let _ = waiter.reply.send(WaitOutcome::Cancelled);
        }
    }
}

/// Removes a pending record however the call ends
struct PendingGuard<'a> {
    inner: &'a Inner,
    id: MessageId,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.inner.pending().waits.remove(&self.id);
    }
}

#[derive(Clone)]
pub struct RequestReplyMessenger {
    inner: Arc<Inner>,
}

impl RequestReplyMessenger {
    pub fn new(transport: Arc<dyn MessageTransport>, config: MessengerConfig) -> Self {
        let (tx, rx) = queue(config.queue_capacity);
        let disconnects = transport.subscribe_disconnects();
        Self {
            inner: Arc::new(Inner {
                transport,
                config,
                pending: Mutex::new(PendingTable::default()),
                queue: tx,
                queue_rx: Mutex::new(Some(rx)),
                disconnects,
                handler: RwLock::new(None),
                started: AtomicBool::new(false),
                shutdown: CancellationToken::new(),
            }),
        }
    }

    /// Hook into the transport and start the dispatch worker
    pub fn start(&self) -> Result<()> {
        if self.inner.started.swap(true, Ordering::AcqRel) {
            return Err(ProtocolError::AlreadyStarted);
        }
        let queue_rx = self
            .inner
            .queue_rx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .ok_or(ProtocolError::AlreadyStarted)?;

        let weak = Arc::downgrade(&self.inner);
        self.inner.transport.set_message_handler(Arc::new(move |message| {
            if let Some(inner) = weak.upgrade() {
                inner.on_inbound(message);
            }
        }));

        let shutdown = self.inner.shutdown.clone();
        tokio::spawn(dispatch_worker(Arc::downgrade(&self.inner), queue_rx, shutdown.clone()));
        tokio::spawn(watch_transport(
            Arc::downgrade(&self.inner),
            self.inner.disconnects.clone(),
            shutdown,
        ));

        debug!("Messenger started");
        Ok(())
    }

    /// Stop the dispatch worker and cancel every pending call. Idempotent.
    pub fn stop(&self) {
        self.inner.shutdown.cancel();
        self.inner.cancel_all();
    }

    /// Send a message without waiting for anything back
    pub async fn send_message(&self, message: Message) -> Result<()> {
        self.inner.transport.send_message(message).await
    }

    /// Send `message` and wait for the reply correlated to its id.
    ///
    /// `timeout` overrides the configured response timeout for this call.
    ///
    /// # Errors
    /// - `Timeout` when no reply arrived in time
    /// - `Cancelled` when the messenger stopped or the transport disconnected
    /// - `NotConnected` when the transport was already down
    #[instrument(
        skip(self, message, timeout),
        fields(message_id = %message.id, kind = message.body.kind())
    )]
    pub async fn send_and_wait(
        &self,
        message: Message,
        timeout: Option<Duration>,
    ) -> Result<Message> {
        let timeout = timeout.unwrap_or(self.inner.config.response_timeout);
        let id = message.id;
        let (tx, rx) = oneshot::channel();

        {
            let mut pending = self.inner.pending();
            if pending.stopped {
                return Err(ProtocolError::Cancelled);
            }
            let waiter = Waiter {
                disconnects: *self.inner.disconnects.borrow(),
                reply: tx,
            };
            pending.waits.insert(id, waiter);
        }
        let _guard = PendingGuard {
            inner: &self.inner,
            id,
        };

        self.inner.transport.send_message(message).await?;

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(WaitOutcome::Response(reply))) => Ok(reply),
            Ok(Ok(WaitOutcome::Cancelled)) | Ok(Err(_)) => Err(ProtocolError::Cancelled),
            Err(_) => {
                debug!(?timeout, "No reply in time");
                Err(ProtocolError::Timeout)
            }
        }
    }

    /// Install the handler for unsolicited messages, replacing any previous one
    pub fn on_message<F, Fut>(&self, handler: F)
    where
        F: Fn(Message) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let handler: AsyncMessageHandler =
            Arc::new(move |message| -> BoxFuture<'static, ()> { Box::pin(handler(message)) });
        *self
            .inner
            .handler
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(handler);
    }

    /// Answer inbound remote invocations with `dispatcher`.
    ///
    /// This installs the unsolicited-message handler; other message kinds are
    /// logged and dropped.
    pub fn serve(&self, dispatcher: Arc<ServiceDispatcher>) {
        let weak = Arc::downgrade(&self.inner);
        self.on_message(move |message| {
            let dispatcher = dispatcher.clone();
            let weak = weak.clone();
            async move {
                let Some(reply) = dispatcher.handle(&message).await else {
                    debug!(
                        message_id = %message.id,
                        kind = message.body.kind(),
                        "Not an invocation, ignored"
                    );
                    return;
                };
                let Some(inner) = weak.upgrade() else {
                    return;
                };
                if let Err(e) = inner.transport.send_message(reply).await {
                    warn!(request_id = %message.id, error = %e, "Could not send invocation reply");
                }
            }
        });
    }

    /// Number of calls currently waiting for a reply
    pub fn pending_count(&self) -> usize {
        self.inner.pending().waits.len()
    }

    pub fn default_timeout(&self) -> Duration {
        self.inner.config.response_timeout
    }

    pub fn transport(&self) -> &Arc<dyn MessageTransport> {
        &self.inner.transport
    }
}

impl std::fmt::Debug for RequestReplyMessenger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestReplyMessenger")
            .field("pending", &self.pending_count())
            .field("stopped", &self.inner.shutdown.is_cancelled())
            .finish()
    }
}

async fn dispatch_worker(
    inner: Weak<Inner>,
    mut queue: QueueReceiver,
    shutdown: CancellationToken,
) {
    loop {
        let message = tokio::select! {
            _ = shutdown.cancelled() => break,
            message = queue.recv() => match message {
                Some(message) => message,
                None => break,
            },
        };

        let Some(handler) = inner.upgrade().and_then(|inner| inner.handler()) else {
            debug!(message_id = %message.id, "No message handler installed, message dropped");
            continue;
        };

        let message_id = message.id;
        if AssertUnwindSafe(async move { handler(message).await })
            .catch_unwind()
            .await
            .is_err()
        {
            warn!(message_id = %message_id, "Message handler panicked");
        }
    }
    debug!("Dispatch worker stopped");
}

/// Cancels calls stranded by a lost connection. Counting disconnects rather
/// than watching the state keeps a quick reconnect from masking one.
async fn watch_transport(
    inner: Weak<Inner>,
    mut disconnects: watch::Receiver<u64>,
    shutdown: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            changed = disconnects.changed() => {
                if changed.is_err() {
                    break;
                }
            }
        }

        let count = *disconnects.borrow_and_update();
        let Some(inner) = inner.upgrade() else {
            break;
        };
        inner.cancel_disconnected(count);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::message::MessageBody;
    use crate::transport::ConnectionState;
    use crate::utils::events::EventSlot;
    use std::time::Duration;
    use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
    use tokio::sync::Notify;
    use tokio::time::timeout;

    /// In-memory transport: sent messages are captured, inbound ones injected
    struct ScriptedTransport {
        outbound: UnboundedSender<Message>,
        handler: EventSlot<Message>,
        state: watch::Sender<ConnectionState>,
        disconnects: watch::Sender<u64>,
    }

    impl ScriptedTransport {
        fn new() -> (Arc<Self>, UnboundedReceiver<Message>) {
            let (outbound, rx) = unbounded_channel();
            let (state, _) = watch::channel(ConnectionState::Connected);
            let (disconnects, _) = watch::channel(0);
            let transport = Arc::new(Self {
                outbound,
                handler: EventSlot::new("message_received"),
                state,
                disconnects,
            });
            (transport, rx)
        }

        fn deliver(&self, message: Message) {
            self.handler.emit(message);
        }

        fn lose_connection(&self) {
            self.disconnects.send_modify(|count| *count += 1);
            self.state.send_replace(ConnectionState::Disconnected);
        }

        fn reconnect(&self) {
            self.state.send_replace(ConnectionState::Connected);
        }
    }

    impl MessageTransport for ScriptedTransport {
        fn send_message(&self, message: Message) -> BoxFuture<'_, Result<()>> {
            let result = if *self.state.borrow() == ConnectionState::Connected {
                let _ = self.outbound.send(message);
                Ok(())
            } else {
                Err(ProtocolError::NotConnected)
            };
            Box::pin(async move { result })
        }

        fn set_message_handler(&self, handler: crate::transport::MessageHandler) {
            self.handler.set_arc(handler);
        }

        fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
            self.state.subscribe()
        }

        fn subscribe_disconnects(&self) -> watch::Receiver<u64> {
            self.disconnects.subscribe()
        }
    }

    fn messenger(transport: &Arc<ScriptedTransport>) -> RequestReplyMessenger {
        let messenger = RequestReplyMessenger::new(transport.clone(), MessengerConfig::default());
        messenger.start().unwrap();
        messenger
    }

    fn answer(request: &Message, text: &str) -> Message {
        Message::reply_to(request, MessageBody::Text(text.to_string()))
    }

    #[tokio::test]
    async fn test_out_of_order_replies_reach_their_callers() {
        let (transport, mut sent) = ScriptedTransport::new();
        let messenger = messenger(&transport);

        let first = tokio::spawn({
            let messenger = messenger.clone();
            async move { messenger.send_and_wait(Message::text("one"), None).await }
        });
        let req1 = sent.recv().await.unwrap();
        let second = tokio::spawn({
            let messenger = messenger.clone();
            async move { messenger.send_and_wait(Message::text("two"), None).await }
        });
        let req2 = sent.recv().await.unwrap();
        assert_eq!(messenger.pending_count(), 2);

        transport.deliver(answer(&req2, "reply-two"));
        transport.deliver(answer(&req1, "reply-one"));

        let r1 = first.await.unwrap().unwrap();
        let r2 = second.await.unwrap().unwrap();
        assert_eq!(r1.replied_id, Some(req1.id));
        assert_eq!(r1.body, MessageBody::Text("reply-one".into()));
        assert_eq!(r2.replied_id, Some(req2.id));
        assert_eq!(r2.body, MessageBody::Text("reply-two".into()));
        assert_eq!(messenger.pending_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_removes_pending_record() {
        let (transport, _sent) = ScriptedTransport::new();
        let messenger = messenger(&transport);

        let started = tokio::time::Instant::now();
        let result = messenger
            .send_and_wait(Message::text("anyone?"), Some(Duration::from_millis(250)))
            .await;

        assert!(matches!(result, Err(ProtocolError::Timeout)));
        assert!(started.elapsed() >= Duration::from_millis(250));
        assert_eq!(messenger.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_late_reply_is_dispatched_as_unsolicited() {
        let (transport, mut sent) = ScriptedTransport::new();
        let messenger = messenger(&transport);
        let (seen_tx, mut seen) = unbounded_channel();
        messenger.on_message(move |message| {
            let seen_tx = seen_tx.clone();
            async move {
                let _ = seen_tx.send(message);
            }
        });

        let result = messenger
            .send_and_wait(Message::text("slow"), Some(Duration::from_millis(20)))
            .await;
        assert!(matches!(result, Err(ProtocolError::Timeout)));

        let request = sent.recv().await.unwrap();
        transport.deliver(answer(&request, "too late"));

        let late = timeout(Duration::from_secs(2), seen.recv()).await.unwrap().unwrap();
        assert_eq!(late.replied_id, Some(request.id));
    }

    #[tokio::test]
    async fn test_stop_cancels_every_call_in_flight() {
        let (transport, mut sent) = ScriptedTransport::new();
        let messenger = messenger(&transport);

        let mut calls = Vec::new();
        for i in 0..5 {
            let messenger = messenger.clone();
            calls.push(tokio::spawn(async move {
                messenger.send_and_wait(Message::text(format!("call-{i}")), None).await
            }));
        }
        for _ in 0..5 {
            sent.recv().await.unwrap();
        }

        messenger.stop();

        for call in calls {
            let result = timeout(Duration::from_secs(2), call).await.unwrap().unwrap();
            assert!(matches!(result, Err(ProtocolError::Cancelled)));
        }
        assert_eq!(messenger.pending_count(), 0);
        assert!(matches!(
            messenger.send_and_wait(Message::text("after stop"), None).await,
            Err(ProtocolError::Cancelled)
        ));
    }

    #[tokio::test]
    async fn test_disconnect_cancels_and_then_fails_fast() {
        let (transport, mut sent) = ScriptedTransport::new();
        let messenger = messenger(&transport);

        let call = tokio::spawn({
            let messenger = messenger.clone();
            async move { messenger.send_and_wait(Message::text("hello"), None).await }
        });
        sent.recv().await.unwrap();

        transport.lose_connection();

        let result = timeout(Duration::from_secs(2), call).await.unwrap().unwrap();
        assert!(matches!(result, Err(ProtocolError::Cancelled)));
        assert!(matches!(
            messenger.send_and_wait(Message::text("again"), None).await,
            Err(ProtocolError::NotConnected)
        ));
        assert_eq!(messenger.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_unsolicited_messages_are_handled_in_order_one_at_a_time() {
        let (transport, _sent) = ScriptedTransport::new();
        let messenger = messenger(&transport);
        let (seen_tx, mut seen) = unbounded_channel();
        let busy = Arc::new(AtomicBool::new(false));

        messenger.on_message({
            let busy = busy.clone();
            move |message| {
                let seen_tx = seen_tx.clone();
                let busy = busy.clone();
                async move {
                    assert!(!busy.swap(true, Ordering::SeqCst), "handler re-entered");
                    tokio::time::sleep(Duration::from_millis(2)).await;
                    busy.store(false, Ordering::SeqCst);
                    let _ = seen_tx.send(message.body);
                }
            }
        });

        for i in 0..10 {
            transport.deliver(Message::text(format!("event-{i}")));
        }
        for i in 0..10 {
            let body = timeout(Duration::from_secs(2), seen.recv()).await.unwrap().unwrap();
            assert_eq!(body, MessageBody::Text(format!("event-{i}")));
        }
    }

    #[tokio::test]
    async fn test_panicking_handler_does_not_stop_the_worker() {
        let (transport, _sent) = ScriptedTransport::new();
        let messenger = messenger(&transport);
        let (seen_tx, mut seen) = unbounded_channel();

        messenger.on_message(move |message| {
            let seen_tx = seen_tx.clone();
            async move {
                if message.body == MessageBody::Text("boom".into()) {
                    panic!("handler failure");
                }
                let _ = seen_tx.send(message.body);
            }
        });

        transport.deliver(Message::text("boom"));
        transport.deliver(Message::text("fine"));

        let body = timeout(Duration::from_secs(2), seen.recv()).await.unwrap().unwrap();
        assert_eq!(body, MessageBody::Text("fine".into()));
    }

    #[tokio::test]
    async fn test_start_twice_is_rejected() {
        let (transport, _sent) = ScriptedTransport::new();
        let messenger = messenger(&transport);
        assert!(matches!(messenger.start(), Err(ProtocolError::AlreadyStarted)));
    }

    #[tokio::test]
    async fn test_quick_reconnect_still_cancels_stranded_calls() {
        let (transport, mut sent) = ScriptedTransport::new();
        let messenger = messenger(&transport);

        let call = tokio::spawn({
            let messenger = messenger.clone();
            async move { messenger.send_and_wait(Message::text("stranded"), None).await }
        });
        sent.recv().await.unwrap();

        transport.lose_connection();
        transport.reconnect();

        let result = timeout(Duration::from_secs(2), call).await.unwrap().unwrap();
        assert!(matches!(result, Err(ProtocolError::Cancelled)));
        assert_eq!(messenger.pending_count(), 0);

        // Calls on the new connection are unaffected
        let fresh = tokio::spawn({
            let messenger = messenger.clone();
            async move { messenger.send_and_wait(Message::text("fresh"), None).await }
        });
        let request = sent.recv().await.unwrap();
        transport.deliver(answer(&request, "welcome back"));
        let reply = timeout(Duration::from_secs(2), fresh).await.unwrap().unwrap().unwrap();
        assert_eq!(reply.body, MessageBody::Text("welcome back".into()));
    }

    #[tokio::test]
    async fn test_bounded_queue_rejects_overflow_but_not_replies() {
        let (transport, mut sent) = ScriptedTransport::new();
        let config = MessengerConfig {
            queue_capacity: Some(1),
            ..MessengerConfig::default()
        };
        let messenger = RequestReplyMessenger::new(transport.clone(), config);
        messenger.start().unwrap();

        let gate = Arc::new(Notify::new());
        let (seen_tx, mut seen) = unbounded_channel();
        messenger.on_message({
            let gate = gate.clone();
            move |message| {
                let seen_tx = seen_tx.clone();
                let gate = gate.clone();
                async move {
                    let _ = seen_tx.send(message.body);
                    gate.notified().await;
                }
            }
        });

        // The worker takes event-0 and blocks in the handler
        transport.deliver(Message::text("event-0"));
        let first = timeout(Duration::from_secs(2), seen.recv()).await.unwrap().unwrap();
        assert_eq!(first, MessageBody::Text("event-0".into()));

        // event-1 fills the single slot, event-2 is rejected
        transport.deliver(Message::text("event-1"));
        assert!(matches!(
            messenger.inner.enqueue(Message::text("event-2")),
            Err(ProtocolError::QueueFull(1))
        ));
        transport.deliver(Message::text("event-3"));

        // Replies bypass the full queue
        let call = tokio::spawn({
            let messenger = messenger.clone();
            async move { messenger.send_and_wait(Message::text("ping"), None).await }
        });
        let request = sent.recv().await.unwrap();
        transport.deliver(answer(&request, "pong"));
        let reply = timeout(Duration::from_secs(2), call).await.unwrap().unwrap().unwrap();
        assert_eq!(reply.replied_id, Some(request.id));

        gate.notify_one();
        let second = timeout(Duration::from_secs(2), seen.recv()).await.unwrap().unwrap();
        assert_eq!(second, MessageBody::Text("event-1".into()));

        gate.notify_one();
        assert!(timeout(Duration::from_millis(100), seen.recv()).await.is_err());
    }
}
