#![expect(
    clippy::module_name_repetitions,
    reason = "Connection types expose their domain in the name for clarity"
)]

//! The connection manager: state machine, heartbeat/retry loop and the public
//! send/receive/handler API that hides connection churn from the application.
//!
//! One I/O task per connection epoch exclusively owns the open transport and
//! selects over inbound frames, the outbound channel and cancellation. A
//! heartbeat task runs only while connected. Application `send()` calls never
//! suspend; they enqueue and hand the frame to whichever task owns the
//! transport. All background loops catch, log and reschedule -- nothing raises
//! out of them uncaught.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Instant;

use backoff::ExponentialBackoff;
use backoff::backoff::Backoff as _;
use serde_json::{Value, json};
use tokio::sync::{mpsc, watch};
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;

use crate::Result;
use crate::compress;
use crate::config::ConnectionConfig;
use crate::error::DeliveryExhausted;
use crate::monitor::NetworkMonitor;
use crate::queue::{DEFAULT_MAX_RETRIES, Envelope, Message, MessageQueue};
use crate::transport::{Frame, Transport, TransportFactory};

/// Type tag of the internal liveness probe.
pub const HEARTBEAT_TYPE: &str = "heartbeat";
/// Type tag of the probe reply. Exists so the remote's receive loop does not
/// log the probe as an unknown type; receiving one is a no-op.
pub const HEARTBEAT_ACK_TYPE: &str = "heartbeat_ack";

/// Connection state tracking.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Not connected
    Disconnected,
    /// Attempting to connect
    Connecting,
    /// Successfully connected
    Connected,
    /// Waiting out a backoff delay before the next attempt
    Reconnecting,
    /// Connection lost or attempts exhausted; not retrying until triggered
    Error,
}

impl ConnectionState {
    /// Check if the connection is currently active.
    #[must_use]
    pub const fn is_connected(self) -> bool {
        matches!(self, Self::Connected)
    }
}

type MessageHandler = Arc<dyn Fn(Value) + Send + Sync>;
type StateCallback = Arc<dyn Fn(ConnectionState) + Send + Sync>;
type FailureCallback = Arc<dyn Fn(DeliveryExhausted) + Send + Sync>;

/// Manages one logical duplex connection: lifecycle, reconnection with
/// exponential backoff, heartbeats, and at-least-once retransmission.
///
/// Cheap to clone; all clones share the same underlying connection.
///
/// # Example
///
/// ```ignore
/// let manager = ConnectionManager::new(ConnectionConfig::new("wss://example.com/ws"));
/// manager.add_message_handler("chat", |content| println!("got {content}"));
/// manager.connect(Arc::new(WsFactory::new("wss://example.com/ws"))).await?;
/// let id = manager.send("chat", json!({"body": "hello"}));
/// ```
#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<Inner>,
}

struct Inner {
    config: ConnectionConfig,
    /// Watch channel for state changes (enables awaiting reconnection in tests
    /// and subscribers)
    state_tx: watch::Sender<ConnectionState>,
    queue: Mutex<MessageQueue>,
    monitor: Arc<NetworkMonitor>,
    handlers: Mutex<HashMap<String, MessageHandler>>,
    state_callbacks: Mutex<Vec<StateCallback>>,
    failure_callbacks: Mutex<Vec<FailureCallback>>,
    /// Outbound frame channel of the current epoch; `None` while disconnected
    outbound: Mutex<Option<mpsc::UnboundedSender<Frame>>>,
    /// Cancels the current epoch's I/O and heartbeat tasks
    epoch_cancel: Mutex<Option<CancellationToken>>,
    /// Factory captured on the first `connect()`, reused by reconnects
    factory: Mutex<Option<Arc<dyn TransportFactory>>>,
    backoff: Mutex<ExponentialBackoff>,
    reconnect_attempts: AtomicU32,
    last_reconnect: Mutex<Option<Instant>>,
}

impl ConnectionManager {
    /// Create a manager with its own [`NetworkMonitor`].
    #[must_use]
    pub fn new(config: ConnectionConfig) -> Self {
        Self::with_monitor(config, Arc::new(NetworkMonitor::new()))
    }

    /// Create a manager around a caller-supplied monitor (tests point the
    /// probe at a local listener).
    #[must_use]
    pub fn with_monitor(config: ConnectionConfig, monitor: Arc<NetworkMonitor>) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        let backoff: ExponentialBackoff = config.reconnect.clone().into();
        let queue = MessageQueue::new(config.pending_capacity, config.received_capacity);

        let inner = Arc::new(Inner {
            config,
            state_tx,
            queue: Mutex::new(queue),
            monitor: Arc::clone(&monitor),
            handlers: Mutex::new(HashMap::new()),
            state_callbacks: Mutex::new(Vec::new()),
            failure_callbacks: Mutex::new(Vec::new()),
            outbound: Mutex::new(None),
            epoch_cancel: Mutex::new(None),
            factory: Mutex::new(None),
            backoff: Mutex::new(backoff),
            reconnect_attempts: AtomicU32::new(0),
            last_reconnect: Mutex::new(None),
        });

        let weak = Arc::downgrade(&inner);
        monitor.add_callback(move |online| Self::on_network_change(&weak, online));

        Self { inner }
    }

    /// Network transitions drive recovery: back online while idle in
    /// `Disconnected`/`Error` restarts the reconnect cycle; offline while the
    /// connection is up degrades to `Error` and schedules recovery.
    fn on_network_change(weak: &Weak<Inner>, online: bool) {
        let Some(inner) = weak.upgrade() else {
            return;
        };
        let manager = Self { inner };

        if online {
            if matches!(
                manager.state(),
                ConnectionState::Disconnected | ConnectionState::Error
            ) {
                tracing::info!("network restored, attempting reconnect");
                // The recovery trigger restarts the cycle from scratch
                manager.inner.reconnect_attempts.store(0, Ordering::SeqCst);
                *lock(&manager.inner.backoff) = manager.inner.config.reconnect.clone().into();
                *lock(&manager.inner.last_reconnect) = None;
                let task = manager.clone();
                tokio::spawn(async move {
                    if let Err(e) = task.reconnect().await {
                        tracing::debug!(error = %e, "reconnect after network recovery failed");
                    }
                });
            }
        } else if matches!(
            manager.state(),
            ConnectionState::Connected | ConnectionState::Connecting
        ) {
            tracing::warn!("network offline, dropping connection");
            manager.update_state(ConnectionState::Error);
            manager.schedule_reconnect();
        }
    }

    /// Get the current connection state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        *self.inner.state_tx.borrow()
    }

    /// Subscribe to connection state changes.
    #[must_use]
    pub fn state_receiver(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state_tx.subscribe()
    }

    /// The reachability monitor driving automatic recovery.
    #[must_use]
    pub fn monitor(&self) -> &Arc<NetworkMonitor> {
        &self.inner.monitor
    }

    /// Register a handler invoked with the `content` of inbound messages of
    /// the given type. Heartbeat types are handled internally and never reach
    /// handlers.
    pub fn add_message_handler<S, F>(&self, message_type: S, handler: F)
    where
        S: Into<String>,
        F: Fn(Value) + Send + Sync + 'static,
    {
        lock(&self.inner.handlers).insert(message_type.into(), Arc::new(handler));
    }

    /// Register a callback invoked with the new state on every transition.
    /// Callbacks run synchronously and must not block; they may call back
    /// into the manager.
    pub fn add_state_callback<F>(&self, callback: F)
    where
        F: Fn(ConnectionState) + Send + Sync + 'static,
    {
        lock(&self.inner.state_callbacks).push(Arc::new(callback));
    }

    /// Register a callback invoked once per message whose retry budget is
    /// exhausted without confirmation.
    pub fn add_failure_callback<F>(&self, callback: F)
    where
        F: Fn(DeliveryExhausted) + Send + Sync + 'static,
    {
        lock(&self.inner.failure_callbacks).push(Arc::new(callback));
    }

    /// Establish the connection using `factory`, which is retained for later
    /// reconnects.
    ///
    /// No-op when already `Connecting` or `Connected`. On success the attempt
    /// counter and backoff are reset and every still-pending message is
    /// replayed in FIFO order on the fresh transport before the `Connected`
    /// state becomes observable. Messages enqueued concurrently with that
    /// replay may interleave after it; ordering across a reconnect boundary is
    /// best-effort only.
    ///
    /// On failure the state moves to `Error`, a reconnect is scheduled, and
    /// the immediate cause is returned.
    pub async fn connect(&self, factory: Arc<dyn TransportFactory>) -> Result<()> {
        if matches!(
            self.state(),
            ConnectionState::Connecting | ConnectionState::Connected
        ) {
            return Ok(());
        }

        *lock(&self.inner.factory) = Some(Arc::clone(&factory));
        self.update_state(ConnectionState::Connecting);

        let mut transport = match factory.connect().await {
            Ok(transport) => transport,
            Err(e) => {
                tracing::error!(error = %e, "connection attempt failed");
                self.update_state(ConnectionState::Error);
                self.schedule_reconnect();
                return Err(e);
            }
        };

        self.inner.reconnect_attempts.store(0, Ordering::SeqCst);
        *lock(&self.inner.backoff) = self.inner.config.reconnect.clone().into();
        *lock(&self.inner.last_reconnect) = None;

        // Replay pending messages on the fresh transport before anyone can
        // observe Connected.
        let snapshot = lock(&self.inner.queue).pending_snapshot();
        for message in snapshot {
            let frame = match self.encode_message(&message) {
                Ok(frame) => frame,
                Err(e) => {
                    tracing::warn!(id = %message.id, error = %e, "dropping unserializable message");
                    continue;
                }
            };
            if let Err(e) = transport.send(frame).await {
                tracing::error!(error = %e, "flush failed on fresh transport");
                self.update_state(ConnectionState::Error);
                self.schedule_reconnect();
                return Err(e);
            }
            lock(&self.inner.queue).mark_sent(&message.id);
        }

        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        *lock(&self.inner.outbound) = Some(outbound_tx);
        if let Some(previous) = lock(&self.inner.epoch_cancel).replace(cancel.clone()) {
            previous.cancel();
        }

        self.update_state(ConnectionState::Connected);
        tracing::info!("connection established");

        let io = self.clone();
        let io_cancel = cancel.clone();
        tokio::spawn(async move {
            io.run_io(transport, outbound_rx, io_cancel).await;
        });

        let heartbeat = self.clone();
        tokio::spawn(async move {
            heartbeat.run_heartbeat(cancel).await;
        });

        Ok(())
    }

    /// Tear the connection down: cancel the heartbeat and I/O tasks (the I/O
    /// task closes the transport, swallowing close errors) and report
    /// `Disconnected`. Safe to call from any state; messages mid-retry stay
    /// in the unconfirmed map so a later `connect()` resumes retrying them.
    pub fn disconnect(&self) {
        self.teardown_epoch();
        self.update_state(ConnectionState::Disconnected);
    }

    /// Run one reconnect cycle: wait out the exponential backoff, then retry
    /// the captured transport factory.
    ///
    /// No-op when a cycle is already in flight. After
    /// `reconnect.max_attempts` cycles the state settles in `Error` and
    /// automatic retry stops; a network-recovery notification or a manual
    /// [`connect`](Self::connect) restarts the cycle.
    pub async fn reconnect(&self) -> Result<()> {
        if !self.try_enter_reconnecting() {
            return Ok(());
        }
        self.teardown_epoch();

        let delay = lock(&self.inner.backoff)
            .next_backoff()
            .unwrap_or(self.inner.config.reconnect.max_backoff);

        // Sleep only the remainder when attempts arrive in quick succession,
        // keeping the effective pace monotonically non-decreasing.
        let elapsed = (*lock(&self.inner.last_reconnect)).map(|at| at.elapsed());
        match elapsed {
            Some(since_last) if since_last < delay => sleep(delay - since_last).await,
            Some(_) => {}
            None => sleep(delay).await,
        }

        *lock(&self.inner.last_reconnect) = Some(Instant::now());
        let attempt = self.inner.reconnect_attempts.fetch_add(1, Ordering::SeqCst) + 1;
        let max_attempts = self.inner.config.reconnect.max_attempts;

        if attempt >= max_attempts {
            tracing::error!(attempt, max_attempts, "reconnect attempts exhausted");
            self.update_state(ConnectionState::Error);
            return Err(crate::error::Error::validation(
                "reconnect attempts exhausted",
            ));
        }

        tracing::info!(attempt, max_attempts, "attempting reconnect");

        let factory = lock(&self.inner.factory).clone();
        let Some(factory) = factory else {
            self.update_state(ConnectionState::Error);
            return Err(crate::error::Error::validation(
                "reconnect before any connect(): no transport factory captured",
            ));
        };

        self.connect(factory).await
    }

    /// Enqueue a message with the default retry budget and, when connected,
    /// transmit it immediately. Never blocks and never fails: transport
    /// problems surface through the state machine, not this call.
    pub fn send(&self, message_type: &str, content: Value) -> String {
        self.send_with_retries(message_type, content, DEFAULT_MAX_RETRIES)
    }

    /// [`send`](Self::send) with an explicit retry budget.
    pub fn send_with_retries(
        &self,
        message_type: &str,
        content: Value,
        max_retries: u32,
    ) -> String {
        let id = lock(&self.inner.queue).enqueue(message_type, content, max_retries);

        if self.state().is_connected() {
            let message = lock(&self.inner.queue).pending_message(&id);
            if let Some(message) = message {
                self.transmit_queued(&message);
            }
        } else {
            tracing::debug!(%id, "not connected, message queued for replay");
        }

        id
    }

    /// Serialize, maybe compress, and hand a queued message to the I/O task.
    /// Marks it sent (unconfirmed) once it is on the channel.
    fn transmit_queued(&self, message: &Message) {
        let frame = match self.encode_message(message) {
            Ok(frame) => frame,
            Err(e) => {
                tracing::warn!(id = %message.id, error = %e, "dropping unserializable message");
                return;
            }
        };

        let delivered = lock(&self.inner.outbound)
            .as_ref()
            .is_some_and(|tx| tx.send(frame).is_ok());

        if delivered {
            lock(&self.inner.queue).mark_sent(&message.id);
        } else {
            // I/O task is gone; the message stays pending for the next epoch
            tracing::debug!(id = %message.id, "outbound channel closed, keeping message pending");
        }
    }

    fn encode_message(&self, message: &Message) -> Result<Frame> {
        let text = serde_json::to_string(&message.envelope())?;
        let bytes = compress::encode(
            &text,
            self.inner.config.enable_compression,
            self.inner.config.compression_threshold,
        );
        Ok(Frame::from_encoded(bytes))
    }

    /// Fire-and-forget control frame (heartbeats). Bypasses the queue so
    /// control traffic never consumes retry budget.
    fn send_control(&self, message_type: &str, content: Value) {
        let id = lock(&self.inner.queue).allocate_id();
        let envelope = Envelope::new(id, message_type.to_owned(), content);
        let text = match serde_json::to_string(&envelope) {
            Ok(text) => text,
            Err(e) => {
                tracing::warn!(error = %e, "failed to serialize control frame");
                return;
            }
        };
        let bytes = compress::encode(
            &text,
            self.inner.config.enable_compression,
            self.inner.config.compression_threshold,
        );
        let sent = lock(&self.inner.outbound)
            .as_ref()
            .is_some_and(|tx| tx.send(Frame::from_encoded(bytes)).is_ok());
        if !sent {
            tracing::debug!(%message_type, "control frame dropped, no open transport");
        }
    }

    /// Transmit everything pending through the current epoch's channel
    /// (retry path; the connect path flushes on the transport directly).
    fn flush_pending(&self) {
        let snapshot = lock(&self.inner.queue).pending_snapshot();
        for message in snapshot {
            self.transmit_queued(&message);
        }
    }

    /// Decode and dispatch one inbound frame. Malformed frames are dropped
    /// with a warning; duplicates never re-trigger handlers.
    fn handle_frame(&self, raw: &[u8]) {
        let text = compress::decompress(raw);
        let envelope: Envelope = match serde_json::from_str(&text) {
            Ok(envelope) => envelope,
            Err(e) => {
                tracing::warn!(error = %e, "dropping unparseable inbound frame");
                return;
            }
        };

        // Also the confirmation path: an echoed id clears our unconfirmed entry.
        let fresh = lock(&self.inner.queue).mark_received(&envelope.id);
        if !fresh {
            tracing::debug!(id = %envelope.id, "duplicate delivery ignored");
            return;
        }

        match envelope.message_type.as_str() {
            HEARTBEAT_TYPE => {
                self.send_control(
                    HEARTBEAT_ACK_TYPE,
                    json!({"timestamp": chrono::Utc::now().timestamp_millis()}),
                );
            }
            HEARTBEAT_ACK_TYPE => {}
            message_type => {
                let handler = lock(&self.inner.handlers).get(message_type).cloned();
                if let Some(handler) = handler {
                    handler(envelope.content);
                } else {
                    tracing::warn!(%message_type, "no handler for inbound message type");
                }
            }
        }
    }

    /// I/O task: exclusive owner of the open transport for one epoch.
    async fn run_io(
        self,
        mut transport: Box<dyn Transport>,
        mut outbound_rx: mpsc::UnboundedReceiver<Frame>,
        cancel: CancellationToken,
    ) {
        loop {
            tokio::select! {
                () = cancel.cancelled() => {
                    if let Err(e) = transport.close().await {
                        tracing::debug!(error = %e, "error closing transport");
                    }
                    break;
                }

                frame = outbound_rx.recv() => {
                    let Some(frame) = frame else {
                        // Teardown races the token against the dropped sender;
                        // the close handshake happens on either path
                        if let Err(e) = transport.close().await {
                            tracing::debug!(error = %e, "error closing transport");
                        }
                        break;
                    };
                    match timeout(self.inner.config.message_timeout, transport.send(frame)).await {
                        Ok(Ok(())) => {}
                        Ok(Err(e)) => {
                            tracing::warn!(error = %e, "transport send failed");
                            self.on_transport_error();
                            break;
                        }
                        Err(_) => {
                            tracing::warn!("transport send timed out");
                            self.on_transport_error();
                            break;
                        }
                    }
                }

                inbound = transport.recv() => {
                    match inbound {
                        Ok(Some(frame)) => self.handle_frame(&frame.into_bytes()),
                        Ok(None) => {
                            tracing::info!("connection closed by remote");
                            self.on_transport_error();
                            break;
                        }
                        Err(e) => {
                            tracing::warn!(error = %e, "transport receive failed");
                            self.on_transport_error();
                            break;
                        }
                    }
                }
            }
        }
    }

    /// Heartbeat/retry task: runs only while `Connected`.
    async fn run_heartbeat(self, cancel: CancellationToken) {
        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                () = sleep(self.inner.config.heartbeat_interval) => {}
            }

            if !self.state().is_connected() {
                break;
            }

            self.send_control(
                HEARTBEAT_TYPE,
                json!({"timestamp": chrono::Utc::now().timestamp_millis()}),
            );

            let (requeued, failed) = lock(&self.inner.queue)
                .retry_stale(self.inner.config.stale_after);
            self.report_failures(failed);
            if requeued > 0 {
                tracing::debug!(requeued, "retransmitting stale messages");
                self.flush_pending();
            }

            self.inner.monitor.check_status().await;
        }
    }

    /// Surface delivery exhaustion to the application, exactly once per
    /// failed message.
    fn report_failures(&self, failed: Vec<Message>) {
        if failed.is_empty() {
            return;
        }
        // Snapshot so callbacks may reenter the manager
        let callbacks = lock(&self.inner.failure_callbacks).clone();
        for message in failed {
            tracing::error!(
                id = %message.id,
                message_type = %message.message_type,
                retries = message.retry_count,
                "message delivery failed"
            );
            let failure = DeliveryExhausted {
                id: message.id,
                message_type: message.message_type,
                retries: message.retry_count,
            };
            for callback in callbacks.iter() {
                callback(failure.clone());
            }
        }
    }

    fn on_transport_error(&self) {
        // A deliberate disconnect is not an error
        if self.state() == ConnectionState::Disconnected {
            return;
        }
        self.update_state(ConnectionState::Error);
        self.schedule_reconnect();
    }

    /// Spawn a reconnect cycle if the connection is in `Error`.
    fn schedule_reconnect(&self) {
        if self.state() != ConnectionState::Error {
            return;
        }
        let manager = self.clone();
        tokio::spawn(async move {
            if let Err(e) = manager.reconnect().await {
                tracing::debug!(error = %e, "scheduled reconnect failed");
            }
        });
    }

    /// Atomically move to `Reconnecting`; `false` when a cycle already holds
    /// the state (re-entry is a no-op).
    fn try_enter_reconnecting(&self) -> bool {
        let entered = self.inner.state_tx.send_if_modified(|state| {
            if *state == ConnectionState::Reconnecting {
                false
            } else {
                *state = ConnectionState::Reconnecting;
                true
            }
        });
        if entered {
            self.notify_state(ConnectionState::Reconnecting);
        }
        entered
    }

    fn teardown_epoch(&self) {
        if let Some(cancel) = lock(&self.inner.epoch_cancel).take() {
            cancel.cancel();
        }
        *lock(&self.inner.outbound) = None;
    }

    fn update_state(&self, new_state: ConnectionState) {
        let changed = self.inner.state_tx.send_if_modified(|state| {
            if *state == new_state {
                false
            } else {
                *state = new_state;
                true
            }
        });
        if changed {
            tracing::debug!(state = ?new_state, "connection state changed");
            self.notify_state(new_state);
        }
    }

    fn notify_state(&self, state: ConnectionState) {
        // Snapshot so callbacks may reenter the manager
        let callbacks = lock(&self.inner.state_callbacks).clone();
        for callback in &callbacks {
            callback(state);
        }
    }

    /// Pending/unconfirmed depths, mostly for diagnostics and tests.
    #[must_use]
    pub fn queue_depths(&self) -> (usize, usize) {
        let queue = lock(&self.inner.queue);
        (queue.pending_len(), queue.unconfirmed_len())
    }
}

/// Locks are only ever held for short, non-awaiting critical sections; a
/// poisoned lock means a panicking callback, which must not wedge the manager.
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
