//! # Connection Manager
//!
//! One transport per channel key, with connect timeout, keep-alive
//! heartbeat, bounded outbound queue and counted reconnects.
//!
//! ## Lifecycle
//!
//! `idle -> connecting -> connected -> (disconnected | error)`
//!
//! - An unsolicited close from `connected` moves to `disconnected` and
//!   schedules a reconnect after `reconnect_interval`.
//! - Every reconnect attempt bumps the per-channel counter; success resets
//!   it. Once the counter reaches `max_reconnect_attempts` the channel stays
//!   `disconnected`.
//! - Messages sent while not connected are queued (drop-oldest past
//!   `max_queue_size`) and flushed in FIFO order ahead of any new send once
//!   the transport opens.
//!
//! Each live transport is driven by one task, so inbound frames reach the
//! dispatcher in the order the socket delivered them.
//!
//! Status changes are published per channel through
//! [`ConnectionManager::watch_status`].

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use super::dispatcher::{Dispatcher, EventPublisher};
use super::errors::{RealtimeError, RealtimeResult};
use super::event::WireMessage;
use super::metrics::RealtimeMetrics;
use super::transport::{Connector, FrameSink, Transport};

/// Address used when neither the config nor the environment names one
pub const DEFAULT_URL: &str = "ws://localhost:3001";

/// Connection status for a channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
    /// Known channel that has never connected (messages may be queued)
    Idle,
    Connecting,
    Connected,
    Disconnected,
    Error,
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnectionStatus::Idle => "idle",
            ConnectionStatus::Connecting => "connecting",
            ConnectionStatus::Connected => "connected",
            ConnectionStatus::Disconnected => "disconnected",
            ConnectionStatus::Error => "error",
        };
        f.write_str(s)
    }
}

/// What a status watcher sees for one channel
#[derive(Debug, Clone, Default)]
pub struct ChannelStatus {
    /// `None` while the channel is unknown to the manager
    pub status: Option<ConnectionStatus>,
    /// Error behind the current status, cleared on a successful open
    pub last_error: Option<RealtimeError>,
}

impl ChannelStatus {
    fn of(state: Option<&ChannelState>) -> Self {
        Self {
            status: state.map(|s| s.status),
            last_error: state.and_then(|s| s.last_error.clone()),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.status == Some(ConnectionStatus::Connected)
    }
}

/// Per-channel connection settings
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Target address; `None` uses the manager's default URL
    pub url: Option<String>,

    /// Sub-protocols offered during the handshake
    pub protocols: Vec<String>,

    /// Delay before each reconnect attempt
    pub reconnect_interval: Duration,

    /// Reconnect attempts before giving up
    pub max_reconnect_attempts: u32,

    /// Keep-alive period
    pub heartbeat_interval: Duration,

    /// Budget for a single connect attempt
    pub connect_timeout: Duration,

    /// Outbound queue capacity while disconnected
    pub max_queue_size: usize,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            url: None,
            protocols: Vec::new(),
            reconnect_interval: Duration::from_millis(5000),
            max_reconnect_attempts: 5,
            heartbeat_interval: Duration::from_millis(30_000),
            connect_timeout: Duration::from_millis(10_000),
            max_queue_size: 1000,
        }
    }
}

impl ConnectionConfig {
    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = Some(url.into());
        self
    }

    pub fn with_protocols(mut self, protocols: Vec<String>) -> Self {
        self.protocols = protocols;
        self
    }

    pub fn with_reconnect(mut self, interval: Duration, max_attempts: u32) -> Self {
        self.reconnect_interval = interval;
        self.max_reconnect_attempts = max_attempts;
        self
    }

    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_max_queue_size(mut self, size: usize) -> Self {
        self.max_queue_size = size;
        self
    }
}

/// Bookkeeping for one channel key
struct ChannelState {
    config: ConnectionConfig,
    url: String,
    status: ConnectionStatus,
    reconnect_attempts: u32,
    queue: VecDeque<WireMessage>,
    outbound: Option<mpsc::UnboundedSender<WireMessage>>,
    driver: Option<JoinHandle<()>>,
    reconnect: Option<JoinHandle<()>>,
    /// Bumped on every connect attempt; stale attempts and drivers compare against it
    generation: u64,
    last_error: Option<RealtimeError>,
}

impl ChannelState {
    fn new(config: ConnectionConfig, url: String) -> Self {
        Self {
            config,
            url,
            status: ConnectionStatus::Idle,
            reconnect_attempts: 0,
            queue: VecDeque::new(),
            outbound: None,
            driver: None,
            reconnect: None,
            generation: 0,
            last_error: None,
        }
    }

    fn cancel_reconnect(&mut self) {
        if let Some(handle) = self.reconnect.take() {
            handle.abort();
        }
    }
}

struct Inner {
    connector: Arc<dyn Connector>,
    dispatcher: Arc<Dispatcher>,
    metrics: Arc<RealtimeMetrics>,
    default_url: String,
    channels: Mutex<HashMap<String, ChannelState>>,
    /// Lock order: `channels` before `watchers`
    watchers: Mutex<HashMap<String, watch::Sender<ChannelStatus>>>,
}

impl Drop for Inner {
    fn drop(&mut self) {
        let channels = self
            .channels
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner);

        for state in channels.values_mut() {
            state.cancel_reconnect();
            if let Some(driver) = state.driver.take() {
                driver.abort();
            }
        }
    }
}

/// Registry of channel connections.
///
/// Cheap to clone; all clones share the same channels.
#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<Inner>,
}

impl fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("default_url", &self.inner.default_url)
            .field("channels", &self.channel_keys())
            .finish()
    }
}

impl ConnectionManager {
    /// Create a manager delivering inbound frames to `dispatcher`
    pub fn new(
        connector: Arc<dyn Connector>,
        dispatcher: Arc<Dispatcher>,
        default_url: impl Into<String>,
    ) -> Self {
        let metrics = Arc::clone(dispatcher.metrics());
        Self {
            inner: Arc::new(Inner {
                connector,
                dispatcher,
                metrics,
                default_url: default_url.into(),
                channels: Mutex::new(HashMap::new()),
                watchers: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Open (or reopen) the transport for `key`.
    ///
    /// Resolves `Ok(true)` once open. A transport error or an elapsed
    /// `connect_timeout` fails this call and schedules a reconnect. Calling
    /// this cancels any pending reconnect and resets the attempt counter.
    pub async fn connect(&self, key: &str, config: ConnectionConfig) -> RealtimeResult<bool> {
        let generation = {
            let mut channels = self.inner.channels();
            let url = config
                .url
                .clone()
                .unwrap_or_else(|| self.inner.default_url.clone());

            let state = channels
                .entry(key.to_string())
                .or_insert_with(|| ChannelState::new(config.clone(), url.clone()));

            if state.status == ConnectionStatus::Connected && state.outbound.is_some() {
                return Ok(true);
            }

            state.cancel_reconnect();
            state.config = config;
            state.url = url;
            state.reconnect_attempts = 0;
            state.status = ConnectionStatus::Connecting;
            state.generation += 1;
            self.inner.notify(key, Some(&*state));
            state.generation
        };

        tracing::info!(channel = key, "connecting");
        Inner::open(&self.inner, key, generation).await
    }

    /// Close the transport and forget the channel. Unknown keys are a no-op.
    ///
    /// Queued messages are discarded.
    pub fn disconnect(&self, key: &str) {
        let removed = {
            let mut channels = self.inner.channels();
            let removed = channels.remove(key);
            if removed.is_some() {
                self.inner.notify(key, None);
            }
            removed
        };

        if let Some(mut state) = removed {
            state.cancel_reconnect();
            // Dropping the sender lets the driver close the socket cleanly
            state.outbound = None;

            let dropped = state.queue.len();
            if dropped > 0 {
                self.inner.metrics.add_dropped(dropped as u64);
            }
            tracing::info!(channel = key, dropped, "disconnected");
        }
    }

    /// Like [`disconnect`](Self::disconnect), but waits until messages already
    /// handed to the transport are written and the socket is closed.
    pub async fn close(&self, key: &str) {
        let driver = self
            .inner
            .channels()
            .get_mut(key)
            .and_then(|state| state.driver.take());
        self.disconnect(key);

        if let Some(driver) = driver {
            let _ = driver.await;
        }
    }

    /// Disconnect every channel
    pub fn disconnect_all(&self) {
        for key in self.channel_keys() {
            self.disconnect(&key);
        }
    }

    /// Send now if open (`true`), otherwise queue for later delivery (`false`).
    pub fn send(&self, key: &str, message: WireMessage) -> bool {
        self.inner.send(key, message)
    }

    pub fn is_connected(&self, key: &str) -> bool {
        self.status(key) == Some(ConnectionStatus::Connected)
    }

    pub fn status(&self, key: &str) -> Option<ConnectionStatus> {
        self.inner.channels().get(key).map(|s| s.status)
    }

    /// Messages waiting for the transport to open
    pub fn queued_len(&self, key: &str) -> usize {
        self.inner.channels().get(key).map(|s| s.queue.len()).unwrap_or(0)
    }

    /// Failed-or-running reconnect attempts since the last successful open
    pub fn reconnect_attempts(&self, key: &str) -> u32 {
        self.inner
            .channels()
            .get(key)
            .map(|s| s.reconnect_attempts)
            .unwrap_or(0)
    }

    /// Most recent transport or timeout error
    pub fn last_error(&self, key: &str) -> Option<RealtimeError> {
        self.inner.channels().get(key).and_then(|s| s.last_error.clone())
    }

    pub fn channel_keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.inner.channels().keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Receiver that observes every status change of channel `key`,
    /// including channels not created yet
    pub fn watch_status(&self, key: &str) -> watch::Receiver<ChannelStatus> {
        let channels = self.inner.channels();
        let mut watchers = self.inner.watchers();
        watchers.retain(|_, tx| tx.receiver_count() > 0);
        watchers
            .entry(key.to_string())
            .or_insert_with(|| watch::channel(ChannelStatus::of(channels.get(key))).0)
            .subscribe()
    }

    /// Publisher that sends through channel `key`
    pub fn publisher(&self, key: &str) -> ChannelPublisher {
        ChannelPublisher {
            inner: Arc::downgrade(&self.inner),
            key: key.to_string(),
        }
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.inner.dispatcher
    }

    /// Handle that does not keep the manager alive, for use inside event handlers
    pub fn downgrade(&self) -> WeakConnectionManager {
        WeakConnectionManager {
            inner: Arc::downgrade(&self.inner),
        }
    }
}

/// Non-owning [`ConnectionManager`] handle
#[derive(Debug, Clone)]
pub struct WeakConnectionManager {
    inner: Weak<Inner>,
}

impl WeakConnectionManager {
    pub fn upgrade(&self) -> Option<ConnectionManager> {
        self.inner.upgrade().map(|inner| ConnectionManager { inner })
    }
}

impl Inner {
    fn channels(&self) -> MutexGuard<'_, HashMap<String, ChannelState>> {
        self.channels.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn watchers(&self) -> MutexGuard<'_, HashMap<String, watch::Sender<ChannelStatus>>> {
        self.watchers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Publish the current status of `key` to its watchers, if any
    fn notify(&self, key: &str, state: Option<&ChannelState>) {
        if let Some(tx) = self.watchers().get(key) {
            tx.send_replace(ChannelStatus::of(state));
        }
    }

    fn send(&self, key: &str, message: WireMessage) -> bool {
        let mut channels = self.channels();
        let state = channels.entry(key.to_string()).or_insert_with(|| {
            ChannelState::new(ConnectionConfig::default(), self.default_url.clone())
        });

        let message = match (&state.status, &state.outbound) {
            (ConnectionStatus::Connected, Some(tx)) => match tx.send(message) {
                Ok(()) => return true,
                Err(mpsc::error::SendError(message)) => message,
            },
            _ => message,
        };

        self.enqueue(key, state, message);
        false
    }

    fn enqueue(&self, key: &str, state: &mut ChannelState, message: WireMessage) {
        let capacity = state.config.max_queue_size;
        if capacity == 0 {
            self.metrics.add_dropped(1);
            tracing::warn!(channel = key, "outbound queue disabled, dropping message");
            return;
        }

        while state.queue.len() >= capacity {
            if let Some(evicted) = state.queue.pop_front() {
                self.metrics.add_dropped(1);
                tracing::warn!(channel = key, message_id = %evicted.id, "outbound queue full, dropping oldest");
            }
        }

        state.queue.push_back(message);
        self.metrics.increment_queued();
        tracing::debug!(channel = key, queued = state.queue.len(), "message queued");
    }

    /// Put messages the driver never wrote back at the head of the queue,
    /// ahead of anything sent after the transport closed
    fn requeue_front(&self, key: &str, state: &mut ChannelState, unsent: Vec<WireMessage>) {
        for message in unsent.into_iter().rev() {
            state.queue.push_front(message);
            self.metrics.increment_queued();
        }

        let capacity = state.config.max_queue_size;
        while state.queue.len() > capacity {
            if let Some(evicted) = state.queue.pop_front() {
                self.metrics.add_dropped(1);
                tracing::warn!(channel = key, message_id = %evicted.id, "outbound queue full, dropping oldest");
            }
        }
    }

    /// Run one connect attempt for `generation`
    async fn open(inner: &Arc<Inner>, key: &str, generation: u64) -> RealtimeResult<bool> {
        let (url, protocols, timeout) = {
            let channels = inner.channels();
            match channels.get(key) {
                Some(state) if state.generation == generation => (
                    state.url.clone(),
                    state.config.protocols.clone(),
                    state.config.connect_timeout,
                ),
                _ => return Err(RealtimeError::ConnectionClosed),
            }
        };

        let attempt = tokio::time::timeout(timeout, inner.connector.connect(&url, &protocols)).await;

        match attempt {
            Ok(Ok(transport)) => inner.establish(key, generation, transport),
            Ok(Err(e)) => {
                inner.fail(key, generation, e.clone());
                Err(e)
            }
            Err(_) => {
                let e = RealtimeError::Timeout(timeout);
                inner.fail(key, generation, e.clone());
                Err(e)
            }
        }
    }

    fn establish(self: &Arc<Self>, key: &str, generation: u64, transport: Transport) -> RealtimeResult<bool> {
        let mut channels = self.channels();
        let state = match channels.get_mut(key) {
            Some(state) if state.generation == generation => state,
            // Superseded or disconnected while connecting; dropping the transport closes it
            _ => return Err(RealtimeError::ConnectionClosed),
        };

        let (tx, rx) = mpsc::unbounded_channel();
        let flushed = state.queue.len();
        for message in state.queue.drain(..) {
            // Receiver is alive until the driver below exits
            let _ = tx.send(message);
        }

        let driver = tokio::spawn(drive(
            transport,
            rx,
            state.config.heartbeat_interval,
            Arc::clone(&self.dispatcher),
            Arc::clone(&self.metrics),
            Arc::downgrade(self),
            key.to_string(),
            generation,
        ));

        state.status = ConnectionStatus::Connected;
        state.reconnect_attempts = 0;
        state.last_error = None;
        state.outbound = Some(tx);
        state.driver = Some(driver);
        self.notify(key, Some(&*state));

        tracing::info!(channel = key, url = %state.url, flushed, "connected");
        Ok(true)
    }

    /// A connect attempt failed
    fn fail(self: &Arc<Self>, key: &str, generation: u64, error: RealtimeError) {
        let mut channels = self.channels();
        let Some(state) = channels.get_mut(key) else {
            return;
        };
        if state.generation != generation {
            return;
        }

        tracing::warn!(channel = key, error = %error, "connect attempt failed");
        state.status = ConnectionStatus::Error;
        state.outbound = None;
        state.driver = None;
        state.last_error = Some(error);
        self.schedule_reconnect(key, state);
        self.notify(key, Some(&*state));
    }

    /// The driver for `generation` stopped without being asked to
    fn handle_closed(
        self: &Arc<Self>,
        key: &str,
        generation: u64,
        error: RealtimeError,
        unsent: Vec<WireMessage>,
    ) {
        let mut channels = self.channels();
        let Some(state) = channels.get_mut(key) else {
            return;
        };
        if state.generation != generation {
            return;
        }

        tracing::warn!(channel = key, error = %error, requeued = unsent.len(), "connection lost");
        state.status = ConnectionStatus::Disconnected;
        state.outbound = None;
        state.driver = None;
        state.last_error = Some(error);

        self.requeue_front(key, state, unsent);
        self.schedule_reconnect(key, state);
        self.notify(key, Some(&*state));
    }

    fn schedule_reconnect(self: &Arc<Self>, key: &str, state: &mut ChannelState) {
        let max = state.config.max_reconnect_attempts;
        if state.reconnect_attempts >= max {
            state.status = ConnectionStatus::Disconnected;
            tracing::warn!(channel = key, attempts = state.reconnect_attempts, max, "giving up on reconnect");
            return;
        }

        let weak = Arc::downgrade(self);
        let delay = state.config.reconnect_interval;
        let scheduled = state.generation;
        let key = key.to_string();

        state.cancel_reconnect();
        state.reconnect = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(inner) = weak.upgrade() {
                Inner::reconnect(inner, key, scheduled).await;
            }
        }));
    }

    async fn reconnect(inner: Arc<Inner>, key: String, scheduled: u64) {
        let generation = {
            let mut channels = inner.channels();
            let Some(state) = channels.get_mut(&key) else {
                return;
            };
            if state.generation != scheduled {
                return;
            }

            state.reconnect = None;
            state.reconnect_attempts += 1;
            state.status = ConnectionStatus::Connecting;
            state.generation += 1;
            inner.notify(&key, Some(&*state));

            tracing::info!(
                channel = %key,
                attempt = state.reconnect_attempts,
                max = state.config.max_reconnect_attempts,
                "reconnecting"
            );
            state.generation
        };

        inner.metrics.increment_reconnect_attempts();
        // Failures are recorded and rescheduled inside `open`
        let _ = Inner::open(&inner, &key, generation).await;
    }
}

/// Owns one live transport: reads inbound frames into the dispatcher,
/// writes outbound messages and keeps the heartbeat going.
#[allow(clippy::too_many_arguments)]
async fn drive(
    transport: Transport,
    mut outbound: mpsc::UnboundedReceiver<WireMessage>,
    heartbeat_interval: Duration,
    dispatcher: Arc<Dispatcher>,
    metrics: Arc<RealtimeMetrics>,
    inner: Weak<Inner>,
    key: String,
    generation: u64,
) {
    let Transport { mut sink, mut stream } = transport;
    let heartbeat_interval = heartbeat_interval.max(Duration::from_millis(1));
    let mut heartbeat = tokio::time::interval_at(Instant::now() + heartbeat_interval, heartbeat_interval);
    heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let mut unsent = Vec::new();

    let reason = loop {
        tokio::select! {
            frame = stream.next() => match frame {
                Some(Ok(text)) => {
                    dispatcher.handle_raw_message(&text);
                }
                Some(Err(RealtimeError::Parse(e))) => {
                    metrics.increment_parse_failures();
                    tracing::warn!(channel = %key, error = %e, "dropping unreadable frame");
                }
                Some(Err(e)) => break Some(e),
                None => break Some(RealtimeError::ConnectionClosed),
            },

            message = outbound.recv() => match message {
                Some(message) => {
                    if let Err(e) = write(&mut sink, &message).await {
                        unsent.push(message);
                        break Some(e);
                    }
                    metrics.increment_sent();
                }
                // Sender dropped: disconnect() was called
                None => break None,
            },

            _ = heartbeat.tick() => {
                tracing::trace!(channel = %key, "heartbeat ping");
                if let Err(e) = write(&mut sink, &WireMessage::heartbeat_ping()).await {
                    break Some(e);
                }
            }
        }
    };

    let _ = sink.close().await;

    let Some(error) = reason else {
        tracing::debug!(channel = %key, "transport closed");
        return;
    };

    // Later sends fail over to the queue instead of landing in a dead receiver
    outbound.close();
    while let Ok(message) = outbound.try_recv() {
        unsent.push(message);
    }

    if let Some(inner) = inner.upgrade() {
        inner.handle_closed(&key, generation, error, unsent);
    }
}

async fn write(sink: &mut FrameSink, message: &WireMessage) -> RealtimeResult<()> {
    let text = match message.to_json() {
        Ok(text) => text,
        Err(e) => {
            // Not a transport failure; skip the message
            tracing::error!(message_id = %message.id, error = %e, "failed to serialize message");
            return Ok(());
        }
    };
    sink.send(text).await
}

/// [`EventPublisher`] bound to one channel of a [`ConnectionManager`]
#[derive(Debug, Clone)]
pub struct ChannelPublisher {
    inner: Weak<Inner>,
    key: String,
}

impl EventPublisher for ChannelPublisher {
    fn publish(&self, message: WireMessage) -> bool {
        match self.inner.upgrade() {
            Some(inner) => inner.send(&self.key, message),
            None => false,
        }
    }
}
