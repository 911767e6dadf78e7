//! # Bindings
//!
//! Adapters that turn dispatcher callbacks into renderable state for a host
//! UI. Each binding is a mount-scoped resource:
//!
//! - mount: subscribe (and optionally connect)
//! - while mounted: mirror events into a `watch` channel
//! - unmount or drop: unsubscribe everything, and disconnect only if this
//!   binding opened the connection
//!
//! Timers live in the connection manager and presence tracker, never here.

use std::sync::Arc;

use serde_json::{json, Value};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use super::connection::{ChannelStatus, ConnectionConfig, ConnectionManager};
use super::context::RealtimeContext;
use super::dispatcher::Dispatcher;
use super::event::{
    CartItem, CartPayload, EventPayload, OrderPayload, OrderStatusPayload, PricePayload,
    ProductPayload, RealtimeEvent, StockPayload, Topic, WireMessage,
};
use super::presence::{PresenceStatistics, PresenceTracker, UserPresence};
use super::subscription::{SubscriptionId, TopicFilter};

/// Events kept by a feed unless configured otherwise
pub const DEFAULT_FEED_CAPACITY: usize = 100;

// ==================
// Event feed
// ==================

/// Renderable state of an [`EventFeed`]
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FeedState {
    /// Most recent events, oldest first
    pub events: Vec<RealtimeEvent>,
    pub last_event: Option<RealtimeEvent>,
    pub is_connected: bool,
    /// Banner text, e.g. the last connect failure
    pub error: Option<String>,
}

impl FeedState {
    fn record(&mut self, event: &RealtimeEvent, capacity: usize) {
        self.events.push(event.clone());
        if self.events.len() > capacity {
            let excess = self.events.len() - capacity;
            self.events.drain(..excess);
        }
        self.last_event = Some(event.clone());
    }

    fn set_connected(&mut self, connected: bool) {
        self.is_connected = connected;
        if connected {
            self.error = None;
        }
    }

    fn apply_status(&mut self, status: &ChannelStatus) {
        self.set_connected(status.is_connected());
        if let (false, Some(error)) = (self.is_connected, &status.last_error) {
            self.error = Some(error.to_string());
        }
    }
}

/// Mount options for an [`EventFeed`]
#[derive(Debug, Clone)]
pub struct FeedOptions {
    pub channel: String,
    pub topics: Vec<TopicFilter>,
    pub auto_connect: bool,
    pub connection: ConnectionConfig,
    pub capacity: usize,
}

impl FeedOptions {
    /// All topics on `channel`, connecting on mount
    pub fn new(channel: impl Into<String>) -> Self {
        Self {
            channel: channel.into(),
            topics: vec![TopicFilter::All],
            auto_connect: true,
            connection: ConnectionConfig::default(),
            capacity: DEFAULT_FEED_CAPACITY,
        }
    }

    pub fn with_topics(mut self, topics: impl IntoIterator<Item = TopicFilter>) -> Self {
        self.topics = topics.into_iter().collect();
        self
    }

    pub fn with_auto_connect(mut self, auto_connect: bool) -> Self {
        self.auto_connect = auto_connect;
        self
    }

    pub fn with_connection(mut self, connection: ConnectionConfig) -> Self {
        self.connection = connection;
        self
    }

    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }
}

/// Generic event feed for one channel
#[derive(Debug)]
pub struct EventFeed {
    connections: ConnectionManager,
    dispatcher: Arc<Dispatcher>,
    channel: String,
    subscriptions: Vec<SubscriptionId>,
    owns_connection: bool,
    state: Arc<watch::Sender<FeedState>>,
    /// Copies channel status changes into `state`
    status_forwarder: Option<JoinHandle<()>>,
}

impl EventFeed {
    /// Subscribe to the requested topics, then connect if asked to and not
    /// already connected. A failed connect is surfaced in `FeedState::error`;
    /// the connection manager keeps retrying on its own, and every later
    /// drop, retry and reopen is mirrored into the state as it happens.
    pub async fn mount(context: &RealtimeContext, options: FeedOptions) -> Self {
        let connections = context.connections().clone();
        let dispatcher = Arc::clone(context.dispatcher());
        let (state, _) = watch::channel(FeedState::default());
        let state = Arc::new(state);

        let mut filters: Vec<TopicFilter> = Vec::new();
        for filter in options.topics {
            if !filters.contains(&filter) {
                filters.push(filter);
            }
        }

        let subscriptions = filters
            .into_iter()
            .map(|filter| {
                let state = Arc::clone(&state);
                let connections = connections.downgrade();
                let channel = options.channel.clone();
                let capacity = options.capacity;

                dispatcher.subscribe(filter, move |event| {
                    let connected = connections.upgrade().map(|c| c.is_connected(&channel));
                    state.send_modify(|s| {
                        s.record(event, capacity);
                        if let Some(connected) = connected {
                            s.set_connected(connected);
                        }
                    });
                })
            })
            .collect();

        let status_forwarder = tokio::spawn(forward_status(
            connections.watch_status(&options.channel),
            Arc::clone(&state),
        ));

        let mut owns_connection = false;
        if options.auto_connect && !connections.is_connected(&options.channel) {
            owns_connection = true;
            if let Err(e) = connections
                .connect(&options.channel, options.connection)
                .await
            {
                tracing::warn!(channel = %options.channel, error = %e, "feed auto-connect failed");
                state.send_modify(|s| s.error = Some(e.to_string()));
            }
        }

        let feed = Self {
            connections,
            dispatcher,
            channel: options.channel,
            subscriptions,
            owns_connection,
            state,
            status_forwarder: Some(status_forwarder),
        };
        feed.refresh_connection();
        feed
    }

    /// Receiver that observes every state change
    pub fn watch(&self) -> watch::Receiver<FeedState> {
        self.state.subscribe()
    }

    /// Current state
    pub fn snapshot(&self) -> FeedState {
        self.state.borrow().clone()
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// Whether unmounting will close the channel
    pub fn owns_connection(&self) -> bool {
        self.owns_connection
    }

    /// Stop receiving events without unsubscribing
    pub fn pause(&self) {
        for id in &self.subscriptions {
            self.dispatcher.set_active(*id, false);
        }
    }

    pub fn resume(&self) {
        for id in &self.subscriptions {
            self.dispatcher.set_active(*id, true);
        }
    }

    /// Forget the events seen so far
    pub fn clear(&self) {
        self.state.send_modify(|s| {
            s.events.clear();
            s.last_event = None;
        });
    }

    /// Re-read the channel status into the state
    pub fn refresh_connection(&self) {
        let connected = self.connections.is_connected(&self.channel);
        let error = self
            .connections
            .last_error(&self.channel)
            .map(|e| e.to_string());

        self.state.send_modify(|s| {
            s.set_connected(connected);
            if !connected && error.is_some() {
                s.error = error;
            }
        });
    }

    /// Send on this feed's channel. `false` means the message was queued.
    pub fn send(&self, message: WireMessage) -> bool {
        self.connections.send(&self.channel, message)
    }

    /// Tear down explicitly; dropping the feed does the same
    pub fn unmount(self) {}

    fn teardown(&mut self) {
        if let Some(forwarder) = self.status_forwarder.take() {
            forwarder.abort();
        }
        for id in self.subscriptions.drain(..) {
            self.dispatcher.unsubscribe(id);
        }
        if self.owns_connection {
            self.owns_connection = false;
            self.connections.disconnect(&self.channel);
        }
        tracing::debug!(channel = %self.channel, "event feed unmounted");
    }
}

impl Drop for EventFeed {
    fn drop(&mut self) {
        self.teardown();
    }
}

async fn forward_status(
    mut status: watch::Receiver<ChannelStatus>,
    state: Arc<watch::Sender<FeedState>>,
) {
    // Ends when the connection manager goes away
    while status.changed().await.is_ok() {
        let update = status.borrow_and_update().clone();
        state.send_modify(|s| s.apply_status(&update));
    }
}

// ==================
// Presence feed
// ==================

/// Renderable presence state
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PresenceState {
    pub statistics: PresenceStatistics,
    pub online_users: Vec<UserPresence>,
    pub typing_users: Vec<UserPresence>,
    pub local_user: Option<UserPresence>,
}

impl PresenceState {
    fn capture(tracker: &PresenceTracker) -> Self {
        Self {
            statistics: tracker.statistics(),
            online_users: tracker.online_users(),
            typing_users: tracker.typing_users(),
            local_user: tracker.local_user(),
        }
    }
}

/// Local identity announced by a [`PresenceFeed`]
#[derive(Debug, Clone)]
pub struct PresenceIdentity {
    pub user_id: String,
    pub session_id: String,
    pub metadata: Option<Value>,
}

/// Mirrors the presence tracker after every `user.*` event
#[derive(Debug)]
pub struct PresenceFeed {
    presence: PresenceTracker,
    dispatcher: Arc<Dispatcher>,
    subscription: Option<SubscriptionId>,
    announced: bool,
    state: Arc<watch::Sender<PresenceState>>,
}

impl PresenceFeed {
    /// Subscribe, then announce `identity` as online if given.
    ///
    /// Must run inside a tokio runtime when `identity` is set.
    pub fn mount(context: &RealtimeContext, identity: Option<PresenceIdentity>) -> Self {
        let presence = context.presence().clone();
        let dispatcher = Arc::clone(context.dispatcher());
        let (state, _) = watch::channel(PresenceState::capture(&presence));
        let state = Arc::new(state);

        // Registered after the tracker's own subscription, so it sees applied state
        let subscription = {
            let state = Arc::clone(&state);
            let tracker = presence.downgrade();
            dispatcher.subscribe(Topic::User, move |_| {
                if let Some(tracker) = tracker.upgrade() {
                    state.send_replace(PresenceState::capture(&tracker));
                }
            })
        };

        let announced = identity.is_some();
        if let Some(identity) = identity {
            presence.initialize(&identity.user_id, &identity.session_id, identity.metadata);
        }

        Self {
            presence,
            dispatcher,
            subscription: Some(subscription),
            announced,
            state,
        }
    }

    pub fn watch(&self) -> watch::Receiver<PresenceState> {
        self.state.subscribe()
    }

    pub fn snapshot(&self) -> PresenceState {
        self.state.borrow().clone()
    }

    pub fn tracker(&self) -> &PresenceTracker {
        &self.presence
    }

    pub fn unmount(self) {}
}

impl Drop for PresenceFeed {
    fn drop(&mut self) {
        if let Some(id) = self.subscription.take() {
            self.dispatcher.unsubscribe(id);
        }
        if self.announced {
            self.announced = false;
            if let Err(e) = self.presence.set_offline() {
                tracing::debug!(error = %e, "presence feed unmounted before tracking");
            }
        }
    }
}

// ==================
// Store sync
// ==================

/// Store mutation derived from a cart, product or order event
#[derive(Debug, Clone, PartialEq)]
pub enum StoreAction {
    CartUpdated(CartPayload),
    CartItemAdded(CartItem),
    CartItemRemoved(CartItem),
    CartCleared,
    ProductUpdated(ProductPayload),
    StockChanged(StockPayload),
    PriceChanged(PricePayload),
    OrderCreated(OrderPayload),
    OrderStatusChanged(OrderStatusPayload),
    /// Server reply to a `<resource>.sync` request
    Synced { resource: Topic, data: Value },
}

impl StoreAction {
    pub fn from_event(event: &RealtimeEvent) -> Option<Self> {
        let action = match &event.payload {
            EventPayload::CartUpdated(p) => StoreAction::CartUpdated(p.clone()),
            EventPayload::CartItemAdded(item) => StoreAction::CartItemAdded(item.clone()),
            EventPayload::CartItemRemoved(item) => StoreAction::CartItemRemoved(item.clone()),
            EventPayload::CartCleared => StoreAction::CartCleared,
            EventPayload::ProductUpdated(p) => StoreAction::ProductUpdated(p.clone()),
            EventPayload::ProductStockChanged(p) => StoreAction::StockChanged(p.clone()),
            EventPayload::ProductPriceChanged(p) => StoreAction::PriceChanged(p.clone()),
            EventPayload::OrderCreated(p) => StoreAction::OrderCreated(p.clone()),
            EventPayload::OrderStatusChanged(p) => StoreAction::OrderStatusChanged(p.clone()),
            EventPayload::Custom { topic, event, data } if event == &sync_event(*topic) => {
                StoreAction::Synced {
                    resource: *topic,
                    data: data.clone(),
                }
            }
            _ => return None,
        };
        Some(action)
    }
}

fn sync_event(resource: Topic) -> String {
    format!("{}.sync", resource)
}

/// Topics whose events feed the store
pub const SYNC_TOPICS: [Topic; 3] = [Topic::Cart, Topic::Product, Topic::Order];

/// Forwards cart/product/order events into a host store
#[derive(Debug)]
pub struct SyncBinding {
    connections: ConnectionManager,
    dispatcher: Arc<Dispatcher>,
    channel: String,
    subscriptions: Vec<SubscriptionId>,
}

impl SyncBinding {
    /// Subscribe `dispatch` to every store-relevant event
    pub fn mount<F>(context: &RealtimeContext, channel: impl Into<String>, dispatch: F) -> Self
    where
        F: Fn(StoreAction) + Send + Sync + 'static,
    {
        let dispatch = Arc::new(dispatch);
        let dispatcher = Arc::clone(context.dispatcher());

        let subscriptions = SYNC_TOPICS
            .into_iter()
            .map(|topic| {
                let dispatch = Arc::clone(&dispatch);
                dispatcher.subscribe(topic, move |event| {
                    if let Some(action) = StoreAction::from_event(event) {
                        dispatch(action);
                    }
                })
            })
            .collect();

        Self {
            connections: context.connections().clone(),
            dispatcher,
            channel: channel.into(),
            subscriptions,
        }
    }

    /// Ask the server for a fresh copy of `resource`. `false` means queued.
    pub fn request_sync(&self, resource: Topic) -> bool {
        let message = WireMessage::new(resource.as_str(), sync_event(resource), json!({}));
        tracing::debug!(channel = %self.channel, topic = %resource, "sync requested");
        self.connections.send(&self.channel, message)
    }

    pub fn unmount(self) {}
}

impl Drop for SyncBinding {
    fn drop(&mut self) {
        for id in self.subscriptions.drain(..) {
            self.dispatcher.unsubscribe(id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::realtime::errors::RealtimeResult;
    use crate::realtime::event::PresencePayload;
    use crate::realtime::presence::PresenceStatus;
    use crate::realtime::transport::{Connector, Transport};
    use async_trait::async_trait;
    use std::sync::Mutex;

    /// Connector that never gets a chance to run in these tests
    struct Unreachable;

    #[async_trait]
    impl Connector for Unreachable {
        async fn connect(&self, _url: &str, _protocols: &[String]) -> RealtimeResult<Transport> {
            Err(crate::realtime::errors::RealtimeError::Transport(
                "unreachable".into(),
            ))
        }
    }

    fn context() -> RealtimeContext {
        RealtimeContext::new(Arc::new(Unreachable), "ws://test")
    }

    #[tokio::test]
    async fn test_feed_keeps_last_events() {
        let ctx = context();
        let feed = EventFeed::mount(
            &ctx,
            FeedOptions::new("main")
                .with_auto_connect(false)
                .with_capacity(3),
        )
        .await;

        for _ in 0..5 {
            ctx.dispatcher().emit(RealtimeEvent::new(EventPayload::CartCleared));
        }

        let state = feed.snapshot();
        assert_eq!(state.events.len(), 3);
        assert_eq!(state.last_event.as_ref(), state.events.last());
        assert!(!state.is_connected);
        assert!(!feed.owns_connection());
    }

    #[tokio::test]
    async fn test_feed_topic_filter_and_pause() {
        let ctx = context();
        let feed = EventFeed::mount(
            &ctx,
            FeedOptions::new("main")
                .with_auto_connect(false)
                .with_topics([TopicFilter::Topic(Topic::Order), TopicFilter::Topic(Topic::Order)]),
        )
        .await;
        assert_eq!(ctx.dispatcher().subscription_count(), 1 + 1);

        ctx.dispatcher().emit(RealtimeEvent::new(EventPayload::CartCleared));
        assert!(feed.snapshot().events.is_empty());

        feed.pause();
        ctx.dispatcher().emit(RealtimeEvent::new(EventPayload::OrderCreated(OrderPayload {
            order_id: "o-1".into(),
            items: vec![],
            total: None,
        })));
        assert!(feed.snapshot().events.is_empty());

        feed.resume();
        ctx.dispatcher().emit(RealtimeEvent::new(EventPayload::OrderCreated(OrderPayload {
            order_id: "o-2".into(),
            items: vec![],
            total: None,
        })));
        assert_eq!(feed.snapshot().events.len(), 1);
    }

    #[tokio::test]
    async fn test_feed_unmount_unsubscribes() {
        let ctx = context();
        // The presence tracker holds one subscription
        let baseline = ctx.dispatcher().subscription_count();

        let feed = EventFeed::mount(&ctx, FeedOptions::new("main").with_auto_connect(false)).await;
        assert_eq!(ctx.dispatcher().subscription_count(), baseline + 1);

        feed.unmount();
        assert_eq!(ctx.dispatcher().subscription_count(), baseline);
    }

    #[tokio::test]
    async fn test_presence_feed_mirrors_tracker() {
        let ctx = context();
        let feed = PresenceFeed::mount(
            &ctx,
            Some(PresenceIdentity {
                user_id: "me".into(),
                session_id: "s1".into(),
                metadata: None,
            }),
        );

        let state = feed.snapshot();
        assert_eq!(state.statistics.online, 1);
        assert_eq!(state.local_user.unwrap().user_id, "me");

        ctx.dispatcher().emit(
            RealtimeEvent::new(EventPayload::UserOnline(PresencePayload::default()))
                .with_user("friend", Some("s2".into())),
        );
        let online: Vec<String> = feed
            .snapshot()
            .online_users
            .into_iter()
            .map(|p| p.user_id)
            .collect();
        assert_eq!(online, vec!["friend".to_string(), "me".to_string()]);

        let tracker = feed.tracker().clone();
        feed.unmount();
        assert_eq!(
            tracker.user_presence("me").unwrap().status,
            PresenceStatus::Offline
        );
    }

    #[tokio::test]
    async fn test_sync_binding_dispatches_store_actions() {
        let ctx = context();
        let actions: Arc<Mutex<Vec<StoreAction>>> = Arc::new(Mutex::new(Vec::new()));

        let a = Arc::clone(&actions);
        let binding = SyncBinding::mount(&ctx, "main", move |action| {
            a.lock().unwrap().push(action);
        });

        ctx.dispatcher().emit(RealtimeEvent::new(EventPayload::CartCleared));
        ctx.dispatcher().emit(RealtimeEvent::new(EventPayload::UserOnline(
            PresencePayload::default(),
        )));
        ctx.dispatcher()
            .handle_raw_message(r#"{"type":"cart","event":"cart.sync","data":{"items":[]}}"#);

        {
            let actions = actions.lock().unwrap();
            assert_eq!(actions.len(), 2);
            assert_eq!(actions[0], StoreAction::CartCleared);
            assert!(matches!(
                actions[1],
                StoreAction::Synced {
                    resource: Topic::Cart,
                    ..
                }
            ));
        }

        // Not connected: the request waits in the queue
        assert!(!binding.request_sync(Topic::Order));
        assert_eq!(ctx.connections().queued_len("main"), 1);

        binding.unmount();
        ctx.dispatcher().emit(RealtimeEvent::new(EventPayload::CartCleared));
        assert_eq!(actions.lock().unwrap().len(), 2);
    }
}
