//! # Storefront Real-Time Module
//!
//! Client side of the storefront realtime channel: live cart, product,
//! order, notification and presence events over a WebSocket.
//!
//! ## Architecture
//!
//! - **Connection**: one transport per channel key, heartbeat, bounded
//!   outbound queue, counted reconnects
//! - **Dispatcher**: typed event fan-out with a bounded history
//! - **Presence**: per-user status and typing indicators
//! - **Bindings**: mount-scoped adapters that mirror state into `watch` channels
//! - **Context**: the single registry object tying the above together
//!
//! Data flows from the socket into the dispatcher, out to subscribers
//! (presence tracker, bindings, store sync), and presence changes flow back
//! through the dispatcher to the socket.

pub mod binding;
pub mod connection;
pub mod context;
pub mod dispatcher;
pub mod errors;
pub mod event;
pub mod event_log;
pub mod metrics;
pub mod presence;
pub mod subscription;
pub mod transport;

pub use binding::{
    EventFeed, FeedOptions, FeedState, PresenceFeed, PresenceIdentity, PresenceState,
    StoreAction, SyncBinding,
};
pub use connection::{ChannelStatus, ConnectionConfig, ConnectionManager, ConnectionStatus};
pub use context::{ContextOptions, RealtimeContext};
pub use dispatcher::{DispatchResult, Dispatcher, EventPublisher};
pub use errors::{RealtimeError, RealtimeResult};
pub use event::{EventPayload, RealtimeEvent, Topic, WireMessage};
pub use event_log::{EventLog, EventLogConfig};
pub use metrics::{MetricsSnapshot, RealtimeMetrics};
pub use presence::{
    ActivitySignal, InputKind, PresenceConfig, PresenceStatistics, PresenceStatus,
    PresenceTracker, UserPresence,
};
pub use subscription::{HandlerResult, Subscription, SubscriptionId, TopicFilter};
pub use transport::{Connector, Transport, WebSocketConnector};
