//! # Real-Time Events
//!
//! Wire envelope and typed domain events.
//!
//! A [`WireMessage`] is what travels over the socket. A [`RealtimeEvent`] is
//! the decoded form handed to subscribers; its payload is a closed union
//! keyed by the `(type, event)` pair so handlers match exhaustively instead
//! of poking at untyped JSON.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use super::errors::{RealtimeError, RealtimeResult};
use super::presence::PresenceStatus;

/// Wire `type` used by keep-alive frames
pub const HEARTBEAT_TYPE: &str = "heartbeat";

fn new_message_id() -> String {
    Uuid::new_v4().to_string()
}

/// JSON envelope exchanged with the server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireMessage {
    /// Client-generated id, used for de-duplication only
    #[serde(default = "new_message_id")]
    pub id: String,

    /// Topic on the wire (`cart`, `user`, `heartbeat`, ...)
    #[serde(rename = "type")]
    pub kind: String,

    /// Dotted sub-kind (`cart.updated`, `ping`, ...)
    pub event: String,

    /// Payload
    #[serde(default)]
    pub data: Value,

    /// ISO 8601 timestamp
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
}

impl WireMessage {
    /// Create a message with a fresh id and the current time
    pub fn new(kind: impl Into<String>, event: impl Into<String>, data: Value) -> Self {
        Self {
            id: new_message_id(),
            kind: kind.into(),
            event: event.into(),
            data,
            timestamp: Utc::now(),
            user_id: None,
            session_id: None,
        }
    }

    /// Keep-alive frame sent on every heartbeat tick
    pub fn heartbeat_ping() -> Self {
        Self::new(
            HEARTBEAT_TYPE,
            "ping",
            serde_json::json!({ "timestamp": Utc::now().timestamp_millis() }),
        )
    }

    /// Server reply to a ping. Never surfaced as a domain event.
    pub fn is_heartbeat_pong(&self) -> bool {
        self.kind == HEARTBEAT_TYPE && self.event == "pong"
    }

    /// Attach the sender identity
    pub fn with_identity(mut self, user_id: Option<String>, session_id: Option<String>) -> Self {
        self.user_id = user_id;
        self.session_id = session_id;
        self
    }

    /// Parse a text frame
    pub fn parse(text: &str) -> RealtimeResult<Self> {
        Ok(serde_json::from_str(text)?)
    }

    /// Serialize to a text frame
    pub fn to_json(&self) -> RealtimeResult<String> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Event topic
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Topic {
    Cart,
    Product,
    Order,
    Notification,
    User,
    System,
}

impl Topic {
    /// All topics, in declaration order
    pub const ALL: [Topic; 6] = [
        Topic::Cart,
        Topic::Product,
        Topic::Order,
        Topic::Notification,
        Topic::User,
        Topic::System,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Topic::Cart => "cart",
            Topic::Product => "product",
            Topic::Order => "order",
            Topic::Notification => "notification",
            Topic::User => "user",
            Topic::System => "system",
        }
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Topic {
    type Err = RealtimeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Topic::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| RealtimeError::Parse(format!("unknown topic: {}", s)))
    }
}

/// Line item in a cart or order
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CartItem {
    pub product_id: String,
    #[serde(default = "default_quantity")]
    pub quantity: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub price: Option<f64>,
}

fn default_quantity() -> u32 {
    1
}

/// `cart.updated`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CartPayload {
    #[serde(default)]
    pub items: Vec<CartItem>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub item_count: Option<u32>,
}

/// `product.updated`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProductPayload {
    pub product_id: String,
    #[serde(default)]
    pub changes: Value,
}

/// `product.stock_changed`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StockPayload {
    pub product_id: String,
    pub stock: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous_stock: Option<i64>,
}

/// `product.price_changed`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PricePayload {
    pub product_id: String,
    pub price: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous_price: Option<f64>,
}

/// `order.created`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderPayload {
    pub order_id: String,
    #[serde(default)]
    pub items: Vec<CartItem>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total: Option<f64>,
}

/// `order.status_changed`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderStatusPayload {
    pub order_id: String,
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous_status: Option<String>,
}

/// Severity of a user-facing notification
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NotificationLevel {
    #[default]
    Info,
    Success,
    Warning,
    Error,
}

/// `notification.new`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationPayload {
    pub title: String,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub level: NotificationLevel,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub link: Option<String>,
}

/// Body of every `user.*` event. Absent fields leave the stored record alone.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresencePayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<PresenceStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub activity: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_typing: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub typing_in: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
}

/// `system.maintenance`, `system.announcement`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SystemPayload {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub starts_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ends_at: Option<DateTime<Utc>>,
}

/// Typed payload, one variant per known `(type, event)` pair
#[derive(Debug, Clone, PartialEq)]
pub enum EventPayload {
    CartUpdated(CartPayload),
    CartItemAdded(CartItem),
    CartItemRemoved(CartItem),
    CartCleared,
    ProductUpdated(ProductPayload),
    ProductStockChanged(StockPayload),
    ProductPriceChanged(PricePayload),
    OrderCreated(OrderPayload),
    OrderStatusChanged(OrderStatusPayload),
    Notification(NotificationPayload),
    UserOnline(PresencePayload),
    UserOffline(PresencePayload),
    UserActivity(PresencePayload),
    UserTyping(PresencePayload),
    SystemMaintenance(SystemPayload),
    SystemAnnouncement(SystemPayload),
    /// Any other event name within a known topic (sync replies and the like)
    Custom {
        topic: Topic,
        event: String,
        data: Value,
    },
}

fn typed<T: DeserializeOwned>(data: Value) -> RealtimeResult<T> {
    let data = if data.is_null() {
        Value::Object(Default::default())
    } else {
        data
    };
    Ok(serde_json::from_value(data)?)
}

fn untyped<T: Serialize>(payload: &T) -> Value {
    serde_json::to_value(payload).unwrap_or(Value::Null)
}

impl EventPayload {
    /// Decode wire data for a `(topic, event)` pair
    pub fn decode(topic: Topic, event: &str, data: Value) -> RealtimeResult<Self> {
        use EventPayload::*;

        let payload = match (topic, event) {
            (Topic::Cart, "cart.updated") => CartUpdated(typed(data)?),
            (Topic::Cart, "cart.item_added") => CartItemAdded(typed(data)?),
            (Topic::Cart, "cart.item_removed") => CartItemRemoved(typed(data)?),
            (Topic::Cart, "cart.cleared") => CartCleared,
            (Topic::Product, "product.updated") => ProductUpdated(typed(data)?),
            (Topic::Product, "product.stock_changed") => ProductStockChanged(typed(data)?),
            (Topic::Product, "product.price_changed") => ProductPriceChanged(typed(data)?),
            (Topic::Order, "order.created") => OrderCreated(typed(data)?),
            (Topic::Order, "order.status_changed") => OrderStatusChanged(typed(data)?),
            (Topic::Notification, "notification.new") => Notification(typed(data)?),
            (Topic::User, "user.online") => UserOnline(typed(data)?),
            (Topic::User, "user.offline") => UserOffline(typed(data)?),
            (Topic::User, "user.activity") => UserActivity(typed(data)?),
            (Topic::User, "user.typing") => UserTyping(typed(data)?),
            (Topic::System, "system.maintenance") => SystemMaintenance(typed(data)?),
            (Topic::System, "system.announcement") => SystemAnnouncement(typed(data)?),
            (topic, event) => Custom {
                topic,
                event: event.to_string(),
                data,
            },
        };

        Ok(payload)
    }

    /// Topic this payload belongs to
    pub fn topic(&self) -> Topic {
        use EventPayload::*;

        match self {
            CartUpdated(_) | CartItemAdded(_) | CartItemRemoved(_) | CartCleared => Topic::Cart,
            ProductUpdated(_) | ProductStockChanged(_) | ProductPriceChanged(_) => Topic::Product,
            OrderCreated(_) | OrderStatusChanged(_) => Topic::Order,
            Notification(_) => Topic::Notification,
            UserOnline(_) | UserOffline(_) | UserActivity(_) | UserTyping(_) => Topic::User,
            SystemMaintenance(_) | SystemAnnouncement(_) => Topic::System,
            Custom { topic, .. } => *topic,
        }
    }

    /// Dotted event name
    pub fn event_name(&self) -> &str {
        use EventPayload::*;

        match self {
            CartUpdated(_) => "cart.updated",
            CartItemAdded(_) => "cart.item_added",
            CartItemRemoved(_) => "cart.item_removed",
            CartCleared => "cart.cleared",
            ProductUpdated(_) => "product.updated",
            ProductStockChanged(_) => "product.stock_changed",
            ProductPriceChanged(_) => "product.price_changed",
            OrderCreated(_) => "order.created",
            OrderStatusChanged(_) => "order.status_changed",
            Notification(_) => "notification.new",
            UserOnline(_) => "user.online",
            UserOffline(_) => "user.offline",
            UserActivity(_) => "user.activity",
            UserTyping(_) => "user.typing",
            SystemMaintenance(_) => "system.maintenance",
            SystemAnnouncement(_) => "system.announcement",
            Custom { event, .. } => event.as_str(),
        }
    }

    /// Wire `data` value
    pub fn to_data(&self) -> Value {
        use EventPayload::*;

        match self {
            CartUpdated(p) => untyped(p),
            CartItemAdded(p) | CartItemRemoved(p) => untyped(p),
            CartCleared => Value::Null,
            ProductUpdated(p) => untyped(p),
            ProductStockChanged(p) => untyped(p),
            ProductPriceChanged(p) => untyped(p),
            OrderCreated(p) => untyped(p),
            OrderStatusChanged(p) => untyped(p),
            Notification(p) => untyped(p),
            UserOnline(p) | UserOffline(p) | UserActivity(p) | UserTyping(p) => untyped(p),
            SystemMaintenance(p) | SystemAnnouncement(p) => untyped(p),
            Custom { data, .. } => data.clone(),
        }
    }

    /// Presence body, for `user.*` events
    pub fn presence(&self) -> Option<&PresencePayload> {
        match self {
            EventPayload::UserOnline(p)
            | EventPayload::UserOffline(p)
            | EventPayload::UserActivity(p)
            | EventPayload::UserTyping(p) => Some(p),
            _ => None,
        }
    }
}

/// Decoded domain event. Never mutated after creation.
#[derive(Debug, Clone, PartialEq)]
pub struct RealtimeEvent {
    pub id: String,
    pub topic: Topic,
    pub event: String,
    pub payload: EventPayload,
    pub timestamp: DateTime<Utc>,
    pub user_id: Option<String>,
    pub session_id: Option<String>,
    pub metadata: Option<Value>,
}

impl RealtimeEvent {
    /// Create an event with a fresh id and the current time
    pub fn new(payload: EventPayload) -> Self {
        Self {
            id: new_message_id(),
            topic: payload.topic(),
            event: payload.event_name().to_string(),
            payload,
            timestamp: Utc::now(),
            user_id: None,
            session_id: None,
            metadata: None,
        }
    }

    /// Attach the producing user and session
    pub fn with_user(mut self, user_id: impl Into<String>, session_id: Option<String>) -> Self {
        self.user_id = Some(user_id.into());
        self.session_id = session_id;
        self
    }

    /// Attach free-form metadata
    pub fn with_metadata(mut self, metadata: Value) -> Self {
        self.metadata = Some(metadata);
        self
    }

    /// Decode a wire message 1:1, keeping its id and timestamp
    pub fn from_wire(message: WireMessage) -> RealtimeResult<Self> {
        let topic: Topic = message.kind.parse()?;
        let payload = EventPayload::decode(topic, &message.event, message.data)?;

        Ok(Self {
            id: message.id,
            topic,
            event: message.event,
            payload,
            timestamp: message.timestamp,
            user_id: message.user_id,
            session_id: message.session_id,
            metadata: None,
        })
    }

    /// Encode for the socket
    pub fn to_wire(&self) -> WireMessage {
        WireMessage {
            id: self.id.clone(),
            kind: self.topic.to_string(),
            event: self.event.clone(),
            data: self.payload.to_data(),
            timestamp: self.timestamp,
            user_id: self.user_id.clone(),
            session_id: self.session_id.clone(),
        }
    }
}
