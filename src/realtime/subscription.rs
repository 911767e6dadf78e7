//! # Subscription Management
//!
//! Registry of topic subscriptions and their handlers.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};
use uuid::Uuid;

use super::errors::RealtimeError;
use super::event::{RealtimeEvent, Topic};

/// Error returned by a fallible handler
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// Outcome of a single handler invocation
pub type HandlerResult = Result<(), HandlerError>;

/// Shared event handler
pub type EventHandler = Arc<dyn Fn(&RealtimeEvent) -> HandlerResult + Send + Sync>;

/// Which events a subscription receives
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TopicFilter {
    /// Every event (`*`)
    All,
    /// Events of a single topic
    Topic(Topic),
}

impl TopicFilter {
    /// Check if an event passes this filter
    pub fn matches(&self, event: &RealtimeEvent) -> bool {
        match self {
            TopicFilter::All => true,
            TopicFilter::Topic(topic) => event.topic == *topic,
        }
    }
}

impl From<Topic> for TopicFilter {
    fn from(topic: Topic) -> Self {
        TopicFilter::Topic(topic)
    }
}

impl fmt::Display for TopicFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TopicFilter::All => f.write_str("*"),
            TopicFilter::Topic(topic) => write!(f, "{}", topic),
        }
    }
}

impl FromStr for TopicFilter {
    type Err = RealtimeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s == "*" {
            Ok(TopicFilter::All)
        } else {
            s.parse().map(TopicFilter::Topic)
        }
    }
}

/// Unique subscription ID
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(Uuid);

impl SubscriptionId {
    fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A registered handler
#[derive(Clone)]
pub struct Subscription {
    pub id: SubscriptionId,
    pub filter: TopicFilter,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    handler: EventHandler,
    /// Registration order, used to invoke handlers in the order they subscribed
    seq: u64,
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("filter", &self.filter)
            .field("is_active", &self.is_active)
            .field("created_at", &self.created_at)
            .finish()
    }
}

impl Subscription {
    /// Handler to invoke
    pub fn handler(&self) -> &EventHandler {
        &self.handler
    }
}

/// Registry of active subscriptions
#[derive(Debug, Default)]
pub struct SubscriptionRegistry {
    /// Subscriptions by filter
    by_filter: RwLock<HashMap<TopicFilter, Vec<Subscription>>>,

    /// Filter of each subscription ID
    by_id: RwLock<HashMap<SubscriptionId, TopicFilter>>,

    next_seq: AtomicU64,
}

impl SubscriptionRegistry {
    /// Create a new registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a subscription
    pub fn subscribe(&self, filter: TopicFilter, handler: EventHandler) -> SubscriptionId {
        let subscription = Subscription {
            id: SubscriptionId::new(),
            filter,
            is_active: true,
            created_at: Utc::now(),
            handler,
            seq: self.next_seq.fetch_add(1, Ordering::SeqCst),
        };
        let id = subscription.id;

        if let Ok(mut by_filter) = self.by_filter.write() {
            by_filter.entry(filter).or_default().push(subscription);
        }

        if let Ok(mut by_id) = self.by_id.write() {
            by_id.insert(id, filter);
        }

        id
    }

    /// Remove a subscription. Returns `false` if it was not registered.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let filter = match self.by_id.write() {
            Ok(mut by_id) => by_id.remove(&id),
            Err(_) => None,
        };

        let Some(filter) = filter else {
            return false;
        };

        if let Ok(mut by_filter) = self.by_filter.write() {
            if let Some(subs) = by_filter.get_mut(&filter) {
                subs.retain(|s| s.id != id);
                if subs.is_empty() {
                    by_filter.remove(&filter);
                }
            }
        }

        true
    }

    /// Pause or resume a subscription without removing it
    pub fn set_active(&self, id: SubscriptionId, active: bool) -> bool {
        let Some(filter) = self.by_id.read().ok().and_then(|by_id| by_id.get(&id).copied()) else {
            return false;
        };

        if let Ok(mut by_filter) = self.by_filter.write() {
            if let Some(sub) = by_filter
                .get_mut(&filter)
                .and_then(|subs| subs.iter_mut().find(|s| s.id == id))
            {
                sub.is_active = active;
                return true;
            }
        }

        false
    }

    /// Active subscriptions matching an event, in registration order
    pub fn matching(&self, event: &RealtimeEvent) -> Vec<Subscription> {
        let Ok(by_filter) = self.by_filter.read() else {
            return Vec::new();
        };

        let mut result: Vec<Subscription> = [TopicFilter::Topic(event.topic), TopicFilter::All]
            .iter()
            .filter_map(|f| by_filter.get(f))
            .flatten()
            .filter(|s| s.is_active && s.filter.matches(event))
            .cloned()
            .collect();

        result.sort_by_key(|s| s.seq);
        result
    }

    /// Whether `id` is still registered and not paused
    pub fn is_active(&self, id: SubscriptionId) -> bool {
        self.get(id).map(|s| s.is_active).unwrap_or(false)
    }

    /// Look up a subscription
    pub fn get(&self, id: SubscriptionId) -> Option<Subscription> {
        let filter = self.by_id.read().ok()?.get(&id).copied()?;
        let by_filter = self.by_filter.read().ok()?;
        by_filter.get(&filter)?.iter().find(|s| s.id == id).cloned()
    }

    /// Get subscription count
    pub fn len(&self) -> usize {
        self.by_id.read().map(|m| m.len()).unwrap_or(0)
    }

    /// Check if empty
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
