//! # Event Dispatcher
//!
//! Synchronous fan-out of domain events to topic subscribers.
//!
//! Every `emit` appends to the bounded history first, then invokes each
//! active matching handler in registration order. A handler that fails or
//! panics is logged and counted; the remaining handlers still run. No lock
//! is held while a handler executes, so handlers may subscribe, unsubscribe
//! or emit themselves. A handler removed or paused by an earlier handler of
//! the same `emit` is skipped.

use std::any::Any;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, RwLock};

use super::errors::RealtimeError;
use super::event::{RealtimeEvent, Topic, WireMessage};
use super::event_log::{EventLog, EventLogConfig};
use super::metrics::RealtimeMetrics;
use super::subscription::{
    EventHandler, HandlerResult, SubscriptionId, SubscriptionRegistry, TopicFilter,
};

/// Outbound side of `publish`: forwards an event's wire form to the server
pub trait EventPublisher: Send + Sync {
    /// Returns `true` if the message went out immediately, `false` if queued
    fn publish(&self, message: WireMessage) -> bool;
}

/// Result of dispatching an event
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DispatchResult {
    /// Number of matching subscriptions
    pub matched: usize,
    /// Handlers that completed
    pub delivered: usize,
    /// Handlers that returned an error or panicked
    pub failed: usize,
}

/// Event dispatcher that fans out events to subscribed handlers
pub struct Dispatcher {
    subscriptions: SubscriptionRegistry,
    log: EventLog,
    publisher: RwLock<Option<Arc<dyn EventPublisher>>>,
    metrics: Arc<RealtimeMetrics>,
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("subscriptions", &self.subscriptions.len())
            .field("history", &self.log.len())
            .finish()
    }
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new(EventLogConfig::default(), Arc::new(RealtimeMetrics::new()))
    }
}

impl Dispatcher {
    /// Create a new dispatcher
    pub fn new(log_config: EventLogConfig, metrics: Arc<RealtimeMetrics>) -> Self {
        Self {
            subscriptions: SubscriptionRegistry::new(),
            log: EventLog::new(log_config),
            publisher: RwLock::new(None),
            metrics,
        }
    }

    /// Register a handler for a topic, or for every event with `TopicFilter::All`
    pub fn subscribe<F>(&self, filter: impl Into<TopicFilter>, handler: F) -> SubscriptionId
    where
        F: Fn(&RealtimeEvent) + Send + Sync + 'static,
    {
        let handler: EventHandler = Arc::new(move |event: &RealtimeEvent| -> HandlerResult {
            handler(event);
            Ok(())
        });
        self.subscribe_handler(filter.into(), handler)
    }

    /// Register a handler whose errors are reported back to the dispatcher
    pub fn subscribe_fallible<F>(&self, filter: impl Into<TopicFilter>, handler: F) -> SubscriptionId
    where
        F: Fn(&RealtimeEvent) -> HandlerResult + Send + Sync + 'static,
    {
        self.subscribe_handler(filter.into(), Arc::new(handler))
    }

    fn subscribe_handler(&self, filter: TopicFilter, handler: EventHandler) -> SubscriptionId {
        let id = self.subscriptions.subscribe(filter, handler);
        tracing::debug!(subscription_id = %id, topic = %filter, "subscribed");
        id
    }

    /// Remove a subscription
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let removed = self.subscriptions.unsubscribe(id);
        if removed {
            tracing::debug!(subscription_id = %id, "unsubscribed");
        }
        removed
    }

    /// Pause or resume delivery to a subscription
    pub fn set_active(&self, id: SubscriptionId, active: bool) -> bool {
        self.subscriptions.set_active(id, active)
    }

    /// Record an event and deliver it to every matching handler
    pub fn emit(&self, event: RealtimeEvent) -> DispatchResult {
        self.log.append(event.clone());
        self.metrics.increment_dispatched();

        let subscriptions = self.subscriptions.matching(&event);
        let mut result = DispatchResult {
            matched: subscriptions.len(),
            ..Default::default()
        };

        for subscription in subscriptions {
            // An earlier handler may have removed or paused this one
            if !self.subscriptions.is_active(subscription.id) {
                result.matched -= 1;
                continue;
            }

            let handler = subscription.handler();
            let outcome = catch_unwind(AssertUnwindSafe(|| handler(&event)));

            let error = match outcome {
                Ok(Ok(())) => {
                    result.delivered += 1;
                    continue;
                }
                Ok(Err(e)) => RealtimeError::Handler(e.to_string()),
                Err(panic) => RealtimeError::Handler(panic_message(&*panic)),
            };

            result.failed += 1;
            self.metrics.increment_handler_failures();
            tracing::error!(
                subscription_id = %subscription.id,
                event = %event.event,
                error = %error,
                "event handler failed"
            );
        }

        result
    }

    /// Bridge from the connection: decode a text frame and emit it.
    ///
    /// Heartbeat pongs and malformed frames are dropped; `None` means
    /// nothing was emitted.
    pub fn handle_raw_message(&self, text: &str) -> Option<DispatchResult> {
        let message = match WireMessage::parse(text) {
            Ok(message) => message,
            Err(e) => {
                self.metrics.increment_parse_failures();
                tracing::warn!(error = %e, "dropping malformed frame");
                return None;
            }
        };

        self.handle_wire_message(message)
    }

    /// Same as [`handle_raw_message`](Self::handle_raw_message) for an already parsed envelope
    pub fn handle_wire_message(&self, message: WireMessage) -> Option<DispatchResult> {
        if message.is_heartbeat_pong() {
            tracing::trace!("heartbeat pong");
            return None;
        }

        match RealtimeEvent::from_wire(message) {
            Ok(event) => Some(self.emit(event)),
            Err(e) => {
                self.metrics.increment_parse_failures();
                tracing::warn!(error = %e, "dropping undecodable message");
                None
            }
        }
    }

    /// Attach the outbound side used by `publish`
    pub fn set_publisher(&self, publisher: Arc<dyn EventPublisher>) {
        if let Ok(mut slot) = self.publisher.write() {
            *slot = Some(publisher);
        }
    }

    /// Detach the outbound side
    pub fn clear_publisher(&self) {
        if let Ok(mut slot) = self.publisher.write() {
            *slot = None;
        }
    }

    /// Emit locally, then forward to the attached publisher if any.
    ///
    /// Returns whether the wire message was sent immediately.
    pub fn publish(&self, event: RealtimeEvent) -> bool {
        let message = event.to_wire();
        self.emit(event);

        let publisher = self.publisher.read().ok().and_then(|p| p.clone());
        match publisher {
            Some(publisher) => publisher.publish(message),
            None => false,
        }
    }

    /// Events in emission order, optionally filtered and limited to the most recent
    pub fn history(&self, topic: Option<Topic>, limit: Option<usize>) -> Vec<RealtimeEvent> {
        self.log.history(topic, limit)
    }

    /// Drop the event history
    pub fn clear_history(&self) {
        self.log.clear();
    }

    /// Get subscription count
    pub fn subscription_count(&self) -> usize {
        self.subscriptions.len()
    }

    /// Counters shared with the rest of the context
    pub fn metrics(&self) -> &Arc<RealtimeMetrics> {
        &self.metrics
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        format!("panicked: {}", s)
    } else if let Some(s) = panic.downcast_ref::<String>() {
        format!("panicked: {}", s)
    } else {
        "panicked".to_string()
    }
}
