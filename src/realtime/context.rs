//! # Realtime Context
//!
//! The registry object built once at startup: one connection manager, one
//! dispatcher, one presence tracker and the counters they share. Bindings
//! take it by reference; tests build as many isolated contexts as they need.

use std::sync::Arc;

use crate::config::ClientConfig;

use super::connection::ConnectionManager;
use super::dispatcher::Dispatcher;
use super::event_log::EventLogConfig;
use super::metrics::{MetricsSnapshot, RealtimeMetrics};
use super::presence::{PresenceConfig, PresenceTracker};
use super::transport::{Connector, WebSocketConnector};

/// Tunables for a [`RealtimeContext`]
#[derive(Debug, Clone, Default)]
pub struct ContextOptions {
    pub event_log: EventLogConfig,
    pub presence: PresenceConfig,
}

/// Shared realtime services. Cheap to clone.
#[derive(Debug, Clone)]
pub struct RealtimeContext {
    connections: ConnectionManager,
    dispatcher: Arc<Dispatcher>,
    presence: PresenceTracker,
    metrics: Arc<RealtimeMetrics>,
}

impl RealtimeContext {
    /// Create a context over `connector`, defaulting channels to `default_url`
    pub fn new(connector: Arc<dyn Connector>, default_url: impl Into<String>) -> Self {
        Self::with_options(connector, default_url, ContextOptions::default())
    }

    pub fn with_options(
        connector: Arc<dyn Connector>,
        default_url: impl Into<String>,
        options: ContextOptions,
    ) -> Self {
        let metrics = Arc::new(RealtimeMetrics::new());
        let dispatcher = Arc::new(Dispatcher::new(options.event_log, Arc::clone(&metrics)));
        let connections = ConnectionManager::new(connector, Arc::clone(&dispatcher), default_url);
        let presence = PresenceTracker::new(Arc::clone(&dispatcher), options.presence);

        Self {
            connections,
            dispatcher,
            presence,
            metrics,
        }
    }

    /// WebSocket-backed context for the configured endpoint
    pub fn from_config(config: &ClientConfig) -> Self {
        Self::new(Arc::new(WebSocketConnector), config.ws_url.clone())
    }

    /// Route `Dispatcher::publish` (and so presence updates) through `channel`
    pub fn bind_publisher(&self, channel: &str) {
        self.dispatcher
            .set_publisher(Arc::new(self.connections.publisher(channel)));
        tracing::debug!(channel, "publisher bound");
    }

    pub fn connections(&self) -> &ConnectionManager {
        &self.connections
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    pub fn presence(&self) -> &PresenceTracker {
        &self.presence
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    /// Stop presence timers, detach the publisher and close every channel
    pub fn shutdown(&self) {
        self.presence.shutdown();
        self.dispatcher.clear_publisher();
        self.connections.disconnect_all();
        tracing::info!("realtime context shut down");
    }
}
