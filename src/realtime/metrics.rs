//! Counters for the realtime layer
//!
//! - Counters only, monotonic
//! - Reset only when the owning context is rebuilt
//! - Thread-safe but lock-free

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Operational counters shared by the connection manager and dispatcher
///
/// Uses Relaxed ordering; eventual consistency is fine for counters.
#[derive(Debug, Default)]
pub struct RealtimeMetrics {
    /// Frames written to an open transport
    messages_sent: AtomicU64,
    /// Messages parked in an outbound queue
    messages_queued: AtomicU64,
    /// Queued messages evicted by overflow or discarded on disconnect
    messages_dropped: AtomicU64,
    /// Events handed to the dispatcher
    events_dispatched: AtomicU64,
    /// Handlers that returned an error or panicked
    handler_failures: AtomicU64,
    /// Inbound frames that could not be decoded
    parse_failures: AtomicU64,
    /// Reconnect attempts started
    reconnect_attempts: AtomicU64,
}

impl RealtimeMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn increment_sent(&self) {
        self.messages_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_queued(&self) {
        self.messages_queued.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_dropped(&self, count: u64) {
        self.messages_dropped.fetch_add(count, Ordering::Relaxed);
    }

    pub fn increment_dispatched(&self) {
        self.events_dispatched.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_handler_failures(&self) {
        self.handler_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_parse_failures(&self) {
        self.parse_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_reconnect_attempts(&self) {
        self.reconnect_attempts.fetch_add(1, Ordering::Relaxed);
    }

    /// Get all metrics as a snapshot
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            messages_sent: self.messages_sent.load(Ordering::Relaxed),
            messages_queued: self.messages_queued.load(Ordering::Relaxed),
            messages_dropped: self.messages_dropped.load(Ordering::Relaxed),
            events_dispatched: self.events_dispatched.load(Ordering::Relaxed),
            handler_failures: self.handler_failures.load(Ordering::Relaxed),
            parse_failures: self.parse_failures.load(Ordering::Relaxed),
            reconnect_attempts: self.reconnect_attempts.load(Ordering::Relaxed),
        }
    }
}

/// A point-in-time snapshot of all counters
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub messages_sent: u64,
    pub messages_queued: u64,
    pub messages_dropped: u64,
    pub events_dispatched: u64,
    pub handler_failures: u64,
    pub parse_failures: u64,
    pub reconnect_attempts: u64,
}
