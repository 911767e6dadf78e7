//! # Event Log
//!
//! Bounded history of dispatched events.
//!
//! Events are kept in the order they were emitted. When the log is full the
//! oldest event is evicted first.

use std::collections::VecDeque;
use std::sync::RwLock;

use super::event::{RealtimeEvent, Topic};

/// Configuration for the event log
#[derive(Debug, Clone)]
pub struct EventLogConfig {
    /// Maximum number of events to keep in memory
    pub max_events: usize,
}

impl Default for EventLogConfig {
    fn default() -> Self {
        Self { max_events: 1000 }
    }
}

/// Ring buffer of recent events
#[derive(Debug)]
pub struct EventLog {
    config: EventLogConfig,
    events: RwLock<VecDeque<RealtimeEvent>>,
}

impl Default for EventLog {
    fn default() -> Self {
        Self::new(EventLogConfig::default())
    }
}

impl EventLog {
    /// Create a new event log
    pub fn new(config: EventLogConfig) -> Self {
        let capacity = config.max_events;
        Self {
            config,
            events: RwLock::new(VecDeque::with_capacity(capacity)),
        }
    }

    /// Append an event, evicting the oldest ones past capacity
    pub fn append(&self, event: RealtimeEvent) {
        if let Ok(mut events) = self.events.write() {
            events.push_back(event);

            while events.len() > self.config.max_events {
                events.pop_front();
            }
        }
    }

    /// Events in emission order, optionally restricted to a topic.
    ///
    /// With a `limit`, only the most recent `limit` matching events are
    /// returned, still oldest first.
    pub fn history(&self, topic: Option<Topic>, limit: Option<usize>) -> Vec<RealtimeEvent> {
        let Ok(events) = self.events.read() else {
            return Vec::new();
        };

        let selected: Vec<RealtimeEvent> = events
            .iter()
            .filter(|e| topic.map_or(true, |t| e.topic == t))
            .cloned()
            .collect();

        match limit {
            Some(limit) if limit < selected.len() => selected[selected.len() - limit..].to_vec(),
            _ => selected,
        }
    }

    /// Drop all events
    pub fn clear(&self) {
        if let Ok(mut events) = self.events.write() {
            events.clear();
        }
    }

    /// Get count of events in buffer
    pub fn len(&self) -> usize {
        self.events.read().map(|e| e.len()).unwrap_or(0)
    }

    /// Check if buffer is empty
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
