//! # Presence Tracking
//!
//! Per-user online/away/busy/offline state and typing indicators.
//!
//! The tracker is both a consumer and a producer of `user.*` events: remote
//! events are upserted into the presence map (last write wins, by arrival
//! order), and changes to the local user are published back through the
//! dispatcher. Any status may follow any other.
//!
//! The tracker owns its timers (typing auto-clear, inactivity, `last_seen`
//! refresh); they are aborted on re-initialization, `shutdown()` or drop.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError, RwLock, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use super::dispatcher::Dispatcher;
use super::errors::{RealtimeError, RealtimeResult};
use super::event::{EventPayload, PresencePayload, RealtimeEvent, Topic};
use super::subscription::SubscriptionId;

/// Presence status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PresenceStatus {
    Online,
    Offline,
    Away,
    Busy,
}

impl fmt::Display for PresenceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PresenceStatus::Online => "online",
            PresenceStatus::Offline => "offline",
            PresenceStatus::Away => "away",
            PresenceStatus::Busy => "busy",
        };
        f.write_str(s)
    }
}

/// Current presence of one user. Exactly one record per user id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserPresence {
    pub user_id: String,
    /// Session that produced the latest update
    pub session_id: Option<String>,
    pub status: PresenceStatus,
    pub last_seen: DateTime<Utc>,
    pub activity: Option<String>,
    pub location: Option<String>,
    pub device: Option<String>,
    pub is_typing: bool,
    pub typing_in: Option<String>,
    pub metadata: Option<Value>,
}

impl UserPresence {
    fn new(user_id: String, session_id: Option<String>, status: PresenceStatus) -> Self {
        Self {
            user_id,
            session_id,
            status,
            last_seen: Utc::now(),
            activity: None,
            location: None,
            device: None,
            is_typing: false,
            typing_in: None,
            metadata: None,
        }
    }

    fn to_payload(&self) -> PresencePayload {
        PresencePayload {
            status: Some(self.status),
            activity: self.activity.clone(),
            location: self.location.clone(),
            device: self.device.clone(),
            is_typing: Some(self.is_typing),
            typing_in: self.typing_in.clone(),
            metadata: self.metadata.clone(),
        }
    }

    /// Apply the fields present in a payload
    fn apply(&mut self, payload: &PresencePayload) {
        if let Some(status) = payload.status {
            self.status = status;
        }
        if payload.activity.is_some() {
            self.activity = payload.activity.clone();
        }
        if payload.location.is_some() {
            self.location = payload.location.clone();
        }
        if payload.device.is_some() {
            self.device = payload.device.clone();
        }
        if let Some(is_typing) = payload.is_typing {
            self.is_typing = is_typing;
            self.typing_in = if is_typing {
                payload.typing_in.clone()
            } else {
                None
            };
        }
        if payload.metadata.is_some() {
            self.metadata = payload.metadata.clone();
        }
    }
}

/// Counts per status, computed on demand
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PresenceStatistics {
    pub total: usize,
    pub online: usize,
    pub away: usize,
    pub busy: usize,
    pub offline: usize,
    pub typing: usize,
}

/// User input that counts as activity
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputKind {
    MouseDown,
    MouseMove,
    KeyPress,
    Scroll,
    TouchStart,
}

/// Local signals fed in by the host (page visibility, unload, input)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActivitySignal {
    VisibilityHidden,
    VisibilityVisible,
    BeforeUnload,
    Input(InputKind),
}

/// Configuration for presence tracking
#[derive(Debug, Clone)]
pub struct PresenceConfig {
    /// How often the local `last_seen` is refreshed while online
    pub refresh_interval: Duration,

    /// Typing indicator auto-clears after this long without a new keystroke
    pub typing_timeout: Duration,

    /// No input for this long marks the local user away
    pub inactivity_timeout: Duration,
}

impl Default for PresenceConfig {
    fn default() -> Self {
        Self {
            refresh_interval: Duration::from_secs(30),
            typing_timeout: Duration::from_millis(3000),
            inactivity_timeout: Duration::from_secs(5 * 60),
        }
    }
}

#[derive(Debug, Clone)]
struct LocalSession {
    user_id: String,
    session_id: String,
}

#[derive(Debug, Default)]
struct Timers {
    refresh: Option<JoinHandle<()>>,
    typing: Option<JoinHandle<()>>,
    inactivity: Option<JoinHandle<()>>,
    /// Bumped by every `set_typing`; only the timer armed last may clear
    typing_generation: u64,
}

impl Timers {
    fn abort_all(&mut self) {
        for handle in [self.refresh.take(), self.typing.take(), self.inactivity.take()]
            .into_iter()
            .flatten()
        {
            handle.abort();
        }
    }
}

fn replace_timer(slot: &mut Option<JoinHandle<()>>, handle: Option<JoinHandle<()>>) {
    if let Some(previous) = slot.take() {
        previous.abort();
    }
    *slot = handle;
}

/// Which event a local change publishes
#[derive(Debug, Clone, Copy)]
enum LocalChange {
    Online,
    Activity,
    Typing,
}

#[derive(Debug)]
struct PresenceInner {
    config: PresenceConfig,
    dispatcher: Arc<Dispatcher>,
    users: RwLock<HashMap<String, UserPresence>>,
    local: RwLock<Option<LocalSession>>,
    timers: Mutex<Timers>,
    subscription: Mutex<Option<SubscriptionId>>,
}

impl Drop for PresenceInner {
    fn drop(&mut self) {
        self.timers
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .abort_all();

        let subscription = self
            .subscription
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(id) = subscription {
            self.dispatcher.unsubscribe(id);
        }
    }
}

/// Presence tracker for the local tab plus every remote user seen
#[derive(Debug, Clone)]
pub struct PresenceTracker {
    inner: Arc<PresenceInner>,
}

impl PresenceTracker {
    /// Create a tracker and subscribe it to `user` events on `dispatcher`
    pub fn new(dispatcher: Arc<Dispatcher>, config: PresenceConfig) -> Self {
        let inner = Arc::new(PresenceInner {
            config,
            dispatcher: Arc::clone(&dispatcher),
            users: RwLock::new(HashMap::new()),
            local: RwLock::new(None),
            timers: Mutex::new(Timers::default()),
            subscription: Mutex::new(None),
        });

        let weak = Arc::downgrade(&inner);
        let id = dispatcher.subscribe(Topic::User, move |event| {
            if let Some(inner) = weak.upgrade() {
                PresenceTracker { inner }.handle_presence_event(event);
            }
        });
        *inner.subscription.lock().unwrap_or_else(PoisonError::into_inner) = Some(id);

        Self { inner }
    }

    /// Start tracking the local user as `online`.
    ///
    /// Must run inside a tokio runtime; starts the refresh and inactivity
    /// timers and publishes `user.online`.
    pub fn initialize(&self, user_id: &str, session_id: &str, metadata: Option<Value>) {
        self.inner.timers().abort_all();

        let mut record = UserPresence::new(
            user_id.to_string(),
            Some(session_id.to_string()),
            PresenceStatus::Online,
        );
        record.metadata = metadata;

        if let Ok(mut users) = self.inner.users.write() {
            users.insert(user_id.to_string(), record.clone());
        }
        if let Ok(mut local) = self.inner.local.write() {
            *local = Some(LocalSession {
                user_id: user_id.to_string(),
                session_id: session_id.to_string(),
            });
        }

        self.start_refresh_timer();
        self.reset_inactivity_timer();

        tracing::info!(user_id, session_id, "presence initialized");
        self.publish(LocalChange::Online, &record);
    }

    /// Handle that does not keep the tracker alive
    pub fn downgrade(&self) -> WeakPresenceTracker {
        WeakPresenceTracker {
            inner: Arc::downgrade(&self.inner),
        }
    }

    /// Cancel timers and stop consuming events
    pub fn shutdown(&self) {
        self.inner.timers().abort_all();

        let subscription = self
            .inner
            .subscription
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(id) = subscription {
            self.inner.dispatcher.unsubscribe(id);
        }
    }

    /// Going offline also stops the inactivity timer, so offline sticks
    /// until the next input signal.
    pub fn set_status(&self, status: PresenceStatus) -> RealtimeResult<()> {
        self.update_local(LocalChange::Activity, |record| record.status = status)?;

        if status == PresenceStatus::Offline {
            replace_timer(&mut self.inner.timers().inactivity, None);
        }
        Ok(())
    }

    pub fn set_online(&self) -> RealtimeResult<()> {
        self.set_status(PresenceStatus::Online)
    }

    pub fn set_away(&self) -> RealtimeResult<()> {
        self.set_status(PresenceStatus::Away)
    }

    pub fn set_busy(&self) -> RealtimeResult<()> {
        self.set_status(PresenceStatus::Busy)
    }

    pub fn set_offline(&self) -> RealtimeResult<()> {
        self.set_status(PresenceStatus::Offline)
    }

    pub fn set_activity(&self, activity: impl Into<String>) -> RealtimeResult<()> {
        let activity = activity.into();
        self.update_local(LocalChange::Activity, |record| record.activity = Some(activity))
    }

    pub fn set_location(&self, location: impl Into<String>) -> RealtimeResult<()> {
        let location = location.into();
        self.update_local(LocalChange::Activity, |record| record.location = Some(location))
    }

    pub fn set_device(&self, device: impl Into<String>) -> RealtimeResult<()> {
        let device = device.into();
        self.update_local(LocalChange::Activity, |record| record.device = Some(device))
    }

    /// Set the typing indicator.
    ///
    /// `true` auto-clears after `typing_timeout`; calling it again restarts
    /// the window instead of stacking timers.
    pub fn set_typing(&self, is_typing: bool, typing_in: Option<String>) -> RealtimeResult<()> {
        // Claimed before the record changes, so an older timer that already
        // woke up can no longer clear this update
        let generation = {
            let mut timers = self.inner.timers();
            timers.typing_generation += 1;
            timers.typing_generation
        };

        self.update_local(LocalChange::Typing, |record| {
            record.is_typing = is_typing;
            record.typing_in = if is_typing { typing_in } else { None };
        })?;

        let mut timers = self.inner.timers();
        if timers.typing_generation != generation {
            // A later call already replaced the timer
            return Ok(());
        }

        let timer = is_typing.then(|| {
            let weak = Arc::downgrade(&self.inner);
            let timeout = self.inner.config.typing_timeout;
            tokio::spawn(async move {
                tokio::time::sleep(timeout).await;
                if let Some(inner) = weak.upgrade() {
                    PresenceTracker { inner }.expire_typing(generation);
                }
            })
        });

        replace_timer(&mut timers.typing, timer);
        Ok(())
    }

    /// Clear the typing indicator armed by `set_typing` call `generation`,
    /// unless a newer call took over
    fn expire_typing(&self, generation: u64) {
        let result = self.update_local_if(LocalChange::Typing, |record| {
            let mut timers = self.inner.timers();
            if timers.typing_generation != generation {
                return false;
            }
            timers.typing = None;
            record.is_typing = false;
            record.typing_in = None;
            true
        });

        if let Err(e) = result {
            tracing::debug!(error = %e, "typing timer fired without a local user");
        }
    }

    /// React to a local browser-style signal
    pub fn handle_signal(&self, signal: ActivitySignal) {
        let result = match signal {
            ActivitySignal::VisibilityHidden => self.set_away(),
            ActivitySignal::VisibilityVisible => self.set_online(),
            ActivitySignal::BeforeUnload => self.set_offline(),
            ActivitySignal::Input(_) => match self.local_status() {
                Some(PresenceStatus::Away) => {
                    self.reset_inactivity_timer();
                    self.set_online()
                }
                // Input never rearms the timer for a user who went offline
                Some(PresenceStatus::Offline) => Ok(()),
                _ => {
                    self.reset_inactivity_timer();
                    Ok(())
                }
            },
        };

        if let Err(e) = result {
            tracing::debug!(?signal, error = %e, "activity signal ignored");
        }
    }

    /// Upsert a remote `user.*` event. Returns whether a record changed.
    pub fn handle_presence_event(&self, event: &RealtimeEvent) -> bool {
        let Some(payload) = event.payload.presence() else {
            return false;
        };
        let Some(user_id) = event.user_id.as_deref() else {
            tracing::debug!(event = %event.event, "presence event without user id");
            return false;
        };

        let Ok(mut users) = self.inner.users.write() else {
            return false;
        };

        let record = users.entry(user_id.to_string()).or_insert_with(|| {
            UserPresence::new(user_id.to_string(), None, PresenceStatus::Online)
        });

        match event.payload {
            EventPayload::UserOnline(_) => record.status = PresenceStatus::Online,
            EventPayload::UserOffline(_) => record.status = PresenceStatus::Offline,
            _ => {}
        }
        record.apply(payload);
        if event.session_id.is_some() {
            record.session_id = event.session_id.clone();
        }
        record.last_seen = event.timestamp;

        true
    }

    /// Drop a user's record
    pub fn remove_user(&self, user_id: &str) -> bool {
        self.inner
            .users
            .write()
            .map(|mut users| users.remove(user_id).is_some())
            .unwrap_or(false)
    }

    pub fn user_presence(&self, user_id: &str) -> Option<UserPresence> {
        self.inner.users.read().ok()?.get(user_id).cloned()
    }

    /// The local user's record, once initialized
    pub fn local_user(&self) -> Option<UserPresence> {
        let user_id = self.local_session()?.user_id;
        self.user_presence(&user_id)
    }

    pub fn all_users(&self) -> Vec<UserPresence> {
        self.collect(|_| true)
    }

    pub fn online_users(&self) -> Vec<UserPresence> {
        self.users_by_status(PresenceStatus::Online)
    }

    pub fn users_by_status(&self, status: PresenceStatus) -> Vec<UserPresence> {
        self.collect(|p| p.status == status)
    }

    pub fn typing_users(&self) -> Vec<UserPresence> {
        self.collect(|p| p.is_typing)
    }

    pub fn is_user_online(&self, user_id: &str) -> bool {
        self.user_presence(user_id)
            .map_or(false, |p| p.status == PresenceStatus::Online)
    }

    pub fn is_user_typing(&self, user_id: &str) -> bool {
        self.user_presence(user_id).map_or(false, |p| p.is_typing)
    }

    pub fn statistics(&self) -> PresenceStatistics {
        let Ok(users) = self.inner.users.read() else {
            return PresenceStatistics::default();
        };

        let mut stats = PresenceStatistics {
            total: users.len(),
            ..Default::default()
        };
        for presence in users.values() {
            match presence.status {
                PresenceStatus::Online => stats.online += 1,
                PresenceStatus::Away => stats.away += 1,
                PresenceStatus::Busy => stats.busy += 1,
                PresenceStatus::Offline => stats.offline += 1,
            }
            if presence.is_typing {
                stats.typing += 1;
            }
        }
        stats
    }

    fn collect(&self, predicate: impl Fn(&UserPresence) -> bool) -> Vec<UserPresence> {
        let Ok(users) = self.inner.users.read() else {
            return Vec::new();
        };

        let mut result: Vec<UserPresence> = users.values().filter(|p| predicate(p)).cloned().collect();
        result.sort_by(|a, b| a.user_id.cmp(&b.user_id));
        result
    }

    fn local_session(&self) -> Option<LocalSession> {
        self.inner.local.read().ok()?.clone()
    }

    fn local_status(&self) -> Option<PresenceStatus> {
        self.local_user().map(|p| p.status)
    }

    /// Mutate the local record, bump `last_seen` and publish the result
    fn update_local(
        &self,
        change: LocalChange,
        mutate: impl FnOnce(&mut UserPresence),
    ) -> RealtimeResult<()> {
        self.update_local_if(change, |record| {
            mutate(record);
            true
        })
    }

    /// Like `update_local`, but nothing is bumped or published when `mutate`
    /// returns `false`. `mutate` runs under the users lock.
    fn update_local_if(
        &self,
        change: LocalChange,
        mutate: impl FnOnce(&mut UserPresence) -> bool,
    ) -> RealtimeResult<()> {
        let session = self.local_session().ok_or(RealtimeError::NotTracking)?;

        let snapshot = {
            let mut users = self
                .inner
                .users
                .write()
                .map_err(|_| RealtimeError::Internal("Lock poisoned".into()))?;
            let record = users
                .entry(session.user_id.clone())
                .or_insert_with(|| {
                    UserPresence::new(
                        session.user_id.clone(),
                        Some(session.session_id.clone()),
                        PresenceStatus::Online,
                    )
                });
            if !mutate(record) {
                return Ok(());
            }
            record.session_id = Some(session.session_id.clone());
            record.last_seen = Utc::now();
            record.clone()
        };

        self.publish(change, &snapshot);
        Ok(())
    }

    fn publish(&self, change: LocalChange, record: &UserPresence) {
        let payload = record.to_payload();
        let payload = match change {
            LocalChange::Online => EventPayload::UserOnline(payload),
            LocalChange::Activity => EventPayload::UserActivity(payload),
            LocalChange::Typing => EventPayload::UserTyping(payload),
        };

        let event = RealtimeEvent::new(payload).with_user(&record.user_id, record.session_id.clone());
        self.inner.dispatcher.publish(event);
    }

    fn start_refresh_timer(&self) {
        let weak: Weak<PresenceInner> = Arc::downgrade(&self.inner);
        let period = self.inner.config.refresh_interval;

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                PresenceTracker { inner }.refresh_last_seen();
            }
        });

        replace_timer(&mut self.inner.timers().refresh, Some(handle));
    }

    fn refresh_last_seen(&self) {
        let Some(session) = self.local_session() else {
            return;
        };
        if let Ok(mut users) = self.inner.users.write() {
            if let Some(record) = users.get_mut(&session.user_id) {
                if record.status == PresenceStatus::Online {
                    record.last_seen = Utc::now();
                }
            }
        }
    }

    fn reset_inactivity_timer(&self) {
        if self.local_session().is_none() {
            return;
        }

        let weak = Arc::downgrade(&self.inner);
        let timeout = self.inner.config.inactivity_timeout;

        let handle = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if let Some(inner) = weak.upgrade() {
                let tracker = PresenceTracker { inner };
                tracker.inner.timers().inactivity = None;
                tracing::debug!("inactive, marking away");
                let _ = tracker.set_away();
            }
        });

        replace_timer(&mut self.inner.timers().inactivity, Some(handle));
    }
}

/// Non-owning [`PresenceTracker`] handle
#[derive(Debug, Clone)]
pub struct WeakPresenceTracker {
    inner: Weak<PresenceInner>,
}

impl WeakPresenceTracker {
    pub fn upgrade(&self) -> Option<PresenceTracker> {
        self.inner.upgrade().map(|inner| PresenceTracker { inner })
    }
}

impl PresenceInner {
    fn timers(&self) -> std::sync::MutexGuard<'_, Timers> {
        self.timers.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
