// ── Event dispatch ──
//
// Routes decoded server events to the matching tracking session and fans
// resulting snapshot changes out to registered listeners. Events for keys
// nobody tracks are dropped and counted, never treated as errors.

use std::collections::HashMap;
use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use serde::Serialize;
use trackly_api::protocol::decode_payload;
use trackly_api::{ArrivedPayload, Channel, EventKind, LocationPayload, ServerEvent, StatusPayload};

use crate::convert;
use crate::model::{EntityKey, TrackingSnapshot};
use crate::session::TrackingSession;

/// Snapshot-change callback.
pub type Listener = Arc<dyn Fn(&TrackingSnapshot) + Send + Sync>;

// ── ListenerId ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ListenerId(u64);

impl fmt::Display for ListenerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "l{}", self.0)
    }
}

/// Allocates listener ids; clones share the sequence.
#[derive(Debug, Clone, Default)]
pub struct ListenerIds(Arc<AtomicU64>);

impl ListenerIds {
    pub fn next(&self) -> ListenerId {
        ListenerId(self.0.fetch_add(1, Ordering::Relaxed) + 1)
    }
}

// ── Stats ────────────────────────────────────────────────────────────

/// Routing counters since the engine was created.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DispatchStats {
    /// Delivered to a live session.
    pub routed: u64,
    /// No session for the channel, or an event kind we do not handle.
    pub unroutable: u64,
    /// Unparseable channel or payload.
    pub malformed: u64,
}

#[derive(Debug, Default)]
pub struct DispatchCounters {
    routed: AtomicU64,
    unroutable: AtomicU64,
    malformed: AtomicU64,
}

impl DispatchCounters {
    pub fn snapshot(&self) -> DispatchStats {
        DispatchStats {
            routed: self.routed.load(Ordering::Relaxed),
            unroutable: self.unroutable.load(Ordering::Relaxed),
            malformed: self.malformed.load(Ordering::Relaxed),
        }
    }
}

/// Outcome of routing a single event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteOutcome {
    /// Session updated and listeners notified.
    Changed,
    /// Session found but the event changed nothing (e.g. out-of-order sample).
    Unchanged,
    Unroutable,
    Malformed,
}

// ── EventDispatcher ──────────────────────────────────────────────────

#[derive(Default)]
pub struct EventDispatcher {
    listeners: HashMap<EntityKey, Vec<(ListenerId, Listener)>>,
    owners: HashMap<ListenerId, EntityKey>,
    ids: ListenerIds,
    counters: Arc<DispatchCounters>,
}

impl EventDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Shared id allocator, for callers that hand out ids before registering.
    pub fn listener_ids(&self) -> ListenerIds {
        self.ids.clone()
    }

    pub fn counters(&self) -> Arc<DispatchCounters> {
        Arc::clone(&self.counters)
    }

    pub fn stats(&self) -> DispatchStats {
        self.counters.snapshot()
    }

    /// Register a listener for changes to `key`.
    pub fn on(&mut self, key: EntityKey, listener: Listener) -> ListenerId {
        let id = self.ids.next();
        self.insert(id, key, listener);
        id
    }

    /// Register under a pre-allocated id.
    pub fn insert(&mut self, id: ListenerId, key: EntityKey, listener: Listener) {
        tracing::debug!(listener = %id, %key, "Listener registered");
        self.owners.insert(id, key.clone());
        self.listeners.entry(key).or_default().push((id, listener));
    }

    /// Remove a listener. Unknown ids are ignored.
    pub fn off(&mut self, id: ListenerId) -> bool {
        let Some(key) = self.owners.remove(&id) else {
            return false;
        };
        if let Some(list) = self.listeners.get_mut(&key) {
            list.retain(|(lid, _)| *lid != id);
            if list.is_empty() {
                self.listeners.remove(&key);
            }
        }
        true
    }

    /// Drop every listener attached to `key` (its session is gone).
    pub fn forget(&mut self, key: &EntityKey) {
        if let Some(list) = self.listeners.remove(key) {
            for (id, _) in list {
                self.owners.remove(&id);
            }
        }
    }

    pub fn listener_count(&self, key: &EntityKey) -> usize {
        self.listeners.get(key).map_or(0, Vec::len)
    }

    /// Invoke every listener for the snapshot's key. A panicking listener
    /// is logged and skipped; the rest still run.
    pub fn notify(&self, snapshot: &TrackingSnapshot) {
        let Some(list) = self.listeners.get(&snapshot.key) else {
            return;
        };
        for (id, listener) in list {
            if catch_unwind(AssertUnwindSafe(|| listener(snapshot))).is_err() {
                tracing::warn!(listener = %id, key = %snapshot.key, "Snapshot listener panicked");
            }
        }
    }

    /// Deliver `event` to its session (never creating one) and notify.
    pub fn route(
        &self,
        event: &ServerEvent,
        sessions: &mut HashMap<EntityKey, TrackingSession>,
        now: DateTime<Utc>,
    ) -> RouteOutcome {
        let channel: Channel = match event.channel.parse() {
            Ok(channel) => channel,
            Err(e) => {
                tracing::debug!(error = %e, "Dropping event with malformed channel");
                return self.count(RouteOutcome::Malformed);
            }
        };
        let key = EntityKey::from(channel);

        let Some(session) = sessions.get_mut(&key) else {
            tracing::trace!(%key, "No session for event");
            return self.count(RouteOutcome::Unroutable);
        };

        let applied = match event.event {
            EventKind::LocationUpdated => decode_payload::<LocationPayload>(event)
                .map_err(|e| e.to_string())
                .and_then(|payload| {
                    convert::location_sample(key.clone(), payload).map_err(|e| e.to_string())
                })
                .and_then(|sample| session.apply_sample(sample).map_err(|e| e.to_string())),
            EventKind::StatusChanged => decode_payload::<StatusPayload>(event)
                .map(|payload| session.apply_status(&payload.status, now))
                .map_err(|e| e.to_string()),
            EventKind::Arrived => {
                let payload = if event.data.is_null() {
                    Ok(ArrivedPayload { timestamp: None })
                } else {
                    decode_payload::<ArrivedPayload>(event)
                };
                payload
                    .map(|p| session.mark_arrived(p.timestamp.unwrap_or(now)))
                    .map_err(|e| e.to_string())
            }
            EventKind::Other => {
                tracing::debug!(%key, "Ignoring unknown event kind");
                return self.count(RouteOutcome::Unroutable);
            }
        };

        match applied {
            Ok(true) => {
                self.notify(&session.snapshot());
                self.count(RouteOutcome::Changed)
            }
            Ok(false) => self.count(RouteOutcome::Unchanged),
            Err(message) => {
                tracing::debug!(%key, error = %message, "Dropping malformed event payload");
                self.count(RouteOutcome::Malformed)
            }
        }
    }

    fn count(&self, outcome: RouteOutcome) -> RouteOutcome {
        let counter = match outcome {
            RouteOutcome::Changed | RouteOutcome::Unchanged => &self.counters.routed,
            RouteOutcome::Unroutable => &self.counters.unroutable,
            RouteOutcome::Malformed => &self.counters.malformed,
        };
        counter.fetch_add(1, Ordering::Relaxed);
        outcome
    }
}

// ── Tests ────────────────────────────────────────────────────────────

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::sync::Mutex;

    use chrono::TimeZone;
    use serde_json::json;

    use super::*;
    use crate::geo::Coordinate;
    use crate::model::TrackTarget;
    use crate::session::EtaPolicy;

    fn now() -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000, 0).unwrap()
    }

    fn sessions_with(key: &EntityKey) -> HashMap<EntityKey, TrackingSession> {
        let target = TrackTarget::to(Coordinate::new(40.01, -74.0).unwrap());
        let session = TrackingSession::new(key.clone(), target, EtaPolicy::default(), now()).unwrap();
        HashMap::from([(key.clone(), session)])
    }

    fn event(channel: &str, kind: EventKind, data: serde_json::Value) -> ServerEvent {
        ServerEvent {
            channel: channel.into(),
            event: kind,
            data,
        }
    }

    fn location(ts_ms: i64) -> serde_json::Value {
        json!({"lat": 40.0, "lng": -74.0, "speed": 10.0, "timestamp": ts_ms})
    }

    #[test]
    fn location_event_updates_session_and_notifies() {
        let key = EntityKey::order("42");
        let mut sessions = sessions_with(&key);
        let mut dispatcher = EventDispatcher::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        dispatcher.on(
            key.clone(),
            Arc::new(move |snap: &TrackingSnapshot| {
                sink.lock().unwrap().push(snap.distance_remaining.map(|d| d.meters));
            }),
        );

        let outcome = dispatcher.route(
            &event("order:42", EventKind::LocationUpdated, location(1_700_000_000_000)),
            &mut sessions,
            now(),
        );
        assert_eq!(outcome, RouteOutcome::Changed);
        assert_eq!(seen.lock().unwrap().len(), 1);
        assert!(sessions[&key].snapshot().has_fix());
        assert_eq!(dispatcher.stats().routed, 1);
    }

    #[test]
    fn unknown_channel_is_counted_not_created() {
        let mut sessions = sessions_with(&EntityKey::order("42"));
        let dispatcher = EventDispatcher::new();

        let outcome = dispatcher.route(
            &event("driver:9", EventKind::LocationUpdated, location(1)),
            &mut sessions,
            now(),
        );
        assert_eq!(outcome, RouteOutcome::Unroutable);
        assert!(!sessions.contains_key(&EntityKey::driver("9")));
        assert_eq!(
            dispatcher.stats(),
            DispatchStats {
                routed: 0,
                unroutable: 1,
                malformed: 0
            }
        );
    }

    #[test]
    fn malformed_channel_and_payload_are_counted() {
        let key = EntityKey::order("42");
        let mut sessions = sessions_with(&key);
        let dispatcher = EventDispatcher::new();

        dispatcher.route(&event("bogus", EventKind::Arrived, json!(null)), &mut sessions, now());
        dispatcher.route(
            &event("order:42", EventKind::LocationUpdated, json!({"lat": "north"})),
            &mut sessions,
            now(),
        );
        dispatcher.route(
            &event(
                "order:42",
                EventKind::LocationUpdated,
                json!({"lat": 95.0, "lng": 0.0, "timestamp": 1}),
            ),
            &mut sessions,
            now(),
        );
        assert_eq!(dispatcher.stats().malformed, 3);
        assert!(!sessions[&key].snapshot().has_fix());
    }

    #[test]
    fn status_and_arrival_events() {
        let key = EntityKey::order("42");
        let mut sessions = sessions_with(&key);
        let dispatcher = EventDispatcher::new();

        let outcome = dispatcher.route(
            &event("order:42", EventKind::StatusChanged, json!({"status": "en_route"})),
            &mut sessions,
            now(),
        );
        assert_eq!(outcome, RouteOutcome::Changed);
        assert_eq!(sessions[&key].snapshot().status.as_deref(), Some("en_route"));

        let outcome = dispatcher.route(
            &event("order:42", EventKind::Arrived, json!(null)),
            &mut sessions,
            now(),
        );
        assert_eq!(outcome, RouteOutcome::Changed);
        let snap = sessions[&key].snapshot();
        assert!(snap.arrived);
        assert_eq!(snap.eta, Some(now()));
    }

    #[test]
    fn panicking_listener_does_not_block_others() {
        let key = EntityKey::order("42");
        let mut sessions = sessions_with(&key);
        let mut dispatcher = EventDispatcher::new();
        let calls = Arc::new(AtomicU64::new(0));

        dispatcher.on(key.clone(), Arc::new(|_: &TrackingSnapshot| panic!("listener bug")));
        let counter = Arc::clone(&calls);
        dispatcher.on(
            key.clone(),
            Arc::new(move |_: &TrackingSnapshot| {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        );

        dispatcher.route(
            &event("order:42", EventKind::LocationUpdated, location(1_700_000_000_000)),
            &mut sessions,
            now(),
        );
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn off_and_forget_remove_listeners() {
        let key = EntityKey::order("42");
        let mut dispatcher = EventDispatcher::new();
        let a = dispatcher.on(key.clone(), Arc::new(|_: &TrackingSnapshot| {}));
        let b = dispatcher.on(key.clone(), Arc::new(|_: &TrackingSnapshot| {}));
        assert_ne!(a, b);
        assert_eq!(dispatcher.listener_count(&key), 2);

        assert!(dispatcher.off(a));
        assert!(!dispatcher.off(a));
        assert_eq!(dispatcher.listener_count(&key), 1);

        dispatcher.forget(&key);
        assert_eq!(dispatcher.listener_count(&key), 0);
        assert!(!dispatcher.off(b));
    }
}
