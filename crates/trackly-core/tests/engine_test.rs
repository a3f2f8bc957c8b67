#![allow(clippy::unwrap_used)]

// Engine integration tests over an in-memory connector.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use pretty_assertions::assert_eq;
use secrecy::SecretString;
use serde_json::json;
use tokio::sync::mpsc;
use trackly_api::{Channel, ChannelKind, ClientMessage, EventKind, Link, LinkPeer, ServerEvent};
use trackly_core::{
    ConnectionState, Connector, Coordinate, CoreError, Engine, EngineConfig, StaticTokenProvider,
    TokenProvider, TrackTarget, TransportKind,
};

// ── Harness ──────────────────────────────────────────────────────────

struct MockConnector {
    script: Mutex<VecDeque<Result<(), trackly_api::Error>>>,
    connects: Mutex<u32>,
    peers: mpsc::UnboundedSender<LinkPeer>,
}

#[async_trait]
impl Connector for MockConnector {
    fn fallback(&self) -> Option<TransportKind> {
        None
    }

    async fn connect(
        &self,
        transport: TransportKind,
        _token: &SecretString,
    ) -> Result<Link, trackly_api::Error> {
        *self.connects.lock().unwrap() += 1;
        if let Some(Err(e)) = self.script.lock().unwrap().pop_front() {
            return Err(e);
        }
        let (link, peer) = Link::channel(transport);
        self.peers.send(peer).unwrap();
        Ok(link)
    }
}

struct Harness {
    engine: Engine,
    connector: Arc<MockConnector>,
    peers: mpsc::UnboundedReceiver<LinkPeer>,
}

fn harness_with(config: EngineConfig, script: Vec<Result<(), trackly_api::Error>>) -> Harness {
    let (peers_tx, peers) = mpsc::unbounded_channel();
    let connector = Arc::new(MockConnector {
        script: Mutex::new(script.into()),
        connects: Mutex::new(0),
        peers: peers_tx,
    });
    let engine = Engine::new(config, Arc::clone(&connector) as Arc<dyn Connector>).unwrap();
    Harness {
        engine,
        connector,
        peers,
    }
}

fn harness() -> Harness {
    let config = EngineConfig {
        traffic_adjustment: false,
        ..EngineConfig::default()
    };
    harness_with(config, vec![])
}

fn tokens() -> Arc<dyn TokenProvider> {
    Arc::new(StaticTokenProvider::new("secret"))
}

fn target() -> TrackTarget {
    TrackTarget::to(Coordinate::new(40.01, -74.0).unwrap())
}

fn subscribe(kind: ChannelKind, id: &str) -> ClientMessage {
    ClientMessage::Subscribe(Channel::new(kind, id))
}

fn unsubscribe(kind: ChannelKind, id: &str) -> ClientMessage {
    ClientMessage::Unsubscribe(Channel::new(kind, id))
}

async fn next_peer(h: &mut Harness) -> LinkPeer {
    tokio::time::timeout(Duration::from_secs(60), h.peers.recv())
        .await
        .unwrap()
        .unwrap()
}

async fn next_message(peer: &mut LinkPeer) -> ClientMessage {
    tokio::time::timeout(Duration::from_secs(5), peer.outbound.recv())
        .await
        .unwrap()
        .unwrap()
}

async fn assert_quiet(peer: &mut LinkPeer) {
    let extra = tokio::time::timeout(Duration::from_millis(100), peer.outbound.recv()).await;
    assert!(extra.is_err(), "unexpected message: {extra:?}");
}

fn location_event(channel: &str, lat: f64) -> ServerEvent {
    ServerEvent {
        channel: channel.into(),
        event: EventKind::LocationUpdated,
        data: json!({
            "lat": lat,
            "lng": -74.0,
            "speed": 10.0,
            "timestamp": Utc::now().timestamp_millis(),
        }),
    }
}

// ── Subscriptions ────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn subscription_made_before_start_is_sent_on_connect() {
    let mut h = harness();
    let _handle = h.engine.track_order("42", target()).await.unwrap();
    h.engine.start(tokens()).await.unwrap();

    let mut peer = next_peer(&mut h).await;
    assert_eq!(next_message(&mut peer).await, subscribe(ChannelKind::Order, "42"));
    assert_quiet(&mut peer).await;
}

#[tokio::test(start_paused = true)]
async fn shared_subscription_sends_once_and_unsubscribes_once() {
    let mut h = harness();
    h.engine.start(tokens()).await.unwrap();
    let mut peer = next_peer(&mut h).await;

    let first = h.engine.track_driver("7", target()).await.unwrap();
    let second = h.engine.track_driver("7", target()).await.unwrap();
    assert_eq!(next_message(&mut peer).await, subscribe(ChannelKind::Driver, "7"));
    assert_quiet(&mut peer).await;

    first.release();
    assert_quiet(&mut peer).await;

    drop(second);
    assert_eq!(next_message(&mut peer).await, unsubscribe(ChannelKind::Driver, "7"));
    assert_quiet(&mut peer).await;
}

#[tokio::test(start_paused = true)]
async fn reconnect_replays_each_subscription_exactly_once() {
    let mut h = harness();
    let _a = h.engine.track_order("1", target()).await.unwrap();
    let _b = h.engine.track_order("1", target()).await.unwrap();
    let _c = h.engine.track_driver("9", target()).await.unwrap();
    h.engine.start(tokens()).await.unwrap();

    let mut peer = next_peer(&mut h).await;
    assert_eq!(next_message(&mut peer).await, subscribe(ChannelKind::Order, "1"));
    assert_eq!(next_message(&mut peer).await, subscribe(ChannelKind::Driver, "9"));

    // Server drops the link.
    drop(peer);

    let mut peer = next_peer(&mut h).await;
    assert_eq!(next_message(&mut peer).await, subscribe(ChannelKind::Order, "1"));
    assert_eq!(next_message(&mut peer).await, subscribe(ChannelKind::Driver, "9"));
    assert_quiet(&mut peer).await;
    assert_eq!(*h.connector.connects.lock().unwrap(), 2);
}

// ── Events ───────────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn location_event_updates_handle_and_listeners() {
    let mut h = harness();
    let mut handle = h.engine.track_order("42", target()).await.unwrap();
    let (seen_tx, mut seen_rx) = mpsc::unbounded_channel();
    h.engine
        .on_snapshot_change(&handle, move |snap| {
            let _ = seen_tx.send(snap.progress);
        })
        .await
        .unwrap();

    h.engine.start(tokens()).await.unwrap();
    let mut peer = next_peer(&mut h).await;
    next_message(&mut peer).await;

    peer.inbound.send(Ok(location_event("order:42", 40.0))).await.unwrap();
    let snap = handle.changed().await.unwrap();
    let meters = snap.distance_remaining.unwrap().meters;
    assert!((meters - 1111.95).abs() < 0.5, "got {meters}");
    let secs = snap.time_remaining.unwrap().as_secs_f64();
    assert!((secs - 111.2).abs() < 1.0, "got {secs}");
    assert_eq!(seen_rx.recv().await, Some(0.0));

    assert_eq!(
        h.engine.current_snapshot(&handle).unwrap().distance_remaining,
        snap.distance_remaining
    );
    assert_eq!(h.engine.dispatch_stats().routed, 1);
}

#[tokio::test(start_paused = true)]
async fn events_for_untracked_entities_are_counted() {
    let mut h = harness();
    let _handle = h.engine.track_order("42", target()).await.unwrap();
    h.engine.start(tokens()).await.unwrap();
    let mut peer = next_peer(&mut h).await;
    next_message(&mut peer).await;

    peer.inbound.send(Ok(location_event("order:999", 40.0))).await.unwrap();
    peer.inbound
        .send(Ok(ServerEvent {
            channel: "nonsense".into(),
            event: EventKind::StatusChanged,
            data: json!({"status": "x"}),
        }))
        .await
        .unwrap();

    // Let the actor drain the link.
    tokio::time::sleep(Duration::from_millis(10)).await;
    let stats = h.engine.dispatch_stats();
    assert_eq!(stats.unroutable, 1);
    assert_eq!(stats.malformed, 1);
    assert_eq!(stats.routed, 0);
}

#[tokio::test(start_paused = true)]
async fn panicking_listener_does_not_starve_others() {
    let mut h = harness();
    let mut handle = h.engine.track_order("42", target()).await.unwrap();
    h.engine
        .on_snapshot_change(&handle, |_| panic!("listener bug"))
        .await
        .unwrap();
    let (seen_tx, mut seen_rx) = mpsc::unbounded_channel();
    h.engine
        .on_snapshot_change(&handle, move |snap| {
            let _ = seen_tx.send(snap.key.clone());
        })
        .await
        .unwrap();

    h.engine.start(tokens()).await.unwrap();
    let mut peer = next_peer(&mut h).await;
    next_message(&mut peer).await;
    peer.inbound.send(Ok(location_event("order:42", 40.0))).await.unwrap();

    handle.changed().await.unwrap();
    assert_eq!(seen_rx.recv().await.unwrap().to_string(), "order:42");
}

#[tokio::test(start_paused = true)]
async fn removed_listener_is_not_called() {
    let mut h = harness();
    let mut handle = h.engine.track_order("42", target()).await.unwrap();
    let (seen_tx, mut seen_rx) = mpsc::unbounded_channel::<()>();
    let id = h
        .engine
        .on_snapshot_change(&handle, move |_| {
            let _ = seen_tx.send(());
        })
        .await
        .unwrap();
    h.engine.off(id);

    h.engine.start(tokens()).await.unwrap();
    let mut peer = next_peer(&mut h).await;
    next_message(&mut peer).await;
    peer.inbound.send(Ok(location_event("order:42", 40.0))).await.unwrap();
    handle.changed().await.unwrap();

    // The sender was dropped with the listener.
    assert_eq!(seen_rx.recv().await, None);
}

#[tokio::test(start_paused = true)]
async fn listener_registration_reports_failures() {
    let a = harness();
    let b = harness();
    let handle = a.engine.track_order("42", target()).await.unwrap();

    // `b` has never heard of order 42.
    assert!(matches!(
        b.engine.on_snapshot_change(&handle, |_| {}).await,
        Err(CoreError::NotTracked { ref key }) if key == "order:42"
    ));

    a.engine.shutdown().await;
    assert!(matches!(
        a.engine.on_snapshot_change(&handle, |_| {}).await,
        Err(CoreError::EngineStopped)
    ));
}

#[tokio::test(start_paused = true)]
async fn countdown_goes_stale_without_fresh_samples() {
    let mut h = harness();
    let mut handle = h.engine.track_driver("7", target()).await.unwrap();
    h.engine.start(tokens()).await.unwrap();
    let mut peer = next_peer(&mut h).await;
    next_message(&mut peer).await;

    peer.inbound.send(Ok(location_event("driver:7", 40.0))).await.unwrap();
    let fresh = handle.changed().await.unwrap();
    assert!(!fresh.is_stale);
    let sent_at = tokio::time::Instant::now();

    // Ticks count the ETA down until the 30s window lapses.
    let stale = loop {
        let snap = handle.changed().await.unwrap();
        if snap.is_stale {
            break snap;
        }
        assert!(snap.time_remaining <= fresh.time_remaining);
    };
    let waited = sent_at.elapsed();
    assert!(
        (Duration::from_secs(29)..=Duration::from_secs(32)).contains(&waited),
        "went stale after {waited:?}"
    );
    assert_eq!(stale.distance_remaining, fresh.distance_remaining);

    // Frozen: further ticks publish nothing new.
    tokio::time::sleep(Duration::from_secs(5)).await;
    assert!(h.engine.current_snapshot(&handle).unwrap().is_stale);
    assert_eq!(
        h.engine.current_snapshot(&handle).unwrap().time_remaining,
        stale.time_remaining
    );
}

// ── Lifecycle ────────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn single_auth_rejection_is_retried_not_fatal() {
    let rejected = Err(trackly_api::Error::Authentication {
        message: "token expired".into(),
    });
    let h = harness_with(EngineConfig::default(), vec![rejected]);
    let mut errors = h.engine.errors();
    let mut status = h.engine.connection_status();

    h.engine.start(tokens()).await.unwrap();
    status
        .wait_for(|s| s.state == ConnectionState::Connected)
        .await
        .unwrap();
    assert_eq!(*h.connector.connects.lock().unwrap(), 2);

    let mut seen = Vec::new();
    while let Ok(err) = errors.try_recv() {
        seen.push(err);
    }
    assert!(seen.iter().all(|err| !err.is_fatal()), "fatal error in {seen:?}");
    assert!(matches!(
        seen.first().map(|err| &**err),
        Some(CoreError::AuthenticationRejected { .. })
    ));
}

#[tokio::test(start_paused = true)]
async fn auth_rejections_end_in_failed() {
    let config = EngineConfig {
        max_auth_retries: 1,
        ..EngineConfig::default()
    };
    let rejected = || {
        Err(trackly_api::Error::Authentication {
            message: "token expired".into(),
        })
    };
    let h = harness_with(config, vec![rejected(), rejected()]);
    let mut errors = h.engine.errors();
    let mut status = h.engine.connection_status();

    h.engine.start(tokens()).await.unwrap();
    status
        .wait_for(|s| s.state == ConnectionState::Failed)
        .await
        .unwrap();
    assert_eq!(*h.connector.connects.lock().unwrap(), 2);

    let mut fatal = None;
    while let Ok(err) = errors.try_recv() {
        if err.is_fatal() {
            fatal = Some(err);
        }
    }
    assert!(matches!(
        fatal.as_deref(),
        Some(CoreError::AuthenticationFailed { .. })
    ));
}

#[tokio::test(start_paused = true)]
async fn stop_then_start_replays_subscriptions() {
    let mut h = harness();
    let _handle = h.engine.track_order("42", target()).await.unwrap();
    h.engine.start(tokens()).await.unwrap();
    let mut peer = next_peer(&mut h).await;
    next_message(&mut peer).await;

    h.engine.stop().await;
    assert_eq!(
        h.engine.connection_status().borrow().state,
        ConnectionState::Disconnected
    );
    h.engine.stop().await;

    h.engine.start(tokens()).await.unwrap();
    let mut peer = next_peer(&mut h).await;
    assert_eq!(next_message(&mut peer).await, subscribe(ChannelKind::Order, "42"));
}

#[tokio::test(start_paused = true)]
async fn double_start_is_rejected() {
    let h = harness();
    h.engine.start(tokens()).await.unwrap();
    assert!(matches!(
        h.engine.start(tokens()).await,
        Err(CoreError::AlreadyStarted)
    ));
}

#[tokio::test(start_paused = true)]
async fn shutdown_closes_handles() {
    let h = harness();
    let mut handle = h.engine.track_order("42", target()).await.unwrap();
    h.engine.shutdown().await;

    assert!(matches!(handle.changed().await, Err(CoreError::EngineStopped)));
    assert!(h.engine.current_snapshot(&handle).is_none());
    assert!(matches!(
        h.engine.track_order("43", target()).await,
        Err(CoreError::EngineStopped)
    ));
}

#[tokio::test(start_paused = true)]
async fn invalid_destination_is_rejected() {
    let h = harness();
    let bad = TrackTarget::to(Coordinate {
        latitude: 123.0,
        longitude: 0.0,
    });
    assert!(matches!(
        h.engine.track_order("1", bad).await,
        Err(CoreError::Geo(_))
    ));
}

#[tokio::test(start_paused = true)]
async fn engines_are_independent() {
    let mut a = harness();
    let b = harness();
    let _ha = a.engine.track_order("1", target()).await.unwrap();
    a.engine.start(tokens()).await.unwrap();
    next_peer(&mut a).await;

    assert_eq!(b.engine.connection_status().borrow().state, ConnectionState::Disconnected);
    assert_eq!(*b.connector.connects.lock().unwrap(), 0);
}
