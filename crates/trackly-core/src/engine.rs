// ── Engine facade ──
//
// Full lifecycle management for realtime tracking. One actor task per
// engine owns the subscription registry, the sessions, the listeners and
// the connection manager, and `select!`s over consumer commands,
// connection events and the countdown tick. `Engine` is a cheaply
// clonable handle that talks to the actor through a command channel.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_stream::wrappers::WatchStream;
use tokio_util::sync::CancellationToken;
use trackly_api::{ClientMessage, Connector};

use crate::config::EngineConfig;
use crate::connection::{ConnectionEvent, ConnectionManager, ConnectionStatus};
use crate::dispatch::{DispatchCounters, DispatchStats, EventDispatcher, Listener, ListenerId, ListenerIds};
use crate::error::CoreError;
use crate::model::{EntityId, EntityKey, TrackTarget, TrackingSnapshot};
use crate::registry::{HandleId, SubscriptionRegistry};
use crate::session::{EtaPolicy, TrackingSession};
use crate::token::TokenProvider;

const ERROR_CHANNEL_SIZE: usize = 64;

// ── Commands ─────────────────────────────────────────────────────────

struct Tracked {
    handle: HandleId,
    snapshots: watch::Receiver<Arc<TrackingSnapshot>>,
}

enum Command {
    Start {
        tokens: Arc<dyn TokenProvider>,
        reply: oneshot::Sender<Result<(), CoreError>>,
    },
    Stop {
        reply: oneshot::Sender<()>,
    },
    Track {
        key: EntityKey,
        target: TrackTarget,
        reply: oneshot::Sender<Result<Tracked, CoreError>>,
    },
    Release {
        handle: HandleId,
    },
    Listen {
        id: ListenerId,
        key: EntityKey,
        listener: Listener,
        reply: oneshot::Sender<Result<(), CoreError>>,
    },
    Unlisten {
        id: ListenerId,
    },
}

// ── Engine ───────────────────────────────────────────────────────────

/// Realtime tracking engine handle.
///
/// Cheaply cloneable via `Arc<EngineInner>`. Engines share no global
/// state, so several may run side by side.
#[derive(Clone)]
pub struct Engine {
    inner: Arc<EngineInner>,
}

struct EngineInner {
    commands: mpsc::UnboundedSender<Command>,
    status: watch::Receiver<ConnectionStatus>,
    errors: broadcast::Sender<Arc<CoreError>>,
    counters: Arc<DispatchCounters>,
    listener_ids: ListenerIds,
    cancel: CancellationToken,
    actor: Mutex<Option<JoinHandle<()>>>,
}

impl Drop for EngineInner {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

impl Engine {
    /// Create an engine and spawn its actor. Must be called within a
    /// Tokio runtime. Nothing connects until [`start`](Self::start).
    pub fn new(config: EngineConfig, connector: Arc<dyn Connector>) -> Result<Self, CoreError> {
        config.validate()?;

        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (errors_tx, _) = broadcast::channel(ERROR_CHANNEL_SIZE);
        let cancel = CancellationToken::new();

        let connection = ConnectionManager::new(config.clone(), connector, event_tx, errors_tx.clone());
        let dispatcher = EventDispatcher::new();
        let status = connection.status();
        let counters = dispatcher.counters();
        let listener_ids = dispatcher.listener_ids();

        let actor = Actor {
            policy: EtaPolicy::from_config(&config),
            config,
            connection,
            registry: SubscriptionRegistry::new(),
            sessions: HashMap::new(),
            dispatcher,
            generation: None,
            started: false,
            clock: Clock::new(),
            commands: command_rx,
            connection_events: event_rx,
            cancel: cancel.clone(),
        };
        let handle = tokio::spawn(actor.run());

        Ok(Self {
            inner: Arc::new(EngineInner {
                commands: command_tx,
                status,
                errors: errors_tx,
                counters,
                listener_ids,
                cancel,
                actor: Mutex::new(Some(handle)),
            }),
        })
    }

    // ── Lifecycle ────────────────────────────────────────────────────

    /// Begin connecting. Pending subscriptions are sent once connected.
    pub async fn start(&self, tokens: Arc<dyn TokenProvider>) -> Result<(), CoreError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Start { tokens, reply })?;
        rx.await.map_err(|_| CoreError::EngineStopped)?
    }

    /// Drop the connection and cancel pending retries. Subscriptions and
    /// sessions survive and are replayed on the next `start`.
    pub async fn stop(&self) {
        let (reply, rx) = oneshot::channel();
        if self.send(Command::Stop { reply }).is_ok() {
            let _ = rx.await;
        }
    }

    /// Stop everything and end the actor. Outstanding handles observe
    /// their snapshot streams closing.
    pub async fn shutdown(&self) {
        self.inner.cancel.cancel();
        let handle = self
            .inner
            .actor
            .lock()
            .ok()
            .and_then(|mut guard| guard.take());
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                tracing::warn!(error = %e, "Engine actor ended abnormally");
            }
        }
        tracing::info!("Engine shut down");
    }

    // ── Tracking ─────────────────────────────────────────────────────

    pub async fn track_order(
        &self,
        id: impl Into<EntityId>,
        target: TrackTarget,
    ) -> Result<SubscriptionHandle, CoreError> {
        self.track(EntityKey::order(id), target).await
    }

    pub async fn track_driver(
        &self,
        id: impl Into<EntityId>,
        target: TrackTarget,
    ) -> Result<SubscriptionHandle, CoreError> {
        self.track(EntityKey::driver(id), target).await
    }

    /// Start (or join) tracking `key`. When the key is already tracked the
    /// existing session and its destination are shared.
    pub async fn track(
        &self,
        key: EntityKey,
        target: TrackTarget,
    ) -> Result<SubscriptionHandle, CoreError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Track {
            key: key.clone(),
            target,
            reply,
        })?;
        let tracked = rx.await.map_err(|_| CoreError::EngineStopped)??;
        Ok(SubscriptionHandle {
            id: tracked.handle,
            key,
            snapshots: tracked.snapshots,
            commands: self.inner.commands.clone(),
            released: false,
        })
    }

    /// Latest snapshot for a handle, or `None` once its session is gone.
    pub fn current_snapshot(&self, handle: &SubscriptionHandle) -> Option<Arc<TrackingSnapshot>> {
        handle.current()
    }

    /// Call `callback` on every snapshot change for the handle's entity.
    ///
    /// Fails with [`CoreError::EngineStopped`] once the engine is shut down
    /// and with [`CoreError::NotTracked`] if the entity is no longer tracked.
    pub async fn on_snapshot_change<F>(
        &self,
        handle: &SubscriptionHandle,
        callback: F,
    ) -> Result<ListenerId, CoreError>
    where
        F: Fn(&TrackingSnapshot) + Send + Sync + 'static,
    {
        let id = self.inner.listener_ids.next();
        let (reply, rx) = oneshot::channel();
        self.send(Command::Listen {
            id,
            key: handle.key.clone(),
            listener: Arc::new(callback),
            reply,
        })?;
        rx.await.map_err(|_| CoreError::EngineStopped)??;
        Ok(id)
    }

    /// Remove a listener. Unknown ids are ignored.
    pub fn off(&self, id: ListenerId) {
        let _ = self.send(Command::Unlisten { id });
    }

    // ── Observation ──────────────────────────────────────────────────

    pub fn connection_status(&self) -> watch::Receiver<ConnectionStatus> {
        self.inner.status.clone()
    }

    /// Connection errors, including the terminal one before `Failed`.
    pub fn errors(&self) -> broadcast::Receiver<Arc<CoreError>> {
        self.inner.errors.subscribe()
    }

    pub fn dispatch_stats(&self) -> DispatchStats {
        self.inner.counters.snapshot()
    }

    fn send(&self, command: Command) -> Result<(), CoreError> {
        self.inner
            .commands
            .send(command)
            .map_err(|_| CoreError::EngineStopped)
    }
}

// ── SubscriptionHandle ───────────────────────────────────────────────

/// A consumer's hold on one tracked entity.
///
/// Dropping the handle releases it; the server subscription goes away
/// when the last handle for the entity does.
pub struct SubscriptionHandle {
    id: HandleId,
    key: EntityKey,
    snapshots: watch::Receiver<Arc<TrackingSnapshot>>,
    commands: mpsc::UnboundedSender<Command>,
    released: bool,
}

impl SubscriptionHandle {
    pub fn id(&self) -> HandleId {
        self.id
    }

    pub fn key(&self) -> &EntityKey {
        &self.key
    }

    /// Latest snapshot (possibly the last one before the session ended).
    pub fn snapshot(&self) -> Arc<TrackingSnapshot> {
        Arc::clone(&self.snapshots.borrow())
    }

    fn current(&self) -> Option<Arc<TrackingSnapshot>> {
        self.snapshots.has_changed().ok()?;
        Some(self.snapshot())
    }

    /// Wait for the next snapshot change.
    pub async fn changed(&mut self) -> Result<Arc<TrackingSnapshot>, CoreError> {
        self.snapshots
            .changed()
            .await
            .map_err(|_| CoreError::EngineStopped)?;
        Ok(Arc::clone(&self.snapshots.borrow_and_update()))
    }

    /// Stream of snapshots, starting with the current one.
    pub fn watch(&self) -> WatchStream<Arc<TrackingSnapshot>> {
        WatchStream::new(self.snapshots.clone())
    }

    /// Release explicitly. Equivalent to dropping the handle.
    pub fn release(mut self) {
        self.release_inner();
    }

    fn release_inner(&mut self) {
        if !std::mem::replace(&mut self.released, true) {
            let _ = self.commands.send(Command::Release { handle: self.id });
        }
    }
}

impl Drop for SubscriptionHandle {
    fn drop(&mut self) {
        self.release_inner();
    }
}

impl std::fmt::Debug for SubscriptionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriptionHandle")
            .field("id", &self.id)
            .field("key", &self.key)
            .finish_non_exhaustive()
    }
}

// ── Clock ────────────────────────────────────────────────────────────

/// Wall-clock time anchored at engine creation and advanced by the Tokio
/// clock, so countdowns follow paused time in tests.
#[derive(Debug, Clone, Copy)]
struct Clock {
    base: DateTime<Utc>,
    started: tokio::time::Instant,
}

impl Clock {
    fn new() -> Self {
        Self {
            base: Utc::now(),
            started: tokio::time::Instant::now(),
        }
    }

    fn now(&self) -> DateTime<Utc> {
        chrono::Duration::from_std(self.started.elapsed())
            .ok()
            .and_then(|elapsed| self.base.checked_add_signed(elapsed))
            .unwrap_or_else(Utc::now)
    }
}

// ── Actor ────────────────────────────────────────────────────────────

struct Actor {
    config: EngineConfig,
    policy: EtaPolicy,
    connection: ConnectionManager,
    registry: SubscriptionRegistry,
    sessions: HashMap<EntityKey, TrackingSession>,
    dispatcher: EventDispatcher,
    /// Generation of the live link, if any.
    generation: Option<u64>,
    started: bool,
    clock: Clock,
    commands: mpsc::UnboundedReceiver<Command>,
    connection_events: mpsc::UnboundedReceiver<ConnectionEvent>,
    cancel: CancellationToken,
}

impl Actor {
    async fn run(mut self) {
        let mut ticker = tokio::time::interval(self.config.tick_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                biased;
                () = self.cancel.cancelled() => break,
                command = self.commands.recv() => {
                    // Every Engine clone and handle is gone.
                    let Some(command) = command else { break };
                    self.handle_command(command).await;
                }
                Some(event) = self.connection_events.recv() => {
                    self.handle_connection_event(event);
                }
                _ = ticker.tick(), if self.started => {
                    self.tick();
                }
            }
        }

        self.connection.stop().await;
        self.sessions.clear();
        tracing::debug!("Engine actor exiting");
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::Start { tokens, reply } => {
                let result = self.connection.start(tokens);
                if result.is_ok() {
                    self.started = true;
                }
                let _ = reply.send(result);
            }
            Command::Stop { reply } => {
                self.connection.stop().await;
                self.generation = None;
                self.registry.on_disconnected();
                self.started = false;
                let _ = reply.send(());
            }
            Command::Track { key, target, reply } => {
                let _ = reply.send(self.track(key, target));
            }
            Command::Release { handle } => self.release(handle),
            Command::Listen {
                id,
                key,
                listener,
                reply,
            } => {
                let result = if self.sessions.contains_key(&key) {
                    self.dispatcher.insert(id, key, listener);
                    Ok(())
                } else {
                    tracing::warn!(listener = %id, %key, "Listener for untracked entity rejected");
                    Err(CoreError::NotTracked {
                        key: key.to_string(),
                    })
                };
                let _ = reply.send(result);
            }
            Command::Unlisten { id } => {
                self.dispatcher.off(id);
            }
        }
    }

    fn track(&mut self, key: EntityKey, target: TrackTarget) -> Result<Tracked, CoreError> {
        if let Some(session) = self.sessions.get(&key) {
            if session.target().destination != target.destination {
                tracing::debug!(%key, "Already tracked; keeping the first destination");
            }
        } else {
            let session = TrackingSession::new(key.clone(), target, self.policy, self.clock.now())?;
            self.sessions.insert(key.clone(), session);
        }

        let subscribed = self.registry.subscribe(key.clone());
        if let Some(message) = subscribed.message {
            self.send(message);
        }

        let snapshots = self
            .sessions
            .get(&key)
            .map(TrackingSession::subscribe)
            .ok_or_else(|| CoreError::Internal(format!("session for {key} vanished")))?;
        Ok(Tracked {
            handle: subscribed.handle,
            snapshots,
        })
    }

    fn release(&mut self, handle: HandleId) {
        let Some(released) = self.registry.release(handle) else {
            return;
        };
        if let Some(message) = released.message {
            self.send(message);
        }
        if released.removed {
            self.sessions.remove(&released.key);
            self.dispatcher.forget(&released.key);
            tracing::info!(key = %released.key, "Stopped tracking");
        }
    }

    fn handle_connection_event(&mut self, event: ConnectionEvent) {
        match event {
            ConnectionEvent::Connected {
                generation,
                transport,
                resumed,
            } => {
                self.generation = Some(generation);
                let replay = self.registry.on_connected();
                tracing::info!(%transport, resumed, subscriptions = replay.len(), "Link up");
                for message in replay {
                    self.send(message);
                }
            }
            ConnectionEvent::Event(event) => {
                self.dispatcher.route(&event, &mut self.sessions, self.clock.now());
            }
            ConnectionEvent::Disconnected { reason } => {
                tracing::debug!(%reason, "Link down");
                self.generation = None;
                self.registry.on_disconnected();
            }
        }
    }

    fn tick(&mut self) {
        let now = self.clock.now();
        for session in self.sessions.values_mut() {
            if session.tick(now) {
                self.dispatcher.notify(&session.snapshot());
            }
        }
    }

    fn send(&self, message: ClientMessage) {
        match self.generation {
            Some(generation) => self.connection.send(generation, message),
            None => tracing::trace!(%message, "Not connected; message deferred to replay"),
        }
    }
}
