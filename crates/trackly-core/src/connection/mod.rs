// ── Connection lifecycle ──
//
// Owns the single realtime link of an engine: fetches a token, connects
// (primary transport first, one downgrade to the fallback), pumps events
// to the engine actor, and reconnects with exponential backoff. Only the
// background task spawned here mutates connection state; everyone else
// observes it through a `watch` channel.

mod backoff;

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use trackly_api::{ClientMessage, Connector, Link, ServerEvent, TransportKind};

pub use backoff::Backoff;

use crate::config::EngineConfig;
use crate::error::CoreError;
use crate::token::TokenProvider;

// ── State ────────────────────────────────────────────────────────────

/// Connection state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, strum::Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    /// Waiting out a backoff delay before attempt number `attempt`.
    Reconnecting { attempt: u32 },
    /// Terminal: retries exhausted or credentials rejected too often.
    Failed,
}

/// Observable connection status, published on every transition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConnectionStatus {
    pub state: ConnectionState,
    /// Transport of the current (or last attempted) link.
    #[serde(serialize_with = "serialize_transport")]
    pub transport: Option<TransportKind>,
    /// Consecutive failed attempts since the last successful connect.
    pub attempt: u32,
    /// When the next reconnect attempt fires, while `Reconnecting`.
    pub next_retry_at: Option<DateTime<Utc>>,
}

#[allow(clippy::ref_option)]
fn serialize_transport<S: serde::Serializer>(
    transport: &Option<TransportKind>,
    serializer: S,
) -> Result<S::Ok, S::Error> {
    match transport {
        Some(kind) => serializer.collect_str(kind),
        None => serializer.serialize_none(),
    }
}

impl ConnectionStatus {
    fn disconnected() -> Self {
        Self {
            state: ConnectionState::Disconnected,
            transport: None,
            attempt: 0,
            next_retry_at: None,
        }
    }
}

impl Default for ConnectionStatus {
    fn default() -> Self {
        Self::disconnected()
    }
}

// ── Events to the engine ─────────────────────────────────────────────

/// What the connection task reports to its owner.
#[derive(Debug)]
pub enum ConnectionEvent {
    /// A link is up. `generation` tags outbound messages for this link.
    Connected {
        generation: u64,
        transport: TransportKind,
        /// `true` when this is a reconnect rather than the first connect.
        resumed: bool,
    },
    /// A decoded server event.
    Event(ServerEvent),
    /// The link dropped; a reconnect follows unless the task ended.
    Disconnected { reason: String },
}

/// A control message addressed to a specific link generation.
///
/// Messages for a generation that is no longer live are discarded; the
/// registry replays subscriptions on the next `Connected` instead.
#[derive(Debug)]
struct OutboundMessage {
    generation: u64,
    message: ClientMessage,
}

// ── ConnectionManager ────────────────────────────────────────────────

struct Running {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
    outbound: mpsc::UnboundedSender<OutboundMessage>,
}

/// Starts, stops and feeds the background connection task.
pub struct ConnectionManager {
    connector: Arc<dyn Connector>,
    config: EngineConfig,
    status_tx: watch::Sender<ConnectionStatus>,
    events_tx: mpsc::UnboundedSender<ConnectionEvent>,
    errors_tx: broadcast::Sender<Arc<CoreError>>,
    generation: Arc<AtomicU64>,
    running: Option<Running>,
}

impl ConnectionManager {
    pub fn new(
        config: EngineConfig,
        connector: Arc<dyn Connector>,
        events_tx: mpsc::UnboundedSender<ConnectionEvent>,
        errors_tx: broadcast::Sender<Arc<CoreError>>,
    ) -> Self {
        let (status_tx, _) = watch::channel(ConnectionStatus::disconnected());
        Self {
            connector,
            config,
            status_tx,
            events_tx,
            errors_tx,
            generation: Arc::new(AtomicU64::new(0)),
            running: None,
        }
    }

    /// Subscribe to status transitions.
    pub fn status(&self) -> watch::Receiver<ConnectionStatus> {
        self.status_tx.subscribe()
    }

    /// Whether a connection task is alive (connecting, connected or backing off).
    pub fn is_running(&self) -> bool {
        self.running
            .as_ref()
            .is_some_and(|running| !running.handle.is_finished())
    }

    /// Spawn the connection task. Restarting after `stop()` or after the
    /// task reached `Failed` is allowed.
    pub fn start(&mut self, tokens: Arc<dyn TokenProvider>) -> Result<(), CoreError> {
        if self.is_running() {
            return Err(CoreError::AlreadyStarted);
        }

        let cancel = CancellationToken::new();
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let task = ConnectionTask {
            connector: Arc::clone(&self.connector),
            tokens,
            config: self.config.clone(),
            status_tx: self.status_tx.clone(),
            events_tx: self.events_tx.clone(),
            errors_tx: self.errors_tx.clone(),
            outbound_rx,
            cancel: cancel.clone(),
            generation: Arc::clone(&self.generation),
        };

        tracing::info!(transport = %self.connector.primary(), "Starting connection");
        self.status_tx.send_replace(ConnectionStatus {
            state: ConnectionState::Connecting,
            transport: Some(self.connector.primary()),
            attempt: 0,
            next_retry_at: None,
        });

        self.running = Some(Running {
            cancel,
            handle: tokio::spawn(task.run()),
            outbound: outbound_tx,
        });
        Ok(())
    }

    /// Cancel the task (including any pending backoff), drop the link and
    /// report `Disconnected`. Safe to call repeatedly.
    pub async fn stop(&mut self) {
        if let Some(running) = self.running.take() {
            running.cancel.cancel();
            if let Err(e) = running.handle.await {
                tracing::warn!(error = %e, "Connection task ended abnormally");
            }
            tracing::info!("Connection stopped");
        }
        self.status_tx.send_replace(ConnectionStatus::disconnected());
    }

    /// Queue a control message for the link with the given generation.
    pub fn send(&self, generation: u64, message: ClientMessage) {
        let Some(running) = &self.running else {
            tracing::trace!(%message, "No connection task; dropping message");
            return;
        };
        if running
            .outbound
            .send(OutboundMessage {
                generation,
                message,
            })
            .is_err()
        {
            tracing::trace!("Connection task gone; dropping message");
        }
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        if let Some(running) = &self.running {
            running.cancel.cancel();
        }
    }
}

// ── Background task ──────────────────────────────────────────────────

struct ConnectionTask {
    connector: Arc<dyn Connector>,
    tokens: Arc<dyn TokenProvider>,
    config: EngineConfig,
    status_tx: watch::Sender<ConnectionStatus>,
    events_tx: mpsc::UnboundedSender<ConnectionEvent>,
    errors_tx: broadcast::Sender<Arc<CoreError>>,
    outbound_rx: mpsc::UnboundedReceiver<OutboundMessage>,
    cancel: CancellationToken,
    generation: Arc<AtomicU64>,
}

/// How a live link ended.
enum LinkEnd {
    /// Stop requested or owner gone; do not reconnect.
    Shutdown,
    Dropped(String),
}

impl ConnectionTask {
    /// Main loop: connect → drive link → on failure, backoff → reconnect.
    async fn run(mut self) {
        let mut backoff = Backoff::new(
            self.config.base_reconnect_delay,
            self.config.max_reconnect_delay,
        );
        let mut transport = self.connector.primary();
        let mut first_attempt = true;
        let mut ever_connected = false;
        let mut auth_failures: u32 = 0;
        let mut network_failures: u32 = 0;

        loop {
            self.publish(ConnectionState::Connecting, transport, network_failures + auth_failures, None);

            let result = tokio::select! {
                biased;
                () = self.cancel.cancelled() => break,
                result = self.attempt(transport) => result,
            };

            match result {
                Ok(link) => {
                    backoff.reset();
                    auth_failures = 0;
                    network_failures = 0;
                    first_attempt = false;

                    let generation = self.generation.fetch_add(1, Ordering::Relaxed) + 1;
                    tracing::info!(%transport, generation, resumed = ever_connected, "Connected");
                    self.publish(ConnectionState::Connected, transport, 0, None);
                    if self
                        .events_tx
                        .send(ConnectionEvent::Connected {
                            generation,
                            transport,
                            resumed: ever_connected,
                        })
                        .is_err()
                    {
                        break;
                    }
                    ever_connected = true;

                    match self.drive(link, generation).await {
                        LinkEnd::Shutdown => break,
                        LinkEnd::Dropped(reason) => {
                            tracing::warn!(%reason, "Connection lost");
                            if self
                                .events_tx
                                .send(ConnectionEvent::Disconnected { reason })
                                .is_err()
                            {
                                break;
                            }
                        }
                    }
                }
                Err(err) => {
                    let was_first = std::mem::replace(&mut first_attempt, false);

                    if err.is_auth_failure() {
                        auth_failures += 1;
                        tracing::warn!(error = %err, auth_failures, "Authentication rejected");
                        if auth_failures > self.config.max_auth_retries {
                            tracing::error!(
                                max_auth_retries = self.config.max_auth_retries,
                                "Authentication retries exhausted, giving up"
                            );
                            self.publish(ConnectionState::Failed, transport, auth_failures, None);
                            self.report(CoreError::AuthenticationFailed {
                                message: format!("rejected {auth_failures} times: {err}"),
                            });
                            break;
                        }
                        self.report(CoreError::from(err));
                    } else {
                        if was_first {
                            if let Some(fallback) = self.connector.fallback().filter(|f| *f != transport) {
                                tracing::warn!(
                                    error = %err,
                                    from = %transport,
                                    to = %fallback,
                                    "Primary transport failed, falling back"
                                );
                                self.report(CoreError::from(err));
                                transport = fallback;
                                continue;
                            }
                        }

                        network_failures += 1;
                        tracing::warn!(error = %err, network_failures, "Connection attempt failed");
                        self.report(CoreError::from(err));
                        if let Some(max) = self.config.max_reconnect_attempts {
                            if network_failures >= max {
                                tracing::error!(max_reconnect_attempts = max, "Reconnect limit reached, giving up");
                                self.publish(ConnectionState::Failed, transport, network_failures, None);
                                self.report(CoreError::ReconnectExhausted {
                                    attempts: network_failures,
                                });
                                break;
                            }
                        }
                    }
                }
            }

            let delay = backoff.next_delay();
            let next_retry_at = chrono::Duration::from_std(delay)
                .ok()
                .and_then(|d| Utc::now().checked_add_signed(d));
            tracing::info!(
                delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                attempt = backoff.attempt(),
                "Waiting before reconnect"
            );
            self.publish(
                ConnectionState::Reconnecting {
                    attempt: backoff.attempt(),
                },
                transport,
                network_failures + auth_failures,
                next_retry_at,
            );

            tokio::select! {
                biased;
                () = self.cancel.cancelled() => break,
                () = tokio::time::sleep(delay) => {}
            }
        }

        tracing::debug!("Connection task exiting");
    }

    /// One connect attempt: fresh token, then connect under the timeout.
    async fn attempt(&self, transport: TransportKind) -> Result<Link, trackly_api::Error> {
        let token = self
            .tokens
            .token()
            .await
            .map_err(|e| trackly_api::Error::TokenUnavailable {
                message: e.to_string(),
            })?;

        tracing::debug!(%transport, "Connecting");
        tokio::time::timeout(
            self.config.connect_timeout,
            self.connector.connect(transport, &token),
        )
        .await
        .map_err(|_| trackly_api::Error::Timeout {
            timeout_secs: self.config.connect_timeout.as_secs(),
        })?
    }

    /// Pump a live link until it drops or the task is cancelled.
    async fn drive(&mut self, mut link: Link, generation: u64) -> LinkEnd {
        loop {
            tokio::select! {
                biased;
                () = self.cancel.cancelled() => return LinkEnd::Shutdown,
                outbound = self.outbound_rx.recv() => {
                    let Some(outbound) = outbound else {
                        return LinkEnd::Shutdown;
                    };
                    if outbound.generation != generation {
                        tracing::trace!(
                            stale = outbound.generation,
                            generation,
                            "Discarding message for a previous link"
                        );
                        continue;
                    }
                    tracing::debug!(message = %outbound.message, "Sending");
                    if let Err(e) = link.send(outbound.message).await {
                        return LinkEnd::Dropped(e.to_string());
                    }
                }
                inbound = link.recv() => match inbound {
                    Some(Ok(event)) => {
                        if self.events_tx.send(ConnectionEvent::Event(event)).is_err() {
                            return LinkEnd::Shutdown;
                        }
                    }
                    Some(Err(e)) => {
                        let reason = e.to_string();
                        self.report(CoreError::from(e));
                        return LinkEnd::Dropped(reason);
                    }
                    None => return LinkEnd::Dropped("transport closed".into()),
                },
            }
        }
    }

    fn publish(
        &self,
        state: ConnectionState,
        transport: TransportKind,
        attempt: u32,
        next_retry_at: Option<DateTime<Utc>>,
    ) {
        self.status_tx.send_replace(ConnectionStatus {
            state,
            transport: Some(transport),
            attempt,
            next_retry_at,
        });
    }

    fn report(&self, err: CoreError) {
        // No receivers is fine: nobody is listening for errors.
        let _ = self.errors_tx.send(Arc::new(err));
    }
}

// ── Tests ────────────────────────────────────────────────────────────
