// Transport plumbing shared by the WebSocket and long-poll links.
//
// A `Link` is the transport-agnostic half the engine talks to: outbound
// control messages go in, decoded server events come out. Each concrete
// transport spawns a pump task holding the other half (`LinkPeer`).

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use secrecy::SecretString;
use tokio::sync::mpsc;
use url::Url;

use crate::error::Error;
use crate::protocol::{ClientMessage, ServerEvent};

const LINK_CHANNEL_CAPACITY: usize = 256;

// ── TransportKind ────────────────────────────────────────────────────

/// Which wire transport a link runs over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display)]
#[strum(serialize_all = "kebab-case")]
pub enum TransportKind {
    /// Preferred: full-duplex WebSocket.
    #[strum(serialize = "websocket")]
    WebSocket,
    /// Fallback: HTTP long-polling.
    LongPoll,
}

// ── Link ─────────────────────────────────────────────────────────────

/// An established, authenticated realtime connection.
///
/// Dropping the `Link` tears down the underlying transport: the pump
/// task observes its channels closing and exits.
#[derive(Debug)]
pub struct Link {
    kind: TransportKind,
    outbound: mpsc::Sender<ClientMessage>,
    inbound: mpsc::Receiver<Result<ServerEvent, Error>>,
}

/// Transport-side half of a [`Link`].
#[derive(Debug)]
pub struct LinkPeer {
    /// Control messages the engine wants delivered to the server.
    pub outbound: mpsc::Receiver<ClientMessage>,
    /// Events (or a terminal error) decoded from the server.
    pub inbound: mpsc::Sender<Result<ServerEvent, Error>>,
}

impl Link {
    /// Create a connected `Link` / `LinkPeer` pair.
    ///
    /// Transports use this internally; in-memory transports and tests can
    /// use it to drive an engine without a network.
    pub fn channel(kind: TransportKind) -> (Self, LinkPeer) {
        let (out_tx, out_rx) = mpsc::channel(LINK_CHANNEL_CAPACITY);
        let (in_tx, in_rx) = mpsc::channel(LINK_CHANNEL_CAPACITY);
        (
            Self {
                kind,
                outbound: out_tx,
                inbound: in_rx,
            },
            LinkPeer {
                outbound: out_rx,
                inbound: in_tx,
            },
        )
    }

    pub fn kind(&self) -> TransportKind {
        self.kind
    }

    /// Queue a control message for delivery.
    pub async fn send(&self, message: ClientMessage) -> Result<(), Error> {
        self.outbound
            .send(message)
            .await
            .map_err(|_| Error::LinkClosed)
    }

    /// Wait for the next server event.
    ///
    /// `None` means the transport ended without reporting an error.
    pub async fn recv(&mut self) -> Option<Result<ServerEvent, Error>> {
        self.inbound.recv().await
    }
}

// ── Connector ────────────────────────────────────────────────────────

/// Establishes authenticated links. The engine owns one per instance.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    /// Transport to try first.
    fn primary(&self) -> TransportKind {
        TransportKind::WebSocket
    }

    /// Transport to degrade to when the primary fails on the first attempt.
    fn fallback(&self) -> Option<TransportKind>;

    /// Connect over `transport` and complete the bearer-token handshake.
    async fn connect(&self, transport: TransportKind, token: &SecretString) -> Result<Link, Error>;
}

// ── TransportConfig ──────────────────────────────────────────────────

/// TLS verification mode for the HTTP long-poll client.
#[derive(Debug, Clone, Default)]
pub enum TlsMode {
    /// Use the system certificate store.
    #[default]
    System,
    /// Use a custom CA certificate from the given PEM file.
    CustomCa(PathBuf),
    /// Accept any certificate (development servers only).
    DangerAcceptInvalid,
}

/// Shared transport configuration for building HTTP clients.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    pub tls: TlsMode,
    /// Per-request timeout; must exceed the server's long-poll hold time.
    pub timeout: Duration,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            tls: TlsMode::System,
            timeout: Duration::from_secs(40),
        }
    }
}

impl TransportConfig {
    /// Build a `reqwest::Client` from this config.
    pub fn build_client(&self) -> Result<reqwest::Client, Error> {
        let mut builder = reqwest::Client::builder()
            .timeout(self.timeout)
            .user_agent(concat!("trackly/", env!("CARGO_PKG_VERSION")));

        match &self.tls {
            TlsMode::System => {}
            TlsMode::CustomCa(path) => {
                let cert_pem = std::fs::read(path)
                    .map_err(|e| Error::Tls(format!("failed to read CA cert: {e}")))?;
                let cert = reqwest::Certificate::from_pem(&cert_pem)
                    .map_err(|e| Error::Tls(format!("invalid CA cert: {e}")))?;
                builder = builder.add_root_certificate(cert);
            }
            TlsMode::DangerAcceptInvalid => {
                builder = builder.danger_accept_invalid_certs(true);
            }
        }

        builder
            .build()
            .map_err(|e| Error::Tls(format!("failed to build HTTP client: {e}")))
    }
}

// ── RealtimeConnector ────────────────────────────────────────────────

/// Endpoints of the realtime service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RealtimeEndpoints {
    /// WebSocket endpoint, e.g. `wss://rt.example.com/v1/stream`.
    pub websocket: Url,
    /// Long-poll base URL, e.g. `https://rt.example.com/v1/poll/`.
    pub long_poll: Option<Url>,
}

/// Production [`Connector`]: WebSocket first, HTTP long-poll as fallback.
#[derive(Debug, Clone)]
pub struct RealtimeConnector {
    endpoints: RealtimeEndpoints,
    http: reqwest::Client,
}

impl RealtimeConnector {
    pub fn new(endpoints: RealtimeEndpoints, transport: &TransportConfig) -> Result<Self, Error> {
        Ok(Self {
            endpoints,
            http: transport.build_client()?,
        })
    }

    pub fn endpoints(&self) -> &RealtimeEndpoints {
        &self.endpoints
    }
}

#[async_trait]
impl Connector for RealtimeConnector {
    fn fallback(&self) -> Option<TransportKind> {
        self.endpoints
            .long_poll
            .as_ref()
            .map(|_| TransportKind::LongPoll)
    }

    async fn connect(&self, transport: TransportKind, token: &SecretString) -> Result<Link, Error> {
        match transport {
            TransportKind::WebSocket => {
                crate::websocket::connect(&self.endpoints.websocket, token).await
            }
            TransportKind::LongPoll => {
                let base = self
                    .endpoints
                    .long_poll
                    .as_ref()
                    .ok_or_else(|| Error::Http {
                        status: 0,
                        message: "no long-poll endpoint configured".into(),
                    })?;
                crate::long_poll::connect(&self.http, base, token).await
            }
        }
    }
}
