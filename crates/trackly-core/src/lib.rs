//! Realtime tracking engine between `trackly-api` and UI consumers.
//!
//! - **[`Engine`]**: Facade over one connection and its subscriptions:
//!   [`start()`](Engine::start) connects with a [`TokenProvider`],
//!   [`track_order()`](Engine::track_order) / [`track_driver()`](Engine::track_driver)
//!   vend [`SubscriptionHandle`]s whose snapshots update live.
//!
//! - **[`connection`]**: Connection state machine with exponential backoff,
//!   bounded auth retries and a one-time WebSocket → long-poll downgrade.
//!
//! - **[`registry`]**: Reference-counted subscriptions, replayed exactly once
//!   per reconnect.
//!
//! - **[`session`]**: Per-entity distance / ETA / progress snapshots with
//!   out-of-order rejection and staleness.
//!
//! - **[`dispatch`]**: Routes server events to sessions and notifies
//!   isolated listeners.
//!
//! - **[`geo`]**: Haversine distance, bearing, ETA and traffic heuristics.

pub mod config;
pub mod connection;
pub mod convert;
pub mod dispatch;
pub mod engine;
pub mod error;
pub mod geo;
pub mod model;
pub mod registry;
pub mod session;
pub mod token;

// ── Primary re-exports ──────────────────────────────────────────────
pub use config::EngineConfig;
pub use connection::{ConnectionManager, ConnectionState, ConnectionStatus};
pub use dispatch::{DispatchStats, EventDispatcher, ListenerId};
pub use engine::{Engine, SubscriptionHandle};
pub use error::CoreError;
pub use geo::{Coordinate, Distance, GeoError};
pub use model::{EntityId, EntityKey, EntityKind, LocationSample, TrackTarget, TrackingSnapshot};
pub use registry::{HandleId, SubscriptionRegistry};
pub use session::{EtaPolicy, TrackingSession};
pub use token::{StaticTokenProvider, TokenProvider};

// Transport types consumers need to build an engine.
pub use trackly_api::{Connector, RealtimeConnector, RealtimeEndpoints, TransportConfig, TransportKind};
