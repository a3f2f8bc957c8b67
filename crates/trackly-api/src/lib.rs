// trackly-api: Realtime wire protocol and transports for the trackly tracking engine.

pub mod error;
pub mod long_poll;
pub mod protocol;
pub mod transport;
pub mod websocket;

pub use error::Error;
pub use protocol::{
    ArrivedPayload, Channel, ChannelKind, ClientMessage, EventKind, LocationPayload, ServerEvent,
    ServerFrame, StatusPayload,
};
pub use transport::{
    Connector, Link, LinkPeer, RealtimeConnector, RealtimeEndpoints, TlsMode, TransportConfig,
    TransportKind,
};
