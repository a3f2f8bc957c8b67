//! Client-observable realtime wire protocol.
//!
//! Every frame is a JSON text message with a `type` discriminator:
//!
//! ```text
//! client → server   {"type":"auth","token":"…"}
//!                   {"type":"subscribe:order","id":"42"}
//!                   {"type":"unsubscribe:driver","id":"d-7"}
//! server → client   {"type":"auth_ok"}
//!                   {"type":"auth_error","message":"token expired"}
//!                   {"type":"event","channel":"order:42","event":"location-updated","data":{…}}
//! ```

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};

use crate::error::Error;

// ── Channels ─────────────────────────────────────────────────────────

/// Kind of entity a server channel streams events for.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
    strum::AsRefStr,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum ChannelKind {
    Order,
    Driver,
}

/// Server-side addressable stream for one entity, rendered as `kind:id`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Channel {
    pub kind: ChannelKind,
    pub id: String,
}

impl Channel {
    pub fn new(kind: ChannelKind, id: impl Into<String>) -> Self {
        Self {
            kind,
            id: id.into(),
        }
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind, self.id)
    }
}

/// Error returned when a channel identifier is not `order:<id>` or `driver:<id>`.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("malformed channel identifier '{0}'")]
pub struct ChannelParseError(pub String);

impl FromStr for Channel {
    type Err = ChannelParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (kind, id) = s
            .split_once(':')
            .ok_or_else(|| ChannelParseError(s.to_owned()))?;
        let kind = kind
            .parse::<ChannelKind>()
            .map_err(|_| ChannelParseError(s.to_owned()))?;
        if id.is_empty() {
            return Err(ChannelParseError(s.to_owned()));
        }
        Ok(Self::new(kind, id))
    }
}

// ── Client → server ──────────────────────────────────────────────────

/// Subscription control message sent by the client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientMessage {
    Subscribe(Channel),
    Unsubscribe(Channel),
}

impl ClientMessage {
    pub fn channel(&self) -> &Channel {
        match self {
            Self::Subscribe(c) | Self::Unsubscribe(c) => c,
        }
    }

    /// Render the message as a JSON text frame.
    pub fn to_frame(&self) -> String {
        let (verb, channel) = match self {
            Self::Subscribe(c) => ("subscribe", c),
            Self::Unsubscribe(c) => ("unsubscribe", c),
        };
        serde_json::json!({
            "type": format!("{verb}:{}", channel.kind),
            "id": channel.id,
        })
        .to_string()
    }
}

impl fmt::Display for ClientMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Subscribe(c) => write!(f, "subscribe {c}"),
            Self::Unsubscribe(c) => write!(f, "unsubscribe {c}"),
        }
    }
}

/// Build the handshake frame carrying the bearer token.
pub fn auth_frame(token: &SecretString) -> String {
    serde_json::json!({
        "type": "auth",
        "token": token.expose_secret(),
    })
    .to_string()
}

// ── Server → client ──────────────────────────────────────────────────

/// Any frame the server may push.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    AuthOk,
    AuthError {
        #[serde(default)]
        message: Option<String>,
    },
    Event(ServerEvent),
    #[serde(other)]
    Unknown,
}

/// An event tagged with the channel it belongs to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerEvent {
    /// Channel identifier, e.g. `"order:42"`. Parsed by the consumer.
    pub channel: String,
    pub event: EventKind,
    #[serde(default)]
    pub data: serde_json::Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EventKind {
    LocationUpdated,
    StatusChanged,
    Arrived,
    #[serde(other)]
    Other,
}

/// Payload of a `location-updated` event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocationPayload {
    pub lat: f64,
    pub lng: f64,
    #[serde(default)]
    pub heading: Option<f64>,
    #[serde(default)]
    pub speed: Option<f64>,
    /// Server timestamp in epoch milliseconds.
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub timestamp: DateTime<Utc>,
}

/// Payload of a `status-changed` event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusPayload {
    pub status: String,
}

/// Payload of an `arrived` event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArrivedPayload {
    #[serde(default, with = "chrono::serde::ts_milliseconds_option")]
    pub timestamp: Option<DateTime<Utc>>,
}

/// Parse one text frame from the server.
pub fn parse_frame(text: &str) -> Result<ServerFrame, Error> {
    serde_json::from_str(text).map_err(|e| Error::Deserialization {
        message: e.to_string(),
        body: text.to_owned(),
    })
}

/// Decode an event payload into its typed form.
pub fn decode_payload<T: serde::de::DeserializeOwned>(event: &ServerEvent) -> Result<T, Error> {
    serde_json::from_value(event.data.clone()).map_err(|e| Error::Deserialization {
        message: e.to_string(),
        body: event.data.to_string(),
    })
}

// ── Tests ────────────────────────────────────────────────────────────
