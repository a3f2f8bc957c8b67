// ── Wire-to-domain conversions ──
//
// Bridges `trackly_api` protocol types into `trackly_core::model`. Channel
// names become `EntityKey`s; location payloads become validated
// `LocationSample`s.

use trackly_api::{Channel, ChannelKind, LocationPayload};

use crate::geo::{Coordinate, GeoError};
use crate::model::{EntityKey, EntityKind, LocationSample};

impl From<ChannelKind> for EntityKind {
    fn from(kind: ChannelKind) -> Self {
        match kind {
            ChannelKind::Order => Self::Order,
            ChannelKind::Driver => Self::Driver,
        }
    }
}

impl From<EntityKind> for ChannelKind {
    fn from(kind: EntityKind) -> Self {
        match kind {
            EntityKind::Order => Self::Order,
            EntityKind::Driver => Self::Driver,
        }
    }
}

impl From<Channel> for EntityKey {
    fn from(channel: Channel) -> Self {
        Self::new(channel.kind.into(), channel.id)
    }
}

impl From<&EntityKey> for Channel {
    fn from(key: &EntityKey) -> Self {
        Channel::new(key.kind.into(), key.id.as_str())
    }
}

/// Build a sample for `key`, rejecting positions outside WGS-84 ranges.
pub fn location_sample(key: EntityKey, payload: LocationPayload) -> Result<LocationSample, GeoError> {
    let position = Coordinate::new(payload.lat, payload.lng)?;
    Ok(LocationSample {
        key,
        position,
        heading: payload.heading.filter(|h| h.is_finite()),
        speed: payload.speed.filter(|s| s.is_finite() && *s >= 0.0),
        server_timestamp: payload.timestamp,
    })
}
