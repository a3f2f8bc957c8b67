use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::entity::EntityKey;
use crate::geo::Coordinate;

/// One position report for a tracked entity.
///
/// Immutable once received. Samples are ordered by `server_timestamp`;
/// client clocks are never consulted for ordering.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocationSample {
    pub key: EntityKey,
    pub position: Coordinate,
    /// Degrees clockwise from north, if the device reported one.
    pub heading: Option<f64>,
    /// Ground speed in m/s, if the device reported one.
    pub speed: Option<f64>,
    pub server_timestamp: DateTime<Utc>,
}

/// Where a tracked entity is heading.
///
/// Supplied by the caller; the engine never looks destinations up itself.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TrackTarget {
    pub destination: Coordinate,
    /// Starting point used as the 0% mark for progress. When absent the
    /// first accepted sample serves instead.
    pub origin: Option<Coordinate>,
}

impl TrackTarget {
    pub fn to(destination: Coordinate) -> Self {
        Self {
            destination,
            origin: None,
        }
    }

    #[must_use]
    pub fn with_origin(mut self, origin: Coordinate) -> Self {
        self.origin = Some(origin);
        self
    }
}
