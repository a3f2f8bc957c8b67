use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

use super::entity::EntityKey;
use super::sample::LocationSample;
use crate::geo::Distance;

/// Immutable view of one tracked entity at a point in time.
///
/// Sessions publish a fresh `Arc<TrackingSnapshot>` on every change;
/// holders of an older one keep a consistent (if outdated) picture.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TrackingSnapshot {
    pub key: EntityKey,
    pub last_sample: Option<LocationSample>,
    pub distance_remaining: Option<Distance>,
    pub eta: Option<DateTime<Utc>>,
    pub time_remaining: Option<Duration>,
    /// Fraction of the trip covered, in `[0, 1]`.
    pub progress: f64,
    /// Initial bearing from the last position to the destination.
    pub bearing: Option<f64>,
    /// No sample within the staleness window; the countdown is frozen.
    pub is_stale: bool,
    pub status: Option<String>,
    pub arrived: bool,
    pub updated_at: DateTime<Utc>,
}

impl TrackingSnapshot {
    /// Snapshot for a freshly created session with no data yet.
    pub fn empty(key: EntityKey, now: DateTime<Utc>) -> Self {
        Self {
            key,
            last_sample: None,
            distance_remaining: None,
            eta: None,
            time_remaining: None,
            progress: 0.0,
            bearing: None,
            is_stale: false,
            status: None,
            arrived: false,
            updated_at: now,
        }
    }

    /// Whether a location has been received yet.
    pub fn has_fix(&self) -> bool {
        self.last_sample.is_some()
    }
}
