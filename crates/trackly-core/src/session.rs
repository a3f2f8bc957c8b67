// ── Per-entity tracking session ──
//
// Turns a stream of location samples into distance / ETA / progress
// snapshots against a fixed destination. Every published snapshot is an
// immutable `Arc`; readers on any thread see the latest one through a
// `watch` channel.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, FixedOffset, Utc};
use tokio::sync::watch;

use crate::config::EngineConfig;
use crate::geo::{self, Distance, GeoError};
use crate::model::{EntityKey, LocationSample, TrackTarget, TrackingSnapshot};

// ── EtaPolicy ────────────────────────────────────────────────────────

/// The slice of `EngineConfig` a session needs.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EtaPolicy {
    pub min_speed_mps: f64,
    pub default_speed_mps: f64,
    /// Local offset for traffic bands; `None` disables the adjustment.
    pub traffic_offset: Option<FixedOffset>,
    pub staleness_window: Duration,
}

impl EtaPolicy {
    pub fn from_config(config: &EngineConfig) -> Self {
        let traffic_offset = config
            .traffic_adjustment
            .then(|| FixedOffset::east_opt(config.traffic_utc_offset_minutes * 60))
            .flatten();
        Self {
            min_speed_mps: config.min_speed_mps,
            default_speed_mps: config.default_speed_mps,
            traffic_offset,
            staleness_window: config.staleness_window,
        }
    }

    /// Speed used for an ETA computed at `at`: reported speed (or the
    /// default), traffic-adjusted, floored at the minimum.
    pub fn effective_speed(&self, reported: Option<f64>, at: DateTime<Utc>) -> f64 {
        let base = reported
            .filter(|s| s.is_finite() && *s >= 0.0)
            .unwrap_or(self.default_speed_mps);
        let adjusted = match self.traffic_offset {
            Some(offset) => geo::adjusted_speed_at(base, &at.with_timezone(&offset)),
            None => base,
        };
        adjusted.max(self.min_speed_mps)
    }
}

impl Default for EtaPolicy {
    fn default() -> Self {
        Self::from_config(&EngineConfig::default())
    }
}

// ── TrackingSession ──────────────────────────────────────────────────

pub struct TrackingSession {
    key: EntityKey,
    target: TrackTarget,
    policy: EtaPolicy,
    created_at: DateTime<Utc>,
    /// 0% mark for progress, fixed by the origin or the first sample.
    original_distance: Option<f64>,
    tx: watch::Sender<Arc<TrackingSnapshot>>,
}

impl TrackingSession {
    pub fn new(
        key: EntityKey,
        target: TrackTarget,
        policy: EtaPolicy,
        now: DateTime<Utc>,
    ) -> Result<Self, GeoError> {
        let destination = target.destination.validated()?;
        let origin = target.origin.map(geo::Coordinate::validated).transpose()?;
        let original_distance = origin
            .map(|o| geo::distance(o, destination).map(|d| d.meters))
            .transpose()?;

        let (tx, _) = watch::channel(Arc::new(TrackingSnapshot::empty(key.clone(), now)));
        Ok(Self {
            key,
            target: TrackTarget {
                destination,
                origin,
            },
            policy,
            created_at: now,
            original_distance,
            tx,
        })
    }

    pub fn key(&self) -> &EntityKey {
        &self.key
    }

    pub fn target(&self) -> &TrackTarget {
        &self.target
    }

    /// Latest published snapshot.
    pub fn snapshot(&self) -> Arc<TrackingSnapshot> {
        Arc::clone(&self.tx.borrow())
    }

    /// Receiver that observes every published snapshot.
    pub fn subscribe(&self) -> watch::Receiver<Arc<TrackingSnapshot>> {
        self.tx.subscribe()
    }

    fn publish(&self, snapshot: TrackingSnapshot) {
        self.tx.send_replace(Arc::new(snapshot));
    }

    /// Fold in a new sample. Returns whether the snapshot changed.
    ///
    /// Samples not strictly newer than the last accepted one are dropped,
    /// as is anything arriving after the entity was marked arrived.
    pub fn apply_sample(&mut self, sample: LocationSample) -> Result<bool, GeoError> {
        let current = self.snapshot();
        if current.arrived {
            tracing::trace!(key = %self.key, "Ignoring sample after arrival");
            return Ok(false);
        }
        if let Some(last) = &current.last_sample {
            if sample.server_timestamp <= last.server_timestamp {
                tracing::debug!(
                    key = %self.key,
                    last = %last.server_timestamp,
                    got = %sample.server_timestamp,
                    "Dropping out-of-order sample"
                );
                return Ok(false);
            }
        }

        let destination = self.target.destination;
        let remaining = geo::distance(sample.position, destination)?;
        let original = *self.original_distance.get_or_insert(remaining.meters);

        let speed = self
            .policy
            .effective_speed(sample.speed, sample.server_timestamp);
        let travel = geo::estimate_duration(remaining.meters, speed)?;
        let eta = chrono::Duration::from_std(travel)
            .ok()
            .and_then(|d| sample.server_timestamp.checked_add_signed(d));
        let bearing = geo::bearing(sample.position, destination).ok();

        let next = TrackingSnapshot {
            key: self.key.clone(),
            distance_remaining: Some(remaining),
            eta,
            time_remaining: Some(travel),
            progress: geo::progress(original, remaining.meters),
            bearing,
            is_stale: false,
            status: current.status.clone(),
            arrived: false,
            updated_at: sample.server_timestamp,
            last_sample: Some(sample),
        };
        self.publish(next);
        Ok(true)
    }

    /// Recompute the countdown and staleness at `now`. Distance is untouched.
    pub fn tick(&mut self, now: DateTime<Utc>) -> bool {
        let current = self.snapshot();
        if current.arrived {
            return false;
        }

        let reference = current
            .last_sample
            .as_ref()
            .map_or(self.created_at, |s| s.server_timestamp);
        let window = chrono::Duration::from_std(self.policy.staleness_window)
            .unwrap_or(chrono::Duration::MAX);
        let is_stale = now.signed_duration_since(reference) > window;

        let time_remaining = if is_stale {
            // Frozen: no fresh data to count down against.
            current.time_remaining
        } else {
            current
                .eta
                .map(|eta| eta.signed_duration_since(now).to_std().unwrap_or(Duration::ZERO))
        };

        if is_stale == current.is_stale && time_remaining == current.time_remaining {
            return false;
        }
        if is_stale && !current.is_stale {
            tracing::info!(key = %self.key, "Tracking data went stale");
        }

        let mut next = TrackingSnapshot::clone(&current);
        next.is_stale = is_stale;
        next.time_remaining = time_remaining;
        next.updated_at = now;
        self.publish(next);
        true
    }

    /// Record a delivery status update. Returns whether it changed.
    pub fn apply_status(&mut self, status: &str, now: DateTime<Utc>) -> bool {
        let current = self.snapshot();
        if current.status.as_deref() == Some(status) {
            return false;
        }
        let mut next = TrackingSnapshot::clone(&current);
        next.status = Some(status.to_owned());
        next.updated_at = now;
        self.publish(next);
        true
    }

    /// Pin the snapshot at the destination. Later samples are ignored.
    pub fn mark_arrived(&mut self, at: DateTime<Utc>) -> bool {
        let current = self.snapshot();
        if current.arrived {
            return false;
        }
        tracing::info!(key = %self.key, %at, "Arrived");

        let mut next = TrackingSnapshot::clone(&current);
        next.arrived = true;
        next.distance_remaining = Some(Distance::from_meters(0.0));
        next.progress = 1.0;
        next.time_remaining = Some(Duration::ZERO);
        next.eta = Some(at);
        next.is_stale = false;
        next.updated_at = at;
        self.publish(next);
        true
    }
}

// ── Tests ────────────────────────────────────────────────────────────
