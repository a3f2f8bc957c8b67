// ── Geodesy and ETA arithmetic ──
//
// Pure functions only: no clocks, no I/O, no shared state. Sessions call
// into this module for every derived field they publish.

use std::time::Duration;

use chrono::{Datelike, NaiveTime, Timelike, Weekday};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Mean Earth radius in meters.
pub const EARTH_RADIUS_M: f64 = 6_371_000.0;

/// Mean Earth radius in statute miles.
pub const EARTH_RADIUS_MI: f64 = 3_959.0;

/// Inputs this close outside a bound are treated as float noise and clamped.
const BOUND_TOLERANCE: f64 = 1e-9;

#[derive(Debug, Clone, Copy, PartialEq, Error)]
pub enum GeoError {
    #[error("invalid coordinate ({latitude}, {longitude})")]
    InvalidCoordinate { latitude: f64, longitude: f64 },

    #[error("invalid speed {0} m/s: must be finite and greater than zero")]
    InvalidSpeed(f64),

    #[error("invalid distance {0} m: must be finite and non-negative")]
    InvalidDistance(f64),
}

// ── Coordinate ───────────────────────────────────────────────────────

/// WGS-84 position in decimal degrees.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Coordinate {
    pub latitude: f64,
    pub longitude: f64,
}

impl Coordinate {
    /// Build a validated coordinate.
    pub fn new(latitude: f64, longitude: f64) -> Result<Self, GeoError> {
        Self {
            latitude,
            longitude,
        }
        .validated()
    }

    /// Check ranges, snapping sub-tolerance overshoot back onto the bound.
    pub fn validated(self) -> Result<Self, GeoError> {
        let invalid = GeoError::InvalidCoordinate {
            latitude: self.latitude,
            longitude: self.longitude,
        };
        let latitude = clamp_axis(self.latitude, 90.0).ok_or(invalid)?;
        let longitude = clamp_axis(self.longitude, 180.0).ok_or(invalid)?;
        Ok(Self {
            latitude,
            longitude,
        })
    }
}

fn clamp_axis(value: f64, bound: f64) -> Option<f64> {
    if !value.is_finite() || value.abs() > bound + BOUND_TOLERANCE {
        return None;
    }
    Some(value.clamp(-bound, bound))
}

/// A great-circle distance in both metric units.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Distance {
    pub meters: f64,
    pub kilometers: f64,
}

impl Distance {
    pub fn from_meters(meters: f64) -> Self {
        Self {
            meters,
            kilometers: meters / 1000.0,
        }
    }
}

// ── Distance & bearing ───────────────────────────────────────────────

/// Central angle between two points, in radians (haversine).
fn central_angle(a: Coordinate, b: Coordinate) -> Result<f64, GeoError> {
    let a = a.validated()?;
    let b = b.validated()?;

    let phi1 = a.latitude.to_radians();
    let phi2 = b.latitude.to_radians();
    let d_phi = (b.latitude - a.latitude).to_radians();
    let d_lambda = (b.longitude - a.longitude).to_radians();

    let h = (d_phi / 2.0).sin().powi(2) + phi1.cos() * phi2.cos() * (d_lambda / 2.0).sin().powi(2);
    // Rounding can push h a hair outside [0, 1] for antipodal points.
    let h = h.clamp(0.0, 1.0);
    Ok(2.0 * h.sqrt().atan2((1.0 - h).sqrt()))
}

/// Haversine great-circle distance.
pub fn distance(a: Coordinate, b: Coordinate) -> Result<Distance, GeoError> {
    Ok(Distance::from_meters(EARTH_RADIUS_M * central_angle(a, b)?))
}

/// Haversine great-circle distance in statute miles.
pub fn distance_miles(a: Coordinate, b: Coordinate) -> Result<f64, GeoError> {
    Ok(EARTH_RADIUS_MI * central_angle(a, b)?)
}

/// Initial great-circle bearing from `a` towards `b`, degrees in `[0, 360)`.
pub fn bearing(a: Coordinate, b: Coordinate) -> Result<f64, GeoError> {
    let a = a.validated()?;
    let b = b.validated()?;

    let phi1 = a.latitude.to_radians();
    let phi2 = b.latitude.to_radians();
    let d_lambda = (b.longitude - a.longitude).to_radians();

    let y = d_lambda.sin() * phi2.cos();
    let x = phi1.cos() * phi2.sin() - phi1.sin() * phi2.cos() * d_lambda.cos();
    Ok(y.atan2(x).to_degrees().rem_euclid(360.0))
}

// ── ETA ──────────────────────────────────────────────────────────────

/// Time to cover `distance_m` at a constant `speed_mps`.
///
/// Callers apply their own floor speed first; this function only rejects
/// speeds that would make the division meaningless.
pub fn estimate_duration(distance_m: f64, speed_mps: f64) -> Result<Duration, GeoError> {
    if !speed_mps.is_finite() || speed_mps <= 0.0 {
        return Err(GeoError::InvalidSpeed(speed_mps));
    }
    if !distance_m.is_finite() || distance_m < 0.0 {
        return Err(GeoError::InvalidDistance(distance_m));
    }
    Duration::try_from_secs_f64(distance_m / speed_mps)
        .map_err(|_| GeoError::InvalidDistance(distance_m))
}

/// Weekday rush-hour multiplier (07:00–09:00, 17:00–19:00).
const RUSH_HOUR_FACTOR: f64 = 0.55;
/// Weekend midday multiplier (12:00–20:00).
const WEEKEND_FACTOR: f64 = 0.7;

/// Degrade `base_speed` for typical traffic at the given local time.
///
/// Fixed heuristic bands, start inclusive and end exclusive. No external
/// traffic data is consulted.
pub fn adjusted_speed(base_speed: f64, time_of_day: NaiveTime, weekday: Weekday) -> f64 {
    let hour = time_of_day.hour();
    let weekend = matches!(weekday, Weekday::Sat | Weekday::Sun);

    let factor = if weekend {
        if (12..20).contains(&hour) {
            WEEKEND_FACTOR
        } else {
            1.0
        }
    } else if (7..9).contains(&hour) || (17..19).contains(&hour) {
        RUSH_HOUR_FACTOR
    } else {
        1.0
    };

    base_speed * factor
}

/// Convenience wrapper taking any local date-time.
pub fn adjusted_speed_at<T: Datelike + Timelike>(base_speed: f64, at: &T) -> f64 {
    let time = NaiveTime::from_hms_opt(at.hour(), at.minute(), at.second()).unwrap_or(NaiveTime::MIN);
    adjusted_speed(base_speed, time, at.weekday())
}

// ── Progress ─────────────────────────────────────────────────────────

/// Fraction of the original distance already covered, in `[0, 1]`.
///
/// Returns 0 when no movement was ever recorded (`original == 0`).
pub fn progress(original_distance: f64, current_distance: f64) -> f64 {
    if original_distance <= 0.0 || !original_distance.is_finite() {
        return 0.0;
    }
    let fraction = (original_distance - current_distance) / original_distance;
    if fraction.is_nan() {
        return 0.0;
    }
    fraction.clamp(0.0, 1.0)
}

// ── Tests ────────────────────────────────────────────────────────────
