// ── Runtime engine configuration ──
//
// Describes reconnect policy, staleness, and ETA tuning for an `Engine`.
// Never touches disk: the CLI (or any embedding app) builds an
// `EngineConfig` and hands it in.

use std::time::Duration;

use crate::error::CoreError;

/// Tuning knobs for a single engine instance.
#[derive(Debug, Clone, PartialEq)]
pub struct EngineConfig {
    /// First reconnect delay; doubles per attempt.
    pub base_reconnect_delay: Duration,
    /// Upper bound for any reconnect delay.
    pub max_reconnect_delay: Duration,
    /// Consecutive auth rejections tolerated before giving up.
    pub max_auth_retries: u32,
    /// Consecutive network failures tolerated before giving up. `None` = unlimited.
    pub max_reconnect_attempts: Option<u32>,
    /// How long a snapshot may go without a fresh sample before it is stale.
    pub staleness_window: Duration,
    /// Countdown recomputation interval.
    pub tick_interval: Duration,
    /// Deadline for a single connect + handshake.
    pub connect_timeout: Duration,
    /// Floor applied to every speed used for ETA (m/s).
    pub min_speed_mps: f64,
    /// Speed assumed when a sample carries none (m/s).
    pub default_speed_mps: f64,
    /// Scale speeds by the time-of-day traffic heuristic.
    pub traffic_adjustment: bool,
    /// Offset from UTC used to pick the traffic band.
    pub traffic_utc_offset_minutes: i32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            base_reconnect_delay: Duration::from_secs(1),
            max_reconnect_delay: Duration::from_secs(30),
            max_auth_retries: 5,
            max_reconnect_attempts: None,
            staleness_window: Duration::from_secs(30),
            tick_interval: Duration::from_secs(1),
            connect_timeout: Duration::from_secs(10),
            min_speed_mps: 2.0,
            default_speed_mps: 8.0,
            traffic_adjustment: true,
            traffic_utc_offset_minutes: 0,
        }
    }
}

impl EngineConfig {
    /// Reject settings the engine cannot run with.
    pub fn validate(&self) -> Result<(), CoreError> {
        let fail = |message: &str| {
            Err(CoreError::Config {
                message: message.to_owned(),
            })
        };

        if self.base_reconnect_delay.is_zero() {
            return fail("base_reconnect_delay must be greater than zero");
        }
        if self.max_reconnect_delay < self.base_reconnect_delay {
            return fail("max_reconnect_delay must not be shorter than base_reconnect_delay");
        }
        if self.tick_interval.is_zero() {
            return fail("tick_interval must be greater than zero");
        }
        if self.connect_timeout.is_zero() {
            return fail("connect_timeout must be greater than zero");
        }
        if !self.min_speed_mps.is_finite() || self.min_speed_mps <= 0.0 {
            return fail("min_speed_mps must be a positive number");
        }
        if !self.default_speed_mps.is_finite() || self.default_speed_mps <= 0.0 {
            return fail("default_speed_mps must be a positive number");
        }
        // chrono::FixedOffset accepts strictly less than a day.
        if self.traffic_utc_offset_minutes.abs() >= 24 * 60 {
            return fail("traffic_utc_offset_minutes must be within ±1439");
        }
        Ok(())
    }
}
