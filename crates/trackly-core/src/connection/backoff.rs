use std::time::Duration;

/// ±20% spread applied to every delay.
const JITTER_FACTOR: f64 = 0.2;

/// Exponential reconnect delay with jitter.
///
/// Attempt `n` (zero-based) waits `min(base * 2^n, max) * (1 ± 0.2)`,
/// never exceeding `max`.
#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    max: Duration,
    attempt: u32,
    rng_state: u64,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        let seed = uuid::Uuid::new_v4().as_u64_pair().0;
        Self::with_seed(base, max, seed)
    }

    /// Deterministic jitter sequence, for tests.
    pub fn with_seed(base: Duration, max: Duration, seed: u64) -> Self {
        Self {
            base,
            max,
            attempt: 0,
            // xorshift never leaves zero
            rng_state: seed.max(1),
        }
    }

    /// xorshift64, mapped to `[0, 1]`.
    #[allow(clippy::cast_precision_loss, clippy::as_conversions)]
    fn next_random(&mut self) -> f64 {
        self.rng_state ^= self.rng_state << 13;
        self.rng_state ^= self.rng_state >> 7;
        self.rng_state ^= self.rng_state << 17;
        self.rng_state as f64 / u64::MAX as f64
    }

    /// Delay before the next attempt without jitter.
    pub fn nominal(&self) -> Duration {
        let factor = 2_f64.powi(i32::try_from(self.attempt.min(62)).unwrap_or(62));
        let raw = self.base.as_secs_f64() * factor;
        Duration::from_secs_f64(raw.min(self.max.as_secs_f64()))
    }

    /// Delay before the next attempt; advances the attempt counter.
    pub fn next_delay(&mut self) -> Duration {
        let capped = self.nominal().as_secs_f64();
        let jitter = (self.next_random() * 2.0 - 1.0) * JITTER_FACTOR * capped;
        let secs = (capped + jitter).clamp(0.0, self.max.as_secs_f64());
        self.attempt = self.attempt.saturating_add(1);
        Duration::from_secs_f64(secs)
    }

    /// Reset after a successful connection.
    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    /// Number of delays handed out since the last reset.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }
}
