//! Exponential reconnect backoff with jitter.

use std::time::Duration;

use rand::Rng;

use crate::config::ReconnectConfig;

/// Computes successive reconnect delays.
///
/// Each delay is `base * factor^attempt`, jittered by up to `±jitter` and
/// capped at `max_delay`. Delays never decrease within one outage, so
/// jitter cannot pull a later attempt in ahead of an earlier one.
#[derive(Debug, Clone)]
pub struct Backoff {
    config: ReconnectConfig,
    attempt: u32,
    last: Duration,
}

impl Backoff {
    #[must_use]
    pub const fn new(config: ReconnectConfig) -> Self {
        Self {
            config,
            attempt: 0,
            last: Duration::ZERO,
        }
    }

    /// Returns the next delay using a random jitter sample.
    pub fn next_delay(&mut self) -> Duration {
        let unit = rand::rng().random_range(-1.0..=1.0);
        self.next_delay_with(unit)
    }

    /// Returns the next delay using a caller-supplied jitter sample in
    /// `-1.0..=1.0`.
    pub fn next_delay_with(&mut self, unit: f64) -> Duration {
        let raw = delay_for(&self.config, self.attempt, unit);
        self.attempt = self.attempt.saturating_add(1);
        let delay = raw.max(self.last).min(self.config.max_delay);
        self.last = delay;
        delay
    }

    /// Starts the schedule over, after a stable connection.
    pub const fn reset(&mut self) {
        self.attempt = 0;
        self.last = Duration::ZERO;
    }

    /// Number of delays handed out since the last reset.
    #[must_use]
    pub const fn attempt(&self) -> u32 {
        self.attempt
    }
}

/// Delay for `attempt` (zero-based) before the monotonic clamp, rounded to
/// whole milliseconds.
#[must_use]
#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss, clippy::cast_precision_loss)]
pub fn delay_for(config: &ReconnectConfig, attempt: u32, unit: f64) -> Duration {
    let exponent = i32::try_from(attempt.min(64)).unwrap_or(64);
    let nominal_ms = config.base_delay.as_millis() as f64 * config.factor.powi(exponent);
    let spread = config.jitter * unit.clamp(-1.0, 1.0);
    let jittered_ms = (nominal_ms * (1.0 + spread)).round();
    let cap_ms = config.max_delay.as_millis() as f64;
    if jittered_ms.is_finite() {
        Duration::from_millis(jittered_ms.clamp(0.0, cap_ms) as u64)
    } else {
        config.max_delay
    }
}
