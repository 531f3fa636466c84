//! Redial pacing after a tied duplicate connection.
//!
//! When both ends drop a duplicate pair because the tie-break was `Tied`,
//! redialling immediately tends to tie again. Each side waits
//! `base * 2^(attempt)` (capped at `max`) plus up to 50% random jitter, so
//! the two redials drift apart.

use std::time::Duration;

use rand::Rng;

#[derive(Debug, Clone)]
pub struct TieBackoff {
    base: Duration,
    max: Duration,
    attempt: u32,
}

impl Default for TieBackoff {
    fn default() -> Self {
        Self::new(Duration::from_millis(200), Duration::from_secs(30))
    }
}

impl TieBackoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max: max.max(base),
            attempt: 0,
        }
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Delay before the next redial. Advances the attempt counter.
    pub fn next_delay(&mut self) -> Duration {
        let exp = self.base.saturating_mul(1u32 << self.attempt.min(16));
        let capped = exp.min(self.max);
        self.attempt = self.attempt.saturating_add(1);

        let jitter_ms = (capped.as_millis() / 2) as u64;
        let jitter = if jitter_ms == 0 {
            Duration::ZERO
        } else {
            Duration::from_millis(rand::thread_rng().gen_range(0..=jitter_ms))
        };
        (capped + jitter).min(self.max)
    }

    /// Start over after a connection survived.
    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}
