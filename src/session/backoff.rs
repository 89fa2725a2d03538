use std::time::Duration;

pub const DEFAULT_INITIAL_DELAY: Duration = Duration::from_secs(60);
pub const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(7200);
pub const DEFAULT_MULTIPLIER: u32 = 4;

/// Delay before the next discovery attempt: `initial * multiplier^attempt`, capped.
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    multiplier: u32,
    attempt: u32,
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(DEFAULT_INITIAL_DELAY, DEFAULT_MAX_DELAY, DEFAULT_MULTIPLIER)
    }
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration, multiplier: u32) -> Self {
        Self {
            initial,
            max,
            multiplier: multiplier.max(1),
            attempt: 0,
        }
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Delay for the current attempt; advances the attempt counter.
    pub fn next_delay(&mut self) -> Duration {
        let factor = self
            .multiplier
            .checked_pow(self.attempt)
            .unwrap_or(u32::MAX);
        let delay = self
            .initial
            .checked_mul(factor)
            .unwrap_or(self.max)
            .min(self.max);
        self.attempt = self.attempt.saturating_add(1);
        delay
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}
