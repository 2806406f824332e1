use std::time::Duration;

/// Exponential retry delay with a ceiling.
///
/// The n-th consecutive failure waits `initial * multiplier^(n-1)`, capped at
/// `ceiling`. A successful drain resets the sequence.
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    ceiling: Duration,
    multiplier: f64,
    failures: u32,
}

impl Backoff {
    pub fn new(initial: Duration, ceiling: Duration, multiplier: f64) -> Self {
        Self {
            initial,
            ceiling: ceiling.max(initial),
            multiplier: if multiplier > 1.0 { multiplier } else { 2.0 },
            failures: 0,
        }
    }

    /// Record a failure and return the delay before the next attempt.
    pub fn next_delay(&mut self) -> Duration {
        self.failures = self.failures.saturating_add(1);
        let exponent = (self.failures - 1).min(i32::MAX as u32) as i32;
        let raw_ms = self.initial.as_millis() as f64 * self.multiplier.powi(exponent);
        let ceiling_ms = self.ceiling.as_millis() as f64;
        if !raw_ms.is_finite() || raw_ms >= ceiling_ms {
            self.ceiling
        } else {
            Duration::from_millis(raw_ms.round() as u64)
        }
    }

    /// Consecutive failures since the last reset.
    pub fn failures(&self) -> u32 {
        self.failures
    }

    pub fn reset(&mut self) {
        self.failures = 0;
    }
}
