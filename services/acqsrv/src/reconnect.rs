//! Reconnect backoff
//!
//! Bounded exponential backoff with jitter for module readers. The counter
//! resets on a successful poll, so a flapping device pays the full ladder
//! every time while a healthy one never waits.

use enviro_config::BackoffConfig;
use rand::Rng;
use std::time::Duration;

/// Exponential backoff state for one connection.
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    multiplier: f64,
    jitter_pct: u32,
    attempt: u32,
}

impl Backoff {
    pub fn new(config: &BackoffConfig) -> Self {
        Self {
            initial: Duration::from_millis(config.initial_ms),
            max: Duration::from_millis(config.max_ms),
            multiplier: config.multiplier,
            jitter_pct: config.jitter_pct,
            attempt: 0,
        }
    }

    /// Delay before the next reconnect attempt, advancing the ladder.
    ///
    /// Never exceeds `max × (1 + jitter_pct/100)`.
    pub fn next_delay(&mut self) -> Duration {
        let exponent = self.attempt.min(31);
        self.attempt = self.attempt.saturating_add(1);
        let raw = self.initial.mul_f64(self.multiplier.powi(exponent as i32));
        let capped = raw.min(self.max);
        if self.jitter_pct == 0 {
            return capped;
        }
        let spread = f64::from(self.jitter_pct) / 100.0;
        let factor = 1.0 + rand::thread_rng().gen_range(-spread..=spread);
        capped.mul_f64(factor.max(0.0))
    }

    /// Reset after a successful poll.
    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(jitter_pct: u32) -> BackoffConfig {
        BackoffConfig {
            initial_ms: 1000,
            max_ms: 30_000,
            multiplier: 2.0,
            jitter_pct,
        }
    }

    #[test]
    fn exponential_ladder_without_jitter() {
        let mut backoff = Backoff::new(&config(0));
        assert_eq!(backoff.next_delay(), Duration::from_secs(1));
        assert_eq!(backoff.next_delay(), Duration::from_secs(2));
        assert_eq!(backoff.next_delay(), Duration::from_secs(4));
        assert_eq!(backoff.next_delay(), Duration::from_secs(8));
        assert_eq!(backoff.next_delay(), Duration::from_secs(16));
        // Capped from here on
        assert_eq!(backoff.next_delay(), Duration::from_secs(30));
        assert_eq!(backoff.next_delay(), Duration::from_secs(30));
    }

    #[test]
    fn reset_restarts_ladder() {
        let mut backoff = Backoff::new(&config(0));
        backoff.next_delay();
        backoff.next_delay();
        backoff.reset();
        assert_eq!(backoff.next_delay(), Duration::from_secs(1));
    }

    #[test]
    fn jitter_stays_within_bound() {
        let mut backoff = Backoff::new(&config(20));
        let upper = Duration::from_millis(30_000).mul_f64(1.2);
        for _ in 0..200 {
            let delay = backoff.next_delay();
            assert!(delay <= upper, "delay {delay:?} above jitter bound");
        }
    }

    #[test]
    fn jitter_spreads_around_base() {
        let mut backoff = Backoff::new(&config(20));
        let first = backoff.next_delay();
        assert!(first >= Duration::from_millis(800));
        assert!(first <= Duration::from_millis(1200));
    }
}
