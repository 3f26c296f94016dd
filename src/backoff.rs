//! Capped exponential backoff with jitter, shared by every retry loop in
//! the pipeline: `ConnectError` reconnection and `SinkError` emit retries
//! both follow the same 100ms..30s, factor-2, +/-20% schedule from the
//! error-handling design.

use rand::Rng;
use std::time::Duration;

const BASE: Duration = Duration::from_millis(100);
const CAP: Duration = Duration::from_secs(30);
const FACTOR: u32 = 2;
const JITTER: f64 = 0.20;

/// An iterator-like backoff: call `next_delay()` once per failed attempt,
/// `reset()` once an attempt succeeds.
pub struct Backoff {
    attempt: u32,
}

impl Backoff {
    pub fn new() -> Self {
        Backoff { attempt: 0 }
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    /// The delay to wait before the next retry, with jitter applied, then
    /// advances the internal attempt counter.
    pub fn next_delay(&mut self) -> Duration {
        let exp = FACTOR.saturating_pow(self.attempt);
        let nominal = BASE.saturating_mul(exp).min(CAP);
        self.attempt = self.attempt.saturating_add(1);
        jittered(nominal)
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new()
    }
}

fn jittered(nominal: Duration) -> Duration {
    let millis = nominal.as_millis() as f64;
    let spread = millis * JITTER;
    let offset = rand::thread_rng().gen_range(-spread..=spread);
    Duration::from_millis((millis + offset).max(0.0) as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn grows_exponentially_and_caps() {
        let mut backoff = Backoff::new();
        let mut previous = Duration::ZERO;
        for _ in 0..4 {
            let delay = backoff.next_delay();
            assert!(delay >= previous.mul_f64(0.5), "delay should trend upward: {delay:?} after {previous:?}");
            previous = delay;
        }
        // After enough attempts, the nominal value is clamped to CAP
        // (jitter can still push the observed delay slightly above it).
        let mut backoff = Backoff::new();
        for _ in 0..20 {
            backoff.next_delay();
        }
        let delay = backoff.next_delay();
        assert!(delay <= CAP.mul_f64(1.0 + JITTER + 0.01));
    }

    #[test]
    fn reset_returns_to_the_base_delay() {
        let mut backoff = Backoff::new();
        backoff.next_delay();
        backoff.next_delay();
        backoff.reset();
        let delay = backoff.next_delay();
        assert!(delay <= BASE.mul_f64(1.0 + JITTER + 0.01));
    }
}
