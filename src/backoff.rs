//! Jittered exponential backoff (spec §3 `ReconnectBackoff`), shared by the
//! connection pool's reconnect scheduling (C5) and the retry engine's
//! `TRYAGAIN`/`CLUSTERDOWN` delay (C7, spec §4.9 "Retry loops").

use std::time::Duration;

use rand::Rng;

#[derive(Debug, Clone, Copy)]
pub struct ReconnectBackoff {
    pub num_retries: u32,
    pub exponent_base: f64,
    pub factor: f64,
    pub jitter_percent: f64,
    attempt_count: u32,
}

impl Default for ReconnectBackoff {
    fn default() -> Self {
        ReconnectBackoff {
            num_retries: 12,
            exponent_base: 2.0,
            factor: 100.0,
            jitter_percent: 0.2,
            attempt_count: 0,
        }
    }
}

impl ReconnectBackoff {
    pub fn new(num_retries: u32, exponent_base: f64, factor: f64, jitter_percent: f64) -> Self {
        ReconnectBackoff {
            num_retries,
            exponent_base,
            factor,
            jitter_percent,
            attempt_count: 0,
        }
    }

    /// Cap on a single delay, independent of how many attempts have elapsed.
    const CAP_MS: f64 = 30_000.0;

    /// `min(cap, factor * exponent_base^attempt_count) * (1 + uniform(-jitter, +jitter))`.
    pub fn next_delay(&mut self) -> Duration {
        let raw = self.factor * self.exponent_base.powi(self.attempt_count as i32);
        let capped = raw.min(Self::CAP_MS);
        self.attempt_count = self.attempt_count.saturating_add(1);

        let jitter = if self.jitter_percent > 0.0 {
            rand::thread_rng().gen_range(-self.jitter_percent..=self.jitter_percent)
        } else {
            0.0
        };
        let millis = (capped * (1.0 + jitter)).max(0.0);
        Duration::from_millis(millis as u64)
    }

    pub fn attempt_count(&self) -> u32 {
        self.attempt_count
    }

    pub fn exhausted(&self) -> bool {
        self.attempt_count >= self.num_retries
    }

    pub fn reset(&mut self) {
        self.attempt_count = 0;
    }
}
