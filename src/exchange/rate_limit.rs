//! Generic order-placement rate limiter.
//!
//! Counters are keyed by arbitrary strings: pair names plus the synthetic
//! window keys below. Every placement bumps the pair counter and both window
//! counters; a background task decays all counters at a fixed cadence, so a
//! ceiling of N with a 1 Hz decay allows a sustained rate of one placement
//! per second with bursts up to N.

use std::collections::HashMap;
use std::sync::Mutex;

/// Short-window counter key.
pub const WINDOW_SECOND: &str = "second";
/// Long-window counter key.
pub const WINDOW_HOUR: &str = "hour";
/// Ceiling key that every per-pair counter is compared against.
pub const WINDOW_GLOBAL: &str = "global";

pub struct RateLimiter {
    ceilings: HashMap<String, u32>,
    counters: Mutex<HashMap<String, u32>>,
}

impl RateLimiter {
    /// A limiter with no ceilings permits everything.
    pub fn new(ceilings: HashMap<String, u32>) -> Self {
        Self {
            ceilings,
            counters: Mutex::new(HashMap::new()),
        }
    }

    pub fn is_enabled(&self) -> bool {
        !self.ceilings.is_empty()
    }

    /// Whether a placement on `pair` fits under the ceilings right now.
    /// Per-pair counters are checked against the global ceiling.
    pub fn can_place(&self, pair: &str) -> bool {
        if self.ceilings.is_empty() {
            return true;
        }
        let counters = self.counters.lock().unwrap();
        let count = |key: &str| counters.get(key).copied().unwrap_or(0);
        let ceiling = |key: &str| self.ceilings.get(key).copied().unwrap_or(u32::MAX);

        count(pair) < ceiling(WINDOW_GLOBAL)
            && count(WINDOW_SECOND) < ceiling(WINDOW_SECOND)
            && count(WINDOW_HOUR) < ceiling(WINDOW_HOUR)
    }

    /// Records one placement on `pair`.
    pub fn record(&self, pair: &str) {
        let mut counters = self.counters.lock().unwrap();
        for key in [pair, WINDOW_SECOND, WINDOW_HOUR] {
            *counters.entry(key.to_string()).or_insert(0) += 1;
        }
    }

    /// One decay tick: every counter drops by one, floored at zero.
    pub fn decay(&self) {
        let mut counters = self.counters.lock().unwrap();
        counters.retain(|_, count| {
            *count = count.saturating_sub(1);
            *count > 0
        });
    }

    /// Current counters, for diagnostics in rate-limit notifications.
    pub fn counters(&self) -> HashMap<String, u32> {
        self.counters.lock().unwrap().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limiter(global: u32, second: u32, hour: u32) -> RateLimiter {
        RateLimiter::new(HashMap::from([
            (WINDOW_GLOBAL.to_string(), global),
            (WINDOW_SECOND.to_string(), second),
            (WINDOW_HOUR.to_string(), hour),
        ]))
    }

    #[test]
    fn no_ceilings_means_no_limits() {
        let limiter = RateLimiter::new(HashMap::new());
        for _ in 0..1000 {
            limiter.record("BTC/USD");
        }
        assert!(limiter.can_place("BTC/USD"));
        assert!(!limiter.is_enabled());
    }

    #[test]
    fn pair_counter_is_held_to_the_global_ceiling() {
        let limiter = limiter(2, 100, 100);
        assert!(limiter.can_place("BTC/USD"));
        limiter.record("BTC/USD");
        limiter.record("BTC/USD");
        assert!(!limiter.can_place("BTC/USD"));
        // Another pair has its own counter but shares the windows.
        assert!(limiter.can_place("ETH/USD"));
    }

    #[test]
    fn window_ceilings_apply_across_pairs() {
        let limiter = limiter(100, 2, 100);
        limiter.record("BTC/USD");
        limiter.record("ETH/USD");
        assert!(!limiter.can_place("SOL/USD"));
    }

    #[test]
    fn decay_restores_headroom_and_drops_empty_counters() {
        let limiter = limiter(1, 100, 100);
        limiter.record("BTC/USD");
        assert!(!limiter.can_place("BTC/USD"));
        limiter.decay();
        assert!(limiter.can_place("BTC/USD"));
        assert!(limiter.counters().is_empty());
    }
}
