// Copyright 2022-2024 Protocol Labs
// SPDX-License-Identifier: MIT
//! Per-peer dial backoff (§4.2).

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use rand::Rng;

use crate::peer::PeerId;

/// The shape of the backoff delay curve as a function of attempt count.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum BackoffStrategy {
    Exponential {
        base: Duration,
        multiplier: f64,
        max: Duration,
    },
    Constant(Duration),
    Linear {
        base: Duration,
        increment: Duration,
        max: Duration,
    },
}

impl BackoffStrategy {
    pub fn exponential_default() -> Self {
        Self::Exponential {
            base: Duration::from_millis(100),
            multiplier: 2.0,
            max: Duration::from_secs(300),
        }
    }

    /// Delay for the given zero-based `attempt`, before jitter (§4.2).
    fn raw_delay(&self, attempt: u32) -> Duration {
        match *self {
            BackoffStrategy::Exponential { base, multiplier, max } => {
                let scaled = base.as_secs_f64() * multiplier.powi(attempt as i32);
                Duration::from_secs_f64(scaled.min(max.as_secs_f64()))
            }
            BackoffStrategy::Constant(d) => d,
            BackoffStrategy::Linear { base, increment, max } => {
                let scaled = base.as_secs_f64() + increment.as_secs_f64() * attempt as f64;
                Duration::from_secs_f64(scaled.min(max.as_secs_f64()))
            }
        }
    }

    /// Delay for `attempt` with symmetric jitter `±jitter` applied (§4.2).
    pub fn delay(&self, attempt: u32, jitter: f64) -> Duration {
        let raw = self.raw_delay(attempt);
        if jitter <= 0.0 {
            return raw;
        }
        let factor = 1.0 + rand::thread_rng().gen_range(-jitter..=jitter);
        Duration::from_secs_f64((raw.as_secs_f64() * factor).max(0.0))
    }
}

struct Entry {
    attempts: u32,
    backoff_until: Instant,
}

/// Tracks whether a peer should currently be suppressed from redialing.
pub struct DialBackoff {
    strategy: BackoffStrategy,
    jitter: f64,
    entries: Mutex<HashMap<PeerId, Entry>>,
}

impl DialBackoff {
    pub fn new(strategy: BackoffStrategy, jitter: f64) -> Self {
        Self {
            strategy,
            jitter,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// True if `peer` is still within its backoff window; evicts the entry
    /// lazily if it has expired (§4.2).
    pub fn should_back_off(&self, peer: &PeerId) -> bool {
        let mut entries = self.entries.lock().unwrap();
        match entries.get(peer) {
            Some(entry) if Instant::now() < entry.backoff_until => true,
            Some(_) => {
                entries.remove(peer);
                false
            }
            None => false,
        }
    }

    pub fn record_failure(&self, peer: PeerId) {
        let mut entries = self.entries.lock().unwrap();
        let entry = entries.entry(peer).or_insert(Entry {
            attempts: 0,
            backoff_until: Instant::now(),
        });
        let delay = self.strategy.delay(entry.attempts, self.jitter);
        entry.attempts += 1;
        entry.backoff_until = Instant::now() + delay;
    }

    pub fn record_success(&self, peer: &PeerId) {
        self.entries.lock().unwrap().remove(peer);
    }

    pub fn failure_count(&self, peer: &PeerId) -> u32 {
        self.entries
            .lock()
            .unwrap()
            .get(peer)
            .map(|e| e.attempts)
            .unwrap_or(0)
    }

    /// Purges entries whose backoff window has already elapsed.
    pub fn cleanup(&self) {
        let now = Instant::now();
        self.entries.lock().unwrap().retain(|_, e| e.backoff_until > now);
    }

    pub fn clear(&self) {
        self.entries.lock().unwrap().clear();
    }

    /// A snapshot of current failure counts, for diagnostics.
    pub fn snapshot(&self) -> HashMap<PeerId, u32> {
        self.entries
            .lock()
            .unwrap()
            .iter()
            .map(|(p, e)| (*p, e.attempts))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_strategy_delays_fall_within_jitter_bounds() {
        let strategy = BackoffStrategy::exponential_default();
        for (attempt, lo, hi) in [(0, 0.090, 0.110), (1, 0.180, 0.220), (2, 0.360, 0.440)] {
            for _ in 0..50 {
                let d = strategy.delay(attempt, 0.1).as_secs_f64();
                assert!(d >= lo && d <= hi, "attempt {attempt}: {d} not in [{lo}, {hi}]");
            }
        }
    }

    #[test]
    fn should_back_off_is_monotone_until_success() {
        let backoff = DialBackoff::new(BackoffStrategy::Constant(Duration::from_millis(50)), 0.0);
        let peer = PeerId::random();
        assert!(!backoff.should_back_off(&peer));
        backoff.record_failure(peer);
        assert!(backoff.should_back_off(&peer));
        assert_eq!(backoff.failure_count(&peer), 1);
        backoff.record_success(&peer);
        assert!(!backoff.should_back_off(&peer));
    }
}
