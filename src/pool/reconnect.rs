// Copyright 2022-2024 Protocol Labs
// SPDX-License-Identifier: MIT
//! Auto-reconnect policy (§4.3).

use std::time::Duration;

use crate::pool::backoff::BackoffStrategy;
use crate::pool::DisconnectReason;

/// Whether and how aggressively the pool should auto-reconnect a peer
/// after it disconnects.
#[derive(Debug, Clone, Copy)]
pub struct ReconnectionPolicy {
    pub enabled: bool,
    pub max_retries: u32,
    pub backoff: BackoffStrategy,
    pub reset_threshold: Duration,
}

impl Default for ReconnectionPolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            max_retries: 10,
            backoff: BackoffStrategy::exponential_default(),
            reset_threshold: Duration::from_secs(30),
        }
    }
}

// §9 open question: the structural equality check intentionally excludes
// `backoff` — whether the original omission was deliberate is unresolved,
// so equality here is defined the same way rather than guessed differently.
impl PartialEq for ReconnectionPolicy {
    fn eq(&self, other: &Self) -> bool {
        self.enabled == other.enabled
            && self.max_retries == other.max_retries
            && self.reset_threshold == other.reset_threshold
    }
}

impl ReconnectionPolicy {
    /// Whether a reconnect should be attempted for this attempt count and
    /// disconnect reason (§4.3).
    pub fn should_reconnect(&self, attempt: u32, reason: &DisconnectReason) -> bool {
        self.enabled
            && attempt < self.max_retries
            && !matches!(
                reason,
                DisconnectReason::LocalClose
                    | DisconnectReason::Gated(_)
                    | DisconnectReason::ConnectionLimitExceeded
            )
    }

    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        self.backoff.delay(attempt, 0.1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interfaces::GateStage;

    #[test]
    fn gated_and_local_close_never_reconnect() {
        let policy = ReconnectionPolicy {
            max_retries: 3,
            ..Default::default()
        };
        assert!(!policy.should_reconnect(0, &DisconnectReason::Gated(GateStage::Secured)));
        assert!(!policy.should_reconnect(0, &DisconnectReason::LocalClose));
        assert!(!policy.should_reconnect(0, &DisconnectReason::ConnectionLimitExceeded));
    }

    #[test]
    fn recoverable_reasons_reconnect_until_retries_exhausted() {
        let policy = ReconnectionPolicy {
            max_retries: 2,
            ..Default::default()
        };
        assert!(policy.should_reconnect(0, &DisconnectReason::Timeout));
        assert!(policy.should_reconnect(1, &DisconnectReason::Timeout));
        assert!(!policy.should_reconnect(2, &DisconnectReason::Timeout));
    }
}
