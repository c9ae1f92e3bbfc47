// Copyright 2022-2024 Protocol Labs
// SPDX-License-Identifier: MIT
//! Connection pool configuration (§3, §6 defaults).

use std::time::Duration;

/// Immutable limits enforced by the pool's trimming and admission logic.
#[derive(Debug, Clone, Copy)]
pub struct ConnectionLimits {
    pub high_watermark: usize,
    pub low_watermark: usize,
    pub max_per_peer: usize,
    pub max_inbound: Option<usize>,
    pub max_outbound: Option<usize>,
    pub grace_period: Duration,
}

impl Default for ConnectionLimits {
    fn default() -> Self {
        Self {
            high_watermark: 100,
            low_watermark: 80,
            max_per_peer: 2,
            max_inbound: None,
            max_outbound: None,
            grace_period: Duration::from_secs(30),
        }
    }
}

impl ConnectionLimits {
    /// Panics if constructed with `low_watermark > high_watermark` or
    /// `max_per_peer == 0`; both are required invariants (§3).
    pub fn validated(self) -> Self {
        assert!(
            self.low_watermark <= self.high_watermark,
            "lowWatermark must be <= highWatermark"
        );
        assert!(self.max_per_peer > 0, "maxPerPeer must be > 0");
        self
    }
}
