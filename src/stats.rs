// Copyright 2022-2024 Protocol Labs
// SPDX-License-Identifier: MIT
//! Prometheus metrics for the connection pool, circuit relay, and plumtree
//! router (§2's component breakdown; ambient observability stack per the
//! teacher crate's `stats.rs`).

use lazy_static::lazy_static;
use prometheus::{IntCounter, IntGauge, Registry};

macro_rules! metrics {
    ($($name:ident : $type:ty = $make:expr);* $(;)?) => {
        $(
          lazy_static! {
            pub static ref $name: $type = $make.unwrap();
          }
        )*

        pub fn register_metrics(registry: &Registry) -> anyhow::Result<()> {
          $(registry.register(Box::new($name.clone()))?;)*
          Ok(())
        }
    };
}

metrics! {
    POOL_CONNECTED_PEERS: IntGauge =
        IntGauge::new("pool_connected_peers", "Number of currently connected peers");

    POOL_TRIMMED_CONNECTIONS: IntCounter =
        IntCounter::new("pool_trimmed_connections", "Number of connections trimmed for exceeding the high watermark");

    POOL_RECONNECT_ATTEMPTS: IntCounter =
        IntCounter::new("pool_reconnect_attempts", "Number of auto-reconnect attempts started");

    POOL_RECONNECT_SUCCESS: IntCounter =
        IntCounter::new("pool_reconnect_success", "Number of auto-reconnect attempts that succeeded");

    POOL_RECONNECT_FAILURE: IntCounter =
        IntCounter::new("pool_reconnect_failure", "Number of auto-reconnect attempts that exhausted their retries");

    HEALTH_PROBE_SUCCESS: IntCounter =
        IntCounter::new("health_probe_success", "Number of successful health probes");

    HEALTH_PROBE_FAILURE: IntCounter =
        IntCounter::new("health_probe_failure", "Number of failed health probes");

    HEALTH_CHECK_FAILED_PEERS: IntCounter =
        IntCounter::new("health_check_failed_peers", "Number of peers reported unhealthy after exceeding max_failures");

    RELAY_RESERVATIONS_ACTIVE: IntGauge =
        IntGauge::new("relay_reservations_active", "Number of reservations currently held by the relay server");

    RELAY_RESERVATION_ACCEPTED: IntCounter =
        IntCounter::new("relay_reservation_accepted", "Number of RESERVE requests accepted");

    RELAY_RESERVATION_DENIED: IntCounter =
        IntCounter::new("relay_reservation_denied", "Number of RESERVE requests denied for resource limits");

    RELAY_CIRCUITS_ACTIVE: IntGauge =
        IntGauge::new("relay_circuits_active", "Number of circuits currently being relayed");

    RELAY_CIRCUIT_OPENED: IntCounter =
        IntCounter::new("relay_circuit_opened", "Number of circuits opened by the relay server");

    RELAY_CIRCUIT_COMPLETED: IntCounter =
        IntCounter::new("relay_circuit_completed", "Number of circuits that completed relaying");

    RELAY_CIRCUIT_FAILED: IntCounter =
        IntCounter::new("relay_circuit_failed", "Number of circuit attempts that failed to establish");

    RELAY_BYTES_RELAYED: IntCounter =
        IntCounter::new("relay_bytes_relayed", "Total bytes copied across all relayed circuits");

    PLUMTREE_MESSAGES_PUBLISHED: IntCounter =
        IntCounter::new("plumtree_messages_published", "Number of messages published locally");

    PLUMTREE_MESSAGES_RECEIVED: IntCounter =
        IntCounter::new("plumtree_messages_received", "Number of distinct gossip messages delivered to subscribers");

    PLUMTREE_MESSAGES_DUPLICATE: IntCounter =
        IntCounter::new("plumtree_messages_duplicate", "Number of duplicate gossip messages observed");

    PLUMTREE_GRAFT_SENT: IntCounter =
        IntCounter::new("plumtree_graft_sent", "Number of GRAFT messages sent");

    PLUMTREE_GRAFT_RECEIVED: IntCounter =
        IntCounter::new("plumtree_graft_received", "Number of GRAFT messages received");

    PLUMTREE_PRUNE_SENT: IntCounter =
        IntCounter::new("plumtree_prune_sent", "Number of PRUNE messages sent");

    PLUMTREE_PRUNE_RECEIVED: IntCounter =
        IntCounter::new("plumtree_prune_received", "Number of PRUNE messages received");

    PLUMTREE_IHAVE_TIMEOUT: IntCounter =
        IntCounter::new("plumtree_ihave_timeout", "Number of pending IHave entries that timed out and triggered a GRAFT");

    TLS_HANDSHAKE_VERIFIED: IntCounter =
        IntCounter::new("tls_handshake_verified", "Number of peer certificates whose libp2p signed-key extension verified");

    TLS_HANDSHAKE_REJECTED: IntCounter =
        IntCounter::new("tls_handshake_rejected", "Number of peer certificates rejected during libp2p identity verification");
}
