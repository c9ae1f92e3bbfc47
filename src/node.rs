// Copyright 2022-2024 Protocol Labs
// SPDX-License-Identifier: MIT
//! The single owning coordinator (§2, §9): wires the connection pool, the
//! relay client and server, and the plumtree service to one set of
//! collaborators, and owns the timers that span more than one component
//! (reservation expiration, reservation sweeping) so no sub-component needs
//! a reference back into another.

use std::sync::Arc;
use std::time::Duration;

use log::debug;
use prometheus::Registry;
use tokio::sync::mpsc;

use crate::error::RelayError;
use crate::interfaces::{PeerStore, PingProvider, StreamOpener};
use crate::peer::PeerId;
use crate::plumtree::{PlumtreeConfig, PlumtreeService};
use crate::pool::{
    ConnectionLimits, ConnectionPool, DialBackoff, HealthMonitor, HealthMonitorConfig,
};
use crate::relay::{
    CircuitLimit, RelayClient, RelayClientEvent, RelayServer, RelayServerConfig, RelayServerEvent,
    Reservation,
};

/// Configuration for every sub-component a [`Node`] owns (§9 "plain `Clone +
/// Debug` config structs" convention).
#[derive(Debug, Clone)]
pub struct NodeConfig {
    pub connection_limits: ConnectionLimits,
    pub health_monitor: HealthMonitorConfig,
    pub relay_server: RelayServerConfig,
    pub relay_client_default_limit: CircuitLimit,
    pub plumtree: PlumtreeConfig,
    pub reservation_sweep_interval: Duration,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            connection_limits: ConnectionLimits::default(),
            health_monitor: HealthMonitorConfig::default(),
            relay_server: RelayServerConfig::default(),
            relay_client_default_limit: RelayServerConfig::default().circuit_limit,
            plumtree: PlumtreeConfig::default(),
            reservation_sweep_interval: Duration::from_secs(60),
        }
    }
}

/// The receivers a caller subscribes to once, handed back from [`Node::new`]
/// since each is a single-consumer `mpsc` channel (§6 events).
pub struct NodeEvents {
    pub relay_client: mpsc::UnboundedReceiver<RelayClientEvent>,
    pub relay_server: mpsc::UnboundedReceiver<RelayServerEvent>,
    pub health_failed: mpsc::UnboundedReceiver<PeerId>,
}

/// Owns every in-scope component and is the crate's single public entry
/// point for a host embedding it (§2). Sub-component state is still each
/// protected by its own mutex; `Node` only serializes the handful of
/// operations that span more than one component (e.g. reserving on a relay
/// and scheduling that reservation's expiry).
pub struct Node<O, P, Ping>
where
    O: StreamOpener + Clone + 'static,
    P: PeerStore + 'static,
    Ping: PingProvider + 'static,
{
    local_peer: PeerId,
    pool: Arc<ConnectionPool>,
    backoff: Arc<DialBackoff>,
    health: Arc<HealthMonitor<Ping>>,
    relay_client: Arc<RelayClient<O>>,
    relay_server: Arc<RelayServer<O, P>>,
    plumtree: Arc<PlumtreeService<O>>,
}

impl<O, P, Ping> Node<O, P, Ping>
where
    O: StreamOpener + Clone + 'static,
    P: PeerStore + 'static,
    Ping: PingProvider + 'static,
{
    pub fn new(
        local_peer: PeerId,
        opener: O,
        peer_store: P,
        ping: Arc<Ping>,
        config: NodeConfig,
    ) -> (Arc<Self>, NodeEvents) {
        let pool = Arc::new(ConnectionPool::new(config.connection_limits));
        let backoff = Arc::new(DialBackoff::new(
            crate::pool::BackoffStrategy::exponential_default(),
            0.1,
        ));
        let (health, health_failed) = HealthMonitor::new(ping, config.health_monitor);
        let health = Arc::new(health);

        let (relay_client, relay_client_events) =
            RelayClient::new(opener.clone(), config.relay_client_default_limit);
        let relay_client = Arc::new(relay_client);

        let (relay_server, relay_server_events) =
            RelayServer::new(local_peer, opener.clone(), peer_store, config.relay_server);
        let relay_server = Arc::new(relay_server);

        let plumtree = PlumtreeService::new(local_peer, config.plumtree, Arc::new(opener));

        let node = Arc::new(Self {
            local_peer,
            pool,
            backoff,
            health,
            relay_client,
            relay_server,
            plumtree,
        });

        node.clone().spawn_reservation_sweep(config.reservation_sweep_interval);

        (
            node,
            NodeEvents {
                relay_client: relay_client_events,
                relay_server: relay_server_events,
                health_failed,
            },
        )
    }

    pub fn local_peer(&self) -> PeerId {
        self.local_peer
    }

    pub fn pool(&self) -> &Arc<ConnectionPool> {
        &self.pool
    }

    pub fn backoff(&self) -> &Arc<DialBackoff> {
        &self.backoff
    }

    pub fn health(&self) -> &Arc<HealthMonitor<Ping>> {
        &self.health
    }

    pub fn relay_client(&self) -> &Arc<RelayClient<O>> {
        &self.relay_client
    }

    pub fn relay_server(&self) -> &Arc<RelayServer<O, P>> {
        &self.relay_server
    }

    pub fn plumtree(&self) -> &Arc<PlumtreeService<O>> {
        &self.plumtree
    }

    /// Registers every counter/gauge in [`crate::stats`] with `registry`, so
    /// a host only has to wire one `prometheus::Registry` regardless of how
    /// many components this crate owns.
    pub fn register_metrics(&self, registry: &Registry) -> anyhow::Result<()> {
        crate::stats::register_metrics(registry)
    }

    /// Requests a reservation and schedules its own expiry, so a forgotten
    /// reservation doesn't linger in the client's bookkeeping past its
    /// advertised lifetime (§4.5 `reserve`, the expiration task referenced
    /// in its doc comment but previously never scheduled by anything).
    pub async fn reserve(self: &Arc<Self>, relay: PeerId) -> Result<Reservation, RelayError> {
        let reservation = self.relay_client.reserve(relay).await?;
        let delay = Duration::from_secs(
            reservation
                .expiration
                .as_secs()
                .saturating_sub(crate::timestamp::Timestamp::now().as_secs()),
        );
        let client = self.relay_client.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            client.expire_reservation(&relay);
        });
        Ok(reservation)
    }

    fn spawn_reservation_sweep(self: Arc<Self>, interval: Duration) {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                let expired = self.relay_server.purge_expired_reservations();
                if !expired.is_empty() {
                    debug!("swept {} expired relay reservation(s)", expired.len());
                }
            }
        });
    }
}
