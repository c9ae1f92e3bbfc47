// Copyright 2022-2024 Protocol Labs
// SPDX-License-Identifier: MIT
//! Connection pool: the authoritative registry of live and recent
//! connections (§4.1).

mod backoff;
mod health;
mod limits;
mod reconnect;

pub use backoff::{BackoffStrategy, DialBackoff};
pub use health::{HealthMonitor, HealthMonitorConfig};
pub use limits::ConnectionLimits;
pub use reconnect::ReconnectionPolicy;

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::Mutex as AsyncMutex;

use crate::interfaces::{Direction, GateStage, MuxedStream};
use crate::peer::{Multiaddr, PeerId};
use crate::stats;

/// A muxed connection handle shared out by [`ConnectionPool::connection`]/
/// [`ConnectionPool::connections`] (§4.1). Wrapped in `Arc<AsyncMutex<_>>`
/// rather than the exclusively-owned `Box<dyn MuxedStream>` the rest of the
/// crate uses, so the pool can hand out a *usable* handle to more than one
/// caller at once instead of narrowing those two operations to a presence
/// check — the same sharing pattern `relay/server.rs` and
/// `plumtree/service.rs` already use for a stream more than one task needs
/// to reach.
pub type SharedMuxedStream = Arc<AsyncMutex<Box<dyn MuxedStream>>>;

/// A monotonic handle identifying one tracked connection (§3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

/// Trim ordering ranks inbound before outbound (§4.1 step 4); the gater's
/// [`Direction`] doesn't carry an ordering of its own since gating has no
/// notion of rank, so the pool supplies one locally.
fn direction_rank(direction: Direction) -> u8 {
    match direction {
        Direction::Inbound => 0,
        Direction::Outbound => 1,
    }
}

/// Why a connection went away. Equality compares only the reason's
/// discriminant/code, not any attached description (§3).
#[derive(Debug, Clone)]
pub enum DisconnectReason {
    LocalClose,
    RemoteClose,
    Timeout,
    IdleTimeout,
    HealthCheckFailed,
    ConnectionLimitExceeded,
    Gated(GateStage),
    Error(u32, String),
}

impl PartialEq for DisconnectReason {
    fn eq(&self, other: &Self) -> bool {
        use DisconnectReason::*;
        match (self, other) {
            (LocalClose, LocalClose) => true,
            (RemoteClose, RemoteClose) => true,
            (Timeout, Timeout) => true,
            (IdleTimeout, IdleTimeout) => true,
            (HealthCheckFailed, HealthCheckFailed) => true,
            (ConnectionLimitExceeded, ConnectionLimitExceeded) => true,
            (Gated(a), Gated(b)) => a == b,
            (Error(a, _), Error(b, _)) => a == b,
            _ => false,
        }
    }
}
impl Eq for DisconnectReason {}

/// State machine for a single connection (§4.1).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Connected,
    Disconnected(DisconnectReason),
    Reconnecting { attempt: u32 },
    Failed(DisconnectReason),
}

impl ConnectionState {
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Connected)
    }
    pub fn is_connecting(&self) -> bool {
        matches!(self, ConnectionState::Connecting | ConnectionState::Reconnecting { .. })
    }
    pub fn is_disconnected(&self) -> bool {
        matches!(self, ConnectionState::Disconnected(_))
    }
    pub fn is_failed(&self) -> bool {
        matches!(self, ConnectionState::Failed(_))
    }

    /// Rank used when `connectionState(of: peer)` must pick one state among
    /// several entries: connected beats connecting/reconnecting beats any.
    fn priority(&self) -> u8 {
        match self {
            ConnectionState::Connected => 2,
            ConnectionState::Connecting | ConnectionState::Reconnecting { .. } => 1,
            _ => 0,
        }
    }
}

/// A single tracked connection, exclusively owned by the pool (§3). The
/// handle itself is shareable (see [`SharedMuxedStream`]) so
/// `managed_connection` can hand back a usable snapshot, not just metadata.
#[derive(Clone)]
pub struct ManagedConnection {
    pub id: ConnectionId,
    pub peer: PeerId,
    pub address: Multiaddr,
    pub direction: Direction,
    pub handle: Option<SharedMuxedStream>,
    pub state: ConnectionState,
    pub retry_count: u32,
    pub last_activity: Instant,
    pub connected_at: Instant,
    pub tags: HashSet<String>,
    pub is_protected: bool,
}

/// One entry in a [`ConnectionTrimReport`] (§4.1 step 5).
#[derive(Debug, Clone)]
pub struct TrimmedWithContext {
    pub id: ConnectionId,
    pub peer: PeerId,
    pub rank: usize,
    pub tag_count: usize,
    pub idle_duration: Duration,
    pub direction: Direction,
}

/// Diagnostic summary returned by `trim_if_needed` (§4.1).
#[derive(Debug, Clone, Default)]
pub struct ConnectionTrimReport {
    pub trimmed: Vec<TrimmedWithContext>,
    pub constrained: Option<TrimConstrained>,
}

#[derive(Debug, Clone)]
pub struct TrimConstrained {
    pub target: usize,
    pub selected: usize,
    pub trimmable: usize,
    pub active: usize,
}

struct PendingDial {
    task: tokio::task::JoinHandle<()>,
}

struct State {
    next_id: u64,
    connections: HashMap<ConnectionId, ManagedConnection>,
    peer_connections: HashMap<PeerId, HashSet<ConnectionId>>,
    pending_dials: HashMap<PeerId, PendingDial>,
    auto_reconnect: HashMap<PeerId, Multiaddr>,
}

impl Default for State {
    fn default() -> Self {
        Self {
            next_id: 0,
            connections: HashMap::new(),
            peer_connections: HashMap::new(),
            pending_dials: HashMap::new(),
            auto_reconnect: HashMap::new(),
        }
    }
}

/// Summary counters for observability (`ConnectionPool::stats`).
#[derive(Debug, Clone, Copy, Default)]
pub struct PoolStats {
    pub connected: usize,
    pub total_entries: usize,
    pub inbound: usize,
    pub outbound: usize,
}

/// Central registry of connections. All mutation happens under a single
/// lock on a plain state struct; nothing awaits while holding it (§5).
pub struct ConnectionPool {
    limits: ConnectionLimits,
    state: Mutex<State>,
}

impl ConnectionPool {
    pub fn new(limits: ConnectionLimits) -> Self {
        Self {
            limits: limits.validated(),
            state: Mutex::new(State::default()),
        }
    }

    pub fn limits(&self) -> ConnectionLimits {
        self.limits
    }

    pub fn add(
        &self,
        handle: Option<SharedMuxedStream>,
        peer: PeerId,
        address: Multiaddr,
        direction: Direction,
    ) -> ConnectionId {
        let mut state = self.state.lock().unwrap();
        let id = ConnectionId(state.next_id);
        state.next_id += 1;
        let now = Instant::now();
        state.connections.insert(
            id,
            ManagedConnection {
                id,
                peer,
                address,
                direction,
                handle,
                state: ConnectionState::Connected,
                retry_count: 0,
                last_activity: now,
                connected_at: now,
                tags: HashSet::new(),
                is_protected: false,
            },
        );
        state.peer_connections.entry(peer).or_default().insert(id);
        stats::POOL_CONNECTED_PEERS.set(state.peer_connections.len() as i64);
        id
    }

    pub fn remove(&self, id: ConnectionId) -> Option<ManagedConnection> {
        let mut state = self.state.lock().unwrap();
        self.remove_locked(&mut state, id)
    }

    fn remove_locked(&self, state: &mut State, id: ConnectionId) -> Option<ManagedConnection> {
        let conn = state.connections.remove(&id)?;
        if let Some(set) = state.peer_connections.get_mut(&conn.peer) {
            set.remove(&id);
            if set.is_empty() {
                state.peer_connections.remove(&conn.peer);
            }
        }
        stats::POOL_CONNECTED_PEERS.set(state.peer_connections.len() as i64);
        Some(conn)
    }

    pub fn remove_for_peer(&self, peer: &PeerId) -> Vec<ManagedConnection> {
        let mut state = self.state.lock().unwrap();
        let ids: Vec<ConnectionId> = state
            .peer_connections
            .get(peer)
            .map(|s| s.iter().copied().collect())
            .unwrap_or_default();
        ids.into_iter()
            .filter_map(|id| self.remove_locked(&mut state, id))
            .collect()
    }

    pub fn update_state(&self, id: ConnectionId, new_state: ConnectionState) {
        let mut state = self.state.lock().unwrap();
        let is_disconnected = new_state.is_disconnected();
        if let Some(conn) = state.connections.get_mut(&id) {
            conn.state = new_state;
            if is_disconnected {
                conn.last_activity = Instant::now();
            }
        }
    }

    pub fn update_connection(&self, id: ConnectionId, handle: SharedMuxedStream) {
        let mut state = self.state.lock().unwrap();
        if let Some(conn) = state.connections.get_mut(&id) {
            conn.handle = Some(handle);
            conn.state = ConnectionState::Connected;
            let now = Instant::now();
            conn.last_activity = now;
            conn.connected_at = now;
        }
    }

    /// Atomic lookup + activity record (§4.1, §9): returns the first
    /// connected entry for `peer` with a live handle, touching its
    /// `last_activity` in the same critical section. This eliminates the
    /// TOCTOU window a separate `recordActivity` call would open.
    pub fn connection(&self, peer: &PeerId) -> Option<SharedMuxedStream> {
        let mut state = self.state.lock().unwrap();
        let ids: Vec<ConnectionId> = state
            .peer_connections
            .get(peer)
            .map(|s| s.iter().copied().collect())
            .unwrap_or_default();
        for id in ids {
            if let Some(conn) = state.connections.get_mut(&id) {
                if conn.state.is_connected() {
                    if let Some(handle) = conn.handle.clone() {
                        conn.last_activity = Instant::now();
                        return Some(handle);
                    }
                }
            }
        }
        None
    }

    /// Every live, connected handle for `peer` (§4.1 `connections(to peer)`).
    pub fn connections(&self, peer: &PeerId) -> Vec<SharedMuxedStream> {
        let state = self.state.lock().unwrap();
        state
            .peer_connections
            .get(peer)
            .map(|ids| {
                ids.iter()
                    .filter_map(|id| state.connections.get(id))
                    .filter(|c| c.state.is_connected())
                    .filter_map(|c| c.handle.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// A snapshot of the tracked entry for `id`, if any (§4.1
    /// `managedConnection(id)`).
    pub fn managed_connection(&self, id: ConnectionId) -> Option<ManagedConnection> {
        self.state.lock().unwrap().connections.get(&id).cloned()
    }

    pub fn managed_connection_ids(&self, peer: &PeerId) -> Vec<ConnectionId> {
        self.state
            .lock()
            .unwrap()
            .peer_connections
            .get(peer)
            .map(|s| s.iter().copied().collect())
            .unwrap_or_default()
    }

    pub fn connection_state(&self, peer: &PeerId) -> Option<ConnectionState> {
        let state = self.state.lock().unwrap();
        state
            .peer_connections
            .get(peer)?
            .iter()
            .filter_map(|id| state.connections.get(id))
            .max_by_key(|c| c.state.priority())
            .map(|c| c.state.clone())
    }

    pub fn connection_count(&self) -> usize {
        self.state
            .lock()
            .unwrap()
            .connections
            .values()
            .filter(|c| c.state.is_connected())
            .count()
    }

    pub fn total_entry_count(&self) -> usize {
        self.state.lock().unwrap().connections.len()
    }

    pub fn inbound_count(&self) -> usize {
        self.state
            .lock()
            .unwrap()
            .connections
            .values()
            .filter(|c| c.state.is_connected() && c.direction == Direction::Inbound)
            .count()
    }

    pub fn outbound_count(&self) -> usize {
        self.state
            .lock()
            .unwrap()
            .connections
            .values()
            .filter(|c| c.state.is_connected() && c.direction == Direction::Outbound)
            .count()
    }

    /// A snapshot of aggregate counters, for observability.
    pub fn stats(&self) -> PoolStats {
        let state = self.state.lock().unwrap();
        PoolStats {
            connected: state.connections.values().filter(|c| c.state.is_connected()).count(),
            total_entries: state.connections.len(),
            inbound: state
                .connections
                .values()
                .filter(|c| c.state.is_connected() && c.direction == Direction::Inbound)
                .count(),
            outbound: state
                .connections
                .values()
                .filter(|c| c.state.is_connected() && c.direction == Direction::Outbound)
                .count(),
        }
    }

    pub fn tag(&self, peer: &PeerId, tag: &str) {
        self.for_each_peer_connection(peer, |c| {
            c.tags.insert(tag.to_string());
        });
    }

    pub fn untag(&self, peer: &PeerId, tag: &str) {
        self.for_each_peer_connection(peer, |c| {
            c.tags.remove(tag);
        });
    }

    pub fn protect(&self, peer: &PeerId) {
        self.for_each_peer_connection(peer, |c| c.is_protected = true);
    }

    pub fn unprotect(&self, peer: &PeerId) {
        self.for_each_peer_connection(peer, |c| c.is_protected = false);
    }

    fn for_each_peer_connection(&self, peer: &PeerId, mut f: impl FnMut(&mut ManagedConnection)) {
        let mut state = self.state.lock().unwrap();
        let ids: Vec<ConnectionId> = state
            .peer_connections
            .get(peer)
            .map(|s| s.iter().copied().collect())
            .unwrap_or_default();
        for id in ids {
            if let Some(conn) = state.connections.get_mut(&id) {
                f(conn);
            }
        }
    }

    pub fn can_accept_inbound(&self) -> bool {
        let state = self.state.lock().unwrap();
        match self.limits.max_inbound {
            Some(max) => {
                state
                    .connections
                    .values()
                    .filter(|c| c.state.is_connected() && c.direction == Direction::Inbound)
                    .count()
                    < max
            }
            None => true,
        }
    }

    pub fn can_dial_outbound(&self) -> bool {
        let state = self.state.lock().unwrap();
        match self.limits.max_outbound {
            Some(max) => {
                state
                    .connections
                    .values()
                    .filter(|c| c.state.is_connected() && c.direction == Direction::Outbound)
                    .count()
                    < max
            }
            None => true,
        }
    }

    pub fn can_connect_to(&self, peer: &PeerId) -> bool {
        let state = self.state.lock().unwrap();
        let per_peer = state
            .peer_connections
            .get(peer)
            .map(|ids| {
                ids.iter()
                    .filter_map(|id| state.connections.get(id))
                    .filter(|c| c.state.is_connected())
                    .count()
            })
            .unwrap_or(0);
        per_peer < self.limits.max_per_peer
    }

    pub fn has_pending_dial(&self, peer: &PeerId) -> bool {
        self.state.lock().unwrap().pending_dials.contains_key(peer)
    }

    pub fn register_pending_dial(&self, peer: PeerId, task: tokio::task::JoinHandle<()>) {
        self.state
            .lock()
            .unwrap()
            .pending_dials
            .insert(peer, PendingDial { task });
    }

    pub fn remove_pending_dial(&self, peer: &PeerId) {
        self.state.lock().unwrap().pending_dials.remove(peer);
    }

    pub fn cancel_all_pending_dials(&self) {
        for (_, dial) in self.state.lock().unwrap().pending_dials.drain() {
            dial.task.abort();
        }
    }

    pub fn enable_auto_reconnect(&self, peer: PeerId, addr: Multiaddr) {
        self.state.lock().unwrap().auto_reconnect.insert(peer, addr);
    }

    pub fn disable_auto_reconnect(&self, peer: &PeerId) {
        self.state.lock().unwrap().auto_reconnect.remove(peer);
    }

    pub fn reconnect_address(&self, peer: &PeerId) -> Option<Multiaddr> {
        self.state.lock().unwrap().auto_reconnect.get(peer).cloned()
    }

    pub fn increment_retry_count(&self, id: ConnectionId) {
        if let Some(conn) = self.state.lock().unwrap().connections.get_mut(&id) {
            conn.retry_count += 1;
        }
    }

    pub fn reset_retry_count(&self, id: ConnectionId) {
        if let Some(conn) = self.state.lock().unwrap().connections.get_mut(&id) {
            conn.retry_count = 0;
        }
    }

    /// Trims connected entries down toward `low_watermark` when above
    /// `high_watermark` (§4.1). Protected entries and entries still inside
    /// their grace period are never candidates.
    pub fn trim_if_needed(&self) -> ConnectionTrimReport {
        let mut state = self.state.lock().unwrap();
        let now = Instant::now();
        let active = state
            .connections
            .values()
            .filter(|c| c.state.is_connected())
            .count();
        if active <= self.limits.high_watermark {
            return ConnectionTrimReport::default();
        }
        let target = active - self.limits.low_watermark;

        let mut candidates: Vec<ConnectionId> = state
            .connections
            .values()
            .filter(|c| {
                c.state.is_connected()
                    && !c.is_protected
                    && c.connected_at + self.limits.grace_period <= now
            })
            .map(|c| c.id)
            .collect();

        candidates.sort_by(|a, b| {
            let ca = &state.connections[a];
            let cb = &state.connections[b];
            (ca.tags.len(), ca.last_activity, direction_rank(ca.direction)).cmp(&(
                cb.tags.len(),
                cb.last_activity,
                direction_rank(cb.direction),
            ))
        });

        let take = target.min(candidates.len());
        let mut trimmed = Vec::with_capacity(take);
        for (rank, id) in candidates.iter().take(take).enumerate() {
            let conn = &state.connections[id];
            trimmed.push(TrimmedWithContext {
                id: *id,
                peer: conn.peer,
                rank: rank + 1,
                tag_count: conn.tags.len(),
                idle_duration: now.saturating_duration_since(conn.last_activity),
                direction: conn.direction,
            });
        }
        for t in &trimmed {
            self.remove_locked(&mut state, t.id);
        }
        stats::POOL_TRIMMED_CONNECTIONS.inc_by(trimmed.len() as u64);

        let constrained = if take < target {
            Some(TrimConstrained {
                target,
                selected: take,
                trimmable: candidates.len(),
                active,
            })
        } else {
            None
        };

        ConnectionTrimReport { trimmed, constrained }
    }

    /// Removes `failed` entries always, and `disconnected` entries past
    /// `threshold` unless the peer is registered for auto-reconnect (§4.1).
    /// Runs in two passes to avoid iterator invalidation.
    pub fn cleanup_stale_entries(&self, threshold: Duration) {
        let mut state = self.state.lock().unwrap();
        let now = Instant::now();
        let mut to_remove = Vec::new();
        for conn in state.connections.values() {
            if conn.state.is_failed() {
                to_remove.push(conn.id);
                continue;
            }
            if conn.state.is_disconnected()
                && now.saturating_duration_since(conn.last_activity) >= threshold
                && !state.auto_reconnect.contains_key(&conn.peer)
            {
                to_remove.push(conn.id);
            }
        }
        for id in to_remove {
            self.remove_locked(&mut state, id);
        }
    }

    /// Connected entries idle for at least `threshold`.
    pub fn idle_connections(&self, threshold: Duration) -> Vec<ConnectionId> {
        let state = self.state.lock().unwrap();
        let now = Instant::now();
        state
            .connections
            .values()
            .filter(|c| c.state.is_connected() && c.last_activity + threshold <= now)
            .map(|c| c.id)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr() -> Multiaddr {
        "/ip4/127.0.0.1/tcp/4001".parse().unwrap()
    }

    #[test]
    fn peer_connections_invariant_holds_after_add_and_remove() {
        let pool = ConnectionPool::new(ConnectionLimits::default());
        let peer = PeerId::random();
        let id1 = pool.add(None, peer, addr(), Direction::Inbound);
        let id2 = pool.add(None, peer, addr(), Direction::Outbound);
        assert_eq!(pool.managed_connection_ids(&peer).len(), 2);
        pool.remove(id1);
        assert_eq!(pool.managed_connection_ids(&peer), vec![id2]);
    }

    #[test]
    fn trim_with_equal_watermarks_has_no_headroom() {
        let limits = ConnectionLimits {
            high_watermark: 2,
            low_watermark: 2,
            ..ConnectionLimits::default()
        };
        let pool = ConnectionPool::new(limits);
        pool.add(None, PeerId::random(), addr(), Direction::Inbound);
        pool.add(None, PeerId::random(), addr(), Direction::Inbound);
        let report = pool.trim_if_needed();
        assert!(report.trimmed.is_empty());
    }

    #[test]
    fn grace_period_protects_freshly_connected_entries() {
        let limits = ConnectionLimits {
            high_watermark: 1,
            low_watermark: 0,
            grace_period: Duration::from_secs(3600),
            ..ConnectionLimits::default()
        };
        let pool = ConnectionPool::new(limits);
        pool.add(None, PeerId::random(), addr(), Direction::Inbound);
        pool.add(None, PeerId::random(), addr(), Direction::Inbound);
        let report = pool.trim_if_needed();
        assert!(report.trimmed.is_empty());
        assert!(report.constrained.is_some());
    }

    #[test]
    fn max_per_peer_blocks_a_third_concurrent_connection() {
        let limits = ConnectionLimits {
            max_per_peer: 2,
            ..ConnectionLimits::default()
        };
        let pool = ConnectionPool::new(limits);
        let peer = PeerId::random();
        pool.add(None, peer, addr(), Direction::Outbound);
        pool.add(None, peer, addr(), Direction::Outbound);
        assert!(!pool.can_connect_to(&peer));
    }

    #[test]
    fn limit_trim_scenario_removes_the_two_oldest() {
        let limits = ConnectionLimits {
            high_watermark: 3,
            low_watermark: 2,
            grace_period: Duration::ZERO,
            ..ConnectionLimits::default()
        };
        let pool = ConnectionPool::new(limits);
        let peers: Vec<PeerId> = (0..4).map(|_| PeerId::random()).collect();
        let mut ids = Vec::new();
        for p in &peers {
            ids.push(pool.add(None, *p, addr(), Direction::Inbound));
            std::thread::sleep(Duration::from_millis(1));
        }
        let report = pool.trim_if_needed();
        assert_eq!(report.trimmed.len(), 2);
        let trimmed_ids: HashSet<_> = report.trimmed.iter().map(|t| t.id).collect();
        assert!(trimmed_ids.contains(&ids[0]));
        assert!(trimmed_ids.contains(&ids[1]));
    }
}
