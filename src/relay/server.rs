// Copyright 2022-2024 Protocol Labs
// SPDX-License-Identifier: MIT
//! Circuit Relay v2 server side: HOP dispatch, reservations, and the
//! bidirectional data-plane copy loop (§4.6, §4.7).

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use log::debug;
use tokio::sync::mpsc;

use crate::interfaces::{MuxedStream, PeerStore, StreamOpener};
use crate::peer::{Multiaddr, PeerId};
use crate::relay::connection::{ActiveCircuit, CircuitLimit};
use crate::relay::messages::{self, pb, HopStatus, StopStatus};
use crate::stats;
use crate::timestamp::Timestamp;

const STOP_PROTOCOL: &str = "/libp2p/circuit/relay/0.2.0/stop";

/// Relay-server-side configuration (§6 defaults).
#[derive(Debug, Clone)]
pub struct RelayServerConfig {
    pub max_reservations: usize,
    pub max_circuits_per_peer: usize,
    pub max_circuits: usize,
    pub reservation_duration: Duration,
    pub circuit_limit: CircuitLimit,
    pub copy_batch: usize,
    pub read_chunk: usize,
}

impl Default for RelayServerConfig {
    fn default() -> Self {
        Self {
            max_reservations: 128,
            max_circuits_per_peer: 16,
            max_circuits: 1024,
            reservation_duration: Duration::from_secs(3600),
            circuit_limit: CircuitLimit::new(Duration::from_secs(120), 128 * 1024),
            copy_batch: 8 * 1024,
            read_chunk: 16 * 1024,
        }
    }
}

/// A live reservation held by the server for some requesting peer.
#[derive(Debug, Clone)]
pub struct ServerReservation {
    pub peer: PeerId,
    pub expiration: Timestamp,
    pub addresses: Vec<Multiaddr>,
}

/// Identifies one circuit in progress: source, target, and a disambiguator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CircuitId(pub PeerId, pub PeerId, pub u64);

#[derive(Default)]
struct State {
    reservations: HashMap<PeerId, ServerReservation>,
    circuits: HashMap<CircuitId, ActiveCircuit>,
    circuits_per_peer: HashMap<PeerId, usize>,
    next_circuit_seq: u64,
}

/// Events the host can subscribe to for observability (§6).
#[derive(Debug, Clone)]
pub enum RelayServerEvent {
    ReservationAccepted(PeerId),
    ReservationDenied(PeerId),
    ReservationExpired(PeerId),
    CircuitOpened(CircuitId),
    CircuitCompleted { id: CircuitId, bytes: u64 },
    CircuitFailed(CircuitId),
}

/// Serves HOP for requesting clients and originates STOP against their
/// targets. Holds no stream state itself beyond what a single request
/// needs; circuits run as detached tasks once established.
pub struct RelayServer<O: StreamOpener, P: PeerStore> {
    config: RelayServerConfig,
    state: Mutex<State>,
    opener: O,
    peer_store: P,
    local_peer: PeerId,
    events: mpsc::UnboundedSender<RelayServerEvent>,
}

impl<O: StreamOpener + 'static, P: PeerStore + 'static> RelayServer<O, P> {
    pub fn new(
        local_peer: PeerId,
        opener: O,
        peer_store: P,
        config: RelayServerConfig,
    ) -> (Self, mpsc::UnboundedReceiver<RelayServerEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                config,
                state: Mutex::new(State::default()),
                opener,
                peer_store,
                local_peer,
                events: tx,
            },
            rx,
        )
    }

    pub fn reservation_count(&self) -> usize {
        self.state.lock().unwrap().reservations.len()
    }

    pub fn circuit_count(&self) -> usize {
        self.state.lock().unwrap().circuits.len()
    }

    /// Serves one inbound HOP stream end to end (§4.6): reads the request,
    /// dispatches by type, writes the reply, and — on a successful
    /// `CONNECT` — hands the already-open STOP stream and the source stream
    /// to [`relay_streams`] as a detached task (§4.7). Returns once the
    /// reply has been written (the relay loop, if any, keeps running).
    pub async fn serve_hop_stream(
        self: &Arc<Self>,
        requester: PeerId,
        mut stream: Box<dyn MuxedStream>,
    ) {
        let msg: pb::HopMessage = match read_framed_hop(stream.as_mut(), 4096).await {
            Ok(m) => m,
            Err(_) => return,
        };
        match pb::hop_message::Type::try_from(msg.r#type).unwrap_or(pb::hop_message::Type::Status) {
            pb::hop_message::Type::Reserve => {
                let reply = self.handle_reserve(requester);
                if write_framed_hop(stream.as_mut(), &reply).await.is_err() {
                    self.revoke_reservation(&requester);
                }
            }
            pb::hop_message::Type::Connect => {
                let target = match msg.peer.and_then(|p| PeerId::from_bytes(&p.id).ok()) {
                    Some(t) => t,
                    None => {
                        let _ = write_framed_hop(
                            stream.as_mut(),
                            &status_reply(HopStatus::MalformedMessage),
                        )
                        .await;
                        return;
                    }
                };
                match self.handle_connect(requester, target).await {
                    Ok((id, stop_stream)) => {
                        let reply = pb::HopMessage {
                            r#type: pb::hop_message::Type::Status as i32,
                            peer: None,
                            reservation: None,
                            limit: Some(to_wire_limit(self.config.circuit_limit)),
                            status: pb::hop_message::Status::Ok as i32,
                        };
                        if write_framed_hop(stream.as_mut(), &reply).await.is_err() {
                            self.fail_circuit(id);
                            return;
                        }
                        let server = self.clone();
                        tokio::spawn(async move {
                            relay_streams(&server, id, stream, stop_stream).await;
                        });
                    }
                    Err(status) => {
                        let _ = write_framed_hop(stream.as_mut(), &status_reply(status)).await;
                    }
                }
            }
            pb::hop_message::Type::Status => {
                let _ = write_framed_hop(
                    stream.as_mut(),
                    &status_reply(HopStatus::UnexpectedMessage),
                )
                .await;
            }
        }
    }

    fn handle_reserve(&self, requester: PeerId) -> pb::HopMessage {
        let mut state = self.state.lock().unwrap();
        if state.reservations.len() >= self.config.max_reservations
            && !state.reservations.contains_key(&requester)
        {
            drop(state);
            stats::RELAY_RESERVATION_DENIED.inc();
            let _ = self
                .events
                .send(RelayServerEvent::ReservationDenied(requester));
            return status_reply(HopStatus::ResourceLimitExceeded);
        }

        let now = Timestamp::now();
        let expiration = now + self.config.reservation_duration;
        let addresses = build_relay_addresses(&self.peer_store, self.local_peer, requester);
        state.reservations.insert(
            requester,
            ServerReservation {
                peer: requester,
                expiration,
                addresses: addresses.clone(),
            },
        );
        drop(state);

        stats::RELAY_RESERVATION_ACCEPTED.inc();
        stats::RELAY_RESERVATIONS_ACTIVE.set(self.state.lock().unwrap().reservations.len() as i64);
        let _ = self
            .events
            .send(RelayServerEvent::ReservationAccepted(requester));

        pb::HopMessage {
            r#type: pb::hop_message::Type::Status as i32,
            peer: None,
            reservation: Some(pb::ReservationInfo {
                expire: expiration.as_secs(),
                addrs: addresses.iter().map(|a| a.to_vec()).collect(),
                voucher: Vec::new(),
            }),
            limit: Some(to_wire_limit(self.config.circuit_limit)),
            status: pb::hop_message::Status::Ok as i32,
        }
    }

    /// Removes the reservation that a failed write can no longer honor.
    pub fn revoke_reservation(&self, requester: &PeerId) {
        let mut state = self.state.lock().unwrap();
        state.reservations.remove(requester);
        stats::RELAY_RESERVATIONS_ACTIVE.set(state.reservations.len() as i64);
    }

    /// Sweeps reservations past their expiration, reporting each one removed
    /// (§4.6). The host is expected to call this periodically; `handle_connect`
    /// already treats an expired reservation as absent, so this only reclaims
    /// bookkeeping rather than affecting correctness.
    pub fn purge_expired_reservations(&self) -> Vec<PeerId> {
        let now = Timestamp::now();
        let mut state = self.state.lock().unwrap();
        let expired: Vec<PeerId> = state
            .reservations
            .iter()
            .filter(|(_, r)| r.expiration.as_secs() <= now.as_secs())
            .map(|(peer, _)| *peer)
            .collect();
        for peer in &expired {
            state.reservations.remove(peer);
        }
        stats::RELAY_RESERVATIONS_ACTIVE.set(state.reservations.len() as i64);
        drop(state);
        for peer in &expired {
            let _ = self.events.send(RelayServerEvent::ReservationExpired(*peer));
        }
        expired
    }

    /// Verifies the reservation, enforces circuit limits, and opens STOP
    /// against `target`. Returns the new circuit's id and the open STOP
    /// stream so the caller can pair it with the source's HOP stream and
    /// hand both to [`relay_streams`] (§4.6 step 4-5).
    async fn handle_connect(
        &self,
        source: PeerId,
        target: PeerId,
    ) -> Result<(CircuitId, Box<dyn MuxedStream>), HopStatus> {
        {
            let state = self.state.lock().unwrap();
            let reservation = state.reservations.get(&target).ok_or(HopStatus::NoReservation)?;
            if reservation.expiration.as_secs() <= Timestamp::now().as_secs() {
                return Err(HopStatus::NoReservation);
            }
            if state.circuits.len() >= self.config.max_circuits {
                return Err(HopStatus::ResourceLimitExceeded);
            }
            let per_peer = *state.circuits_per_peer.get(&source).unwrap_or(&0);
            if per_peer >= self.config.max_circuits_per_peer {
                return Err(HopStatus::ResourceLimitExceeded);
            }
        }

        let mut stop_stream = self
            .opener
            .new_stream(target, STOP_PROTOCOL)
            .await
            .map_err(|_| HopStatus::ConnectionFailed)?;

        let req = pb::StopMessage {
            r#type: pb::stop_message::Type::Connect as i32,
            peer: Some(pb::PeerInfo {
                id: source.to_bytes(),
                addrs: Vec::new(),
            }),
            limit: Some(to_wire_limit(self.config.circuit_limit)),
            status: pb::stop_message::Status::Ok as i32,
        };
        write_framed(stop_stream.as_mut(), &req)
            .await
            .map_err(|_| HopStatus::ConnectionFailed)?;
        let reply: pb::StopMessage = read_framed(stop_stream.as_mut(), 4096)
            .await
            .map_err(|_| HopStatus::ConnectionFailed)?;
        let status: StopStatus = pb::stop_message::Status::try_from(reply.status)
            .unwrap_or(pb::stop_message::Status::ConnectionFailed)
            .into();
        if status != StopStatus::Ok {
            return Err(HopStatus::ConnectionFailed);
        }

        let id = {
            let mut state = self.state.lock().unwrap();
            let seq = state.next_circuit_seq;
            state.next_circuit_seq += 1;
            let id = CircuitId(source, target, seq);
            state.circuits.insert(id, ActiveCircuit::new(Instant::now()));
            *state.circuits_per_peer.entry(source).or_insert(0) += 1;
            id
        };
        stats::RELAY_CIRCUIT_OPENED.inc();
        stats::RELAY_CIRCUITS_ACTIVE.set(self.state.lock().unwrap().circuits.len() as i64);
        let _ = self.events.send(RelayServerEvent::CircuitOpened(id));
        debug!("circuit {:?} established", id);
        Ok((id, stop_stream))
    }

    /// Tears down bookkeeping for a circuit that never made it to the data
    /// plane (e.g. the source's HOP stream closed before the reply could be
    /// written).
    fn fail_circuit(&self, id: CircuitId) {
        {
            let mut state = self.state.lock().unwrap();
            state.circuits.remove(&id);
            if let Some(count) = state.circuits_per_peer.get_mut(&id.0) {
                *count = count.saturating_sub(1);
            }
            stats::RELAY_CIRCUITS_ACTIVE.set(state.circuits.len() as i64);
        }
        stats::RELAY_CIRCUIT_FAILED.inc();
        let _ = self.events.send(RelayServerEvent::CircuitFailed(id));
    }

    fn finish_circuit(&self, id: CircuitId, residual: u64) {
        let total = {
            let mut state = self.state.lock().unwrap();
            if let Some(c) = state.circuits.get_mut(&id) {
                c.bytes_transferred += residual;
            }
            let total = state
                .circuits
                .remove(&id)
                .map(|c| c.bytes_transferred)
                .unwrap_or(0);
            if let Some(count) = state.circuits_per_peer.get_mut(&id.0) {
                *count = count.saturating_sub(1);
            }
            stats::RELAY_CIRCUITS_ACTIVE.set(state.circuits.len() as i64);
            total
        };
        let _ = self
            .events
            .send(RelayServerEvent::CircuitCompleted { id, bytes: total });
    }

    /// Adds `added` bytes to the circuit's running total, returning it.
    fn record_bytes(&self, id: CircuitId, added: u64) -> u64 {
        let mut state = self.state.lock().unwrap();
        let entry = state.circuits.entry(id).or_insert_with(|| ActiveCircuit::new(Instant::now()));
        entry.bytes_transferred += added;
        stats::RELAY_BYTES_RELAYED.inc_by(added);
        entry.bytes_transferred
    }
}

fn to_wire_limit(limit: CircuitLimit) -> pb::Limit {
    pb::Limit {
        duration: limit.duration.map(|d| d.as_secs() as u32).unwrap_or(0),
        data: limit.data.unwrap_or(0),
    }
}

fn status_reply(status: HopStatus) -> pb::HopMessage {
    pb::HopMessage {
        r#type: pb::hop_message::Type::Status as i32,
        peer: None,
        reservation: None,
        limit: None,
        status: pb::hop_message::Status::from(status) as i32,
    }
}

/// Builds advertisable `/.../p2p/<local>/p2p-circuit/p2p/<peer>` addresses
/// from every routable listen address of the local node (§4.6).
pub fn build_relay_addresses<P: PeerStore>(
    peer_store: &P,
    local: PeerId,
    peer: PeerId,
) -> Vec<Multiaddr> {
    peer_store
        .listen_addresses()
        .into_iter()
        .filter(|a| a.iter().any(|p| matches!(p, multiaddr::Protocol::Ip4(_) | multiaddr::Protocol::Ip6(_) | multiaddr::Protocol::Dns(_) | multiaddr::Protocol::Dns4(_) | multiaddr::Protocol::Dns6(_))))
        .map(|a| {
            a.with(multiaddr::Protocol::P2p(local.into()))
                .with(multiaddr::Protocol::P2pCircuit)
                .with(multiaddr::Protocol::P2p(peer.into()))
        })
        .collect()
}

async fn write_framed_hop(stream: &mut dyn MuxedStream, msg: &pb::HopMessage) -> std::io::Result<()> {
    let frame = messages::frame(msg);
    stream.write_message(&frame).await
}

async fn read_framed_hop(stream: &mut dyn MuxedStream, max: usize) -> std::io::Result<pb::HopMessage> {
    let raw = stream.read_message(max).await?;
    let (_, body) = messages::read_length_prefix(&raw)?;
    messages::decode(body)
}

async fn write_framed(stream: &mut dyn MuxedStream, msg: &pb::StopMessage) -> std::io::Result<()> {
    let frame = messages::frame(msg);
    stream.write_message(&frame).await
}

async fn read_framed(stream: &mut dyn MuxedStream, max: usize) -> std::io::Result<pb::StopMessage> {
    let raw = stream.read_message(max).await?;
    let (_, body) = messages::read_length_prefix(&raw)?;
    messages::decode(body)
}

/// Runs the two-direction copy between `a` and `b` until both legs end or a
/// limit is hit (§4.7). Each direction reads from one stream and writes to
/// the other independently; both streams are wrapped so the two directions
/// can share them without requiring split halves. Reports the combined byte
/// total to the server's circuit bookkeeping before returning.
pub async fn relay_streams<O: StreamOpener, P: PeerStore>(
    server: &RelayServer<O, P>,
    id: CircuitId,
    a: Box<dyn MuxedStream>,
    b: Box<dyn MuxedStream>,
) {
    let a = std::sync::Arc::new(tokio::sync::Mutex::new(a));
    let b = std::sync::Arc::new(tokio::sync::Mutex::new(b));
    let start = Instant::now();
    let limit = server.config.circuit_limit;
    let batch = server.config.copy_batch;
    let chunk = server.config.read_chunk;

    let fwd = copy_direction(a.clone(), b.clone(), start, limit, batch, chunk, server, id);
    let back = copy_direction(b.clone(), a.clone(), start, limit, batch, chunk, server, id);
    tokio::join!(fwd, back);

    server.finish_circuit(id, 0);
    stats::RELAY_CIRCUIT_COMPLETED.inc();

    let _ = a.lock().await.close().await;
    let _ = b.lock().await.close().await;
}

type SharedStream = std::sync::Arc<tokio::sync::Mutex<Box<dyn MuxedStream>>>;

#[allow(clippy::too_many_arguments)]
async fn copy_direction<O: StreamOpener, P: PeerStore>(
    from: SharedStream,
    to: SharedStream,
    start: Instant,
    limit: CircuitLimit,
    batch_threshold: usize,
    read_chunk: usize,
    server: &RelayServer<O, P>,
    id: CircuitId,
) {
    let mut local_bytes: usize = 0;
    loop {
        if let Some(duration) = limit.duration {
            if start.elapsed() >= duration {
                break;
            }
        }
        let chunk = match from.lock().await.read(read_chunk).await {
            Ok(c) if !c.is_empty() => c,
            _ => break,
        };
        if to.lock().await.write(&chunk).await.is_err() {
            break;
        }
        local_bytes += chunk.len();
        if local_bytes >= batch_threshold {
            let running = server.record_bytes(id, local_bytes as u64);
            local_bytes = 0;
            if let Some(data_limit) = limit.data {
                if running >= data_limit {
                    break;
                }
            }
        }
    }
    if local_bytes > 0 {
        server.record_bytes(id, local_bytes as u64);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn to_wire_limit_round_trips_seconds_and_bytes() {
        let limit = CircuitLimit::new(Duration::from_secs(120), 128 * 1024);
        let wire = to_wire_limit(limit);
        assert_eq!(wire.duration, 120);
        assert_eq!(wire.data, 128 * 1024);
    }

    #[test]
    fn status_reply_carries_the_requested_status() {
        let reply = status_reply(HopStatus::ResourceLimitExceeded);
        assert_eq!(
            reply.status,
            pb::hop_message::Status::ResourceLimitExceeded as i32
        );
    }
}
