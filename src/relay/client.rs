// Copyright 2022-2024 Protocol Labs
// SPDX-License-Identifier: MIT
//! Circuit Relay v2 client side: reservations and the STOP listener for
//! inbound relayed connections (§4.5).

use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, Weak};
use std::time::Duration;

use log::debug;
use tokio::sync::{mpsc, oneshot};

use crate::error::RelayError;
use crate::interfaces::{MuxedStream, StreamOpener};
use crate::peer::{Multiaddr, PeerId};
use crate::relay::connection::{CircuitLimit, RelayedConnection};
use crate::relay::messages::{self, pb, HopStatus, StopStatus};
use crate::timestamp::Timestamp;

const HOP_PROTOCOL: &str = "/libp2p/circuit/relay/0.2.0/hop";
const STOP_PROTOCOL: &str = "/libp2p/circuit/relay/0.2.0/stop";

/// Receives relayed connections arriving for a relay a caller has registered
/// interest in (§4.5 "registered listener"). `deliver` must not block: a
/// typical implementation pushes onto a channel/queue the caller drains
/// elsewhere, mirroring how `HandlerRegistry` callbacks are expected to
/// behave for ordinary inbound streams.
pub trait RelayListener: Send + Sync {
    fn deliver(&self, conn: RelayedConnection);
}

/// An active reservation held on some relay (§3).
#[derive(Debug, Clone)]
pub struct Reservation {
    pub relay: PeerId,
    pub expiration: Timestamp,
    pub addresses: Vec<Multiaddr>,
    pub voucher: Option<Vec<u8>>,
}

/// Events the host can subscribe to for observability (§6).
#[derive(Debug, Clone)]
pub enum RelayClientEvent {
    ReservationCreated(PeerId),
    ReservationFailed(PeerId, HopStatus),
    CircuitEstablished(PeerId, PeerId),
}

/// A key identifying an accept-waiter: an optional relay filter and an
/// optional remote-peer filter. `None` matches anything.
type WaiterKey = u64;

struct Waiter {
    relay_filter: Option<PeerId>,
    remote_filter: Option<PeerId>,
    sender: oneshot::Sender<Result<RelayedConnection, RelayError>>,
}

struct State {
    reservations: HashMap<PeerId, Reservation>,
    listeners: HashMap<PeerId, Weak<dyn RelayListener>>,
    waiters: HashMap<WaiterKey, Waiter>,
    queue: VecDeque<RelayedConnection>,
    next_waiter_key: WaiterKey,
}

impl Default for State {
    fn default() -> Self {
        Self {
            reservations: HashMap::new(),
            listeners: HashMap::new(),
            waiters: HashMap::new(),
            queue: VecDeque::new(),
            next_waiter_key: 0,
        }
    }
}

/// Handles the client half of Circuit Relay v2: requesting reservations,
/// dialing through a relay, and accepting inbound circuits delivered by a
/// relay's STOP stream.
pub struct RelayClient<O: StreamOpener> {
    opener: O,
    state: Mutex<State>,
    default_limit: CircuitLimit,
    events: mpsc::UnboundedSender<RelayClientEvent>,
}

impl<O: StreamOpener + 'static> RelayClient<O> {
    pub fn new(
        opener: O,
        default_limit: CircuitLimit,
    ) -> (Self, mpsc::UnboundedReceiver<RelayClientEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                opener,
                state: Mutex::new(State::default()),
                default_limit,
                events: tx,
            },
            rx,
        )
    }

    pub fn reservations(&self) -> Vec<Reservation> {
        self.state.lock().unwrap().reservations.values().cloned().collect()
    }

    /// Requests a reservation on `relay` (§4.5 `reserve`).
    pub async fn reserve(&self, relay: PeerId) -> Result<Reservation, RelayError> {
        let mut stream = self
            .opener
            .new_stream(relay, HOP_PROTOCOL)
            .await
            .map_err(|e| RelayError::StreamError(e.to_string()))?;

        let req = pb::HopMessage {
            r#type: pb::hop_message::Type::Reserve as i32,
            peer: None,
            reservation: None,
            limit: None,
            status: pb::hop_message::Status::Ok as i32,
        };
        write_hop(stream.as_mut(), &req).await?;
        let reply = read_hop(stream.as_mut(), 4096).await?;
        let status: HopStatus = pb::hop_message::Status::try_from(reply.status)
            .unwrap_or(pb::hop_message::Status::UnexpectedMessage)
            .into();
        if status != HopStatus::Ok {
            let _ = stream.close().await;
            let _ = self.events.send(RelayClientEvent::ReservationFailed(relay, status));
            return Err(RelayError::ReservationFailed(status));
        }

        let info = reply.reservation.ok_or(RelayError::StreamError(
            "missing reservation info".into(),
        ))?;
        let unix_now = Timestamp::now().as_secs();
        let delta = info.expire.saturating_sub(unix_now);
        let expiration = Timestamp::now() + Duration::from_secs(delta);
        let addresses = info
            .addrs
            .iter()
            .filter_map(|b| Multiaddr::try_from(b.clone()).ok())
            .collect::<Vec<_>>();
        let reservation = Reservation {
            relay,
            expiration,
            addresses,
            voucher: if info.voucher.is_empty() {
                None
            } else {
                Some(info.voucher)
            },
        };
        self.state
            .lock()
            .unwrap()
            .reservations
            .insert(relay, reservation.clone());
        let _ = self.events.send(RelayClientEvent::ReservationCreated(relay));
        debug!("reservation created on {relay}, expires at {}", expiration.as_secs());
        Ok(reservation)
    }

    /// Drops a reservation once its expiration task fires.
    pub fn expire_reservation(&self, relay: &PeerId) {
        self.state.lock().unwrap().reservations.remove(relay);
    }

    /// Dials `target` through `relay` (§4.5 `connectThrough`).
    pub async fn connect_through(
        &self,
        relay: PeerId,
        target: PeerId,
    ) -> Result<RelayedConnection, RelayError> {
        let mut stream = self
            .opener
            .new_stream(relay, HOP_PROTOCOL)
            .await
            .map_err(|e| RelayError::StreamError(e.to_string()))?;

        let req = pb::HopMessage {
            r#type: pb::hop_message::Type::Connect as i32,
            peer: Some(pb::PeerInfo {
                id: target.to_bytes(),
                addrs: Vec::new(),
            }),
            reservation: None,
            limit: None,
            status: pb::hop_message::Status::Ok as i32,
        };
        write_hop(stream.as_mut(), &req).await?;
        let reply = read_hop(stream.as_mut(), 4096).await?;
        let status: HopStatus = pb::hop_message::Status::try_from(reply.status)
            .unwrap_or(pb::hop_message::Status::UnexpectedMessage)
            .into();
        if status != HopStatus::Ok {
            return Err(RelayError::ConnectionFailed(status));
        }
        let limit = reply
            .limit
            .map(from_wire_limit)
            .unwrap_or(self.default_limit);
        let _ = self
            .events
            .send(RelayClientEvent::CircuitEstablished(relay, target));
        Ok(RelayedConnection::new(stream, relay, target, limit))
    }

    /// Registers a long-lived listener for circuits arriving via `relay`.
    /// Held by weak reference: once the handler is dropped the entry goes
    /// inert and is compacted lazily on the next lookup (§5).
    pub fn register_listener(&self, relay: PeerId, handler: Weak<dyn RelayListener>) {
        self.state.lock().unwrap().listeners.insert(relay, handler);
    }

    /// Handles an inbound STOP stream (§4.5).
    pub async fn handle_inbound_stop(&self, remote: PeerId, mut stream: Box<dyn MuxedStream>) {
        let msg: pb::StopMessage = match read_stop(stream.as_mut(), 4096).await {
            Ok(m) => m,
            Err(_) => return,
        };
        if msg.r#type != pb::stop_message::Type::Connect as i32 {
            let _ = write_stop(stream.as_mut(), &stop_status_reply(StopStatus::UnexpectedMessage)).await;
            return;
        }
        let peer = match msg.peer.and_then(|p| PeerId::from_bytes(&p.id).ok()) {
            Some(p) => p,
            None => {
                let _ = write_stop(stream.as_mut(), &stop_status_reply(StopStatus::MalformedMessage)).await;
                return;
            }
        };
        let limit = msg.limit.map(from_wire_limit).unwrap_or(self.default_limit);

        if write_stop(stream.as_mut(), &stop_status_reply(StopStatus::Ok)).await.is_err() {
            return;
        }

        let conn = RelayedConnection::new(stream, remote, peer, limit);
        self.deliver(remote, conn);
    }

    fn deliver(&self, relay: PeerId, conn: RelayedConnection) {
        let mut state = self.state.lock().unwrap();
        if let Some(weak) = state.listeners.get(&relay) {
            match weak.upgrade() {
                Some(listener) => {
                    listener.deliver(conn);
                    return;
                }
                None => {
                    state.listeners.remove(&relay);
                }
            }
        }

        let matching_key = state.waiters.iter().find_map(|(k, w)| {
            let relay_ok = w.relay_filter.map(|r| r == relay).unwrap_or(true);
            let remote_ok = w.remote_filter.map(|r| r == conn.remote_peer()).unwrap_or(true);
            (relay_ok && remote_ok).then_some(*k)
        });
        if let Some(key) = matching_key {
            let waiter = state.waiters.remove(&key).unwrap();
            if let Err(Ok(conn)) = waiter.sender.send(Ok(conn)) {
                state.queue.push_back(conn);
            }
            return;
        }
        state.queue.push_back(conn);
    }

    /// Accepts the next relayed connection matching the given filters,
    /// waiting if none is already queued (§4.5 `acceptConnection`).
    pub async fn accept_connection(
        &self,
        relay: Option<PeerId>,
        remote: Option<PeerId>,
        timeout: Duration,
    ) -> Result<RelayedConnection, RelayError> {
        let rx = {
            let mut state = self.state.lock().unwrap();
            let idx = state.queue.iter().position(|c| {
                relay.map(|r| r == c.relay()).unwrap_or(true)
                    && remote.map(|r| r == c.remote_peer()).unwrap_or(true)
            });
            if let Some(idx) = idx {
                return Ok(state.queue.remove(idx).unwrap());
            }
            let key = state.next_waiter_key;
            state.next_waiter_key += 1;
            let (tx, rx) = oneshot::channel();
            state.waiters.insert(
                key,
                Waiter {
                    relay_filter: relay,
                    remote_filter: remote,
                    sender: tx,
                },
            );
            (key, rx)
        };
        let (key, mut rx) = rx;

        match tokio::time::timeout(timeout, &mut rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(RelayError::Timeout),
            Err(_) => {
                let mut state = self.state.lock().unwrap();
                state.waiters.remove(&key);
                drop(state);
                // `deliver` may have matched this waiter and sent into `rx` in
                // the same instant the timeout elapsed; re-drain it so a
                // connection delivered in that race isn't dropped on the floor.
                match rx.try_recv() {
                    Ok(Ok(conn)) => Ok(conn),
                    Ok(Err(_)) | Err(_) => Err(RelayError::Timeout),
                }
            }
        }
    }
}

fn stop_status_reply(status: StopStatus) -> pb::StopMessage {
    pb::StopMessage {
        r#type: pb::stop_message::Type::Status as i32,
        peer: None,
        limit: None,
        status: pb::stop_message::Status::from(status) as i32,
    }
}

fn from_wire_limit(limit: pb::Limit) -> CircuitLimit {
    CircuitLimit {
        duration: if limit.duration == 0 {
            None
        } else {
            Some(Duration::from_secs(limit.duration as u64))
        },
        data: if limit.data == 0 { None } else { Some(limit.data) },
    }
}

async fn write_hop(stream: &mut dyn MuxedStream, msg: &pb::HopMessage) -> Result<(), RelayError> {
    let frame = messages::frame(msg);
    stream
        .write_message(&frame)
        .await
        .map_err(|e| RelayError::StreamError(e.to_string()))
}

async fn read_hop(stream: &mut dyn MuxedStream, max: usize) -> Result<pb::HopMessage, RelayError> {
    let raw = stream
        .read_message(max)
        .await
        .map_err(|e| RelayError::StreamError(e.to_string()))?;
    let (_, body) =
        messages::read_length_prefix(&raw).map_err(|e| RelayError::StreamError(e.to_string()))?;
    messages::decode(body).map_err(|e| RelayError::StreamError(e.to_string()))
}

async fn write_stop(stream: &mut dyn MuxedStream, msg: &pb::StopMessage) -> Result<(), RelayError> {
    let frame = messages::frame(msg);
    stream
        .write_message(&frame)
        .await
        .map_err(|e| RelayError::StreamError(e.to_string()))
}

async fn read_stop(
    stream: &mut dyn MuxedStream,
    max: usize,
) -> Result<pb::StopMessage, RelayError> {
    let raw = stream
        .read_message(max)
        .await
        .map_err(|e| RelayError::StreamError(e.to_string()))?;
    let (_, body) =
        messages::read_length_prefix(&raw).map_err(|e| RelayError::StreamError(e.to_string()))?;
    messages::decode(body).map_err(|e| RelayError::StreamError(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_limit_zero_means_unbounded() {
        let limit = from_wire_limit(pb::Limit { duration: 0, data: 0 });
        assert_eq!(limit.duration, None);
        assert_eq!(limit.data, None);
    }

    #[test]
    fn wire_limit_round_trips_nonzero_fields() {
        let limit = from_wire_limit(pb::Limit {
            duration: 120,
            data: 4096,
        });
        assert_eq!(limit.duration, Some(Duration::from_secs(120)));
        assert_eq!(limit.data, Some(4096));
    }
}
