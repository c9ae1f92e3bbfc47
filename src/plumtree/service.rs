// Copyright 2022-2024 Protocol Labs
// SPDX-License-Identifier: MIT
//! Plumtree service: wires the pure [`PlumtreeRouter`] and [`LazyPushBuffer`]
//! to multiplexed streams (§4.10). Holds the per-peer stream map and owns
//! every timer (lazy-push flush, IHave timeout); the router never touches a
//! stream directly (§9's cyclic-ownership note).

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use log::{debug, trace, warn};
use tokio::sync::{broadcast, Mutex as AsyncMutex};

use crate::error::PlumtreeError;
use crate::interfaces::{MuxedStream, StreamOpener};
use crate::peer::PeerId;
use crate::plumtree::buffer::LazyPushBuffer;
use crate::plumtree::messages::{self, pb};
use crate::plumtree::router::{
    MessageId, PlumtreeConfig, PlumtreeEvent, PlumtreeGossip, PlumtreeIHaveEntry, PlumtreeRouter,
};

pub const PLUMTREE_PROTOCOL: &str = "/plumtree/1.0.0";

type SharedStream = Arc<AsyncMutex<Box<dyn MuxedStream>>>;

/// A gossip message delivered to local subscribers. Topic filtering is
/// done on the subscriber side, keeping the broadcast channel generic (§9).
#[derive(Debug, Clone)]
pub struct TopicMessage {
    pub topic: String,
    pub message_id: MessageId,
    pub payload: Bytes,
    pub source: PeerId,
}

/// Service-layer events layered on top of the router's own [`PlumtreeEvent`]
/// stream: these additionally cover the networking actions the router's
/// contract only requests (§6).
#[derive(Debug, Clone)]
pub enum PlumtreeServiceEvent {
    Router(PlumtreeEvent),
    GraftSent { topic: String, peer: PeerId },
    PruneSent { topic: String, peer: PeerId },
}

struct State {
    peer_streams: HashMap<PeerId, SharedStream>,
    next_seqno: u64,
}

impl Default for State {
    fn default() -> Self {
        Self {
            peer_streams: HashMap::new(),
            next_seqno: 0,
        }
    }
}

/// Wires [`PlumtreeRouter`] and [`LazyPushBuffer`] to a [`StreamOpener`],
/// running the lazy-push flush loop and per-message IHave timers (§4.10).
pub struct PlumtreeService<O: StreamOpener> {
    local_peer: PeerId,
    router: Arc<PlumtreeRouter>,
    buffer: Arc<LazyPushBuffer>,
    opener: Arc<O>,
    state: Mutex<State>,
    started: AtomicBool,
    messages: broadcast::Sender<TopicMessage>,
    events: broadcast::Sender<PlumtreeServiceEvent>,
}

impl<O: StreamOpener + 'static> PlumtreeService<O> {
    pub fn new(local_peer: PeerId, config: PlumtreeConfig, opener: Arc<O>) -> Arc<Self> {
        let (router, mut router_rx) = PlumtreeRouter::new(config);
        let buffer = Arc::new(LazyPushBuffer::new(
            config.max_ihave_batch_size,
            config.max_ihave_batch_size * 64,
        ));
        let (messages_tx, _) = broadcast::channel(1024);
        let (events_tx, _) = broadcast::channel(1024);

        let service = Arc::new(Self {
            local_peer,
            router: Arc::new(router),
            buffer,
            opener,
            state: Mutex::new(State::default()),
            started: AtomicBool::new(true),
            messages: messages_tx,
            events: events_tx.clone(),
        });

        tokio::spawn(async move {
            while let Some(event) = router_rx.recv().await {
                let _ = events_tx.send(PlumtreeServiceEvent::Router(event));
            }
        });

        let flush_service = service.clone();
        tokio::spawn(async move {
            flush_service.run_lazy_push_loop().await;
        });

        service
    }

    pub fn subscribe_messages(&self) -> broadcast::Receiver<TopicMessage> {
        self.messages.subscribe()
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<PlumtreeServiceEvent> {
        self.events.subscribe()
    }

    pub fn subscribe_topic(&self, topic: &str) {
        self.router.subscribe(topic);
    }

    pub fn unsubscribe_topic(&self, topic: &str) {
        self.router.unsubscribe(topic);
    }

    pub fn stop(&self) {
        self.started.store(false, Ordering::SeqCst);
    }

    /// Registers a newly connected peer's stream and spawns its reader loop
    /// (§4.10).
    pub fn handle_peer_connected(self: &Arc<Self>, peer: PeerId, stream: Box<dyn MuxedStream>) {
        self.router.handle_peer_connected(peer);
        let shared: SharedStream = Arc::new(AsyncMutex::new(stream));
        self.state.lock().unwrap().peer_streams.insert(peer, shared.clone());

        let this = self.clone();
        tokio::spawn(async move {
            this.run_reader(peer, shared).await;
        });
    }

    pub fn handle_peer_disconnected(&self, peer: PeerId) {
        self.state.lock().unwrap().peer_streams.remove(&peer);
        self.router.handle_peer_disconnected(peer);
    }

    /// Publishes `payload` on `topic` (§4.10 `Publish`).
    pub async fn publish(&self, topic: &str, payload: Bytes) -> Result<MessageId, PlumtreeError> {
        if !self.started.load(Ordering::SeqCst) {
            return Err(PlumtreeError::NotStarted);
        }
        if payload.len() > self.router.config().max_message_size {
            return Err(PlumtreeError::MessageTooLarge);
        }
        if !self.router.is_subscribed(topic) {
            return Err(PlumtreeError::NotSubscribed);
        }

        let seqno = {
            let mut state = self.state.lock().unwrap();
            let seqno = state.next_seqno;
            state.next_seqno += 1;
            seqno
        };
        let message_id = MessageId::new(self.local_peer, seqno);
        let gossip = PlumtreeGossip {
            message_id: message_id.clone(),
            topic: topic.to_string(),
            payload: payload.clone(),
            source: self.local_peer,
            hop_count: 0,
        };

        let (eager, lazy) = self.router.register_published(gossip.clone());
        self.send_gossip_to(&eager, &gossip).await;
        for peer in lazy {
            self.buffer.add(
                PlumtreeIHaveEntry {
                    message_id: message_id.clone(),
                    topic: topic.to_string(),
                },
                peer,
            );
        }

        let _ = self.messages.send(TopicMessage {
            topic: topic.to_string(),
            message_id: message_id.clone(),
            payload,
            source: self.local_peer,
        });

        Ok(message_id)
    }

    async fn run_reader(self: Arc<Self>, peer: PeerId, stream: SharedStream) {
        let max_size = self.router.config().max_message_size;
        loop {
            let raw = {
                let mut guard = stream.lock().await;
                guard.read_message(max_size).await
            };
            let raw = match raw {
                Ok(bytes) if !bytes.is_empty() => bytes,
                _ => break,
            };
            let rpc: pb::PlumtreeRpc = match decode_rpc(&raw) {
                Ok(rpc) => rpc,
                Err(e) => {
                    warn!("dropping malformed plumtree RPC from {peer}: {e}");
                    continue;
                }
            };
            self.handle_incoming_rpc(peer, rpc).await;
        }
        self.handle_peer_disconnected(peer);
    }

    /// Decodes and processes every envelope section of an incoming RPC
    /// (§4.10 `Incoming RPC`).
    async fn handle_incoming_rpc(self: &Arc<Self>, from: PeerId, rpc: pb::PlumtreeRpc) {
        for wire in rpc.gossip {
            let gossip = match from_wire_gossip(wire) {
                Some(g) => g,
                None => continue,
            };
            let topic = gossip.topic.clone();
            let message_id = gossip.message_id.clone();
            let result = self.router.handle_gossip(gossip, from);

            if let Some(delivered) = result.deliver_to_subscribers {
                let _ = self.messages.send(TopicMessage {
                    topic: topic.clone(),
                    message_id: delivered.message_id.clone(),
                    payload: delivered.payload.clone(),
                    source: delivered.source,
                });
                if !result.forward_to.is_empty() {
                    let forwarded = PlumtreeGossip {
                        hop_count: delivered.hop_count + 1,
                        ..delivered
                    };
                    self.send_gossip_to(&result.forward_to, &forwarded).await;
                }
            }
            for peer in result.lazy_notify {
                self.buffer.add(
                    PlumtreeIHaveEntry {
                        message_id: message_id.clone(),
                        topic: topic.clone(),
                    },
                    peer,
                );
            }
            if result.prune_sender {
                self.send_prune(from, &topic).await;
            }
        }

        for wire in rpc.ihave {
            let entry = PlumtreeIHaveEntry {
                message_id: MessageId::from_bytes(wire.message_id),
                topic: wire.topic,
            };
            let result = self.router.handle_ihave(vec![entry], from);
            for id in result.start_timers {
                self.spawn_ihave_timer(id);
            }
        }

        for wire in rpc.graft {
            let message_id = if wire.message_id.is_empty() {
                None
            } else {
                Some(MessageId::from_bytes(wire.message_id))
            };
            let result = self.router.handle_graft(&wire.topic, message_id, from);
            if let Some(gossip) = result.resend {
                self.send_gossip_to(&[from], &gossip).await;
            }
        }

        for wire in rpc.prune {
            self.router.handle_prune(&wire.topic, from);
        }
    }

    fn spawn_ihave_timer(self: &Arc<Self>, id: MessageId) {
        let this = self.clone();
        let timeout = self.router.config().ihave_timeout;
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if let Some(result) = this.router.handle_ihave_timeout(&id) {
                this.send_graft(result.graft_peer, &result.graft_topic, Some(result.graft_message_id))
                    .await;
            }
        });
    }

    async fn run_lazy_push_loop(self: Arc<Self>) {
        let delay = self.router.config().lazy_push_delay;
        loop {
            tokio::time::sleep(delay).await;
            if !self.started.load(Ordering::SeqCst) {
                continue;
            }
            let flushed = self.buffer.flush();
            for (peer, entries) in flushed {
                let wire = entries
                    .into_iter()
                    .map(|e| pb::PlumtreeIHave {
                        message_id: e.message_id.as_bytes().to_vec(),
                        topic: e.topic,
                    })
                    .collect();
                let rpc = pb::PlumtreeRpc {
                    gossip: Vec::new(),
                    ihave: wire,
                    graft: Vec::new(),
                    prune: Vec::new(),
                };
                self.send_rpc(peer, &rpc).await;
            }
        }
    }

    async fn send_gossip_to(&self, peers: &[PeerId], gossip: &PlumtreeGossip) {
        let rpc = pb::PlumtreeRpc {
            gossip: vec![to_wire_gossip(gossip)],
            ihave: Vec::new(),
            graft: Vec::new(),
            prune: Vec::new(),
        };
        for peer in peers {
            self.send_rpc(*peer, &rpc).await;
        }
    }

    async fn send_graft(&self, peer: PeerId, topic: &str, message_id: Option<MessageId>) {
        let rpc = pb::PlumtreeRpc {
            gossip: Vec::new(),
            ihave: Vec::new(),
            graft: vec![pb::PlumtreeGraft {
                message_id: message_id.map(|m| m.as_bytes().to_vec()).unwrap_or_default(),
                topic: topic.to_string(),
            }],
            prune: Vec::new(),
        };
        self.send_rpc(peer, &rpc).await;
        let _ = self.events.send(PlumtreeServiceEvent::GraftSent {
            topic: topic.to_string(),
            peer,
        });
    }

    async fn send_prune(&self, peer: PeerId, topic: &str) {
        let rpc = pb::PlumtreeRpc {
            gossip: Vec::new(),
            ihave: Vec::new(),
            graft: Vec::new(),
            prune: vec![pb::PlumtreePrune {
                topic: topic.to_string(),
            }],
        };
        self.send_rpc(peer, &rpc).await;
        let _ = self.events.send(PlumtreeServiceEvent::PruneSent {
            topic: topic.to_string(),
            peer,
        });
    }

    async fn send_rpc(&self, peer: PeerId, rpc: &pb::PlumtreeRpc) {
        let stream = self.state.lock().unwrap().peer_streams.get(&peer).cloned();
        let Some(stream) = stream else {
            trace!("no stream for plumtree peer {peer}, dropping RPC");
            return;
        };
        let frame = messages::frame(rpc);
        if stream.lock().await.write_message(&frame).await.is_err() {
            debug!("failed to write plumtree RPC to {peer}");
            self.handle_peer_disconnected(peer);
        }
    }

    /// Opens an outbound plumtree stream to `peer` and registers it (§4.10,
    /// used by the host when establishing a new connection).
    pub async fn open_peer_stream(self: &Arc<Self>, peer: PeerId) -> std::io::Result<()> {
        let stream = self.opener.new_stream(peer, PLUMTREE_PROTOCOL).await?;
        self.handle_peer_connected(peer, stream);
        Ok(())
    }
}

fn decode_rpc(raw: &[u8]) -> std::io::Result<pb::PlumtreeRpc> {
    let (_, body) = messages::read_length_prefix(raw)?;
    messages::decode(body)
}

fn to_wire_gossip(gossip: &PlumtreeGossip) -> pb::PlumtreeGossip {
    pb::PlumtreeGossip {
        message_id: gossip.message_id.as_bytes().to_vec(),
        topic: gossip.topic.clone(),
        data: gossip.payload.to_vec(),
        source: gossip.source.to_bytes(),
        hop_count: gossip.hop_count,
    }
}

fn from_wire_gossip(wire: pb::PlumtreeGossip) -> Option<PlumtreeGossip> {
    Some(PlumtreeGossip {
        message_id: MessageId::from_bytes(wire.message_id),
        topic: wire.topic,
        payload: Bytes::from(wire.data),
        source: PeerId::from_bytes(&wire.source).ok()?,
        hop_count: wire.hop_count,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_gossip_round_trips() {
        let gossip = PlumtreeGossip {
            message_id: MessageId::new(PeerId::random(), 3),
            topic: "t".to_string(),
            payload: Bytes::from_static(b"hello"),
            source: PeerId::random(),
            hop_count: 2,
        };
        let wire = to_wire_gossip(&gossip);
        let back = from_wire_gossip(wire).unwrap();
        assert_eq!(back.topic, gossip.topic);
        assert_eq!(back.payload, gossip.payload);
        assert_eq!(back.hop_count, gossip.hop_count);
        assert_eq!(back.source, gossip.source);
    }
}
