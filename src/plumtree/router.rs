// Copyright 2022-2024 Protocol Labs
// SPDX-License-Identifier: MIT
//! Plumtree router: a pure state machine for epidemic broadcast trees
//! (§4.9). Every method mutates state under a single lock and returns a
//! structured result describing side effects for [`super::service::PlumtreeService`]
//! to execute; no I/O happens in here.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::mpsc;

use crate::peer::PeerId;
use crate::stats;
use crate::timestamp::Timestamp;

/// Deterministic dedup key: `source ‖ big-endian u64 seqno` (§3).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MessageId(Bytes);

impl MessageId {
    pub fn new(source: PeerId, seqno: u64) -> Self {
        let mut bytes = source.to_bytes();
        bytes.extend_from_slice(&seqno.to_be_bytes());
        Self(Bytes::from(bytes))
    }

    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self(Bytes::from(bytes))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

/// A gossip message held in the message store until its TTL (§3).
#[derive(Debug, Clone)]
pub struct PlumtreeGossip {
    pub message_id: MessageId,
    pub topic: String,
    pub payload: Bytes,
    pub source: PeerId,
    pub hop_count: u32,
}

/// Wire-independent IHave entry (§3): transient, not stored.
#[derive(Debug, Clone)]
pub struct PlumtreeIHaveEntry {
    pub message_id: MessageId,
    pub topic: String,
}

/// Plumtree configuration (§6 defaults).
#[derive(Debug, Clone, Copy)]
pub struct PlumtreeConfig {
    pub ihave_timeout: Duration,
    pub lazy_push_delay: Duration,
    pub max_ihave_batch_size: usize,
    pub max_message_size: usize,
    pub seen_ttl: Duration,
    pub max_seen_entries: usize,
    pub message_store_ttl: Duration,
    pub max_stored_messages: usize,
}

impl Default for PlumtreeConfig {
    fn default() -> Self {
        Self {
            ihave_timeout: Duration::from_secs(3),
            lazy_push_delay: Duration::from_millis(200),
            max_ihave_batch_size: 50,
            max_message_size: 4 * 1024 * 1024,
            seen_ttl: Duration::from_secs(120),
            max_seen_entries: 10_000,
            message_store_ttl: Duration::from_secs(60),
            max_stored_messages: 1_000,
        }
    }
}

/// Result of [`PlumtreeRouter::handle_gossip`] (§4.9).
#[derive(Debug, Clone, Default)]
pub struct HandleGossipResult {
    pub deliver_to_subscribers: Option<PlumtreeGossip>,
    pub forward_to: Vec<PeerId>,
    pub lazy_notify: Vec<PeerId>,
    pub prune_sender: bool,
}

/// Result of [`PlumtreeRouter::handle_ihave`]: ids needing a fresh timer.
#[derive(Debug, Clone, Default)]
pub struct HandleIHaveResult {
    pub start_timers: Vec<MessageId>,
}

/// Result of [`PlumtreeRouter::handle_ihave_timeout`] (§4.9): a GRAFT to send.
#[derive(Debug, Clone)]
pub struct IHaveTimeoutResult {
    pub graft_peer: PeerId,
    pub graft_topic: String,
    pub graft_message_id: MessageId,
}

/// Result of [`PlumtreeRouter::handle_graft`]: whether the sender should be
/// re-sent the full message from the store.
#[derive(Debug, Clone, Default)]
pub struct GraftResult {
    pub resend: Option<PlumtreeGossip>,
}

/// Events the host can subscribe to for observability (§6).
#[derive(Debug, Clone)]
pub enum PlumtreeEvent {
    MessageReceived(MessageId),
    MessagePublished(MessageId),
    MessageDuplicate(MessageId, PeerId),
    PeerAddedToEager(String, PeerId),
    PeerMovedToLazy(String, PeerId),
    GraftReceived(String, PeerId),
    PruneReceived(String, PeerId),
    IHaveTimeout(MessageId),
    PeerConnected(PeerId),
    PeerDisconnected(PeerId),
}

struct PendingIHave {
    peer: PeerId,
    topic: String,
}

struct State {
    eager_peers: HashMap<String, HashSet<PeerId>>,
    lazy_peers: HashMap<String, HashSet<PeerId>>,
    subscribed_topics: HashSet<String>,
    connected_peers: HashSet<PeerId>,
    seen_messages: HashMap<MessageId, Timestamp>,
    message_store: HashMap<MessageId, PlumtreeGossip>,
    pending_ihaves: HashMap<MessageId, PendingIHave>,
}

impl Default for State {
    fn default() -> Self {
        Self {
            eager_peers: HashMap::new(),
            lazy_peers: HashMap::new(),
            subscribed_topics: HashSet::new(),
            connected_peers: HashSet::new(),
            seen_messages: HashMap::new(),
            message_store: HashMap::new(),
            pending_ihaves: HashMap::new(),
        }
    }
}

/// Per-topic eager/lazy peer counts, for metrics and invariant tests (§4.9 [ADDED]).
#[derive(Debug, Clone, Copy, Default)]
pub struct TopicStats {
    pub eager: usize,
    pub lazy: usize,
}

/// Pure epidemic-broadcast-tree state machine (§4.9). All mutation happens
/// under a single lock on a plain state struct; nothing in here awaits.
pub struct PlumtreeRouter {
    config: PlumtreeConfig,
    state: Mutex<State>,
    events: mpsc::UnboundedSender<PlumtreeEvent>,
}

impl PlumtreeRouter {
    pub fn new(config: PlumtreeConfig) -> (Self, mpsc::UnboundedReceiver<PlumtreeEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                config,
                state: Mutex::new(State::default()),
                events: tx,
            },
            rx,
        )
    }

    pub fn config(&self) -> PlumtreeConfig {
        self.config
    }

    /// Subscribes to `topic`: every currently connected peer becomes eager
    /// for it (§4.9).
    pub fn subscribe(&self, topic: &str) {
        let mut state = self.state.lock().unwrap();
        state.subscribed_topics.insert(topic.to_string());
        let peers: Vec<PeerId> = state.connected_peers.iter().copied().collect();
        let eager = state.eager_peers.entry(topic.to_string()).or_default();
        for peer in peers {
            eager.insert(peer);
        }
    }

    pub fn unsubscribe(&self, topic: &str) {
        let mut state = self.state.lock().unwrap();
        state.subscribed_topics.remove(topic);
        state.eager_peers.remove(topic);
        state.lazy_peers.remove(topic);
    }

    pub fn is_subscribed(&self, topic: &str) -> bool {
        self.state.lock().unwrap().subscribed_topics.contains(topic)
    }

    /// Adds `peer` as eager for every currently subscribed topic (§4.9).
    pub fn handle_peer_connected(&self, peer: PeerId) {
        let mut state = self.state.lock().unwrap();
        state.connected_peers.insert(peer);
        let topics: Vec<String> = state.subscribed_topics.iter().cloned().collect();
        for topic in topics {
            state.eager_peers.entry(topic).or_default().insert(peer);
        }
        drop(state);
        let _ = self.events.send(PlumtreeEvent::PeerConnected(peer));
    }

    /// Removes `peer` from every set and drops any IHave it sent (§4.9).
    pub fn handle_peer_disconnected(&self, peer: PeerId) {
        let mut state = self.state.lock().unwrap();
        state.connected_peers.remove(&peer);
        for set in state.eager_peers.values_mut() {
            set.remove(&peer);
        }
        for set in state.lazy_peers.values_mut() {
            set.remove(&peer);
        }
        state.pending_ihaves.retain(|_, p| p.peer != peer);
        drop(state);
        let _ = self.events.send(PlumtreeEvent::PeerDisconnected(peer));
    }

    /// Handles an incoming gossip message from `from` (§4.9).
    pub fn handle_gossip(&self, gossip: PlumtreeGossip, from: PeerId) -> HandleGossipResult {
        let mut state = self.state.lock().unwrap();
        if state.seen_messages.contains_key(&gossip.message_id) {
            // Duplicate: the sender's tree edge was redundant, demote it to lazy.
            let eager = state.eager_peers.entry(gossip.topic.clone()).or_default();
            let was_eager = eager.remove(&from);
            if was_eager {
                state
                    .lazy_peers
                    .entry(gossip.topic.clone())
                    .or_default()
                    .insert(from);
            }
            drop(state);
            stats::PLUMTREE_MESSAGES_DUPLICATE.inc();
            stats::PLUMTREE_PRUNE_SENT.inc();
            if was_eager {
                let _ = self
                    .events
                    .send(PlumtreeEvent::PeerMovedToLazy(gossip.topic.clone(), from));
            }
            let _ = self
                .events
                .send(PlumtreeEvent::MessageDuplicate(gossip.message_id.clone(), from));
            return HandleGossipResult {
                deliver_to_subscribers: None,
                forward_to: Vec::new(),
                lazy_notify: Vec::new(),
                prune_sender: true,
            };
        }

        state
            .seen_messages
            .insert(gossip.message_id.clone(), Timestamp::now());
        state
            .message_store
            .insert(gossip.message_id.clone(), gossip.clone());
        state.pending_ihaves.remove(&gossip.message_id);

        if !state.subscribed_topics.contains(&gossip.topic) {
            return HandleGossipResult::default();
        }

        let forward_to: Vec<PeerId> = state
            .eager_peers
            .get(&gossip.topic)
            .map(|set| set.iter().copied().filter(|p| *p != from).collect())
            .unwrap_or_default();
        let lazy_notify: Vec<PeerId> = state
            .lazy_peers
            .get(&gossip.topic)
            .map(|set| set.iter().copied().filter(|p| *p != from).collect())
            .unwrap_or_default();
        drop(state);

        stats::PLUMTREE_MESSAGES_RECEIVED.inc();
        let _ = self
            .events
            .send(PlumtreeEvent::MessageReceived(gossip.message_id.clone()));

        HandleGossipResult {
            deliver_to_subscribers: Some(gossip),
            forward_to,
            lazy_notify,
            prune_sender: false,
        }
    }

    /// Records IHave advertisements from `from`, returning which ids need a
    /// fresh timeout timer started by the service layer (§4.9).
    pub fn handle_ihave(&self, entries: Vec<PlumtreeIHaveEntry>, from: PeerId) -> HandleIHaveResult {
        let mut state = self.state.lock().unwrap();
        let mut start_timers = Vec::new();
        for entry in entries {
            if state.seen_messages.contains_key(&entry.message_id) {
                continue;
            }
            if !state.subscribed_topics.contains(&entry.topic) {
                continue;
            }
            if state.pending_ihaves.contains_key(&entry.message_id) {
                continue;
            }
            state.pending_ihaves.insert(
                entry.message_id.clone(),
                PendingIHave {
                    peer: from,
                    topic: entry.topic,
                },
            );
            start_timers.push(entry.message_id);
        }
        HandleIHaveResult { start_timers }
    }

    /// Fires when an IHave timer expires. Returns `None` if the entry was
    /// already resolved (delivered, or no longer pending) (§4.9).
    pub fn handle_ihave_timeout(&self, id: &MessageId) -> Option<IHaveTimeoutResult> {
        let mut state = self.state.lock().unwrap();
        if state.seen_messages.contains_key(id) {
            state.pending_ihaves.remove(id);
            return None;
        }
        let pending = state.pending_ihaves.remove(id)?;
        state
            .lazy_peers
            .entry(pending.topic.clone())
            .or_default()
            .remove(&pending.peer);
        state
            .eager_peers
            .entry(pending.topic.clone())
            .or_default()
            .insert(pending.peer);
        drop(state);
        stats::PLUMTREE_IHAVE_TIMEOUT.inc();
        let _ = self.events.send(PlumtreeEvent::IHaveTimeout(id.clone()));
        let _ = self
            .events
            .send(PlumtreeEvent::PeerAddedToEager(pending.topic.clone(), pending.peer));
        stats::PLUMTREE_GRAFT_SENT.inc();
        Some(IHaveTimeoutResult {
            graft_peer: pending.peer,
            graft_topic: pending.topic,
            graft_message_id: id.clone(),
        })
    }

    /// Moves `from` from lazy to eager for `topic`, and if the graft named a
    /// message already in the store, signals a re-send (§4.9).
    pub fn handle_graft(&self, topic: &str, message_id: Option<MessageId>, from: PeerId) -> GraftResult {
        let mut state = self.state.lock().unwrap();
        state.lazy_peers.entry(topic.to_string()).or_default().remove(&from);
        state.eager_peers.entry(topic.to_string()).or_default().insert(from);
        let resend = message_id.and_then(|id| state.message_store.get(&id).cloned());
        drop(state);
        stats::PLUMTREE_GRAFT_RECEIVED.inc();
        let _ = self
            .events
            .send(PlumtreeEvent::GraftReceived(topic.to_string(), from));
        let _ = self
            .events
            .send(PlumtreeEvent::PeerAddedToEager(topic.to_string(), from));
        GraftResult { resend }
    }

    /// Moves `from` from eager to lazy for `topic` (§4.9).
    pub fn handle_prune(&self, topic: &str, from: PeerId) {
        let mut state = self.state.lock().unwrap();
        state.eager_peers.entry(topic.to_string()).or_default().remove(&from);
        state.lazy_peers.entry(topic.to_string()).or_default().insert(from);
        drop(state);
        stats::PLUMTREE_PRUNE_RECEIVED.inc();
        let _ = self
            .events
            .send(PlumtreeEvent::PruneReceived(topic.to_string(), from));
        let _ = self
            .events
            .send(PlumtreeEvent::PeerMovedToLazy(topic.to_string(), from));
    }

    /// Marks `gossip` as seen/stored and returns the current eager/lazy
    /// fan-out for its topic, for a freshly published message (§4.9).
    pub fn register_published(&self, gossip: PlumtreeGossip) -> (Vec<PeerId>, Vec<PeerId>) {
        let mut state = self.state.lock().unwrap();
        let eager: Vec<PeerId> = state
            .eager_peers
            .get(&gossip.topic)
            .map(|s| s.iter().copied().collect())
            .unwrap_or_default();
        let lazy: Vec<PeerId> = state
            .lazy_peers
            .get(&gossip.topic)
            .map(|s| s.iter().copied().collect())
            .unwrap_or_default();
        state.seen_messages.insert(gossip.message_id.clone(), Timestamp::now());
        let id = gossip.message_id.clone();
        state.message_store.insert(gossip.message_id.clone(), gossip);
        drop(state);
        stats::PLUMTREE_MESSAGES_PUBLISHED.inc();
        let _ = self.events.send(PlumtreeEvent::MessagePublished(id));
        (eager, lazy)
    }

    /// Per-topic eager/lazy peer counts (§4.9 [ADDED]).
    pub fn topic_stats(&self, topic: &str) -> TopicStats {
        let state = self.state.lock().unwrap();
        TopicStats {
            eager: state.eager_peers.get(topic).map(|s| s.len()).unwrap_or(0),
            lazy: state.lazy_peers.get(topic).map(|s| s.len()).unwrap_or(0),
        }
    }

    /// Evicts expired `seen`/`message_store` entries, then caps each to its
    /// configured maximum by dropping the oldest (§4.9).
    pub fn cleanup(&self) {
        let mut state = self.state.lock().unwrap();
        let now = Timestamp::now();

        let seen_cutoff = now - self.config.seen_ttl;
        state.seen_messages.retain(|_, t| *t >= seen_cutoff);
        if state.seen_messages.len() > self.config.max_seen_entries {
            let mut entries: Vec<(MessageId, Timestamp)> =
                state.seen_messages.iter().map(|(k, v)| (k.clone(), *v)).collect();
            entries.sort_by_key(|(_, t)| *t);
            let excess = entries.len() - self.config.max_seen_entries;
            for (id, _) in entries.into_iter().take(excess) {
                state.seen_messages.remove(&id);
            }
        }

        let store_cutoff = now - self.config.message_store_ttl;
        let seen = &state.seen_messages;
        let stale: Vec<MessageId> = state
            .message_store
            .keys()
            .filter(|id| seen.get(*id).map(|t| *t < store_cutoff).unwrap_or(true))
            .cloned()
            .collect();
        drop(seen);
        for id in stale {
            state.message_store.remove(&id);
        }
        if state.message_store.len() > self.config.max_stored_messages {
            let ids: Vec<MessageId> = state.message_store.keys().cloned().collect();
            let mut entries: Vec<(MessageId, Timestamp)> = ids
                .into_iter()
                .map(|id| {
                    let seen_at = state.seen_messages.get(&id).copied().unwrap_or(now);
                    (id, seen_at)
                })
                .collect();
            entries.sort_by_key(|(_, t)| *t);
            let excess = entries.len() - self.config.max_stored_messages;
            for (id, _) in entries.into_iter().take(excess) {
                state.message_store.remove(&id);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gossip(id: MessageId, topic: &str, source: PeerId) -> PlumtreeGossip {
        PlumtreeGossip {
            message_id: id,
            topic: topic.to_string(),
            payload: Bytes::from_static(b"payload"),
            source,
            hop_count: 0,
        }
    }

    #[test]
    fn duplicate_gossip_is_never_redelivered() {
        let (router, _rx) = PlumtreeRouter::new(PlumtreeConfig::default());
        let source = PeerId::random();
        let a = PeerId::random();
        router.subscribe("topic");
        router.handle_peer_connected(a);
        let id = MessageId::new(source, 1);
        let first = router.handle_gossip(gossip(id.clone(), "topic", source), a);
        assert!(first.deliver_to_subscribers.is_some());
        let second = router.handle_gossip(gossip(id, "topic", source), a);
        assert!(second.deliver_to_subscribers.is_none());
        assert!(second.prune_sender);
    }

    #[test]
    fn peer_is_in_at_most_one_set_per_topic() {
        let (router, _rx) = PlumtreeRouter::new(PlumtreeConfig::default());
        let source = PeerId::random();
        let a = PeerId::random();
        router.subscribe("topic");
        router.handle_peer_connected(a);
        assert_eq!(router.topic_stats("topic").eager, 1);
        assert_eq!(router.topic_stats("topic").lazy, 0);

        // Duplicate from `a` while eager demotes it to lazy.
        let id = MessageId::new(source, 1);
        router.handle_gossip(gossip(id.clone(), "topic", source), PeerId::random());
        router.handle_gossip(gossip(id, "topic", source), a);
        let stats = router.topic_stats("topic");
        assert_eq!(stats.eager, 0);
        assert_eq!(stats.lazy, 1);
    }

    #[test]
    fn duplicate_from_lazy_peer_is_idempotent() {
        let (router, _rx) = PlumtreeRouter::new(PlumtreeConfig::default());
        let source = PeerId::random();
        let a = PeerId::random();
        router.subscribe("topic");
        // `a` is never connected, so it is in neither set; a duplicate from
        // it must not attempt to remove it from an eager set it was never in.
        let id = MessageId::new(source, 7);
        router.handle_gossip(gossip(id.clone(), "topic", source), PeerId::random());
        let result = router.handle_gossip(gossip(id, "topic", source), a);
        assert!(result.prune_sender);
        assert_eq!(router.topic_stats("topic").lazy, 0);
    }

    #[test]
    fn ihave_timeout_for_already_seen_message_is_none() {
        let (router, _rx) = PlumtreeRouter::new(PlumtreeConfig::default());
        let source = PeerId::random();
        let a = PeerId::random();
        router.subscribe("topic");
        let id = MessageId::new(source, 1);
        router.handle_ihave(
            vec![PlumtreeIHaveEntry {
                message_id: id.clone(),
                topic: "topic".to_string(),
            }],
            a,
        );
        router.handle_gossip(gossip(id.clone(), "topic", source), a);
        assert!(router.handle_ihave_timeout(&id).is_none());
    }

    #[test]
    fn ihave_timeout_promotes_peer_to_eager_and_requests_graft() {
        let (router, _rx) = PlumtreeRouter::new(PlumtreeConfig::default());
        let source = PeerId::random();
        let a = PeerId::random();
        router.subscribe("topic");
        let id = MessageId::new(source, 2);
        router.handle_ihave(
            vec![PlumtreeIHaveEntry {
                message_id: id.clone(),
                topic: "topic".to_string(),
            }],
            a,
        );
        let result = router.handle_ihave_timeout(&id).expect("should graft");
        assert_eq!(result.graft_peer, a);
        assert_eq!(router.topic_stats("topic").eager, 1);
    }

    #[test]
    fn fan_out_forwards_eager_and_lazily_notifies_the_rest() {
        let (router, _rx) = PlumtreeRouter::new(PlumtreeConfig::default());
        let source = PeerId::random();
        let a = PeerId::random();
        let b = PeerId::random();
        let c = PeerId::random();
        router.subscribe("topic");
        for peer in [a, b, c] {
            router.handle_peer_connected(peer);
        }

        // A prior round demotes C to lazy, settling into eager={A,B} lazy={C}
        // (every freshly connected peer starts eager; lazy membership is only
        // ever reached by a duplicate-gossip demotion).
        let settle_id = MessageId::new(source, 0);
        router.handle_gossip(gossip(settle_id.clone(), "topic", source), a);
        router.handle_gossip(gossip(settle_id, "topic", source), c);
        assert_eq!(router.topic_stats("topic").eager, 2);
        assert_eq!(router.topic_stats("topic").lazy, 1);

        let id = MessageId::new(source, 1);
        let result = router.handle_gossip(gossip(id, "topic", source), a);

        assert!(result.deliver_to_subscribers.is_some());
        assert_eq!(result.forward_to, vec![b]);
        assert_eq!(result.lazy_notify, vec![c]);
    }

    #[test]
    fn second_copy_from_an_eager_peer_demotes_it_and_sends_prune() {
        let (router, _rx) = PlumtreeRouter::new(PlumtreeConfig::default());
        let source = PeerId::random();
        let a = PeerId::random();
        let b = PeerId::random();
        router.subscribe("topic");
        router.handle_peer_connected(a);
        router.handle_peer_connected(b);

        let id = MessageId::new(source, 1);
        router.handle_gossip(gossip(id.clone(), "topic", source), a);
        let second = router.handle_gossip(gossip(id, "topic", source), b);

        assert!(second.deliver_to_subscribers.is_none());
        assert!(second.prune_sender);
        let stats = router.topic_stats("topic");
        assert_eq!(stats.eager, 1);
        assert_eq!(stats.lazy, 1);
    }
}
