// Copyright 2022-2024 Protocol Labs
// SPDX-License-Identifier: MIT
//! In-process integration tests wiring multiple components together over an
//! in-memory transport, the way the teacher crate's `tests/smoke.rs` wires a
//! cluster of `Service`s over `MemoryTransport` (SPEC_FULL.md §1, ambient
//! test tooling).
//!
//! There is no real wire transport or multiplexer here (both are external
//! collaborators per §1's Non-goals): [`MemoryStream`] and [`NetworkHub`] are
//! a minimal stand-in for `StreamOpener`/`MuxedStream` good enough to drive
//! the circuit-relay and plumtree protocols end to end.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use p2p_core::relay::{CircuitLimit, RelayClient, RelayServer, RelayServerConfig};
use p2p_core::{Multiaddr, MuxedStream, PeerId, PeerStore, StreamOpener};
use p2p_core::plumtree::{PlumtreeConfig, PlumtreeService};

/// One direction's worth of a duplex in-memory stream: every `write`/
/// `write_message` call is delivered as one opaque chunk to the peer's
/// `read`/`read_message`.
struct MemoryStream {
    tx: tokio::sync::mpsc::UnboundedSender<Vec<u8>>,
    rx: tokio::sync::mpsc::UnboundedReceiver<Vec<u8>>,
}

impl MemoryStream {
    fn pair() -> (Self, Self) {
        let (tx_a, rx_a) = tokio::sync::mpsc::unbounded_channel();
        let (tx_b, rx_b) = tokio::sync::mpsc::unbounded_channel();
        (Self { tx: tx_a, rx: rx_b }, Self { tx: tx_b, rx: rx_a })
    }
}

#[async_trait]
impl MuxedStream for MemoryStream {
    async fn read(&mut self, _max: usize) -> std::io::Result<Vec<u8>> {
        Ok(self.rx.recv().await.unwrap_or_default())
    }

    async fn write(&mut self, data: &[u8]) -> std::io::Result<()> {
        self.tx
            .send(data.to_vec())
            .map_err(|_| std::io::Error::new(std::io::ErrorKind::BrokenPipe, "peer gone"))
    }

    async fn close(&mut self) -> std::io::Result<()> {
        Ok(())
    }

    async fn read_message(&mut self, max_size: usize) -> std::io::Result<Vec<u8>> {
        let raw = self
            .rx
            .recv()
            .await
            .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "closed"))?;
        let (len, body) = unsigned_varint::decode::usize(&raw)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e.to_string()))?;
        if len > max_size {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "message too large",
            ));
        }
        Ok(body.to_vec())
    }

    async fn write_message(&mut self, data: &[u8]) -> std::io::Result<()> {
        let mut buf = Vec::with_capacity(data.len() + 10);
        let mut len_buf = unsigned_varint::encode::usize_buffer();
        buf.extend_from_slice(unsigned_varint::encode::usize(data.len(), &mut len_buf));
        buf.extend_from_slice(data);
        self.write(&buf).await
    }
}

type InboundHandler =
    Arc<dyn Fn(PeerId, Box<dyn MuxedStream>) -> Pin<Box<dyn Future<Output = ()> + Send>> + Send + Sync>;

/// A registry of `(peer, protocol) -> inbound handler`, standing in for the
/// wire transport + stream multiplexer (external collaborators per §1):
/// dialing a peer looks up its registered handler and connects a fresh
/// [`MemoryStream`] pair directly to it, with no real network in between.
#[derive(Default)]
struct NetworkHub {
    handlers: Mutex<HashMap<(PeerId, &'static str), InboundHandler>>,
}

impl NetworkHub {
    fn register(&self, peer: PeerId, protocol: &'static str, handler: InboundHandler) {
        self.handlers.lock().unwrap().insert((peer, protocol), handler);
    }
}

/// A `StreamOpener` bound to one logical node's view of the shared
/// [`NetworkHub`]: dialing `peer` over `protocol` hands the remote's
/// registered handler the server side of a fresh stream pair, identifying
/// the dialer by `local_peer` (the identity a real inbound handler would see
/// for whoever opened the stream), and returns the client side to the caller.
#[derive(Clone)]
struct NodeOpener {
    hub: Arc<NetworkHub>,
    local_peer: PeerId,
}

#[async_trait]
impl StreamOpener for NodeOpener {
    async fn new_stream(
        &self,
        peer: PeerId,
        protocol: &'static str,
    ) -> std::io::Result<Box<dyn MuxedStream>> {
        let handler = {
            let handlers = self.hub.handlers.lock().unwrap();
            handlers.get(&(peer, protocol)).cloned()
        }
        .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::NotFound, "no registered handler"))?;
        let (client_side, server_side) = MemoryStream::pair();
        let dialer = self.local_peer;
        tokio::spawn(handler(dialer, Box::new(server_side)));
        Ok(Box::new(client_side))
    }
}

struct FixedPeerStore {
    listen: Vec<Multiaddr>,
}

impl PeerStore for FixedPeerStore {
    fn addresses_of(&self, _peer: &PeerId) -> Vec<Multiaddr> {
        Vec::new()
    }
    fn listen_addresses(&self) -> Vec<Multiaddr> {
        self.listen.clone()
    }
}

fn relay_addr() -> Multiaddr {
    "/ip4/127.0.0.1/tcp/4001".parse().unwrap()
}

const HOP_PROTOCOL: &str = "/libp2p/circuit/relay/0.2.0/hop";
const STOP_PROTOCOL: &str = "/libp2p/circuit/relay/0.2.0/stop";

/// S6: a client reserves on a relay, then a second peer dials through the
/// relay to the first; the relay's STOP stream delivers a `RelayedConnection`
/// to the reserving client's accept queue with the dialing peer as its
/// remote and the relay's configured circuit limit attached.
#[tokio::test(flavor = "multi_thread")]
async fn reserve_then_route_through_relay() {
    let hub = Arc::new(NetworkHub::default());

    let relay_peer = PeerId::random();
    let client_peer = PeerId::random();
    let dialer_peer = PeerId::random();

    let relay_opener = NodeOpener {
        hub: hub.clone(),
        local_peer: relay_peer,
    };
    let relay_store = FixedPeerStore { listen: vec![relay_addr()] };
    let relay_config = RelayServerConfig::default();
    let circuit_limit = relay_config.circuit_limit;
    let (relay_server, _relay_events) =
        RelayServer::new(relay_peer, relay_opener, relay_store, relay_config);
    let relay_server = Arc::new(relay_server);

    {
        let relay_server = relay_server.clone();
        hub.register(
            relay_peer,
            HOP_PROTOCOL,
            Arc::new(move |requester, stream| {
                let relay_server = relay_server.clone();
                Box::pin(async move { relay_server.serve_hop_stream(requester, stream).await })
            }),
        );
    }

    let client_opener = NodeOpener {
        hub: hub.clone(),
        local_peer: client_peer,
    };
    let (client, _client_events) = RelayClient::new(client_opener, CircuitLimit::default());
    let client = Arc::new(client);

    {
        let client = client.clone();
        hub.register(
            client_peer,
            STOP_PROTOCOL,
            Arc::new(move |remote, stream| {
                let client = client.clone();
                Box::pin(async move { client.handle_inbound_stop(remote, stream).await })
            }),
        );
    }

    let reservation = client.reserve(relay_peer).await.expect("reservation succeeds");
    assert_eq!(reservation.relay, relay_peer);

    let dialer_opener = NodeOpener {
        hub: hub.clone(),
        local_peer: dialer_peer,
    };
    let (dialer, _dialer_events) = RelayClient::new(dialer_opener, CircuitLimit::default());

    let accept_client = client.clone();
    let accept_task = tokio::spawn(async move {
        accept_client
            .accept_connection(Some(relay_peer), Some(dialer_peer), Duration::from_secs(5))
            .await
    });

    let outbound = dialer
        .connect_through(relay_peer, client_peer)
        .await
        .expect("connect through relay succeeds");
    assert_eq!(outbound.remote_peer(), client_peer);
    assert_eq!(outbound.relay(), relay_peer);

    let inbound = accept_task
        .await
        .expect("accept task doesn't panic")
        .expect("accept succeeds");
    assert_eq!(inbound.remote_peer(), dialer_peer);
    assert_eq!(inbound.relay(), relay_peer);
    assert_eq!(inbound.limit(), circuit_limit);
}

/// Two plumtree services, each subscribed to the same topic and wired
/// directly to one another's streams, propagate a published message to the
/// remote subscriber.
#[tokio::test(flavor = "multi_thread")]
async fn plumtree_publish_reaches_the_remote_subscriber() {
    let peer_a = PeerId::random();
    let peer_b = PeerId::random();

    let (stream_to_b, stream_to_a) = MemoryStream::pair();

    let opener_a = NodeOpener {
        hub: Arc::new(NetworkHub::default()),
        local_peer: peer_a,
    };
    let opener_b = NodeOpener {
        hub: Arc::new(NetworkHub::default()),
        local_peer: peer_b,
    };

    let service_a = PlumtreeService::new(peer_a, PlumtreeConfig::default(), Arc::new(opener_a));
    let service_b = PlumtreeService::new(peer_b, PlumtreeConfig::default(), Arc::new(opener_b));

    service_a.subscribe_topic("chat");
    service_b.subscribe_topic("chat");

    service_a.handle_peer_connected(peer_b, Box::new(stream_to_b));
    service_b.handle_peer_connected(peer_a, Box::new(stream_to_a));

    let mut b_messages = service_b.subscribe_messages();

    service_a
        .publish("chat", Bytes::from_static(b"hello from a"))
        .await
        .expect("publish succeeds");

    let delivered = tokio::time::timeout(Duration::from_secs(5), b_messages.recv())
        .await
        .expect("message arrives before the timeout")
        .expect("channel stays open");

    assert_eq!(delivered.topic, "chat");
    assert_eq!(delivered.payload, Bytes::from_static(b"hello from a"));
    assert_eq!(delivered.source, peer_a);
}

/// Publishing an oversized payload is rejected before anything is sent.
#[tokio::test]
async fn publish_rejects_oversized_payload() {
    let peer_a = PeerId::random();
    let opener_a = NodeOpener {
        hub: Arc::new(NetworkHub::default()),
        local_peer: peer_a,
    };
    let mut config = PlumtreeConfig::default();
    config.max_message_size = 8;
    let service_a = PlumtreeService::new(peer_a, config, Arc::new(opener_a));
    service_a.subscribe_topic("chat");

    let err = service_a
        .publish("chat", Bytes::from_static(b"this payload is too big"))
        .await
        .unwrap_err();
    assert!(matches!(err, p2p_core::PlumtreeError::MessageTooLarge));
}
