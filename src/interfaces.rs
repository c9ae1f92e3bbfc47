// Copyright 2022-2024 Protocol Labs
// SPDX-License-Identifier: MIT
//! External collaborator interfaces (§6).
//!
//! These traits are the seams between this crate's core (connection pool,
//! circuit relay, plumtree, TLS binding) and the wire transport, stream
//! multiplexer, peer store, discovery, and ping service, all of which are
//! explicitly out of scope (§1). Nothing in this crate constructs a
//! transport or multiplexer; it only calls through these traits.

use std::time::Duration;

use async_trait::async_trait;

use crate::peer::{Multiaddr, PeerId};

/// A secured, authenticated, multiplexed byte stream.
///
/// Mirrors the teacher crate's reliance on `libp2p`'s stream abstraction,
/// but kept abstract here since the multiplexer is an external collaborator.
#[async_trait]
pub trait MuxedStream: Send + Sync {
    async fn read(&mut self, max: usize) -> std::io::Result<Vec<u8>>;
    async fn write(&mut self, data: &[u8]) -> std::io::Result<()>;
    async fn close(&mut self) -> std::io::Result<()>;

    /// Length-prefixed (varint) read, failing if the declared length exceeds `max_size`.
    async fn read_message(&mut self, max_size: usize) -> std::io::Result<Vec<u8>>;

    /// Length-prefixed (varint) write.
    async fn write_message(&mut self, data: &[u8]) -> std::io::Result<()>;
}

/// Opens outbound streams to a peer over a named protocol.
#[async_trait]
pub trait StreamOpener: Send + Sync {
    async fn new_stream(
        &self,
        peer: PeerId,
        protocol: &'static str,
    ) -> std::io::Result<Box<dyn MuxedStream>>;
}

/// Registers handlers for inbound streams opened under a given protocol id.
#[async_trait]
pub trait HandlerRegistry: Send + Sync {
    fn handle(&self, protocol: &'static str, handler: Box<dyn InboundStreamHandler>);
}

/// Callback invoked for every inbound stream accepted under a registered protocol.
#[async_trait]
pub trait InboundStreamHandler: Send + Sync {
    async fn handle_inbound(&self, peer: PeerId, stream: Box<dyn MuxedStream>);
}

/// Liveness probe collaborator (§4.4, §6).
#[async_trait]
pub trait PingProvider: Send + Sync {
    async fn ping(&self, peer: PeerId) -> anyhow::Result<Duration>;
}

/// Minimal slice of peer-store/address-book functionality this crate needs
/// to compose relay advertisements (§4.6) — full discovery is out of scope.
pub trait PeerStore: Send + Sync {
    fn addresses_of(&self, peer: &PeerId) -> Vec<Multiaddr>;
    fn listen_addresses(&self) -> Vec<Multiaddr>;
}

/// Three-stage connection gate (§6).
pub trait ConnectionGater: Send + Sync {
    fn intercept_dial(&self, peer: Option<&PeerId>, addr: &Multiaddr) -> bool;
    fn intercept_accept(&self, addr: &Multiaddr) -> bool;
    fn intercept_secured(&self, peer: &PeerId, direction: Direction) -> bool;
}

/// Direction of a connection, used by the pool, the gater, and trimming
/// (§4.1's trim ordering ranks inbound before outbound).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    Inbound,
    Outbound,
}

/// Which gating stage rejected a dial/accept/secure attempt; carried in
/// `DisconnectReason::Gated` and `PoolError::Gated`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GateStage {
    Dial,
    Accept,
    Secured,
}

/// A gater that allows everything; useful as a default/test double.
pub struct PermissiveGater;

impl ConnectionGater for PermissiveGater {
    fn intercept_dial(&self, _peer: Option<&PeerId>, _addr: &Multiaddr) -> bool {
        true
    }
    fn intercept_accept(&self, _addr: &Multiaddr) -> bool {
        true
    }
    fn intercept_secured(&self, _peer: &PeerId, _direction: Direction) -> bool {
        true
    }
}
