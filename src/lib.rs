// Copyright 2022-2024 Protocol Labs
// SPDX-License-Identifier: MIT
mod error;
mod interfaces;
mod node;
mod peer;
mod stats;
mod timestamp;

pub mod plumtree;
pub mod pool;
pub mod relay;
pub mod tls;

#[cfg(any(test, feature = "arb"))]
mod arb;

pub use error::{PlumtreeError, PoolError, RelayError, TlsError};
pub use interfaces::{
    ConnectionGater, Direction, GateStage, HandlerRegistry, MuxedStream, PeerStore, PingProvider,
    StreamOpener,
};
pub use node::{Node, NodeConfig, NodeEvents};
pub use peer::{Keypair, Multiaddr, PeerId, PublicKey};
pub use timestamp::Timestamp;
