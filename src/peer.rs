// Copyright 2022-2024 Protocol Labs
// SPDX-License-Identifier: MIT
//! Identity and addressing types.
//!
//! These are re-exported from the standalone `libp2p-identity` and
//! `multiaddr` crates rather than the full `libp2p` umbrella crate: the
//! transport and multiplexer live outside this crate, which never builds
//! a `Swarm` of its own.

pub use libp2p_identity::{Keypair, PeerId, PublicKey};
pub use multiaddr::Multiaddr;
