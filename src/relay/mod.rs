// Copyright 2022-2024 Protocol Labs
// SPDX-License-Identifier: MIT
//! Circuit Relay v2: HOP/STOP control planes, reservation lifecycle, and
//! bidirectional circuit relaying (§4.5–§4.7).

mod client;
mod connection;
pub(crate) mod messages;
mod server;

pub use client::{RelayClient, RelayClientEvent, RelayListener, Reservation};
pub use connection::{ActiveCircuit, CircuitLimit, RelayedConnection};
pub use messages::HopStatus;
pub use server::{
    build_relay_addresses, relay_streams, CircuitId, RelayServer, RelayServerConfig,
    RelayServerEvent, ServerReservation,
};
