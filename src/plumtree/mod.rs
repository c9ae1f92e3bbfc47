// Copyright 2022-2024 Protocol Labs
// SPDX-License-Identifier: MIT
//! Plumtree epidemic broadcast trees (§4.9-§4.11): a pure router state
//! machine, a bounded lazy-push batcher, and the service layer that wires
//! both to multiplexed streams (§4.10).

mod buffer;
pub(crate) mod messages;
mod router;
mod service;

pub use buffer::LazyPushBuffer;
pub use router::{
    GraftResult, HandleGossipResult, HandleIHaveResult, IHaveTimeoutResult, MessageId,
    PlumtreeConfig, PlumtreeEvent, PlumtreeGossip, PlumtreeIHaveEntry, PlumtreeRouter, TopicStats,
};
pub use service::{PlumtreeService, PlumtreeServiceEvent, TopicMessage, PLUMTREE_PROTOCOL};
