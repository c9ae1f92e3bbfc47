// Copyright 2022-2024 Protocol Labs
// SPDX-License-Identifier: MIT
//! Bounded per-peer IHave batcher (§4.11).

use std::collections::HashMap;
use std::sync::Mutex;

use crate::peer::PeerId;
use crate::plumtree::router::PlumtreeIHaveEntry;

struct State {
    pending: HashMap<PeerId, Vec<PlumtreeIHaveEntry>>,
    total: usize,
}

impl Default for State {
    fn default() -> Self {
        Self {
            pending: HashMap::new(),
            total: 0,
        }
    }
}

/// Batches IHave entries per lazy peer between flushes. `add` drops
/// silently once either cap would be exceeded: the eager path still
/// guarantees delivery, so dropping a lazy advertisement only costs an
/// extra round of IHave/Graft repair, never a missed message (§4.11).
pub struct LazyPushBuffer {
    max_batch_size: usize,
    max_total_entries: usize,
    state: Mutex<State>,
}

impl LazyPushBuffer {
    pub fn new(max_batch_size: usize, max_total_entries: usize) -> Self {
        Self {
            max_batch_size,
            max_total_entries,
            state: Mutex::new(State::default()),
        }
    }

    pub fn add(&self, entry: PlumtreeIHaveEntry, peer: PeerId) {
        let mut state = self.state.lock().unwrap();
        if state.total >= self.max_total_entries {
            return;
        }
        let batch = state.pending.entry(peer).or_default();
        if batch.len() >= self.max_batch_size {
            return;
        }
        batch.push(entry);
        state.total += 1;
    }

    /// Atomically takes the entire pending map and resets counts to zero.
    pub fn flush(&self) -> HashMap<PeerId, Vec<PlumtreeIHaveEntry>> {
        let mut state = self.state.lock().unwrap();
        state.total = 0;
        std::mem::take(&mut state.pending)
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().unwrap().pending.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(n: u8) -> PlumtreeIHaveEntry {
        PlumtreeIHaveEntry {
            message_id: crate::plumtree::router::MessageId::from_bytes(vec![n]),
            topic: "t".to_string(),
        }
    }

    #[test]
    fn per_peer_batch_cap_drops_beyond_limit() {
        let buffer = LazyPushBuffer::new(2, 100);
        let peer = PeerId::random();
        buffer.add(entry(1), peer);
        buffer.add(entry(2), peer);
        buffer.add(entry(3), peer);
        let flushed = buffer.flush();
        assert_eq!(flushed.get(&peer).unwrap().len(), 2);
    }

    #[test]
    fn flush_resets_state_atomically() {
        let buffer = LazyPushBuffer::new(10, 10);
        let peer = PeerId::random();
        buffer.add(entry(1), peer);
        let first = buffer.flush();
        assert_eq!(first.len(), 1);
        assert!(buffer.is_empty());
        let second = buffer.flush();
        assert!(second.is_empty());
    }
}
