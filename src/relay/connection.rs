// Copyright 2022-2024 Protocol Labs
// SPDX-License-Identifier: MIT
//! Circuit limits and the client-side handle for a relayed connection (§4.7).

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use crate::error::RelayError;
use crate::interfaces::MuxedStream;
use crate::peer::PeerId;

/// Duration and/or byte ceiling attached to a circuit (§3, §4.6 defaults).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CircuitLimit {
    pub duration: Option<Duration>,
    pub data: Option<u64>,
}

impl CircuitLimit {
    pub const fn new(duration: Duration, data: u64) -> Self {
        Self {
            duration: Some(duration),
            data: Some(data),
        }
    }
}

/// Server-side bookkeeping for a circuit in progress, keyed by `CircuitId`
/// in [`super::server::RelayServer`].
#[derive(Debug, Clone, Copy)]
pub struct ActiveCircuit {
    pub start_time: Instant,
    pub bytes_transferred: u64,
}

impl ActiveCircuit {
    pub fn new(now: Instant) -> Self {
        Self {
            start_time: now,
            bytes_transferred: 0,
        }
    }
}

/// A client-side handle onto a stream relayed through an intermediary peer.
///
/// Owns the underlying stream exclusively. Every read/write first checks
/// the attached [`CircuitLimit`]; once a limit is hit or the connection is
/// closed, all further I/O fails with [`RelayError::LimitExceeded`] or
/// [`RelayError::CircuitClosed`].
pub struct RelayedConnection {
    stream: Box<dyn MuxedStream>,
    relay: PeerId,
    remote_peer: PeerId,
    limit: CircuitLimit,
    start: Instant,
    bytes_read: AtomicU64,
    bytes_written: AtomicU64,
    closed: AtomicBool,
}

impl RelayedConnection {
    pub fn new(
        stream: Box<dyn MuxedStream>,
        relay: PeerId,
        remote_peer: PeerId,
        limit: CircuitLimit,
    ) -> Self {
        Self {
            stream,
            relay,
            remote_peer,
            limit,
            start: Instant::now(),
            bytes_read: AtomicU64::new(0),
            bytes_written: AtomicU64::new(0),
            closed: AtomicBool::new(false),
        }
    }

    pub fn relay(&self) -> PeerId {
        self.relay
    }

    pub fn remote_peer(&self) -> PeerId {
        self.remote_peer
    }

    pub fn limit(&self) -> CircuitLimit {
        self.limit
    }

    pub fn bytes_read(&self) -> u64 {
        self.bytes_read.load(Ordering::Relaxed)
    }

    pub fn bytes_written(&self) -> u64 {
        self.bytes_written.load(Ordering::Relaxed)
    }

    fn check_limits(&self, additional_write: u64) -> Result<(), RelayError> {
        if self.closed.load(Ordering::Relaxed) {
            return Err(RelayError::CircuitClosed);
        }
        if let Some(duration) = self.limit.duration {
            if self.start.elapsed() >= duration {
                self.closed.store(true, Ordering::Relaxed);
                return Err(RelayError::LimitExceeded);
            }
        }
        if let Some(data) = self.limit.data {
            let total = self.bytes_read() + self.bytes_written() + additional_write;
            if total > data {
                self.closed.store(true, Ordering::Relaxed);
                return Err(RelayError::LimitExceeded);
            }
        }
        Ok(())
    }

    pub async fn read(&mut self, max: usize) -> Result<Vec<u8>, RelayError> {
        self.check_limits(0)?;
        let data = self
            .stream
            .read(max)
            .await
            .map_err(|e| RelayError::StreamError(e.to_string()))?;
        self.bytes_read.fetch_add(data.len() as u64, Ordering::Relaxed);
        Ok(data)
    }

    pub async fn write(&mut self, data: &[u8]) -> Result<(), RelayError> {
        self.check_limits(data.len() as u64)?;
        self.stream
            .write(data)
            .await
            .map_err(|e| RelayError::StreamError(e.to_string()))?;
        self.bytes_written
            .fetch_add(data.len() as u64, Ordering::Relaxed);
        Ok(())
    }

    pub async fn close(&mut self) -> Result<(), RelayError> {
        self.closed.store(true, Ordering::Relaxed);
        self.stream
            .close()
            .await
            .map_err(|e| RelayError::StreamError(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    struct NullStream;

    #[async_trait]
    impl MuxedStream for NullStream {
        async fn read(&mut self, _max: usize) -> std::io::Result<Vec<u8>> {
            Ok(Vec::new())
        }
        async fn write(&mut self, _data: &[u8]) -> std::io::Result<()> {
            Ok(())
        }
        async fn close(&mut self) -> std::io::Result<()> {
            Ok(())
        }
        async fn read_message(&mut self, _max_size: usize) -> std::io::Result<Vec<u8>> {
            Ok(Vec::new())
        }
        async fn write_message(&mut self, _data: &[u8]) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn write_exceeding_data_limit_by_one_byte_fails() {
        let mut conn = RelayedConnection::new(
            Box::new(NullStream),
            PeerId::random(),
            PeerId::random(),
            CircuitLimit { duration: None, data: Some(10) },
        );
        conn.write(&[0u8; 10]).await.expect("exactly at limit succeeds");
        assert_eq!(
            conn.write(&[0u8]).await.unwrap_err(),
            RelayError::LimitExceeded
        );
    }
}
