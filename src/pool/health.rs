// Copyright 2022-2024 Protocol Labs
// SPDX-License-Identifier: MIT
//! Health monitor: periodic liveness probing of tracked peers (§4.4).

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use futures::stream::FuturesUnordered;
use futures::StreamExt;
use log::warn;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::interfaces::PingProvider;
use crate::peer::PeerId;
use crate::stats;

/// Health monitor configuration (§6 defaults).
#[derive(Debug, Clone, Copy)]
pub struct HealthMonitorConfig {
    pub interval: Duration,
    pub timeout: Duration,
    pub max_failures: u32,
    pub check_immediately: bool,
}

impl Default for HealthMonitorConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            timeout: Duration::from_secs(10),
            max_failures: 3,
            check_immediately: false,
        }
    }
}

struct State {
    next_check: HashMap<PeerId, Instant>,
    failure_count: HashMap<PeerId, u32>,
}

/// A cooperative actor that probes tracked peers on a 1-second tick and
/// reports sustained failures to its owner (the connection pool) via an
/// unbounded channel rather than a direct callback, keeping the monitor
/// free of any reference back into the pool.
pub struct HealthMonitor<P: PingProvider + 'static> {
    config: HealthMonitorConfig,
    state: Arc<Mutex<State>>,
    ping: Arc<P>,
    failed_tx: mpsc::UnboundedSender<PeerId>,
    loop_handle: Mutex<Option<JoinHandle<()>>>,
}

impl<P: PingProvider + 'static> HealthMonitor<P> {
    pub fn new(
        ping: Arc<P>,
        config: HealthMonitorConfig,
    ) -> (Self, mpsc::UnboundedReceiver<PeerId>) {
        let (failed_tx, failed_rx) = mpsc::unbounded_channel();
        (
            Self {
                config,
                state: Arc::new(Mutex::new(State {
                    next_check: HashMap::new(),
                    failure_count: HashMap::new(),
                })),
                ping,
                failed_tx,
                loop_handle: Mutex::new(None),
            },
            failed_rx,
        )
    }

    pub fn is_monitoring(&self, peer: &PeerId) -> bool {
        self.state.lock().unwrap().next_check.contains_key(peer)
    }

    /// Starts monitoring `peer`, launching the tick loop if it isn't
    /// already running (§4.4).
    pub fn start_monitoring(self: &Arc<Self>, peer: PeerId) {
        let now = Instant::now();
        let first_check = if self.config.check_immediately {
            now
        } else {
            now + self.config.interval
        };
        let mut state = self.state.lock().unwrap();
        let was_empty = state.next_check.is_empty();
        state.next_check.insert(peer, first_check);
        state.failure_count.entry(peer).or_insert(0);
        drop(state);

        if was_empty {
            self.ensure_loop_running();
        }
    }

    /// Stops monitoring `peer`; cancels the tick loop once no peers remain.
    pub fn stop_monitoring(&self, peer: &PeerId) {
        let mut state = self.state.lock().unwrap();
        state.next_check.remove(peer);
        state.failure_count.remove(peer);
        if state.next_check.is_empty() {
            if let Some(handle) = self.loop_handle.lock().unwrap().take() {
                handle.abort();
            }
        }
    }

    fn ensure_loop_running(self: &Arc<Self>) {
        let mut handle = self.loop_handle.lock().unwrap();
        if handle.is_some() {
            return;
        }
        let this = self.clone();
        *handle = Some(tokio::spawn(async move { this.run_loop().await }));
    }

    async fn run_loop(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(Duration::from_secs(1));
        loop {
            ticker.tick().await;
            let due: Vec<PeerId> = {
                let state = self.state.lock().unwrap();
                if state.next_check.is_empty() {
                    break;
                }
                let now = Instant::now();
                state
                    .next_check
                    .iter()
                    .filter(|(_, &at)| at <= now)
                    .map(|(p, _)| *p)
                    .collect()
            };
            if due.is_empty() {
                continue;
            }

            let mut probes = FuturesUnordered::new();
            for peer in due {
                let ping = self.ping.clone();
                let timeout = self.config.timeout;
                probes.push(async move {
                    let outcome = tokio::time::timeout(timeout, ping.ping(peer)).await;
                    (peer, outcome.is_ok() && outcome.unwrap().is_ok())
                });
            }

            while let Some((peer, ok)) = probes.next().await {
                self.record_probe_result(peer, ok);
            }
        }
        self.loop_handle.lock().unwrap().take();
    }

    fn record_probe_result(&self, peer: PeerId, ok: bool) {
        let mut state = self.state.lock().unwrap();
        if !state.next_check.contains_key(&peer) {
            return;
        }
        state.next_check.insert(peer, Instant::now() + self.config.interval);
        if ok {
            state.failure_count.insert(peer, 0);
            stats::HEALTH_PROBE_SUCCESS.inc();
            return;
        }
        stats::HEALTH_PROBE_FAILURE.inc();
        let count = state.failure_count.entry(peer).or_insert(0);
        *count += 1;
        if *count >= self.config.max_failures {
            *count = 0;
            drop(state);
            warn!("peer {peer} failed {} consecutive health checks", self.config.max_failures);
            stats::HEALTH_CHECK_FAILED_PEERS.inc();
            let _ = self.failed_tx.send(peer);
        }
    }
}
