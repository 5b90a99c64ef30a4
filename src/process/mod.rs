//! Peer session layer: listener, per-peer send streams, delivery buffer
//!
//! A `Process` owns one inbound TCP listener and, while `send_messages` runs,
//! one outbound send stream per configured peer. Every connection carries a
//! single envelope. All protocol state (the dependency clock, the buffer of
//! held messages, the delivered log, the per-peer counters) lives in one
//! `SharedState` behind a single lock, so each send or receive/deliver/drain
//! sequence observes and mutates it as one atomic unit. The lock is never
//! held across connection I/O or sleeps.

use std::collections::{BTreeMap, HashMap};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn};
use rand::Rng;
use serde::Serialize;
use thiserror::Error;
use tokio::io::BufReader;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use crate::clock::{DependencyClock, DependencySet, ProcessId, TimeVector};
use crate::message::{self, Envelope};

const DIAL_TIMEOUT: Duration = Duration::from_secs(5);
const QUIESCENCE_POLL: Duration = Duration::from_millis(100);

#[derive(Error, Debug)]
pub enum ProcessError {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        source: std::io::Error,
    },

    #[error("unknown peer: P{0}")]
    UnknownPeer(ProcessId),

    #[error("transport failure: {0}")]
    Transport(#[from] std::io::Error),

    #[error(
        "timed out waiting for quiescence: buffered={buffered}, delivered={delivered}, expected={expected}"
    )]
    QuiescenceTimeout {
        buffered: usize,
        delivered: usize,
        expected: usize,
    },
}

/// A received envelope waiting for its causal history, with the diagnostic
/// reason it was held.
struct HeldEnvelope {
    envelope: Envelope,
    reason: String,
}

/// Everything the causal algorithm mutates, observed as one atomic unit.
struct SharedState {
    clock: DependencyClock,
    buffer: Vec<HeldEnvelope>,
    delivered: Vec<Envelope>,
    sent: BTreeMap<ProcessId, u64>,
    received: BTreeMap<ProcessId, u64>,
}

impl SharedState {
    /// Append to the delivered log and fold the message into the clock.
    fn deliver(&mut self, id: ProcessId, envelope: Envelope) {
        let before = self.clock.local_time().clone();
        self.clock
            .deliver(envelope.sender, &envelope.tm, &envelope.piggybacked);
        info!(
            "P{id} delivered {}: tP {before} -> {}",
            envelope.id,
            self.clock.local_time()
        );
        self.delivered.push(envelope);
    }

    /// Re-scan the buffer until a full pass releases nothing.
    ///
    /// Scans from the start, delivers the first entry whose test now passes,
    /// removes it, and restarts; delivering one message can satisfy the
    /// dependency of the next.
    fn drain(&mut self, id: ProcessId) {
        loop {
            let position = self.buffer.iter().position(|held| {
                self.clock
                    .can_deliver(held.envelope.sender, &held.envelope.tm, &held.envelope.piggybacked)
                    .is_deliverable()
            });
            let Some(index) = position else {
                break;
            };
            let held = self.buffer.remove(index);
            debug!(
                "P{id} releasing {} from buffer ({} still held)",
                held.envelope.id,
                self.buffer.len()
            );
            self.deliver(id, held.envelope);
        }
    }

    fn total_received(&self) -> usize {
        self.received.values().map(|count| *count as usize).sum()
    }
}

/// Statistics snapshot for one process.
#[derive(Clone, Debug, Serialize)]
pub struct ProcessStats {
    pub id: ProcessId,
    pub local_time: TimeVector,
    pub dependency_set: DependencySet,
    pub sent: BTreeMap<ProcessId, u64>,
    pub received: BTreeMap<ProcessId, u64>,
    pub delivered_count: usize,
    pub buffered_count: usize,
}

/// One peer process: an inbound listener plus outbound send streams, driving
/// a shared dependency clock.
pub struct Process {
    id: ProcessId,
    address: String,
    port: u16,
    peers: HashMap<ProcessId, String>,
    state: Arc<Mutex<SharedState>>,
    local_addr: std::sync::Mutex<Option<SocketAddr>>,
    accept_task: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl Process {
    /// Create a process with an all-zero clock and zeroed counters.
    ///
    /// Returns `Arc<Self>` because `start` and `send_messages` spawn tasks
    /// that hold a reference.
    pub fn new(
        id: ProcessId,
        address: impl Into<String>,
        port: u16,
        num_processes: usize,
        peers: HashMap<ProcessId, String>,
    ) -> Arc<Self> {
        let counters: BTreeMap<ProcessId, u64> =
            peers.keys().map(|peer| (*peer, 0)).collect();
        Arc::new(Self {
            id,
            address: address.into(),
            port,
            peers,
            state: Arc::new(Mutex::new(SharedState {
                clock: DependencyClock::new(id, num_processes),
                buffer: Vec::new(),
                delivered: Vec::new(),
                sent: counters.clone(),
                received: counters,
            })),
            local_addr: std::sync::Mutex::new(None),
            accept_task: std::sync::Mutex::new(None),
        })
    }

    /// Bind the listener and start accepting inbound connections.
    pub async fn start(self: &Arc<Self>) -> Result<(), ProcessError> {
        let bind_addr = format!("{}:{}", self.address, self.port);
        let listener = TcpListener::bind(&bind_addr)
            .await
            .map_err(|source| ProcessError::Bind {
                addr: bind_addr,
                source,
            })?;
        let local_addr = listener.local_addr().map_err(ProcessError::Transport)?;
        *self.local_addr.lock().unwrap() = Some(local_addr);
        info!("P{} listening on {local_addr}", self.id);

        let process = Arc::clone(self);
        let handle = tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((socket, _)) => {
                        let process = Arc::clone(&process);
                        tokio::spawn(async move {
                            process.handle_connection(socket).await;
                        });
                    }
                    Err(e) => {
                        warn!("P{} accept error: {e}", process.id);
                    }
                }
            }
        });
        *self.accept_task.lock().unwrap() = Some(handle);
        Ok(())
    }

    /// The address the listener actually bound (useful with port 0).
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock().unwrap()
    }

    async fn handle_connection(&self, socket: TcpStream) {
        let mut reader = BufReader::new(socket);
        match message::read_envelope(&mut reader).await {
            Ok(envelope) => self.receive(envelope).await,
            // A bad inbound payload drops the connection; protocol state is
            // untouched.
            Err(e) => warn!("P{} failed to decode inbound envelope: {e}", self.id),
        }
    }

    /// Run the receive transition for one decoded envelope: deliver now and
    /// drain the buffer, or hold it with the reason the test failed.
    pub async fn receive(&self, envelope: Envelope) {
        let mut state = self.state.lock().await;
        *state.received.entry(envelope.sender).or_insert(0) += 1;
        info!(
            "P{} received {} from P{} (tm={}, V_M={}, tP={})",
            self.id,
            envelope.id,
            envelope.sender,
            envelope.tm,
            envelope.piggybacked,
            state.clock.local_time()
        );

        let verdict =
            state
                .clock
                .can_deliver(envelope.sender, &envelope.tm, &envelope.piggybacked);
        if verdict.is_deliverable() {
            state.deliver(self.id, envelope);
            state.drain(self.id);
        } else {
            let reason = verdict.to_string();
            info!(
                "P{} held {}: {reason} ({} now buffered)",
                self.id,
                envelope.id,
                state.buffer.len() + 1
            );
            state.buffer.push(HeldEnvelope { envelope, reason });
        }
    }

    /// Run one send stream per configured peer and join them all.
    ///
    /// Each stream sends `count_per_peer` messages, sleeping a uniformly
    /// random delay below `60s / per_minute` between sends.
    pub async fn send_messages(self: &Arc<Self>, count_per_peer: u32, per_minute: u32) {
        let interval = Duration::from_secs(60) / per_minute.max(1);
        info!(
            "P{} sending {count_per_peer} messages to each of {} peers at {per_minute}/min",
            self.id,
            self.peers.len()
        );

        let mut targets: Vec<ProcessId> = self.peers.keys().copied().collect();
        targets.sort_unstable();

        let mut streams = Vec::with_capacity(targets.len());
        for target in targets {
            let process = Arc::clone(self);
            streams.push(tokio::spawn(async move {
                process.send_stream(target, count_per_peer, interval).await;
            }));
        }
        for stream in streams {
            let _ = stream.await;
        }

        let state = self.state.lock().await;
        info!(
            "P{} finished sending: tP={}, V_P={}, buffered={}, delivered={}",
            self.id,
            state.clock.local_time(),
            state.clock.entries(),
            state.buffer.len(),
            state.delivered.len()
        );
    }

    async fn send_stream(&self, target: ProcessId, count: u32, interval: Duration) {
        for seq in 1..=u64::from(count) {
            let delay = if interval.is_zero() {
                Duration::ZERO
            } else {
                rand::thread_rng().gen_range(Duration::ZERO..interval)
            };
            tokio::time::sleep(delay).await;

            // Stamp the message and count it as sent before the transport
            // attempt; the clock has already recorded the send either way.
            let envelope = {
                let mut state = self.state.lock().await;
                let (tm, piggybacked) = state.clock.prepare_to_send(target);
                *state.sent.entry(target).or_insert(0) += 1;
                Envelope::new(self.id, target, seq, format!("message {seq}"), tm, piggybacked)
            };

            match self.dispatch(target, &envelope).await {
                Ok(()) => info!(
                    "P{} sent {} to P{target} (tm={})",
                    self.id, envelope.id, envelope.tm
                ),
                Err(e) => warn!(
                    "P{} failed to send {} to P{target}: {e}",
                    self.id, envelope.id
                ),
            }
        }
    }

    /// Open a short-lived connection to `target` and write one envelope.
    async fn dispatch(&self, target: ProcessId, envelope: &Envelope) -> Result<(), ProcessError> {
        let address = self
            .peers
            .get(&target)
            .ok_or(ProcessError::UnknownPeer(target))?;
        let mut stream = tokio::time::timeout(DIAL_TIMEOUT, TcpStream::connect(address))
            .await
            .map_err(|_| {
                std::io::Error::new(std::io::ErrorKind::TimedOut, "connect timed out")
            })??;
        message::write_envelope(&mut stream, envelope).await?;
        Ok(())
    }

    /// Poll until the buffer is empty and every received message has been
    /// delivered, or until `timeout` elapses.
    ///
    /// Advisory only: the outcome does not affect delivery.
    pub async fn wait_for_completion(&self, timeout: Duration) -> Result<(), ProcessError> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let (buffered, delivered, expected) = {
                let state = self.state.lock().await;
                (
                    state.buffer.len(),
                    state.delivered.len(),
                    state.total_received(),
                )
            };
            if buffered == 0 && delivered == expected {
                info!(
                    "P{} quiescent: all {delivered} received messages delivered",
                    self.id
                );
                return Ok(());
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(ProcessError::QuiescenceTimeout {
                    buffered,
                    delivered,
                    expected,
                });
            }
            tokio::time::sleep(QUIESCENCE_POLL).await;
        }
    }

    /// Snapshot of the clock, counters, and buffer/delivered sizes.
    pub async fn stats(&self) -> ProcessStats {
        let state = self.state.lock().await;
        ProcessStats {
            id: self.id,
            local_time: state.clock.local_time().clone(),
            dependency_set: state.clock.entries().clone(),
            sent: state.sent.clone(),
            received: state.received.clone(),
            delivered_count: state.delivered.len(),
            buffered_count: state.buffer.len(),
        }
    }

    /// Drop dependency records the clock has caught up with.
    pub async fn prune(&self) {
        let mut state = self.state.lock().await;
        let before = state.clock.entries().len();
        state.clock.prune_entries();
        debug!(
            "P{} pruned dependency set: {before} -> {} records",
            self.id,
            state.clock.entries().len()
        );
    }

    /// Stop accepting connections and release the listening endpoint.
    pub fn close(&self) {
        if let Some(handle) = self.accept_task.lock().unwrap().take() {
            handle.abort();
        }
        info!("P{} closed", self.id);
    }
}

impl Drop for Process {
    fn drop(&mut self) {
        if let Some(handle) = self.accept_task.lock().unwrap().take() {
            handle.abort();
        }
    }
}
