//! Mesh node
//!
//! A started node runs two background workers:
//!
//! - **accept** (tokio task): reads one message per connection, handles
//!   discovery inline, enqueues everything else on a bounded FIFO and acks
//! - **consumer** (OS thread): drains the FIFO in order and dispatches by
//!   type tag, pausing between messages (shorter pauses when the queue is
//!   deep). Tokio timers tick in milliseconds, so the pause is a thread sleep.
//!
//! `stop()` signals both over a watch channel and joins them with a bounded
//! timeout. Each run gets its own queue and depth counter, so workers left
//! over from an earlier run never touch the current one.

use std::net::SocketAddr;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use futures::future::join_all;
use homeostat_common::{unix_seconds, HomeostatError, PeerError, Result, SharedGenome};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::runtime::Handle;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};

use super::peers::{PeerRecord, PeerTable};
use super::rate_limit::{RateLimiter, RateLimiterStats};
use crate::protocol::codec::{decode_line, read_line, write_line};
use crate::protocol::message::{Ack, Message};
use crate::MeshConfig;

/// Queue depth above which the consumer speeds up
pub const HIGH_DEPTH_THRESHOLD: usize = 100;

/// Consumer pause while the queue is deep
pub const FAST_CONSUMER_DELAY: Duration = Duration::from_micros(300);

/// Consumer pause otherwise
pub const CONSUMER_DELAY: Duration = Duration::from_millis(1);

/// How long `stop()` waits for each background worker
const STOP_TIMEOUT: Duration = Duration::from_secs(1);

/// Poll interval while `stop()` waits for the consumer thread
const JOIN_POLL: Duration = Duration::from_millis(5);

/// Callback invoked by the consumer for one message type
pub type MessageHandler = Arc<dyn Fn(&Message) -> Result<()> + Send + Sync>;

/// Pause between dequeues for a given queue depth
pub fn consumer_delay(depth: usize) -> Duration {
    if depth > HIGH_DEPTH_THRESHOLD {
        FAST_CONSUMER_DELAY
    } else {
        CONSUMER_DELAY
    }
}

/// Message counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MeshStats {
    /// Messages accepted onto the queue (discovery included)
    pub received: u64,
    /// Messages refused (malformed, rate limited, queue full)
    pub dropped: u64,
    /// Messages handed to a handler
    pub dispatched: u64,
    /// Handler failures and panics
    pub handler_errors: u64,
    /// Consumer pauses taken at [`FAST_CONSUMER_DELAY`]
    pub fast_pauses: u64,
    /// Consumer pauses taken at [`CONSUMER_DELAY`]
    pub slow_pauses: u64,
    /// Current queue depth
    pub queue_depth: usize,
}

/// Outcome of a broadcast
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BroadcastReport {
    pub delivered: Vec<String>,
    /// `(peer_id, reason)` for every failed delivery
    pub failed: Vec<(String, String)>,
}

impl BroadcastReport {
    pub fn attempted(&self) -> usize {
        self.delivered.len() + self.failed.len()
    }
}

#[derive(Debug, Default)]
struct Counters {
    received: AtomicU64,
    dropped: AtomicU64,
    dispatched: AtomicU64,
    handler_errors: AtomicU64,
    fast_pauses: AtomicU64,
    slow_pauses: AtomicU64,
}

/// Producer side of one run's inbound queue
#[derive(Clone)]
struct Inbox {
    queue: mpsc::Sender<Message>,
    depth: Arc<AtomicUsize>,
}

/// State shared by the node handle and its background tasks
struct Shared {
    config: MeshConfig,
    peers: PeerTable,
    handlers: DashMap<String, MessageHandler>,
    limiter: RateLimiter,
    counters: Counters,
    local_addr: RwLock<Option<SocketAddr>>,
}

impl Shared {
    fn io_timeout(&self) -> Duration {
        Duration::from_millis(self.config.io_timeout_ms)
    }

    fn ack_ok(&self) -> Ack {
        Ack::Ok {
            node_id: self.config.node_id.clone(),
        }
    }

    fn ack_error(&self, err: &HomeostatError) -> Ack {
        Ack::Error {
            node_id: self.config.node_id.clone(),
            reason: err.to_string(),
        }
    }

    /// Serve one inbound connection: one line in, one ack out.
    ///
    /// Malformed frames (bad UTF-8, oversize, bad JSON) are refused with an
    /// error ack; only timeouts and socket errors end the exchange silently.
    async fn serve(&self, stream: TcpStream, remote: SocketAddr, inbox: &Inbox) -> Result<()> {
        let (mut reader, mut writer) = stream.into_split();
        let timeout = self.io_timeout();

        let (outcome, framing_error) =
            match read_line(&mut reader, self.config.max_frame_bytes, timeout).await {
                Ok(None) => return Ok(()),
                Ok(Some(line)) => (self.admit(&line, remote, inbox), false),
                Err(e @ HomeostatError::Peer(PeerError::Decode(_))) => (Err(e), true),
                Err(e) => return Err(e),
            };

        let ack = match outcome {
            Ok(()) => self.ack_ok(),
            Err(e) => {
                self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                debug!(remote = %remote, error = %e, "Refused inbound message");
                self.ack_error(&e)
            }
        };
        write_line(&mut writer, &ack, timeout).await?;

        if framing_error {
            // Unread input would turn the close into a reset and lose the ack
            let _ = writer.shutdown().await;
            let mut sink = tokio::io::sink();
            let drain = tokio::io::copy(&mut reader, &mut sink);
            let _ = tokio::time::timeout(timeout, drain).await;
        }
        Ok(())
    }

    fn admit(&self, line: &str, remote: SocketAddr, inbox: &Inbox) -> Result<()> {
        let message: Message = decode_line(line)?;

        let rate_key = message
            .origin()
            .map(str::to_string)
            .unwrap_or_else(|| remote.ip().to_string());
        if !self.limiter.check(&rate_key) {
            return Err(PeerError::RateLimited(rate_key).into());
        }

        if message.is_discovery() {
            self.record_discovery(&message, remote)?;
            self.counters.received.fetch_add(1, Ordering::Relaxed);
            return Ok(());
        }

        if let Some(sender) = &message.sender_id {
            self.peers.touch(sender);
        }

        // Counted before the send so the consumer never decrements first
        inbox.depth.fetch_add(1, Ordering::SeqCst);
        match inbox.queue.try_send(message) {
            Ok(()) => {
                self.counters.received.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                let depth = inbox.depth.fetch_sub(1, Ordering::SeqCst).saturating_sub(1);
                Err(PeerError::QueueFull { depth }.into())
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                inbox.depth.fetch_sub(1, Ordering::SeqCst);
                Err(PeerError::NotRunning.into())
            }
        }
    }

    fn record_discovery(&self, message: &Message, remote: SocketAddr) -> Result<()> {
        let peer_id = message
            .get("node_id")
            .and_then(Value::as_str)
            .ok_or_else(|| PeerError::Decode("peer_discovery without node_id".to_string()))?;

        if peer_id == self.config.node_id {
            return Ok(());
        }

        let data = message.get("data").cloned().unwrap_or(Value::Null);
        let address = data
            .get("addr")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| remote.to_string());

        let record = PeerRecord::new(peer_id, address.clone()).with_metadata(data);
        if self.peers.upsert(record) {
            info!(peer_id = %peer_id, address = %address, "Peer discovered");
        }
        Ok(())
    }

    /// Sleep between dequeues; `depth` is what is left after the dequeue
    fn pause(&self, depth: usize) {
        let delay = consumer_delay(depth);
        let counter = if delay == FAST_CONSUMER_DELAY {
            &self.counters.fast_pauses
        } else {
            &self.counters.slow_pauses
        };
        counter.fetch_add(1, Ordering::Relaxed);
        thread::sleep(delay);
    }

    fn dispatch(&self, message: &Message) {
        // Clone the handler out so the map shard is not locked while it runs
        let handler = self.handlers.get(&message.msg_type).map(|h| h.value().clone());
        let Some(handler) = handler else {
            debug!(msg_type = %message.msg_type, "No handler registered");
            return;
        };

        self.counters.dispatched.fetch_add(1, Ordering::Relaxed);
        match std::panic::catch_unwind(AssertUnwindSafe(|| handler(message))) {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                self.counters.handler_errors.fetch_add(1, Ordering::Relaxed);
                warn!(msg_type = %message.msg_type, error = %e, "Message handler failed");
            }
            Err(_) => {
                self.counters.handler_errors.fetch_add(1, Ordering::Relaxed);
                error!(msg_type = %message.msg_type, "Message handler panicked");
            }
        }
    }

    /// Dial `address`, send one message, read the ack
    async fn exchange(&self, address: &str, message: &Message) -> Result<Ack> {
        let timeout = self.io_timeout();
        let stream = tokio::time::timeout(timeout, TcpStream::connect(address))
            .await
            .map_err(|_| HomeostatError::Timeout(format!("connecting to {}", address)))??;

        let (reader, mut writer) = stream.into_split();
        write_line(&mut writer, message, timeout).await?;

        let line = read_line(reader, self.config.max_frame_bytes, timeout)
            .await?
            .ok_or_else(|| PeerError::Decode("connection closed before ack".to_string()))?;
        decode_line(&line)
    }

    /// Send to a known peer, folding every failure into a communication error
    async fn deliver(&self, peer: &PeerRecord, message: &Message) -> Result<()> {
        let communication = |reason: String| -> HomeostatError {
            PeerError::Communication {
                peer_id: peer.peer_id.clone(),
                reason,
            }
            .into()
        };

        match self.exchange(&peer.address, message).await {
            Ok(Ack::Ok { .. }) => {
                self.peers.touch(&peer.peer_id);
                Ok(())
            }
            Ok(Ack::Error { reason, .. }) => Err(communication(reason)),
            Err(e) => Err(communication(e.to_string())),
        }
    }
}

/// Handles of a started node
struct Running {
    shutdown: watch::Sender<bool>,
    accept: JoinHandle<()>,
    consumer: thread::JoinHandle<()>,
    depth: Arc<AtomicUsize>,
}

/// Peer-to-peer mesh node
pub struct MeshNode {
    shared: Arc<Shared>,
    running: Mutex<Option<Running>>,
}

impl MeshNode {
    pub fn new(config: MeshConfig) -> Self {
        let limiter = RateLimiter::new(config.rate_per_sec, config.burst);
        Self {
            shared: Arc::new(Shared {
                config,
                peers: PeerTable::new(),
                handlers: DashMap::new(),
                limiter,
                counters: Counters::default(),
                local_addr: RwLock::new(None),
            }),
            running: Mutex::new(None),
        }
    }

    pub fn node_id(&self) -> &str {
        &self.shared.config.node_id
    }

    pub fn config(&self) -> &MeshConfig {
        &self.shared.config
    }

    /// Bound listen address while running
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.shared.local_addr.read()
    }

    pub fn is_running(&self) -> bool {
        self.running.lock().is_some()
    }

    /// Bind the listener, spawn the accept task and the consumer thread
    #[instrument(skip(self), fields(node_id = %self.shared.config.node_id))]
    pub async fn start(&self) -> Result<SocketAddr> {
        if self.is_running() {
            return Err(PeerError::AlreadyRunning.into());
        }

        let listen = self.shared.config.listen_addr();
        let listener = TcpListener::bind(&listen)
            .await
            .map_err(|e| PeerError::Bind(format!("{}: {}", listen, e)))?;
        let local_addr = listener
            .local_addr()
            .map_err(|e| PeerError::Bind(e.to_string()))?;

        let mut running = self.running.lock();
        if running.is_some() {
            return Err(PeerError::AlreadyRunning.into());
        }

        let (queue_tx, queue_rx) = mpsc::channel(self.shared.config.queue_capacity.max(1));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let depth = Arc::new(AtomicUsize::new(0));
        let inbox = Inbox {
            queue: queue_tx,
            depth: depth.clone(),
        };

        let consumer = {
            let shared = self.shared.clone();
            let depth = depth.clone();
            let shutdown = shutdown_rx.clone();
            let runtime = Handle::current();
            thread::Builder::new()
                .name(format!("mesh-consumer-{}", self.shared.config.node_id))
                .spawn(move || consume_loop(shared, runtime, queue_rx, depth, shutdown))
                .map_err(|e| HomeostatError::Internal(format!("spawning consumer: {}", e)))?
        };
        let accept = tokio::spawn(accept_loop(self.shared.clone(), listener, inbox, shutdown_rx));
        *self.shared.local_addr.write() = Some(local_addr);

        *running = Some(Running {
            shutdown: shutdown_tx,
            accept,
            consumer,
            depth,
        });

        info!(addr = %local_addr, "Mesh node started");
        Ok(local_addr)
    }

    /// Signal both background workers, join them and close the listener.
    /// Stopping a node that is not running is a no-op.
    #[instrument(skip(self), fields(node_id = %self.shared.config.node_id))]
    pub async fn stop(&self) -> Result<()> {
        let Some(running) = self.running.lock().take() else {
            return Ok(());
        };

        let _ = running.shutdown.send(true);

        let abort = running.accept.abort_handle();
        match tokio::time::timeout(STOP_TIMEOUT, running.accept).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(error = %e, "Accept task ended abnormally"),
            Err(_) => {
                warn!("Accept task did not stop in time, aborting");
                abort.abort();
            }
        }

        // A thread cannot be aborted; one stuck in a handler is left detached
        let deadline = Instant::now() + STOP_TIMEOUT;
        while !running.consumer.is_finished() && Instant::now() < deadline {
            tokio::time::sleep(JOIN_POLL).await;
        }
        if !running.consumer.is_finished() {
            warn!("Consumer thread did not stop in time, detaching");
        } else if running.consumer.join().is_err() {
            warn!("Consumer thread ended abnormally");
        }

        *self.shared.local_addr.write() = None;
        info!("Mesh node stopped");
        Ok(())
    }

    /// Register (or replace) the handler for `msg_type`
    pub fn register_handler<F>(&self, msg_type: impl Into<String>, handler: F)
    where
        F: Fn(&Message) -> Result<()> + Send + Sync + 'static,
    {
        self.shared.handlers.insert(msg_type.into(), Arc::new(handler));
    }

    /// Handshake with the node at `address`, recording it as a peer.
    ///
    /// Our listen address is added to `data` as `addr` (unless already set),
    /// so the remote side can dial back.
    #[instrument(skip(self, data), fields(node_id = %self.shared.config.node_id))]
    pub async fn discover_peer(&self, address: &str, data: Value) -> Result<PeerRecord> {
        let mut data = match data {
            Value::Object(map) => map,
            _ => serde_json::Map::new(),
        };
        if let Some(local) = self.local_addr() {
            data.entry("addr").or_insert_with(|| Value::String(local.to_string()));
        }

        let message = Message::discovery(self.node_id(), Value::Object(data));
        let communication = |reason: String| -> HomeostatError {
            PeerError::Communication {
                peer_id: address.to_string(),
                reason,
            }
            .into()
        };

        let peer_id = match self.shared.exchange(address, &message).await {
            Ok(Ack::Ok { node_id }) => node_id,
            Ok(Ack::Error { reason, .. }) => return Err(communication(reason)),
            Err(e) => return Err(communication(e.to_string())),
        };
        if peer_id == self.node_id() {
            return Err(communication("address belongs to this node".to_string()));
        }

        let record = PeerRecord::new(peer_id, address);
        self.shared.peers.upsert(record.clone());
        info!(peer_id = %record.peer_id, address = %address, "Connected to peer");
        Ok(record)
    }

    /// Send `message` to one known peer
    pub async fn send_to_peer(&self, peer_id: &str, message: Message) -> Result<()> {
        let peer = self
            .shared
            .peers
            .get(peer_id)
            .ok_or_else(|| PeerError::UnknownPeer(peer_id.to_string()))?;

        let message = self.stamp(message);
        self.shared.deliver(&peer, &message).await.map_err(|e| {
            warn!(peer_id = %peer_id, error = %e, "Send to peer failed");
            e
        })
    }

    /// Send `message` concurrently to every known peer except its sender and
    /// this node. Unsigned messages are stamped with this node's id.
    /// Per-peer failures are logged and reported, never raised.
    #[instrument(skip(self, message), fields(node_id = %self.shared.config.node_id, msg_type = %message.msg_type))]
    pub async fn broadcast(&self, message: Message) -> BroadcastReport {
        let message = self.stamp(message);
        let sender = message.sender_id.clone().unwrap_or_default();

        let targets: Vec<PeerRecord> = self
            .shared
            .peers
            .list()
            .into_iter()
            .filter(|p| p.peer_id != sender && p.peer_id != self.node_id())
            .collect();

        let outcomes = join_all(targets.iter().map(|peer| self.shared.deliver(peer, &message))).await;

        let mut report = BroadcastReport::default();
        for (peer, outcome) in targets.into_iter().zip(outcomes) {
            match outcome {
                Ok(()) => report.delivered.push(peer.peer_id),
                Err(e) => {
                    warn!(peer_id = %peer.peer_id, error = %e, "Broadcast delivery failed");
                    report.failed.push((peer.peer_id, e.to_string()));
                }
            }
        }

        debug!(
            delivered = report.delivered.len(),
            failed = report.failed.len(),
            "Broadcast complete"
        );
        report
    }

    /// Mutate the shared genome's risk counter and/or ML weight under one
    /// write lock
    pub fn inject(
        &self,
        genome: &SharedGenome,
        anomalies: Option<u64>,
        ml_weight: Option<f64>,
    ) -> Result<()> {
        genome.inject(anomalies, ml_weight)?;
        debug!(?anomalies, ?ml_weight, "Injected genome update");
        Ok(())
    }

    fn stamp(&self, mut message: Message) -> Message {
        if message.sender_id.is_none() {
            message.sender_id = Some(self.node_id().to_string());
        }
        message
    }

    /// Add a peer without a handshake
    pub fn add_peer(&self, record: PeerRecord) {
        self.shared.peers.upsert(record);
    }

    pub fn peer(&self, peer_id: &str) -> Option<PeerRecord> {
        self.shared.peers.get(peer_id)
    }

    pub fn peers(&self) -> Vec<PeerRecord> {
        self.shared.peers.list()
    }

    pub fn peer_count(&self) -> usize {
        self.shared.peers.len()
    }

    /// Remove peers not seen within `max_age`, and idle rate-limit buckets
    pub fn prune_stale(&self, max_age: Duration) -> usize {
        let removed = self.shared.peers.prune_stale(max_age);
        if removed > 0 {
            info!(removed, "Pruned stale peers");
        }
        let idle = self.shared.limiter.prune_idle();
        if idle > 0 {
            debug!(idle, "Pruned idle rate-limit buckets");
        }
        removed
    }

    /// Messages queued in the current run (0 when stopped)
    pub fn queue_depth(&self) -> usize {
        self.running
            .lock()
            .as_ref()
            .map_or(0, |running| running.depth.load(Ordering::SeqCst))
    }

    pub fn stats(&self) -> MeshStats {
        let c = &self.shared.counters;
        MeshStats {
            received: c.received.load(Ordering::Relaxed),
            dropped: c.dropped.load(Ordering::Relaxed),
            dispatched: c.dispatched.load(Ordering::Relaxed),
            handler_errors: c.handler_errors.load(Ordering::Relaxed),
            fast_pauses: c.fast_pauses.load(Ordering::Relaxed),
            slow_pauses: c.slow_pauses.load(Ordering::Relaxed),
            queue_depth: self.queue_depth(),
        }
    }

    pub fn rate_limiter_stats(&self) -> RateLimiterStats {
        self.shared.limiter.stats()
    }

    /// Seconds since `peer_id` was last heard from
    pub fn peer_age(&self, peer_id: &str) -> Option<f64> {
        self.shared
            .peers
            .get(peer_id)
            .map(|p| (unix_seconds() - p.last_seen).max(0.0))
    }
}

impl Drop for MeshNode {
    fn drop(&mut self) {
        if let Some(running) = self.running.get_mut().take() {
            // The consumer thread exits on the signal; its handle is detached
            let _ = running.shutdown.send(true);
            running.accept.abort();
        }
    }
}

async fn accept_loop(
    shared: Arc<Shared>,
    listener: TcpListener,
    inbox: Inbox,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, remote)) => {
                    let shared = shared.clone();
                    let inbox = inbox.clone();
                    tokio::spawn(async move {
                        if let Err(e) = shared.serve(stream, remote, &inbox).await {
                            debug!(remote = %remote, error = %e, "Connection error");
                        }
                    });
                }
                Err(e) => warn!(error = %e, "Accept failed"),
            },
        }
    }
    debug!("Accept loop exiting");
}

/// Consumer thread body. Waiting uses the runtime handle (channels only, no
/// timers); pausing is a thread sleep.
fn consume_loop(
    shared: Arc<Shared>,
    runtime: Handle,
    mut queue: mpsc::Receiver<Message>,
    depth: Arc<AtomicUsize>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let next = runtime.block_on(async {
            tokio::select! {
                biased;
                _ = shutdown.changed() => None,
                message = queue.recv() => message,
            }
        });
        let Some(message) = next else {
            break;
        };

        let left = depth.fetch_sub(1, Ordering::SeqCst).saturating_sub(1);
        shared.dispatch(&message);
        shared.pause(left);
    }
    debug!("Consumer loop exiting");
}
