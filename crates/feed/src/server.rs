//! Broadcast server (run by the sequencer)
//!
//! Every subscriber gets its own connection task and a bounded outbound queue.
//! `publish` copies the shared encoded frame into each queue with `try_send`;
//! a subscriber whose queue is full is evicted instead of slowing the others.

use crate::backlog::{Backlog, EncodedFrame, Replay};
use crate::codec::FeedCodec;
use crate::config::BroadcasterConfig;
use crate::error::{FeedError, FeedResult};
use crate::liveness::{wait_stopped, with_io_timeout, LivenessMonitor, PingSchedule};
use crate::types::{ClientFrame, FeedMessage, SequenceNumber, ServerFrame};
use dashmap::DashMap;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot, watch, Semaphore};
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{accept_async_with_config, WebSocketStream};

/// Identifier assigned to each accepted connection
pub type ConnectionId = u64;

type WsSink = SplitSink<WebSocketStream<TcpStream>, Message>;
type WsSource = SplitStream<WebSocketStream<TcpStream>>;

/// Why a subscriber was dropped by the server
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvictReason {
    QueueOverflow,
    ClientTimeout,
}

/// Server-side view of one connected subscriber
struct Subscriber {
    peer: SocketAddr,
    queue: mpsc::Sender<Arc<EncodedFrame>>,
    evict: Mutex<Option<oneshot::Sender<EvictReason>>>,
    /// Last sequence number written to the socket, plus one (0 = none yet)
    delivered_through: Arc<AtomicU64>,
    connected_at: i64,
}

/// Snapshot of a subscription for observability
#[derive(Debug, Clone, Serialize)]
pub struct SubscriptionInfo {
    pub connection_id: ConnectionId,
    pub peer: String,
    pub last_delivered_sequence_number: Option<SequenceNumber>,
    pub queued: usize,
    pub connected_at: i64,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ServerStats {
    pub messages_published: u64,
    pub connections_accepted: u64,
    pub connections_refused: u64,
    pub evicted_slow: u64,
    pub evicted_timeout: u64,
    pub resync_replies: u64,
}

/// State shared by the publisher path and every connection task
struct Shared {
    config: BroadcasterConfig,
    backlog: RwLock<Backlog>,
    subscribers: DashMap<ConnectionId, Subscriber>,
    next_connection_id: AtomicU64,
    stats: RwLock<ServerStats>,
}

impl Shared {
    /// Remove a subscriber and tell its task why
    fn evict(&self, id: ConnectionId, reason: EvictReason) {
        if let Some((_, subscriber)) = self.subscribers.remove(&id) {
            if let Some(tx) = subscriber.evict.lock().take() {
                let _ = tx.send(reason);
            }
            match reason {
                EvictReason::QueueOverflow => self.stats.write().evicted_slow += 1,
                EvictReason::ClientTimeout => self.stats.write().evicted_timeout += 1,
            }
            tracing::warn!(
                "Evicting subscriber {} ({}): {:?}",
                id,
                subscriber.peer,
                reason
            );
        }
    }
}

/// Removes the subscriber entry when its connection task ends
struct Registration {
    id: ConnectionId,
    shared: Arc<Shared>,
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.shared.subscribers.remove(&self.id);
    }
}

/// Broadcast server (run by the sequencer)
pub struct BroadcastServer {
    shared: Arc<Shared>,
    running: AtomicBool,
    shutdown: Mutex<Option<watch::Sender<bool>>>,
    local_addr: RwLock<Option<SocketAddr>>,
}

impl BroadcastServer {
    /// Create a new broadcast server
    pub fn new(config: BroadcasterConfig) -> Self {
        let backlog = Backlog::new(config.max_retained);
        Self {
            shared: Arc::new(Shared {
                config,
                backlog: RwLock::new(backlog),
                subscribers: DashMap::new(),
                next_connection_id: AtomicU64::new(1),
                stats: RwLock::new(ServerStats::default()),
            }),
            running: AtomicBool::new(false),
            shutdown: Mutex::new(None),
            local_addr: RwLock::new(None),
        }
    }

    pub fn config(&self) -> &BroadcasterConfig {
        &self.shared.config
    }

    /// Start listening for subscribers; returns the bound address
    pub async fn start(&self) -> FeedResult<SocketAddr> {
        if self
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(FeedError::AlreadyRunning);
        }

        let listener = match TcpListener::bind(self.shared.config.bind_addr()).await {
            Ok(listener) => listener,
            Err(e) => {
                self.running.store(false, Ordering::SeqCst);
                return Err(e.into());
            }
        };
        let local_addr = listener.local_addr()?;

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        *self.shutdown.lock() = Some(shutdown_tx);
        *self.local_addr.write() = Some(local_addr);

        let workers = Arc::new(Semaphore::new(self.shared.config.workers.max(1)));
        tokio::spawn(accept_loop(
            listener,
            self.shared.clone(),
            workers,
            shutdown_rx,
        ));

        tracing::info!(
            "Broadcast server listening on {} ({} workers, queue {})",
            local_addr,
            self.shared.config.workers,
            self.shared.config.queue
        );
        Ok(local_addr)
    }

    /// Stop accepting and close every subscriber connection
    pub fn stop(&self) -> FeedResult<()> {
        if !self.running.swap(false, Ordering::SeqCst) {
            return Err(FeedError::NotRunning);
        }
        if let Some(shutdown) = self.shutdown.lock().take() {
            let _ = shutdown.send(true);
        }
        *self.local_addr.write() = None;
        tracing::info!("Broadcast server stopped");
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.read()
    }

    /// Append a message to the retained tail and queue it for every subscriber
    ///
    /// Never waits on subscriber I/O. Subscribers whose queue is full are
    /// evicted.
    pub fn publish(&self, message: FeedMessage) -> FeedResult<()> {
        let frame = Arc::new(EncodedFrame::new(message));
        let mut dropped = Vec::new();
        let receivers;

        {
            // Held across append and fan-out so that a subscriber registering
            // concurrently sees this frame either in its replay or its queue
            let mut backlog = self.shared.backlog.write();
            backlog.append(frame.clone())?;

            receivers = self.shared.subscribers.len();
            for entry in self.shared.subscribers.iter() {
                match entry.queue.try_send(frame.clone()) {
                    Ok(()) => {}
                    Err(TrySendError::Full(_)) => dropped.push(*entry.key()),
                    Err(TrySendError::Closed(_)) => {}
                }
            }
        }

        for id in dropped {
            self.shared.evict(id, EvictReason::QueueOverflow);
        }

        self.shared.stats.write().messages_published += 1;
        tracing::debug!(
            "Published message {} to {} subscribers",
            frame.sequence_number,
            receivers
        );
        Ok(())
    }

    /// Sequence number of the most recent publish
    pub fn last_published(&self) -> Option<SequenceNumber> {
        self.shared.backlog.read().last_sequence()
    }

    /// Oldest sequence number a subscriber can still resume from
    pub fn oldest_retained(&self) -> Option<SequenceNumber> {
        self.shared.backlog.read().oldest()
    }

    /// Get number of connected subscribers
    pub fn connected_clients(&self) -> usize {
        self.shared.subscribers.len()
    }

    pub fn subscriptions(&self) -> Vec<SubscriptionInfo> {
        self.shared
            .subscribers
            .iter()
            .map(|entry| {
                let through = entry.delivered_through.load(Ordering::Relaxed);
                SubscriptionInfo {
                    connection_id: *entry.key(),
                    peer: entry.peer.to_string(),
                    last_delivered_sequence_number: through.checked_sub(1),
                    queued: entry.queue.max_capacity() - entry.queue.capacity(),
                    connected_at: entry.connected_at,
                }
            })
            .collect()
    }

    pub fn stats(&self) -> ServerStats {
        self.shared.stats.read().clone()
    }
}

impl Drop for BroadcastServer {
    fn drop(&mut self) {
        if let Some(shutdown) = self.shutdown.lock().take() {
            let _ = shutdown.send(true);
        }
    }
}

async fn accept_loop(
    listener: TcpListener,
    shared: Arc<Shared>,
    workers: Arc<Semaphore>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = wait_stopped(&mut shutdown) => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    let Ok(permit) = workers.clone().try_acquire_owned() else {
                        tracing::warn!("Refusing subscriber {}: all workers busy", peer);
                        shared.stats.write().connections_refused += 1;
                        continue;
                    };
                    shared.stats.write().connections_accepted += 1;
                    tracing::info!("Subscriber connected from {}", peer);

                    let shared = shared.clone();
                    let shutdown = shutdown.clone();
                    tokio::spawn(async move {
                        let _permit = permit;
                        if let Err(e) = handle_subscriber(stream, peer, shared, shutdown).await {
                            tracing::warn!("Subscriber {} connection error: {}", peer, e);
                        }
                    });
                }
                Err(e) => {
                    tracing::error!("Accept error: {}", e);
                }
            }
        }
    }
    tracing::debug!("Accept loop exited");
}

async fn handle_subscriber(
    stream: TcpStream,
    peer: SocketAddr,
    shared: Arc<Shared>,
    mut shutdown: watch::Receiver<bool>,
) -> FeedResult<()> {
    let config = shared.config.clone();
    let io_timeout = config.io_timeout();

    let ws_config = WebSocketConfig {
        max_message_size: Some(config.max_frame_size),
        max_frame_size: Some(config.max_frame_size),
        ..Default::default()
    };
    let ws_stream = with_io_timeout(
        io_timeout,
        accept_async_with_config(stream, Some(ws_config)),
    )
    .await?;
    let (mut ws_sender, mut ws_receiver) = ws_stream.split();

    let resume_from = with_io_timeout(io_timeout, read_subscribe(&mut ws_receiver)).await?;

    let (queue_tx, mut queue_rx) = mpsc::channel(config.queue.max(1));
    let (evict_tx, mut evict_rx) = oneshot::channel();
    let delivered_through = Arc::new(AtomicU64::new(0));
    let id = shared.next_connection_id.fetch_add(1, Ordering::SeqCst);

    // Snapshot the tail and register under the same read lock
    let (replay, next_sequence_number) = {
        let backlog = shared.backlog.read();
        let replay = backlog.replay_from(resume_from);
        if let Replay::Frames(_) = replay {
            shared.subscribers.insert(
                id,
                Subscriber {
                    peer,
                    queue: queue_tx,
                    evict: Mutex::new(Some(evict_tx)),
                    delivered_through: delivered_through.clone(),
                    connected_at: chrono::Utc::now().timestamp_millis(),
                },
            );
        }
        (replay, resume_from.or_else(|| backlog.next_sequence()))
    };

    let frames = match replay {
        Replay::Frames(frames) => frames,
        Replay::ResyncRequired { oldest_available } => {
            // resume_from is always set when a resync is demanded
            let requested = resume_from.unwrap_or_default();
            tracing::info!(
                "Subscriber {} asked for {} but oldest retained is {:?}; resync required",
                peer,
                requested,
                oldest_available
            );
            shared.stats.write().resync_replies += 1;
            let frame = ServerFrame::ResyncRequired {
                requested,
                oldest_available,
            };
            with_io_timeout(io_timeout, ws_sender.send(Message::Binary(frame.to_bytes())))
                .await?;
            close_quietly(&mut ws_sender, io_timeout).await;
            return Ok(());
        }
    };
    let _registration = Registration {
        id,
        shared: shared.clone(),
    };

    let subscribed = ServerFrame::Subscribed {
        next_sequence_number,
    };
    with_io_timeout(
        io_timeout,
        ws_sender.send(Message::Binary(subscribed.to_bytes())),
    )
    .await?;

    if !frames.is_empty() {
        tracing::info!(
            "Replaying {} retained messages to subscriber {} from {}",
            frames.len(),
            peer,
            frames[0].sequence_number
        );
    }
    for frame in frames {
        send_frame(&mut ws_sender, &frame, &delivered_through, io_timeout).await?;
    }

    let liveness = LivenessMonitor::new(config.client_timeout());
    let mut pings = PingSchedule::new(config.ping_interval());

    loop {
        tokio::select! {
            biased;

            reason = &mut evict_rx => {
                if let Ok(reason) = reason {
                    tracing::debug!("Subscriber {} closed after eviction: {:?}", peer, reason);
                }
                break;
            }

            _ = wait_stopped(&mut shutdown) => break,

            frame = queue_rx.recv() => match frame {
                Some(frame) => {
                    send_frame(&mut ws_sender, &frame, &delivered_through, io_timeout).await?
                }
                None => break,
            },

            // Pending frames are read before the liveness check so a busy
            // subscriber's pongs count
            incoming = ws_receiver.next() => match incoming {
                Some(Ok(Message::Binary(data))) => {
                    liveness.touch();
                    match FeedCodec::decode_client_frame(&data) {
                        Ok(ClientFrame::Pong { nonce }) => {
                            tracing::trace!("Pong {} from {}", nonce, peer);
                        }
                        Ok(ClientFrame::Subscribe { .. }) => {
                            tracing::warn!("Ignoring repeated subscribe from {}", peer);
                        }
                        Err(e) => return Err(e),
                    }
                }
                Some(Ok(Message::Close(_))) | None => {
                    tracing::info!("Subscriber {} disconnected", peer);
                    break;
                }
                Some(Ok(_)) => liveness.touch(),
                Some(Err(e)) => return Err(e.into()),
            },

            nonce = pings.tick() => {
                if liveness.is_expired() {
                    tracing::info!(
                        "Subscriber {} silent for {:?}",
                        peer,
                        liveness.idle_for()
                    );
                    shared.evict(id, EvictReason::ClientTimeout);
                    break;
                }
                let ping = ServerFrame::Ping { nonce };
                with_io_timeout(io_timeout, ws_sender.send(Message::Binary(ping.to_bytes())))
                    .await?;
            }
        }
    }

    close_quietly(&mut ws_sender, io_timeout).await;
    Ok(())
}

/// Wait for the opening `Subscribe` frame
async fn read_subscribe(ws_receiver: &mut WsSource) -> FeedResult<Option<SequenceNumber>> {
    while let Some(msg) = ws_receiver.next().await {
        match msg? {
            Message::Binary(data) => {
                return match FeedCodec::decode_client_frame(&data)? {
                    ClientFrame::Subscribe { resume_from } => Ok(resume_from),
                    other => Err(FeedError::MalformedMessage(format!(
                        "expected subscribe, got {:?}",
                        other
                    ))),
                }
            }
            Message::Close(_) => break,
            _ => {}
        }
    }
    Err(FeedError::MalformedMessage(
        "connection closed before subscribe".to_string(),
    ))
}

async fn send_frame(
    ws_sender: &mut WsSink,
    frame: &EncodedFrame,
    delivered_through: &AtomicU64,
    io_timeout: std::time::Duration,
) -> FeedResult<()> {
    with_io_timeout(io_timeout, ws_sender.send(Message::Binary(frame.bytes.clone()))).await?;
    delivered_through.store(frame.sequence_number + 1, Ordering::Relaxed);
    Ok(())
}

async fn close_quietly(ws_sender: &mut WsSink, io_timeout: std::time::Duration) {
    let _ = tokio::time::timeout(io_timeout, ws_sender.close()).await;
}
