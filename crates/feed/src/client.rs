//! Broadcast client (run by followers)
//!
//! A background task owns the websocket and walks the reconnect state machine
//! `Disconnected -> Connecting -> Syncing -> Streaming`. Only messages that
//! continue the sequence exactly are handed to the caller; a forward gap
//! forces a reconnect that resumes at the first missing number.

use crate::codec::FeedCodec;
use crate::config::BroadcastClientConfig;
use crate::error::{FeedError, FeedResult};
use crate::liveness::{wait_stopped, with_io_timeout, LivenessMonitor};
use crate::types::{
    ClientFrame, ClientState, ClientStreamState, FeedMessage, SequenceCheck, SequenceNumber,
    ServerFrame,
};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, Stream, StreamExt};
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Counters describing the client's view of the feed
#[derive(Debug, Clone, Default, Serialize)]
pub struct ClientStats {
    pub delivered: u64,
    pub duplicates_discarded: u64,
    pub gaps_detected: u64,
    pub reconnects: u64,
    /// Re-deliveries whose bytes differed from what was delivered first
    pub equivocations: u64,
    pub connection_epoch: u64,
    pub next_expected_sequence_number: Option<SequenceNumber>,
}

/// An open, subscribed connection
struct Connection {
    sender: SplitSink<WsStream, Message>,
    receiver: SplitStream<WsStream>,
}

/// Exponential backoff between connect attempts
#[derive(Debug)]
struct Backoff {
    max: Duration,
    current: Duration,
}

impl Backoff {
    fn new(initial: Duration, max: Duration) -> Self {
        Self {
            max,
            current: initial,
        }
    }

    fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = (self.current * 2).min(self.max);
        delay
    }
}

/// Digests of recently delivered messages, keyed by sequence number
struct RecentDigests {
    window: VecDeque<(SequenceNumber, [u8; 32])>,
    capacity: usize,
}

impl RecentDigests {
    fn new(capacity: usize) -> Self {
        Self {
            window: VecDeque::with_capacity(capacity.min(4096)),
            capacity,
        }
    }

    fn record(&mut self, message: &FeedMessage) {
        if self.capacity == 0 {
            return;
        }
        if self.window.len() == self.capacity {
            self.window.pop_front();
        }
        self.window
            .push_back((message.sequence_number, message.digest()));
    }

    /// `Some(false)` if a delivered message with this number had other bytes
    fn matches(&self, message: &FeedMessage) -> Option<bool> {
        self.window
            .iter()
            .rev()
            .find(|(seq, _)| *seq == message.sequence_number)
            .map(|(_, digest)| *digest == message.digest())
    }
}

/// Why a streaming session ended
enum SessionEnd {
    Cancelled,
    Failed(FeedError),
}

/// Everything the background task owns
struct ClientTask {
    config: BroadcastClientConfig,
    codec: FeedCodec,
    stream_state: ClientStreamState,
    digests: RecentDigests,
    messages_tx: mpsc::Sender<FeedResult<FeedMessage>>,
    state_tx: watch::Sender<ClientState>,
    stats: Arc<RwLock<ClientStats>>,
}

impl ClientTask {
    fn set_state(&self, state: ClientState) {
        self.state_tx.send_replace(state);
    }

    fn sync_stats(&self) {
        let mut stats = self.stats.write();
        stats.connection_epoch = self.stream_state.connection_epoch;
        stats.next_expected_sequence_number = self.stream_state.next_expected_sequence_number;
    }

    /// Open a websocket and complete the subscribe handshake
    async fn open(&mut self) -> FeedResult<Connection> {
        let io_timeout = self.config.io_timeout();

        self.set_state(ClientState::Connecting);
        let (ws_stream, _) =
            with_io_timeout(io_timeout, connect_async(self.config.url.as_str())).await?;
        let (mut sender, mut receiver) = ws_stream.split();

        self.stream_state.connection_epoch += 1;
        self.sync_stats();
        self.set_state(ClientState::Syncing);

        let subscribe = ClientFrame::Subscribe {
            resume_from: self.stream_state.next_expected_sequence_number,
        };
        with_io_timeout(io_timeout, sender.send(Message::Binary(subscribe.to_bytes()))).await?;

        let accepted = with_io_timeout(io_timeout, async {
            while let Some(msg) = receiver.next().await {
                match msg? {
                    Message::Binary(data) => match self.codec.decode_server_frame(&data)? {
                        ServerFrame::Subscribed {
                            next_sequence_number,
                        } => return Ok::<_, FeedError>(next_sequence_number),
                        ServerFrame::ResyncRequired {
                            requested,
                            oldest_available,
                        } => {
                            return Err(FeedError::ResyncRequired {
                                requested,
                                oldest_available,
                            })
                        }
                        other => {
                            return Err(FeedError::MalformedMessage(format!(
                                "unexpected frame before subscribe ack: {:?}",
                                other
                            )))
                        }
                    },
                    Message::Close(_) => break,
                    _ => {}
                }
            }
            Err(FeedError::WebSocket(tungstenite::Error::ConnectionClosed))
        })
        .await?;

        tracing::info!(
            "Subscribed to {} (epoch {}, server next {:?}, resuming at {:?})",
            self.config.url,
            self.stream_state.connection_epoch,
            accepted,
            self.stream_state.next_expected_sequence_number
        );
        self.set_state(ClientState::Streaming);
        Ok(Connection { sender, receiver })
    }

    /// Connect with backoff; gives up with `ConnectFailed` only past `deadline`
    async fn open_with_retry(&mut self, deadline: Option<Instant>) -> FeedResult<Connection> {
        let mut backoff = Backoff::new(self.config.initial_backoff(), self.config.max_backoff());
        loop {
            let err = match self.open().await {
                Ok(connection) => return Ok(connection),
                Err(e @ FeedError::ResyncRequired { .. }) => return Err(e),
                Err(e) => e,
            };
            self.set_state(ClientState::Disconnected);

            let delay = backoff.next_delay();
            if let Some(deadline) = deadline {
                let now = Instant::now();
                if now >= deadline {
                    return Err(FeedError::ConnectFailed {
                        endpoint: self.config.url.clone(),
                        reason: err.to_string(),
                    });
                }
                tracing::debug!("Connect to {} failed: {}; retrying", self.config.url, err);
                tokio::time::sleep(delay.min(deadline - now)).await;
            } else {
                tracing::warn!(
                    "Reconnect to {} failed: {}; retrying in {:?}",
                    self.config.url,
                    err,
                    delay
                );
                tokio::time::sleep(delay).await;
            }
        }
    }

    /// Pump frames from one connection until it ends
    async fn stream(&mut self, connection: &mut Connection) -> SessionEnd {
        let server_timeout = self.config.server_timeout();
        let liveness = LivenessMonitor::new(server_timeout);
        let mut watchdog = tokio::time::interval((server_timeout / 3).max(Duration::from_millis(10)));
        watchdog.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                incoming = connection.receiver.next() => match incoming {
                    Some(Ok(Message::Binary(data))) => {
                        liveness.touch();
                        let frame = match self.codec.decode_server_frame(&data) {
                            Ok(frame) => frame,
                            Err(e) => {
                                tracing::warn!("Dropping corrupt feed connection: {}", e);
                                return SessionEnd::Failed(e);
                            }
                        };
                        match frame {
                            ServerFrame::Message(message) => {
                                if let Some(end) = self.handle_message(message).await {
                                    return end;
                                }
                            }
                            ServerFrame::Ping { nonce } => {
                                let pong = ClientFrame::Pong { nonce };
                                if let Err(e) = with_io_timeout(
                                    self.config.io_timeout(),
                                    connection.sender.send(Message::Binary(pong.to_bytes())),
                                )
                                .await
                                {
                                    return SessionEnd::Failed(e);
                                }
                            }
                            ServerFrame::ResyncRequired { requested, oldest_available } => {
                                return SessionEnd::Failed(FeedError::ResyncRequired {
                                    requested,
                                    oldest_available,
                                });
                            }
                            ServerFrame::Subscribed { .. } => {}
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        return SessionEnd::Failed(FeedError::WebSocket(
                            tungstenite::Error::ConnectionClosed,
                        ));
                    }
                    Some(Ok(_)) => liveness.touch(),
                    Some(Err(e)) => return SessionEnd::Failed(e.into()),
                },

                _ = watchdog.tick() => {
                    if liveness.is_expired() {
                        tracing::warn!(
                            "No traffic from {} for {:?}",
                            self.config.url,
                            liveness.idle_for()
                        );
                        return SessionEnd::Failed(FeedError::IoTimeout(server_timeout));
                    }
                }
            }
        }
    }

    /// Apply the ordering rules to one message; `Some` ends the session
    async fn handle_message(&mut self, message: FeedMessage) -> Option<SessionEnd> {
        match self.stream_state.check(message.sequence_number) {
            SequenceCheck::Deliver => {
                self.digests.record(&message);
                {
                    let mut stats = self.stats.write();
                    stats.delivered += 1;
                    stats.next_expected_sequence_number =
                        self.stream_state.next_expected_sequence_number;
                }
                if self.messages_tx.send(Ok(message)).await.is_err() {
                    // Caller dropped the receiving side
                    return Some(SessionEnd::Cancelled);
                }
                None
            }
            SequenceCheck::Duplicate => {
                if self.digests.matches(&message) == Some(false) {
                    tracing::error!(
                        "Publisher equivocation: message {} re-delivered with different bytes",
                        message.sequence_number
                    );
                    self.stats.write().equivocations += 1;
                } else {
                    tracing::trace!("Discarding duplicate message {}", message.sequence_number);
                }
                self.stats.write().duplicates_discarded += 1;
                None
            }
            SequenceCheck::Gap { expected, got } => {
                tracing::warn!("Sequence gap: expected {}, got {}; resyncing", expected, got);
                self.stats.write().gaps_detected += 1;
                Some(SessionEnd::Failed(FeedError::SequenceGap { expected, got }))
            }
        }
    }

    async fn close(&mut self, mut connection: Connection) {
        let _ = tokio::time::timeout(self.config.io_timeout(), connection.sender.close()).await;
    }

    /// Background loop: stream, and on failure reconnect until cancelled
    async fn run(mut self, mut connection: Connection, mut cancel: watch::Receiver<bool>) {
        loop {
            let end = tokio::select! {
                _ = wait_stopped(&mut cancel) => SessionEnd::Cancelled,
                end = self.stream(&mut connection) => end,
            };

            let err = match end {
                SessionEnd::Cancelled => {
                    self.close(connection).await;
                    break;
                }
                SessionEnd::Failed(e @ FeedError::ResyncRequired { .. }) => {
                    self.close(connection).await;
                    tracing::error!("Feed requires a full resync: {}", e);
                    let _ = self.messages_tx.send(Err(e)).await;
                    break;
                }
                SessionEnd::Failed(e) => e,
            };

            tracing::info!("Feed connection to {} lost: {}", self.config.url, err);
            self.close(connection).await;
            self.set_state(ClientState::Disconnected);
            self.stats.write().reconnects += 1;

            let reopened = tokio::select! {
                _ = wait_stopped(&mut cancel) => break,
                reopened = self.open_with_retry(None) => reopened,
            };
            match reopened {
                Ok(next) => connection = next,
                Err(e) => {
                    tracing::error!("Feed requires a full resync: {}", e);
                    let _ = self.messages_tx.send(Err(e)).await;
                    break;
                }
            }
        }

        self.set_state(ClientState::Closed);
        tracing::info!("Feed client for {} closed", self.config.url);
    }
}

/// Resilient subscription to one broadcast server
pub struct BroadcastClient {
    messages_rx: mpsc::Receiver<FeedResult<FeedMessage>>,
    state_rx: watch::Receiver<ClientState>,
    cancel: watch::Sender<bool>,
    task: Option<JoinHandle<()>>,
    stats: Arc<RwLock<ClientStats>>,
}

impl BroadcastClient {
    /// Subscribe to the feed at `config.url`
    ///
    /// `resume_from` is the first sequence number wanted; `None` follows the
    /// live stream. Retries with backoff for up to `config.timeout_ms`.
    pub async fn connect(
        config: BroadcastClientConfig,
        resume_from: Option<SequenceNumber>,
        codec: FeedCodec,
    ) -> FeedResult<Self> {
        let (messages_tx, messages_rx) = mpsc::channel(config.delivery_buffer.max(1));
        let (state_tx, state_rx) = watch::channel(ClientState::Disconnected);
        let (cancel, cancel_rx) = watch::channel(false);
        let stats = Arc::new(RwLock::new(ClientStats::default()));

        let deadline = Instant::now() + config.timeout();
        let mut task = ClientTask {
            stream_state: ClientStreamState::new(&config.url, resume_from),
            digests: RecentDigests::new(config.duplicate_window),
            config,
            codec,
            messages_tx,
            state_tx,
            stats: stats.clone(),
        };

        let connection = match task.open_with_retry(Some(deadline)).await {
            Ok(connection) => connection,
            Err(e) => {
                task.set_state(ClientState::Closed);
                return Err(e);
            }
        };
        let handle = tokio::spawn(task.run(connection, cancel_rx));

        Ok(Self {
            messages_rx,
            state_rx,
            cancel,
            task: Some(handle),
            stats,
        })
    }

    /// Receive the next message in sequence
    ///
    /// `None` once the client is closed. The only error ever yielded is
    /// `ResyncRequired`, after which the stream ends.
    pub async fn recv(&mut self) -> Option<FeedResult<FeedMessage>> {
        self.messages_rx.recv().await
    }

    /// Ordered message stream
    pub fn into_stream(self) -> impl Stream<Item = FeedResult<FeedMessage>> {
        futures::stream::unfold(self, |mut client| async move {
            client.recv().await.map(|item| (item, client))
        })
    }

    pub fn state(&self) -> ClientState {
        *self.state_rx.borrow()
    }

    /// Watch state transitions
    pub fn state_watch(&self) -> watch::Receiver<ClientState> {
        self.state_rx.clone()
    }

    pub fn stats(&self) -> ClientStats {
        self.stats.read().clone()
    }

    /// Cancel the subscription and wait for the connection to be released
    pub async fn close(mut self) {
        let _ = self.cancel.send(true);
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

impl Drop for BroadcastClient {
    fn drop(&mut self) {
        let _ = self.cancel.send(true);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::FeedSigner;

    #[test]
    fn test_backoff_doubles_to_cap() {
        let mut backoff = Backoff::new(Duration::from_millis(100), Duration::from_millis(350));
        assert_eq!(backoff.next_delay(), Duration::from_millis(100));
        assert_eq!(backoff.next_delay(), Duration::from_millis(200));
        assert_eq!(backoff.next_delay(), Duration::from_millis(350));
        assert_eq!(backoff.next_delay(), Duration::from_millis(350));
    }

    #[test]
    fn test_recent_digests_detect_equivocation() {
        let signer = FeedSigner::generate();
        let mut digests = RecentDigests::new(2);
        let original = signer.sign(1, b"a".to_vec());
        digests.record(&original);

        assert_eq!(digests.matches(&original), Some(true));
        assert_eq!(digests.matches(&signer.sign(1, b"b".to_vec())), Some(false));

        digests.record(&signer.sign(2, vec![]));
        digests.record(&signer.sign(3, vec![]));
        // Fell out of the window
        assert_eq!(digests.matches(&original), None);
    }

    #[tokio::test]
    async fn test_connect_fails_after_timeout() {
        // Nothing listens on this port
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let config = BroadcastClientConfig {
            url: format!("ws://127.0.0.1:{}/feed", port),
            timeout_ms: 300,
            initial_backoff_ms: 20,
            max_backoff_ms: 50,
            ..Default::default()
        };
        let codec = FeedCodec::new(FeedSigner::generate().publisher_key());

        let err = BroadcastClient::connect(config, None, codec)
            .await
            .err()
            .unwrap();
        assert!(matches!(err, FeedError::ConnectFailed { .. }));
    }
}
