//! Follower node - wires the feed and the anchored path into one engine
//!
//! The engine lives on a single task. The feed pump and the batch watcher
//! are producers into the same channel, so speculative and anchored updates
//! are applied strictly one after the other.

use crate::engine::ReconciliationEngine;
use crate::types::{AnchoredCheckpoint, EngineMode};
use l1_bridge::{BatchRewinder, BatchWatcher, ChainReader, WatcherConfig};
use l1_integration::{AnchoredBatch, BatchIndex};
use l2_feed::{
    wait_stopped, BroadcastClient, BroadcastClientConfig, FeedCodec, FeedError, FeedMessage,
    FeedResult, SequenceNumber,
};
use l2_runtime::ExecutionEngine;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};
use tokio::task::{JoinError, JoinHandle};

/// Everything the engine task reacts to
#[derive(Debug, Clone)]
pub enum FollowerInput {
    Feed(FeedMessage),
    Anchored(AnchoredBatch),
    /// The feed can no longer be resumed; only the anchored path remains
    ResyncRequired {
        requested: SequenceNumber,
        oldest_available: Option<SequenceNumber>,
    },
}

impl From<AnchoredBatch> for FollowerInput {
    fn from(batch: AnchoredBatch) -> Self {
        FollowerInput::Anchored(batch)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FollowerConfig {
    pub feed: BroadcastClientConfig,
    pub watcher: WatcherConfig,
    /// Capacity of the engine's input channel
    pub input_buffer: usize,
}

impl Default for FollowerConfig {
    fn default() -> Self {
        Self {
            feed: BroadcastClientConfig::default(),
            watcher: WatcherConfig::default(),
            input_buffer: 1024,
        }
    }
}

impl FollowerConfig {
    pub fn from_json(json: &str) -> anyhow::Result<Self> {
        Ok(serde_json::from_str(json)?)
    }
}

/// Snapshot published after every input
#[derive(Debug, Clone, Serialize)]
pub struct FollowerStatus {
    pub mode: EngineMode,
    pub checkpoint: AnchoredCheckpoint,
    pub speculative_head: Option<SequenceNumber>,
    pub next_sequence: SequenceNumber,
    pub state_digest: [u8; 32],
    pub divergences: u64,
    pub resync_required: bool,
    pub last_error: Option<String>,
}

impl FollowerStatus {
    fn capture<E: ExecutionEngine>(
        engine: &ReconciliationEngine<E>,
        resync_required: bool,
        last_error: Option<String>,
    ) -> Self {
        Self {
            mode: engine.mode(),
            checkpoint: engine.checkpoint().clone(),
            speculative_head: engine.speculative_head(),
            next_sequence: engine.next_sequence(),
            state_digest: engine.state_digest(),
            divergences: engine.stats().divergences,
            resync_required,
            last_error,
        }
    }
}

pub struct FollowerNode<E: ExecutionEngine> {
    inputs: mpsc::Sender<FollowerInput>,
    status_rx: watch::Receiver<FollowerStatus>,
    shutdown: watch::Sender<bool>,
    engine_task: JoinHandle<ReconciliationEngine<E>>,
    producers: Vec<JoinHandle<()>>,
}

impl<E> FollowerNode<E>
where
    E: ExecutionEngine + 'static,
    E::Delta: 'static,
{
    /// Subscribe to the feed from the engine's speculative head and start
    ///
    /// If the feed no longer retains that point the node still starts, on the
    /// anchored path only, with `resync_required` set.
    pub async fn connect<R: ChainReader + 'static>(
        config: &FollowerConfig,
        engine: ReconciliationEngine<E>,
        chain: R,
        codec: FeedCodec,
    ) -> FeedResult<Self> {
        let resume_from = Some(engine.next_sequence());
        match BroadcastClient::connect(config.feed.clone(), resume_from, codec).await {
            Ok(client) => Ok(Self::spawn(config, engine, chain, Some(client))),
            Err(FeedError::ResyncRequired {
                requested,
                oldest_available,
            }) => {
                let node = Self::spawn(config, engine, chain, None);
                let _ = node
                    .inputs
                    .send(FollowerInput::ResyncRequired {
                        requested,
                        oldest_available,
                    })
                    .await;
                Ok(node)
            }
            Err(e) => Err(e),
        }
    }

    /// Start the engine task and its producers
    ///
    /// Without a feed client the follower runs on the anchored path alone.
    pub fn spawn<R: ChainReader + 'static>(
        config: &FollowerConfig,
        engine: ReconciliationEngine<E>,
        chain: R,
        feed: Option<BroadcastClient>,
    ) -> Self {
        let (inputs, inputs_rx) = mpsc::channel(config.input_buffer.max(1));
        let (status_tx, status_rx) = watch::channel(FollowerStatus::capture(&engine, false, None));
        let (shutdown, shutdown_rx) = watch::channel(false);

        let mut watcher_config = config.watcher.clone();
        if let Some(applied) = engine.checkpoint().batch_index {
            watcher_config.start_index = watcher_config.start_index.max(applied + 1);
        }

        let watcher = BatchWatcher::new(chain, &watcher_config);
        let rewind = Rewind {
            rewinder: watcher.rewinder(),
            first_index: config.watcher.start_index,
        };
        let mut producers = vec![watcher.spawn(inputs.clone(), shutdown_rx.clone())];
        if let Some(client) = feed {
            producers.push(tokio::spawn(pump_feed(
                client,
                inputs.clone(),
                shutdown_rx.clone(),
            )));
        }

        let engine_task = tokio::spawn(run_engine(
            engine,
            inputs_rx,
            status_tx,
            rewind,
            shutdown_rx,
        ));

        Self {
            inputs,
            status_rx,
            shutdown,
            engine_task,
            producers,
        }
    }

    pub fn status(&self) -> FollowerStatus {
        self.status_rx.borrow().clone()
    }

    pub fn status_watch(&self) -> watch::Receiver<FollowerStatus> {
        self.status_rx.clone()
    }

    /// Wait until the status satisfies `predicate`
    pub async fn wait_for(
        &self,
        predicate: impl FnMut(&FollowerStatus) -> bool,
    ) -> Option<FollowerStatus> {
        let mut status_rx = self.status_rx.clone();
        let status = status_rx.wait_for(predicate).await.ok()?;
        Some(status.clone())
    }

    /// Extra producer handle, e.g. for a second feed source
    pub fn inputs(&self) -> mpsc::Sender<FollowerInput> {
        self.inputs.clone()
    }

    /// Stop every task and hand back the engine
    ///
    /// Dropping the node also stops the tasks, since the shutdown sender goes
    /// with it.
    pub async fn shutdown(self) -> Result<ReconciliationEngine<E>, JoinError> {
        let _ = self.shutdown.send(true);
        for producer in self.producers {
            let _ = producer.await;
        }
        self.engine_task.await
    }
}

async fn pump_feed(
    mut client: BroadcastClient,
    inputs: mpsc::Sender<FollowerInput>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let item = tokio::select! {
            _ = wait_stopped(&mut shutdown) => break,
            item = client.recv() => item,
        };

        let input = match item {
            Some(Ok(message)) => FollowerInput::Feed(message),
            Some(Err(FeedError::ResyncRequired {
                requested,
                oldest_available,
            })) => FollowerInput::ResyncRequired {
                requested,
                oldest_available,
            },
            Some(Err(e)) => {
                tracing::warn!("Feed error: {}", e);
                continue;
            }
            None => break,
        };
        if inputs.send(input).await.is_err() {
            break;
        }
    }

    client.close().await;
    tracing::debug!("Feed pump stopped");
}

/// Where the watcher restarts after a batch could not be applied
struct Rewind {
    rewinder: BatchRewinder,
    first_index: BatchIndex,
}

impl Rewind {
    fn after<E: ExecutionEngine>(&self, engine: &ReconciliationEngine<E>) {
        let index = engine
            .checkpoint()
            .batch_index
            .map_or(self.first_index, |applied| applied + 1);
        self.rewinder.rewind_to(index);
    }
}

async fn run_engine<E: ExecutionEngine>(
    mut engine: ReconciliationEngine<E>,
    mut inputs: mpsc::Receiver<FollowerInput>,
    status_tx: watch::Sender<FollowerStatus>,
    rewind: Rewind,
    mut shutdown: watch::Receiver<bool>,
) -> ReconciliationEngine<E> {
    let mut resync_required = false;
    let mut last_error = None;

    loop {
        let input = tokio::select! {
            _ = wait_stopped(&mut shutdown) => break,
            input = inputs.recv() => match input {
                Some(input) => input,
                None => break,
            },
        };

        match input {
            FollowerInput::Feed(message) => {
                engine.apply_speculative(&message);
            }
            FollowerInput::Anchored(batch) => match engine.apply_anchored(&batch) {
                Ok(outcome) => {
                    tracing::debug!("Batch {}: {:?}", batch.batch_index, outcome);
                    last_error = None;
                }
                Err(e) => {
                    tracing::error!("Failed to apply anchored batch {}: {}", batch.batch_index, e);
                    last_error = Some(e.to_string());
                    // Read it again rather than skip it
                    rewind.after(&engine);
                }
            },
            FollowerInput::ResyncRequired {
                requested,
                oldest_available,
            } => {
                tracing::warn!(
                    "Feed cannot resume at {} (oldest available {:?}); following L1 only",
                    requested,
                    oldest_available
                );
                resync_required = true;
            }
        }

        status_tx.send_replace(FollowerStatus::capture(
            &engine,
            resync_required,
            last_error.clone(),
        ));
    }

    tracing::info!(
        "Follower stopped at checkpoint {}",
        engine.checkpoint().next_sequence
    );
    engine
}
