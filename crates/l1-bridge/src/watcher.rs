//! Batch Watcher - polls L1 for newly anchored batches
//!
//! Runs on its own task and forwards every confirmed batch, in index order,
//! to whoever owns the follower state.

use crate::l1_reader::ChainReader;
use crate::{BridgeError, BridgeResult};
use l1_integration::{AnchoredBatch, BatchIndex};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WatcherConfig {
    /// How often L1 is polled (the reconciliation cadence)
    pub poll_interval_ms: u64,
    /// First batch index to forward
    pub start_index: BatchIndex,
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 1000,
            start_index: 0,
        }
    }
}

impl WatcherConfig {
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }
}

/// Sends a watcher back to an earlier batch
///
/// Used when the consumer could not apply a batch it was handed, so the
/// batch is read again instead of being skipped.
#[derive(Debug, Clone)]
pub struct BatchRewinder {
    tx: mpsc::UnboundedSender<BatchIndex>,
}

impl BatchRewinder {
    /// Re-read from `index` on the next poll; no effect if already there
    pub fn rewind_to(&self, index: BatchIndex) {
        let _ = self.tx.send(index);
    }
}

/// Anchored producer: turns L1 batches into channel messages
pub struct BatchWatcher<R> {
    reader: R,
    poll_interval: Duration,
    next_index: BatchIndex,
    rewind_tx: mpsc::UnboundedSender<BatchIndex>,
    rewind_rx: mpsc::UnboundedReceiver<BatchIndex>,
}

impl<R: ChainReader + 'static> BatchWatcher<R> {
    pub fn new(reader: R, config: &WatcherConfig) -> Self {
        let (rewind_tx, rewind_rx) = mpsc::unbounded_channel();
        Self {
            reader,
            poll_interval: config.poll_interval(),
            next_index: config.start_index,
            rewind_tx,
            rewind_rx,
        }
    }

    pub fn rewinder(&self) -> BatchRewinder {
        BatchRewinder {
            tx: self.rewind_tx.clone(),
        }
    }

    /// Take the earliest rewind request, if it is behind the cursor
    fn apply_rewinds(&mut self) {
        while let Ok(index) = self.rewind_rx.try_recv() {
            if index < self.next_index {
                tracing::info!("Rewinding batch watcher from {} to {}", self.next_index, index);
                self.next_index = index;
            }
        }
    }

    /// Index of the next batch to forward
    pub fn next_index(&self) -> BatchIndex {
        self.next_index
    }

    /// Forward every batch confirmed since the last poll
    ///
    /// Returns how many batches were sent. A batch that fails to read stops
    /// the poll; it is retried first on the next one.
    pub async fn poll_once<T>(&mut self, tx: &mpsc::Sender<T>) -> BridgeResult<usize>
    where
        T: From<AnchoredBatch> + Send,
    {
        self.apply_rewinds();
        let Some(latest) = self.reader.latest_batch_index().await? else {
            return Ok(0);
        };

        let mut sent = 0;
        while self.next_index <= latest {
            let batch = self.reader.batch(self.next_index).await?;
            tx.send(T::from(batch))
                .await
                .map_err(|_| BridgeError::ReceiverClosed)?;
            self.next_index += 1;
            sent += 1;
        }
        Ok(sent)
    }

    /// Poll until shutdown or until the receiver goes away
    pub async fn run<T>(mut self, tx: mpsc::Sender<T>, mut shutdown: watch::Receiver<bool>)
    where
        T: From<AnchoredBatch> + Send,
    {
        let mut ticker = interval(self.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        tracing::info!(
            "Batch watcher started at batch {} (every {:?})",
            self.next_index,
            self.poll_interval
        );

        loop {
            tokio::select! {
                _ = stopped(&mut shutdown) => break,
                _ = ticker.tick() => match self.poll_once(&tx).await {
                    Ok(0) => {}
                    Ok(sent) => {
                        tracing::debug!("Forwarded {} anchored batches", sent);
                    }
                    Err(BridgeError::ReceiverClosed) => break,
                    Err(e) => {
                        tracing::warn!("Failed to read L1 at batch {}: {}", self.next_index, e);
                    }
                },
            }
        }
        tracing::info!("Batch watcher stopped at batch {}", self.next_index);
    }

    /// Spawn [`Self::run`] onto the runtime
    pub fn spawn<T>(self, tx: mpsc::Sender<T>, shutdown: watch::Receiver<bool>) -> JoinHandle<()>
    where
        T: From<AnchoredBatch> + Send + 'static,
    {
        tokio::spawn(self.run(tx, shutdown))
    }
}

/// Shutdown signal raised, or its sender dropped
async fn stopped(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stopped| *stopped).await;
}
