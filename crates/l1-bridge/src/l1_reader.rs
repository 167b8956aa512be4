//! L1 Reader - Reads anchored batches from L1

use crate::{BridgeError, BridgeResult};
use async_trait::async_trait;
use l1_integration::{AnchoredBatch, BatchIndex};
use parking_lot::RwLock;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Read access to the batches confirmed on L1
#[async_trait]
pub trait ChainReader: Send + Sync {
    /// Index of the newest confirmed batch, `None` if nothing is anchored yet
    async fn latest_batch_index(&self) -> BridgeResult<Option<BatchIndex>>;

    /// Fetch one confirmed batch
    async fn batch(&self, index: BatchIndex) -> BridgeResult<AnchoredBatch>;
}

#[async_trait]
impl<R: ChainReader + ?Sized> ChainReader for Arc<R> {
    async fn latest_batch_index(&self) -> BridgeResult<Option<BatchIndex>> {
        (**self).latest_batch_index().await
    }

    async fn batch(&self, index: BatchIndex) -> BridgeResult<AnchoredBatch> {
        (**self).batch(index).await
    }
}

/// In-process chain shared by committers and readers
///
/// Clones share the same batch list.
#[derive(Clone, Default)]
pub struct InMemoryChain {
    batches: Arc<RwLock<Vec<AnchoredBatch>>>,
    offline: Arc<AtomicBool>,
}

impl InMemoryChain {
    pub fn new() -> Self {
        Self::default()
    }

    /// Confirm a batch starting at `first_sequence`
    ///
    /// Batches must continue exactly where the previous one ended.
    pub fn post_batch(
        &self,
        first_sequence: u64,
        payloads: Vec<Vec<u8>>,
    ) -> BridgeResult<BatchIndex> {
        let mut batches = self.batches.write();
        if let Some(last) = batches.last() {
            if first_sequence != last.end_sequence() {
                return Err(BridgeError::NonContiguous {
                    expected: last.end_sequence(),
                    got: first_sequence,
                });
            }
        }

        let index = batches.len() as BatchIndex;
        tracing::debug!(
            "Anchored batch {} covering {} entries from {}",
            index,
            payloads.len(),
            first_sequence
        );
        batches.push(AnchoredBatch::new(index, first_sequence, payloads));
        Ok(index)
    }

    /// Next sequence number a posted batch must start at
    pub fn next_sequence(&self) -> Option<u64> {
        self.batches.read().last().map(AnchoredBatch::end_sequence)
    }

    pub fn batch_count(&self) -> usize {
        self.batches.read().len()
    }

    /// Make reads fail until brought back online
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    fn check_online(&self) -> BridgeResult<()> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(BridgeError::Unavailable("chain offline".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl ChainReader for InMemoryChain {
    async fn latest_batch_index(&self) -> BridgeResult<Option<BatchIndex>> {
        self.check_online()?;
        Ok((self.batches.read().len() as BatchIndex).checked_sub(1))
    }

    async fn batch(&self, index: BatchIndex) -> BridgeResult<AnchoredBatch> {
        self.check_online()?;
        self.batches
            .read()
            .get(index as usize)
            .cloned()
            .ok_or(BridgeError::UnknownBatch(index))
    }
}
