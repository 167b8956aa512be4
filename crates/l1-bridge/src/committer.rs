//! Batch Committer - anchors sequenced payloads on L1
//!
//! Buffers what the sequencer has ordered and posts it to the chain in
//! batches. In a lying-sequencer setup the committer sees the true order
//! while the feed carries something else.

use crate::l1_reader::InMemoryChain;
use crate::{BridgeError, BridgeResult};
use l1_integration::BatchIndex;
use parking_lot::Mutex;

#[derive(Default)]
struct Pending {
    first_sequence: Option<u64>,
    payloads: Vec<Vec<u8>>,
}

impl Pending {
    fn next_sequence(&self) -> Option<u64> {
        self.first_sequence
            .map(|first| first + self.payloads.len() as u64)
    }
}

/// Posts batches of sequenced payloads to an [`InMemoryChain`]
pub struct BatchCommitter {
    chain: InMemoryChain,
    /// Entries per batch
    commit_interval: usize,
    pending: Mutex<Pending>,
}

impl BatchCommitter {
    pub fn new(chain: InMemoryChain) -> Self {
        Self {
            chain,
            commit_interval: 16,
            pending: Mutex::new(Pending::default()),
        }
    }

    /// Post a batch every `entries` recorded payloads
    pub fn with_commit_interval(mut self, entries: usize) -> Self {
        self.commit_interval = entries.max(1);
        self
    }

    pub fn commit_interval(&self) -> usize {
        self.commit_interval
    }

    /// Record a sequenced payload; posts a batch once the interval is reached
    pub fn record(
        &self,
        sequence_number: u64,
        payload: Vec<u8>,
    ) -> BridgeResult<Option<BatchIndex>> {
        let mut pending = self.pending.lock();
        let expected = pending.next_sequence().or_else(|| self.chain.next_sequence());
        if let Some(expected) = expected {
            if sequence_number != expected {
                return Err(BridgeError::NonContiguous {
                    expected,
                    got: sequence_number,
                });
            }
        }

        pending.first_sequence.get_or_insert(sequence_number);
        pending.payloads.push(payload);

        if pending.payloads.len() >= self.commit_interval {
            return self.post(&mut pending).map(Some);
        }
        Ok(None)
    }

    /// Post whatever is buffered, if anything
    pub fn flush(&self) -> BridgeResult<Option<BatchIndex>> {
        let mut pending = self.pending.lock();
        if pending.payloads.is_empty() {
            return Ok(None);
        }
        self.post(&mut pending).map(Some)
    }

    /// Number of payloads waiting for the next batch
    pub fn pending_len(&self) -> usize {
        self.pending.lock().payloads.len()
    }

    fn post(&self, pending: &mut Pending) -> BridgeResult<BatchIndex> {
        let first_sequence = pending.first_sequence.unwrap_or_default();
        let count = pending.payloads.len();
        // Keep the buffer intact if the chain refuses the batch
        let index = self
            .chain
            .post_batch(first_sequence, pending.payloads.clone())?;
        pending.payloads.clear();
        pending.first_sequence = None;

        tracing::info!(
            "Committed batch {} ({} entries from sequence {})",
            index,
            count,
            first_sequence
        );
        Ok(index)
    }
}
