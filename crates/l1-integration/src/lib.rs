//! Shared types for L1/L2 integration
//!
//! Batches of sequenced payloads as they are anchored on L1. The bridge posts
//! and reads them; followers reconcile their speculative state against them.

use borsh::{BorshDeserialize, BorshSerialize};
use serde::{Deserialize, Serialize};
use std::ops::Range;

/// Position of a batch in the L1 inbox
pub type BatchIndex = u64;

/// A contiguous run of sequenced payloads confirmed on L1
///
/// Covers `[first_sequence, first_sequence + payloads.len())`.
#[derive(BorshSerialize, BorshDeserialize, Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct AnchoredBatch {
    pub batch_index: BatchIndex,
    pub first_sequence: u64,
    pub payloads: Vec<Vec<u8>>,
}

impl AnchoredBatch {
    pub fn new(batch_index: BatchIndex, first_sequence: u64, payloads: Vec<Vec<u8>>) -> Self {
        Self {
            batch_index,
            first_sequence,
            payloads,
        }
    }

    /// Sequence numbers covered by this batch
    pub fn sequence_range(&self) -> Range<u64> {
        self.first_sequence..self.end_sequence()
    }

    /// One past the last sequence number in the batch
    pub fn end_sequence(&self) -> u64 {
        self.first_sequence + self.payloads.len() as u64
    }

    /// Last sequence number in the batch, `None` for an empty batch
    pub fn last_sequence(&self) -> Option<u64> {
        self.end_sequence().checked_sub(1).filter(|_| !self.payloads.is_empty())
    }

    pub fn len(&self) -> usize {
        self.payloads.len()
    }

    pub fn is_empty(&self) -> bool {
        self.payloads.is_empty()
    }

    /// Iterate `(sequence_number, payload)` pairs
    pub fn entries(&self) -> impl Iterator<Item = (u64, &[u8])> + '_ {
        self.payloads
            .iter()
            .enumerate()
            .map(move |(i, payload)| (self.first_sequence + i as u64, payload.as_slice()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_batch_range() {
        let batch = AnchoredBatch::new(3, 10, vec![vec![1], vec![2], vec![3]]);
        assert_eq!(batch.sequence_range(), 10..13);
        assert_eq!(batch.last_sequence(), Some(12));

        let entries: Vec<_> = batch.entries().map(|(seq, _)| seq).collect();
        assert_eq!(entries, vec![10, 11, 12]);
    }

    #[test]
    fn test_empty_batch() {
        let batch = AnchoredBatch::new(0, 5, vec![]);
        assert!(batch.is_empty());
        assert_eq!(batch.last_sequence(), None);
        assert_eq!(batch.sequence_range(), 5..5);
    }
}
