//! Core types for the reconciliation engine

use l2_feed::SequenceNumber;
use l2_runtime::ChainMetadata;
use serde::{Deserialize, Serialize};

/// One feed message executed ahead of anchoring
#[derive(Debug, Clone)]
pub struct SpeculativeEntry<D> {
    pub sequence_number: SequenceNumber,
    pub payload: Vec<u8>,
    pub delta: D,
    pub success: bool,
}

/// Everything confirmed by L1 so far
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnchoredCheckpoint {
    /// One past the end of the confirmed range
    pub next_sequence: SequenceNumber,
    /// blake3 chain over `(sequence_number, payload)` of every confirmed entry
    pub confirmed_state_digest: [u8; 32],
    /// Last batch applied, `None` before the first one
    pub batch_index: Option<u64>,
}

impl AnchoredCheckpoint {
    pub fn genesis(first_sequence: SequenceNumber) -> Self {
        Self {
            next_sequence: first_sequence,
            confirmed_state_digest: [0u8; 32],
            batch_index: None,
        }
    }

    /// Fold one confirmed entry into the checkpoint
    pub fn extend(&mut self, sequence_number: SequenceNumber, payload: &[u8]) {
        let mut hasher = blake3::Hasher::new();
        hasher.update(&self.confirmed_state_digest);
        hasher.update(&sequence_number.to_le_bytes());
        hasher.update(payload);
        self.confirmed_state_digest = *hasher.finalize().as_bytes();
        self.next_sequence = sequence_number + 1;
    }
}

impl From<&AnchoredCheckpoint> for ChainMetadata {
    fn from(checkpoint: &AnchoredCheckpoint) -> Self {
        ChainMetadata {
            next_sequence: checkpoint.next_sequence,
            confirmed_digest: checkpoint.confirmed_state_digest,
            batch_index: checkpoint.batch_index,
            last_save_ts: 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum EngineMode {
    #[default]
    Speculating,
    Reconciling,
}

/// What happened to a feed message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeedOutcome {
    /// Executed, along with this many buffered successors
    Applied { drained: usize },
    /// Already covered by the anchored checkpoint
    AlreadyAnchored,
    /// Already executed speculatively
    Duplicate,
    /// Ahead of the speculative head; held until the gap closes
    Buffered,
    /// Ahead of the head with the pending buffer full
    Dropped,
}

/// What happened to an anchored batch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// Every new entry matched the speculative history
    Confirmed {
        confirmed: usize,
        next_sequence: SequenceNumber,
    },
    /// Speculative history was wrong from `at` onwards
    Diverged {
        at: SequenceNumber,
        rolled_back: usize,
        confirmed: usize,
        next_sequence: SequenceNumber,
    },
    /// Nothing new in the batch
    Replayed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconcilerConfig {
    /// Sequence number of the first entry in the history
    pub first_sequence: SequenceNumber,
    /// Feed messages held while waiting for a gap to close
    pub max_pending_feed: usize,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            first_sequence: 0,
            max_pending_feed: 4096,
        }
    }
}

impl ReconcilerConfig {
    /// Parse from JSON, filling unspecified fields with defaults
    pub fn from_json(json: &str) -> anyhow::Result<Self> {
        Ok(serde_json::from_str(json)?)
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct EngineStats {
    pub speculative_applied: u64,
    pub confirmed: u64,
    pub divergences: u64,
    pub rolled_back: u64,
    pub stale_ignored: u64,
    pub duplicates_ignored: u64,
    pub equivocations: u64,
    pub pending_dropped: u64,
}
