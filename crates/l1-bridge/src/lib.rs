//! L1 Bridge - Anchoring path
//!
//! Handles the L1 side of the feed:
//! - Reading confirmed batches from the chain (`ChainReader`)
//! - Watching the chain and handing new batches to followers (`BatchWatcher`)
//! - Posting sequenced payloads as batches (`BatchCommitter`)

pub mod committer;
pub mod l1_reader;
pub mod watcher;

pub use committer::BatchCommitter;
pub use l1_reader::{ChainReader, InMemoryChain};
pub use watcher::{BatchRewinder, BatchWatcher, WatcherConfig};

pub use l1_integration::{AnchoredBatch, BatchIndex};

/// Bridge errors
#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    #[error("Batch {0} not found")]
    UnknownBatch(BatchIndex),

    #[error("Non-contiguous batch: expected first sequence {expected}, got {got}")]
    NonContiguous { expected: u64, got: u64 },

    #[error("Chain unavailable: {0}")]
    Unavailable(String),

    #[error("Batch receiver closed")]
    ReceiverClosed,
}

pub type BridgeResult<T> = Result<T, BridgeError>;
