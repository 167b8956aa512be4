//! L2 Runtime - execution engine for followers
//!
//! This crate provides the state machine followers drive from the feed:
//! - The `ExecutionEngine` seam the reconciler talks to
//! - A transfer ledger over in-memory account storage
//! - sled persistence of the anchored log

pub mod account_store;
pub mod persistence;
pub mod processor;

pub use account_store::{Account, AccountStore, Address};
pub use persistence::{AnchoredLog, ChainMetadata, PersistentStore};
pub use processor::{
    Execution, ExecutionEngine, LedgerDelta, Transfer, TransferError, TransferLedger,
};
