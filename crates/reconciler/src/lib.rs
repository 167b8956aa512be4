//! L2 Reconciler - keeps follower state honest
//!
//! Followers execute the sequencer feed as soon as it arrives, then check it
//! against what actually lands on L1:
//! - `ReconciliationEngine` layers speculative entries over the anchored
//!   checkpoint and rolls them back on divergence
//! - `FollowerNode` feeds it from a `BroadcastClient` and a `BatchWatcher`
//!   through one channel

pub mod engine;
pub mod error;
pub mod follower;
pub mod types;

#[cfg(test)]
mod tests;

pub use engine::ReconciliationEngine;
pub use error::{ReconcileError, ReconcileResult};
pub use follower::{FollowerConfig, FollowerInput, FollowerNode, FollowerStatus};
pub use types::*;
