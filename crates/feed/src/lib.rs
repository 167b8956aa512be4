//! L2 Feed - real-time sequencer feed
//!
//! Architecture:
//! - The sequencer numbers and signs transactions and publishes them through
//!   a `BroadcastServer`
//! - Followers subscribe with a `BroadcastClient`, which delivers a gap-free,
//!   ordered message stream and reconnects/resumes on failure
//! - The server retains a bounded tail so reconnecting followers can catch up;
//!   older resume points get `ResyncRequired`
//! - Liveness is enforced by pings with per-connection timeouts

pub mod backlog;
pub mod client;
pub mod codec;
pub mod config;
pub mod error;
pub mod liveness;
pub mod sequencer;
pub mod server;
pub mod types;

#[cfg(test)]
mod tests;

pub use client::{BroadcastClient, ClientStats};
pub use codec::{FeedCodec, FeedSigner, PublisherKey};
pub use config::{BroadcastClientConfig, BroadcasterConfig};
pub use error::{FeedError, FeedResult};
pub use liveness::wait_stopped;
pub use sequencer::{SequencerNode, SequencerNodeBuilder};
pub use server::{BroadcastServer, EvictReason, ServerStats, SubscriptionInfo};
pub use types::*;
