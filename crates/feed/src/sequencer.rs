//! Sequencer node - numbers, signs and broadcasts transactions

use crate::codec::{FeedCodec, FeedSigner, PublisherKey};
use crate::config::BroadcasterConfig;
use crate::error::FeedResult;
use crate::server::BroadcastServer;
use crate::types::{FeedMessage, SequenceNumber};
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::Arc;

/// Publisher side of the feed
pub struct SequencerNode {
    /// Broadcast server for followers
    broadcast: Arc<BroadcastServer>,
    /// Publisher signing key
    signer: FeedSigner,
    /// Number the next sequenced payload receives
    next_sequence: Mutex<SequenceNumber>,
}

impl SequencerNode {
    pub fn new(config: BroadcasterConfig, signer: FeedSigner, first_sequence: SequenceNumber) -> Self {
        Self {
            broadcast: Arc::new(BroadcastServer::new(config)),
            signer,
            next_sequence: Mutex::new(first_sequence),
        }
    }

    /// Start the broadcast server
    pub async fn start(&self) -> FeedResult<SocketAddr> {
        let addr = self.broadcast.start().await?;
        tracing::info!(
            "Sequencer started, broadcasting on {} from sequence {}",
            addr,
            self.next_sequence()
        );
        Ok(addr)
    }

    pub fn stop(&self) -> FeedResult<()> {
        self.broadcast.stop()
    }

    /// Assign the next sequence number to `payload`, sign it and publish it
    pub fn sequence(&self, payload: Vec<u8>) -> FeedResult<FeedMessage> {
        let mut next = self.next_sequence.lock();
        let message = self.signer.sign(*next, payload);
        self.broadcast.publish(message.clone())?;
        *next += 1;
        Ok(message)
    }

    /// Publish an already signed message, e.g. when replaying a stored stream
    pub fn publish_signed(&self, message: FeedMessage) -> FeedResult<()> {
        let mut next = self.next_sequence.lock();
        let sequence_number = message.sequence_number;
        self.broadcast.publish(message)?;
        *next = sequence_number + 1;
        Ok(())
    }

    pub fn next_sequence(&self) -> SequenceNumber {
        *self.next_sequence.lock()
    }

    pub fn publisher_key(&self) -> PublisherKey {
        self.signer.publisher_key()
    }

    /// Codec followers of this sequencer should decode with
    pub fn codec(&self) -> FeedCodec {
        FeedCodec::new(self.publisher_key())
    }

    pub fn signer(&self) -> &FeedSigner {
        &self.signer
    }

    pub fn server(&self) -> &Arc<BroadcastServer> {
        &self.broadcast
    }

    /// Get connected follower count
    pub fn connected_followers(&self) -> usize {
        self.broadcast.connected_clients()
    }
}

/// Builder for SequencerNode
pub struct SequencerNodeBuilder {
    config: BroadcasterConfig,
    signer: Option<FeedSigner>,
    first_sequence: SequenceNumber,
}

impl SequencerNodeBuilder {
    pub fn new() -> Self {
        Self {
            config: BroadcasterConfig::default(),
            signer: None,
            first_sequence: 0,
        }
    }

    pub fn config(mut self, config: BroadcasterConfig) -> Self {
        self.config = config;
        self
    }

    pub fn port(mut self, port: u16) -> Self {
        self.config.port = port;
        self
    }

    pub fn signer(mut self, signer: FeedSigner) -> Self {
        self.signer = Some(signer);
        self
    }

    pub fn first_sequence(mut self, sequence_number: SequenceNumber) -> Self {
        self.first_sequence = sequence_number;
        self
    }

    pub fn build(self) -> SequencerNode {
        let signer = self.signer.unwrap_or_else(FeedSigner::generate);
        SequencerNode::new(self.config, signer, self.first_sequence)
    }
}

impl Default for SequencerNodeBuilder {
    fn default() -> Self {
        Self::new()
    }
}
