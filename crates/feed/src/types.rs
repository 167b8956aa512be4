//! Core types for the sequencer feed

use borsh::{BorshDeserialize, BorshSerialize};
use serde::{Deserialize, Serialize};

/// Position of a message in the sequencer's ordering
pub type SequenceNumber = u64;

/// A sequenced transaction as published on the feed
///
/// Identity is `sequence_number`. Two messages carrying the same number within
/// one publisher epoch must encode to identical bytes.
#[derive(
    Debug, Clone, PartialEq, Eq, BorshSerialize, BorshDeserialize, Serialize, Deserialize,
)]
pub struct FeedMessage {
    /// Position in the ordered stream
    pub sequence_number: SequenceNumber,
    /// Opaque transaction bytes
    pub payload: Vec<u8>,
    /// Publisher signature over sequence number and payload
    pub signature: Vec<u8>,
}

impl FeedMessage {
    /// Domain separator mixed into every signed message
    pub const SIGNING_DOMAIN: &'static [u8] = b"l2-feed/v1";

    /// Bytes covered by the publisher signature
    pub fn signing_bytes(sequence_number: SequenceNumber, payload: &[u8]) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(Self::SIGNING_DOMAIN.len() + 8 + payload.len());
        bytes.extend_from_slice(Self::SIGNING_DOMAIN);
        bytes.extend_from_slice(&sequence_number.to_le_bytes());
        bytes.extend_from_slice(payload);
        bytes
    }

    /// Digest of the full encoded message, used to spot equivocation
    pub fn digest(&self) -> [u8; 32] {
        let mut hasher = blake3::Hasher::new();
        hasher.update(&self.sequence_number.to_le_bytes());
        hasher.update(&(self.payload.len() as u64).to_le_bytes());
        hasher.update(&self.payload);
        hasher.update(&self.signature);
        *hasher.finalize().as_bytes()
    }
}

/// Frames sent from the broadcast server to subscribers
#[derive(Debug, Clone, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub enum ServerFrame {
    /// Subscription accepted; replay (if any) follows
    Subscribed {
        next_sequence_number: Option<SequenceNumber>,
    },

    /// A sequenced message
    Message(FeedMessage),

    /// Liveness check, answered with `ClientFrame::Pong`
    Ping { nonce: u64 },

    /// Requested resume point has fallen out of the retained tail
    ResyncRequired {
        requested: SequenceNumber,
        oldest_available: Option<SequenceNumber>,
    },
}

impl ServerFrame {
    pub fn to_bytes(&self) -> Vec<u8> {
        borsh::to_vec(self).expect("ServerFrame serialization should not fail")
    }
}

/// Frames sent from subscribers to the broadcast server
#[derive(Debug, Clone, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub enum ClientFrame {
    /// Opening request; `resume_from` is the next sequence number wanted
    Subscribe { resume_from: Option<SequenceNumber> },

    /// Answer to `ServerFrame::Ping`
    Pong { nonce: u64 },
}

impl ClientFrame {
    pub fn to_bytes(&self) -> Vec<u8> {
        borsh::to_vec(self).expect("ClientFrame serialization should not fail")
    }
}

/// Connection state of a broadcast client
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    Disconnected,
    Connecting,
    /// Subscribe sent, waiting for the server to accept
    Syncing,
    /// The only state in which messages are delivered
    Streaming,
    /// Cancelled or terminated by a resync demand
    Closed,
}

/// Per-client stream bookkeeping
#[derive(Debug, Clone)]
pub struct ClientStreamState {
    /// Feed endpoint URL
    pub endpoint: String,
    /// Next sequence number the caller should see, if known
    pub next_expected_sequence_number: Option<SequenceNumber>,
    /// Incremented on every (re)connect
    pub connection_epoch: u64,
}

/// Result of checking an incoming sequence number against the stream state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SequenceCheck {
    Deliver,
    Duplicate,
    Gap {
        expected: SequenceNumber,
        got: SequenceNumber,
    },
}

impl ClientStreamState {
    pub fn new(endpoint: &str, resume_from: Option<SequenceNumber>) -> Self {
        Self {
            endpoint: endpoint.to_string(),
            next_expected_sequence_number: resume_from,
            connection_epoch: 0,
        }
    }

    /// Classify `sequence_number`; advances the expected number on `Deliver`
    pub fn check(&mut self, sequence_number: SequenceNumber) -> SequenceCheck {
        match self.next_expected_sequence_number {
            None => {
                self.next_expected_sequence_number = Some(sequence_number + 1);
                SequenceCheck::Deliver
            }
            Some(expected) if sequence_number == expected => {
                self.next_expected_sequence_number = Some(expected + 1);
                SequenceCheck::Deliver
            }
            Some(expected) if sequence_number < expected => SequenceCheck::Duplicate,
            Some(expected) => SequenceCheck::Gap {
                expected,
                got: sequence_number,
            },
        }
    }
}
