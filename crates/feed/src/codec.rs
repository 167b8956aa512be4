//! Wire codec for feed messages
//!
//! Messages and frames are borsh-encoded, which is deterministic: the same
//! logical message always produces the same bytes. Followers rely on this to
//! compare re-deliveries byte for byte.

use crate::error::{FeedError, FeedResult};
use crate::types::{ClientFrame, FeedMessage, SequenceNumber, ServerFrame};
use ed25519_dalek::{Signature, Signer, SigningKey, VerifyingKey};
use rand::rngs::OsRng;

/// Public key a feed is expected to be signed with
pub type PublisherKey = VerifyingKey;

/// Signs payloads on behalf of the sequencer
pub struct FeedSigner {
    key: SigningKey,
}

impl FeedSigner {
    /// Generate a fresh random signing key
    pub fn generate() -> Self {
        Self {
            key: SigningKey::generate(&mut OsRng),
        }
    }

    pub fn from_secret_bytes(bytes: &[u8; 32]) -> Self {
        Self {
            key: SigningKey::from_bytes(bytes),
        }
    }

    /// Key followers must verify against
    pub fn publisher_key(&self) -> PublisherKey {
        self.key.verifying_key()
    }

    /// Produce a signed message
    pub fn sign(&self, sequence_number: SequenceNumber, payload: Vec<u8>) -> FeedMessage {
        let signature = self
            .key
            .sign(&FeedMessage::signing_bytes(sequence_number, &payload));
        FeedMessage {
            sequence_number,
            payload,
            signature: signature.to_bytes().to_vec(),
        }
    }
}

/// Encodes and decodes feed traffic for one publisher epoch
#[derive(Clone, Debug)]
pub struct FeedCodec {
    publisher: PublisherKey,
}

impl FeedCodec {
    pub fn new(publisher: PublisherKey) -> Self {
        Self { publisher }
    }

    pub fn publisher_key(&self) -> &PublisherKey {
        &self.publisher
    }

    /// Encode a message
    pub fn encode(message: &FeedMessage) -> Vec<u8> {
        borsh::to_vec(message).expect("FeedMessage serialization should not fail")
    }

    /// Decode a message and verify its signature
    pub fn decode(&self, bytes: &[u8]) -> FeedResult<FeedMessage> {
        let message: FeedMessage = borsh::from_slice(bytes)
            .map_err(|e| FeedError::MalformedMessage(e.to_string()))?;
        self.verify(&message)?;
        Ok(message)
    }

    /// Check the publisher signature on a message
    pub fn verify(&self, message: &FeedMessage) -> FeedResult<()> {
        let invalid = || FeedError::SignatureInvalid {
            sequence_number: message.sequence_number,
        };
        let signature = Signature::from_slice(&message.signature).map_err(|_| invalid())?;
        self.publisher
            .verify_strict(
                &FeedMessage::signing_bytes(message.sequence_number, &message.payload),
                &signature,
            )
            .map_err(|_| invalid())
    }

    /// Decode a server frame; message frames are signature-checked
    pub fn decode_server_frame(&self, bytes: &[u8]) -> FeedResult<ServerFrame> {
        let frame: ServerFrame = borsh::from_slice(bytes)
            .map_err(|e| FeedError::MalformedMessage(e.to_string()))?;
        if let ServerFrame::Message(ref message) = frame {
            self.verify(message)?;
        }
        Ok(frame)
    }

    /// Decode a client frame (server side; carries nothing to verify)
    pub fn decode_client_frame(bytes: &[u8]) -> FeedResult<ClientFrame> {
        borsh::from_slice(bytes).map_err(|e| FeedError::MalformedMessage(e.to_string()))
    }
}
