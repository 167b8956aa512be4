//! Retained tail of recently published messages
//!
//! The server keeps the last `capacity` encoded message frames so that a
//! reconnecting subscriber can be caught up without a full resync. Frames are
//! shared as `Arc`s; a reader either sees a whole frame or none of it.

use crate::error::{FeedError, FeedResult};
use crate::types::{FeedMessage, SequenceNumber, ServerFrame};
use std::collections::VecDeque;
use std::sync::Arc;

/// A message frame encoded once and shared by every subscriber queue
#[derive(Debug)]
pub struct EncodedFrame {
    pub sequence_number: SequenceNumber,
    pub bytes: Vec<u8>,
}

impl EncodedFrame {
    pub fn new(message: FeedMessage) -> Self {
        let sequence_number = message.sequence_number;
        Self {
            sequence_number,
            bytes: ServerFrame::Message(message).to_bytes(),
        }
    }
}

/// What a subscriber resuming at some point should be sent
#[derive(Debug)]
pub enum Replay {
    /// Retained frames from the resume point on (possibly none)
    Frames(Vec<Arc<EncodedFrame>>),
    /// Resume point is older than anything retained
    ResyncRequired {
        oldest_available: Option<SequenceNumber>,
    },
}

/// Bounded ring of the most recent frames
#[derive(Debug)]
pub struct Backlog {
    frames: VecDeque<Arc<EncodedFrame>>,
    capacity: usize,
    last_sequence: Option<SequenceNumber>,
}

impl Backlog {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            frames: VecDeque::with_capacity(capacity),
            capacity,
            last_sequence: None,
        }
    }

    /// Append the next frame; numbers must be contiguous once the first is seen
    pub fn append(&mut self, frame: Arc<EncodedFrame>) -> FeedResult<()> {
        if let Some(last) = self.last_sequence {
            if frame.sequence_number != last + 1 {
                return Err(FeedError::SequenceViolation {
                    expected: last + 1,
                    got: frame.sequence_number,
                });
            }
        }

        if self.frames.len() == self.capacity {
            self.frames.pop_front();
        }
        self.last_sequence = Some(frame.sequence_number);
        self.frames.push_back(frame);
        Ok(())
    }

    /// Frames a subscriber asking for `resume_from` onwards must receive
    pub fn replay_from(&self, resume_from: Option<SequenceNumber>) -> Replay {
        let Some(from) = resume_from else {
            return Replay::Frames(Vec::new());
        };

        match self.last_sequence {
            // Nothing published yet, or the subscriber is already caught up
            None => Replay::Frames(Vec::new()),
            Some(last) if from > last => Replay::Frames(Vec::new()),
            Some(_) => match self.oldest() {
                Some(oldest) if from >= oldest => Replay::Frames(
                    self.frames
                        .iter()
                        .skip((from - oldest) as usize)
                        .cloned()
                        .collect(),
                ),
                oldest => Replay::ResyncRequired {
                    oldest_available: oldest,
                },
            },
        }
    }

    pub fn oldest(&self) -> Option<SequenceNumber> {
        self.frames.front().map(|f| f.sequence_number)
    }

    pub fn last_sequence(&self) -> Option<SequenceNumber> {
        self.last_sequence
    }

    /// Sequence number the next publish must carry, if already determined
    pub fn next_sequence(&self) -> Option<SequenceNumber> {
        self.last_sequence.map(|s| s + 1)
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }
}
