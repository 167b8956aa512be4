//! Reconciliation engine
//!
//! Holds the speculative view built from the feed on top of the last anchored
//! checkpoint. Anchored batches are authoritative: where they agree with the
//! speculative log the entries become final, where they disagree everything
//! from the first mismatch onwards is reverted and the anchored entries are
//! executed instead.

use crate::error::{ReconcileError, ReconcileResult};
use crate::types::{
    AnchoredCheckpoint, EngineMode, EngineStats, FeedOutcome, ReconcileOutcome,
    ReconcilerConfig, SpeculativeEntry,
};
use l1_integration::AnchoredBatch;
use l2_feed::{FeedMessage, SequenceNumber};
use l2_runtime::{AnchoredLog, ExecutionEngine};
use std::collections::{BTreeMap, VecDeque};

pub struct ReconciliationEngine<E: ExecutionEngine> {
    config: ReconcilerConfig,
    executor: E,
    checkpoint: AnchoredCheckpoint,
    /// Contiguous from `checkpoint.next_sequence`
    speculative: VecDeque<SpeculativeEntry<E::Delta>>,
    /// Feed payloads ahead of the speculative head
    pending: BTreeMap<SequenceNumber, Vec<u8>>,
    mode: EngineMode,
    store: Option<Box<dyn AnchoredLog>>,
    stats: EngineStats,
}

impl<E: ExecutionEngine> ReconciliationEngine<E> {
    pub fn new(executor: E, config: ReconcilerConfig) -> Self {
        let checkpoint = AnchoredCheckpoint::genesis(config.first_sequence);
        Self {
            config,
            executor,
            checkpoint,
            speculative: VecDeque::new(),
            pending: BTreeMap::new(),
            mode: EngineMode::Speculating,
            store: None,
            stats: EngineStats::default(),
        }
    }

    /// Engine that persists confirmed history to `store`
    ///
    /// Anything already in the store is replayed into `executor`, which must
    /// be in its initial state.
    pub fn with_store(
        executor: E,
        config: ReconcilerConfig,
        store: impl AnchoredLog + 'static,
    ) -> ReconcileResult<Self> {
        let mut engine = Self::new(executor, config);
        engine.restore(&store)?;
        engine.store = Some(Box::new(store));
        Ok(engine)
    }

    fn restore(&mut self, store: &dyn AnchoredLog) -> ReconcileResult<()> {
        let metadata = store.load_metadata()?;
        let entries = store.entries()?;
        if entries.is_empty() {
            return Ok(());
        }

        self.mode = EngineMode::Reconciling;
        for (sequence_number, payload) in entries {
            if sequence_number != self.checkpoint.next_sequence {
                tracing::warn!(
                    "Stored log has a hole at {} (next entry {}); stopping restore",
                    self.checkpoint.next_sequence,
                    sequence_number
                );
                break;
            }
            let execution = self.executor.apply(&payload);
            if !execution.success {
                tracing::debug!("Restored entry {} failed to execute", sequence_number);
            }
            self.checkpoint.extend(sequence_number, &payload);
        }
        self.mode = EngineMode::Speculating;

        if let Some(metadata) = metadata {
            self.checkpoint.batch_index = metadata.batch_index;
            if metadata.confirmed_digest != self.checkpoint.confirmed_state_digest {
                tracing::warn!(
                    "Stored checkpoint at {} does not match replayed log at {}",
                    metadata.next_sequence,
                    self.checkpoint.next_sequence
                );
            }
        }

        tracing::info!(
            "Restored anchored history up to {} (batch {:?})",
            self.checkpoint.next_sequence,
            self.checkpoint.batch_index
        );
        Ok(())
    }

    /// Execute a feed message ahead of anchoring
    pub fn apply_speculative(&mut self, message: &FeedMessage) -> FeedOutcome {
        let sequence_number = message.sequence_number;

        if sequence_number < self.checkpoint.next_sequence {
            self.stats.stale_ignored += 1;
            return FeedOutcome::AlreadyAnchored;
        }

        let head = self.next_sequence();
        if sequence_number < head {
            let index = (sequence_number - self.checkpoint.next_sequence) as usize;
            if self.speculative[index].payload != message.payload {
                self.stats.equivocations += 1;
                tracing::error!(
                    "Feed equivocation at sequence {}: payload differs from the one already applied",
                    sequence_number
                );
            }
            self.stats.duplicates_ignored += 1;
            return FeedOutcome::Duplicate;
        }

        if sequence_number > head {
            if let Some(payload) = self.pending.get(&sequence_number) {
                if *payload != message.payload {
                    self.stats.equivocations += 1;
                    tracing::error!(
                        "Feed equivocation at sequence {}: payload differs from the buffered one",
                        sequence_number
                    );
                }
                self.stats.duplicates_ignored += 1;
                return FeedOutcome::Duplicate;
            }
            if self.pending.len() >= self.config.max_pending_feed {
                self.stats.pending_dropped += 1;
                tracing::warn!(
                    "Pending feed buffer full ({}); dropping {}",
                    self.pending.len(),
                    sequence_number
                );
                return FeedOutcome::Dropped;
            }
            self.pending.insert(sequence_number, message.payload.clone());
            return FeedOutcome::Buffered;
        }

        self.execute_speculative(sequence_number, message.payload.clone());
        FeedOutcome::Applied {
            drained: self.drain_pending(),
        }
    }

    /// Reconcile against a confirmed batch
    ///
    /// The batch is persisted before anything else changes, so an error
    /// leaves the engine exactly as it was and the batch can be retried.
    pub fn apply_anchored(&mut self, batch: &AnchoredBatch) -> ReconcileResult<ReconcileOutcome> {
        let next = self.checkpoint.next_sequence;
        if batch.is_empty() || batch.end_sequence() <= next {
            tracing::debug!("Batch {} already applied", batch.batch_index);
            return Ok(ReconcileOutcome::Replayed);
        }
        if batch.first_sequence > next {
            return Err(ReconcileError::AnchoredGap {
                expected: next,
                got: batch.first_sequence,
            });
        }

        let skip = (next - batch.first_sequence) as usize;
        let entries: Vec<(SequenceNumber, &[u8])> = batch.entries().skip(skip).collect();

        let mut checkpoint = self.checkpoint.clone();
        for (sequence_number, payload) in &entries {
            checkpoint.extend(*sequence_number, payload);
        }
        checkpoint.batch_index = Some(batch.batch_index);

        if let Some(store) = &self.store {
            let records: Vec<(u64, Vec<u8>)> = entries
                .iter()
                .map(|(sequence_number, payload)| (*sequence_number, payload.to_vec()))
                .collect();
            store.commit(&records, &(&checkpoint).into())?;
        }

        self.mode = EngineMode::Reconciling;
        let end = batch.end_sequence();
        let mut diverged: Option<(SequenceNumber, usize)> = None;

        for &(sequence_number, payload) in &entries {
            if diverged.is_none() {
                match self.speculative.front() {
                    Some(entry) if entry.payload == payload => {
                        debug_assert_eq!(entry.sequence_number, sequence_number);
                        self.speculative.pop_front();
                    }
                    front => {
                        let reason = match front {
                            Some(_) => "anchored payload differs from the feed".to_string(),
                            None => "never seen on the feed".to_string(),
                        };
                        // Followers that simply lagged the feed are not divergent
                        let rolled_back = self.rollback(end);
                        if rolled_back > 0 {
                            tracing::warn!(
                                "{}; rolled back {} speculative entries",
                                ReconcileError::DivergenceDetected {
                                    sequence_number,
                                    reason,
                                },
                                rolled_back
                            );
                            self.stats.divergences += 1;
                        }
                        diverged = Some((sequence_number, rolled_back));
                    }
                }
            }

            if diverged.is_some() {
                let execution = self.executor.apply(payload);
                if !execution.success {
                    tracing::debug!(
                        "Anchored entry {} failed to execute: {:?}",
                        sequence_number,
                        execution.error
                    );
                }
            }
        }

        let confirmed = entries.len();
        self.checkpoint = checkpoint;
        self.stats.confirmed += confirmed as u64;

        // Feed messages now covered by the checkpoint are stale
        self.pending = self.pending.split_off(&self.checkpoint.next_sequence);
        let replayed = self.drain_pending();
        self.mode = EngineMode::Speculating;

        let next_sequence = self.checkpoint.next_sequence;
        tracing::info!(
            "Applied anchored batch {}: checkpoint at {}, {} speculative ahead ({} re-executed)",
            batch.batch_index,
            next_sequence,
            self.speculative.len(),
            replayed
        );

        Ok(match diverged {
            Some((at, rolled_back)) if rolled_back > 0 => ReconcileOutcome::Diverged {
                at,
                rolled_back,
                confirmed,
                next_sequence,
            },
            _ => ReconcileOutcome::Confirmed {
                confirmed,
                next_sequence,
            },
        })
    }

    fn execute_speculative(&mut self, sequence_number: SequenceNumber, payload: Vec<u8>) {
        let execution = self.executor.apply(&payload);
        self.stats.speculative_applied += 1;
        tracing::debug!(
            "Speculatively applied {} (success: {})",
            sequence_number,
            execution.success
        );
        self.speculative.push_back(SpeculativeEntry {
            sequence_number,
            payload,
            delta: execution.delta,
            success: execution.success,
        });
    }

    /// Apply buffered feed messages that are now contiguous
    fn drain_pending(&mut self) -> usize {
        let mut drained = 0;
        loop {
            let head = self.next_sequence();
            let Some(payload) = self.pending.remove(&head) else {
                break;
            };
            self.execute_speculative(head, payload);
            drained += 1;
        }
        drained
    }

    /// Revert every speculative entry, newest first
    ///
    /// Entries at or past `keep_from` lie beyond the anchored batch; their
    /// payloads go back into the pending buffer to be re-executed on top of
    /// the corrected state.
    fn rollback(&mut self, keep_from: SequenceNumber) -> usize {
        let mut rolled_back = 0;
        while let Some(entry) = self.speculative.pop_back() {
            self.executor.revert(&entry.delta);
            if entry.sequence_number >= keep_from {
                self.pending.insert(entry.sequence_number, entry.payload);
            }
            rolled_back += 1;
        }
        self.stats.rolled_back += rolled_back as u64;
        rolled_back
    }

    /// Next sequence number the feed is expected to deliver
    pub fn next_sequence(&self) -> SequenceNumber {
        self.checkpoint.next_sequence + self.speculative.len() as u64
    }

    /// Last speculatively applied sequence number
    pub fn speculative_head(&self) -> Option<SequenceNumber> {
        self.speculative.back().map(|entry| entry.sequence_number)
    }

    pub fn speculative_entries(&self) -> impl Iterator<Item = &SpeculativeEntry<E::Delta>> {
        self.speculative.iter()
    }

    pub fn checkpoint(&self) -> &AnchoredCheckpoint {
        &self.checkpoint
    }

    pub fn mode(&self) -> EngineMode {
        self.mode
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn executor(&self) -> &E {
        &self.executor
    }

    pub fn state_digest(&self) -> [u8; 32] {
        self.executor.state_digest()
    }

    pub fn stats(&self) -> &EngineStats {
        &self.stats
    }

    pub fn config(&self) -> &ReconcilerConfig {
        &self.config
    }
}
