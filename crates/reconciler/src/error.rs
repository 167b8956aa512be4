//! Error types for reconciliation

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ReconcileError {
    /// Speculative history disagrees with the anchored one. Handled by
    /// rolling back, never returned to callers.
    #[error("Divergence at sequence {sequence_number}: {reason}")]
    DivergenceDetected { sequence_number: u64, reason: String },

    #[error("Anchored batch starts at {got}, but the checkpoint is at {expected}")]
    AnchoredGap { expected: u64, got: u64 },

    #[error("Persistence error: {0}")]
    Persistence(#[from] anyhow::Error),
}

pub type ReconcileResult<T> = Result<T, ReconcileError>;
