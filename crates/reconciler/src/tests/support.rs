//! Shared fixtures for reconciler tests

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use l2_runtime::{AnchoredLog, ChainMetadata};
use parking_lot::Mutex;

/// In-memory anchored log whose commits can be made to fail
#[derive(Clone, Default)]
pub struct FlakyLog {
    failing: Arc<AtomicBool>,
    entries: Arc<Mutex<Vec<(u64, Vec<u8>)>>>,
    metadata: Arc<Mutex<Option<ChainMetadata>>>,
}

impl FlakyLog {
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }
}

impl AnchoredLog for FlakyLog {
    fn entries(&self) -> anyhow::Result<Vec<(u64, Vec<u8>)>> {
        Ok(self.entries.lock().clone())
    }

    fn load_metadata(&self) -> anyhow::Result<Option<ChainMetadata>> {
        Ok(self.metadata.lock().clone())
    }

    fn commit(&self, entries: &[(u64, Vec<u8>)], metadata: &ChainMetadata) -> anyhow::Result<()> {
        if self.failing.load(Ordering::SeqCst) {
            anyhow::bail!("disk unavailable");
        }
        self.entries.lock().extend_from_slice(entries);
        *self.metadata.lock() = Some(metadata.clone());
        Ok(())
    }
}
