//! Persistence Layer for the anchored log
//!
//! Uses sled to keep every confirmed (sequence number, payload) pair and the
//! checkpoint that covers them. State is rebuilt on restart by replaying the
//! log into a fresh execution engine.

use serde::{Deserialize, Serialize};
use sled::transaction::TransactionResult;
use sled::{Db, Transactional};
use std::path::Path;

/// Checkpoint metadata stored next to the log
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct ChainMetadata {
    /// One past the last confirmed sequence number
    pub next_sequence: u64,
    /// Hash chain over every confirmed entry
    pub confirmed_digest: [u8; 32],
    /// Last anchored batch applied
    pub batch_index: Option<u64>,
    /// Last save timestamp
    pub last_save_ts: i64,
}

/// Durable home of the anchored log
///
/// `commit` must be all or nothing: either every entry and the checkpoint
/// covering them are stored, or none are.
pub trait AnchoredLog: Send {
    /// Every stored entry, in sequence order
    fn entries(&self) -> anyhow::Result<Vec<(u64, Vec<u8>)>>;

    fn load_metadata(&self) -> anyhow::Result<Option<ChainMetadata>>;

    /// Store confirmed entries together with their checkpoint
    fn commit(&self, entries: &[(u64, Vec<u8>)], metadata: &ChainMetadata) -> anyhow::Result<()>;
}

/// Persistent storage for confirmed L2 history
pub struct PersistentStore {
    db: Db,
    /// Confirmed payloads keyed by big-endian sequence number
    anchored: sled::Tree,
    metadata: sled::Tree,
}

impl PersistentStore {
    /// Open or create a persistent store at the given path
    pub fn open<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let db = sled::open(&path)?;
        let anchored = db.open_tree("anchored")?;
        let metadata = db.open_tree("metadata")?;

        tracing::info!("Opened persistent store at {:?}", path.as_ref());

        Ok(Self {
            db,
            anchored,
            metadata,
        })
    }

    /// Store a confirmed entry
    pub fn store_entry(&self, sequence_number: u64, payload: &[u8]) -> anyhow::Result<()> {
        let bytes = bincode::serialize(payload)?;
        self.anchored.insert(sequence_number.to_be_bytes(), bytes)?;
        Ok(())
    }

    pub fn get_entry(&self, sequence_number: u64) -> anyhow::Result<Option<Vec<u8>>> {
        match self.anchored.get(sequence_number.to_be_bytes())? {
            Some(bytes) => Ok(Some(bincode::deserialize(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Every stored entry, in sequence order
    pub fn entries(&self) -> anyhow::Result<Vec<(u64, Vec<u8>)>> {
        let mut entries = Vec::with_capacity(self.anchored.len());

        for result in self.anchored.iter() {
            let (key, value) = result?;
            let key: [u8; 8] = key
                .as_ref()
                .try_into()
                .map_err(|_| anyhow::anyhow!("Invalid sequence key length"))?;
            entries.push((u64::from_be_bytes(key), bincode::deserialize(&value)?));
        }

        Ok(entries)
    }

    /// Save checkpoint metadata
    pub fn save_metadata(&self, metadata: &ChainMetadata) -> anyhow::Result<()> {
        let mut metadata = metadata.clone();
        metadata.last_save_ts = chrono::Utc::now().timestamp();
        let bytes = bincode::serialize(&metadata)?;
        self.metadata.insert("checkpoint", bytes)?;
        Ok(())
    }

    pub fn load_metadata(&self) -> anyhow::Result<Option<ChainMetadata>> {
        match self.metadata.get("checkpoint")? {
            Some(bytes) => Ok(Some(bincode::deserialize(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Store a run of entries and their checkpoint in one transaction
    pub fn commit_batch(
        &self,
        entries: &[(u64, Vec<u8>)],
        metadata: &ChainMetadata,
    ) -> anyhow::Result<()> {
        let mut encoded = Vec::with_capacity(entries.len());
        for (sequence_number, payload) in entries {
            encoded.push((
                sequence_number.to_be_bytes().to_vec(),
                bincode::serialize(payload)?,
            ));
        }
        let mut metadata = metadata.clone();
        metadata.last_save_ts = chrono::Utc::now().timestamp();
        let checkpoint = bincode::serialize(&metadata)?;

        let result: TransactionResult<(), ()> =
            (&self.anchored, &self.metadata).transaction(|(anchored, meta)| {
                for (key, value) in &encoded {
                    anchored.insert(key.clone(), value.clone())?;
                }
                meta.insert("checkpoint", checkpoint.clone())?;
                Ok(())
            });
        result.map_err(|e| anyhow::anyhow!("Failed to commit anchored batch: {:?}", e))?;

        self.flush()
    }

    /// Flush all pending writes to disk
    pub fn flush(&self) -> anyhow::Result<()> {
        self.db.flush()?;
        Ok(())
    }

    pub fn entry_count(&self) -> usize {
        self.anchored.len()
    }

    /// Clear all data (for testing)
    pub fn clear(&self) -> anyhow::Result<()> {
        self.anchored.clear()?;
        self.metadata.clear()?;
        Ok(())
    }
}

impl AnchoredLog for PersistentStore {
    fn entries(&self) -> anyhow::Result<Vec<(u64, Vec<u8>)>> {
        PersistentStore::entries(self)
    }

    fn load_metadata(&self) -> anyhow::Result<Option<ChainMetadata>> {
        PersistentStore::load_metadata(self)
    }

    fn commit(&self, entries: &[(u64, Vec<u8>)], metadata: &ChainMetadata) -> anyhow::Result<()> {
        self.commit_batch(entries, metadata)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_entries_come_back_in_sequence_order() {
        let dir = tempdir().unwrap();
        let store = PersistentStore::open(dir.path()).unwrap();

        // 256 sorts before 3 as little-endian; keys are big-endian
        store.store_entry(256, b"late").unwrap();
        store.store_entry(3, b"early").unwrap();
        store.flush().unwrap();

        let entries = store.entries().unwrap();
        assert_eq!(entries[0], (3, b"early".to_vec()));
        assert_eq!(entries[1], (256, b"late".to_vec()));
        assert_eq!(store.get_entry(256).unwrap(), Some(b"late".to_vec()));
        assert_eq!(store.get_entry(4).unwrap(), None);
    }

    #[test]
    fn test_commit_stores_entries_with_checkpoint() {
        let dir = tempdir().unwrap();
        let metadata = ChainMetadata {
            next_sequence: 2,
            confirmed_digest: [7u8; 32],
            batch_index: Some(0),
            last_save_ts: 0,
        };

        {
            let store = PersistentStore::open(dir.path()).unwrap();
            store
                .commit_batch(&[(0, b"a".to_vec()), (1, b"b".to_vec())], &metadata)
                .unwrap();
        }

        let store = PersistentStore::open(dir.path()).unwrap();
        assert_eq!(store.entry_count(), 2);
        assert_eq!(store.get_entry(1).unwrap(), Some(b"b".to_vec()));
        let loaded = store.load_metadata().unwrap().unwrap();
        assert_eq!(loaded.next_sequence, 2);
        assert_eq!(loaded.batch_index, Some(0));
    }

    #[test]
    fn test_metadata_survives_reopen() {
        let dir = tempdir().unwrap();
        let metadata = ChainMetadata {
            next_sequence: 12,
            confirmed_digest: [42u8; 32],
            batch_index: Some(2),
            last_save_ts: 0,
        };

        {
            let store = PersistentStore::open(dir.path()).unwrap();
            store.save_metadata(&metadata).unwrap();
            store.flush().unwrap();
        }

        let store = PersistentStore::open(dir.path()).unwrap();
        let loaded = store.load_metadata().unwrap().unwrap();
        assert_eq!(loaded.next_sequence, 12);
        assert_eq!(loaded.batch_index, Some(2));
        assert!(loaded.last_save_ts > 0);
    }
}
