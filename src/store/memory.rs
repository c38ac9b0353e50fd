//! In-memory metadata store
//!
//! Used by tests and by the demo mode of the daemon. Sharing one
//! `Arc<MemoryStore>` between two controller instances simulates a restart.

use super::{MetadataStore, RecordKind};
use crate::error::Result;
use parking_lot::RwLock;
use std::collections::BTreeMap;

/// Metadata store backed by process memory
#[derive(Debug, Default)]
pub struct MemoryStore {
    records: RwLock<BTreeMap<(RecordKind, String), Vec<u8>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Overwrite a record with arbitrary bytes
    pub fn corrupt(&self, kind: RecordKind, key: &str, body: &[u8]) {
        self.records
            .write()
            .insert((kind, key.to_string()), body.to_vec());
    }

    /// Number of stored records in one collection
    pub fn count(&self, kind: RecordKind) -> usize {
        self.records.read().keys().filter(|(k, _)| *k == kind).count()
    }
}

impl MetadataStore for MemoryStore {
    fn put(&self, kind: RecordKind, key: &str, body: &[u8]) -> Result<()> {
        self.records
            .write()
            .insert((kind, key.to_string()), body.to_vec());
        Ok(())
    }

    fn delete(&self, kind: RecordKind, key: &str) -> Result<()> {
        self.records.write().remove(&(kind, key.to_string()));
        Ok(())
    }

    fn load_all(&self, kind: RecordKind) -> Result<Vec<(String, Vec<u8>)>> {
        Ok(self
            .records
            .read()
            .iter()
            .filter(|((k, _), _)| *k == kind)
            .map(|((_, key), body)| (key.clone(), body.clone()))
            .collect())
    }
}
