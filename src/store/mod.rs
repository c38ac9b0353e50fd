//! Metadata Store
//!
//! Durable per-record persistence for disks, redundancy groups, pools,
//! volumes and tasks. Records are stored individually so that a single
//! corrupt record only affects the entity it describes.

pub mod file;
pub mod memory;

pub use file::FileStore;
pub use memory::MemoryStore;

use crate::config::StoreConfig;
use crate::error::{Error, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{error, info};

/// Collection a record belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordKind {
    Disk,
    Group,
    Pool,
    Volume,
    Task,
}

impl RecordKind {
    pub const ALL: [RecordKind; 5] = [
        RecordKind::Disk,
        RecordKind::Group,
        RecordKind::Pool,
        RecordKind::Volume,
        RecordKind::Task,
    ];

    /// Directory / namespace name for this collection
    pub fn as_str(&self) -> &'static str {
        match self {
            RecordKind::Disk => "disks",
            RecordKind::Group => "groups",
            RecordKind::Pool => "pools",
            RecordKind::Volume => "volumes",
            RecordKind::Task => "tasks",
        }
    }
}

impl std::fmt::Display for RecordKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Port for durable metadata storage
pub trait MetadataStore: Send + Sync {
    /// Create or replace one record
    fn put(&self, kind: RecordKind, key: &str, body: &[u8]) -> Result<()>;

    /// Delete one record (missing records are not an error)
    fn delete(&self, kind: RecordKind, key: &str) -> Result<()>;

    /// Load every record of one collection as raw bytes
    fn load_all(&self, kind: RecordKind) -> Result<Vec<(String, Vec<u8>)>>;
}

/// Serialize and store a record, logging instead of failing
///
/// In-memory state is authoritative while the controller runs; a failed
/// write is reported and retried implicitly by the next mutation of the
/// same entity.
pub fn persist<T: Serialize>(store: &dyn MetadataStore, kind: RecordKind, key: &str, value: &T) {
    let result = serde_json::to_vec(value)
        .map_err(Error::from)
        .and_then(|body| store.put(kind, key, &body));
    if let Err(e) = result {
        error!("Failed to persist {}/{}: {}", kind, key, e);
    }
}

/// Delete a record, logging instead of failing
pub fn forget(store: &dyn MetadataStore, kind: RecordKind, key: &str) {
    if let Err(e) = store.delete(kind, key) {
        error!("Failed to delete {}/{}: {}", kind, key, e);
    }
}

/// Open the store selected by configuration
pub fn open(config: &StoreConfig) -> Result<Arc<dyn MetadataStore>> {
    match config {
        StoreConfig::Memory => {
            info!("Using in-memory metadata store");
            Ok(Arc::new(MemoryStore::new()))
        }
        StoreConfig::File { path, sync_writes } => {
            info!("Using file metadata store at {}", path.display());
            Ok(Arc::new(FileStore::open(path.clone(), *sync_writes)?))
        }
    }
}

/// Decode a raw record, mapping any failure to `MetadataCorrupt`
pub fn decode<T: DeserializeOwned>(kind: RecordKind, key: &str, body: &[u8]) -> Result<T> {
    serde_json::from_slice(body).map_err(|e| Error::MetadataCorrupt {
        kind: kind.to_string(),
        key: key.to_string(),
        reason: e.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct Sample {
        name: String,
    }

    #[test]
    fn test_persist_and_decode() {
        let store = MemoryStore::new();
        persist(
            &store,
            RecordKind::Pool,
            "p1",
            &Sample {
                name: "tank".into(),
            },
        );

        let records = store.load_all(RecordKind::Pool).unwrap();
        assert_eq!(records.len(), 1);
        let decoded: Sample = decode(RecordKind::Pool, &records[0].0, &records[0].1).unwrap();
        assert_eq!(decoded.name, "tank");
    }

    #[test]
    fn test_decode_garbage_is_corrupt() {
        let result: Result<Sample> = decode(RecordKind::Group, "g1", b"{not json");
        assert_matches!(result, Err(Error::MetadataCorrupt { key, .. }) if key == "g1");
    }
}
