//! File-backed metadata store
//!
//! One directory per collection and one JSON file per record. Writes go to
//! a temporary file first and are renamed into place, so a crash never
//! leaves a half-written record behind.

use super::{MetadataStore, RecordKind};
use crate::error::Result;
use parking_lot::Mutex;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

const RECORD_EXTENSION: &str = "json";
const TEMP_EXTENSION: &str = "tmp";

/// Metadata store persisting records under a root directory
#[derive(Debug)]
pub struct FileStore {
    root_path: PathBuf,
    sync_writes: bool,
    /// Serializes writers so temp files never collide
    write_lock: Mutex<()>,
}

impl FileStore {
    /// Open (and create if needed) a store rooted at `root_path`
    pub fn open(root_path: impl Into<PathBuf>, sync_writes: bool) -> Result<Self> {
        let root_path = root_path.into();
        for kind in RecordKind::ALL {
            fs::create_dir_all(root_path.join(kind.as_str()))?;
        }
        info!("Metadata store opened at {:?}", root_path);
        Ok(Self {
            root_path,
            sync_writes,
            write_lock: Mutex::new(()),
        })
    }

    pub fn root_path(&self) -> &Path {
        &self.root_path
    }

    fn record_path(&self, kind: RecordKind, key: &str) -> PathBuf {
        self.root_path
            .join(kind.as_str())
            .join(format!("{}.{}", encode_key(key), RECORD_EXTENSION))
    }
}

impl MetadataStore for FileStore {
    fn put(&self, kind: RecordKind, key: &str, body: &[u8]) -> Result<()> {
        let path = self.record_path(kind, key);
        let tmp = path.with_extension(TEMP_EXTENSION);

        let _guard = self.write_lock.lock();
        {
            let mut file = fs::File::create(&tmp)?;
            file.write_all(body)?;
            if self.sync_writes {
                file.sync_all()?;
            }
        }
        fs::rename(&tmp, &path)?;
        Ok(())
    }

    fn delete(&self, kind: RecordKind, key: &str) -> Result<()> {
        let path = self.record_path(kind, key);
        let _guard = self.write_lock.lock();
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn load_all(&self, kind: RecordKind) -> Result<Vec<(String, Vec<u8>)>> {
        let dir = self.root_path.join(kind.as_str());
        let mut records = Vec::new();

        for entry in fs::read_dir(&dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some(RECORD_EXTENSION) {
                continue;
            }
            let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            let key = decode_key(stem);
            records.push((key, fs::read(&path)?));
        }

        records.sort_by(|a, b| a.0.cmp(&b.0));
        debug!("Loaded {} {} records", records.len(), kind);
        Ok(records)
    }
}

/// Escape a record key into a safe file name
fn encode_key(key: &str) -> String {
    let mut out = String::with_capacity(key.len());
    for b in key.bytes() {
        if b.is_ascii_alphanumeric() || b == b'-' || b == b'_' {
            out.push(b as char);
        } else {
            out.push_str(&format!("%{:02X}", b));
        }
    }
    out
}

fn decode_key(name: &str) -> String {
    let bytes = name.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' && i + 2 < bytes.len() {
            let hex = std::str::from_utf8(&bytes[i + 1..i + 3]).ok();
            if let Some(b) = hex.and_then(|h| u8::from_str_radix(h, 16).ok()) {
                out.push(b);
                i += 3;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_key_escaping() {
        assert_eq!(encode_key("pool-1"), "pool-1");
        assert_eq!(encode_key("a/b.c"), "a%2Fb%2Ec");
        assert_eq!(decode_key(&encode_key("a/b.c")), "a/b.c");
    }

    #[test]
    fn test_records_survive_reopen() {
        let tmp = TempDir::new().unwrap();

        {
            let store = FileStore::open(tmp.path(), false).unwrap();
            store.put(RecordKind::Volume, "vol-1", b"{\"a\":1}").unwrap();
            store.put(RecordKind::Volume, "vol-2", b"{\"a\":2}").unwrap();
            store.delete(RecordKind::Volume, "vol-2").unwrap();
        }

        let store = FileStore::open(tmp.path(), false).unwrap();
        let records = store.load_all(RecordKind::Volume).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].0, "vol-1");
        assert_eq!(records[0].1, b"{\"a\":1}");
    }

    #[test]
    fn test_delete_missing_record_is_ok() {
        let tmp = TempDir::new().unwrap();
        let store = FileStore::open(tmp.path(), true).unwrap();
        assert!(store.delete(RecordKind::Task, "nope").is_ok());
    }
}
