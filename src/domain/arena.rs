//! Entity Arena
//!
//! Concurrent map of entities keyed by stable identifiers, where each
//! entity sits behind its own exclusive lock. Lock acquisition is bounded:
//! a caller that cannot obtain the entity lock within the configured wait
//! gets `ConcurrentModification` instead of blocking indefinitely.

use crate::error::{Error, Result};
use dashmap::DashMap;
use parking_lot::Mutex;
use std::fmt::Display;
use std::hash::Hash;
use std::sync::Arc;
use std::time::Duration;

/// Arena of lockable entities
pub struct EntityArena<K, V> {
    kind: &'static str,
    entries: DashMap<K, Arc<Mutex<V>>>,
    lock_timeout: Duration,
}

impl<K: Eq + Hash, V> std::fmt::Debug for EntityArena<K, V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EntityArena")
            .field("kind", &self.kind)
            .field("len", &self.entries.len())
            .finish()
    }
}

impl<K, V> EntityArena<K, V>
where
    K: Eq + Hash + Clone + Ord + Display,
    V: Clone,
{
    pub fn new(kind: &'static str, lock_timeout: Duration) -> Self {
        Self {
            kind,
            entries: DashMap::new(),
            lock_timeout,
        }
    }

    /// Insert a new entity, replacing nothing
    pub fn insert(&self, id: K, value: V) -> Result<()> {
        match self.entries.entry(id.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => Err(Error::InvalidState {
                entity: format!("{}/{}", self.kind, id),
                reason: "already exists".into(),
            }),
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(Arc::new(Mutex::new(value)));
                Ok(())
            }
        }
    }

    pub fn contains(&self, id: &K) -> bool {
        self.entries.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Sorted list of all identifiers
    pub fn ids(&self) -> Vec<K> {
        let mut ids: Vec<K> = self.entries.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        ids
    }

    fn handle(&self, id: &K) -> Result<Arc<Mutex<V>>> {
        self.entries
            .get(id)
            .map(|e| e.value().clone())
            .ok_or_else(|| Error::not_found(self.kind, id))
    }

    /// Run `f` with exclusive access to one entity
    ///
    /// The shard lock of the map is released before the entity lock is
    /// taken, so long waits on one entity never stall unrelated ones.
    pub fn with<R>(&self, id: &K, f: impl FnOnce(&mut V) -> Result<R>) -> Result<R> {
        let handle = self.handle(id)?;
        let mut guard = handle
            .try_lock_for(self.lock_timeout)
            .ok_or_else(|| Error::ConcurrentModification {
                entity: format!("{}/{}", self.kind, id),
            })?;

        // The entity may have been removed while we waited for its lock
        if !self.is_current(id, &handle) {
            return Err(Error::not_found(self.kind, id));
        }

        f(&mut guard)
    }

    /// Clone the current value of one entity
    pub fn snapshot(&self, id: &K) -> Result<V> {
        self.with(id, |v| Ok(v.clone()))
    }

    /// Clone every entity, sorted by identifier
    ///
    /// Entities whose lock is contended past the bounded wait are skipped
    /// rather than stalling a read-only listing.
    pub fn snapshots(&self) -> Vec<V> {
        self.ids()
            .into_iter()
            .filter_map(|id| self.snapshot(&id).ok())
            .collect()
    }

    /// Validate under the entity lock, then remove it
    pub fn remove_with(&self, id: &K, f: impl FnOnce(&mut V) -> Result<()>) -> Result<V> {
        let handle = self.handle(id)?;
        let mut guard = handle
            .try_lock_for(self.lock_timeout)
            .ok_or_else(|| Error::ConcurrentModification {
                entity: format!("{}/{}", self.kind, id),
            })?;

        if !self.is_current(id, &handle) {
            return Err(Error::not_found(self.kind, id));
        }

        f(&mut guard)?;
        self.entries.remove(id);
        Ok(guard.clone())
    }

    /// Remove unconditionally
    pub fn remove(&self, id: &K) -> Result<V> {
        self.remove_with(id, |_| Ok(()))
    }

    fn is_current(&self, id: &K, handle: &Arc<Mutex<V>>) -> bool {
        self.entries
            .get(id)
            .map(|e| Arc::ptr_eq(e.value(), handle))
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    fn arena() -> EntityArena<String, u64> {
        EntityArena::new("counter", Duration::from_millis(20))
    }

    #[test]
    fn test_insert_and_mutate() {
        let arena = arena();
        arena.insert("a".into(), 1).unwrap();
        arena.with(&"a".to_string(), |v| {
            *v += 41;
            Ok(())
        })
        .unwrap();
        assert_eq!(arena.snapshot(&"a".to_string()).unwrap(), 42);
        assert!(arena.insert("a".into(), 0).is_err());
    }

    #[test]
    fn test_missing_entity_is_not_found() {
        let arena = arena();
        assert_matches!(
            arena.snapshot(&"nope".to_string()),
            Err(Error::NotFound { kind: "counter", .. })
        );
    }

    #[test]
    fn test_contended_lock_reports_concurrent_modification() {
        let arena = Arc::new(arena());
        arena.insert("a".into(), 1).unwrap();

        let held = arena.handle(&"a".to_string()).unwrap();
        let _guard = held.lock();

        let result = arena.with(&"a".to_string(), |_| Ok(()));
        assert_matches!(result, Err(Error::ConcurrentModification { .. }));
    }

    #[test]
    fn test_remove_with_validation() {
        let arena = arena();
        arena.insert("a".into(), 3).unwrap();

        let refused = arena.remove_with(&"a".to_string(), |v| {
            if *v > 0 {
                Err(Error::Internal("busy".into()))
            } else {
                Ok(())
            }
        });
        assert!(refused.is_err());
        assert!(arena.contains(&"a".to_string()));

        assert_eq!(arena.remove(&"a".to_string()).unwrap(), 3);
        assert!(arena.is_empty());
    }
}
