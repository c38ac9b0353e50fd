//! Storage Pool records
//!
//! A pool aggregates the usable capacity of one or more redundancy groups.
//! Its state is never stored as truth: it is recomputed from the states of
//! its groups, pessimistically (the worst group wins).

use crate::domain::types::{GroupId, PoolId, VolumeId};
use crate::raid::GroupState;
use chrono::{DateTime, Utc};
use indexmap::IndexSet;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Aggregate state of a pool
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PoolState {
    /// Created, initialization task not finished yet
    Initializing,
    Online,
    Rebuilding,
    Degraded,
    Offline,
    Failed,
}

impl PoolState {
    /// Whether new space can be carved out of the pool
    pub fn accepts_allocations(&self) -> bool {
        !matches!(self, PoolState::Offline | PoolState::Failed)
    }

    /// Whether volumes in the pool can be reached
    pub fn is_accessible(&self) -> bool {
        !matches!(self, PoolState::Offline | PoolState::Failed)
    }

    /// Pool state implied by the worst group state
    pub fn from_group(state: GroupState) -> Self {
        match state {
            GroupState::Online => PoolState::Online,
            GroupState::Rebuilding => PoolState::Rebuilding,
            GroupState::Degraded => PoolState::Degraded,
            GroupState::Offline => PoolState::Offline,
            GroupState::Failed => PoolState::Failed,
        }
    }
}

impl std::fmt::Display for PoolState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PoolState::Initializing => write!(f, "initializing"),
            PoolState::Online => write!(f, "online"),
            PoolState::Rebuilding => write!(f, "rebuilding"),
            PoolState::Degraded => write!(f, "degraded"),
            PoolState::Offline => write!(f, "offline"),
            PoolState::Failed => write!(f, "failed"),
        }
    }
}

/// A storage pool record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoragePool {
    pub id: PoolId,
    pub name: String,
    /// Committed groups, in attachment order
    pub groups: IndexSet<GroupId>,
    /// Groups attached by an expansion that has not finished yet
    #[serde(default)]
    pub pending_groups: IndexSet<GroupId>,
    pub total_capacity: u64,
    pub allocated: u64,
    /// Metadata margin that volumes can never claim
    pub reserved: u64,
    pub volumes: BTreeSet<VolumeId>,
    /// Whether the initialization task completed
    pub initialized: bool,
    /// Last computed aggregate state
    pub state: PoolState,
    /// Why the pool's metadata could not be trusted at startup
    #[serde(default)]
    pub corrupted: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl StoragePool {
    pub fn new(
        id: PoolId,
        name: impl Into<String>,
        groups: IndexSet<GroupId>,
        total_capacity: u64,
        reserved: u64,
    ) -> Self {
        Self {
            id,
            name: name.into(),
            groups,
            pending_groups: IndexSet::new(),
            total_capacity,
            allocated: 0,
            reserved,
            volumes: BTreeSet::new(),
            initialized: false,
            state: PoolState::Initializing,
            corrupted: None,
            created_at: Utc::now(),
        }
    }

    /// Stand-in for a pool whose record could not be read
    pub fn corrupt(id: PoolId, groups: IndexSet<GroupId>, reason: impl Into<String>) -> Self {
        let name = id.to_string();
        let mut pool = Self::new(id, name, groups, 0, 0);
        pool.initialized = true;
        pool.state = PoolState::Failed;
        pool.corrupted = Some(reason.into());
        pool
    }

    /// Bytes available to new allocations
    pub fn free_bytes(&self) -> u64 {
        self.total_capacity
            .saturating_sub(self.allocated)
            .saturating_sub(self.reserved)
    }

    /// Every group attached to the pool, committed or pending
    pub fn all_groups(&self) -> impl Iterator<Item = &GroupId> {
        self.groups.iter().chain(self.pending_groups.iter())
    }

    /// Aggregate state from the states of the committed groups
    ///
    /// `None` stands for a group that no longer exists.
    pub fn derive_state(&self, group_states: &[Option<GroupState>]) -> PoolState {
        if self.corrupted.is_some() {
            return PoolState::Failed;
        }

        let mut worst: Option<GroupState> = None;
        for state in group_states {
            let Some(state) = state else {
                return PoolState::Failed;
            };
            if worst.map_or(true, |w| state.severity() > w.severity()) {
                worst = Some(*state);
            }
        }

        let aggregate = worst.map_or(PoolState::Failed, PoolState::from_group);
        if !self.initialized && aggregate.is_accessible() {
            PoolState::Initializing
        } else {
            aggregate
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool() -> StoragePool {
        let groups = [GroupId::new("g1"), GroupId::new("g2")].into_iter().collect();
        let mut pool = StoragePool::new(PoolId::new("p"), "tank", groups, 1000, 100);
        pool.initialized = true;
        pool
    }

    #[test]
    fn test_worst_group_wins() {
        let pool = pool();
        assert_eq!(
            pool.derive_state(&[Some(GroupState::Online), Some(GroupState::Online)]),
            PoolState::Online
        );
        assert_eq!(
            pool.derive_state(&[Some(GroupState::Rebuilding), Some(GroupState::Degraded)]),
            PoolState::Degraded
        );
        assert_eq!(
            pool.derive_state(&[Some(GroupState::Online), Some(GroupState::Failed)]),
            PoolState::Failed
        );
        assert_eq!(
            pool.derive_state(&[Some(GroupState::Online), None]),
            PoolState::Failed
        );
    }

    #[test]
    fn test_uninitialized_pool() {
        let mut pool = pool();
        pool.initialized = false;
        assert_eq!(
            pool.derive_state(&[Some(GroupState::Degraded)]),
            PoolState::Initializing
        );
        assert_eq!(
            pool.derive_state(&[Some(GroupState::Failed)]),
            PoolState::Failed
        );
    }

    #[test]
    fn test_free_bytes_excludes_reserve() {
        let mut pool = pool();
        pool.allocated = 850;
        assert_eq!(pool.free_bytes(), 50);
        pool.allocated = 950;
        assert_eq!(pool.free_bytes(), 0);
    }

    #[test]
    fn test_corrupt_pool_is_failed() {
        let pool = StoragePool::corrupt(PoolId::new("p"), IndexSet::new(), "bad json");
        assert_eq!(pool.derive_state(&[]), PoolState::Failed);
        assert!(!pool.state.accepts_allocations());
    }
}
