//! Storage Events
//!
//! State-change notifications published by every storage component on a
//! shared broadcast bus. External collaborators (file sharing front ends,
//! dashboards, notification services) subscribe instead of polling.

use crate::domain::types::{DiskId, GroupId, PoolId, TaskId, VolumeId};
use crate::hardware::health::HealthEvent;
use crate::hardware::inventory::{DiskHealth, DiskRole, MediaType};
use crate::pool::PoolState;
use crate::raid::{GroupState, RaidLayout};
use crate::scheduler::{TaskKind, TaskState};
use crate::volume::VolumeState;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// Events emitted by the storage manager
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StorageEvent {
    /// A new disk was discovered
    DiskDiscovered {
        disk: DiskId,
        capacity_bytes: u64,
        media: MediaType,
    },

    /// A disk disappeared
    DiskMissing { disk: DiskId, role: DiskRole },

    /// A disk's health status changed
    DiskHealthChanged {
        disk: DiskId,
        from: DiskHealth,
        to: DiskHealth,
    },

    /// A disk's role changed
    DiskRoleChanged {
        disk: DiskId,
        from: DiskRole,
        to: DiskRole,
    },

    /// A redundancy group was created
    GroupCreated {
        group: GroupId,
        layout: RaidLayout,
        members: usize,
    },

    /// A redundancy group changed state
    GroupStateChanged {
        group: GroupId,
        from: GroupState,
        to: GroupState,
    },

    /// A redundancy group was deleted
    GroupDeleted { group: GroupId },

    /// A pool was created
    PoolCreated { pool: PoolId, name: String },

    /// A pool's aggregate state changed
    PoolStateChanged {
        pool: PoolId,
        from: PoolState,
        to: PoolState,
    },

    /// A pool's total or allocated capacity changed
    PoolCapacityChanged {
        pool: PoolId,
        total_bytes: u64,
        allocated_bytes: u64,
    },

    /// A pool was deleted
    PoolDeleted { pool: PoolId },

    /// A volume changed filesystem state
    VolumeStateChanged {
        volume: VolumeId,
        pool: PoolId,
        from: Option<VolumeState>,
        to: VolumeState,
        mount_path: Option<String>,
    },

    /// A volume was deleted
    VolumeDeleted { volume: VolumeId, pool: PoolId },

    /// A volume's usage crossed its quota
    VolumeQuotaExceeded {
        volume: VolumeId,
        used_bytes: u64,
        quota_bytes: u64,
    },

    /// A task changed state
    TaskStateChanged {
        task: TaskId,
        kind: TaskKind,
        state: TaskState,
    },

    /// A health event was raised
    Health(HealthEvent),
}

impl StorageEvent {
    /// Disk referenced by this event, if any
    pub fn disk_id(&self) -> Option<&DiskId> {
        match self {
            StorageEvent::DiskDiscovered { disk, .. }
            | StorageEvent::DiskMissing { disk, .. }
            | StorageEvent::DiskHealthChanged { disk, .. }
            | StorageEvent::DiskRoleChanged { disk, .. } => Some(disk),
            StorageEvent::Health(event) => Some(&event.disk),
            _ => None,
        }
    }

    /// Check if this is a volume event (consumed by file sharing front ends)
    pub fn is_volume_event(&self) -> bool {
        matches!(
            self,
            StorageEvent::VolumeStateChanged { .. }
                | StorageEvent::VolumeDeleted { .. }
                | StorageEvent::VolumeQuotaExceeded { .. }
        )
    }
}

/// Broadcast bus shared by every component
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<StorageEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Publish an event; having no subscriber is not an error
    pub fn publish(&self, event: StorageEvent) {
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StorageEvent> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_publish_without_subscribers() {
        let bus = EventBus::new(4);
        bus.publish(StorageEvent::GroupDeleted {
            group: GroupId::new("g1"),
        });
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[test]
    fn test_subscriber_receives_events() {
        let bus = EventBus::new(4);
        let mut rx = bus.subscribe();
        bus.publish(StorageEvent::DiskMissing {
            disk: DiskId::new("sda"),
            role: DiskRole::Spare,
        });

        let event = rx.try_recv().unwrap();
        assert_eq!(event.disk_id(), Some(&DiskId::new("sda")));
        assert!(!event.is_volume_event());
    }

    #[test]
    fn test_event_serializes_with_type_tag() {
        let event = StorageEvent::VolumeDeleted {
            volume: VolumeId::new("vol-1"),
            pool: PoolId::new("pool-1"),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "volume_deleted");
        assert_eq!(json["volume"], "vol-1");
    }
}
