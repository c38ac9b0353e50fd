//! Disk Inventory
//!
//! Registry of every physical disk the controller has discovered, with
//! change notification. No redundancy logic lives here: the RAID engine is
//! the only component that changes a disk's role, and the health monitor
//! decides its health status.

use crate::domain::events::{EventBus, StorageEvent};
use crate::domain::types::{format_bytes, DiskId, GroupId};
use crate::error::{Error, Result};
use crate::store::{self, MetadataStore, RecordKind};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::{debug, info, warn};

// =============================================================================
// Disk Attributes
// =============================================================================

/// Kind of physical media
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaType {
    Hdd,
    Ssd,
    Nvme,
    Unknown,
}

impl std::fmt::Display for MediaType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MediaType::Hdd => write!(f, "hdd"),
            MediaType::Ssd => write!(f, "ssd"),
            MediaType::Nvme => write!(f, "nvme"),
            MediaType::Unknown => write!(f, "unknown"),
        }
    }
}

/// Health status of a disk
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DiskHealth {
    Healthy,
    Warning,
    Failing,
    Failed,
    Missing,
}

impl DiskHealth {
    /// Whether the disk can hold data for a redundancy group
    pub fn is_usable(&self) -> bool {
        matches!(self, DiskHealth::Healthy | DiskHealth::Warning)
    }

    /// Whether a member with this health counts as lost
    pub fn is_lost(&self) -> bool {
        matches!(
            self,
            DiskHealth::Failing | DiskHealth::Failed | DiskHealth::Missing
        )
    }
}

impl std::fmt::Display for DiskHealth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DiskHealth::Healthy => write!(f, "healthy"),
            DiskHealth::Warning => write!(f, "warning"),
            DiskHealth::Failing => write!(f, "failing"),
            DiskHealth::Failed => write!(f, "failed"),
            DiskHealth::Missing => write!(f, "missing"),
        }
    }
}

/// Role of a disk in the storage topology
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "role", content = "group", rename_all = "lowercase")]
pub enum DiskRole {
    Unassigned,
    Member(GroupId),
    Spare,
}

impl DiskRole {
    pub fn group(&self) -> Option<&GroupId> {
        match self {
            DiskRole::Member(group) => Some(group),
            _ => None,
        }
    }
}

impl std::fmt::Display for DiskRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DiskRole::Unassigned => write!(f, "unassigned"),
            DiskRole::Member(group) => write!(f, "member({})", group),
            DiskRole::Spare => write!(f, "spare"),
        }
    }
}

/// Raw health counters sampled from a device
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HealthSample {
    /// Temperature in Celsius
    pub temperature_celsius: Option<i32>,
    /// Reallocated sector count
    pub reallocated_sectors: u64,
    /// Current pending sector count
    pub pending_sectors: u64,
    /// Uncorrectable read/write errors
    pub io_errors: u64,
    /// Drive reports an imminent failure
    pub predictive_failure: bool,
}

/// What a probe reports about one device
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiskSample {
    pub id: DiskId,
    pub device_path: String,
    pub model: String,
    pub serial: String,
    pub capacity_bytes: u64,
    pub media: MediaType,
    pub health: HealthSample,
}

// =============================================================================
// Disk Record
// =============================================================================

/// A physical disk known to the controller
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Disk {
    pub id: DiskId,
    pub device_path: String,
    pub model: String,
    pub serial: String,
    pub capacity_bytes: u64,
    pub media: MediaType,
    pub health: DiskHealth,
    pub role: DiskRole,
    /// Most recent health counters
    pub sample: HealthSample,
    pub discovered_at: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
}

impl Disk {
    fn from_sample(sample: DiskSample) -> Self {
        let now = Utc::now();
        Self {
            id: sample.id,
            device_path: sample.device_path,
            model: sample.model,
            serial: sample.serial,
            capacity_bytes: sample.capacity_bytes,
            media: sample.media,
            health: DiskHealth::Healthy,
            role: DiskRole::Unassigned,
            sample: sample.health,
            discovered_at: now,
            last_seen: now,
        }
    }

    fn refresh(&mut self, sample: DiskSample) {
        self.device_path = sample.device_path;
        self.model = sample.model;
        self.serial = sample.serial;
        self.capacity_bytes = sample.capacity_bytes;
        self.media = sample.media;
        self.sample = sample.health;
        self.last_seen = Utc::now();
    }
}

/// Outcome of applying a full scan to the inventory
#[derive(Debug, Clone, Default)]
pub struct ScanReport {
    /// Disks seen for the first time
    pub discovered: Vec<DiskId>,
    /// Known disks that were seen again
    pub refreshed: Vec<DiskId>,
    /// Disks that were missing and came back
    pub reappeared: Vec<DiskId>,
    /// Known disks absent from the scan
    pub disappeared: Vec<DiskId>,
}

// =============================================================================
// Disk Inventory
// =============================================================================

/// Registry of physical disks
pub struct DiskInventory {
    disks: RwLock<BTreeMap<DiskId, Disk>>,
    events: EventBus,
    store: Arc<dyn MetadataStore>,
}

impl std::fmt::Debug for DiskInventory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DiskInventory")
            .field("disk_count", &self.disks.read().len())
            .finish()
    }
}

impl DiskInventory {
    /// Create an empty inventory
    pub fn new(events: EventBus, store: Arc<dyn MetadataStore>) -> Arc<Self> {
        Arc::new(Self {
            disks: RwLock::new(BTreeMap::new()),
            events,
            store,
        })
    }

    /// Reload persisted disk records
    ///
    /// Unreadable records are skipped with a warning: the disk will be
    /// rediscovered by the next scan.
    pub fn restore(&self) -> Result<usize> {
        let records = self.store.load_all(RecordKind::Disk)?;
        let mut disks = self.disks.write();
        for (key, body) in records {
            match store::decode::<Disk>(RecordKind::Disk, &key, &body) {
                Ok(disk) => {
                    disks.insert(disk.id.clone(), disk);
                }
                Err(e) => warn!("Skipping disk record: {}", e),
            }
        }
        Ok(disks.len())
    }

    /// Snapshot of all known disks
    pub fn list_disks(&self) -> Vec<Disk> {
        self.disks.read().values().cloned().collect()
    }

    /// Get a disk by ID
    pub fn get_disk(&self, id: &DiskId) -> Result<Disk> {
        self.disks
            .read()
            .get(id)
            .cloned()
            .ok_or_else(|| Error::not_found("disk", id))
    }

    /// Disks currently designated as hot spares
    pub fn spares(&self) -> Vec<Disk> {
        self.disks
            .read()
            .values()
            .filter(|d| d.role == DiskRole::Spare)
            .cloned()
            .collect()
    }

    /// Register one discovered disk, or refresh it if already known
    pub fn register(&self, sample: DiskSample) -> Disk {
        let id = sample.id.clone();
        let mut disks = self.disks.write();
        let (disk, discovered, reappeared) = match disks.get_mut(&id) {
            Some(disk) => {
                disk.refresh(sample);
                let reappeared = disk.health == DiskHealth::Missing;
                if reappeared {
                    disk.health = DiskHealth::Healthy;
                }
                (disk.clone(), false, reappeared)
            }
            None => {
                let disk = Disk::from_sample(sample);
                disks.insert(id.clone(), disk.clone());
                (disk, true, false)
            }
        };
        drop(disks);

        store::persist(&*self.store, RecordKind::Disk, id.as_str(), &disk);

        if discovered {
            info!(
                "Discovered disk {} ({}, {}, {})",
                id,
                disk.device_path,
                disk.media,
                format_bytes(disk.capacity_bytes)
            );
            self.events.publish(StorageEvent::DiskDiscovered {
                disk: id,
                capacity_bytes: disk.capacity_bytes,
                media: disk.media,
            });
        } else if reappeared {
            info!("Disk {} reappeared", id);
            self.events.publish(StorageEvent::DiskHealthChanged {
                disk: id,
                from: DiskHealth::Missing,
                to: DiskHealth::Healthy,
            });
        }

        disk
    }

    /// Apply a full scan: register every sample and report disks that vanished
    pub fn apply_scan(&self, samples: Vec<DiskSample>) -> ScanReport {
        let mut report = ScanReport::default();
        let seen: BTreeSet<DiskId> = samples.iter().map(|s| s.id.clone()).collect();

        for sample in samples {
            let id = sample.id.clone();
            let was = self.disks.read().get(&id).map(|d| d.health);
            self.register(sample);
            match was {
                None => report.discovered.push(id),
                Some(DiskHealth::Missing) => report.reappeared.push(id),
                Some(_) => report.refreshed.push(id),
            }
        }

        report.disappeared = self
            .disks
            .read()
            .values()
            .filter(|d| d.health != DiskHealth::Missing && !seen.contains(&d.id))
            .map(|d| d.id.clone())
            .collect();

        debug!(
            "Scan applied: {} discovered, {} refreshed, {} disappeared",
            report.discovered.len(),
            report.refreshed.len(),
            report.disappeared.len()
        );

        report
    }

    /// Mark a disk as missing and return the role it held
    ///
    /// The caller (the RAID engine) is responsible for acting on the role:
    /// returning a spare to the unassigned pool, or propagating membership
    /// loss to the owning group.
    pub fn mark_missing(&self, id: &DiskId) -> Result<DiskRole> {
        let (previous, role) = {
            let mut disks = self.disks.write();
            let disk = disks.get_mut(id).ok_or_else(|| Error::not_found("disk", id))?;
            let previous = disk.health;
            disk.health = DiskHealth::Missing;
            let role = disk.role.clone();
            let snapshot = disk.clone();
            drop(disks);
            store::persist(&*self.store, RecordKind::Disk, id.as_str(), &snapshot);
            (previous, role)
        };

        if previous != DiskHealth::Missing {
            warn!("Disk {} is missing (role {})", id, role);
            self.events.publish(StorageEvent::DiskMissing {
                disk: id.clone(),
                role: role.clone(),
            });
        }

        Ok(role)
    }

    /// Record the health status decided by the health monitor
    ///
    /// Returns the previous status.
    pub(crate) fn set_health(&self, id: &DiskId, health: DiskHealth) -> Result<DiskHealth> {
        let snapshot = {
            let mut disks = self.disks.write();
            let disk = disks.get_mut(id).ok_or_else(|| Error::not_found("disk", id))?;
            if disk.health == health {
                return Ok(health);
            }
            let previous = disk.health;
            disk.health = health;
            (previous, disk.clone())
        };
        let (previous, disk) = snapshot;

        store::persist(&*self.store, RecordKind::Disk, id.as_str(), &disk);
        self.events.publish(StorageEvent::DiskHealthChanged {
            disk: id.clone(),
            from: previous,
            to: health,
        });

        Ok(previous)
    }

    /// Change the role of several disks at once, all or nothing
    ///
    /// `check` validates every disk before any role is written; the whole
    /// operation happens under one write lock so no other claim can
    /// interleave.
    pub(crate) fn claim<F>(&self, ids: &[DiskId], role: DiskRole, check: F) -> Result<Vec<Disk>>
    where
        F: Fn(&Disk) -> Result<()>,
    {
        let mut disks = self.disks.write();

        for id in ids {
            let disk = disks.get(id).ok_or_else(|| Error::not_found("disk", id))?;
            check(disk)?;
        }

        let mut changed = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(disk) = disks.get_mut(id) {
                let from = std::mem::replace(&mut disk.role, role.clone());
                changed.push((disk.clone(), from));
            }
        }
        drop(disks);

        let mut claimed = Vec::with_capacity(changed.len());
        for (disk, from) in changed {
            store::persist(&*self.store, RecordKind::Disk, disk.id.as_str(), &disk);
            self.events.publish(StorageEvent::DiskRoleChanged {
                disk: disk.id.clone(),
                from,
                to: role.clone(),
            });
            claimed.push(disk);
        }

        Ok(claimed)
    }

    /// Change the role of one disk unconditionally
    pub(crate) fn set_role(&self, id: &DiskId, role: DiskRole) -> Result<()> {
        debug!("Setting disk {} role to {}", id, role);
        self.claim(std::slice::from_ref(id), role, |_| Ok(()))?;
        Ok(())
    }

    /// Number of known disks
    pub fn len(&self) -> usize {
        self.disks.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.disks.read().is_empty()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::domain::types::GIB;
    use crate::store::MemoryStore;
    use assert_matches::assert_matches;

    pub(crate) fn sample(id: &str, capacity_bytes: u64) -> DiskSample {
        DiskSample {
            id: DiskId::new(id),
            device_path: format!("/dev/{}", id),
            model: "TEST-DISK".into(),
            serial: format!("SN-{}", id),
            capacity_bytes,
            media: MediaType::Hdd,
            health: HealthSample::default(),
        }
    }

    fn inventory() -> Arc<DiskInventory> {
        DiskInventory::new(EventBus::new(64), Arc::new(MemoryStore::new()))
    }

    #[test]
    fn test_register_and_get() {
        let inventory = inventory();
        inventory.register(sample("sda", 4 * GIB));

        let disk = inventory.get_disk(&DiskId::new("sda")).unwrap();
        assert_eq!(disk.capacity_bytes, 4 * GIB);
        assert_eq!(disk.health, DiskHealth::Healthy);
        assert_eq!(disk.role, DiskRole::Unassigned);
        assert_eq!(inventory.list_disks().len(), 1);
    }

    #[test]
    fn test_unknown_disk_is_not_found() {
        let inventory = inventory();
        assert_matches!(
            inventory.get_disk(&DiskId::new("sdz")),
            Err(Error::NotFound { kind: "disk", .. })
        );
    }

    #[test]
    fn test_scan_reports_disappeared_disks() {
        let inventory = inventory();
        inventory.apply_scan(vec![sample("sda", GIB), sample("sdb", GIB)]);

        let report = inventory.apply_scan(vec![sample("sda", GIB)]);
        assert_eq!(report.refreshed, vec![DiskId::new("sda")]);
        assert_eq!(report.disappeared, vec![DiskId::new("sdb")]);
    }

    #[test]
    fn test_mark_missing_returns_role_and_reappears() {
        let inventory = inventory();
        inventory.register(sample("sda", GIB));
        inventory
            .set_role(&DiskId::new("sda"), DiskRole::Spare)
            .unwrap();

        let mut rx = inventory.events.subscribe();
        let role = inventory.mark_missing(&DiskId::new("sda")).unwrap();
        assert_eq!(role, DiskRole::Spare);
        assert_matches!(rx.try_recv(), Ok(StorageEvent::DiskMissing { .. }));

        let report = inventory.apply_scan(vec![sample("sda", GIB)]);
        assert_eq!(report.reappeared, vec![DiskId::new("sda")]);
        let disk = inventory.get_disk(&DiskId::new("sda")).unwrap();
        assert_eq!(disk.health, DiskHealth::Healthy);
    }

    #[test]
    fn test_claim_is_all_or_nothing() {
        let inventory = inventory();
        inventory.register(sample("sda", GIB));
        inventory.register(sample("sdb", GIB));
        inventory
            .set_role(&DiskId::new("sdb"), DiskRole::Spare)
            .unwrap();

        let ids = vec![DiskId::new("sda"), DiskId::new("sdb")];
        let result = inventory.claim(&ids, DiskRole::Member(GroupId::new("g1")), |d| {
            if d.role == DiskRole::Unassigned {
                Ok(())
            } else {
                Err(Error::DiskUnavailable {
                    disk: d.id.to_string(),
                    reason: "in use".into(),
                })
            }
        });

        assert!(result.is_err());
        assert_eq!(
            inventory.get_disk(&DiskId::new("sda")).unwrap().role,
            DiskRole::Unassigned
        );
    }

    #[test]
    fn test_restore_from_store() {
        let store: Arc<dyn MetadataStore> = Arc::new(MemoryStore::new());
        let first = DiskInventory::new(EventBus::new(8), store.clone());
        first.register(sample("sda", GIB));

        let second = DiskInventory::new(EventBus::new(8), store);
        assert_eq!(second.restore().unwrap(), 1);
        assert!(second.get_disk(&DiskId::new("sda")).is_ok());
    }
}
