//! RAID Engine
//!
//! Creates and manages redundancy groups over inventory disks. The engine
//! is the only writer of disk roles: it claims members on creation, swaps
//! replacements into slots, moves disks in and out of the spare set and
//! releases members when a group is deleted.

use crate::config::RaidConfig;
use crate::domain::arena::EntityArena;
use crate::domain::events::{EventBus, StorageEvent};
use crate::domain::types::{format_bytes, DiskId, GroupId, PoolId};
use crate::error::{Error, Result};
use crate::hardware::inventory::{Disk, DiskInventory, DiskRole};
use crate::raid::group::{GroupEvent, GroupState, MemberStatus, RedundancyGroup, ScrubRecord, Transition};
use crate::raid::layout::RaidLayout;
use crate::scheduler::{TaskHandle, TaskOperation, TaskOutcome, TaskScheduler, TaskTarget};
use crate::store::{self, MetadataStore, RecordKind};
use chrono::Utc;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Redundancy group manager
pub struct RaidEngine {
    config: RaidConfig,
    inventory: Arc<DiskInventory>,
    groups: EntityArena<GroupId, RedundancyGroup>,
    scheduler: Arc<TaskScheduler>,
    events: EventBus,
    store: Arc<dyn MetadataStore>,
}

impl std::fmt::Debug for RaidEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RaidEngine")
            .field("groups", &self.groups.len())
            .finish()
    }
}

impl RaidEngine {
    pub fn new(
        config: RaidConfig,
        lock_timeout: Duration,
        inventory: Arc<DiskInventory>,
        scheduler: Arc<TaskScheduler>,
        events: EventBus,
        store: Arc<dyn MetadataStore>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            inventory,
            groups: EntityArena::new("group", lock_timeout),
            scheduler,
            events,
            store,
        })
    }

    /// Reload persisted groups; returns the keys of unreadable records
    pub fn restore(&self) -> Result<Vec<String>> {
        let mut corrupt = Vec::new();
        for (key, body) in self.store.load_all(RecordKind::Group)? {
            match store::decode::<RedundancyGroup>(RecordKind::Group, &key, &body) {
                Ok(group) => {
                    debug!("Restored group {} ({})", group.id, group.state);
                    self.groups.insert(group.id.clone(), group)?;
                }
                Err(e) => {
                    warn!("{}", e);
                    corrupt.push(key);
                }
            }
        }
        info!(
            "Restored {} group(s), {} corrupt",
            self.groups.len(),
            corrupt.len()
        );
        Ok(corrupt)
    }

    // =========================================================================
    // Queries
    // =========================================================================

    pub fn list_groups(&self) -> Vec<RedundancyGroup> {
        self.groups.snapshots()
    }

    pub fn get_group(&self, id: &GroupId) -> Result<RedundancyGroup> {
        self.groups.snapshot(id)
    }

    // =========================================================================
    // Group Lifecycle
    // =========================================================================

    /// Create a group, claiming every member atomically
    pub fn create_group(&self, layout: RaidLayout, disks: Vec<DiskId>) -> Result<RedundancyGroup> {
        if disks.len() < layout.min_members() {
            return Err(Error::InvalidLayout {
                layout: layout.to_string(),
                reason: format!(
                    "requires at least {} members, got {}",
                    layout.min_members(),
                    disks.len()
                ),
            });
        }

        let unique: BTreeSet<&DiskId> = disks.iter().collect();
        if unique.len() != disks.len() {
            return Err(Error::InvalidLayout {
                layout: layout.to_string(),
                reason: "a disk is listed more than once".into(),
            });
        }

        let mut capacities = Vec::with_capacity(disks.len());
        for id in &disks {
            let disk = self.inventory.get_disk(id)?;
            check_assignable(&disk, false)?;
            capacities.push(disk.capacity_bytes);
        }
        let member_capacity =
            layout.validate_members(&capacities, self.config.mirror_capacity_tolerance_percent)?;

        let id = GroupId::generate();
        self.inventory
            .claim(&disks, DiskRole::Member(id.clone()), |d| check_assignable(d, false))?;

        let group = RedundancyGroup::new(id.clone(), layout, disks, member_capacity);
        store::persist(&*self.store, RecordKind::Group, id.as_str(), &group);
        self.groups.insert(id.clone(), group.clone())?;

        info!(
            "Created {} group {} with {} members ({} usable)",
            layout,
            id,
            group.members.len(),
            format_bytes(group.usable_capacity())
        );
        self.events.publish(StorageEvent::GroupCreated {
            group: id,
            layout,
            members: group.members.len(),
        });

        Ok(group)
    }

    /// Delete a group that belongs to no pool, releasing its members
    pub fn delete_group(&self, id: &GroupId) -> Result<RedundancyGroup> {
        if self.scheduler.has_active(&TaskTarget::Group(id.clone())) {
            return Err(Error::InvalidState {
                entity: format!("group/{}", id),
                reason: "group has active tasks".into(),
            });
        }

        let group = self.groups.remove_with(id, |g| match &g.pool {
            Some(pool) => Err(Error::GroupInUse {
                group: g.id.to_string(),
                pool: pool.to_string(),
            }),
            None => Ok(()),
        })?;

        let owned = DiskRole::Member(id.clone());
        for member in &group.members {
            let candidates = std::iter::once(&member.disk).chain(member.replacing.iter());
            for disk in candidates {
                let still_member = self
                    .inventory
                    .get_disk(disk)
                    .map(|d| d.role == owned)
                    .unwrap_or(false);
                if still_member {
                    self.inventory.set_role(disk, DiskRole::Unassigned)?;
                }
            }
        }

        store::forget(&*self.store, RecordKind::Group, id.as_str());
        info!("Deleted group {} ({})", id, group.layout);
        self.events
            .publish(StorageEvent::GroupDeleted { group: id.clone() });
        Ok(group)
    }

    /// Take a group offline
    pub fn deactivate_group(&self, id: &GroupId) -> Result<RedundancyGroup> {
        let (transition, group) = self.groups.with(id, |g| {
            let t = g.apply(GroupEvent::Deactivate)?;
            self.save(g);
            Ok((t, g.clone()))
        })?;
        self.scheduler
            .fail_target(&TaskTarget::Group(id.clone()), "group was deactivated");
        self.after_transition(id, &transition);
        Ok(group)
    }

    /// Bring an offline group back; its state is recomputed from membership
    pub fn activate_group(&self, id: &GroupId) -> Result<RedundancyGroup> {
        let (transition, group) = self.groups.with(id, |g| {
            let t = g.apply(GroupEvent::Reactivate)?;
            self.save(g);
            Ok((t, g.clone()))
        })?;
        self.after_transition(id, &transition);
        if transition.changed() && transition.to == GroupState::Degraded {
            self.try_auto_replace(id);
        }
        Ok(group)
    }

    // =========================================================================
    // Member Replacement
    // =========================================================================

    /// Replace a member with a new disk and start the rebuild
    ///
    /// Replacing an active member is a planned replacement: the member is
    /// ejected first, which is refused when it would cost redundancy the
    /// layout cannot spare.
    ///
    /// Passing the lost member as its own replacement re-adds it once it
    /// is healthy again (a disk that reappeared or recovered).
    pub fn replace_member(&self, id: &GroupId, old: &DiskId, new: &DiskId) -> Result<TaskHandle> {
        let readd = old == new;
        let new_disk = self.inventory.get_disk(new)?;
        if readd {
            check_readdable(&new_disk, id)?;
        } else {
            check_assignable(&new_disk, true)?;
        }

        let (transitions, slot) = self.groups.with(id, |g| {
            if matches!(g.state, GroupState::Failed | GroupState::Offline) {
                return Err(Error::TargetUnavailable {
                    target: format!("group/{}", g.id),
                    reason: format!("group is {}", g.state),
                });
            }
            if new_disk.capacity_bytes < g.member_capacity {
                return Err(Error::InsufficientCapacity {
                    required: g.member_capacity,
                    offered: new_disk.capacity_bytes,
                });
            }
            let slot = g.slot_of(old).ok_or_else(|| Error::NotFound {
                kind: "member",
                id: format!("{}/{}", g.id, old),
            })?;
            let status = g.members[slot].status;
            match status {
                MemberStatus::Resyncing => {
                    return Err(Error::InvalidState {
                        entity: format!("group/{}", g.id),
                        reason: format!("slot {} is already rebuilding", slot),
                    })
                }
                MemberStatus::Active if readd => {
                    return Err(Error::InvalidState {
                        entity: format!("group/{}", g.id),
                        reason: format!("member {} is not lost", old),
                    })
                }
                MemberStatus::Active if g.surviving() <= g.threshold() => {
                    return Err(Error::InvalidState {
                        entity: format!("group/{}", g.id),
                        reason: "ejecting an active member would fail the group".into(),
                    })
                }
                _ => {}
            }

            let previous_role = new_disk.role.clone();
            if !readd {
                self.inventory
                    .claim(std::slice::from_ref(new), DiskRole::Member(g.id.clone()), |d| {
                        check_assignable(d, true)
                    })?;
            }

            let mut transitions = Vec::with_capacity(2);
            if status == MemberStatus::Active {
                transitions.push(g.apply(GroupEvent::MemberLost { disk: old.clone() })?);
            }
            match g.apply(GroupEvent::RebuildStarted {
                slot,
                disk: new.clone(),
            }) {
                Ok(t) => transitions.push(t),
                Err(e) => {
                    if !readd {
                        let _ = self.inventory.set_role(new, previous_role);
                    }
                    return Err(e);
                }
            }
            self.save(g);
            Ok((transitions, slot))
        })?;

        for transition in &transitions {
            self.after_transition(id, transition);
        }

        let operation = TaskOperation::GroupRebuild {
            group: id.clone(),
            slot,
            disk: new.clone(),
        };
        match self.scheduler.submit(operation) {
            Ok(handle) => {
                info!(
                    "Replacing {} with {} in group {} slot {} (task {})",
                    old,
                    new,
                    id,
                    slot,
                    handle.id()
                );
                Ok(handle)
            }
            Err(e) => {
                warn!("Could not submit rebuild for group {}: {}", id, e);
                let _ = self.complete_rebuild(id, slot, new, &TaskOutcome::Cancelled);
                Err(e)
            }
        }
    }

    /// Commit or roll back a finished rebuild
    pub(crate) fn complete_rebuild(
        &self,
        id: &GroupId,
        slot: usize,
        disk: &DiskId,
        outcome: &TaskOutcome,
    ) -> Result<()> {
        let event = if outcome.is_success() {
            GroupEvent::RebuildSucceeded {
                slot,
                disk: disk.clone(),
            }
        } else {
            GroupEvent::RebuildAborted {
                slot,
                disk: disk.clone(),
            }
        };

        let result = self.groups.with(id, |g| {
            let t = g.apply(event)?;
            self.save(g);
            Ok(t)
        });

        match result {
            Ok(transition) => {
                match outcome {
                    TaskOutcome::Succeeded => info!("Rebuild of group {} slot {} complete", id, slot),
                    TaskOutcome::Failed(reason) => {
                        warn!("Rebuild of group {} slot {} failed: {}", id, slot, reason)
                    }
                    TaskOutcome::Cancelled => info!("Rebuild of group {} slot {} cancelled", id, slot),
                }
                self.after_transition(id, &transition);
                Ok(())
            }
            // The slot was already rolled back (replacement lost) or the
            // group is gone: nothing left to commit.
            Err(Error::InvalidState { reason, .. }) => {
                debug!("Ignoring stale rebuild completion for {}: {}", id, reason);
                Ok(())
            }
            Err(Error::NotFound { .. }) => Ok(()),
            Err(e) => Err(e),
        }
    }

    // =========================================================================
    // Scrub
    // =========================================================================

    /// Start an integrity scrub
    pub fn scrub_group(&self, id: &GroupId) -> Result<TaskHandle> {
        let group = self.groups.snapshot(id)?;
        if matches!(group.state, GroupState::Failed | GroupState::Offline) {
            return Err(Error::TargetUnavailable {
                target: format!("group/{}", id),
                reason: format!("group is {}", group.state),
            });
        }
        let handle = self.scheduler.submit(TaskOperation::GroupScrub { group: id.clone() })?;
        info!("Scrub of group {} submitted (task {})", id, handle.id());
        Ok(handle)
    }

    /// Record the result of a finished scrub
    pub(crate) fn complete_scrub(&self, id: &GroupId, outcome: &TaskOutcome) -> Result<()> {
        let record = match outcome {
            TaskOutcome::Succeeded => ScrubRecord {
                finished_at: Utc::now(),
                succeeded: true,
                message: None,
            },
            TaskOutcome::Failed(reason) => ScrubRecord {
                finished_at: Utc::now(),
                succeeded: false,
                message: Some(reason.clone()),
            },
            TaskOutcome::Cancelled => return Ok(()),
        };

        match self.groups.with(id, |g| {
            g.last_scrub = Some(record);
            self.save(g);
            Ok(())
        }) {
            Err(Error::NotFound { .. }) => Ok(()),
            other => other,
        }
    }

    // =========================================================================
    // Spares
    // =========================================================================

    /// Designate an unassigned disk as hot spare
    pub fn add_spare(&self, disk: &DiskId) -> Result<Disk> {
        let mut claimed = self
            .inventory
            .claim(std::slice::from_ref(disk), DiskRole::Spare, |d| {
                check_assignable(d, false)
            })?;
        info!("Disk {} added as hot spare", disk);

        if self.config.auto_replace_with_spares {
            for group in self.groups.snapshots() {
                if group.state == GroupState::Degraded {
                    self.try_auto_replace(&group.id);
                }
            }
        }

        claimed.pop().ok_or_else(|| Error::not_found("disk", disk))
    }

    /// Return a spare to the unassigned set
    pub fn remove_spare(&self, disk: &DiskId) -> Result<Disk> {
        let mut claimed = self
            .inventory
            .claim(std::slice::from_ref(disk), DiskRole::Unassigned, |d| {
                if d.role == DiskRole::Spare {
                    Ok(())
                } else {
                    Err(Error::InvalidState {
                        entity: format!("disk/{}", d.id),
                        reason: format!("disk is {}, not a spare", d.role),
                    })
                }
            })?;
        info!("Disk {} removed from hot spares", disk);
        claimed.pop().ok_or_else(|| Error::not_found("disk", disk))
    }

    /// Start a rebuild from the smallest sufficient spare, if any
    fn try_auto_replace(&self, id: &GroupId) -> Option<TaskHandle> {
        if !self.config.auto_replace_with_spares {
            return None;
        }
        let group = self.groups.snapshot(id).ok()?;
        if group.state != GroupState::Degraded {
            return None;
        }
        let slot = group.first_lost_slot()?;
        let lost = group.members[slot].disk.clone();

        let mut spares: Vec<Disk> = self
            .inventory
            .spares()
            .into_iter()
            .filter(|d| d.health.is_usable() && d.capacity_bytes >= group.member_capacity)
            .collect();
        spares.sort_by_key(|d| d.capacity_bytes);

        for spare in spares {
            match self.replace_member(id, &lost, &spare.id) {
                Ok(handle) => {
                    info!(
                        "Hot spare {} assigned to group {} (task {})",
                        spare.id,
                        id,
                        handle.id()
                    );
                    return Some(handle);
                }
                // Taken by a concurrent replacement, try the next one
                Err(Error::DiskUnavailable { .. }) => continue,
                Err(e) => {
                    warn!("Automatic replacement in group {} failed: {}", id, e);
                    return None;
                }
            }
        }

        debug!("No suitable hot spare for group {}", id);
        None
    }

    // =========================================================================
    // Membership Loss
    // =========================================================================

    /// A disk failed: propagate the loss to its group
    pub fn handle_member_failure(&self, disk: &DiskId) -> Result<()> {
        let record = self.inventory.get_disk(disk)?;
        let id = match record.role {
            DiskRole::Member(group) => group,
            DiskRole::Spare => {
                warn!("Hot spare {} is no longer usable", disk);
                return self.inventory.set_role(disk, DiskRole::Unassigned);
            }
            DiskRole::Unassigned => return Ok(()),
        };

        let (transition, was_resyncing, pool) = self.groups.with(&id, |g| {
            let was_resyncing = g
                .slot_of(disk)
                .map_or(false, |s| g.members[s].status == MemberStatus::Resyncing);
            let t = g.apply(GroupEvent::MemberLost { disk: disk.clone() })?;
            self.save(g);
            Ok((t, was_resyncing, g.pool.clone()))
        })?;

        warn!(
            "Group {} lost member {} ({} -> {})",
            id, disk, transition.from, transition.to
        );

        if was_resyncing {
            let target = TaskTarget::Group(id.clone());
            for task in self.scheduler.active_tasks(&target) {
                if matches!(&task.operation, TaskOperation::GroupRebuild { disk: d, .. } if d == disk)
                {
                    let _ = self.scheduler.cancel(&task.id);
                }
            }
        }

        self.after_transition(&id, &transition);

        if transition.changed() && transition.to == GroupState::Failed {
            let reason = format!("group {} failed", id);
            self.scheduler
                .fail_target(&TaskTarget::Group(id.clone()), &reason);
            if let Some(pool) = pool {
                self.scheduler.fail_target(&TaskTarget::Pool(pool), &reason);
            }
        } else if transition.to == GroupState::Degraded {
            self.try_auto_replace(&id);
        }

        Ok(())
    }

    /// A disk disappeared: mark it missing and act on its role
    pub fn handle_disk_missing(&self, disk: &DiskId) -> Result<()> {
        match self.inventory.mark_missing(disk)? {
            DiskRole::Spare => self.inventory.set_role(disk, DiskRole::Unassigned),
            DiskRole::Member(_) => self.handle_member_failure(disk),
            DiskRole::Unassigned => Ok(()),
        }
    }

    // =========================================================================
    // Pool Attachment
    // =========================================================================

    /// Attach groups to a pool, all or nothing
    pub(crate) fn attach_to_pool(
        &self,
        ids: &[GroupId],
        pool: &PoolId,
    ) -> Result<Vec<RedundancyGroup>> {
        let mut attached: Vec<RedundancyGroup> = Vec::with_capacity(ids.len());
        for id in ids {
            let result = self.groups.with(id, |g| {
                check_attachable(g)?;
                g.pool = Some(pool.clone());
                self.save(g);
                Ok(g.clone())
            });
            match result {
                Ok(group) => attached.push(group),
                Err(e) => {
                    let done: Vec<GroupId> = attached.iter().map(|g| g.id.clone()).collect();
                    self.detach_from_pool(&done, pool);
                    return Err(e);
                }
            }
        }
        Ok(attached)
    }

    /// Detach groups from a pool
    pub(crate) fn detach_from_pool(&self, ids: &[GroupId], pool: &PoolId) {
        for id in ids {
            let result = self.groups.with(id, |g| {
                if g.pool.as_ref() == Some(pool) {
                    g.pool = None;
                    self.save(g);
                }
                Ok(())
            });
            if let Err(e) = result {
                warn!("Could not detach group {} from pool {}: {}", id, pool, e);
            }
        }
    }

    /// Validate that groups could be attached, without attaching them
    pub(crate) fn check_attachable(&self, ids: &[GroupId]) -> Result<Vec<RedundancyGroup>> {
        ids.iter()
            .map(|id| {
                let group = self.groups.snapshot(id)?;
                check_attachable(&group)?;
                Ok(group)
            })
            .collect()
    }

    // =========================================================================
    // Restart Recovery
    // =========================================================================

    /// Resubmit rebuilds for resyncing slots that have no live task
    pub(crate) fn resume_stalled_rebuilds(&self) -> usize {
        let mut resumed = 0;
        for group in self.groups.snapshots() {
            let target = TaskTarget::Group(group.id.clone());
            let live = self.scheduler.active_tasks(&target);
            for (slot, member) in group.members.iter().enumerate() {
                if member.status != MemberStatus::Resyncing {
                    continue;
                }
                let covered = live.iter().any(|t| {
                    matches!(&t.operation, TaskOperation::GroupRebuild { slot: s, .. } if *s == slot)
                });
                if covered {
                    continue;
                }
                let operation = TaskOperation::GroupRebuild {
                    group: group.id.clone(),
                    slot,
                    disk: member.disk.clone(),
                };
                match self.scheduler.submit(operation) {
                    Ok(handle) => {
                        info!(
                            "Restarted rebuild of group {} slot {} (task {})",
                            group.id,
                            slot,
                            handle.id()
                        );
                        resumed += 1;
                    }
                    Err(e) => warn!("Could not restart rebuild of group {}: {}", group.id, e),
                }
            }
        }
        resumed
    }

    // =========================================================================
    // Helpers
    // =========================================================================

    fn save(&self, group: &RedundancyGroup) {
        store::persist(&*self.store, RecordKind::Group, group.id.as_str(), group);
    }

    /// Release an ejected disk and publish the state change
    fn after_transition(&self, id: &GroupId, transition: &Transition) {
        if let Some(disk) = &transition.ejected {
            let owned = DiskRole::Member(id.clone());
            let still_member = self
                .inventory
                .get_disk(disk)
                .map(|d| d.role == owned)
                .unwrap_or(false);
            if still_member {
                if let Err(e) = self.inventory.set_role(disk, DiskRole::Unassigned) {
                    warn!("Could not release disk {}: {}", disk, e);
                }
            }
        }

        if transition.changed() {
            info!(
                "Group {} state {} -> {}",
                id, transition.from, transition.to
            );
            self.events.publish(StorageEvent::GroupStateChanged {
                group: id.clone(),
                from: transition.from,
                to: transition.to,
            });
        }
    }
}

/// A disk can join a group: healthy enough and not in use
fn check_assignable(disk: &Disk, allow_spare: bool) -> Result<()> {
    let free = match disk.role {
        DiskRole::Unassigned => true,
        DiskRole::Spare => allow_spare,
        DiskRole::Member(_) => false,
    };
    if !free {
        return Err(Error::DiskUnavailable {
            disk: disk.id.to_string(),
            reason: format!("disk is {}", disk.role),
        });
    }
    if !disk.health.is_usable() {
        return Err(Error::DiskUnavailable {
            disk: disk.id.to_string(),
            reason: format!("disk is {}", disk.health),
        });
    }
    Ok(())
}

/// A lost member can rejoin its own group once it is usable again
fn check_readdable(disk: &Disk, group: &GroupId) -> Result<()> {
    if disk.role != DiskRole::Member(group.clone()) {
        return Err(Error::DiskUnavailable {
            disk: disk.id.to_string(),
            reason: format!("disk is {}", disk.role),
        });
    }
    if !disk.health.is_usable() {
        return Err(Error::DiskUnavailable {
            disk: disk.id.to_string(),
            reason: format!("disk is {}", disk.health),
        });
    }
    Ok(())
}

/// A group can join a pool: serving and not owned by another pool
fn check_attachable(group: &RedundancyGroup) -> Result<()> {
    if let Some(owner) = &group.pool {
        return Err(Error::GroupInUse {
            group: group.id.to_string(),
            pool: owner.to_string(),
        });
    }
    if !matches!(group.state, GroupState::Online | GroupState::Degraded) {
        return Err(Error::GroupNotOnline {
            group: group.id.to_string(),
            state: group.state.to_string(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{Scripted, SimulatedBackend, SimulatedBackendConfig};
    use crate::config::SchedulerConfig;
    use crate::hardware::inventory::tests::sample;
    use crate::hardware::inventory::DiskHealth;
    use crate::scheduler::{TaskKind, TaskState};
    use crate::store::MemoryStore;
    use assert_matches::assert_matches;

    struct Harness {
        engine: Arc<RaidEngine>,
        inventory: Arc<DiskInventory>,
        backend: Arc<SimulatedBackend>,
    }

    fn harness(auto_replace: bool) -> Harness {
        let events = EventBus::new(256);
        let store: Arc<dyn MetadataStore> = Arc::new(MemoryStore::new());
        let inventory = DiskInventory::new(events.clone(), store.clone());
        let backend = Arc::new(SimulatedBackend::new(SimulatedBackendConfig {
            steps: 3,
            step_delay_ms: 1,
        }));
        let (scheduler, mut completions) = TaskScheduler::start(
            SchedulerConfig {
                initial_backoff_ms: 1,
                max_backoff_ms: 2,
                ..SchedulerConfig::default()
            },
            backend.clone(),
            store.clone(),
            events.clone(),
        );
        let engine = RaidEngine::new(
            RaidConfig {
                mirror_capacity_tolerance_percent: 1.0,
                auto_replace_with_spares: auto_replace,
            },
            Duration::from_millis(200),
            inventory.clone(),
            scheduler,
            events,
            store,
        );

        let pump = engine.clone();
        tokio::spawn(async move {
            while let Some(completion) = completions.recv().await {
                match &completion.task.operation {
                    TaskOperation::GroupRebuild { group, slot, disk } => {
                        pump.complete_rebuild(group, *slot, disk, &completion.outcome)
                            .unwrap()
                    }
                    TaskOperation::GroupScrub { group } => {
                        pump.complete_scrub(group, &completion.outcome).unwrap()
                    }
                    _ => {}
                }
                completion.acknowledge();
            }
        });

        for (id, capacity) in [("sda", 1000), ("sdb", 1000), ("sdc", 1000), ("sdd", 1500), ("sde", 500)] {
            inventory.register(sample(id, capacity));
        }

        Harness {
            engine,
            inventory,
            backend,
        }
    }

    fn ids(names: &[&str]) -> Vec<DiskId> {
        names.iter().map(|n| DiskId::new(*n)).collect()
    }

    fn role(h: &Harness, disk: &str) -> DiskRole {
        h.inventory.get_disk(&DiskId::new(disk)).unwrap().role
    }

    fn fail(h: &Harness, disk: &str) {
        let id = DiskId::new(disk);
        h.inventory.set_health(&id, DiskHealth::Failed).unwrap();
        h.engine.handle_member_failure(&id).unwrap();
    }

    #[tokio::test]
    async fn test_create_group_below_minimum_changes_nothing() {
        let h = harness(false);
        for layout in [
            RaidLayout::Mirror,
            RaidLayout::ParitySingle,
            RaidLayout::ParityDual,
            RaidLayout::Stripe,
        ] {
            let disks = ids(&["sda", "sdb", "sdc"])[..layout.min_members() - 1].to_vec();
            assert_matches!(
                h.engine.create_group(layout, disks),
                Err(Error::InvalidLayout { .. })
            );
        }
        assert!(h.engine.list_groups().is_empty());
        assert_eq!(role(&h, "sda"), DiskRole::Unassigned);
    }

    #[tokio::test]
    async fn test_mirror_with_unequal_disks_is_rejected() {
        let h = harness(false);
        assert_matches!(
            h.engine.create_group(RaidLayout::Mirror, ids(&["sda", "sdd"])),
            Err(Error::IncompatibleDiskSize {
                smallest: 1000,
                largest: 1500
            })
        );
        assert_eq!(role(&h, "sdd"), DiskRole::Unassigned);
    }

    #[tokio::test]
    async fn test_create_group_claims_members() {
        let h = harness(false);
        let group = h
            .engine
            .create_group(RaidLayout::ParitySingle, ids(&["sda", "sdb", "sdd"]))
            .unwrap();
        assert_eq!(group.state, GroupState::Online);
        assert_eq!(group.member_capacity, 1000);
        assert_eq!(group.usable_capacity(), 2000);
        assert_eq!(role(&h, "sdd"), DiskRole::Member(group.id.clone()));

        // Members cannot be claimed twice, duplicates are rejected
        assert_matches!(
            h.engine.create_group(RaidLayout::Mirror, ids(&["sda", "sdc"])),
            Err(Error::DiskUnavailable { .. })
        );
        assert_matches!(
            h.engine.create_group(RaidLayout::Mirror, ids(&["sdc", "sdc"])),
            Err(Error::InvalidLayout { .. })
        );
        assert_eq!(role(&h, "sdc"), DiskRole::Unassigned);
    }

    #[tokio::test]
    async fn test_member_loss_degrades_then_fails() {
        let h = harness(false);
        let group = h
            .engine
            .create_group(RaidLayout::Mirror, ids(&["sda", "sdb"]))
            .unwrap();

        fail(&h, "sda");
        assert_eq!(
            h.engine.get_group(&group.id).unwrap().state,
            GroupState::Degraded
        );

        fail(&h, "sdb");
        assert_eq!(
            h.engine.get_group(&group.id).unwrap().state,
            GroupState::Failed
        );
        assert_matches!(
            h.engine.scrub_group(&group.id),
            Err(Error::TargetUnavailable { .. })
        );
    }

    #[tokio::test]
    async fn test_replace_member_rebuilds_to_online() {
        let h = harness(false);
        let group = h
            .engine
            .create_group(RaidLayout::Mirror, ids(&["sda", "sdb"]))
            .unwrap();
        fail(&h, "sda");

        h.backend.hold(TaskKind::GroupRebuild);
        let handle = h
            .engine
            .replace_member(&group.id, &DiskId::new("sda"), &DiskId::new("sdc"))
            .unwrap();
        assert_eq!(
            h.engine.get_group(&group.id).unwrap().state,
            GroupState::Rebuilding
        );
        assert_eq!(role(&h, "sdc"), DiskRole::Member(group.id.clone()));
        assert_eq!(role(&h, "sda"), DiskRole::Unassigned);

        h.backend.release(TaskKind::GroupRebuild);
        assert_eq!(handle.wait().await.unwrap().state, TaskState::Succeeded);

        let group = h.engine.get_group(&group.id).unwrap();
        assert_eq!(group.state, GroupState::Online);
        assert_eq!(group.members[0].disk, DiskId::new("sdc"));
    }

    #[tokio::test]
    async fn test_reappeared_member_can_be_readded() {
        let h = harness(false);
        let group = h
            .engine
            .create_group(RaidLayout::Mirror, ids(&["sda", "sdb"]))
            .unwrap();
        let sda = DiskId::new("sda");

        h.engine.handle_disk_missing(&sda).unwrap();
        assert_eq!(
            h.engine.get_group(&group.id).unwrap().state,
            GroupState::Degraded
        );

        // Still missing: cannot rejoin yet
        assert_matches!(
            h.engine.replace_member(&group.id, &sda, &sda),
            Err(Error::DiskUnavailable { .. })
        );

        h.inventory.register(sample("sda", 1000));
        assert_eq!(
            h.inventory.get_disk(&sda).unwrap().health,
            DiskHealth::Healthy
        );
        assert_eq!(role(&h, "sda"), DiskRole::Member(group.id.clone()));

        let handle = h.engine.replace_member(&group.id, &sda, &sda).unwrap();
        assert_eq!(role(&h, "sda"), DiskRole::Member(group.id.clone()));
        assert_eq!(handle.wait().await.unwrap().state, TaskState::Succeeded);

        let group = h.engine.get_group(&group.id).unwrap();
        assert_eq!(group.state, GroupState::Online);
        assert_eq!(group.members[0].disk, sda);
        assert_eq!(role(&h, "sda"), DiskRole::Member(group.id.clone()));

        // An active member is not a re-add candidate
        assert_matches!(
            h.engine.replace_member(&group.id, &sda, &sda),
            Err(Error::InvalidState { .. })
        );
    }

    #[tokio::test]
    async fn test_failed_rebuild_returns_to_degraded() {
        let h = harness(false);
        let group = h
            .engine
            .create_group(RaidLayout::Mirror, ids(&["sda", "sdb"]))
            .unwrap();
        fail(&h, "sda");

        h.backend.fail_next(TaskKind::GroupRebuild, Scripted::Permanent);
        let handle = h
            .engine
            .replace_member(&group.id, &DiskId::new("sda"), &DiskId::new("sdc"))
            .unwrap();
        assert_eq!(handle.wait().await.unwrap().state, TaskState::Failed);

        assert_eq!(
            h.engine.get_group(&group.id).unwrap().state,
            GroupState::Degraded
        );
        assert_eq!(role(&h, "sdc"), DiskRole::Unassigned);
    }

    #[tokio::test]
    async fn test_replace_member_with_small_disk_is_rejected() {
        let h = harness(false);
        let group = h
            .engine
            .create_group(RaidLayout::Mirror, ids(&["sda", "sdb"]))
            .unwrap();
        fail(&h, "sda");

        assert_matches!(
            h.engine
                .replace_member(&group.id, &DiskId::new("sda"), &DiskId::new("sde")),
            Err(Error::InsufficientCapacity {
                required: 1000,
                offered: 500
            })
        );
        assert_eq!(
            h.engine.get_group(&group.id).unwrap().state,
            GroupState::Degraded
        );
        assert_eq!(role(&h, "sde"), DiskRole::Unassigned);
    }

    #[tokio::test]
    async fn test_planned_replacement_of_active_member() {
        let h = harness(false);
        let group = h
            .engine
            .create_group(RaidLayout::Mirror, ids(&["sda", "sdb"]))
            .unwrap();

        let handle = h
            .engine
            .replace_member(&group.id, &DiskId::new("sdb"), &DiskId::new("sdc"))
            .unwrap();
        handle.wait().await.unwrap();
        let group = h.engine.get_group(&group.id).unwrap();
        assert_eq!(group.state, GroupState::Online);
        assert_eq!(group.member_disks(), ids(&["sda", "sdc"]));

        h.inventory.register(sample("sdf", 1000));
        let stripe = h
            .engine
            .create_group(RaidLayout::Stripe, ids(&["sdb", "sdd"]))
            .unwrap();
        assert_matches!(
            h.engine
                .replace_member(&stripe.id, &DiskId::new("sdb"), &DiskId::new("sdf")),
            Err(Error::InvalidState { .. })
        );
    }

    #[tokio::test]
    async fn test_spare_replaces_failed_member_automatically() {
        let h = harness(true);
        let group = h
            .engine
            .create_group(RaidLayout::Mirror, ids(&["sda", "sdb"]))
            .unwrap();
        h.engine.add_spare(&DiskId::new("sde")).unwrap();
        h.engine.add_spare(&DiskId::new("sdd")).unwrap();

        fail(&h, "sda");

        // The 500-byte spare is too small, the 1500-byte one is used
        let group = h.engine.get_group(&group.id).unwrap();
        assert_eq!(group.state, GroupState::Rebuilding);
        assert_eq!(group.members[0].disk, DiskId::new("sdd"));
        assert_eq!(role(&h, "sde"), DiskRole::Spare);

        let rebuild = h.engine.scheduler.active_tasks(&TaskTarget::Group(group.id.clone()));
        h.engine.scheduler.wait(&rebuild[0].id).await.unwrap();
        assert_eq!(
            h.engine.get_group(&group.id).unwrap().state,
            GroupState::Online
        );
    }

    #[tokio::test]
    async fn test_missing_spare_returns_to_unassigned() {
        let h = harness(false);
        h.engine.add_spare(&DiskId::new("sdc")).unwrap();
        h.engine.handle_disk_missing(&DiskId::new("sdc")).unwrap();

        let disk = h.inventory.get_disk(&DiskId::new("sdc")).unwrap();
        assert_eq!(disk.role, DiskRole::Unassigned);
        assert_eq!(disk.health, DiskHealth::Missing);
    }

    #[tokio::test]
    async fn test_delete_group_refused_while_attached() {
        let h = harness(false);
        let group = h
            .engine
            .create_group(RaidLayout::Mirror, ids(&["sda", "sdb"]))
            .unwrap();
        let pool = PoolId::new("pool-1");
        h.engine
            .attach_to_pool(std::slice::from_ref(&group.id), &pool)
            .unwrap();

        assert_matches!(
            h.engine.delete_group(&group.id),
            Err(Error::GroupInUse { .. })
        );

        h.engine
            .detach_from_pool(std::slice::from_ref(&group.id), &pool);
        h.engine.delete_group(&group.id).unwrap();
        assert_eq!(role(&h, "sda"), DiskRole::Unassigned);
        assert_matches!(
            h.engine.get_group(&group.id),
            Err(Error::NotFound { kind: "group", .. })
        );
    }

    #[tokio::test]
    async fn test_offline_round_trip() {
        let h = harness(false);
        let group = h
            .engine
            .create_group(RaidLayout::Mirror, ids(&["sda", "sdb"]))
            .unwrap();

        let offline = h.engine.deactivate_group(&group.id).unwrap();
        assert_eq!(offline.state, GroupState::Offline);
        assert_matches!(
            h.engine.check_attachable(std::slice::from_ref(&group.id)),
            Err(Error::GroupNotOnline { .. })
        );

        let online = h.engine.activate_group(&group.id).unwrap();
        assert_eq!(online.state, GroupState::Online);
    }

    #[tokio::test]
    async fn test_scrub_records_result() {
        let h = harness(false);
        let group = h
            .engine
            .create_group(RaidLayout::Mirror, ids(&["sda", "sdb"]))
            .unwrap();
        h.engine.scrub_group(&group.id).unwrap().wait().await.unwrap();

        let scrub = h.engine.get_group(&group.id).unwrap().last_scrub.unwrap();
        assert!(scrub.succeeded);
    }
}
