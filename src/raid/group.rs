//! Redundancy Group State Machine
//!
//! A group is an ordered set of member slots under one layout. Slot order
//! is significant (parity rotation), so a replacement disk always takes
//! over the slot of the member it replaces.
//!
//! ```text
//!   ONLINE ──member lost──▶ DEGRADED ──replacement──▶ REBUILDING
//!     ▲                        ▲  │                      │  │
//!     │                        │  └─────────┐   aborted  │  │
//!     │                        └────────────┼────────────┘  │
//!     └─────────────────── rebuild ok ──────┼───────────────┘
//!                                           ▼
//!                    surviving < threshold: FAILED
//!   any state ◀──▶ OFFLINE (administrative, state recomputed on return)
//! ```

use crate::domain::types::{DiskId, GroupId, PoolId};
use crate::error::{Error, Result};
use crate::raid::layout::RaidLayout;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// =============================================================================
// States
// =============================================================================

/// Operational state of a redundancy group
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GroupState {
    Online,
    Degraded,
    Rebuilding,
    Failed,
    Offline,
}

impl GroupState {
    /// Ordering used for pessimistic aggregation (higher is worse)
    pub fn severity(&self) -> u8 {
        match self {
            GroupState::Online => 0,
            GroupState::Rebuilding => 1,
            GroupState::Degraded => 2,
            GroupState::Offline => 3,
            GroupState::Failed => 4,
        }
    }

    /// Whether the group currently serves data
    pub fn is_serving(&self) -> bool {
        matches!(
            self,
            GroupState::Online | GroupState::Degraded | GroupState::Rebuilding
        )
    }
}

impl std::fmt::Display for GroupState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            GroupState::Online => write!(f, "online"),
            GroupState::Degraded => write!(f, "degraded"),
            GroupState::Rebuilding => write!(f, "rebuilding"),
            GroupState::Failed => write!(f, "failed"),
            GroupState::Offline => write!(f, "offline"),
        }
    }
}

/// Status of one member slot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MemberStatus {
    Active,
    Lost,
    Resyncing,
}

/// One member slot of a group
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Member {
    pub disk: DiskId,
    pub status: MemberStatus,
    /// Lost disk this slot is being rebuilt from (while resyncing)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replacing: Option<DiskId>,
}

impl Member {
    fn active(disk: DiskId) -> Self {
        Self {
            disk,
            status: MemberStatus::Active,
            replacing: None,
        }
    }
}

/// Result of the last integrity scrub
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScrubRecord {
    pub finished_at: DateTime<Utc>,
    pub succeeded: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

// =============================================================================
// Events & Transitions
// =============================================================================

/// Inputs to the group state machine
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GroupEvent {
    /// A member disk failed or disappeared
    MemberLost { disk: DiskId },
    /// A replacement disk was assigned to a lost slot
    RebuildStarted { slot: usize, disk: DiskId },
    /// The rebuild of a slot completed
    RebuildSucceeded { slot: usize, disk: DiskId },
    /// The rebuild of a slot failed or was cancelled
    RebuildAborted { slot: usize, disk: DiskId },
    /// Administrative deactivation
    Deactivate,
    /// Administrative reactivation
    Reactivate,
}

/// Observable effect of applying an event
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transition {
    pub from: GroupState,
    pub to: GroupState,
    /// Disk that left the group and must be released by the caller
    pub ejected: Option<DiskId>,
}

impl Transition {
    pub fn changed(&self) -> bool {
        self.from != self.to
    }
}

// =============================================================================
// Redundancy Group
// =============================================================================

/// A redundancy group record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedundancyGroup {
    pub id: GroupId,
    pub layout: RaidLayout,
    pub members: Vec<Member>,
    pub state: GroupState,
    /// Per-member capacity (smallest member at creation)
    pub member_capacity: u64,
    /// Pool this group is attached to, maintained by the pool manager
    #[serde(default)]
    pub pool: Option<PoolId>,
    #[serde(default)]
    pub last_scrub: Option<ScrubRecord>,
    pub created_at: DateTime<Utc>,
}

impl RedundancyGroup {
    /// Create an ONLINE group from validated members
    pub fn new(id: GroupId, layout: RaidLayout, disks: Vec<DiskId>, member_capacity: u64) -> Self {
        Self {
            id,
            layout,
            members: disks.into_iter().map(Member::active).collect(),
            state: GroupState::Online,
            member_capacity,
            pool: None,
            last_scrub: None,
            created_at: Utc::now(),
        }
    }

    /// Usable bytes exposed to pools
    pub fn usable_capacity(&self) -> u64 {
        self.layout
            .usable_capacity(self.members.len(), self.member_capacity)
    }

    /// Number of members that hold valid data
    pub fn surviving(&self) -> usize {
        self.members
            .iter()
            .filter(|m| m.status == MemberStatus::Active)
            .count()
    }

    pub fn threshold(&self) -> usize {
        self.layout.survival_threshold(self.members.len())
    }

    pub fn is_resyncing(&self) -> bool {
        self.members
            .iter()
            .any(|m| m.status == MemberStatus::Resyncing)
    }

    /// Slot index of a disk
    pub fn slot_of(&self, disk: &DiskId) -> Option<usize> {
        self.members.iter().position(|m| &m.disk == disk)
    }

    /// First slot that lost its member
    pub fn first_lost_slot(&self) -> Option<usize> {
        self.members
            .iter()
            .position(|m| m.status == MemberStatus::Lost)
    }

    pub fn member_disks(&self) -> Vec<DiskId> {
        self.members.iter().map(|m| m.disk.clone()).collect()
    }

    /// State implied by the membership alone
    pub fn derived_state(&self) -> GroupState {
        let surviving = self.surviving();
        if surviving < self.threshold() {
            GroupState::Failed
        } else if surviving == self.members.len() {
            GroupState::Online
        } else if self.is_resyncing() {
            GroupState::Rebuilding
        } else {
            GroupState::Degraded
        }
    }

    /// Apply an event to the state machine
    ///
    /// Invalid events leave the group untouched and return `InvalidState`
    /// (or `TargetUnavailable` for repair attempts on an unserviceable group).
    pub fn apply(&mut self, event: GroupEvent) -> Result<Transition> {
        let from = self.state;
        let mut ejected = None;

        match (from, event) {
            (_, GroupEvent::MemberLost { disk }) => {
                let slot = self.slot_of(&disk).ok_or_else(|| self.not_a_member(&disk))?;
                let member = &mut self.members[slot];
                match member.status {
                    MemberStatus::Lost => {}
                    MemberStatus::Active => member.status = MemberStatus::Lost,
                    MemberStatus::Resyncing => {
                        // The replacement itself failed: it leaves the group
                        // and the slot goes back to its lost predecessor.
                        let previous = member.replacing.take().unwrap_or_else(|| disk.clone());
                        let readded = previous == disk;
                        member.disk = previous;
                        member.status = MemberStatus::Lost;
                        if !readded {
                            ejected = Some(disk);
                        }
                    }
                }
                self.state = match from {
                    GroupState::Offline | GroupState::Failed => from,
                    _ => self.derived_state(),
                };
            }

            (GroupState::Failed | GroupState::Offline, GroupEvent::RebuildStarted { .. }) => {
                return Err(Error::TargetUnavailable {
                    target: format!("group/{}", self.id),
                    reason: format!("group is {}", from),
                });
            }

            (GroupState::Online, GroupEvent::RebuildStarted { .. }) => {
                return Err(self.invalid("no lost member to rebuild"));
            }

            (
                GroupState::Degraded | GroupState::Rebuilding,
                GroupEvent::RebuildStarted { slot, disk },
            ) => {
                let member = self
                    .members
                    .get_mut(slot)
                    .filter(|m| m.status == MemberStatus::Lost)
                    .ok_or_else(|| Error::InvalidState {
                        entity: format!("group/{}", self.id),
                        reason: format!("slot {} is not awaiting a replacement", slot),
                    })?;
                let lost = std::mem::replace(&mut member.disk, disk.clone());
                member.replacing = Some(lost.clone());
                member.status = MemberStatus::Resyncing;
                // A lost disk re-added to its own slot stays in the group
                if lost != disk {
                    ejected = Some(lost);
                }
                self.state = self.derived_state();
            }

            (GroupState::Rebuilding, GroupEvent::RebuildSucceeded { slot, disk }) => {
                let member = self.resyncing_slot(slot, &disk)?;
                member.status = MemberStatus::Active;
                member.replacing = None;
                self.state = self.derived_state();
            }

            (
                GroupState::Rebuilding | GroupState::Failed,
                GroupEvent::RebuildAborted { slot, disk }
                | GroupEvent::RebuildSucceeded { slot, disk },
            ) => {
                // A rebuild that finishes on a failed group cannot restore it
                let member = self.resyncing_slot(slot, &disk)?;
                let previous = member.replacing.take().unwrap_or_else(|| disk.clone());
                let readded = previous == disk;
                member.disk = previous;
                member.status = MemberStatus::Lost;
                if !readded {
                    ejected = Some(disk);
                }
                if from != GroupState::Failed {
                    self.state = self.derived_state();
                }
            }

            (_, GroupEvent::RebuildSucceeded { .. } | GroupEvent::RebuildAborted { .. }) => {
                return Err(self.invalid("no rebuild in progress"));
            }

            (GroupState::Rebuilding, GroupEvent::Deactivate) => {
                return Err(self.invalid("cancel the running rebuild before deactivating"));
            }

            (GroupState::Offline, GroupEvent::Deactivate) => {}

            (_, GroupEvent::Deactivate) => self.state = GroupState::Offline,

            (GroupState::Offline, GroupEvent::Reactivate) => self.state = self.derived_state(),

            (_, GroupEvent::Reactivate) => {}
        }

        Ok(Transition {
            from,
            to: self.state,
            ejected,
        })
    }

    fn resyncing_slot(&mut self, slot: usize, disk: &DiskId) -> Result<&mut Member> {
        let id = self.id.clone();
        self.members
            .get_mut(slot)
            .filter(|m| m.status == MemberStatus::Resyncing && &m.disk == disk)
            .ok_or_else(|| Error::InvalidState {
                entity: format!("group/{}", id),
                reason: format!("slot {} is not resyncing disk {}", slot, disk),
            })
    }

    fn invalid(&self, reason: &str) -> Error {
        Error::InvalidState {
            entity: format!("group/{}", self.id),
            reason: reason.to_string(),
        }
    }

    fn not_a_member(&self, disk: &DiskId) -> Error {
        Error::NotFound {
            kind: "member",
            id: format!("{}/{}", self.id, disk),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    fn mirror() -> RedundancyGroup {
        RedundancyGroup::new(
            GroupId::new("g1"),
            RaidLayout::Mirror,
            vec![DiskId::new("sda"), DiskId::new("sdb")],
            1000,
        )
    }

    fn lose(group: &mut RedundancyGroup, disk: &str) -> Transition {
        group
            .apply(GroupEvent::MemberLost {
                disk: DiskId::new(disk),
            })
            .unwrap()
    }

    #[test]
    fn test_mirror_member_loss_degrades_then_fails() {
        let mut group = mirror();
        let t = lose(&mut group, "sda");
        assert_eq!((t.from, t.to), (GroupState::Online, GroupState::Degraded));

        let t = lose(&mut group, "sdb");
        assert_eq!(t.to, GroupState::Failed);
    }

    #[test]
    fn test_parity_single_threshold() {
        let mut group = RedundancyGroup::new(
            GroupId::new("g2"),
            RaidLayout::ParitySingle,
            vec!["a".into(), "b".into(), "c".into()],
            1000,
        );
        assert_eq!(lose(&mut group, "a").to, GroupState::Degraded);
        assert_eq!(lose(&mut group, "b").to, GroupState::Failed);
    }

    #[test]
    fn test_stripe_fails_on_first_loss() {
        let mut group = RedundancyGroup::new(
            GroupId::new("g3"),
            RaidLayout::Stripe,
            vec!["a".into(), "b".into()],
            1000,
        );
        assert_eq!(lose(&mut group, "a").to, GroupState::Failed);
    }

    #[test]
    fn test_rebuild_success_returns_online() {
        let mut group = mirror();
        lose(&mut group, "sda");

        let t = group
            .apply(GroupEvent::RebuildStarted {
                slot: 0,
                disk: "sdc".into(),
            })
            .unwrap();
        assert_eq!(t.to, GroupState::Rebuilding);
        assert_eq!(t.ejected, Some(DiskId::new("sda")));
        assert_eq!(group.members[0].disk, DiskId::new("sdc"));

        let t = group
            .apply(GroupEvent::RebuildSucceeded {
                slot: 0,
                disk: "sdc".into(),
            })
            .unwrap();
        assert_eq!(t.to, GroupState::Online);
        assert_eq!(group.surviving(), 2);
    }

    #[test]
    fn test_rebuild_abort_returns_degraded_and_ejects_replacement() {
        let mut group = mirror();
        lose(&mut group, "sda");
        group
            .apply(GroupEvent::RebuildStarted {
                slot: 0,
                disk: "sdc".into(),
            })
            .unwrap();

        let t = group
            .apply(GroupEvent::RebuildAborted {
                slot: 0,
                disk: "sdc".into(),
            })
            .unwrap();
        assert_eq!(t.to, GroupState::Degraded);
        assert_eq!(t.ejected, Some(DiskId::new("sdc")));
        assert_eq!(group.members[0].disk, DiskId::new("sda"));
        assert_eq!(group.members[0].status, MemberStatus::Lost);
    }

    #[test]
    fn test_readding_lost_disk_keeps_it_in_slot() {
        let mut group = mirror();
        lose(&mut group, "sda");

        let t = group
            .apply(GroupEvent::RebuildStarted {
                slot: 0,
                disk: "sda".into(),
            })
            .unwrap();
        assert_eq!(t.to, GroupState::Rebuilding);
        assert_eq!(t.ejected, None);

        let t = group
            .apply(GroupEvent::RebuildAborted {
                slot: 0,
                disk: "sda".into(),
            })
            .unwrap();
        assert_eq!(t.to, GroupState::Degraded);
        assert_eq!(t.ejected, None);
        assert_eq!(group.members[0].disk, DiskId::new("sda"));
        assert_eq!(group.members[0].status, MemberStatus::Lost);
    }

    #[test]
    fn test_replacement_failure_during_rebuild() {
        let mut group = mirror();
        lose(&mut group, "sda");
        group
            .apply(GroupEvent::RebuildStarted {
                slot: 0,
                disk: "sdc".into(),
            })
            .unwrap();

        let t = lose(&mut group, "sdc");
        assert_eq!(t.to, GroupState::Degraded);
        assert_eq!(t.ejected, Some(DiskId::new("sdc")));

        // The late completion of the aborted rebuild is rejected as stale
        assert_matches!(
            group.apply(GroupEvent::RebuildSucceeded {
                slot: 0,
                disk: "sdc".into()
            }),
            Err(Error::InvalidState { .. })
        );
    }

    #[test]
    fn test_rebuild_refused_on_failed_or_online_group() {
        let mut group = mirror();
        assert_matches!(
            group.apply(GroupEvent::RebuildStarted {
                slot: 0,
                disk: "sdc".into()
            }),
            Err(Error::InvalidState { .. })
        );

        lose(&mut group, "sda");
        lose(&mut group, "sdb");
        assert_matches!(
            group.apply(GroupEvent::RebuildStarted {
                slot: 0,
                disk: "sdc".into()
            }),
            Err(Error::TargetUnavailable { .. })
        );
    }

    #[test]
    fn test_offline_round_trip_recomputes_state() {
        let mut group = mirror();
        group.apply(GroupEvent::Deactivate).unwrap();
        assert_eq!(group.state, GroupState::Offline);

        // Losses while offline are recorded but do not leave OFFLINE
        assert_eq!(lose(&mut group, "sda").to, GroupState::Offline);

        let t = group.apply(GroupEvent::Reactivate).unwrap();
        assert_eq!(t.to, GroupState::Degraded);
    }

    #[test]
    fn test_deactivate_refused_while_rebuilding() {
        let mut group = mirror();
        lose(&mut group, "sda");
        group
            .apply(GroupEvent::RebuildStarted {
                slot: 0,
                disk: "sdc".into(),
            })
            .unwrap();
        assert_matches!(
            group.apply(GroupEvent::Deactivate),
            Err(Error::InvalidState { .. })
        );
    }
}
