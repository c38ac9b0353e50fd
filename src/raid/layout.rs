//! Redundancy Layouts
//!
//! Member-count rules, fault tolerance and usable-capacity arithmetic for
//! each supported layout. No bit layout is computed here; the block backend
//! owns the on-disk format.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};

/// Minimum members per layout
const MIN_MEMBERS_MIRROR: usize = 2;
const MIN_MEMBERS_PARITY_SINGLE: usize = 3;
const MIN_MEMBERS_PARITY_DUAL: usize = 4;
const MIN_MEMBERS_STRIPE: usize = 2;

/// Redundancy layout of a group
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RaidLayout {
    /// Every member holds a full copy
    Mirror,
    /// Rotating single parity (RAID5-like)
    ParitySingle,
    /// Rotating dual parity (RAID6-like)
    ParityDual,
    /// Striping without redundancy
    Stripe,
}

impl RaidLayout {
    /// Minimum number of members
    pub fn min_members(&self) -> usize {
        match self {
            RaidLayout::Mirror => MIN_MEMBERS_MIRROR,
            RaidLayout::ParitySingle => MIN_MEMBERS_PARITY_SINGLE,
            RaidLayout::ParityDual => MIN_MEMBERS_PARITY_DUAL,
            RaidLayout::Stripe => MIN_MEMBERS_STRIPE,
        }
    }

    /// Fault-tolerance threshold: the minimum number of surviving members
    /// for a group of `members` disks to still serve data
    pub fn survival_threshold(&self, members: usize) -> usize {
        match self {
            RaidLayout::Mirror => 1,
            RaidLayout::ParitySingle => members.saturating_sub(1),
            RaidLayout::ParityDual => members.saturating_sub(2),
            RaidLayout::Stripe => members,
        }
    }

    /// Number of member losses the layout survives
    pub fn tolerated_failures(&self, members: usize) -> usize {
        members - self.survival_threshold(members)
    }

    /// Usable bytes given the member count and the per-member capacity
    pub fn usable_capacity(&self, members: usize, member_capacity: u64) -> u64 {
        let data_members = match self {
            RaidLayout::Mirror => 1,
            RaidLayout::ParitySingle => members.saturating_sub(1),
            RaidLayout::ParityDual => members.saturating_sub(2),
            RaidLayout::Stripe => members,
        };
        member_capacity.saturating_mul(data_members as u64)
    }

    /// Validate a prospective member set
    ///
    /// `tolerance_percent` bounds how far mirror members may differ in size.
    /// Parity and stripe layouts accept mixed sizes and use the smallest.
    /// Returns the per-member capacity the group will use.
    pub fn validate_members(&self, capacities: &[u64], tolerance_percent: f64) -> Result<u64> {
        if capacities.len() < self.min_members() {
            return Err(Error::InvalidLayout {
                layout: self.to_string(),
                reason: format!(
                    "requires at least {} members, got {}",
                    self.min_members(),
                    capacities.len()
                ),
            });
        }

        let smallest = capacities.iter().copied().min().unwrap_or(0);
        let largest = capacities.iter().copied().max().unwrap_or(0);

        if smallest == 0 {
            return Err(Error::InvalidLayout {
                layout: self.to_string(),
                reason: "member with zero capacity".into(),
            });
        }

        if *self == RaidLayout::Mirror {
            let spread = (largest - smallest) as f64 / smallest as f64 * 100.0;
            if spread > tolerance_percent {
                return Err(Error::IncompatibleDiskSize { smallest, largest });
            }
        }

        Ok(smallest)
    }
}

impl std::fmt::Display for RaidLayout {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RaidLayout::Mirror => write!(f, "mirror"),
            RaidLayout::ParitySingle => write!(f, "parity_single"),
            RaidLayout::ParityDual => write!(f, "parity_dual"),
            RaidLayout::Stripe => write!(f, "stripe"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    const ALL: [RaidLayout; 4] = [
        RaidLayout::Mirror,
        RaidLayout::ParitySingle,
        RaidLayout::ParityDual,
        RaidLayout::Stripe,
    ];

    #[test]
    fn test_below_minimum_is_invalid_for_every_layout() {
        for layout in ALL {
            let caps = vec![1000; layout.min_members() - 1];
            assert_matches!(
                layout.validate_members(&caps, 1.0),
                Err(Error::InvalidLayout { .. }),
                "layout {}",
                layout
            );
        }
    }

    #[test]
    fn test_mirror_rejects_unequal_members() {
        assert_matches!(
            RaidLayout::Mirror.validate_members(&[1000, 1500], 1.0),
            Err(Error::IncompatibleDiskSize {
                smallest: 1000,
                largest: 1500
            })
        );
        assert_eq!(
            RaidLayout::Mirror.validate_members(&[1000, 1005], 1.0).unwrap(),
            1000
        );
    }

    #[test]
    fn test_parity_uses_smallest_member() {
        let member = RaidLayout::ParitySingle
            .validate_members(&[1000, 1200, 1100], 1.0)
            .unwrap();
        assert_eq!(member, 1000);
        assert_eq!(RaidLayout::ParitySingle.usable_capacity(3, member), 2000);
    }

    #[test]
    fn test_thresholds() {
        assert_eq!(RaidLayout::Mirror.survival_threshold(2), 1);
        assert_eq!(RaidLayout::Mirror.survival_threshold(3), 1);
        assert_eq!(RaidLayout::ParitySingle.survival_threshold(4), 3);
        assert_eq!(RaidLayout::ParityDual.survival_threshold(6), 4);
        assert_eq!(RaidLayout::Stripe.survival_threshold(3), 3);
        assert_eq!(RaidLayout::ParityDual.tolerated_failures(6), 2);
    }

    #[test]
    fn test_usable_capacity() {
        assert_eq!(RaidLayout::Mirror.usable_capacity(3, 500), 500);
        assert_eq!(RaidLayout::ParityDual.usable_capacity(6, 500), 2000);
        assert_eq!(RaidLayout::Stripe.usable_capacity(2, 500), 1000);
    }
}
