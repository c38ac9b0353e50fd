//! RAID Engine Module
//!
//! Redundancy layouts, the group state machine and the engine that owns
//! group membership.

pub mod engine;
pub mod group;
pub mod layout;

pub use engine::RaidEngine;
pub use group::{
    GroupEvent, GroupState, Member, MemberStatus, RedundancyGroup, ScrubRecord, Transition,
};
pub use layout::RaidLayout;
