//! Domain Ports - Core trait definitions for the storage manager
//!
//! These traits define the boundaries between the storage manager and the
//! systems it drives: the device layer it discovers disks from and the
//! block/filesystem backend that performs the actual I/O of tasks.
//! Adapters implement these traits to provide concrete functionality.

use crate::domain::types::{DiskId, GroupId, PoolId, VolumeId};
use crate::error::Result;
use crate::hardware::inventory::DiskSample;
use crate::scheduler::TaskContext;
use async_trait::async_trait;

// =============================================================================
// Disk Probe Port
// =============================================================================

/// Port for disk discovery and health sampling
#[async_trait]
pub trait DiskProbe: Send + Sync {
    /// Probe name for logging
    fn name(&self) -> &str;

    /// Enumerate every attached disk with its current health counters
    async fn scan(&self) -> Result<Vec<DiskSample>>;
}

// =============================================================================
// Storage Backend Port
// =============================================================================

/// Port for the block/filesystem backend executing long-running work
///
/// Implementations must call [`TaskContext::checkpoint`] at I/O-safe points
/// and should skip steps up to [`TaskContext::resume_from`] when resuming.
/// Errors classified as transient (`TransientIo`) are retried by the
/// scheduler; any other error fails the task.
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Backend name for logging
    fn name(&self) -> &str;

    /// Lay out pool metadata over its groups
    async fn initialize_pool(&self, pool: &PoolId, groups: &[GroupId], ctx: &TaskContext)
        -> Result<()>;

    /// Extend pool metadata over additional groups
    async fn expand_pool(&self, pool: &PoolId, groups: &[GroupId], ctx: &TaskContext) -> Result<()>;

    /// Resynchronize a replacement member
    async fn rebuild_member(
        &self,
        group: &GroupId,
        slot: usize,
        disk: &DiskId,
        ctx: &TaskContext,
    ) -> Result<()>;

    /// Verify the integrity of a group's data
    async fn scrub_group(&self, group: &GroupId, ctx: &TaskContext) -> Result<()>;

    /// Create and format a volume
    async fn format_volume(
        &self,
        volume: &VolumeId,
        pool: &PoolId,
        size_bytes: u64,
        ctx: &TaskContext,
    ) -> Result<()>;

    /// Grow a volume and its filesystem
    async fn resize_volume(
        &self,
        volume: &VolumeId,
        pool: &PoolId,
        from_bytes: u64,
        to_bytes: u64,
        ctx: &TaskContext,
    ) -> Result<()>;

    /// Destroy a volume's data
    async fn destroy_volume(&self, volume: &VolumeId, pool: &PoolId, ctx: &TaskContext)
        -> Result<()>;
}
