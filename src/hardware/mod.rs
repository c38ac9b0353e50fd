//! Hardware Module
//!
//! Disk discovery, the disk inventory and health monitoring.

pub mod health;
pub mod inventory;
pub mod probe;

pub use health::{HealthEvent, HealthMonitor, PollReport, Severity};
pub use inventory::{
    Disk, DiskHealth, DiskInventory, DiskRole, DiskSample, HealthSample, MediaType, ScanReport,
};
pub use probe::{SimulatedProbe, SysfsProbe, SysfsProbeConfig};
