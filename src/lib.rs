//! NAS Storage Manager
//!
//! The storage controller of a NAS appliance: it discovers physical disks,
//! groups them into redundancy groups, aggregates groups into storage pools,
//! carves filesystem volumes out of pools, and runs the long operations
//! (initialization, rebuild, scrub, resize) as background tasks.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────┐
//! │             StorageManager facade  (REST /v1, SSE events)           │
//! ├─────────────────────────────────────────────────────────────────────┤
//! │  ┌───────────────┐   ┌───────────────┐   ┌───────────────────────┐  │
//! │  │    Volume     │──▶│     Pool      │──▶│     RAID Engine       │  │
//! │  │    Manager    │   │    Manager    │   │  (redundancy groups)  │  │
//! │  └───────┬───────┘   └───────┬───────┘   └───────────┬───────────┘  │
//! │          │                   │                       │              │
//! │          └─────────┬─────────┴───────────┬───────────┘              │
//! │                    ▼                     ▼                          │
//! │          ┌───────────────────┐  ┌───────────────────┐               │
//! │          │  Task Scheduler   │  │  Disk Inventory   │◀── Health     │
//! │          │  (worker pool)    │  │                   │    Monitor    │
//! │          └─────────┬─────────┘  └───────────────────┘               │
//! ├────────────────────┼────────────────────────────────────────────────┤
//! │                    ▼                                                │
//! │   StorageBackend port        DiskProbe port        MetadataStore    │
//! └─────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Modules
//!
//! - [`controlplane`]: the storage manager facade and its REST API
//! - [`hardware`]: disk inventory, probes and health monitoring
//! - [`raid`]: redundancy group layouts and the RAID engine
//! - [`pool`]: storage pools and capacity accounting
//! - [`volume`]: filesystem volumes
//! - [`scheduler`]: background task execution
//! - [`backend`]: storage backend implementations
//! - [`store`]: metadata persistence
//! - [`domain`]: identifiers, events and ports
//! - [`config`]: configuration
//! - [`error`]: error types and handling

pub mod backend;
pub mod config;
pub mod controlplane;
pub mod domain;
pub mod error;
pub mod hardware;
pub mod pool;
pub mod raid;
pub mod scheduler;
pub mod store;
pub mod volume;

// Re-export commonly used types
pub use controlplane::{ApiServer, ApiServerConfig, RecoveryReport, RestRouter, StorageManager};

pub use config::{
    HealthConfig, PoolConfig, RaidConfig, SchedulerConfig, StorageConfig, StoreConfig,
    VolumeConfig,
};

pub use domain::{
    DiskId, DiskProbe, EventBus, GroupId, PoolId, StorageBackend, StorageEvent, TaskId, VolumeId,
};

pub use error::{Error, ErrorAction, Result};

pub use hardware::{
    Disk, DiskHealth, DiskInventory, DiskRole, HealthEvent, HealthMonitor, MediaType,
    SimulatedProbe, SysfsProbe, SysfsProbeConfig,
};

pub use pool::{PoolState, StoragePool};
pub use raid::{GroupState, RaidLayout, RedundancyGroup};
pub use scheduler::{Task, TaskFilter, TaskHandle, TaskKind, TaskState};
pub use backend::{SimulatedBackend, SimulatedBackendConfig};
pub use store::{FileStore, MemoryStore, MetadataStore};
pub use volume::{Volume, VolumeState};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");
