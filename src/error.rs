//! Error types for the Storage Manager
//!
//! Provides structured error types for every storage component: disk
//! inventory, RAID engine, pool and volume managers, the task scheduler
//! and the metadata store.

use thiserror::Error;

/// Unified error type for the storage manager
#[derive(Error, Debug)]
pub enum Error {
    // =========================================================================
    // Internal Errors
    // =========================================================================
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    // =========================================================================
    // Lookup Errors
    // =========================================================================
    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    // =========================================================================
    // RAID Engine Errors
    // =========================================================================
    #[error("Invalid layout {layout}: {reason}")]
    InvalidLayout { layout: String, reason: String },

    #[error("Incompatible disk sizes: smallest {smallest} bytes, largest {largest} bytes")]
    IncompatibleDiskSize { smallest: u64, largest: u64 },

    #[error("Insufficient capacity: member requires {required} bytes, disk offers {offered} bytes")]
    InsufficientCapacity { required: u64, offered: u64 },

    #[error("Disk {disk} unavailable: {reason}")]
    DiskUnavailable { disk: String, reason: String },

    // =========================================================================
    // Pool Errors
    // =========================================================================
    #[error("A pool requires at least one redundancy group")]
    EmptyPool,

    #[error("Pool {pool} still owns {volumes} volume(s)")]
    PoolNotEmpty { pool: String, volumes: usize },

    #[error("Group {group} is {state}, expected online or degraded")]
    GroupNotOnline { group: String, state: String },

    #[error("Group {group} already belongs to pool {pool}")]
    GroupInUse { group: String, pool: String },

    #[error("Insufficient free space: requested {requested} bytes, available {available} bytes")]
    InsufficientFreeSpace { requested: u64, available: u64 },

    // =========================================================================
    // Volume Errors
    // =========================================================================
    #[error("Volume {volume} cannot shrink from {current} to {requested} bytes")]
    ShrinkNotSupported {
        volume: String,
        current: u64,
        requested: u64,
    },

    #[error("Volume {volume} is not mounted")]
    NotMounted { volume: String },

    // =========================================================================
    // State & Concurrency Errors
    // =========================================================================
    #[error("Target unavailable: {target} - {reason}")]
    TargetUnavailable { target: String, reason: String },

    #[error("Invalid state for {entity}: {reason}")]
    InvalidState { entity: String, reason: String },

    #[error("Concurrent modification of {entity}, retry the request")]
    ConcurrentModification { entity: String },

    // =========================================================================
    // Task Execution Errors
    // =========================================================================
    #[error("Transient I/O error during {operation}: {reason}")]
    TransientIo { operation: String, reason: String },

    #[error("Backend operation failed: {operation} - {reason}")]
    Backend { operation: String, reason: String },

    #[error("Task attempt timed out after {secs}s")]
    AttemptTimeout { secs: u64 },

    #[error("Operation cancelled")]
    Cancelled,

    // =========================================================================
    // Persistence Errors
    // =========================================================================
    #[error("Corrupt metadata record {kind}/{key}: {reason}")]
    MetadataCorrupt {
        kind: String,
        key: String,
        reason: String,
    },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// What the caller (or the scheduler) should do with an error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorAction {
    /// Transient, retry the attempt with backoff
    RetryWithBackoff,
    /// Lock contention, surface to the caller for a later retry
    RetryByCaller,
    /// Permanent for this request
    Fail,
}

impl Error {
    /// Shorthand for a `NotFound` error
    pub fn not_found(kind: &'static str, id: impl std::fmt::Display) -> Self {
        Error::NotFound {
            kind,
            id: id.to_string(),
        }
    }

    /// Determine what action to take for this error
    pub fn action(&self) -> ErrorAction {
        match self {
            Error::TransientIo { .. } | Error::AttemptTimeout { .. } | Error::Io(_) => {
                ErrorAction::RetryWithBackoff
            }

            Error::ConcurrentModification { .. } => ErrorAction::RetryByCaller,

            _ => ErrorAction::Fail,
        }
    }

    /// Check if a task attempt failing with this error may be retried
    pub fn is_transient(&self) -> bool {
        matches!(self.action(), ErrorAction::RetryWithBackoff)
    }

    /// Check if this error is a validation failure detected before any mutation
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            Error::InvalidLayout { .. }
                | Error::IncompatibleDiskSize { .. }
                | Error::InsufficientCapacity { .. }
                | Error::InsufficientFreeSpace { .. }
                | Error::EmptyPool
                | Error::ShrinkNotSupported { .. }
                | Error::DiskUnavailable { .. }
        )
    }
}

/// Result type alias for the storage manager
pub type Result<T> = std::result::Result<T, Error>;
