//! Identifiers and shared value types
//!
//! Every registry in the storage manager is keyed by one of these stable
//! string identifiers rather than by live references, so deletion,
//! member replacement and restart-time reload never need graph surgery.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

// =============================================================================
// Identifier Generation
// =============================================================================

static ID_SEQUENCE: AtomicU64 = AtomicU64::new(0);

/// Generate a unique suffix for entity identifiers
///
/// Combines the wall clock in microseconds with a process-local sequence so
/// that ids stay unique across restarts and within a single microsecond.
fn unique_suffix() -> String {
    let micros = Utc::now().timestamp_micros() as u64;
    let seq = ID_SEQUENCE.fetch_add(1, Ordering::Relaxed);
    format!("{:x}{:04x}", micros, seq & 0xffff)
}

macro_rules! entity_id {
    ($(#[$meta:meta])* $name:ident, $prefix:literal) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            /// Generate a fresh identifier
            pub fn generate() -> Self {
                Self(format!("{}-{}", $prefix, unique_suffix()))
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_string())
            }
        }

        impl From<&String> for $name {
            fn from(s: &String) -> Self {
                Self(s.clone())
            }
        }
    };
}

entity_id!(
    /// Identifier of a physical disk (usually its serial or device name)
    DiskId,
    "disk"
);
entity_id!(
    /// Identifier of a redundancy group
    GroupId,
    "grp"
);
entity_id!(
    /// Identifier of a storage pool
    PoolId,
    "pool"
);
entity_id!(
    /// Identifier of a volume
    VolumeId,
    "vol"
);
entity_id!(
    /// Identifier of a background task
    TaskId,
    "task"
);

// =============================================================================
// Capacity Helpers
// =============================================================================

pub const KIB: u64 = 1024;
pub const MIB: u64 = 1024 * KIB;
pub const GIB: u64 = 1024 * MIB;
pub const TIB: u64 = 1024 * GIB;

/// Render a byte count for log messages
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: [(u64, &str); 4] = [(TIB, "TiB"), (GIB, "GiB"), (MIB, "MiB"), (KIB, "KiB")];
    for (unit, suffix) in UNITS {
        if bytes >= unit {
            return format!("{:.1}{}", bytes as f64 / unit as f64, suffix);
        }
    }
    format!("{}B", bytes)
}
