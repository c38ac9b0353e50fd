//! Volume records

use crate::domain::types::{PoolId, VolumeId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Filesystem state of a volume
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VolumeState {
    Formatting,
    Mounted,
    Unmounted,
    Error,
}

impl std::fmt::Display for VolumeState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            VolumeState::Formatting => write!(f, "formatting"),
            VolumeState::Mounted => write!(f, "mounted"),
            VolumeState::Unmounted => write!(f, "unmounted"),
            VolumeState::Error => write!(f, "error"),
        }
    }
}

/// A filesystem volume carved from a pool
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Volume {
    pub id: VolumeId,
    pub name: String,
    pub pool: PoolId,
    /// Bytes reserved in the pool
    pub size_bytes: u64,
    /// Bytes reported in use by the filesystem
    #[serde(default)]
    pub used_bytes: u64,
    #[serde(default)]
    pub quota_bytes: Option<u64>,
    pub state: VolumeState,
    pub mount_path: Option<PathBuf>,
    /// Target size of a resize in progress; the delta is already reserved
    #[serde(default)]
    pub resizing_to: Option<u64>,
    /// A delete task owns the volume
    #[serde(default)]
    pub deleting: bool,
    #[serde(default)]
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Volume {
    pub fn new(id: VolumeId, name: impl Into<String>, pool: PoolId, size_bytes: u64) -> Self {
        Self {
            id,
            name: name.into(),
            pool,
            size_bytes,
            used_bytes: 0,
            quota_bytes: None,
            state: VolumeState::Formatting,
            mount_path: None,
            resizing_to: None,
            deleting: false,
            error: None,
            created_at: Utc::now(),
        }
    }

    /// Whether a task currently owns the volume
    pub fn is_busy(&self) -> bool {
        self.state == VolumeState::Formatting || self.resizing_to.is_some() || self.deleting
    }

    pub fn mount_path_string(&self) -> Option<String> {
        self.mount_path
            .as_ref()
            .map(|p| p.to_string_lossy().into_owned())
    }
}
