//! Volume Module
//!
//! Filesystem volumes allocated from storage pools.

pub mod manager;
pub mod model;

pub use manager::VolumeManager;
pub use model::{Volume, VolumeState};
