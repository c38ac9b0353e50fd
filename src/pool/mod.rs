//! Storage Pool Module
//!
//! Pools aggregate redundancy groups into allocatable capacity.

pub mod manager;
pub mod model;

pub use manager::PoolManager;
pub use model::{PoolState, StoragePool};
