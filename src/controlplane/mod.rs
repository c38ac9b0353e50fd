//! Control Plane Module
//!
//! The storage manager facade and the API that exposes it.

pub mod api;
pub mod manager;

pub use api::{ApiServer, ApiServerConfig, RestRouter};
pub use manager::{RecoveryReport, StorageManager};
