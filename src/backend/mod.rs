//! Storage Backends
//!
//! Implementations of the [`StorageBackend`](crate::domain::ports::StorageBackend)
//! port. The storage manager only orchestrates; the backend owns the
//! on-disk format.

pub mod simulated;

pub use simulated::{Scripted, SimulatedBackend, SimulatedBackendConfig};
