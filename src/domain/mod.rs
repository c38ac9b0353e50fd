//! Domain layer - Core types, events and port definitions
//!
//! This module defines the identifiers, the event vocabulary, the entity
//! arena and the traits (ports) that adapters implement, following
//! hexagonal architecture principles.

pub mod arena;
pub mod events;
pub mod ports;
pub mod types;

pub use arena::EntityArena;
pub use events::{EventBus, StorageEvent};
pub use ports::*;
pub use types::*;
