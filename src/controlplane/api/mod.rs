//! API Module
//!
//! REST surface over the storage manager facade.

pub mod rest;
pub mod server;

pub use rest::{ApiErrorResponse, AppState, RestRouter};
pub use server::{ApiServer, ApiServerConfig};
