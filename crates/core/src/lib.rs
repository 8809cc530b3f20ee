//! Core of the Catalyst profile sync service: domain models, storage and feed
//! contracts, and the dedup/persistence/synchronization engine.

pub mod config;
pub mod errors;
pub mod profiles;
pub mod sync;

pub use errors::{DatabaseError, Error, Result};
