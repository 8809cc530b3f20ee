//! Catalyst content server client: pointer-changes and snapshot feeds, plus a
//! profile sanitizer backed by the active-entities endpoint.

pub mod client;
pub mod error;
pub mod sanitizer;
pub mod types;

pub use client::{CatalystClient, DEFAULT_TIMEOUT_SECS};
pub use error::{CatalystError, Result, RetryClass};
pub use sanitizer::CatalystProfileSanitizer;
