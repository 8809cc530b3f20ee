//! Profile synchronization: dedup, hot cache, persistence, feeds, and retries.

mod bloom;
mod cancellation;
mod dedup_tracker;
mod failed_fetch_retrier;
mod failure_recorders;
mod hot_cache;
mod instrumented;
mod persistence;
mod pointer_changes;
mod snapshot_sync;
mod sync_scheduler;
mod sync_service;

pub use bloom::*;
pub use cancellation::*;
pub use dedup_tracker::*;
pub use failed_fetch_retrier::*;
pub use failure_recorders::*;
pub use hot_cache::*;
pub use instrumented::*;
pub use persistence::*;
pub use pointer_changes::*;
pub use snapshot_sync::*;
pub use sync_scheduler::*;
pub use sync_service::*;

use std::sync::{Mutex, MutexGuard};

use crate::profiles::ProfileEntity;

/// Shape the persistence pipeline and hot cache need from an entity.
pub trait VersionedEntity: Clone + Send + Sync + 'static {
    fn entity_id(&self) -> &str;
    /// Normalized (lowercased) pointer the entity is stored under.
    fn pointer(&self) -> &str;
    fn timestamp(&self) -> i64;
}

impl VersionedEntity for ProfileEntity {
    fn entity_id(&self) -> &str {
        &self.id
    }

    fn pointer(&self) -> &str {
        &self.pointer
    }

    fn timestamp(&self) -> i64 {
        self.timestamp
    }
}

/// Locks `mutex`, recovering the guard if a previous holder panicked.
pub(crate) fn lock_unpoisoned<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}
