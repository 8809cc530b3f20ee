//! Orchestrates bootstrap, live sync, and failed-fetch retries.
//!
//! Order of operations:
//! 1. Snapshot passes until no new snapshot is processed (bootstrap).
//! 2. Drain queued bootstrap writes, then switch the pipeline to incremental.
//! 3. Pointer-changes polling, failed-fetch sweeps, and periodic snapshot
//!    passes run side by side on the same task until cancelled.

use log::{debug, info, warn};
use std::sync::Arc;
use std::time::Duration;

use super::cancellation::CancellationToken;
use super::failed_fetch_retrier::FailedFetchRetrier;
use super::persistence::PersistencePipeline;
use super::pointer_changes::PointerChangesSynchronizer;
use super::snapshot_sync::SnapshotSynchronizer;
use super::sync_scheduler::{
    MAX_BOOTSTRAP_SNAPSHOT_PASSES, POINTER_CHANGES_CURSOR, SNAPSHOTS_CURSOR,
};
use crate::config::SyncConfig;
use crate::profiles::{ProfileEntity, ProfileRepositoryTrait};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncIntervals {
    pub pointer_changes: Duration,
    pub snapshots: Duration,
    pub failed_fetch_retry: Duration,
}

impl From<&SyncConfig> for SyncIntervals {
    fn from(config: &SyncConfig) -> Self {
        Self {
            pointer_changes: config.pointer_changes_interval(),
            snapshots: config.snapshot_interval(),
            failed_fetch_retry: config.failed_fetch_retry_interval(),
        }
    }
}

pub struct ProfileSyncService {
    repository: Arc<dyn ProfileRepositoryTrait>,
    pipeline: Arc<PersistencePipeline<ProfileEntity>>,
    snapshots: SnapshotSynchronizer,
    pointer_changes: PointerChangesSynchronizer,
    retrier: FailedFetchRetrier,
    intervals: SyncIntervals,
}

impl ProfileSyncService {
    pub fn new(
        repository: Arc<dyn ProfileRepositoryTrait>,
        pipeline: Arc<PersistencePipeline<ProfileEntity>>,
        snapshots: SnapshotSynchronizer,
        pointer_changes: PointerChangesSynchronizer,
        retrier: FailedFetchRetrier,
        intervals: SyncIntervals,
    ) -> Self {
        Self {
            repository,
            pipeline,
            snapshots,
            pointer_changes,
            retrier,
            intervals,
        }
    }

    pub fn pipeline(&self) -> &Arc<PersistencePipeline<ProfileEntity>> {
        &self.pipeline
    }

    /// Runs until `cancel` fires. Queued writes are drained before returning.
    pub async fn run(&self, cancel: &CancellationToken) {
        let snapshot_cursor = self.bootstrap(cancel).await;
        if cancel.is_cancelled() {
            self.pipeline.wait_for_drain().await;
            info!("[ProfileSync] Cancelled during bootstrap");
            return;
        }

        let pointer_cursor = match self.load_cursor(POINTER_CHANGES_CURSOR).await {
            Some(cursor) => cursor,
            None => snapshot_cursor.max(self.latest_profile_timestamp().await),
        };
        info!(
            "[ProfileSync] Starting incremental sync (pointer cursor={}, snapshot cursor={})",
            pointer_cursor, snapshot_cursor
        );

        tokio::join!(
            self.pointer_changes_loop(pointer_cursor, cancel),
            self.snapshot_loop(snapshot_cursor, cancel),
            self.retry_loop(cancel),
        );

        self.pipeline.wait_for_drain().await;
        info!(
            "[ProfileSync] Stopped. Stats: {:?}",
            self.pipeline.stats()
        );
    }

    /// Snapshot passes until caught up, then drains and flips the pipeline to
    /// incremental mode. Returns the snapshot cursor.
    pub async fn bootstrap(&self, cancel: &CancellationToken) -> i64 {
        let mut cursor = match self.load_cursor(SNAPSHOTS_CURSOR).await {
            Some(cursor) => cursor,
            None => self.latest_profile_timestamp().await,
        };
        info!("[ProfileSync] Bootstrapping from snapshot cursor {}", cursor);

        for pass in 1..=MAX_BOOTSTRAP_SNAPSHOT_PASSES {
            let run = self.snapshots.run(cursor, cancel).await;
            cursor = cursor.max(run.cursor);
            self.save_cursor(SNAPSHOTS_CURSOR, cursor).await;
            debug!(
                "[ProfileSync] Bootstrap pass {}: processed={} skipped={} persisted={} cursor={}",
                pass, run.processed_snapshots, run.skipped_snapshots, run.persisted, cursor
            );
            if run.cancelled || cancel.is_cancelled() {
                return cursor;
            }
            if run.processed_snapshots == 0 {
                break;
            }
        }

        self.pipeline.wait_for_drain().await;
        self.pipeline.set_bootstrap_complete();
        info!(
            "[ProfileSync] Bootstrap complete at cursor {}. Stats: {:?}",
            cursor,
            self.pipeline.stats()
        );
        cursor
    }

    async fn pointer_changes_loop(&self, mut cursor: i64, cancel: &CancellationToken) {
        while !cancel.is_cancelled() {
            let next = self.pointer_changes.sync_profiles(cursor, cancel).await;
            if next > cursor {
                cursor = next;
                self.save_cursor(POINTER_CHANGES_CURSOR, cursor).await;
            }
            if !cancel.sleep(self.intervals.pointer_changes).await {
                break;
            }
        }
    }

    async fn snapshot_loop(&self, mut cursor: i64, cancel: &CancellationToken) {
        while cancel.sleep(self.intervals.snapshots).await {
            let next = self.snapshots.sync_profiles(cursor, cancel).await;
            if next > cursor {
                cursor = next;
                self.save_cursor(SNAPSHOTS_CURSOR, cursor).await;
            }
        }
    }

    async fn retry_loop(&self, cancel: &CancellationToken) {
        while cancel.sleep(self.intervals.failed_fetch_retry).await {
            self.retrier.retry_failed_profiles(cancel).await;
        }
    }

    async fn load_cursor(&self, name: &str) -> Option<i64> {
        match self.repository.get_sync_cursor(name).await {
            Ok(cursor) => cursor,
            Err(err) => {
                warn!("[ProfileSync] Failed to read cursor '{}': {}", name, err);
                None
            }
        }
    }

    async fn save_cursor(&self, name: &str, value: i64) {
        if let Err(err) = self.repository.set_sync_cursor(name, value).await {
            warn!(
                "[ProfileSync] Failed to persist cursor '{}'={}: {}",
                name, value, err
            );
        }
    }

    async fn latest_profile_timestamp(&self) -> i64 {
        match self.repository.get_latest_profile_timestamp().await {
            Ok(latest) => latest.unwrap_or(0),
            Err(err) => {
                warn!("[ProfileSync] Failed to read latest profile timestamp: {}", err);
                0
            }
        }
    }
}
