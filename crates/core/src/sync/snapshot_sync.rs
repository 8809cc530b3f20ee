//! Snapshot-based catch-up synchronization.
//!
//! Snapshots are processed in ascending time-range order. The cursor only moves
//! to a snapshot's end timestamp once that snapshot is known complete, so an
//! interrupted run resumes at snapshot granularity.

use futures::StreamExt;
use log::{debug, info, warn};
use std::sync::Arc;

use super::cancellation::CancellationToken;
use super::dedup_tracker::DedupTracker;
use super::persistence::EntityPersister;
use crate::profiles::{
    ProfileEntity, ProfileRepositoryTrait, ProfileSanitizer, SanitizeFailureHandler,
    SnapshotFeed, SnapshotMetadata,
};

/// Result of one snapshot synchronization pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SnapshotSyncRun {
    pub cursor: i64,
    pub processed_snapshots: usize,
    pub skipped_snapshots: usize,
    pub persisted: usize,
    pub cancelled: bool,
}

enum SnapshotOutcome {
    Completed { persisted: usize },
    Cancelled,
    Failed,
}

pub struct SnapshotSynchronizer {
    feed: Arc<dyn SnapshotFeed>,
    sanitizer: Arc<dyn ProfileSanitizer>,
    failure_handler: Arc<dyn SanitizeFailureHandler>,
    repository: Arc<dyn ProfileRepositoryTrait>,
    dedup: Arc<DedupTracker>,
    persister: Arc<dyn EntityPersister<ProfileEntity>>,
}

impl SnapshotSynchronizer {
    pub fn new(
        feed: Arc<dyn SnapshotFeed>,
        sanitizer: Arc<dyn ProfileSanitizer>,
        failure_handler: Arc<dyn SanitizeFailureHandler>,
        repository: Arc<dyn ProfileRepositoryTrait>,
        dedup: Arc<DedupTracker>,
        persister: Arc<dyn EntityPersister<ProfileEntity>>,
    ) -> Self {
        Self {
            feed,
            sanitizer,
            failure_handler,
            repository,
            dedup,
            persister,
        }
    }

    pub async fn sync_profiles(&self, from_timestamp: i64, cancel: &CancellationToken) -> i64 {
        self.run(from_timestamp, cancel).await.cursor
    }

    pub async fn run(&self, from_timestamp: i64, cancel: &CancellationToken) -> SnapshotSyncRun {
        let mut result = SnapshotSyncRun {
            cursor: from_timestamp,
            ..Default::default()
        };

        let snapshots = match self.feed.list_snapshots().await {
            Ok(snapshots) => snapshots,
            Err(err) => {
                warn!("[SnapshotSync] Failed to list snapshots: {}", err);
                return result;
            }
        };
        let pending = relevant_snapshots(snapshots, from_timestamp);
        if pending.is_empty() {
            debug!(
                "[SnapshotSync] No snapshots relevant after cursor {}",
                from_timestamp
            );
            return result;
        }

        for snapshot in pending {
            if cancel.is_cancelled() {
                result.cancelled = true;
                break;
            }
            let end_timestamp = snapshot.time_range.end_timestamp;

            match self.repository.is_snapshot_processed(&snapshot.hash).await {
                Ok(true) => {
                    debug!(
                        "[SnapshotSync] Snapshot {} already processed, advancing to {}",
                        snapshot.hash, end_timestamp
                    );
                    result.skipped_snapshots += 1;
                    result.cursor = result.cursor.max(end_timestamp);
                    continue;
                }
                Ok(false) => {}
                Err(err) => {
                    warn!(
                        "[SnapshotSync] Could not check snapshot {}: {}",
                        snapshot.hash, err
                    );
                    break;
                }
            }

            match self.process_snapshot(&snapshot, cancel).await {
                SnapshotOutcome::Completed { persisted } => {
                    if let Err(err) = self.repository.mark_snapshot_processed(&snapshot.hash).await
                    {
                        // The region is still fully applied; it is rescanned next time.
                        warn!(
                            "[SnapshotSync] Failed to mark snapshot {} processed: {}",
                            snapshot.hash, err
                        );
                    }
                    info!(
                        "[SnapshotSync] Snapshot {} done: persisted={} entities={} cursor -> {}",
                        snapshot.hash, persisted, snapshot.number_of_entities, end_timestamp
                    );
                    result.processed_snapshots += 1;
                    result.persisted += persisted;
                    result.cursor = result.cursor.max(end_timestamp);
                }
                SnapshotOutcome::Cancelled => {
                    info!(
                        "[SnapshotSync] Cancelled inside snapshot {}, cursor stays at {}",
                        snapshot.hash, result.cursor
                    );
                    result.cancelled = true;
                    break;
                }
                SnapshotOutcome::Failed => break,
            }
        }

        result
    }

    async fn process_snapshot(
        &self,
        snapshot: &SnapshotMetadata,
        cancel: &CancellationToken,
    ) -> SnapshotOutcome {
        debug!(
            "[SnapshotSync] Streaming snapshot {} ({} entities, {}..{})",
            snapshot.hash,
            snapshot.number_of_entities,
            snapshot.time_range.init_timestamp,
            snapshot.time_range.end_timestamp
        );
        let mut stream = self.feed.stream_snapshot(&snapshot.hash);
        let mut persisted = 0usize;

        let outcome = loop {
            if cancel.is_cancelled() {
                break SnapshotOutcome::Cancelled;
            }
            let record = match stream.next().await {
                None => break SnapshotOutcome::Completed { persisted },
                Some(Ok(record)) => record,
                Some(Err(err)) => {
                    warn!(
                        "[SnapshotSync] Failed reading snapshot {}: {}",
                        snapshot.hash, err
                    );
                    break SnapshotOutcome::Failed;
                }
            };
            if !record.is_profile() || self.dedup.has_been_processed(&record.entity_id) {
                continue;
            }
            let entities = self
                .sanitizer
                .sanitize_profiles(vec![record], self.failure_handler.as_ref())
                .await;
            for entity in entities {
                self.persister.persist_entity(entity).await;
                persisted += 1;
            }
        };
        drop(stream);

        outcome
    }
}

/// Snapshots not entirely before `from_timestamp`, oldest range first.
fn relevant_snapshots(snapshots: Vec<SnapshotMetadata>, from_timestamp: i64) -> Vec<SnapshotMetadata> {
    let mut relevant: Vec<SnapshotMetadata> = snapshots
        .into_iter()
        .filter(|s| s.time_range.end_timestamp >= from_timestamp)
        .collect();
    relevant.sort_by_key(|s| (s.time_range.init_timestamp, s.time_range.end_timestamp));
    relevant
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::profiles::SnapshotTimeRange;

    fn snapshot(hash: &str, init: i64, end: i64) -> SnapshotMetadata {
        SnapshotMetadata {
            hash: hash.to_string(),
            time_range: SnapshotTimeRange {
                init_timestamp: init,
                end_timestamp: end,
            },
            number_of_entities: 0,
            replaced_snapshot_hashes: vec![],
        }
    }

    #[test]
    fn relevant_snapshots_drops_ranges_before_cursor_and_sorts() {
        let result = relevant_snapshots(
            vec![
                snapshot("late", 200, 300),
                snapshot("old", 0, 99),
                snapshot("mid", 100, 200),
            ],
            150,
        );
        let hashes: Vec<&str> = result.iter().map(|s| s.hash.as_str()).collect();
        assert_eq!(hashes, vec!["mid", "late"]);
    }

    #[test]
    fn relevant_snapshots_keeps_range_ending_at_cursor() {
        let result = relevant_snapshots(vec![snapshot("edge", 0, 150)], 150);
        assert_eq!(result.len(), 1);
    }
}
