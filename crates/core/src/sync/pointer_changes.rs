//! Live incremental synchronization from the pointer-changes feed.

use futures::StreamExt;
use log::{debug, info, warn};
use std::sync::Arc;

use super::cancellation::CancellationToken;
use super::dedup_tracker::DedupTracker;
use super::persistence::EntityPersister;
use crate::profiles::{
    PointerChangesFeed, ProfileEntity, ProfileSanitizer, RawProfileRecord, SanitizeFailureHandler,
};

/// Why a pointer-changes run stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PointerChangesExit {
    Exhausted,
    RepeatedEntity,
    Cancelled,
    UpstreamError,
}

/// Result of one pointer-changes run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PointerChangesRun {
    /// Never lower than the `from_timestamp` the run started at.
    pub cursor: i64,
    pub persisted: usize,
    pub exit: PointerChangesExit,
}

pub struct PointerChangesSynchronizer {
    feed: Arc<dyn PointerChangesFeed>,
    sanitizer: Arc<dyn ProfileSanitizer>,
    failure_handler: Arc<dyn SanitizeFailureHandler>,
    dedup: Arc<DedupTracker>,
    persister: Arc<dyn EntityPersister<ProfileEntity>>,
}

impl PointerChangesSynchronizer {
    pub fn new(
        feed: Arc<dyn PointerChangesFeed>,
        sanitizer: Arc<dyn ProfileSanitizer>,
        failure_handler: Arc<dyn SanitizeFailureHandler>,
        dedup: Arc<DedupTracker>,
        persister: Arc<dyn EntityPersister<ProfileEntity>>,
    ) -> Self {
        Self {
            feed,
            sanitizer,
            failure_handler,
            dedup,
            persister,
        }
    }

    /// Consumes the feed from `from_timestamp` and returns the next cursor.
    pub async fn sync_profiles(&self, from_timestamp: i64, cancel: &CancellationToken) -> i64 {
        self.run(from_timestamp, cancel).await.cursor
    }

    pub async fn run(&self, from_timestamp: i64, cancel: &CancellationToken) -> PointerChangesRun {
        let mut stream = self.feed.stream_changes(from_timestamp);
        let mut highest_seen = from_timestamp;
        let mut persisted = 0usize;
        let mut previous_id: Option<String> = None;

        let exit = loop {
            if cancel.is_cancelled() {
                break PointerChangesExit::Cancelled;
            }
            let record = match stream.next().await {
                None => break PointerChangesExit::Exhausted,
                Some(Ok(record)) => record,
                Some(Err(err)) => {
                    warn!(
                        "[PointerChanges] Feed failed after cursor {}: {}",
                        highest_seen, err
                    );
                    break PointerChangesExit::UpstreamError;
                }
            };

            if previous_id.as_deref() == Some(record.entity_id.as_str()) {
                debug!(
                    "[PointerChanges] Feed repeated entity {}, stopping",
                    record.entity_id
                );
                break PointerChangesExit::RepeatedEntity;
            }
            previous_id = Some(record.entity_id.clone());

            if let Some(timestamp) = self.handle_record(record).await {
                persisted += 1;
                highest_seen = highest_seen.max(timestamp);
            }
        };
        drop(stream);

        if persisted > 0 || exit != PointerChangesExit::Exhausted {
            info!(
                "[PointerChanges] Run finished ({:?}): persisted={} cursor {} -> {}",
                exit, persisted, from_timestamp, highest_seen
            );
        }

        PointerChangesRun {
            cursor: highest_seen.max(from_timestamp),
            persisted,
            exit,
        }
    }

    /// Returns the record's cursor timestamp when it reached the persister.
    async fn handle_record(&self, record: RawProfileRecord) -> Option<i64> {
        if !record.is_profile() || self.dedup.has_been_processed(&record.entity_id) {
            return None;
        }
        let cursor_timestamp = record.cursor_timestamp();
        let entities = self
            .sanitizer
            .sanitize_profiles(vec![record], self.failure_handler.as_ref())
            .await;
        if entities.is_empty() {
            return None;
        }
        for entity in entities {
            self.persister.persist_entity(entity).await;
        }
        Some(cursor_timestamp)
    }
}
