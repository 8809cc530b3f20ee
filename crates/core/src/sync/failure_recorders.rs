//! Sanitizer failure callbacks that record failed fetches for later retry.

use async_trait::async_trait;
use chrono::Utc;
use log::{debug, warn};
use std::sync::Arc;

use crate::profiles::{
    FailedProfileFetch, ProfileRepositoryTrait, RawProfileRecord, SanitizeFailureHandler,
};

/// Records a first-time sanitize failure (`retry_count = 0`). Entities that
/// already have a record are left to the retrier.
pub struct FailedFetchRecorder {
    repository: Arc<dyn ProfileRepositoryTrait>,
}

impl FailedFetchRecorder {
    pub fn new(repository: Arc<dyn ProfileRepositoryTrait>) -> Self {
        Self { repository }
    }
}

#[async_trait]
impl SanitizeFailureHandler for FailedFetchRecorder {
    async fn on_failure(&self, record: &RawProfileRecord, error: &str) {
        let Some(pointer) = record.pointer() else {
            warn!(
                "[FailedFetch] Entity {} has no pointer, not recording failure: {}",
                record.entity_id, error
            );
            return;
        };
        match self
            .repository
            .get_failed_profile_fetch(&record.entity_id)
            .await
        {
            Ok(Some(existing)) => {
                // Retry state belongs to the retrier once a record exists.
                debug!(
                    "[FailedFetch] Entity {} already recorded ({} retries), keeping it: {}",
                    record.entity_id, existing.retry_count, error
                );
                return;
            }
            Ok(None) => {}
            Err(err) => {
                warn!(
                    "[FailedFetch] Failed to look up entity {}, not recording failure: {}",
                    record.entity_id, err
                );
                return;
            }
        }

        let now = Utc::now().timestamp_millis();
        let failed = FailedProfileFetch {
            entity_id: record.entity_id.clone(),
            pointer,
            timestamp: record.entity_timestamp,
            auth_chain: record.auth_chain.clone(),
            first_failed_at: now,
            retry_count: 0,
            last_retry_at: None,
            error_message: Some(error.to_string()),
        };
        debug!(
            "[FailedFetch] Recording failed fetch for entity {}: {}",
            record.entity_id, error
        );
        if let Err(err) = self.repository.insert_failed_profile_fetch(failed).await {
            warn!(
                "[FailedFetch] Failed to record failed fetch for entity {}: {}",
                record.entity_id, err
            );
        }
    }
}

/// Re-records a failure found while retrying `previous`: the retry count goes
/// up by one and `first_failed_at` is carried over unchanged.
pub struct RetryFailureRecorder<'a> {
    repository: &'a dyn ProfileRepositoryTrait,
    previous: &'a FailedProfileFetch,
}

impl<'a> RetryFailureRecorder<'a> {
    pub fn new(repository: &'a dyn ProfileRepositoryTrait, previous: &'a FailedProfileFetch) -> Self {
        Self {
            repository,
            previous,
        }
    }
}

#[async_trait]
impl SanitizeFailureHandler for RetryFailureRecorder<'_> {
    async fn on_failure(&self, record: &RawProfileRecord, error: &str) {
        let failed = FailedProfileFetch {
            retry_count: self.previous.retry_count.saturating_add(1),
            last_retry_at: Some(Utc::now().timestamp_millis()),
            error_message: Some(error.to_string()),
            ..self.previous.clone()
        };
        if let Err(err) = self.repository.insert_failed_profile_fetch(failed).await {
            warn!(
                "[FailedFetch] Failed to update retry state for entity {}: {}",
                record.entity_id, err
            );
        }
    }
}
