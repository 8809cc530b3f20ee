//! Periodic resweep of profiles whose content could not be sanitized.
//!
//! There is no retry cutoff: a record stays until a retry succeeds.

use log::{debug, info, warn};
use std::sync::Arc;

use super::cancellation::CancellationToken;
use super::failure_recorders::RetryFailureRecorder;
use super::persistence::EntityPersister;
use crate::profiles::{ProfileEntity, ProfileRepositoryTrait, ProfileSanitizer};

/// Records loaded per sweep.
pub const DEFAULT_FAILED_FETCH_BATCH_SIZE: usize = 50;

/// Result of one retry sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RetrySweep {
    pub attempted: usize,
    pub recovered: usize,
    pub still_failing: usize,
    pub cancelled: bool,
}

pub struct FailedFetchRetrier {
    repository: Arc<dyn ProfileRepositoryTrait>,
    sanitizer: Arc<dyn ProfileSanitizer>,
    persister: Arc<dyn EntityPersister<ProfileEntity>>,
    batch_size: usize,
}

impl FailedFetchRetrier {
    pub fn new(
        repository: Arc<dyn ProfileRepositoryTrait>,
        sanitizer: Arc<dyn ProfileSanitizer>,
        persister: Arc<dyn EntityPersister<ProfileEntity>>,
        batch_size: usize,
    ) -> Self {
        Self {
            repository,
            sanitizer,
            persister,
            batch_size: batch_size.max(1),
        }
    }

    pub async fn retry_failed_profiles(&self, cancel: &CancellationToken) -> RetrySweep {
        let mut sweep = RetrySweep::default();
        if cancel.is_cancelled() {
            sweep.cancelled = true;
            return sweep;
        }

        let failed = match self
            .repository
            .get_failed_profile_fetches(self.batch_size)
            .await
        {
            Ok(records) => records,
            Err(err) => {
                warn!("[FailedFetchRetry] Failed to load failed fetches: {}", err);
                return sweep;
            }
        };
        if failed.is_empty() {
            return sweep;
        }
        debug!("[FailedFetchRetry] Retrying {} failed fetches", failed.len());

        for previous in &failed {
            if cancel.is_cancelled() {
                sweep.cancelled = true;
                break;
            }
            sweep.attempted += 1;

            let recorder = RetryFailureRecorder::new(self.repository.as_ref(), previous);
            let entities = self
                .sanitizer
                .sanitize_profiles(vec![previous.to_raw_record()], &recorder)
                .await;
            if entities.is_empty() {
                sweep.still_failing += 1;
                continue;
            }

            for entity in entities {
                self.persister.persist_entity(entity).await;
            }
            if let Err(err) = self
                .repository
                .delete_failed_profile_fetch(&previous.entity_id)
                .await
            {
                warn!(
                    "[FailedFetchRetry] Recovered entity {} but could not delete its record: {}",
                    previous.entity_id, err
                );
            }
            sweep.recovered += 1;
        }

        info!(
            "[FailedFetchRetry] Sweep finished: attempted={} recovered={} still_failing={}",
            sweep.attempted, sweep.recovered, sweep.still_failing
        );
        sweep
    }
}
