//! Contracts for the durable store, the upstream feeds, and the sanitizer.

use async_trait::async_trait;
use futures::stream::BoxStream;

use super::profiles_model::{
    FailedProfileFetch, ProfileEntity, ProfileRecord, RawProfileRecord, SnapshotMetadata,
};
use crate::errors::Result;

/// Durable store for profiles, processed snapshots, failed fetches and cursors.
///
/// Implementations must apply the same "only if strictly newer" predicate as
/// the hot cache: it is the final arbiter for concurrent or reordered writes.
#[async_trait]
pub trait ProfileRepositoryTrait: Send + Sync {
    /// Inserts or replaces the profile for its pointer when `record` is
    /// strictly newer than the stored one. Returns whether a write happened.
    async fn upsert_profile_if_newer(&self, record: ProfileRecord) -> Result<bool>;

    async fn get_profile_by_pointer(&self, pointer: &str) -> Result<Option<ProfileRecord>>;

    async fn get_profiles_by_pointers(&self, pointers: &[String]) -> Result<Vec<ProfileRecord>>;

    async fn get_latest_profile_timestamp(&self) -> Result<Option<i64>>;

    async fn is_snapshot_processed(&self, hash: &str) -> Result<bool>;

    /// Idempotent.
    async fn mark_snapshot_processed(&self, hash: &str) -> Result<()>;

    /// Oldest-attempted first.
    async fn get_failed_profile_fetches(&self, limit: usize) -> Result<Vec<FailedProfileFetch>>;

    async fn get_failed_profile_fetch(&self, entity_id: &str)
        -> Result<Option<FailedProfileFetch>>;

    /// Upsert keyed by entity id; an existing `first_failed_at` is never overwritten.
    async fn insert_failed_profile_fetch(&self, record: FailedProfileFetch) -> Result<()>;

    async fn delete_failed_profile_fetch(&self, entity_id: &str) -> Result<()>;

    async fn get_sync_cursor(&self, name: &str) -> Result<Option<i64>>;

    /// Never lowers a stored cursor.
    async fn set_sync_cursor(&self, name: &str, value: i64) -> Result<()>;
}

/// Callback invoked by a sanitizer for every record it could not sanitize.
#[async_trait]
pub trait SanitizeFailureHandler: Send + Sync {
    async fn on_failure(&self, record: &RawProfileRecord, error: &str);
}

/// Turns raw feed records into validated profiles.
#[async_trait]
pub trait ProfileSanitizer: Send + Sync {
    /// Never fails as a whole: records that cannot be sanitized are reported
    /// through `on_failure` and left out of the result.
    async fn sanitize_profiles(
        &self,
        records: Vec<RawProfileRecord>,
        on_failure: &dyn SanitizeFailureHandler,
    ) -> Vec<ProfileEntity>;
}

/// Ordered, paginated change stream from the content server.
pub trait PointerChangesFeed: Send + Sync {
    /// Dropping the returned stream releases the underlying connection.
    fn stream_changes(&self, from_timestamp: i64) -> BoxStream<'_, Result<RawProfileRecord>>;
}

/// Snapshot manifests and snapshot contents published by the content server.
#[async_trait]
pub trait SnapshotFeed: Send + Sync {
    async fn list_snapshots(&self) -> Result<Vec<SnapshotMetadata>>;

    /// Dropping the returned stream releases the underlying connection.
    fn stream_snapshot(&self, hash: &str) -> BoxStream<'_, Result<RawProfileRecord>>;
}
