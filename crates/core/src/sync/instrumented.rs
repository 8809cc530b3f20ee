//! Uniform timing/trace decorator for repository operations.

use async_trait::async_trait;
use log::{log_enabled, trace, Level};
use std::future::Future;
use std::time::Instant;

use crate::errors::Result;
use crate::profiles::{FailedProfileFetch, ProfileRecord, ProfileRepositoryTrait};

/// Runs `future` and, unless `quiet`, traces how long `component.operation` took.
pub async fn instrumented<F, T>(component: &str, operation: &str, quiet: bool, future: F) -> T
where
    F: Future<Output = T>,
{
    if quiet || !log_enabled!(Level::Trace) {
        return future.await;
    }
    let started = Instant::now();
    let output = future.await;
    trace!(
        "[{}] {} took {}ms",
        component,
        operation,
        started.elapsed().as_millis()
    );
    output
}

/// Wraps a repository so every operation goes through [`instrumented`].
///
/// Built quiet, the wrapper suppresses tracing for the hot write paths while
/// keeping the same type in the wiring.
pub struct InstrumentedRepository<R> {
    inner: R,
    component: &'static str,
    quiet: bool,
}

impl<R: ProfileRepositoryTrait> InstrumentedRepository<R> {
    pub fn new(inner: R, component: &'static str) -> Self {
        Self {
            inner,
            component,
            quiet: false,
        }
    }

    pub fn quiet(inner: R, component: &'static str) -> Self {
        Self {
            inner,
            component,
            quiet: true,
        }
    }

    pub fn inner(&self) -> &R {
        &self.inner
    }

    async fn run<F, T>(&self, operation: &str, future: F) -> T
    where
        F: Future<Output = T>,
    {
        instrumented(self.component, operation, self.quiet, future).await
    }
}

#[async_trait]
impl<R: ProfileRepositoryTrait> ProfileRepositoryTrait for InstrumentedRepository<R> {
    async fn upsert_profile_if_newer(&self, record: ProfileRecord) -> Result<bool> {
        self.run("upsert_profile_if_newer", self.inner.upsert_profile_if_newer(record))
            .await
    }

    async fn get_profile_by_pointer(&self, pointer: &str) -> Result<Option<ProfileRecord>> {
        self.run("get_profile_by_pointer", self.inner.get_profile_by_pointer(pointer))
            .await
    }

    async fn get_profiles_by_pointers(&self, pointers: &[String]) -> Result<Vec<ProfileRecord>> {
        self.run(
            "get_profiles_by_pointers",
            self.inner.get_profiles_by_pointers(pointers),
        )
        .await
    }

    async fn get_latest_profile_timestamp(&self) -> Result<Option<i64>> {
        self.run(
            "get_latest_profile_timestamp",
            self.inner.get_latest_profile_timestamp(),
        )
        .await
    }

    async fn is_snapshot_processed(&self, hash: &str) -> Result<bool> {
        self.run("is_snapshot_processed", self.inner.is_snapshot_processed(hash))
            .await
    }

    async fn mark_snapshot_processed(&self, hash: &str) -> Result<()> {
        self.run("mark_snapshot_processed", self.inner.mark_snapshot_processed(hash))
            .await
    }

    async fn get_failed_profile_fetches(&self, limit: usize) -> Result<Vec<FailedProfileFetch>> {
        self.run(
            "get_failed_profile_fetches",
            self.inner.get_failed_profile_fetches(limit),
        )
        .await
    }

    async fn get_failed_profile_fetch(
        &self,
        entity_id: &str,
    ) -> Result<Option<FailedProfileFetch>> {
        self.run(
            "get_failed_profile_fetch",
            self.inner.get_failed_profile_fetch(entity_id),
        )
        .await
    }

    async fn insert_failed_profile_fetch(&self, record: FailedProfileFetch) -> Result<()> {
        self.run(
            "insert_failed_profile_fetch",
            self.inner.insert_failed_profile_fetch(record),
        )
        .await
    }

    async fn delete_failed_profile_fetch(&self, entity_id: &str) -> Result<()> {
        self.run(
            "delete_failed_profile_fetch",
            self.inner.delete_failed_profile_fetch(entity_id),
        )
        .await
    }

    async fn get_sync_cursor(&self, name: &str) -> Result<Option<i64>> {
        self.run("get_sync_cursor", self.inner.get_sync_cursor(name))
            .await
    }

    async fn set_sync_cursor(&self, name: &str, value: i64) -> Result<()> {
        self.run("set_sync_cursor", self.inner.set_sync_cursor(name, value))
            .await
    }
}
