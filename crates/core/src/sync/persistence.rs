//! Persistence pipeline: dedup, hot-cache gate, and durable writes.
//!
//! The pipeline starts in bootstrapping mode, where durable writes go through a
//! bounded-concurrency queue so a large historical backlog cannot open an
//! unbounded number of store operations. After `set_bootstrap_complete` it
//! switches (one way) to incremental mode and issues writes directly.
//!
//! In both modes writes are fire-and-forget: failures are logged and counted,
//! never returned and never retried here. Upstream redelivery plus the store's
//! timestamp-gated upsert bring the store back in line.

use async_trait::async_trait;
use chrono::Utc;
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{Notify, Semaphore};

use super::dedup_tracker::DedupTracker;
use super::hot_cache::HotCache;
use super::VersionedEntity;
use crate::errors::Result;
use crate::profiles::{ProfileEntity, ProfileRecord, ProfileRepositoryTrait};

/// Maximum simultaneous durable writes while bootstrapping.
pub const DEFAULT_BOOTSTRAP_WRITE_CONCURRENCY: usize = 30;

/// Durable side of the pipeline.
#[async_trait]
pub trait EntityWriter<E>: Send + Sync {
    /// Returns whether the store accepted the entity as newer.
    async fn write_if_newer(&self, entity: E, local_timestamp: i64) -> Result<bool>;

    /// Entity and receipt time the store holds for `pointer`.
    async fn stored_version(&self, _pointer: &str) -> Result<Option<(E, i64)>> {
        Ok(None)
    }
}

/// Anything that accepts entities for idempotent persistence.
#[async_trait]
pub trait EntityPersister<E>: Send + Sync {
    async fn persist_entity(&self, entity: E);
}

/// Writes profiles through a [`ProfileRepositoryTrait`].
pub struct ProfileRepositoryWriter {
    repository: Arc<dyn ProfileRepositoryTrait>,
}

impl ProfileRepositoryWriter {
    pub fn new(repository: Arc<dyn ProfileRepositoryTrait>) -> Self {
        Self { repository }
    }
}

#[async_trait]
impl EntityWriter<ProfileEntity> for ProfileRepositoryWriter {
    async fn write_if_newer(&self, entity: ProfileEntity, local_timestamp: i64) -> Result<bool> {
        self.repository
            .upsert_profile_if_newer(ProfileRecord {
                profile: entity,
                local_timestamp,
            })
            .await
    }

    async fn stored_version(&self, pointer: &str) -> Result<Option<(ProfileEntity, i64)>> {
        Ok(self
            .repository
            .get_profile_by_pointer(pointer)
            .await?
            .map(|record| (record.profile, record.local_timestamp)))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PersistenceMode {
    Bootstrapping,
    Incremental,
}

/// What `persist` did with an entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PersistOutcome {
    /// Same id already in flight within the dedup TTL.
    Duplicate,
    /// Id was accepted before.
    AlreadyProcessed,
    /// Hot cache holds an equal or newer version for the pointer.
    Stale,
    /// Accepted and handed to the durable writer.
    Submitted,
}

/// Point-in-time pipeline counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistenceStats {
    pub submitted: u64,
    pub duplicates: u64,
    pub already_processed: u64,
    pub stale: u64,
    pub writes_applied: u64,
    pub writes_skipped: u64,
    pub write_failures: u64,
}

#[derive(Default)]
struct StatsCounters {
    submitted: AtomicU64,
    duplicates: AtomicU64,
    already_processed: AtomicU64,
    stale: AtomicU64,
    writes_applied: AtomicU64,
    writes_skipped: AtomicU64,
    write_failures: AtomicU64,
}

impl StatsCounters {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> PersistenceStats {
        PersistenceStats {
            submitted: self.submitted.load(Ordering::Relaxed),
            duplicates: self.duplicates.load(Ordering::Relaxed),
            already_processed: self.already_processed.load(Ordering::Relaxed),
            stale: self.stale.load(Ordering::Relaxed),
            writes_applied: self.writes_applied.load(Ordering::Relaxed),
            writes_skipped: self.writes_skipped.load(Ordering::Relaxed),
            write_failures: self.write_failures.load(Ordering::Relaxed),
        }
    }
}

#[derive(Default)]
struct InFlightWrites {
    count: AtomicUsize,
    idle: Notify,
}

/// Held by every spawned write; dropping the last one wakes drain waiters.
struct InFlightGuard(Arc<InFlightWrites>);

impl InFlightGuard {
    fn new(writes: &Arc<InFlightWrites>) -> Self {
        writes.count.fetch_add(1, Ordering::SeqCst);
        Self(Arc::clone(writes))
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        if self.0.count.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.0.idle.notify_waiters();
        }
    }
}

pub struct PersistencePipeline<E: VersionedEntity = ProfileEntity> {
    dedup: Arc<DedupTracker>,
    hot_cache: Arc<HotCache<E>>,
    writer: Arc<dyn EntityWriter<E>>,
    bootstrap_complete: AtomicBool,
    write_permits: Arc<Semaphore>,
    in_flight: Arc<InFlightWrites>,
    counters: Arc<StatsCounters>,
}

impl PersistencePipeline<ProfileEntity> {
    /// Pipeline writing profiles into `repository`.
    pub fn for_profiles(
        dedup: Arc<DedupTracker>,
        hot_cache: Arc<HotCache<ProfileEntity>>,
        repository: Arc<dyn ProfileRepositoryTrait>,
        max_concurrent_writes: usize,
    ) -> Self {
        Self::new(
            dedup,
            hot_cache,
            Arc::new(ProfileRepositoryWriter::new(repository)),
            max_concurrent_writes,
        )
    }
}

impl<E: VersionedEntity> PersistencePipeline<E> {
    pub fn new(
        dedup: Arc<DedupTracker>,
        hot_cache: Arc<HotCache<E>>,
        writer: Arc<dyn EntityWriter<E>>,
        max_concurrent_writes: usize,
    ) -> Self {
        Self {
            dedup,
            hot_cache,
            writer,
            bootstrap_complete: AtomicBool::new(false),
            write_permits: Arc::new(Semaphore::new(max_concurrent_writes.max(1))),
            in_flight: Arc::new(InFlightWrites::default()),
            counters: Arc::new(StatsCounters::default()),
        }
    }

    pub fn hot_cache(&self) -> &Arc<HotCache<E>> {
        &self.hot_cache
    }

    pub fn dedup(&self) -> &Arc<DedupTracker> {
        &self.dedup
    }

    pub fn mode(&self) -> PersistenceMode {
        if self.is_bootstrap_complete() {
            PersistenceMode::Incremental
        } else {
            PersistenceMode::Bootstrapping
        }
    }

    pub fn is_bootstrap_complete(&self) -> bool {
        self.bootstrap_complete.load(Ordering::Acquire)
    }

    /// Switches to incremental mode. Irreversible; call `wait_for_drain` first.
    pub fn set_bootstrap_complete(&self) {
        if !self.bootstrap_complete.swap(true, Ordering::AcqRel) {
            debug!("[Persistence] Bootstrap complete, switching to incremental writes");
        }
    }

    pub fn stats(&self) -> PersistenceStats {
        self.counters.snapshot()
    }

    /// Number of durable writes currently queued or running.
    pub fn pending_writes(&self) -> usize {
        self.in_flight.count.load(Ordering::SeqCst)
    }

    /// Resolves once every write submitted so far has finished.
    pub async fn wait_for_drain(&self) {
        loop {
            let idle = self.in_flight.idle.notified();
            tokio::pin!(idle);
            idle.as_mut().enable();
            if self.pending_writes() == 0 {
                return;
            }
            idle.await;
        }
    }

    /// Deduplicates, gates on the hot cache, and submits a durable write.
    ///
    /// While bootstrapping, a write slot is taken before the entity is marked
    /// as accepted, so dropping this future while it waits for a slot leaves
    /// no dedup or cache state behind and redelivery is still written.
    pub async fn persist(&self, entity: E) -> PersistOutcome {
        let permit = if self.is_bootstrap_complete() {
            None
        } else {
            // Waits only while the queue is saturated.
            match Arc::clone(&self.write_permits).acquire_owned().await {
                Ok(permit) => Some(permit),
                Err(err) => {
                    warn!("[Persistence] Write queue closed, writing unbounded: {}", err);
                    None
                }
            }
        };

        let entity_id = entity.entity_id().to_string();
        if self.dedup.try_mark_duplicate(&entity_id) {
            StatsCounters::bump(&self.counters.duplicates);
            return PersistOutcome::Duplicate;
        }
        if self.dedup.has_been_processed(&entity_id) {
            StatsCounters::bump(&self.counters.already_processed);
            return PersistOutcome::AlreadyProcessed;
        }

        let local_timestamp = Utc::now().timestamp_millis();
        let pointer = entity.pointer().to_string();
        if !self
            .hot_cache
            .set_if_newer_at(&pointer, entity.clone(), local_timestamp)
        {
            StatsCounters::bump(&self.counters.stale);
            return PersistOutcome::Stale;
        }
        self.dedup.mark_as_processed(&entity_id);
        StatsCounters::bump(&self.counters.submitted);

        let guard = InFlightGuard::new(&self.in_flight);
        let writer = Arc::clone(&self.writer);
        let counters = Arc::clone(&self.counters);
        let hot_cache = Arc::clone(&self.hot_cache);
        tokio::spawn(async move {
            Self::write(writer.as_ref(), &hot_cache, &counters, entity, local_timestamp).await;
            drop(permit);
            drop(guard);
        });

        PersistOutcome::Submitted
    }

    async fn write(
        writer: &dyn EntityWriter<E>,
        hot_cache: &HotCache<E>,
        counters: &StatsCounters,
        entity: E,
        local_timestamp: i64,
    ) {
        let entity_id = entity.entity_id().to_string();
        let pointer = entity.pointer().to_string();
        match writer.write_if_newer(entity, local_timestamp).await {
            Ok(true) => StatsCounters::bump(&counters.writes_applied),
            Ok(false) => {
                debug!(
                    "[Persistence] Store already holds a newer profile for {} (entity {})",
                    pointer, entity_id
                );
                StatsCounters::bump(&counters.writes_skipped);
                // The cache accepted a version the store refused, which happens
                // once the pointer's newer entry has been evicted.
                match writer.stored_version(&pointer).await {
                    Ok(Some((stored, stored_at))) => {
                        hot_cache.set_from_store(&pointer, stored, stored_at);
                    }
                    Ok(None) => {}
                    Err(err) => warn!(
                        "[Persistence] Failed to reload stored profile for {}: {}",
                        pointer, err
                    ),
                }
            }
            Err(err) => {
                warn!(
                    "[Persistence] Failed to persist entity {} for {}: {}",
                    entity_id, pointer, err
                );
                StatsCounters::bump(&counters.write_failures);
            }
        }
    }
}

#[async_trait]
impl<E: VersionedEntity> EntityPersister<E> for PersistencePipeline<E> {
    async fn persist_entity(&self, entity: E) {
        self.persist(entity).await;
    }
}
