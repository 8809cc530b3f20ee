//! Profile sync daemon.
//!
//! Bootstraps the local profile store from Catalyst snapshots, then keeps it
//! current from the pointer-changes feed while retrying failed fetches in the
//! background. Configuration comes from `CATALYST_CONTENT_URL` and the
//! `PROFILE_SYNC_*` environment variables.
//!
//! Ctrl+C cancels the running loops; queued writes are drained before exit.

use std::sync::Arc;

use anyhow::{Context, Result};
use tracing_subscriber::EnvFilter;

use profile_sync_catalyst::{CatalystClient, CatalystProfileSanitizer};
use profile_sync_core::config::SyncConfig;
use profile_sync_core::profiles::{ProfileRepositoryTrait, ProfileSanitizer, SanitizeFailureHandler};
use profile_sync_core::sync::{
    CancellationToken, DedupSettings, DedupTracker, FailedFetchRecorder, FailedFetchRetrier,
    HotCache, InstrumentedRepository, PersistencePipeline, PointerChangesSynchronizer,
    ProfileSyncService, SnapshotSynchronizer, SyncIntervals,
};
use profile_sync_storage_sqlite::{
    create_pool, init, run_migrations, spawn_writer, ProfileRepository,
};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,profile_sync=debug")),
        )
        .with_target(false)
        .init();

    let config = SyncConfig::from_env().context("Invalid profile sync configuration")?;

    tracing::info!("Profile sync starting...");
    tracing::info!("  Content server: {}", config.content_server_url);
    tracing::info!("  Data dir: {}", config.database_path);
    tracing::info!(
        "  Bloom filter: {} items @ {}",
        config.bloom_expected_items,
        config.bloom_false_positive_rate
    );
    tracing::info!("  Hot cache: {}", config.hot_cache_capacity);

    let db_path = init(&config.database_path).context("Failed to prepare data directory")?;
    run_migrations(&db_path).context("Failed to run migrations")?;
    let pool = create_pool(&db_path).context("Failed to open database")?;
    let writer = spawn_writer(pool.as_ref().clone());

    let repository: Arc<dyn ProfileRepositoryTrait> = Arc::new(InstrumentedRepository::new(
        ProfileRepository::new(pool, writer),
        "profiles",
    ));

    let client = CatalystClient::new(&config.content_server_url, config.request_timeout())
        .context("Failed to build Catalyst client")?;
    let sanitizer: Arc<dyn ProfileSanitizer> =
        Arc::new(CatalystProfileSanitizer::new(client.clone()));
    let feed = Arc::new(client);

    let dedup = Arc::new(DedupTracker::new(DedupSettings::from(&config)));
    let hot_cache = Arc::new(HotCache::new(config.hot_cache_capacity));
    let pipeline = Arc::new(PersistencePipeline::for_profiles(
        dedup.clone(),
        hot_cache,
        repository.clone(),
        config.bootstrap_write_concurrency,
    ));
    let failure_handler: Arc<dyn SanitizeFailureHandler> =
        Arc::new(FailedFetchRecorder::new(repository.clone()));

    let snapshots = SnapshotSynchronizer::new(
        feed.clone(),
        sanitizer.clone(),
        failure_handler.clone(),
        repository.clone(),
        dedup.clone(),
        pipeline.clone(),
    );
    let pointer_changes = PointerChangesSynchronizer::new(
        feed,
        sanitizer.clone(),
        failure_handler,
        dedup,
        pipeline.clone(),
    );
    let retrier = FailedFetchRetrier::new(
        repository.clone(),
        sanitizer,
        pipeline.clone(),
        config.failed_fetch_batch_size,
    );

    let service = ProfileSyncService::new(
        repository,
        pipeline,
        snapshots,
        pointer_changes,
        retrier,
        SyncIntervals::from(&config),
    );

    let cancel = CancellationToken::new();
    let signal_cancel = cancel.clone();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!("Failed to listen for Ctrl+C: {}", e);
            return;
        }
        tracing::info!("Shutdown signal received, stopping gracefully...");
        signal_cancel.cancel();
    });

    service.run(&cancel).await;

    let stats = service.pipeline().stats();
    tracing::info!("Shutting down...");
    tracing::info!("Profiles submitted:   {}", stats.submitted);
    tracing::info!("Writes applied:       {}", stats.writes_applied);
    tracing::info!("Duplicates skipped:   {}", stats.duplicates + stats.already_processed);
    tracing::info!("Write failures:       {}", stats.write_failures);

    Ok(())
}
