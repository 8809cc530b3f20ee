use async_trait::async_trait;
use chrono::Utc;
use diesel::dsl::max;
use diesel::prelude::*;
use diesel::r2d2::{self, Pool};
use diesel::sql_types::{BigInt, Integer, Nullable, Text};
use diesel::SqliteConnection;
use std::sync::Arc;

use profile_sync_core::profiles::{
    normalize_pointer, FailedProfileFetch, ProfileRecord, ProfileRepositoryTrait,
};
use profile_sync_core::Result;

use super::model::{FailedProfileFetchDB, ProcessedSnapshotDB, ProfileDB};
use crate::db::{get_connection, WriteHandle};
use crate::errors::StorageError;
use crate::schema::{failed_profile_fetches, processed_snapshots, profiles, sync_cursors};

/// SQLite keeps at most 32766 bound parameters per statement.
const POINTER_LOOKUP_CHUNK: usize = 500;

const UPSERT_PROFILE_IF_NEWER_SQL: &str = "\
    INSERT INTO profiles \
        (pointer, entity_id, entity_timestamp, content, metadata, auth_chain, local_timestamp) \
    VALUES (?, ?, ?, ?, ?, ?, ?) \
    ON CONFLICT(pointer) DO UPDATE SET \
        entity_id = excluded.entity_id, \
        entity_timestamp = excluded.entity_timestamp, \
        content = excluded.content, \
        metadata = excluded.metadata, \
        auth_chain = excluded.auth_chain, \
        local_timestamp = excluded.local_timestamp \
    WHERE profiles.entity_timestamp < excluded.entity_timestamp";

/// `first_failed_at` is fixed by the first insert; `retry_count` and
/// `last_retry_at` never move backwards.
const UPSERT_FAILED_FETCH_SQL: &str = "\
    INSERT INTO failed_profile_fetches \
        (entity_id, pointer, entity_timestamp, auth_chain, first_failed_at, \
         retry_count, last_retry_at, error_message) \
    VALUES (?, ?, ?, ?, ?, ?, ?, ?) \
    ON CONFLICT(entity_id) DO UPDATE SET \
        pointer = excluded.pointer, \
        entity_timestamp = excluded.entity_timestamp, \
        auth_chain = excluded.auth_chain, \
        retry_count = MAX(failed_profile_fetches.retry_count, excluded.retry_count), \
        last_retry_at = COALESCE( \
            MAX(failed_profile_fetches.last_retry_at, excluded.last_retry_at), \
            failed_profile_fetches.last_retry_at, \
            excluded.last_retry_at), \
        error_message = excluded.error_message";

const SET_CURSOR_SQL: &str = "\
    INSERT INTO sync_cursors (name, value, updated_at) VALUES (?, ?, ?) \
    ON CONFLICT(name) DO UPDATE SET \
        value = MAX(sync_cursors.value, excluded.value), \
        updated_at = excluded.updated_at";

pub struct ProfileRepository {
    pool: Arc<Pool<r2d2::ConnectionManager<SqliteConnection>>>,
    writer: WriteHandle,
}

impl ProfileRepository {
    pub fn new(
        pool: Arc<Pool<r2d2::ConnectionManager<SqliteConnection>>>,
        writer: WriteHandle,
    ) -> Self {
        ProfileRepository { pool, writer }
    }

    pub fn get_profile_by_pointer_impl(&self, pointer: &str) -> Result<Option<ProfileRecord>> {
        let mut conn = get_connection(&self.pool)?;
        let row = profiles::table
            .find(normalize_pointer(pointer))
            .first::<ProfileDB>(&mut conn)
            .optional()
            .map_err(StorageError::from)?;
        Ok(row.map(ProfileRecord::try_from).transpose()?)
    }

    pub fn get_profiles_by_pointers_impl(&self, pointers: &[String]) -> Result<Vec<ProfileRecord>> {
        let mut keys: Vec<String> = pointers.iter().map(|p| normalize_pointer(p)).collect();
        keys.sort();
        keys.dedup();

        let mut conn = get_connection(&self.pool)?;
        let mut records = Vec::with_capacity(keys.len());
        for chunk in keys.chunks(POINTER_LOOKUP_CHUNK) {
            let rows = profiles::table
                .filter(profiles::pointer.eq_any(chunk))
                .load::<ProfileDB>(&mut conn)
                .map_err(StorageError::from)?;
            for row in rows {
                records.push(ProfileRecord::try_from(row)?);
            }
        }
        Ok(records)
    }

    pub fn get_latest_profile_timestamp_impl(&self) -> Result<Option<i64>> {
        let mut conn = get_connection(&self.pool)?;
        let latest = profiles::table
            .select(max(profiles::entity_timestamp))
            .first::<Option<i64>>(&mut conn)
            .map_err(StorageError::from)?;
        Ok(latest)
    }

    pub fn is_snapshot_processed_impl(&self, hash: &str) -> Result<bool> {
        let mut conn = get_connection(&self.pool)?;
        let found = processed_snapshots::table
            .find(hash)
            .select(processed_snapshots::hash)
            .first::<String>(&mut conn)
            .optional()
            .map_err(StorageError::from)?;
        Ok(found.is_some())
    }

    pub fn get_failed_profile_fetches_impl(&self, limit: usize) -> Result<Vec<FailedProfileFetch>> {
        let mut conn = get_connection(&self.pool)?;
        // SQLite sorts NULLs first: never-retried records come before retried ones.
        let rows = failed_profile_fetches::table
            .order((
                failed_profile_fetches::last_retry_at.asc(),
                failed_profile_fetches::first_failed_at.asc(),
            ))
            .limit(i64::try_from(limit).unwrap_or(i64::MAX))
            .load::<FailedProfileFetchDB>(&mut conn)
            .map_err(StorageError::from)?;
        rows.into_iter()
            .map(|row| Ok(FailedProfileFetch::try_from(row)?))
            .collect()
    }

    pub fn get_failed_profile_fetch_impl(
        &self,
        entity_id: &str,
    ) -> Result<Option<FailedProfileFetch>> {
        let mut conn = get_connection(&self.pool)?;
        let row = failed_profile_fetches::table
            .find(entity_id)
            .first::<FailedProfileFetchDB>(&mut conn)
            .optional()
            .map_err(StorageError::from)?;
        Ok(row.map(FailedProfileFetch::try_from).transpose()?)
    }

    pub fn get_sync_cursor_impl(&self, name: &str) -> Result<Option<i64>> {
        let mut conn = get_connection(&self.pool)?;
        let value = sync_cursors::table
            .find(name)
            .select(sync_cursors::value)
            .first::<i64>(&mut conn)
            .optional()
            .map_err(StorageError::from)?;
        Ok(value)
    }
}

#[async_trait]
impl ProfileRepositoryTrait for ProfileRepository {
    async fn upsert_profile_if_newer(&self, record: ProfileRecord) -> Result<bool> {
        let row = ProfileDB::try_from(record)?;
        self.writer
            .exec(move |conn: &mut SqliteConnection| -> Result<bool> {
                let affected = diesel::sql_query(UPSERT_PROFILE_IF_NEWER_SQL)
                    .bind::<Text, _>(&row.pointer)
                    .bind::<Text, _>(&row.entity_id)
                    .bind::<BigInt, _>(row.entity_timestamp)
                    .bind::<Text, _>(&row.content)
                    .bind::<Nullable<Text>, _>(&row.metadata)
                    .bind::<Text, _>(&row.auth_chain)
                    .bind::<BigInt, _>(row.local_timestamp)
                    .execute(conn)
                    .map_err(StorageError::from)?;
                Ok(affected > 0)
            })
            .await
    }

    async fn get_profile_by_pointer(&self, pointer: &str) -> Result<Option<ProfileRecord>> {
        self.get_profile_by_pointer_impl(pointer)
    }

    async fn get_profiles_by_pointers(&self, pointers: &[String]) -> Result<Vec<ProfileRecord>> {
        self.get_profiles_by_pointers_impl(pointers)
    }

    async fn get_latest_profile_timestamp(&self) -> Result<Option<i64>> {
        self.get_latest_profile_timestamp_impl()
    }

    async fn is_snapshot_processed(&self, hash: &str) -> Result<bool> {
        self.is_snapshot_processed_impl(hash)
    }

    async fn mark_snapshot_processed(&self, hash: &str) -> Result<()> {
        let row = ProcessedSnapshotDB {
            hash: hash.to_string(),
            processed_at: Utc::now().timestamp_millis(),
        };
        self.writer
            .exec(move |conn: &mut SqliteConnection| -> Result<()> {
                diesel::insert_or_ignore_into(processed_snapshots::table)
                    .values(&row)
                    .execute(conn)
                    .map_err(StorageError::from)?;
                Ok(())
            })
            .await
    }

    async fn get_failed_profile_fetches(&self, limit: usize) -> Result<Vec<FailedProfileFetch>> {
        self.get_failed_profile_fetches_impl(limit)
    }

    async fn get_failed_profile_fetch(
        &self,
        entity_id: &str,
    ) -> Result<Option<FailedProfileFetch>> {
        self.get_failed_profile_fetch_impl(entity_id)
    }

    async fn insert_failed_profile_fetch(&self, record: FailedProfileFetch) -> Result<()> {
        let row = FailedProfileFetchDB::try_from(record)?;
        self.writer
            .exec(move |conn: &mut SqliteConnection| -> Result<()> {
                diesel::sql_query(UPSERT_FAILED_FETCH_SQL)
                    .bind::<Text, _>(&row.entity_id)
                    .bind::<Text, _>(&row.pointer)
                    .bind::<BigInt, _>(row.entity_timestamp)
                    .bind::<Text, _>(&row.auth_chain)
                    .bind::<BigInt, _>(row.first_failed_at)
                    .bind::<Integer, _>(row.retry_count)
                    .bind::<Nullable<BigInt>, _>(row.last_retry_at)
                    .bind::<Nullable<Text>, _>(&row.error_message)
                    .execute(conn)
                    .map_err(StorageError::from)?;
                Ok(())
            })
            .await
    }

    async fn delete_failed_profile_fetch(&self, entity_id: &str) -> Result<()> {
        let entity_id = entity_id.to_string();
        self.writer
            .exec(move |conn: &mut SqliteConnection| -> Result<()> {
                diesel::delete(failed_profile_fetches::table.find(entity_id))
                    .execute(conn)
                    .map_err(StorageError::from)?;
                Ok(())
            })
            .await
    }

    async fn get_sync_cursor(&self, name: &str) -> Result<Option<i64>> {
        self.get_sync_cursor_impl(name)
    }

    async fn set_sync_cursor(&self, name: &str, value: i64) -> Result<()> {
        let name = name.to_string();
        self.writer
            .exec(move |conn: &mut SqliteConnection| -> Result<()> {
                diesel::sql_query(SET_CURSOR_SQL)
                    .bind::<Text, _>(&name)
                    .bind::<BigInt, _>(value)
                    .bind::<BigInt, _>(Utc::now().timestamp_millis())
                    .execute(conn)
                    .map_err(StorageError::from)?;
                Ok(())
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use profile_sync_core::profiles::{AuthLink, ContentMapping, ProfileEntity};
    use tempfile::tempdir;

    use crate::db::{create_pool, init, run_migrations, write_actor::spawn_writer};

    fn setup_repository() -> ProfileRepository {
        let app_data = tempdir()
            .expect("tempdir")
            .keep()
            .to_string_lossy()
            .to_string();
        let db_path = init(&app_data).expect("init db");
        run_migrations(&db_path).expect("migrate db");
        let pool = create_pool(&db_path).expect("create pool");
        let writer = spawn_writer(pool.as_ref().clone());
        ProfileRepository::new(pool, writer)
    }

    fn record(id: &str, pointer: &str, timestamp: i64) -> ProfileRecord {
        ProfileRecord {
            profile: ProfileEntity::new(
                id,
                pointer,
                timestamp,
                vec![ContentMapping {
                    file: "face256.png".to_string(),
                    hash: format!("{}-face", id),
                }],
                Some(serde_json::json!({ "avatars": [{ "name": id }] })),
                vec![AuthLink {
                    link_type: "SIGNER".to_string(),
                    payload: pointer.to_lowercase(),
                    signature: String::new(),
                }],
            ),
            local_timestamp: 1_700_000_000_000,
        }
    }

    fn failed(id: &str, first_failed_at: i64, last_retry_at: Option<i64>) -> FailedProfileFetch {
        FailedProfileFetch {
            entity_id: id.to_string(),
            pointer: format!("0x{}", id),
            timestamp: 100,
            auth_chain: vec![],
            first_failed_at,
            retry_count: 0,
            last_retry_at,
            error_message: Some("timeout".to_string()),
        }
    }

    #[tokio::test]
    async fn upsert_only_replaces_with_strictly_newer() {
        let repo = setup_repository();

        assert!(repo
            .upsert_profile_if_newer(record("bafy-new", "0xABC", 100))
            .await
            .expect("insert"));
        assert!(!repo
            .upsert_profile_if_newer(record("bafy-old", "0xabc", 50))
            .await
            .expect("older"));
        assert!(!repo
            .upsert_profile_if_newer(record("bafy-same", "0xabc", 100))
            .await
            .expect("equal"));

        let stored = repo
            .get_profile_by_pointer("0xAbC")
            .await
            .expect("get")
            .expect("present");
        assert_eq!(stored.profile.id, "bafy-new");
        assert_eq!(stored.profile.timestamp, 100);

        assert!(repo
            .upsert_profile_if_newer(record("bafy-newer", "0xabc", 150))
            .await
            .expect("newer"));
        let stored = repo
            .get_profile_by_pointer("0xabc")
            .await
            .expect("get")
            .expect("present");
        assert_eq!(stored.profile.id, "bafy-newer");
    }

    #[tokio::test]
    async fn profile_columns_round_trip() {
        let repo = setup_repository();
        let original = record("bafy1", "0xdef", 10);
        repo.upsert_profile_if_newer(original.clone())
            .await
            .expect("insert");

        let stored = repo
            .get_profile_by_pointer("0xdef")
            .await
            .expect("get")
            .expect("present");
        assert_eq!(stored, original);
    }

    #[tokio::test]
    async fn batch_lookup_and_latest_timestamp() {
        let repo = setup_repository();
        assert_eq!(repo.get_latest_profile_timestamp().await.expect("latest"), None);

        for (id, pointer, ts) in [("a", "0xa", 10), ("b", "0xb", 30), ("c", "0xc", 20)] {
            repo.upsert_profile_if_newer(record(id, pointer, ts))
                .await
                .expect("insert");
        }

        let found = repo
            .get_profiles_by_pointers(&[
                "0xA".to_string(),
                "0xc".to_string(),
                "0xmissing".to_string(),
            ])
            .await
            .expect("lookup");
        let mut ids: Vec<String> = found.into_iter().map(|r| r.profile.id).collect();
        ids.sort();
        assert_eq!(ids, vec!["a", "c"]);
        assert_eq!(
            repo.get_latest_profile_timestamp().await.expect("latest"),
            Some(30)
        );
    }

    #[tokio::test]
    async fn snapshot_marking_is_idempotent() {
        let repo = setup_repository();
        assert!(!repo.is_snapshot_processed("bafy-snap").await.expect("check"));

        repo.mark_snapshot_processed("bafy-snap").await.expect("mark");
        repo.mark_snapshot_processed("bafy-snap").await.expect("mark again");

        assert!(repo.is_snapshot_processed("bafy-snap").await.expect("check"));
    }

    #[tokio::test]
    async fn failed_fetch_upsert_keeps_first_failure() {
        let repo = setup_repository();
        repo.insert_failed_profile_fetch(failed("e1", 1_000, None))
            .await
            .expect("insert");

        let mut retried = failed("e1", 9_999, Some(2_000));
        retried.retry_count = 1;
        retried.error_message = Some("still missing".to_string());
        repo.insert_failed_profile_fetch(retried)
            .await
            .expect("upsert");

        let stored = repo
            .get_failed_profile_fetch("e1")
            .await
            .expect("get")
            .expect("present");
        assert_eq!(stored.first_failed_at, 1_000);
        assert_eq!(stored.retry_count, 1);
        assert_eq!(stored.last_retry_at, Some(2_000));
        assert_eq!(stored.error_message.as_deref(), Some("still missing"));

        repo.delete_failed_profile_fetch("e1").await.expect("delete");
        assert!(repo
            .get_failed_profile_fetch("e1")
            .await
            .expect("get")
            .is_none());
    }

    #[tokio::test]
    async fn re_recording_a_failure_keeps_retry_progress() {
        let repo = setup_repository();
        let mut retried = failed("e1", 1_000, Some(3_000));
        retried.retry_count = 2;
        repo.insert_failed_profile_fetch(retried)
            .await
            .expect("insert");

        let mut fresh = failed("e1", 8_000, None);
        fresh.error_message = Some("content server timeout".to_string());
        repo.insert_failed_profile_fetch(fresh)
            .await
            .expect("upsert");

        let stored = repo
            .get_failed_profile_fetch("e1")
            .await
            .expect("get")
            .expect("present");
        assert_eq!(stored.retry_count, 2);
        assert_eq!(stored.last_retry_at, Some(3_000));
        assert_eq!(stored.first_failed_at, 1_000);
        assert_eq!(stored.error_message.as_deref(), Some("content server timeout"));

        let mut older_retry = failed("e1", 1_000, Some(2_500));
        older_retry.retry_count = 1;
        repo.insert_failed_profile_fetch(older_retry)
            .await
            .expect("upsert");
        let stored = repo
            .get_failed_profile_fetch("e1")
            .await
            .expect("get")
            .expect("present");
        assert_eq!(stored.retry_count, 2);
        assert_eq!(stored.last_retry_at, Some(3_000));
    }

    #[tokio::test]
    async fn failed_fetches_are_ordered_by_last_attempt() {
        let repo = setup_repository();
        repo.insert_failed_profile_fetch(failed("retried-late", 100, Some(5_000)))
            .await
            .expect("insert");
        repo.insert_failed_profile_fetch(failed("retried-early", 200, Some(4_000)))
            .await
            .expect("insert");
        repo.insert_failed_profile_fetch(failed("never-retried", 300, None))
            .await
            .expect("insert");

        let batch = repo.get_failed_profile_fetches(2).await.expect("load");
        let ids: Vec<&str> = batch.iter().map(|r| r.entity_id.as_str()).collect();
        assert_eq!(ids, vec!["never-retried", "retried-early"]);
    }

    #[tokio::test]
    async fn cursors_never_move_backwards() {
        let repo = setup_repository();
        assert_eq!(repo.get_sync_cursor("pointer_changes").await.expect("get"), None);

        repo.set_sync_cursor("pointer_changes", 500).await.expect("set");
        repo.set_sync_cursor("pointer_changes", 100).await.expect("set lower");
        assert_eq!(
            repo.get_sync_cursor("pointer_changes").await.expect("get"),
            Some(500)
        );

        repo.set_sync_cursor("pointer_changes", 900).await.expect("set higher");
        assert_eq!(
            repo.get_sync_cursor("pointer_changes").await.expect("get"),
            Some(900)
        );
        assert_eq!(repo.get_sync_cursor("snapshots").await.expect("get"), None);
    }
}
