//! Database models for profiles, processed snapshots, failed fetches and cursors.

use diesel::prelude::*;
use serde::{Deserialize, Serialize};

use profile_sync_core::profiles::{FailedProfileFetch, ProfileEntity, ProfileRecord};

use crate::errors::StorageError;

#[derive(
    Queryable,
    Identifiable,
    Insertable,
    AsChangeset,
    Selectable,
    Debug,
    Clone,
    Serialize,
    Deserialize,
)]
#[diesel(primary_key(pointer))]
#[diesel(table_name = crate::schema::profiles)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct ProfileDB {
    pub pointer: String,
    pub entity_id: String,
    pub entity_timestamp: i64,
    pub content: String,
    pub metadata: Option<String>,
    pub auth_chain: String,
    pub local_timestamp: i64,
}

impl TryFrom<ProfileRecord> for ProfileDB {
    type Error = StorageError;

    fn try_from(record: ProfileRecord) -> Result<Self, Self::Error> {
        let profile = record.profile;
        Ok(Self {
            pointer: profile.pointer,
            entity_id: profile.id,
            entity_timestamp: profile.timestamp,
            content: serde_json::to_string(&profile.content)?,
            metadata: profile
                .metadata
                .as_ref()
                .map(serde_json::to_string)
                .transpose()?,
            auth_chain: serde_json::to_string(&profile.auth_chain)?,
            local_timestamp: record.local_timestamp,
        })
    }
}

impl TryFrom<ProfileDB> for ProfileRecord {
    type Error = StorageError;

    fn try_from(row: ProfileDB) -> Result<Self, Self::Error> {
        Ok(Self {
            profile: ProfileEntity {
                id: row.entity_id,
                pointer: row.pointer,
                timestamp: row.entity_timestamp,
                content: serde_json::from_str(&row.content)?,
                metadata: row
                    .metadata
                    .as_deref()
                    .map(serde_json::from_str)
                    .transpose()?,
                auth_chain: serde_json::from_str(&row.auth_chain)?,
            },
            local_timestamp: row.local_timestamp,
        })
    }
}

#[derive(Queryable, Identifiable, Insertable, Selectable, Debug, Clone)]
#[diesel(primary_key(hash))]
#[diesel(table_name = crate::schema::processed_snapshots)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct ProcessedSnapshotDB {
    pub hash: String,
    pub processed_at: i64,
}

#[derive(
    Queryable,
    Identifiable,
    Insertable,
    AsChangeset,
    Selectable,
    Debug,
    Clone,
    Serialize,
    Deserialize,
)]
#[diesel(primary_key(entity_id))]
#[diesel(table_name = crate::schema::failed_profile_fetches)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct FailedProfileFetchDB {
    pub entity_id: String,
    pub pointer: String,
    pub entity_timestamp: i64,
    pub auth_chain: String,
    pub first_failed_at: i64,
    pub retry_count: i32,
    pub last_retry_at: Option<i64>,
    pub error_message: Option<String>,
}

impl TryFrom<FailedProfileFetch> for FailedProfileFetchDB {
    type Error = StorageError;

    fn try_from(record: FailedProfileFetch) -> Result<Self, Self::Error> {
        Ok(Self {
            entity_id: record.entity_id,
            pointer: record.pointer,
            entity_timestamp: record.timestamp,
            auth_chain: serde_json::to_string(&record.auth_chain)?,
            first_failed_at: record.first_failed_at,
            retry_count: record.retry_count,
            last_retry_at: record.last_retry_at,
            error_message: record.error_message,
        })
    }
}

impl TryFrom<FailedProfileFetchDB> for FailedProfileFetch {
    type Error = StorageError;

    fn try_from(row: FailedProfileFetchDB) -> Result<Self, Self::Error> {
        Ok(Self {
            entity_id: row.entity_id,
            pointer: row.pointer,
            timestamp: row.entity_timestamp,
            auth_chain: serde_json::from_str(&row.auth_chain)?,
            first_failed_at: row.first_failed_at,
            retry_count: row.retry_count,
            last_retry_at: row.last_retry_at,
            error_message: row.error_message,
        })
    }
}

#[derive(Queryable, Identifiable, Insertable, AsChangeset, Selectable, Debug, Clone)]
#[diesel(primary_key(name))]
#[diesel(table_name = crate::schema::sync_cursors)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct SyncCursorDB {
    pub name: String,
    pub value: i64,
    pub updated_at: i64,
}
