//! Profile domain models.

use serde::{Deserialize, Serialize};

/// Entity types published by content servers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityType {
    Profile,
    Scene,
    Wearable,
    Emote,
    Store,
    Outfits,
    #[serde(other)]
    Unknown,
}

/// Maps a file name inside an entity to the content hash that stores it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContentMapping {
    pub file: String,
    pub hash: String,
}

/// One link of the signature chain that authorises a deployment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthLink {
    #[serde(rename = "type")]
    pub link_type: String,
    pub payload: String,
    #[serde(default)]
    pub signature: String,
}

/// A validated, immutable profile entity.
///
/// `pointer` is always stored lowercased; `id` is the content hash of this
/// particular deployment and is informational for storage purposes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProfileEntity {
    pub id: String,
    pub pointer: String,
    pub timestamp: i64,
    #[serde(default)]
    pub content: Vec<ContentMapping>,
    #[serde(default)]
    pub metadata: Option<serde_json::Value>,
    #[serde(default)]
    pub auth_chain: Vec<AuthLink>,
}

impl ProfileEntity {
    pub fn new(
        id: impl Into<String>,
        pointer: &str,
        timestamp: i64,
        content: Vec<ContentMapping>,
        metadata: Option<serde_json::Value>,
        auth_chain: Vec<AuthLink>,
    ) -> Self {
        Self {
            id: id.into(),
            pointer: normalize_pointer(pointer),
            timestamp,
            content,
            metadata,
            auth_chain,
        }
    }
}

/// A profile as held by the durable store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProfileRecord {
    pub profile: ProfileEntity,
    /// Wall-clock milliseconds at which this service accepted the profile.
    pub local_timestamp: i64,
}

/// A change or snapshot line before it has been sanitized.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawProfileRecord {
    pub entity_id: String,
    pub entity_type: EntityType,
    pub pointers: Vec<String>,
    pub entity_timestamp: i64,
    #[serde(default)]
    pub local_timestamp: Option<i64>,
    #[serde(default)]
    pub auth_chain: Vec<AuthLink>,
}

impl RawProfileRecord {
    pub fn is_profile(&self) -> bool {
        self.entity_type == EntityType::Profile
    }

    /// First pointer, lowercased. Profiles are keyed by it.
    pub fn pointer(&self) -> Option<String> {
        self.pointers
            .first()
            .map(|p| normalize_pointer(p))
            .filter(|p| !p.is_empty())
    }

    /// Timestamp the upstream feed orders and paginates this record by.
    pub fn cursor_timestamp(&self) -> i64 {
        self.local_timestamp.unwrap_or(self.entity_timestamp)
    }
}

/// A profile whose content could not be sanitized and is awaiting retry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FailedProfileFetch {
    pub entity_id: String,
    pub pointer: String,
    pub timestamp: i64,
    pub auth_chain: Vec<AuthLink>,
    pub first_failed_at: i64,
    pub retry_count: i32,
    pub last_retry_at: Option<i64>,
    pub error_message: Option<String>,
}

impl FailedProfileFetch {
    /// Rebuild the raw record so the sanitizer can be run again.
    pub fn to_raw_record(&self) -> RawProfileRecord {
        RawProfileRecord {
            entity_id: self.entity_id.clone(),
            entity_type: EntityType::Profile,
            pointers: vec![self.pointer.clone()],
            entity_timestamp: self.timestamp,
            local_timestamp: None,
            auth_chain: self.auth_chain.clone(),
        }
    }
}

/// Time range covered by a snapshot, in entity timestamp milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotTimeRange {
    pub init_timestamp: i64,
    pub end_timestamp: i64,
}

/// Manifest entry describing one available snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotMetadata {
    pub hash: String,
    pub time_range: SnapshotTimeRange,
    #[serde(default)]
    pub number_of_entities: u64,
    #[serde(default)]
    pub replaced_snapshot_hashes: Vec<String>,
}

/// Normalizes a pointer for use as a storage and cache key.
pub fn normalize_pointer(pointer: &str) -> String {
    pointer.trim().to_lowercase()
}
