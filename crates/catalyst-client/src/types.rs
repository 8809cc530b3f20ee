//! Wire types for the Catalyst content server API.

use serde::{Deserialize, Serialize};

use profile_sync_core::profiles::{
    AuthLink, ContentMapping, EntityType, RawProfileRecord, SnapshotMetadata, SnapshotTimeRange,
};

/// One page of `GET /content/pointer-changes`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PointerChangesPage {
    #[serde(default)]
    pub deltas: Vec<PointerChangeDelta>,
    #[serde(default)]
    pub pagination: Pagination,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Pagination {
    #[serde(default)]
    pub more_data: bool,
    /// Query string (or absolute URL) of the following page.
    #[serde(default)]
    pub next: Option<String>,
}

impl Pagination {
    /// Link to the following page, if the server reports more data.
    pub fn next_page(&self) -> Option<&str> {
        if !self.more_data {
            return None;
        }
        self.next.as_deref()
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PointerChangeDelta {
    pub entity_id: String,
    pub entity_type: EntityType,
    #[serde(default)]
    pub pointers: Vec<String>,
    pub entity_timestamp: i64,
    pub local_timestamp: i64,
    #[serde(default)]
    pub auth_chain: Vec<AuthLink>,
}

impl From<PointerChangeDelta> for RawProfileRecord {
    fn from(delta: PointerChangeDelta) -> Self {
        RawProfileRecord {
            entity_id: delta.entity_id,
            entity_type: delta.entity_type,
            pointers: delta.pointers,
            entity_timestamp: delta.entity_timestamp,
            local_timestamp: Some(delta.local_timestamp),
            auth_chain: delta.auth_chain,
        }
    }
}

/// Entry of `GET /content/snapshots`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotEntry {
    pub hash: String,
    pub time_range: SnapshotTimeRangeWire,
    #[serde(default)]
    pub number_of_entities: u64,
    #[serde(default)]
    pub replaced_snapshot_hashes: Vec<String>,
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotTimeRangeWire {
    pub init_timestamp: i64,
    pub end_timestamp: i64,
}

impl From<SnapshotEntry> for SnapshotMetadata {
    fn from(entry: SnapshotEntry) -> Self {
        SnapshotMetadata {
            hash: entry.hash,
            time_range: SnapshotTimeRange {
                init_timestamp: entry.time_range.init_timestamp,
                end_timestamp: entry.time_range.end_timestamp,
            },
            number_of_entities: entry.number_of_entities,
            replaced_snapshot_hashes: entry.replaced_snapshot_hashes,
        }
    }
}

/// One JSON line of a snapshot file.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotLine {
    pub entity_id: String,
    pub entity_type: EntityType,
    #[serde(default)]
    pub pointers: Vec<String>,
    pub entity_timestamp: i64,
    #[serde(default)]
    pub auth_chain: Vec<AuthLink>,
}

impl From<SnapshotLine> for RawProfileRecord {
    fn from(line: SnapshotLine) -> Self {
        RawProfileRecord {
            entity_id: line.entity_id,
            entity_type: line.entity_type,
            pointers: line.pointers,
            entity_timestamp: line.entity_timestamp,
            local_timestamp: None,
            auth_chain: line.auth_chain,
        }
    }
}

/// Body of `POST /content/entities/active`.
#[derive(Debug, Clone, Serialize)]
pub struct ActiveEntitiesRequest<'a> {
    pub ids: &'a [String],
}

/// Deployed entity as returned by `POST /content/entities/active`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActiveEntity {
    pub id: String,
    #[serde(rename = "type")]
    pub entity_type: EntityType,
    #[serde(default)]
    pub pointers: Vec<String>,
    pub timestamp: i64,
    #[serde(default)]
    pub content: Vec<ContentMapping>,
    #[serde(default)]
    pub metadata: Option<serde_json::Value>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delta_keeps_local_timestamp_for_cursor() {
        let delta: PointerChangeDelta = serde_json::from_str(
            r#"{"entityId":"bafy1","entityType":"profile","pointers":["0xAB"],
                "entityTimestamp":100,"localTimestamp":150,"authChain":[]}"#,
        )
        .expect("delta");
        let record = RawProfileRecord::from(delta);
        assert!(record.is_profile());
        assert_eq!(record.cursor_timestamp(), 150);
    }

    #[test]
    fn unknown_entity_types_still_parse() {
        let line: SnapshotLine = serde_json::from_str(
            r#"{"entityId":"bafy2","entityType":"land","pointers":["1,1"],"entityTimestamp":5}"#,
        )
        .expect("line");
        assert_eq!(line.entity_type, EntityType::Unknown);
    }

    #[test]
    fn pagination_defaults_to_last_page() {
        let page: PointerChangesPage = serde_json::from_str(r#"{"deltas":[]}"#).expect("page");
        assert!(page.pagination.next.is_none());
        assert!(!page.pagination.more_data);
        assert!(page.pagination.next_page().is_none());
    }

    #[test]
    fn next_link_is_ignored_without_more_data() {
        let page: PointerChangesPage = serde_json::from_str(
            r#"{"deltas":[],"pagination":{"moreData":false,"next":"?from=5&lastId=x"}}"#,
        )
        .expect("page");
        assert!(page.pagination.next_page().is_none());

        let page: PointerChangesPage = serde_json::from_str(
            r#"{"deltas":[],"pagination":{"moreData":true,"next":"?from=5&lastId=x"}}"#,
        )
        .expect("page");
        assert_eq!(page.pagination.next_page(), Some("?from=5&lastId=x"));
    }
}
