//! Turns raw feed records into profiles by fetching the deployed entities.

use async_trait::async_trait;
use log::{debug, warn};
use rand::Rng;
use std::collections::HashMap;
use std::time::Duration;
use tokio::time::sleep;

use profile_sync_core::profiles::{
    EntityType, ProfileEntity, ProfileSanitizer, RawProfileRecord, SanitizeFailureHandler,
};

use crate::client::CatalystClient;
use crate::error::{CatalystError, RetryClass};
use crate::types::ActiveEntity;

/// Ids requested per `entities/active` call.
const ACTIVE_ENTITIES_BATCH: usize = 100;
const ACTIVE_ENTITIES_MAX_ATTEMPTS: usize = 3;
const ACTIVE_ENTITIES_BASE_BACKOFF: Duration = Duration::from_millis(250);
const ACTIVE_ENTITIES_MAX_BACKOFF: Duration = Duration::from_secs(5);

fn backoff_with_jitter(base: Duration, attempt: usize) -> Duration {
    let exp = (attempt.saturating_sub(1) as u32).min(8);
    let backoff = base
        .saturating_mul(1_u32 << exp)
        .min(ACTIVE_ENTITIES_MAX_BACKOFF);
    let max_jitter_ms = (backoff.as_millis() as u64 / 5).max(1);
    let jitter = rand::thread_rng().gen_range(0..=max_jitter_ms);
    backoff.saturating_add(Duration::from_millis(jitter))
}

pub struct CatalystProfileSanitizer {
    client: CatalystClient,
    base_backoff: Duration,
}

impl CatalystProfileSanitizer {
    pub fn new(client: CatalystClient) -> Self {
        Self {
            client,
            base_backoff: ACTIVE_ENTITIES_BASE_BACKOFF,
        }
    }

    /// Overrides the first retry delay for transient `entities/active` failures.
    pub fn with_base_backoff(mut self, base_backoff: Duration) -> Self {
        self.base_backoff = base_backoff;
        self
    }

    /// Fetches active entities, retrying failures classed as retryable.
    async fn fetch_active_entities(
        &self,
        ids: &[String],
    ) -> Result<Vec<ActiveEntity>, CatalystError> {
        let mut attempt = 0usize;
        loop {
            attempt = attempt.saturating_add(1);
            match self.client.get_active_entities(ids).await {
                Ok(entities) => return Ok(entities),
                Err(err)
                    if err.retry_class() == RetryClass::Retryable
                        && attempt < ACTIVE_ENTITIES_MAX_ATTEMPTS =>
                {
                    let backoff = backoff_with_jitter(self.base_backoff, attempt);
                    debug!(
                        "[Sanitizer] Retry attempt {}/{} for {} entities in {:?}: {}",
                        attempt + 1,
                        ACTIVE_ENTITIES_MAX_ATTEMPTS,
                        ids.len(),
                        backoff,
                        err
                    );
                    sleep(backoff).await;
                }
                Err(err) => return Err(err),
            }
        }
    }

    async fn sanitize_batch(
        &self,
        records: &[RawProfileRecord],
        on_failure: &dyn SanitizeFailureHandler,
        profiles: &mut Vec<ProfileEntity>,
    ) {
        let ids: Vec<String> = records.iter().map(|r| r.entity_id.clone()).collect();
        let entities = match self.fetch_active_entities(&ids).await {
            Ok(entities) => entities,
            Err(err) => {
                warn!(
                    "[Sanitizer] Failed to fetch {} entities: {}",
                    records.len(),
                    err
                );
                let message = err.to_string();
                for record in records {
                    on_failure.on_failure(record, &message).await;
                }
                return;
            }
        };

        let mut by_id: HashMap<String, ActiveEntity> = entities
            .into_iter()
            .map(|entity| (entity.id.clone(), entity))
            .collect();

        for record in records {
            let Some(entity) = by_id.remove(&record.entity_id) else {
                on_failure
                    .on_failure(record, "entity not available on content server")
                    .await;
                continue;
            };
            match to_profile(record, entity) {
                Ok(profile) => profiles.push(profile),
                Err(reason) => {
                    debug!(
                        "[Sanitizer] Rejected entity {}: {}",
                        record.entity_id, reason
                    );
                    on_failure.on_failure(record, &reason).await;
                }
            }
        }
    }
}

fn to_profile(record: &RawProfileRecord, entity: ActiveEntity) -> Result<ProfileEntity, String> {
    if entity.entity_type != EntityType::Profile {
        return Err(format!("entity type is {:?}, not profile", entity.entity_type));
    }
    let Some(pointer) = entity
        .pointers
        .iter()
        .map(|p| p.trim())
        .find(|p| !p.is_empty())
    else {
        return Err("entity has no pointers".to_string());
    };
    if entity.timestamp != record.entity_timestamp {
        return Err(format!(
            "entity timestamp {} does not match feed timestamp {}",
            entity.timestamp, record.entity_timestamp
        ));
    }
    Ok(ProfileEntity::new(
        entity.id.clone(),
        pointer,
        entity.timestamp,
        entity.content,
        entity.metadata,
        record.auth_chain.clone(),
    ))
}

#[async_trait]
impl ProfileSanitizer for CatalystProfileSanitizer {
    async fn sanitize_profiles(
        &self,
        records: Vec<RawProfileRecord>,
        on_failure: &dyn SanitizeFailureHandler,
    ) -> Vec<ProfileEntity> {
        let mut profiles = Vec::with_capacity(records.len());
        for batch in records.chunks(ACTIVE_ENTITIES_BATCH) {
            self.sanitize_batch(batch, on_failure, &mut profiles).await;
        }
        profiles
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::tests::{start_mock_server, MockResponse, Routes};
    use std::sync::Mutex;
    use std::time::Duration;

    #[derive(Default)]
    struct RecordingFailures {
        failures: Mutex<Vec<(String, String)>>,
    }

    #[async_trait]
    impl SanitizeFailureHandler for RecordingFailures {
        async fn on_failure(&self, record: &RawProfileRecord, error: &str) {
            self.failures
                .lock()
                .unwrap()
                .push((record.entity_id.clone(), error.to_string()));
        }
    }

    fn raw(id: &str, pointer: &str, timestamp: i64) -> RawProfileRecord {
        RawProfileRecord {
            entity_id: id.to_string(),
            entity_type: EntityType::Profile,
            pointers: vec![pointer.to_string()],
            entity_timestamp: timestamp,
            local_timestamp: Some(timestamp + 1),
            auth_chain: vec![],
        }
    }

    fn sanitizer_for(base_url: &str) -> CatalystProfileSanitizer {
        CatalystProfileSanitizer::new(
            CatalystClient::new(base_url, Duration::from_secs(5)).expect("client"),
        )
        .with_base_backoff(Duration::from_millis(1))
    }

    #[tokio::test]
    async fn valid_entities_become_profiles_and_the_rest_fail() {
        let mut routes = Routes::new();
        routes.insert(
            "POST /content/entities/active".to_string(),
            MockResponse::json(
                200,
                r#"[
                    {"id":"bafy-ok","type":"profile","pointers":["0xABC"],"timestamp":100,
                     "content":[{"file":"body.png","hash":"bafy-body"}],
                     "metadata":{"avatars":[{"name":"alice"}]}},
                    {"id":"bafy-stale","type":"profile","pointers":["0xDEF"],"timestamp":999,
                     "content":[],"metadata":null}
                ]"#,
            ),
        );
        let (base_url, captured, server) = start_mock_server(routes).await;
        let sanitizer = sanitizer_for(&base_url);
        let failures = RecordingFailures::default();

        let profiles = sanitizer
            .sanitize_profiles(
                vec![
                    raw("bafy-ok", "0xABC", 100),
                    raw("bafy-stale", "0xDEF", 200),
                    raw("bafy-gone", "0x123", 300),
                ],
                &failures,
            )
            .await;

        assert_eq!(profiles.len(), 1);
        assert_eq!(profiles[0].id, "bafy-ok");
        assert_eq!(profiles[0].pointer, "0xabc");
        assert_eq!(profiles[0].content.len(), 1);
        assert!(profiles[0].metadata.is_some());

        let failed: Vec<String> = failures
            .failures
            .lock()
            .unwrap()
            .iter()
            .map(|(id, _)| id.clone())
            .collect();
        assert_eq!(failed, vec!["bafy-stale", "bafy-gone"]);

        let requests = captured.lock().await;
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].method, "POST");
        let body: serde_json::Value = serde_json::from_str(&requests[0].body).expect("json body");
        assert_eq!(
            body["ids"],
            serde_json::json!(["bafy-ok", "bafy-stale", "bafy-gone"])
        );
        server.abort();
    }

    #[tokio::test]
    async fn request_failure_reports_every_record() {
        let mut routes = Routes::new();
        routes.insert(
            "POST /content/entities/active".to_string(),
            MockResponse::json(500, r#"{"error":"boom"}"#),
        );
        let (base_url, captured, server) = start_mock_server(routes).await;
        let sanitizer = sanitizer_for(&base_url);
        let failures = RecordingFailures::default();

        let profiles = sanitizer
            .sanitize_profiles(vec![raw("a", "0xa", 1), raw("b", "0xb", 2)], &failures)
            .await;

        assert!(profiles.is_empty());
        let recorded = failures.failures.lock().unwrap();
        assert_eq!(recorded.len(), 2);
        assert!(recorded[0].1.contains("500"));
        assert_eq!(captured.lock().await.len(), ACTIVE_ENTITIES_MAX_ATTEMPTS);
        server.abort();
    }

    #[tokio::test]
    async fn permanent_request_failure_is_not_retried() {
        let mut routes = Routes::new();
        routes.insert(
            "POST /content/entities/active".to_string(),
            MockResponse::json(400, r#"{"error":"invalid ids"}"#),
        );
        let (base_url, captured, server) = start_mock_server(routes).await;
        let sanitizer = sanitizer_for(&base_url);
        let failures = RecordingFailures::default();

        let profiles = sanitizer
            .sanitize_profiles(vec![raw("a", "0xa", 1)], &failures)
            .await;

        assert!(profiles.is_empty());
        assert_eq!(failures.failures.lock().unwrap().len(), 1);
        assert_eq!(captured.lock().await.len(), 1);
        server.abort();
    }

    #[test]
    fn backoff_grows_and_is_capped() {
        let base = Duration::from_millis(100);
        let first = backoff_with_jitter(base, 1);
        assert!(first >= base && first <= Duration::from_millis(120));
        let second = backoff_with_jitter(base, 2);
        assert!(second >= Duration::from_millis(200));
        assert!(backoff_with_jitter(base, 20) <= Duration::from_secs(6));
    }

    #[tokio::test]
    async fn empty_input_makes_no_request() {
        let (base_url, captured, server) = start_mock_server(Routes::new()).await;
        let sanitizer = sanitizer_for(&base_url);

        let profiles = sanitizer
            .sanitize_profiles(vec![], &RecordingFailures::default())
            .await;

        assert!(profiles.is_empty());
        assert!(captured.lock().await.is_empty());
        server.abort();
    }

    #[test]
    fn non_profile_entities_are_rejected() {
        let entity = ActiveEntity {
            id: "bafy-scene".to_string(),
            entity_type: EntityType::Scene,
            pointers: vec!["0,0".to_string()],
            timestamp: 5,
            content: vec![],
            metadata: None,
        };
        let err = to_profile(&raw("bafy-scene", "0,0", 5), entity).expect_err("rejected");
        assert!(err.contains("not profile"));
    }
}
