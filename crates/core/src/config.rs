//! Runtime configuration for the profile sync service.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::errors::{Error, Result};
use crate::sync::{
    DEFAULT_BOOTSTRAP_WRITE_CONCURRENCY, DEFAULT_FAILED_FETCH_BATCH_SIZE,
    DEFAULT_HOT_CACHE_CAPACITY, FAILED_FETCH_RETRY_INTERVAL_SECS, POINTER_CHANGES_INTERVAL_SECS,
    SNAPSHOT_INTERVAL_SECS,
};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncConfig {
    pub content_server_url: String,
    pub database_path: String,
    pub bloom_expected_items: u64,
    pub bloom_false_positive_rate: f64,
    pub dedup_cache_capacity: usize,
    pub dedup_cache_ttl_secs: u64,
    pub hot_cache_capacity: usize,
    pub bootstrap_write_concurrency: usize,
    pub failed_fetch_batch_size: usize,
    pub pointer_changes_interval_secs: u64,
    pub snapshot_interval_secs: u64,
    pub failed_fetch_retry_interval_secs: u64,
    pub request_timeout_secs: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            content_server_url: String::new(),
            database_path: "./data".to_string(),
            bloom_expected_items: 2_000_000,
            bloom_false_positive_rate: 0.001,
            dedup_cache_capacity: 50_000,
            dedup_cache_ttl_secs: 300,
            hot_cache_capacity: DEFAULT_HOT_CACHE_CAPACITY,
            bootstrap_write_concurrency: DEFAULT_BOOTSTRAP_WRITE_CONCURRENCY,
            failed_fetch_batch_size: DEFAULT_FAILED_FETCH_BATCH_SIZE,
            pointer_changes_interval_secs: POINTER_CHANGES_INTERVAL_SECS,
            snapshot_interval_secs: SNAPSHOT_INTERVAL_SECS,
            failed_fetch_retry_interval_secs: FAILED_FETCH_RETRY_INTERVAL_SECS,
            request_timeout_secs: 30,
        }
    }
}

impl SyncConfig {
    /// Defaults overlaid with `CATALYST_CONTENT_URL` and `PROFILE_SYNC_*`
    /// environment variables, then validated.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`SyncConfig::from_env`] with an injectable variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };
        let mut config = Self::default();

        if let Some(url) = get("CATALYST_CONTENT_URL") {
            config.content_server_url = url.trim_end_matches('/').to_string();
        }
        if let Some(path) = get("PROFILE_SYNC_DATA_DIR") {
            config.database_path = path;
        }
        parse_into(&get, "PROFILE_SYNC_BLOOM_EXPECTED_ITEMS", &mut config.bloom_expected_items)?;
        parse_into(&get, "PROFILE_SYNC_BLOOM_FP_RATE", &mut config.bloom_false_positive_rate)?;
        parse_into(&get, "PROFILE_SYNC_DEDUP_CACHE_CAPACITY", &mut config.dedup_cache_capacity)?;
        parse_into(&get, "PROFILE_SYNC_DEDUP_CACHE_TTL_SECS", &mut config.dedup_cache_ttl_secs)?;
        parse_into(&get, "PROFILE_SYNC_HOT_CACHE_CAPACITY", &mut config.hot_cache_capacity)?;
        parse_into(
            &get,
            "PROFILE_SYNC_BOOTSTRAP_CONCURRENCY",
            &mut config.bootstrap_write_concurrency,
        )?;
        parse_into(&get, "PROFILE_SYNC_FAILED_FETCH_BATCH", &mut config.failed_fetch_batch_size)?;
        parse_into(
            &get,
            "PROFILE_SYNC_POINTER_CHANGES_INTERVAL_SECS",
            &mut config.pointer_changes_interval_secs,
        )?;
        parse_into(
            &get,
            "PROFILE_SYNC_SNAPSHOT_INTERVAL_SECS",
            &mut config.snapshot_interval_secs,
        )?;
        parse_into(
            &get,
            "PROFILE_SYNC_FAILED_FETCH_INTERVAL_SECS",
            &mut config.failed_fetch_retry_interval_secs,
        )?;
        parse_into(
            &get,
            "PROFILE_SYNC_REQUEST_TIMEOUT_SECS",
            &mut config.request_timeout_secs,
        )?;

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.content_server_url.trim().is_empty() {
            return Err(Error::config(
                "CATALYST_CONTENT_URL not configured. Profile sync is disabled.",
            ));
        }
        if !(self.bloom_false_positive_rate > 0.0 && self.bloom_false_positive_rate < 1.0) {
            return Err(Error::config(format!(
                "Bloom false positive rate must be within (0, 1), got {}",
                self.bloom_false_positive_rate
            )));
        }
        if self.bloom_expected_items == 0 {
            return Err(Error::config("bloom_expected_items must be greater than zero"));
        }
        for (name, value) in [
            ("dedup_cache_capacity", self.dedup_cache_capacity),
            ("hot_cache_capacity", self.hot_cache_capacity),
            ("bootstrap_write_concurrency", self.bootstrap_write_concurrency),
            ("failed_fetch_batch_size", self.failed_fetch_batch_size),
        ] {
            if value == 0 {
                return Err(Error::config(format!("{} must be greater than zero", name)));
            }
        }
        Ok(())
    }

    pub fn pointer_changes_interval(&self) -> Duration {
        Duration::from_secs(self.pointer_changes_interval_secs)
    }

    pub fn snapshot_interval(&self) -> Duration {
        Duration::from_secs(self.snapshot_interval_secs)
    }

    pub fn failed_fetch_retry_interval(&self) -> Duration {
        Duration::from_secs(self.failed_fetch_retry_interval_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

fn parse_into<T, G>(get: &G, key: &str, target: &mut T) -> Result<()>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
    G: Fn(&str) -> Option<String>,
{
    if let Some(raw) = get(key) {
        *target = raw
            .parse::<T>()
            .map_err(|e| Error::config(format!("Invalid value '{}' for {}: {}", raw, key, e)))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_follow_sizing_guidance() {
        let config = SyncConfig::default();
        assert_eq!(config.bloom_expected_items, 2_000_000);
        assert_eq!(config.bloom_false_positive_rate, 0.001);
        assert_eq!(config.hot_cache_capacity, 10_000);
        assert_eq!(config.bootstrap_write_concurrency, 30);
        assert_eq!(config.failed_fetch_batch_size, 50);
    }

    #[test]
    fn env_overrides_are_applied() {
        let config = SyncConfig::from_lookup(lookup_from(&[
            ("CATALYST_CONTENT_URL", "https://peer.example.org/"),
            ("PROFILE_SYNC_HOT_CACHE_CAPACITY", "25"),
            ("PROFILE_SYNC_BLOOM_FP_RATE", "0.0001"),
        ]))
        .expect("config");

        assert_eq!(config.content_server_url, "https://peer.example.org");
        assert_eq!(config.hot_cache_capacity, 25);
        assert_eq!(config.bloom_false_positive_rate, 0.0001);
    }

    #[test]
    fn missing_content_url_is_rejected() {
        let err = SyncConfig::from_lookup(lookup_from(&[])).expect_err("missing url");
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn invalid_numbers_are_rejected() {
        let err = SyncConfig::from_lookup(lookup_from(&[
            ("CATALYST_CONTENT_URL", "https://peer.example.org"),
            ("PROFILE_SYNC_BOOTSTRAP_CONCURRENCY", "many"),
        ]))
        .expect_err("invalid number");
        assert!(err.to_string().contains("PROFILE_SYNC_BOOTSTRAP_CONCURRENCY"));
    }

    #[test]
    fn zero_capacity_is_rejected() {
        let config = SyncConfig {
            content_server_url: "https://peer.example.org".to_string(),
            hot_cache_capacity: 0,
            ..SyncConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn bloom_item_count_is_checked_without_narrowing() {
        let large = SyncConfig {
            content_server_url: "https://peer.example.org".to_string(),
            bloom_expected_items: 1 << 32,
            ..SyncConfig::default()
        };
        assert!(large.validate().is_ok());

        let zero = SyncConfig {
            bloom_expected_items: 0,
            ..large
        };
        let err = zero.validate().expect_err("zero items");
        assert!(err.to_string().contains("bloom_expected_items"));
    }

    #[test]
    fn false_positive_rate_must_be_a_probability() {
        let config = SyncConfig {
            content_server_url: "https://peer.example.org".to_string(),
            bloom_false_positive_rate: 1.5,
            ..SyncConfig::default()
        };
        assert!(config.validate().is_err());
    }
}
