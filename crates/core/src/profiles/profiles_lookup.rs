//! Read-through profile lookups: hot cache first, durable store for misses.

use log::debug;
use std::collections::HashMap;
use std::sync::Arc;

use super::profiles_model::{normalize_pointer, ProfileEntity};
use super::profiles_traits::ProfileRepositoryTrait;
use crate::errors::Result;
use crate::sync::HotCache;

pub struct ProfileLookup {
    hot_cache: Arc<HotCache<ProfileEntity>>,
    repository: Arc<dyn ProfileRepositoryTrait>,
}

impl ProfileLookup {
    pub fn new(
        hot_cache: Arc<HotCache<ProfileEntity>>,
        repository: Arc<dyn ProfileRepositoryTrait>,
    ) -> Self {
        Self {
            hot_cache,
            repository,
        }
    }

    pub async fn get_profile(&self, pointer: &str) -> Result<Option<ProfileEntity>> {
        let mut found = self.get_profiles(&[pointer.to_string()]).await?;
        Ok(found.remove(&normalize_pointer(pointer)))
    }

    /// Profiles keyed by normalized pointer. Store hits warm the cache.
    pub async fn get_profiles(&self, pointers: &[String]) -> Result<HashMap<String, ProfileEntity>> {
        let mut found = self.hot_cache.get_many(pointers);

        let mut misses: Vec<String> = pointers
            .iter()
            .map(|p| normalize_pointer(p))
            .filter(|p| !found.contains_key(p))
            .collect();
        misses.sort();
        misses.dedup();
        if misses.is_empty() {
            return Ok(found);
        }

        let stored = self.repository.get_profiles_by_pointers(&misses).await?;
        debug!(
            "[ProfileLookup] {} cache hits, {} store hits of {} misses",
            found.len(),
            stored.len(),
            misses.len()
        );
        let profiles: Vec<ProfileEntity> = stored.into_iter().map(|r| r.profile).collect();
        for profile in &profiles {
            found.insert(profile.pointer.clone(), profile.clone());
        }
        self.hot_cache.set_many_if_newer(profiles);

        Ok(found)
    }
}
