use std::{collections::HashMap, future::Future, hash::Hash, time::Duration};

use tokio::{sync::Mutex, time::Instant};
use tracing::debug;

pub mod keys {
    pub const PROFILE_SUMMARY: &str = "profile-summary";
    pub const PROFILE_EDIT_FORM: &str = "profile-edit-form";
    pub const CONVERSATIONS: &str = "conversations";
    pub const NOTIFICATIONS: &str = "notifications";
}

struct CacheEntry<V> {
    value: V,
    expires_at: Instant,
}

struct CacheState<K, V> {
    entries: HashMap<K, CacheEntry<V>>,
    // Bumped by every invalidation; a fetch that started before it does not
    // get stored.
    generation: u64,
}

pub struct ExpiringCache<V, K = String> {
    inner: Mutex<CacheState<K, V>>,
}

impl<V, K> Default for ExpiringCache<V, K>
where
    K: Eq + Hash,
{
    fn default() -> Self {
        Self {
            inner: Mutex::new(CacheState {
                entries: HashMap::new(),
                generation: 0,
            }),
        }
    }
}

impl<V, K> ExpiringCache<V, K>
where
    V: Clone,
    K: Eq + Hash + Clone + std::fmt::Debug,
{
    pub fn new() -> Self {
        Self::default()
    }

    /// A stale entry is evicted and reported as a miss.
    pub async fn get(&self, key: &K) -> Option<V> {
        let mut state = self.inner.lock().await;
        Self::live(&mut state, key)
    }

    fn live(state: &mut CacheState<K, V>, key: &K) -> Option<V> {
        let expired = match state.entries.get(key) {
            Some(entry) if Instant::now() < entry.expires_at => {
                return Some(entry.value.clone());
            }
            Some(_) => true,
            None => false,
        };
        if expired {
            state.entries.remove(key);
            debug!(?key, "cache: evicted stale entry");
        }
        None
    }

    pub async fn set(&self, key: K, value: V, ttl: Duration) {
        let expires_at = Instant::now() + ttl;
        self.inner
            .lock()
            .await
            .entries
            .insert(key, CacheEntry { value, expires_at });
    }

    /// Removes `key`, or every entry when `key` is `None`.
    pub async fn invalidate(&self, key: Option<&K>) {
        let mut state = self.inner.lock().await;
        state.generation += 1;
        match key {
            Some(key) => {
                if state.entries.remove(key).is_some() {
                    debug!(?key, "cache: invalidated");
                }
            }
            None => {
                debug!(count = state.entries.len(), "cache: cleared");
                state.entries.clear();
            }
        }
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.entries.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.lock().await.entries.is_empty()
    }

    /// Failed fetches are not cached, and neither are results of fetches
    /// overtaken by an invalidation. Concurrent misses on one key both fetch.
    pub async fn get_or_fetch<F, Fut, E>(&self, key: K, ttl: Duration, fetch: F) -> Result<V, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, E>>,
    {
        let generation = {
            let mut state = self.inner.lock().await;
            if let Some(value) = Self::live(&mut state, &key) {
                return Ok(value);
            }
            state.generation
        };
        let value = fetch().await?;

        let mut state = self.inner.lock().await;
        if state.generation == generation {
            let expires_at = Instant::now() + ttl;
            state.entries.insert(
                key,
                CacheEntry {
                    value: value.clone(),
                    expires_at,
                },
            );
        } else {
            debug!(?key, "cache: result of an invalidated fetch dropped");
        }
        Ok(value)
    }
}

#[cfg(test)]
#[path = "tests/cache_tests.rs"]
mod tests;
