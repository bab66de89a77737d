use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, error, instrument, warn};

use crate::cache::{CacheError, KeyValueCache};
use crate::person::Person;
use crate::store::{PersonStore, StoreError};

pub const PERSON_LIST_KEY: &str = "persons";

pub fn person_key(id: u64) -> String {
    format!("person:{}", id)
}

/// Cache-aside reads over a PersonStore.
///
/// Reads check the cache first, fall back to the store on a miss, and populate
/// the cache afterwards. Writes never touch the cache: an entry is only replaced
/// once its TTL expires, so a read can be stale for up to one TTL after a write.
#[derive(Clone)]
pub struct CacheAsideReader {
    store: Arc<dyn PersonStore + Send + Sync>,
    cache: Option<Arc<dyn KeyValueCache + Send + Sync>>,
    ttl: Duration,
}

impl CacheAsideReader {
    /// Passing no cache degrades every read to a direct store call.
    pub fn new(
        store: Arc<dyn PersonStore + Send + Sync>,
        cache: Option<Arc<dyn KeyValueCache + Send + Sync>>,
        ttl: Duration,
    ) -> Self {
        Self { store, cache, ttl }
    }

    #[instrument(skip(self))]
    pub async fn get_by_id(&self, id: u64) -> Result<Person, StoreError> {
        self.read_through(&person_key(id), || self.store.get(id))
            .await
    }

    #[instrument(skip(self))]
    pub async fn get_list(&self) -> Result<Vec<Person>, StoreError> {
        self.read_through(PERSON_LIST_KEY, || self.store.list())
            .await
    }

    async fn read_through<T, F, Fut>(&self, key: &str, load: F) -> Result<T, StoreError>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, StoreError>>,
    {
        let Some(cache) = &self.cache else {
            return load().await;
        };

        match cache.get(key).await {
            Ok(cached) => match serde_json::from_str::<T>(&cached) {
                Ok(value) => {
                    metrics::counter!("person_cache_reads_total", "result" => "hit").increment(1);
                    return Ok(value);
                }
                Err(e) => {
                    // Falls through to the store, the entry is overwritten below.
                    metrics::counter!("person_cache_reads_total", "result" => "corrupt")
                        .increment(1);
                    warn!(key, "failed to decode cached value: {}", e);
                }
            },
            Err(CacheError::NotFound) => {
                metrics::counter!("person_cache_reads_total", "result" => "miss").increment(1);
                debug!(key, "cache miss");
            }
            Err(e) => {
                metrics::counter!("person_cache_reads_total", "result" => "error").increment(1);
                warn!(key, "cache read failed, reading from store: {}", e);
            }
        }

        let value = load().await?;
        self.populate(cache.as_ref(), key, &value).await;
        Ok(value)
    }

    /// Population is best effort, a failure here never fails the read.
    async fn populate<T: Serialize>(
        &self,
        cache: &(dyn KeyValueCache + Send + Sync),
        key: &str,
        value: &T,
    ) {
        let serialized = match serde_json::to_string(value) {
            Ok(serialized) => serialized,
            Err(e) => {
                metrics::counter!("person_cache_population_failures_total").increment(1);
                error!(key, "failed to serialize value for caching: {}", e);
                return;
            }
        };

        if let Err(e) = cache.set(key, serialized, self.ttl).await {
            metrics::counter!("person_cache_population_failures_total").increment(1);
            error!(key, "person caching failed: {}", e);
        }
    }
}
