use std::time::Duration;

use async_trait::async_trait;
use redis::AsyncCommands;
use thiserror::Error;
use tokio::time::timeout;

#[derive(Error, Debug)]
pub enum CacheError {
    /// The key does not exist or has expired.
    #[error("not found in cache")]
    NotFound,
    #[error("cache command timed out")]
    Timeout,
    #[error("cache transport error: {0}")]
    Transport(#[from] redis::RedisError),
}

/// A string key-value cache with per-key expiry.
/// A miss is reported as `CacheError::NotFound`, not as an empty value.
#[async_trait]
pub trait KeyValueCache {
    async fn get(&self, key: &str) -> Result<String, CacheError>;
    async fn set(&self, key: &str, value: String, ttl: Duration) -> Result<(), CacheError>;
    async fn delete(&self, keys: &[String]) -> Result<(), CacheError>;
}

pub struct RedisCache {
    client: redis::Client,
    command_timeout: Duration,
}

impl RedisCache {
    pub fn new(addr: &str, command_timeout: Duration) -> Result<RedisCache, CacheError> {
        let client = redis::Client::open(addr)?;

        Ok(RedisCache {
            client,
            command_timeout,
        })
    }
}

/// Expiry in milliseconds for PSETEX, which rejects a zero expiry.
fn ttl_millis(ttl: Duration) -> usize {
    usize::try_from(ttl.as_millis().max(1)).unwrap_or(usize::MAX)
}

#[async_trait]
impl KeyValueCache for RedisCache {
    async fn get(&self, key: &str) -> Result<String, CacheError> {
        let command = async {
            let mut conn = self.client.get_async_connection().await?;
            conn.get::<_, Option<String>>(key).await
        };
        let value = timeout(self.command_timeout, command)
            .await
            .map_err(|_| CacheError::Timeout)??;

        value.ok_or(CacheError::NotFound)
    }

    async fn set(&self, key: &str, value: String, ttl: Duration) -> Result<(), CacheError> {
        let command = async {
            let mut conn = self.client.get_async_connection().await?;
            conn.pset_ex::<_, _, ()>(key, value, ttl_millis(ttl)).await
        };
        timeout(self.command_timeout, command)
            .await
            .map_err(|_| CacheError::Timeout)??;

        Ok(())
    }

    async fn delete(&self, keys: &[String]) -> Result<(), CacheError> {
        if keys.is_empty() {
            return Ok(());
        }
        let command = async {
            let mut conn = self.client.get_async_connection().await?;
            conn.del::<_, ()>(keys).await
        };
        timeout(self.command_timeout, command)
            .await
            .map_err(|_| CacheError::Timeout)??;

        Ok(())
    }
}
