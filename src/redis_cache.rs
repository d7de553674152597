//! Redis-backed fast cache.
//!
//! Entries are stored as `{"algo": ..., "hash": ...}` JSON strings with a
//! per-key expiry (`SET key value EX ttl`). The connection is opened on first
//! use; a failed attempt leaves the cell empty so the next call retries.

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use tokio::sync::OnceCell;

use crate::models::CacheEntry;
use crate::traits::FastCache;

pub struct RedisCache {
    client: redis::Client,
    conn: OnceCell<ConnectionManager>,
    timeout: Duration,
}

impl RedisCache {
    /// Parse `url` without connecting.
    pub fn new(url: &str, timeout: Duration) -> Result<Self> {
        let client =
            redis::Client::open(url).with_context(|| format!("Invalid Redis URL: {}", url))?;
        Ok(Self {
            client,
            conn: OnceCell::new(),
            timeout,
        })
    }

    async fn connection(&self) -> Result<ConnectionManager> {
        let conn = self
            .conn
            .get_or_try_init(|| async {
                let manager = tokio::time::timeout(self.timeout, self.client.get_connection_manager())
                    .await
                    .context("timed out connecting to Redis")??;
                tracing::info!("connected to Redis");
                Ok::<_, anyhow::Error>(manager)
            })
            .await?;
        Ok(conn.clone())
    }
}

#[async_trait]
impl FastCache for RedisCache {
    async fn get(&self, key: &str) -> Result<Option<CacheEntry>> {
        let mut conn = self.connection().await?;
        let raw = tokio::time::timeout(self.timeout, conn.get::<_, Option<String>>(key))
            .await
            .context("Redis GET timed out")??;
        Ok(raw.as_deref().and_then(CacheEntry::from_json))
    }

    async fn set(&self, key: &str, entry: &CacheEntry, ttl: Duration) -> Result<()> {
        let mut conn = self.connection().await?;
        let secs = ttl.as_secs().max(1);
        tokio::time::timeout(
            self.timeout,
            conn.set_ex::<_, _, ()>(key, entry.to_json(), secs),
        )
        .await
        .context("Redis SET timed out")??;
        Ok(())
    }
}
