//! Shared infrastructure handles.
//!
//! A [`Gateway`] is built once at startup and passed to every handler. It
//! owns the fast cache (L1), the identity store (L2), and the durable event
//! log, each behind its capability trait. A tier that is not configured is
//! `None`, which callers treat the same as a tier that is down.
//!
//! Backends are selected by URL:
//!
//! | URL | Backend |
//! |-----|---------|
//! | empty | tier disabled |
//! | `memory://` | in-process ([`crate::memory`]) |
//! | `redis://...` | [`RedisCache`] |
//! | `mysql://...`, `sqlite:...` | [`SqlIdentityStore`] |
//! | `nats://...` | [`JetStreamLog`] |
//!
//! No backend connects during construction; each opens its connection on
//! first use and retries on the next call if that fails.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;

use crate::config::{Config, StreamConfig};
use crate::db::{SqlIdentityStore, DEFAULT_MAX_CONNECTIONS};
use crate::event_log::JetStreamLog;
use crate::memory::{MemoryCache, MemoryLog, MemoryStore};
use crate::redis_cache::RedisCache;
use crate::traits::{EventLog, FastCache, IdentityStore};

const MEMORY_URL: &str = "memory://";

/// Tunables for the streaming bridge.
#[derive(Debug, Clone)]
pub struct StreamSettings {
    pub default_batch: usize,
    pub max_batch: usize,
    pub fetch_timeout: Duration,
    pub idle_backoff: Duration,
}

impl Default for StreamSettings {
    fn default() -> Self {
        Self::from(&StreamConfig::default())
    }
}

impl From<&StreamConfig> for StreamSettings {
    fn from(config: &StreamConfig) -> Self {
        Self {
            default_batch: config.default_batch,
            max_batch: config.max_batch,
            fetch_timeout: Duration::from_millis(config.fetch_timeout_ms),
            idle_backoff: Duration::from_millis(config.idle_backoff_ms),
        }
    }
}

#[derive(Clone)]
pub struct Gateway {
    cache: Option<Arc<dyn FastCache>>,
    store: Option<Arc<dyn IdentityStore>>,
    log: Option<Arc<dyn EventLog>>,
    default_ttl: Duration,
    default_subject: String,
    stream: StreamSettings,
    l2_concurrency: usize,
}

impl Gateway {
    /// A gateway with every tier disabled.
    pub fn new(default_ttl: Duration, default_subject: impl Into<String>) -> Self {
        Self {
            cache: None,
            store: None,
            log: None,
            default_ttl,
            default_subject: default_subject.into(),
            stream: StreamSettings::default(),
            l2_concurrency: DEFAULT_MAX_CONNECTIONS as usize,
        }
    }

    pub fn with_cache(mut self, cache: Arc<dyn FastCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn with_store(mut self, store: Arc<dyn IdentityStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_log(mut self, log: Arc<dyn EventLog>) -> Self {
        self.log = Some(log);
        self
    }

    pub fn with_stream_settings(mut self, stream: StreamSettings) -> Self {
        self.stream = stream;
        self
    }

    /// Cap on L2 lookups in flight for one probe batch. Matches the store's
    /// pool size so lookups never queue behind each other's timeouts.
    pub fn with_l2_concurrency(mut self, limit: usize) -> Self {
        self.l2_concurrency = limit.max(1);
        self
    }

    /// Build every configured backend from `config`.
    pub fn from_config(config: &Config) -> Result<Self> {
        let mut gateway = Self::new(config.cache.default_ttl(), config.nats.default_subject.clone())
            .with_stream_settings(StreamSettings::from(&config.stream))
            .with_l2_concurrency(config.db.max_connections as usize);

        let cache_url = config.cache.url.trim();
        if cache_url == MEMORY_URL {
            gateway = gateway.with_cache(Arc::new(MemoryCache::new(config.cache.memory_capacity)));
        } else if !cache_url.is_empty() {
            let timeout = Duration::from_millis(config.cache.timeout_ms);
            gateway = gateway.with_cache(Arc::new(RedisCache::new(cache_url, timeout)?));
        }

        let db_url = config.db.url.trim();
        if db_url == MEMORY_URL {
            gateway = gateway.with_store(Arc::new(MemoryStore::new(config.db.match_inode)));
        } else if !db_url.is_empty() {
            let store = SqlIdentityStore::new(
                db_url,
                config.db.match_inode,
                Duration::from_millis(config.db.timeout_ms),
            )
            .with_max_connections(config.db.max_connections);
            gateway = gateway.with_store(Arc::new(store));
        }

        let nats_url = config.nats.url.trim();
        if nats_url == MEMORY_URL {
            gateway = gateway.with_log(Arc::new(MemoryLog::new()));
        } else if !nats_url.is_empty() {
            gateway = gateway.with_log(Arc::new(JetStreamLog::new(
                nats_url,
                &config.nats.stream,
                Duration::from_millis(config.nats.timeout_ms),
            )));
        }

        tracing::info!(
            l1 = gateway.cache.is_some(),
            l2 = gateway.store.is_some(),
            log = gateway.log.is_some(),
            "gateway tiers configured"
        );
        Ok(gateway)
    }

    pub fn cache(&self) -> Option<&dyn FastCache> {
        self.cache.as_deref()
    }

    pub fn store(&self) -> Option<&dyn IdentityStore> {
        self.store.as_deref()
    }

    pub fn log(&self) -> Option<Arc<dyn EventLog>> {
        self.log.clone()
    }

    pub fn default_ttl(&self) -> Duration {
        self.default_ttl
    }

    pub fn default_subject(&self) -> &str {
        &self.default_subject
    }

    pub fn stream_settings(&self) -> &StreamSettings {
        &self.stream
    }

    pub fn l2_concurrency(&self) -> usize {
        self.l2_concurrency
    }
}
