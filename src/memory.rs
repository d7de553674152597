//! In-process implementations of every tier.
//!
//! - [`MemoryCache`] is a bounded `moka` cache honoring per-entry TTL. It is
//!   selected with `cache.url = "memory://"` for single-node deployments.
//! - [`MemoryStore`] holds identity rows in a `Vec` behind a `RwLock`.
//! - [`MemoryLog`] keeps appended messages per subject and models durable
//!   consumers with leases: a fetched message that is dropped without an ack
//!   goes back on its consumer's redelivery queue.
//!
//! Each type can be switched "unavailable" so tests can exercise the
//! degraded paths, and counts the calls tests need to assert on.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::{Duration, Instant};

use anyhow::{bail, Result};
use async_trait::async_trait;
use moka::sync::Cache;
use moka::Expiry;

use crate::cache_key::mtime_secs;
use crate::models::{CacheEntry, EventEnvelope, FileObservation, IngestEvent};
use crate::traits::{EventLog, FastCache, IdentityStore, LogConsumer, LogMessage};

// ============ L1 ============

#[derive(Clone)]
struct StoredEntry {
    entry: CacheEntry,
    ttl: Duration,
}

struct EntryTtl;

impl Expiry<String, StoredEntry> for EntryTtl {
    fn expire_after_create(
        &self,
        _key: &String,
        value: &StoredEntry,
        _created_at: Instant,
    ) -> Option<Duration> {
        Some(value.ttl)
    }

    fn expire_after_update(
        &self,
        _key: &String,
        value: &StoredEntry,
        _updated_at: Instant,
        _duration_until_expiry: Option<Duration>,
    ) -> Option<Duration> {
        Some(value.ttl)
    }
}

/// Bounded in-process fast cache.
pub struct MemoryCache {
    cache: Cache<String, StoredEntry>,
    unavailable: AtomicBool,
    gets: AtomicUsize,
    sets: AtomicUsize,
}

impl MemoryCache {
    pub fn new(capacity: u64) -> Self {
        Self {
            cache: Cache::builder()
                .max_capacity(capacity)
                .expire_after(EntryTtl)
                .build(),
            unavailable: AtomicBool::new(false),
            gets: AtomicUsize::new(0),
            sets: AtomicUsize::new(0),
        }
    }

    /// Make every subsequent call fail, as if the backing server went away.
    pub fn set_unavailable(&self, down: bool) {
        self.unavailable.store(down, Ordering::SeqCst);
    }

    pub fn get_count(&self) -> usize {
        self.gets.load(Ordering::SeqCst)
    }

    pub fn set_count(&self) -> usize {
        self.sets.load(Ordering::SeqCst)
    }

    /// Entry currently stored under `key`, bypassing counters and failure injection.
    pub fn peek(&self, key: &str) -> Option<CacheEntry> {
        self.cache.get(key).map(|s| s.entry)
    }
}

impl Default for MemoryCache {
    fn default() -> Self {
        Self::new(100_000)
    }
}

#[async_trait]
impl FastCache for MemoryCache {
    async fn get(&self, key: &str) -> Result<Option<CacheEntry>> {
        self.gets.fetch_add(1, Ordering::SeqCst);
        if self.unavailable.load(Ordering::SeqCst) {
            bail!("memory cache unavailable");
        }
        Ok(self.cache.get(key).map(|s| s.entry))
    }

    async fn set(&self, key: &str, entry: &CacheEntry, ttl: Duration) -> Result<()> {
        self.sets.fetch_add(1, Ordering::SeqCst);
        if self.unavailable.load(Ordering::SeqCst) {
            bail!("memory cache unavailable");
        }
        self.cache.insert(
            key.to_string(),
            StoredEntry {
                entry: entry.clone(),
                ttl,
            },
        );
        Ok(())
    }
}

// ============ L2 ============

/// One row of the identity table.
#[derive(Debug, Clone)]
pub struct StoredRow {
    pub path: String,
    pub size: u64,
    pub mtime: i64,
    pub dev: Option<u64>,
    pub inode: Option<u64>,
    pub algo: Option<String>,
    pub hash: Option<String>,
}

impl StoredRow {
    pub fn new(path: &str, size: u64, mtime: i64, algo: &str, hash: &str) -> Self {
        Self {
            path: path.to_string(),
            size,
            mtime,
            dev: None,
            inode: None,
            algo: Some(algo.to_string()),
            hash: Some(hash.to_string()),
        }
    }
}

/// In-memory identity store.
pub struct MemoryStore {
    rows: RwLock<Vec<StoredRow>>,
    match_inode: bool,
    unavailable: AtomicBool,
    lookups: AtomicUsize,
}

impl MemoryStore {
    pub fn new(match_inode: bool) -> Self {
        Self {
            rows: RwLock::new(Vec::new()),
            match_inode,
            unavailable: AtomicBool::new(false),
            lookups: AtomicUsize::new(0),
        }
    }

    pub fn insert(&self, row: StoredRow) {
        self.rows
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(row);
    }

    pub fn set_unavailable(&self, down: bool) {
        self.unavailable.store(down, Ordering::SeqCst);
    }

    pub fn lookup_count(&self) -> usize {
        self.lookups.load(Ordering::SeqCst)
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new(false)
    }
}

#[async_trait]
impl IdentityStore for MemoryStore {
    async fn lookup(&self, obs: &FileObservation) -> Result<Option<CacheEntry>> {
        self.lookups.fetch_add(1, Ordering::SeqCst);
        if self.unavailable.load(Ordering::SeqCst) {
            bail!("memory store unavailable");
        }
        let mtime = mtime_secs(obs.mtime);
        let identity = if self.match_inode {
            obs.inode_identity()
        } else {
            None
        };
        let rows = self.rows.read().unwrap_or_else(PoisonError::into_inner);
        let row = rows.iter().find(|r| {
            r.path == obs.path
                && r.size == obs.size
                && r.mtime == mtime
                && identity.map_or(true, |(dev, inode)| {
                    r.dev == Some(dev) && r.inode == Some(inode)
                })
        });
        Ok(row.and_then(|r| CacheEntry::from_parts(r.algo.clone(), r.hash.clone())))
    }
}

// ============ Durable log ============

#[derive(Default)]
struct ConsumerState {
    subject: String,
    /// Next never-delivered sequence on the subject.
    next: usize,
    /// Sequences whose lease lapsed without an ack.
    redeliver: VecDeque<usize>,
    acked: Vec<usize>,
    /// Messages fetched and not yet acked or dropped.
    in_flight: usize,
    fetches: usize,
    /// Largest `in_flight` observed at the start of a fetch.
    max_in_flight_at_fetch: usize,
    redelivered: usize,
}

#[derive(Default)]
struct LogState {
    streams: HashSet<String>,
    messages: HashMap<String, Vec<Vec<u8>>>,
    consumers: HashMap<String, ConsumerState>,
}

/// Snapshot of one durable consumer, for assertions.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConsumerStats {
    pub fetches: usize,
    pub acked: Vec<usize>,
    pub in_flight: usize,
    pub max_in_flight_at_fetch: usize,
    pub redelivered: usize,
}

/// In-memory durable log.
#[derive(Clone, Default)]
pub struct MemoryLog {
    state: Arc<Mutex<LogState>>,
    unavailable: Arc<AtomicBool>,
    reject_consumers: Arc<AtomicBool>,
}

impl MemoryLog {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, LogState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn set_unavailable(&self, down: bool) {
        self.unavailable.store(down, Ordering::SeqCst);
    }

    /// Refuse consumer creation while leaving appends working.
    pub fn set_reject_consumers(&self, reject: bool) {
        self.reject_consumers.store(reject, Ordering::SeqCst);
    }

    /// Append a raw payload, bypassing event encoding.
    pub fn push_raw(&self, subject: &str, payload: &[u8]) {
        let mut state = self.lock();
        state.streams.insert(subject.to_string());
        state
            .messages
            .entry(subject.to_string())
            .or_default()
            .push(payload.to_vec());
    }

    /// All payloads appended under `subject`, in order.
    pub fn messages(&self, subject: &str) -> Vec<Vec<u8>> {
        self.lock().messages.get(subject).cloned().unwrap_or_default()
    }

    pub fn has_stream(&self, subject: &str) -> bool {
        self.lock().streams.contains(subject)
    }

    pub fn consumer_stats(&self, durable: &str) -> Option<ConsumerStats> {
        self.lock().consumers.get(durable).map(|c| ConsumerStats {
            fetches: c.fetches,
            acked: c.acked.clone(),
            in_flight: c.in_flight,
            max_in_flight_at_fetch: c.max_in_flight_at_fetch,
            redelivered: c.redelivered,
        })
    }

    fn check_available(&self) -> Result<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            bail!("memory log unavailable");
        }
        Ok(())
    }
}

#[async_trait]
impl EventLog for MemoryLog {
    async fn append(&self, subject: &str, events: &[IngestEvent]) -> Result<()> {
        self.check_available()?;
        let payload = EventEnvelope::encode(events)?;
        self.push_raw(subject, &payload);
        Ok(())
    }

    async fn ensure_stream(&self, subject: &str) -> Result<()> {
        self.check_available()?;
        self.lock().streams.insert(subject.to_string());
        Ok(())
    }

    async fn open_consumer(&self, subject: &str, durable: &str) -> Result<Box<dyn LogConsumer>> {
        self.check_available()?;
        if self.reject_consumers.load(Ordering::SeqCst) {
            bail!("consumer creation rejected for durable {}", durable);
        }
        self.lock()
            .consumers
            .entry(durable.to_string())
            .or_insert_with(|| ConsumerState {
                subject: subject.to_string(),
                ..Default::default()
            });
        Ok(Box::new(MemoryConsumer {
            log: self.clone(),
            durable: durable.to_string(),
        }))
    }
}

struct MemoryConsumer {
    log: MemoryLog,
    durable: String,
}

#[async_trait]
impl LogConsumer for MemoryConsumer {
    async fn fetch(&mut self, max: usize, wait: Duration) -> Result<Vec<Box<dyn LogMessage>>> {
        self.log.check_available()?;
        let batch = {
            let mut guard = self.log.lock();
            let state = &mut *guard;
            let consumer = match state.consumers.get_mut(&self.durable) {
                Some(c) => c,
                None => bail!("durable consumer {} was deleted", self.durable),
            };
            consumer.fetches += 1;
            consumer.max_in_flight_at_fetch =
                consumer.max_in_flight_at_fetch.max(consumer.in_flight);

            let messages = state
                .messages
                .get(&consumer.subject)
                .map(Vec::as_slice)
                .unwrap_or(&[]);
            let mut batch = Vec::new();
            while batch.len() < max {
                if let Some(seq) = consumer.redeliver.pop_front() {
                    consumer.redelivered += 1;
                    batch.push((seq, messages[seq].clone()));
                } else if consumer.next < messages.len() {
                    let seq = consumer.next;
                    consumer.next += 1;
                    batch.push((seq, messages[seq].clone()));
                } else {
                    break;
                }
            }
            consumer.in_flight += batch.len();
            batch
        };

        if batch.is_empty() {
            tokio::time::sleep(wait).await;
        }

        Ok(batch
            .into_iter()
            .map(|(seq, payload)| {
                Box::new(MemoryMessage {
                    log: self.log.clone(),
                    durable: self.durable.clone(),
                    seq,
                    payload,
                    acked: AtomicBool::new(false),
                }) as Box<dyn LogMessage>
            })
            .collect())
    }
}

struct MemoryMessage {
    log: MemoryLog,
    durable: String,
    seq: usize,
    payload: Vec<u8>,
    acked: AtomicBool,
}

#[async_trait]
impl LogMessage for MemoryMessage {
    fn payload(&self) -> &[u8] {
        &self.payload
    }

    async fn ack(&self) -> Result<()> {
        self.log.check_available()?;
        if !self.acked.swap(true, Ordering::SeqCst) {
            if let Some(c) = self.log.lock().consumers.get_mut(&self.durable) {
                c.acked.push(self.seq);
            }
        }
        Ok(())
    }
}

impl Drop for MemoryMessage {
    fn drop(&mut self) {
        let acked = self.acked.load(Ordering::SeqCst);
        if let Some(c) = self.log.lock().consumers.get_mut(&self.durable) {
            c.in_flight = c.in_flight.saturating_sub(1);
            if !acked {
                // lease lapses immediately
                c.redeliver.push_back(self.seq);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn obs(path: &str, size: u64, mtime: f64) -> FileObservation {
        FileObservation {
            path: path.to_string(),
            size,
            mtime,
            dev: None,
            inode: None,
        }
    }

    #[tokio::test]
    async fn test_cache_set_get() {
        let cache = MemoryCache::default();
        let entry = CacheEntry::new("blake3", "abc").unwrap();
        cache.set("k", &entry, Duration::from_secs(60)).await.unwrap();
        assert_eq!(cache.get("k").await.unwrap(), Some(entry));
        assert_eq!(cache.get("missing").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_cache_entry_expires() {
        let cache = MemoryCache::default();
        let entry = CacheEntry::new("blake3", "abc").unwrap();
        cache
            .set("k", &entry, Duration::from_millis(20))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(cache.get("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_cache_unavailable_errors() {
        let cache = MemoryCache::default();
        cache.set_unavailable(true);
        assert!(cache.get("k").await.is_err());
    }

    #[tokio::test]
    async fn test_store_matches_full_identity() {
        let store = MemoryStore::default();
        store.insert(StoredRow::new("/a", 10, 100, "blake3", "abc"));

        assert!(store.lookup(&obs("/a", 10, 100.7)).await.unwrap().is_some());
        assert!(store.lookup(&obs("/a", 11, 100.0)).await.unwrap().is_none());
        assert!(store.lookup(&obs("/a", 10, 101.0)).await.unwrap().is_none());
        assert!(store.lookup(&obs("/b", 10, 100.0)).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_store_incomplete_row_is_absent() {
        let store = MemoryStore::default();
        let mut row = StoredRow::new("/a", 10, 100, "blake3", "abc");
        row.hash = None;
        store.insert(row);
        assert!(store.lookup(&obs("/a", 10, 100.0)).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_store_inode_narrowing() {
        let store = MemoryStore::new(true);
        let mut row = StoredRow::new("/a", 10, 100, "blake3", "abc");
        row.dev = Some(1);
        row.inode = Some(2);
        store.insert(row);

        let mut probe = obs("/a", 10, 100.0);
        probe.dev = Some(1);
        probe.inode = Some(3);
        assert!(store.lookup(&probe).await.unwrap().is_none());
        probe.inode = Some(2);
        assert!(store.lookup(&probe).await.unwrap().is_some());
        // no identity on the probe: path match is enough
        assert!(store.lookup(&obs("/a", 10, 100.0)).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_log_redelivers_dropped_messages() {
        let log = MemoryLog::new();
        log.push_raw("s", b"one");
        log.push_raw("s", b"two");
        let mut consumer = log.open_consumer("s", "d").await.unwrap();

        let batch = consumer.fetch(10, Duration::ZERO).await.unwrap();
        assert_eq!(batch.len(), 2);
        batch[0].ack().await.unwrap();
        drop(batch);

        let again = consumer.fetch(10, Duration::ZERO).await.unwrap();
        assert_eq!(again.len(), 1);
        assert_eq!(again[0].payload(), b"two");
        again[0].ack().await.unwrap();
        drop(again);

        let stats = log.consumer_stats("d").unwrap();
        assert_eq!(stats.acked, vec![0, 1]);
        assert_eq!(stats.redelivered, 1);
        assert_eq!(stats.in_flight, 0);
    }

    #[tokio::test]
    async fn test_log_durable_resumes() {
        let log = MemoryLog::new();
        log.push_raw("s", b"one");
        {
            let mut c = log.open_consumer("s", "d").await.unwrap();
            let batch = c.fetch(10, Duration::ZERO).await.unwrap();
            batch[0].ack().await.unwrap();
        }
        log.push_raw("s", b"two");
        let mut c = log.open_consumer("s", "d").await.unwrap();
        let batch = c.fetch(10, Duration::ZERO).await.unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].payload(), b"two");
    }
}
