//! Capability interfaces for the backing tiers.
//!
//! The gateway never talks to Redis, SQL, or JetStream directly from its
//! core logic. Each tier sits behind one small trait so tests (and
//! single-node deployments) can substitute the in-process implementations
//! from [`crate::memory`].
//!
//! ```text
//!            ┌──────────────┐
//!  probe ───▶│  FastCache   │  get / set key → entry with TTL      (L1)
//!            └──────┬───────┘
//!                   │ miss
//!            ┌──────▼───────┐
//!            │IdentityStore │  lookup by full file identity        (L2)
//!            └──────────────┘
//!
//!            ┌──────────────┐      ┌─────────────┐
//! ingest ───▶│   EventLog   │─────▶│ LogConsumer │──▶ bridge
//!            └──────────────┘      └─────────────┘
//!              append / ensure       fetch / ack
//! ```
//!
//! Every method returns `anyhow::Result`. Callers treat an `Err` as "tier
//! unavailable" and degrade; implementations should not retry internally.

use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;

use crate::models::{CacheEntry, FileObservation, IngestEvent};

// ═══════════════════════════════════════════════════════════════════════
// L1
// ═══════════════════════════════════════════════════════════════════════

/// Low-latency, TTL-bound key-value tier.
///
/// Writes for the same key always carry the same value, so last-writer-wins
/// is safe and implementations need no locking beyond their own.
#[async_trait]
pub trait FastCache: Send + Sync {
    /// Fetch the entry stored under `key`.
    ///
    /// Returns `Ok(None)` for an absent key and for a stored record missing
    /// either the algorithm or the hash.
    async fn get(&self, key: &str) -> Result<Option<CacheEntry>>;

    /// Store `entry` under `key`, expiring after `ttl`.
    async fn set(&self, key: &str, entry: &CacheEntry, ttl: Duration) -> Result<()>;
}

// ═══════════════════════════════════════════════════════════════════════
// L2
// ═══════════════════════════════════════════════════════════════════════

/// Durable, structured source of truth beneath the fast cache.
#[async_trait]
pub trait IdentityStore: Send + Sync {
    /// Find the stored hash for the observation's full identity.
    ///
    /// Path, size, and whole-second mtime must match. Implementations may
    /// narrow further on device/inode when their schema holds them.
    async fn lookup(&self, obs: &FileObservation) -> Result<Option<CacheEntry>>;
}

// ═══════════════════════════════════════════════════════════════════════
// Durable log
// ═══════════════════════════════════════════════════════════════════════

/// Append-only, subject-partitioned event log with durable consumers.
#[async_trait]
pub trait EventLog: Send + Sync {
    /// Append one batch of events under `subject` as a single message.
    async fn append(&self, subject: &str, events: &[IngestEvent]) -> Result<()>;

    /// Make sure a stream capturing `subject` exists. Idempotent.
    async fn ensure_stream(&self, subject: &str) -> Result<()>;

    /// Attach to (or create) the named durable pull consumer on `subject`.
    async fn open_consumer(&self, subject: &str, durable: &str) -> Result<Box<dyn LogConsumer>>;
}

/// A resumable cursor into the log.
#[async_trait]
pub trait LogConsumer: Send {
    /// Pull up to `max` messages, waiting at most `wait` for them.
    ///
    /// An empty vector means nothing was available in time.
    async fn fetch(&mut self, max: usize, wait: Duration) -> Result<Vec<Box<dyn LogMessage>>>;
}

/// A leased log message.
///
/// Dropping a message without acknowledging it leaves it to the log's own
/// redelivery timer.
#[async_trait]
pub trait LogMessage: Send + Sync {
    fn payload(&self) -> &[u8];

    /// Advance the durable cursor past this message.
    async fn ack(&self) -> Result<()>;
}
