//! Tiered cache lookup.
//!
//! `probe_batch` answers "do we already know this file's hash?" for a batch
//! of observations, one result per input in input order:
//!
//! ```text
//!   observation ──▶ canonical path ──▶ cache key ──▶ L1 get
//!                                                     │ miss
//!                                                     ▼
//!                                  L2 lookup (path, size, mtime[, dev, inode])
//!                                                     │ hit
//!                                                     ▼
//!                                      L1 set (hydrate) ──▶ HIT
//! ```
//!
//! L1 lookups for the whole batch run concurrently. The L1 misses then go to
//! L2 with at most [`Gateway::l2_concurrency`] lookups in flight, so a large
//! batch never queues behind the store's connection pool. A tier that is
//! absent or returns an error counts as a miss for that tier and never fails
//! the batch.

use futures::future::join_all;
use futures::stream::{self, StreamExt};
use tracing::{debug, warn};

use crate::cache_key::key_for;
use crate::gateway::Gateway;
use crate::models::{CacheEntry, FileObservation, ProbeResult};
use crate::paths::canonicalize;

/// Probe every observation through L1 then L2.
pub async fn probe_batch(gateway: &Gateway, observations: &[FileObservation]) -> Vec<ProbeResult> {
    let observations: Vec<FileObservation> = observations
        .iter()
        .map(|obs| FileObservation {
            path: canonicalize(&obs.path),
            ..obs.clone()
        })
        .collect();
    let keys: Vec<String> = observations.iter().map(key_for).collect();

    let mut found = join_all(keys.iter().map(|key| l1_get(gateway, key))).await;

    let misses: Vec<usize> = (0..found.len()).filter(|&i| found[i].is_none()).collect();
    if gateway.store().is_some() && !misses.is_empty() {
        let filled: Vec<Option<CacheEntry>> = stream::iter(misses.iter().copied())
            .map(|i| l2_fill(gateway, &observations[i], &keys[i]))
            .buffered(gateway.l2_concurrency())
            .collect()
            .await;
        for (i, entry) in misses.into_iter().zip(filled) {
            found[i] = entry;
        }
    }

    let results: Vec<ProbeResult> = found
        .into_iter()
        .map(|entry| entry.map_or(ProbeResult::Miss, ProbeResult::from))
        .collect();

    debug!(
        count = results.len(),
        hits = results.iter().filter(|r| r.is_hit()).count(),
        "probe batch resolved"
    );
    results
}

/// L2 lookup for one L1 miss, hydrating L1 on a hit.
async fn l2_fill(gateway: &Gateway, obs: &FileObservation, key: &str) -> Option<CacheEntry> {
    let entry = l2_lookup(gateway, obs).await?;
    if let Some(cache) = gateway.cache() {
        if let Err(e) = cache.set(key, &entry, gateway.default_ttl()).await {
            warn!(error = %e, "L1 hydration failed");
        }
    }
    Some(entry)
}

async fn l1_get(gateway: &Gateway, key: &str) -> Option<CacheEntry> {
    let cache = gateway.cache()?;
    match cache.get(key).await {
        Ok(entry) => entry,
        Err(e) => {
            warn!(error = %e, "L1 unavailable, falling through to L2");
            None
        }
    }
}

async fn l2_lookup(gateway: &Gateway, obs: &FileObservation) -> Option<CacheEntry> {
    let store = gateway.store()?;
    match store.lookup(obs).await {
        Ok(entry) => entry,
        Err(e) => {
            warn!(error = %e, "L2 unavailable, reporting miss");
            None
        }
    }
}
