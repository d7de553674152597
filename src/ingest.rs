//! Event ingestion.
//!
//! Scanners push batches of events. For each batch:
//!
//! 1. every event carrying a string `path` has it rewritten to canonical form
//! 2. each complete `file.upsert` event seeds L1 with its `{algo, hash}`
//! 3. the whole batch is appended to the durable log as one message
//!
//! An upsert is complete when it has a non-empty algorithm (`algo` or
//! `algorithm`), a non-empty `hash`, a non-empty path, and numeric `size` and
//! `mtime`. Incomplete upserts are still forwarded; they just never reach the
//! cache.
//!
//! Seeding is the latency-critical side. Publishing is best-effort: when the
//! log is missing or down the batch is dropped with a warning and the call
//! still succeeds.

use futures::future::join_all;
use serde_json::{Map, Value};
use tracing::{debug, info, warn};

use crate::cache_key::build_key;
use crate::gateway::Gateway;
use crate::models::{CacheEntry, IngestEvent};
use crate::paths::canonicalize;

/// What happened to one ingest call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IngestOutcome {
    pub received: usize,
    /// Subject the batch was routed to; `None` when no subject could be resolved.
    pub subject: Option<String>,
    pub seeded: usize,
    pub published: bool,
}

/// Seed L1 from `events` and forward the batch to the durable log.
///
/// `subject` overrides the gateway's default routing subject.
pub async fn ingest(gateway: &Gateway, mut events: Vec<IngestEvent>, subject: Option<&str>) -> IngestOutcome {
    let received = events.len();
    let subject = subject
        .filter(|s| !s.is_empty())
        .unwrap_or(gateway.default_subject());
    let subject = (!subject.is_empty()).then(|| subject.to_string());

    for event in &mut events {
        canonicalize_event_path(event);
    }

    let seeded = seed_cache(gateway, &events).await;
    let published = match &subject {
        Some(subject) => publish(gateway, subject, &events).await,
        None => {
            warn!(count = received, "no routing subject configured; dropping event batch");
            false
        }
    };

    info!(received, seeded, published, subject = subject.as_deref().unwrap_or(""), "ingested events");
    IngestOutcome {
        received,
        subject,
        seeded,
        published,
    }
}

fn canonicalize_event_path(event: &mut IngestEvent) {
    if let Some(Value::String(path)) = event.data.get_mut("path") {
        *path = canonicalize(path);
    }
}

/// Cache key and entry for a complete upsert event.
fn seed_for(event: &IngestEvent) -> Option<(String, CacheEntry)> {
    if !event.is_upsert() {
        return None;
    }
    let data = &event.data;
    let algo = str_field(data, &["algo", "algorithm"])?;
    let hash = str_field(data, &["hash"])?;
    let entry = CacheEntry::new(algo, hash)?;

    let path = str_field(data, &["path"])?;
    let size = data.get("size").and_then(as_size)?;
    let mtime = data.get("mtime").and_then(Value::as_f64)?;
    let dev = uint_field(data, &["dev", "device"]);
    let inode = uint_field(data, &["inode"]);

    Some((build_key(path, size, mtime, dev, inode), entry))
}

async fn seed_cache(gateway: &Gateway, events: &[IngestEvent]) -> usize {
    let seeds: Vec<_> = events
        .iter()
        .filter_map(|event| {
            let seed = seed_for(event);
            if seed.is_none() && event.is_upsert() {
                debug!("upsert event incomplete; not seeding cache");
            }
            seed
        })
        .collect();

    let Some(cache) = gateway.cache() else {
        return 0;
    };

    let ttl = gateway.default_ttl();
    let writes = seeds.iter().map(|(key, entry)| cache.set(key, entry, ttl));
    let mut seeded = 0;
    for result in join_all(writes).await {
        match result {
            Ok(()) => seeded += 1,
            Err(e) => warn!(error = %e, "L1 seed failed"),
        }
    }
    seeded
}

async fn publish(gateway: &Gateway, subject: &str, events: &[IngestEvent]) -> bool {
    // an empty batch has nothing for consumers; no envelope is appended
    if events.is_empty() {
        return false;
    }
    let Some(log) = gateway.log() else {
        warn!(subject, count = events.len(), "durable log disabled; dropping event batch");
        return false;
    };
    match log.append(subject, events).await {
        Ok(()) => true,
        Err(e) => {
            warn!(subject, count = events.len(), error = %e, "durable log unavailable; dropping event batch");
            false
        }
    }
}

fn str_field<'a>(data: &'a Map<String, Value>, names: &[&str]) -> Option<&'a str> {
    names
        .iter()
        .find_map(|name| data.get(*name).and_then(Value::as_str))
        .filter(|s| !s.is_empty())
}

fn uint_field(data: &Map<String, Value>, names: &[&str]) -> Option<u64> {
    names.iter().find_map(|name| data.get(*name).and_then(Value::as_u64))
}

/// Byte size from an integer or a non-negative whole float.
fn as_size(value: &Value) -> Option<u64> {
    value.as_u64().or_else(|| {
        value
            .as_f64()
            .filter(|f| *f >= 0.0 && f.fract() == 0.0)
            .map(|f| f as u64)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{MemoryCache, MemoryLog};
    use crate::models::FileObservation;
    use crate::probe::probe_batch;
    use serde_json::json;
    use std::sync::Arc;
    use std::time::Duration;

    fn event(kind: &str, data: Value) -> IngestEvent {
        serde_json::from_value(json!({ "type": kind, "data": data })).unwrap()
    }

    fn upsert(path: &str) -> IngestEvent {
        event(
            "file.upsert",
            json!({"path": path, "size": 10, "mtime": 100.25, "algo": "blake3", "hash": "abc"}),
        )
    }

    fn setup() -> (Arc<MemoryCache>, MemoryLog, Gateway) {
        let cache = Arc::new(MemoryCache::default());
        let log = MemoryLog::new();
        let gateway = Gateway::new(Duration::from_secs(60), "snapfs.files")
            .with_cache(cache.clone())
            .with_log(Arc::new(log.clone()));
        (cache, log, gateway)
    }

    #[tokio::test]
    async fn test_complete_upsert_seeds_cache() {
        let (_cache, _log, gw) = setup();
        let out = ingest(&gw, vec![upsert(r"C:\show\a.exr")], None).await;
        assert_eq!(out.received, 1);
        assert_eq!(out.seeded, 1);

        let probe = FileObservation {
            path: "C:/show/a.exr".into(),
            size: 10,
            mtime: 100.9,
            dev: None,
            inode: None,
        };
        assert!(probe_batch(&gw, &[probe]).await[0].is_hit());
    }

    #[tokio::test]
    async fn test_missing_hash_does_not_seed() {
        let (cache, log, gw) = setup();
        let ev = event(
            "file.upsert",
            json!({"path": "/a", "size": 10, "mtime": 100, "algo": "blake3"}),
        );
        let out = ingest(&gw, vec![ev], None).await;
        assert_eq!(out.seeded, 0);
        assert_eq!(cache.set_count(), 0);
        // still forwarded
        assert!(out.published);
        assert_eq!(log.messages("snapfs.files").len(), 1);
    }

    #[test]
    fn test_completeness_rules() {
        let base = json!({"path": "/a", "size": 10, "mtime": 100, "algo": "blake3", "hash": "abc"});
        assert!(seed_for(&event("file.upsert", base.clone())).is_some());
        assert!(seed_for(&event("file.delete", base.clone())).is_none());

        for (field, bad) in [
            ("algo", json!("")),
            ("hash", json!(null)),
            ("path", json!("")),
            ("size", json!("10")),
            ("mtime", json!(null)),
        ] {
            let mut data = base.clone();
            data[field] = bad;
            assert!(
                seed_for(&event("file.upsert", data)).is_none(),
                "seeded despite bad {}",
                field
            );
        }
    }

    #[test]
    fn test_field_aliases() {
        let ev = event(
            "file.upsert",
            json!({"path": "/a", "size": 1, "mtime": 2, "algorithm": "sha256", "hash": "x", "device": 3, "inode": 4}),
        );
        let (key, entry) = seed_for(&ev).unwrap();
        assert_eq!(key, build_key("/ignored", 1, 2.0, Some(3), Some(4)));
        assert_eq!(entry.algo, "sha256");
    }

    #[tokio::test]
    async fn test_whole_batch_published_with_canonical_paths() {
        let (_cache, log, gw) = setup();
        let other = event("file.delete", json!({"path": "//srv/share//x/./y"}));
        let out = ingest(&gw, vec![upsert("/a//b/"), other], Some("site.files")).await;
        assert_eq!(out.subject.as_deref(), Some("site.files"));

        let messages = log.messages("site.files");
        assert_eq!(messages.len(), 1);
        let body: Value = serde_json::from_slice(&messages[0]).unwrap();
        let events = body["events"].as_array().unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0]["type"], "file.upsert");
        assert_eq!(events[0]["data"]["path"], "/a/b");
        assert_eq!(events[1]["type"], "file.delete");
        assert_eq!(events[1]["data"]["path"], "//srv/share/x/y");
    }

    #[tokio::test]
    async fn test_log_down_still_seeds() {
        let (cache, log, gw) = setup();
        log.set_unavailable(true);
        let out = ingest(&gw, vec![upsert("/a")], None).await;
        assert_eq!(out.seeded, 1);
        assert!(!out.published);
        assert_eq!(cache.set_count(), 1);
    }

    #[tokio::test]
    async fn test_cache_down_still_publishes() {
        let (cache, log, gw) = setup();
        cache.set_unavailable(true);
        let out = ingest(&gw, vec![upsert("/a")], None).await;
        assert_eq!(out.seeded, 0);
        assert!(out.published);
        assert_eq!(log.messages("snapfs.files").len(), 1);
    }

    #[tokio::test]
    async fn test_empty_override_uses_default_subject() {
        let (_cache, log, gw) = setup();
        let out = ingest(&gw, vec![], Some("")).await;
        assert_eq!(out.received, 0);
        assert_eq!(out.subject.as_deref(), Some("snapfs.files"));
        assert!(!out.published);
        assert!(log.messages("snapfs.files").is_empty());
    }

    #[tokio::test]
    async fn test_no_subject_resolves_to_none() {
        let gw = Gateway::new(Duration::from_secs(60), "");
        let out = ingest(&gw, vec![upsert("/a")], None).await;
        assert_eq!(out.subject, None);
        assert!(!out.published);
    }
}
