//! Core data models used throughout the gateway.
//!
//! These types cover the file observations scanners probe with, the cache
//! entries the tiers hold, the events scanners push, and the frames exchanged
//! over a streaming session.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Event type whose payload carries hash material for the cache.
pub const FILE_UPSERT: &str = "file.upsert";

/// A snapshot of one file as reported by a scanner.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileObservation {
    pub path: String,
    pub size: u64,
    /// Modification time in seconds; fractional part is ignored for identity.
    pub mtime: f64,
    #[serde(default, alias = "device", skip_serializing_if = "Option::is_none")]
    pub dev: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inode: Option<u64>,
}

impl FileObservation {
    /// Device and inode, when both are present and non-zero.
    pub fn inode_identity(&self) -> Option<(u64, u64)> {
        match (self.dev, self.inode) {
            (Some(dev), Some(inode)) if dev != 0 && inode != 0 => Some((dev, inode)),
            _ => None,
        }
    }
}

/// A cached hash: algorithm name plus hex digest.
///
/// Only constructible with both fields non-empty. Records missing either
/// field are treated as absent by every tier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CacheEntry {
    pub algo: String,
    pub hash: String,
}

#[derive(Deserialize)]
struct RawEntry {
    #[serde(default, alias = "algorithm")]
    algo: Option<String>,
    #[serde(default)]
    hash: Option<String>,
}

impl CacheEntry {
    pub fn new(algo: impl Into<String>, hash: impl Into<String>) -> Option<Self> {
        let algo = algo.into();
        let hash = hash.into();
        if algo.is_empty() || hash.is_empty() {
            return None;
        }
        Some(Self { algo, hash })
    }

    /// Build from optional column values, as read from a store row.
    pub fn from_parts(algo: Option<String>, hash: Option<String>) -> Option<Self> {
        Self::new(algo?, hash?)
    }

    /// Decode the JSON form stored in the fast cache.
    pub fn from_json(raw: &str) -> Option<Self> {
        let raw: RawEntry = serde_json::from_str(raw).ok()?;
        Self::from_parts(raw.algo, raw.hash)
    }

    pub fn to_json(&self) -> String {
        serde_json::json!({ "algo": self.algo, "hash": self.hash }).to_string()
    }
}

/// Outcome of probing one observation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status")]
pub enum ProbeResult {
    #[serde(rename = "HIT")]
    Hit { algorithm: String, hash: String },
    #[serde(rename = "MISS")]
    Miss,
}

impl ProbeResult {
    pub fn is_hit(&self) -> bool {
        matches!(self, ProbeResult::Hit { .. })
    }
}

impl From<CacheEntry> for ProbeResult {
    fn from(entry: CacheEntry) -> Self {
        ProbeResult::Hit {
            algorithm: entry.algo,
            hash: entry.hash,
        }
    }
}

/// An event pushed by a scanner. The payload is untyped.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IngestEvent {
    #[serde(rename = "type")]
    pub event_type: String,
    #[serde(default)]
    pub data: Map<String, Value>,
}

impl IngestEvent {
    pub fn is_upsert(&self) -> bool {
        self.event_type == FILE_UPSERT
    }
}

/// Body of `POST /ingest`.
#[derive(Debug, Deserialize)]
pub struct IngestRequest {
    pub events: Vec<IngestEvent>,
}

/// Response of `POST /ingest`.
#[derive(Debug, Serialize, Deserialize)]
pub struct IngestResponse {
    pub status: String,
    pub received: usize,
    pub subject: Option<String>,
}

/// Envelope appended to the durable log for one ingest call.
#[derive(Debug, Serialize, Deserialize)]
pub struct EventEnvelope {
    pub events: Vec<IngestEvent>,
}

impl EventEnvelope {
    /// JSON bytes for a batch of events, as written to the log.
    pub fn encode(events: &[IngestEvent]) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(&serde_json::json!({ "events": events }))
    }
}

/// One decoded log message inside an `events` frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamItem {
    pub index: usize,
    pub data: Value,
}

/// Frames the gateway sends to a streaming client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ServerFrame {
    Events {
        batch: String,
        messages: Vec<StreamItem>,
    },
    Error {
        message: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_entry_requires_both_fields() {
        assert!(CacheEntry::new("blake3", "abc").is_some());
        assert!(CacheEntry::new("", "abc").is_none());
        assert!(CacheEntry::new("blake3", "").is_none());
        assert!(CacheEntry::from_parts(None, Some("abc".into())).is_none());
    }

    #[test]
    fn test_entry_json_decoding() {
        let e = CacheEntry::from_json(r#"{"algo":"blake3","hash":"abc"}"#).unwrap();
        assert_eq!(e.algo, "blake3");
        assert!(CacheEntry::from_json(r#"{"algo":"blake3"}"#).is_none());
        assert!(CacheEntry::from_json(r#"{"algo":null,"hash":"abc"}"#).is_none());
        assert!(CacheEntry::from_json("not json").is_none());
    }

    #[test]
    fn test_probe_result_wire_shape() {
        let hit = ProbeResult::from(CacheEntry::new("blake3", "abc").unwrap());
        assert_eq!(
            serde_json::to_value(&hit).unwrap(),
            json!({"status": "HIT", "algorithm": "blake3", "hash": "abc"})
        );
        assert_eq!(
            serde_json::to_value(ProbeResult::Miss).unwrap(),
            json!({"status": "MISS"})
        );
    }

    #[test]
    fn test_observation_device_alias() {
        let obs: FileObservation = serde_json::from_value(json!({
            "path": "/a", "size": 1, "mtime": 2.5, "device": 7, "inode": 9
        }))
        .unwrap();
        assert_eq!(obs.inode_identity(), Some((7, 9)));

        let obs: FileObservation =
            serde_json::from_value(json!({"path": "/a", "size": 1, "mtime": 2})).unwrap();
        assert_eq!(obs.inode_identity(), None);
    }

    #[test]
    fn test_server_frame_shape() {
        let frame = ServerFrame::Events {
            batch: "b1".into(),
            messages: vec![StreamItem {
                index: 0,
                data: json!({"k": 1}),
            }],
        };
        assert_eq!(
            serde_json::to_value(&frame).unwrap(),
            json!({"type": "events", "batch": "b1", "messages": [{"index": 0, "data": {"k": 1}}]})
        );
        let err = ServerFrame::Error {
            message: "boom".into(),
        };
        assert_eq!(
            serde_json::to_value(&err).unwrap(),
            json!({"type": "error", "message": "boom"})
        );
    }
}
