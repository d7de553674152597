//! Streaming bridge between the durable log and a client session.
//!
//! Each session is one sequential state machine:
//!
//! ```text
//!  CONNECTING ──▶ STREAMING ──▶ ACK_PENDING ──▶ STREAMING ──▶ ...
//!       │              │              │
//!       └──────────────┴──────────────┴──────────▶ CLOSED
//! ```
//!
//! - **CONNECTING** validates `subject` and `durable`, ensures the stream and
//!   attaches to the durable pull consumer. Any failure sends an error frame
//!   and closes the session.
//! - **STREAMING** pulls up to `batch` messages with a bounded wait, backing
//!   off briefly when nothing arrives. A non-empty pull is sent as one
//!   `events` frame under a fresh batch id.
//! - **ACK_PENDING** waits for exactly one client message. An `ack` naming
//!   the batch id acks every message in the batch; anything else drops the
//!   batch unacknowledged so the log redelivers it. A disconnect ends the
//!   session with the batch unacknowledged.
//!
//! Only one batch is ever outstanding: the next pull does not start until the
//! previous batch has been acked or dropped. A slow client stalls its own
//! pull loop and nothing else.

use anyhow::Result;
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::gateway::StreamSettings;
use crate::models::{ServerFrame, StreamItem};
use crate::traits::{EventLog, LogConsumer, LogMessage};

/// Close code for invalid connection parameters.
pub const CLOSE_POLICY_VIOLATION: u16 = 1008;
/// Close code for backend failures and internal faults.
pub const CLOSE_INTERNAL_ERROR: u16 = 1011;

/// The client side of a session, as the bridge sees it.
#[async_trait]
pub trait SessionChannel: Send {
    async fn send(&mut self, frame: &ServerFrame) -> Result<()>;

    /// Next message from the client. `Ok(None)` means the client went away.
    async fn recv(&mut self) -> Result<Option<String>>;

    async fn close(&mut self, code: u16, reason: &str);
}

/// Raw connection parameters, as given on the query string.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct StreamParams {
    pub subject: Option<String>,
    pub durable: Option<String>,
    pub batch: Option<String>,
}

/// Validated connection parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamRequest {
    pub subject: String,
    pub durable: String,
    pub batch: usize,
}

impl StreamRequest {
    /// Validate `params`. The batch size defaults to `settings.default_batch`
    /// and is clamped to `settings.max_batch`.
    pub fn from_params(params: &StreamParams, settings: &StreamSettings) -> Result<Self, String> {
        let subject = required(params.subject.as_deref(), "subject")?;
        let durable = required(params.durable.as_deref(), "durable")?;
        let batch = match params.batch.as_deref().map(str::trim) {
            None | Some("") => settings.default_batch,
            Some(raw) => match raw.parse::<usize>() {
                Ok(n) if n > 0 => n,
                _ => return Err(format!("batch must be a positive integer, got '{}'", raw)),
            },
        };
        Ok(Self {
            subject,
            durable,
            batch: batch.min(settings.max_batch),
        })
    }
}

fn required(value: Option<&str>, name: &str) -> Result<String, String> {
    match value.map(str::trim) {
        Some(v) if !v.is_empty() => Ok(v.to_string()),
        _ => Err(format!("missing required parameter: {}", name)),
    }
}

/// Bridge states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BridgeState {
    Connecting,
    Streaming,
    AckPending,
    Closed,
}

/// Why a session ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEnd {
    /// The client disconnected.
    Disconnected,
    /// Parameters were invalid or the log could not be attached.
    SetupFailed(String),
    /// An unexpected fault during streaming.
    Failed(String),
}

/// Whether `text` is an `ack` object naming exactly `batch_id`.
///
/// Only a JSON object counts; arrays and scalars are malformed replies.
fn is_ack_for(text: &str, batch_id: &str) -> bool {
    let Ok(Value::Object(frame)) = serde_json::from_str::<Value>(text) else {
        return false;
    };
    frame.get("type").and_then(Value::as_str) == Some("ack")
        && frame.get("batch").and_then(Value::as_str) == Some(batch_id)
}

/// Decode a log payload as JSON, or wrap it as `{"raw": ...}`.
fn decode_payload(payload: &[u8]) -> Value {
    serde_json::from_slice(payload)
        .unwrap_or_else(|_| json!({ "raw": String::from_utf8_lossy(payload) }))
}

/// Messages sent under one batch id, held until the client resolves them.
struct PendingBatch {
    id: String,
    messages: Vec<Box<dyn LogMessage>>,
}

impl PendingBatch {
    fn new(messages: Vec<Box<dyn LogMessage>>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            messages,
        }
    }

    fn frame(&self) -> ServerFrame {
        ServerFrame::Events {
            batch: self.id.clone(),
            messages: self
                .messages
                .iter()
                .enumerate()
                .map(|(index, msg)| StreamItem {
                    index,
                    data: decode_payload(msg.payload()),
                })
                .collect(),
        }
    }

    /// Ack every message. Individual failures are left to redelivery.
    async fn ack_all(self) -> usize {
        let mut failed = 0;
        for msg in &self.messages {
            if let Err(e) = msg.ack().await {
                debug!(batch = %self.id, error = %e, "message ack failed");
                failed += 1;
            }
        }
        failed
    }
}

/// One client session.
pub struct StreamBridge<'a> {
    channel: &'a mut dyn SessionChannel,
    settings: StreamSettings,
    state: BridgeState,
}

impl<'a> StreamBridge<'a> {
    pub fn new(channel: &'a mut dyn SessionChannel, settings: StreamSettings) -> Self {
        Self {
            channel,
            settings,
            state: BridgeState::Connecting,
        }
    }

    fn transition(&mut self, next: BridgeState) {
        debug!(from = ?self.state, to = ?next, "bridge state");
        self.state = next;
    }

    /// Run the session until the client leaves or a fatal error occurs.
    ///
    /// `log` is `None` when the durable log is not configured.
    pub async fn run(mut self, log: Option<&dyn EventLog>, params: &StreamParams) -> SessionEnd {
        let request = match StreamRequest::from_params(params, &self.settings) {
            Ok(request) => request,
            Err(message) => {
                warn!(%message, "rejecting stream session");
                return self.fail_setup(CLOSE_POLICY_VIOLATION, message).await;
            }
        };

        let Some(log) = log else {
            return self
                .fail_setup(CLOSE_INTERNAL_ERROR, "durable log is not available on the gateway".to_string())
                .await;
        };

        let consumer = match attach(log, &request).await {
            Ok(consumer) => consumer,
            Err(e) => {
                error!(subject = %request.subject, durable = %request.durable, error = %e, "stream setup failed");
                return self.fail_setup(CLOSE_INTERNAL_ERROR, format!("{:#}", e)).await;
            }
        };

        info!(subject = %request.subject, durable = %request.durable, batch = request.batch, "stream client connected");
        self.transition(BridgeState::Streaming);

        let end = match self.stream(consumer, &request).await {
            Ok(end) => end,
            Err(e) => {
                error!(durable = %request.durable, error = %e, "stream session failed");
                let message = format!("{:#}", e);
                let _ = self
                    .channel
                    .send(&ServerFrame::Error {
                        message: message.clone(),
                    })
                    .await;
                self.channel.close(CLOSE_INTERNAL_ERROR, "internal error").await;
                SessionEnd::Failed(message)
            }
        };

        self.transition(BridgeState::Closed);
        info!(durable = %request.durable, ?end, "stream session closed");
        end
    }

    async fn fail_setup(&mut self, code: u16, message: String) -> SessionEnd {
        let _ = self
            .channel
            .send(&ServerFrame::Error {
                message: message.clone(),
            })
            .await;
        self.channel.close(code, &message).await;
        self.transition(BridgeState::Closed);
        SessionEnd::SetupFailed(message)
    }

    async fn stream(&mut self, mut consumer: Box<dyn LogConsumer>, request: &StreamRequest) -> Result<SessionEnd> {
        loop {
            let messages = match consumer.fetch(request.batch, self.settings.fetch_timeout).await {
                Ok(messages) => messages,
                Err(e) => {
                    warn!(durable = %request.durable, error = %e, "fetch failed");
                    Vec::new()
                }
            };

            if messages.is_empty() {
                if self.idle().await? {
                    return Ok(SessionEnd::Disconnected);
                }
                continue;
            }

            let batch = PendingBatch::new(messages);
            let frame = batch.frame();
            if self.channel.send(&frame).await.is_err() {
                debug!(batch = %batch.id, "client gone before batch was delivered");
                return Ok(SessionEnd::Disconnected);
            }
            self.transition(BridgeState::AckPending);

            let Some(reply) = self.channel.recv().await? else {
                debug!(batch = %batch.id, count = batch.messages.len(), "client disconnected with batch pending");
                return Ok(SessionEnd::Disconnected);
            };

            if is_ack_for(&reply, &batch.id) {
                let id = batch.id.clone();
                let count = batch.messages.len();
                let failed = batch.ack_all().await;
                debug!(batch = %id, count, failed, "batch acknowledged");
            } else {
                debug!(batch = %batch.id, "batch not acknowledged; leaving for redelivery");
                drop(batch);
            }
            self.transition(BridgeState::Streaming);
        }
    }

    /// Back off after an empty pull. Returns `true` if the client left.
    ///
    /// A client message arriving here has no batch to refer to and is ignored.
    async fn idle(&mut self) -> Result<bool> {
        tokio::select! {
            _ = tokio::time::sleep(self.settings.idle_backoff) => Ok(false),
            msg = self.channel.recv() => match msg? {
                None => Ok(true),
                Some(_) => {
                    debug!("ignoring client message with no batch pending");
                    Ok(false)
                }
            },
        }
    }
}

async fn attach(log: &dyn EventLog, request: &StreamRequest) -> Result<Box<dyn LogConsumer>> {
    log.ensure_stream(&request.subject).await?;
    log.open_consumer(&request.subject, &request.durable).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn settings() -> StreamSettings {
        StreamSettings {
            default_batch: 100,
            max_batch: 500,
            fetch_timeout: Duration::from_millis(10),
            idle_backoff: Duration::from_millis(10),
        }
    }

    fn params(subject: Option<&str>, durable: Option<&str>, batch: Option<&str>) -> StreamParams {
        StreamParams {
            subject: subject.map(String::from),
            durable: durable.map(String::from),
            batch: batch.map(String::from),
        }
    }

    #[test]
    fn test_request_validation() {
        let s = settings();
        let req = StreamRequest::from_params(&params(Some("snapfs.files"), Some("es"), None), &s).unwrap();
        assert_eq!(req.batch, 100);
        assert_eq!(req.durable, "es");

        let req = StreamRequest::from_params(&params(Some("s"), Some("d"), Some("9999")), &s).unwrap();
        assert_eq!(req.batch, 500);

        assert!(StreamRequest::from_params(&params(None, Some("d"), None), &s).is_err());
        assert!(StreamRequest::from_params(&params(Some("s"), Some("  "), None), &s).is_err());
        assert!(StreamRequest::from_params(&params(Some("s"), Some("d"), Some("0")), &s).is_err());
        assert!(StreamRequest::from_params(&params(Some("s"), Some("d"), Some("ten")), &s).is_err());
    }

    #[test]
    fn test_ack_matching() {
        assert!(is_ack_for(r#"{"type":"ack","batch":"b1"}"#, "b1"));
        assert!(!is_ack_for(r#"{"type":"ack","batch":"b0"}"#, "b1"));
        assert!(!is_ack_for(r#"{"type":"nack","batch":"b1"}"#, "b1"));
        assert!(!is_ack_for(r#"{"type":"ack"}"#, "b1"));
        assert!(!is_ack_for(r#"["ack","b1"]"#, "b1"));
        assert!(!is_ack_for(r#"{"type":"ack","batch":1}"#, "1"));
        assert!(!is_ack_for(r#""ack""#, "b1"));
        assert!(!is_ack_for("ack b1", "b1"));
    }

    #[test]
    fn test_decode_payload_fallback() {
        assert_eq!(decode_payload(br#"{"a":1}"#), json!({"a": 1}));
        assert_eq!(decode_payload(b"not json"), json!({"raw": "not json"}));
        assert_eq!(decode_payload(&[0xff, b'x']), json!({"raw": "\u{fffd}x"}));
    }
}
