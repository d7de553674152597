//! JetStream-backed durable log.
//!
//! All subjects share one stream (`nats.stream`). Ensuring a subject creates
//! the stream when it is absent and extends its subject list when no existing
//! pattern covers the subject. Consumers are durable pull consumers with
//! explicit acks, so an unacknowledged message comes back once its ack wait
//! elapses.
//!
//! The NATS connection is opened on first use.

use std::collections::HashSet;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use async_nats::jetstream::{self, consumer::pull, stream};
use async_trait::async_trait;
use futures::StreamExt;
use tokio::sync::OnceCell;
use tracing::info;

use crate::models::{EventEnvelope, IngestEvent};
use crate::traits::{EventLog, LogConsumer, LogMessage};

pub struct JetStreamLog {
    url: String,
    stream: String,
    timeout: Duration,
    context: OnceCell<jetstream::Context>,
    /// Subjects already confirmed on the stream by this process.
    ensured: Mutex<HashSet<String>>,
}

impl JetStreamLog {
    pub fn new(url: &str, stream: &str, timeout: Duration) -> Self {
        Self {
            url: url.to_string(),
            stream: stream.to_string(),
            timeout,
            context: OnceCell::new(),
            ensured: Mutex::new(HashSet::new()),
        }
    }

    async fn context(&self) -> Result<jetstream::Context> {
        let ctx = self
            .context
            .get_or_try_init(|| async {
                let client = tokio::time::timeout(self.timeout, async_nats::connect(self.url.as_str()))
                    .await
                    .context("timed out connecting to NATS")?
                    .with_context(|| format!("Failed to connect to NATS at {}", self.url))?;
                info!(url = %self.url, "connected to NATS");
                Ok::<_, anyhow::Error>(jetstream::new(client))
            })
            .await?;
        Ok(ctx.clone())
    }

    fn is_ensured(&self, subject: &str) -> bool {
        self.ensured
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(subject)
    }

    async fn stream_for(&self, subject: &str) -> Result<stream::Stream> {
        let js = self.context().await?;
        match js.get_stream(&self.stream).await {
            Ok(mut handle) => {
                if !self.is_ensured(subject) {
                    let info = handle
                        .info()
                        .await
                        .with_context(|| format!("Failed to read stream {}", self.stream))?;
                    if let Some(subjects) = merge_subjects(&info.config.subjects, subject) {
                        let mut config = info.config.clone();
                        config.subjects = subjects;
                        js.update_stream(&config)
                            .await
                            .with_context(|| format!("Failed to add {} to stream {}", subject, self.stream))?;
                        info!(stream = %self.stream, subject, "extended stream subjects");
                    }
                }
                self.mark_ensured(subject);
                Ok(handle)
            }
            Err(get_err) => {
                let handle = js
                    .create_stream(stream::Config {
                        name: self.stream.clone(),
                        subjects: vec![subject.to_string()],
                        ..Default::default()
                    })
                    .await
                    .with_context(|| {
                        format!("Failed to create stream {} (lookup: {})", self.stream, get_err)
                    })?;
                info!(stream = %self.stream, subject, "created stream");
                self.mark_ensured(subject);
                Ok(handle)
            }
        }
    }

    /// Make sure `subject` is on the stream, skipping the server round trip
    /// for subjects this process has already confirmed.
    async fn ensure(&self, subject: &str) -> Result<()> {
        if self.is_ensured(subject) {
            return Ok(());
        }
        self.stream_for(subject).await?;
        Ok(())
    }

    fn forget_ensured(&self, subject: &str) {
        self.ensured
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(subject);
    }

    fn mark_ensured(&self, subject: &str) {
        self.ensured
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(subject.to_string());
    }
}

#[async_trait]
impl EventLog for JetStreamLog {
    async fn append(&self, subject: &str, events: &[IngestEvent]) -> Result<()> {
        self.ensure(subject).await?;
        let js = self.context().await?;
        let payload = EventEnvelope::encode(events)?;
        let published = async {
            let ack = js
                .publish(subject.to_string(), payload.into())
                .await
                .with_context(|| format!("Failed to publish to {}", subject))?;
            tokio::time::timeout(self.timeout, ack)
                .await
                .context("timed out waiting for publish ack")?
                .with_context(|| format!("Publish to {} was not acknowledged", subject))?;
            Ok::<_, anyhow::Error>(())
        }
        .await;
        if published.is_err() {
            // the stream may have been removed; check it again next time
            self.forget_ensured(subject);
        }
        published
    }

    async fn ensure_stream(&self, subject: &str) -> Result<()> {
        self.ensure(subject).await
    }

    async fn open_consumer(&self, subject: &str, durable: &str) -> Result<Box<dyn LogConsumer>> {
        let handle = self.stream_for(subject).await?;
        let consumer = handle
            .get_or_create_consumer(
                durable,
                pull::Config {
                    durable_name: Some(durable.to_string()),
                    filter_subject: subject.to_string(),
                    ack_policy: jetstream::consumer::AckPolicy::Explicit,
                    ..Default::default()
                },
            )
            .await
            .with_context(|| format!("Failed to create JetStream consumer for durable={}", durable))?;
        Ok(Box::new(JetStreamConsumer { consumer }))
    }
}

struct JetStreamConsumer {
    consumer: jetstream::consumer::Consumer<pull::Config>,
}

#[async_trait]
impl LogConsumer for JetStreamConsumer {
    async fn fetch(&mut self, max: usize, wait: Duration) -> Result<Vec<Box<dyn LogMessage>>> {
        let mut batch = self
            .consumer
            .fetch()
            .max_messages(max)
            .expires(wait)
            .messages()
            .await
            .context("JetStream fetch failed")?;

        let mut out: Vec<Box<dyn LogMessage>> = Vec::new();
        while let Some(message) = batch.next().await {
            let message = message.map_err(|e| anyhow!(e))?;
            out.push(Box::new(JetStreamMessage { message }));
        }
        Ok(out)
    }
}

struct JetStreamMessage {
    message: jetstream::Message,
}

#[async_trait]
impl LogMessage for JetStreamMessage {
    fn payload(&self) -> &[u8] {
        &self.message.payload
    }

    async fn ack(&self) -> Result<()> {
        self.message.ack().await.map_err(|e| anyhow!(e))
    }
}

/// Subject list with `subject` added, or `None` if a pattern already covers it.
fn merge_subjects(existing: &[String], subject: &str) -> Option<Vec<String>> {
    if existing.iter().any(|p| subject_matches(p, subject)) {
        return None;
    }
    let mut merged = existing.to_vec();
    merged.push(subject.to_string());
    Some(merged)
}

/// NATS subject matching: `*` matches one token, a trailing `>` one or more.
fn subject_matches(pattern: &str, subject: &str) -> bool {
    let mut pattern = pattern.split('.');
    let mut subject = subject.split('.');
    loop {
        match (pattern.next(), subject.next()) {
            (Some(">"), Some(_)) => return true,
            (Some("*"), Some(_)) => {}
            (Some(p), Some(s)) if p == s => {}
            (None, None) => return true,
            _ => return false,
        }
    }
}
