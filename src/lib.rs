//! # SnapFS Gateway
//!
//! Ingestion and lookup gateway for a file-deduplication pipeline.
//!
//! Scanners ask the gateway whether a file's hash is already known before
//! re-hashing it, and push newly computed hashes as events. The gateway
//! answers probes from a two-tier cache and forwards events to a durable log
//! that downstream consumers (indexers, search backends) read through an
//! acknowledged, batched WebSocket stream.
//!
//! ## Architecture
//!
//! ```text
//!              ┌──────────────┐      ┌────────────┐
//!  scanner ───▶│    ingest    │─────▶│ L1 (Redis) │◀──┐
//!              └──────┬───────┘      └────────────┘   │ hydrate
//!                     │                               │
//!                     ▼              ┌────────────┐   │
//!              ┌──────────────┐      │ L2 (MySQL) │───┘
//!              │ durable log  │      └─────▲──────┘
//!              │ (JetStream)  │            │
//!              └──────┬───────┘      ┌─────┴──────┐
//!                     │              │   probe    │◀─── scanner
//!                     ▼              └────────────┘
//!              ┌──────────────┐
//!              │    bridge    │◀──ack──▶ downstream consumer
//!              └──────────────┘
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`paths`] | Path canonicalization |
//! | [`cache_key`] | Cache key derivation |
//! | [`models`] | Core data types and wire shapes |
//! | [`traits`] | Capability interfaces for each tier |
//! | [`memory`] | In-process tier implementations |
//! | [`redis_cache`] | Redis L1 |
//! | [`db`] | SQL L2 |
//! | [`event_log`] | JetStream durable log |
//! | [`gateway`] | Shared tier handles |
//! | [`probe`] | Tiered cache lookup |
//! | [`ingest`] | Event ingestion and cache seeding |
//! | [`bridge`] | Streaming bridge state machine |
//! | [`server`] | HTTP/WebSocket server |
//! | [`config`] | Configuration loading |
//! | [`logging`] | Tracing subscriber setup |

pub mod bridge;
pub mod cache_key;
pub mod config;
pub mod db;
pub mod event_log;
pub mod gateway;
pub mod ingest;
pub mod logging;
pub mod memory;
pub mod models;
pub mod paths;
pub mod probe;
pub mod redis_cache;
pub mod server;
pub mod traits;
