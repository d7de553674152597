//! HTTP and WebSocket surface.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `GET`  | `/healthz` | Liveness (status, env, version); no dependency checks |
//! | `POST` | `/cache/batch` | Probe L1/L2 for a list of file observations |
//! | `POST` | `/ingest` | Seed L1 and forward events (`?subject=` overrides routing) |
//! | `POST` | `/query/sql` | Relational query pass-through (stub) |
//! | `GET`  | `/stream` | WebSocket bridge (`?subject=&durable=&batch=`) |
//!
//! # Error Contract
//!
//! ```json
//! { "error": { "code": "bad_request", "message": "sql must not be empty" } }
//! ```
//!
//! Handlers never fail because a backing tier is down; they degrade instead.
//! The only handler error is `bad_request` (400). Malformed JSON bodies are
//! rejected by axum's extractors before reaching a handler.

use axum::{
    extract::{
        ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tracing::info;

use crate::bridge::{SessionChannel, StreamBridge, StreamParams};
use crate::config::Config;
use crate::gateway::Gateway;
use crate::ingest::ingest;
use crate::models::{FileObservation, IngestRequest, IngestResponse, ProbeResult, ServerFrame};
use crate::probe::probe_batch;

/// Shared application state passed to all route handlers.
#[derive(Clone)]
pub struct AppState {
    gateway: Arc<Gateway>,
    env: Arc<str>,
}

impl AppState {
    pub fn new(gateway: Gateway, env: &str) -> Self {
        Self {
            gateway: Arc::new(gateway),
            env: Arc::from(env),
        }
    }
}

/// Build the router. Exposed so tests can serve it on an ephemeral port.
pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/healthz", get(handle_healthz))
        .route("/cache/batch", post(handle_cache_batch))
        .route("/ingest", post(handle_ingest))
        .route("/query/sql", post(handle_query_sql))
        .route("/stream", get(handle_stream))
        .layer(cors)
        .with_state(state)
}

/// Start the gateway and serve until Ctrl-C.
pub async fn run_server(config: &Config) -> Result<()> {
    let gateway = Gateway::from_config(config)?;
    let state = AppState::new(gateway, &config.env);

    let listener = tokio::net::TcpListener::bind(&config.server.bind).await?;
    info!(bind = %config.server.bind, env = %config.env, "gateway listening");

    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("gateway stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
}

// ============ Error response ============

#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    code: String,
    message: String,
}

struct AppError {
    status: StatusCode,
    code: String,
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code,
                message: self.message,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

fn bad_request(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::BAD_REQUEST,
        code: "bad_request".to_string(),
        message: message.into(),
    }
}

// ============ GET /healthz ============

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    env: String,
    version: String,
}

async fn handle_healthz(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        env: state.env.to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

// ============ POST /cache/batch ============

async fn handle_cache_batch(
    State(state): State<AppState>,
    Json(observations): Json<Vec<FileObservation>>,
) -> Json<Vec<ProbeResult>> {
    Json(probe_batch(&state.gateway, &observations).await)
}

// ============ POST /ingest ============

#[derive(Deserialize)]
struct IngestQuery {
    subject: Option<String>,
}

async fn handle_ingest(
    State(state): State<AppState>,
    Query(query): Query<IngestQuery>,
    Json(body): Json<IngestRequest>,
) -> Json<IngestResponse> {
    let outcome = ingest(&state.gateway, body.events, query.subject.as_deref()).await;
    Json(IngestResponse {
        status: "ok".to_string(),
        received: outcome.received,
        subject: outcome.subject,
    })
}

// ============ POST /query/sql ============

#[derive(Deserialize)]
struct SqlQuery {
    sql: String,
    #[serde(default)]
    #[allow(dead_code)]
    params: Option<Map<String, Value>>,
}

#[derive(Serialize)]
struct SqlResult {
    rows: Vec<Map<String, Value>>,
}

/// Relational queries are served by a separate agent; the gateway only
/// validates the request shape.
async fn handle_query_sql(Json(body): Json<SqlQuery>) -> Result<Json<SqlResult>, AppError> {
    if body.sql.trim().is_empty() {
        return Err(bad_request("sql must not be empty"));
    }
    Ok(Json(SqlResult { rows: Vec::new() }))
}

// ============ GET /stream ============

async fn handle_stream(
    State(state): State<AppState>,
    Query(params): Query<StreamParams>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| async move {
        let mut channel = WsChannel { socket };
        let log = state.gateway.log();
        let settings = state.gateway.stream_settings().clone();
        StreamBridge::new(&mut channel, settings)
            .run(log.as_deref(), &params)
            .await;
    })
}

/// [`SessionChannel`] over an axum WebSocket.
struct WsChannel {
    socket: WebSocket,
}

#[async_trait]
impl SessionChannel for WsChannel {
    async fn send(&mut self, frame: &ServerFrame) -> Result<()> {
        let text = serde_json::to_string(frame)?;
        self.socket.send(Message::Text(text.into())).await?;
        Ok(())
    }

    async fn recv(&mut self) -> Result<Option<String>> {
        while let Some(msg) = self.socket.recv().await {
            match msg {
                Ok(Message::Text(text)) => return Ok(Some(text.as_str().to_owned())),
                Ok(Message::Binary(bytes)) => {
                    return Ok(Some(String::from_utf8_lossy(&bytes).into_owned()))
                }
                Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => continue,
                Ok(Message::Close(_)) | Err(_) => return Ok(None),
            }
        }
        Ok(None)
    }

    async fn close(&mut self, code: u16, reason: &str) {
        let frame = CloseFrame {
            code,
            reason: close_reason(reason).into(),
        };
        let _ = self.socket.send(Message::Close(Some(frame))).await;
    }
}

/// Close reasons are limited to 123 bytes on the wire.
fn close_reason(reason: &str) -> String {
    const MAX: usize = 123;
    if reason.len() <= MAX {
        return reason.to_string();
    }
    let mut end = MAX;
    while !reason.is_char_boundary(end) {
        end -= 1;
    }
    reason[..end].to_string()
}
