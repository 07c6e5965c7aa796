//! HTTP router (component I) — routes by path + method, wires every other
//! component together, and owns their shared lifecycle.
//!
//! Grounded on `src/http_server.rs`'s top-level
//! `Router::new().route(...).with_state(...)` composition and
//! `src/mcp/streamable_http.rs`'s `create_streamable_http_router`.

use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{any, get, post};
use axum::{Json, Router};
use bytes::Bytes;
use serde::Serialize;
use serde_json::Value;
use tower::ServiceBuilder;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use crate::capture::CaptureStore;
use crate::config::GatewayConfig;
use crate::error::{GatewayError, GatewayResult};
use crate::events::EventBus;
use crate::jsonrpc;
use crate::management::ManagementSurface;
use crate::proxy::{CodeModeCache, CodeModeEngine, ProxyEngine, ProxyRequest, ProxyResponse};
use crate::registry::Registry;
use crate::session::SessionTable;

#[derive(Clone)]
pub struct GatewayState {
    pub registry: Arc<Registry>,
    pub captures: Arc<CaptureStore>,
    pub sessions: SessionTable,
    pub events: EventBus,
    pub proxy: Arc<ProxyEngine>,
    pub management: Arc<ManagementSurface>,
    pub codemode_cache: Arc<CodeModeCache>,
    pub codemode_timeout: Duration,
    pub start_time: Instant,
}

impl GatewayState {
    pub async fn bootstrap(config: &GatewayConfig) -> anyhow::Result<Self> {
        let events = EventBus::new();
        let registry = Arc::new(Registry::load(&config.storage.registry_root, events.clone()).await?);
        let captures = Arc::new(CaptureStore::new(&config.storage.capture_root));
        let sessions = SessionTable::new();
        let http_client = reqwest::Client::builder()
            .timeout(config.server.exchange_timeout)
            .build()?;

        let proxy = Arc::new(ProxyEngine {
            registry: registry.clone(),
            captures: captures.clone(),
            sessions: sessions.clone(),
            events: events.clone(),
            http_client,
            exchange_timeout: config.server.exchange_timeout,
        });

        let management = Arc::new(ManagementSurface {
            registry: registry.clone(),
            captures: captures.clone(),
            events: events.clone(),
        });

        Ok(Self {
            registry,
            captures,
            sessions,
            events,
            proxy,
            management,
            codemode_cache: Arc::new(CodeModeCache::new()),
            codemode_timeout: config.codemode.default_script_timeout,
            start_time: Instant::now(),
        })
    }
}

pub fn build_router(state: GatewayState) -> Router {
    Router::new()
        .route("/", get(health))
        .route("/status", get(status))
        .route("/:server/mcp", post(proxy_handler))
        .route("/s/:server/mcp", post(proxy_handler))
        .route("/servers/:server/mcp", post(proxy_handler))
        .route("/servers/:server/mcp-codemode", post(codemode_handler))
        .route("/gateway/mcp", any(management_handler))
        .route("/g/mcp", any(management_handler))
        .with_state(state)
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(CorsLayer::permissive()),
        )
}

#[derive(Serialize)]
struct HealthPayload {
    name: &'static str,
    version: &'static str,
    servers: usize,
    uptime: u64,
}

async fn health(State(state): State<GatewayState>) -> impl IntoResponse {
    let servers = state.registry.list().await.len();
    Json(HealthPayload {
        name: "mcp-gateway",
        version: env!("CARGO_PKG_VERSION"),
        servers,
        uptime: state.start_time.elapsed().as_secs(),
    })
}

async fn status(State(state): State<GatewayState>) -> impl IntoResponse {
    let servers = state.registry.list().await;
    Json(serde_json::json!({ "servers": servers }))
}

async fn proxy_handler(
    State(state): State<GatewayState>,
    Path(server): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let request = ProxyRequest { server_name: server, headers, body };
    match state.proxy.handle_forward(request).await {
        Ok(response) => render(response),
        Err(err) => render_error(err),
    }
}

async fn codemode_handler(
    State(state): State<GatewayState>,
    Path(server): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let request = ProxyRequest { server_name: server, headers, body };
    let engine = CodeModeEngine {
        proxy: &state.proxy,
        cache: &state.codemode_cache,
        default_timeout: state.codemode_timeout,
    };
    match engine.handle(request).await {
        Ok(response) => render(response),
        Err(err) => render_error(err),
    }
}

async fn management_handler(State(state): State<GatewayState>, body: Bytes) -> Response {
    let envelope = match jsonrpc::parse_request(&body) {
        Ok(envelope) => envelope,
        Err(err) => return err.into_response(),
    };
    match state.management.handle(envelope).await {
        Ok(value) => (StatusCode::OK, Json(value)).into_response(),
        Err(err) => err.into_response(),
    }
}

fn render(response: ProxyResponse) -> Response {
    let status = StatusCode::from_u16(response.status).unwrap_or(StatusCode::OK);
    let mut builder = axum::http::Response::builder()
        .status(status)
        .header("Content-Type", response.content_type);
    for (name, value) in response.headers {
        builder = builder.header(name, value);
    }
    builder
        .body(axum::body::Body::from(response.body))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

fn render_error(err: GatewayError) -> Response {
    err.into_response()
}

pub type RouterResult<T> = GatewayResult<T>;
