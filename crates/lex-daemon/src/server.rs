use axum::{
    body::to_bytes,
    extract::{ConnectInfo, Path, Request, State},
    http::{header, HeaderMap, StatusCode},
    middleware,
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Json, Router,
};
use lex_core::config::Config;
use lex_harness::mcp::{error_codes, JsonRpcRequest, JsonRpcResponse};
use lex_harness::pipeline::ProtectedPipeline;
use lex_harness::rate_limiter::RequestMeta;
use lex_telemetry::metrics::global_metrics;
use lex_telemetry::middleware::metrics_middleware;
use lex_telemetry::tracing_setup::request_id_middleware;
use lex_upstream::LegalDataApi;
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::time::Instant;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::dispatch::{handle_request, SERVER_NAME};

/// Largest accepted JSON-RPC body.
pub const MAX_BODY_BYTES: usize = 1024 * 1024;

// ---------------------------------------------------------------------------
// State
// ---------------------------------------------------------------------------

/// Everything a handler needs, shared by every connection.
#[derive(Clone)]
pub struct AppState {
    pub pipeline: Arc<ProtectedPipeline<Value>>,
    pub api: Arc<dyn LegalDataApi>,
    pub started_at: Instant,
}

impl AppState {
    pub fn new(config: &Config, api: Arc<dyn LegalDataApi>) -> Self {
        Self {
            pipeline: Arc::new(ProtectedPipeline::from_config(config)),
            api,
            started_at: Instant::now(),
        }
    }

    /// Update `circuit_breakers_open` and `rate_limited_clients`.
    pub async fn refresh_gauges(&self) {
        let open = self.pipeline.breakers().open_breakers().await.len();
        let penalized = self.pipeline.limiter().stats().penalized_clients;
        let m = global_metrics();
        m.set_gauge("circuit_breakers_open", open as i64);
        m.set_gauge("rate_limited_clients", penalized as i64);
    }
}

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

/// Public surface: MCP, health and metrics. Carries no admin routes.
pub fn router(state: AppState) -> Router {
    let routes = Router::new()
        .route("/mcp", post(mcp_handler))
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler));
    with_layers(routes).with_state(state)
}

/// Operator routes. Unauthenticated, so only served on `server.admin_port`.
pub fn admin_router(state: AppState) -> Router {
    let routes = Router::new()
        .route("/admin/breakers/reset", post(reset_breakers_handler))
        .route("/admin/breakers/{name}/reset", post(reset_breaker_handler))
        .route("/admin/clients/{id}", get(client_stats_handler))
        .route("/admin/clients/{id}/reset", post(reset_client_handler))
        .route("/admin/clients/{id}/allow", post(allow_client_handler))
        .route("/admin/clients/{id}/deny", post(deny_client_handler))
        .route("/admin/clients/{id}/lists", delete(unlist_client_handler))
        .route("/admin/cache/clear", post(clear_cache_handler));
    with_layers(routes).with_state(state)
}

fn with_layers(routes: Router<AppState>) -> Router<AppState> {
    routes
        .layer(middleware::from_fn(metrics_middleware))
        .layer(middleware::from_fn(request_id_middleware))
        .layer(TraceLayer::new_for_http())
}

/// Client identity inputs: request headers plus the socket peer, when the
/// server was started with connect info.
pub fn request_meta(headers: &HeaderMap, peer: Option<SocketAddr>) -> RequestMeta {
    let mut meta = RequestMeta::new();
    for (name, value) in headers {
        if let Ok(value) = value.to_str() {
            meta = meta.with_header(name.as_str(), value);
        }
    }
    if let Some(peer) = peer {
        meta = meta.with_remote_addr(peer.ip().to_string());
    }
    meta
}

// ---------------------------------------------------------------------------
// MCP
// ---------------------------------------------------------------------------

/// POST /mcp -- one JSON-RPC message per request.
async fn mcp_handler(State(state): State<AppState>, request: Request) -> Response {
    let peer = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| *addr);
    let (parts, body) = request.into_parts();
    let meta = request_meta(&parts.headers, peer);

    let bytes = match to_bytes(body, MAX_BODY_BYTES).await {
        Ok(b) => b,
        Err(e) => {
            let resp = JsonRpcResponse::error(None, error_codes::INVALID_REQUEST, format!("unreadable body: {e}"));
            return (StatusCode::PAYLOAD_TOO_LARGE, Json(resp)).into_response();
        }
    };

    let value: Value = match serde_json::from_slice(&bytes) {
        Ok(v) => v,
        Err(e) => {
            let resp = JsonRpcResponse::error(None, error_codes::PARSE_ERROR, format!("parse error: {e}"));
            return Json(resp).into_response();
        }
    };
    let id = value.get("id").cloned();
    let rpc: JsonRpcRequest = match serde_json::from_value(value) {
        Ok(r) => r,
        Err(e) => {
            let resp = JsonRpcResponse::error(id, error_codes::INVALID_REQUEST, format!("invalid request: {e}"));
            return Json(resp).into_response();
        }
    };

    match handle_request(&state, &meta, rpc).await {
        Some(resp) => Json(resp).into_response(),
        None => StatusCode::ACCEPTED.into_response(),
    }
}

// ---------------------------------------------------------------------------
// Health / metrics
// ---------------------------------------------------------------------------

/// GET /health -- 200 when every breaker is healthy, 503 otherwise.
async fn health_handler(State(state): State<AppState>) -> Response {
    let pipeline = &state.pipeline;
    let healthy = pipeline.breakers().are_all_healthy().await;
    let cache = pipeline.cache().stats();
    let body = json!({
        "status": if healthy { "healthy" } else { "degraded" },
        "service": SERVER_NAME,
        "version": env!("CARGO_PKG_VERSION"),
        "uptime_secs": state.started_at.elapsed().as_secs(),
        "breakers": pipeline.breakers().all_stats().await,
        "open_breakers": pipeline.breakers().open_breakers().await,
        "rate_limiter": pipeline.limiter().stats(),
        "cache": cache,
        "cache_hit_rate": cache.hit_rate(),
    });
    let status = if healthy { StatusCode::OK } else { StatusCode::SERVICE_UNAVAILABLE };
    (status, Json(body)).into_response()
}

/// GET /metrics -- Prometheus text exposition.
async fn metrics_handler(State(state): State<AppState>) -> Response {
    state.refresh_gauges().await;
    let cache = state.pipeline.cache().stats();
    let m = global_metrics();
    m.set_gauge("cache_entries", cache.size as i64);
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        m.export_prometheus(),
    )
        .into_response()
}

// ---------------------------------------------------------------------------
// Admin
// ---------------------------------------------------------------------------

async fn reset_breakers_handler(State(state): State<AppState>) -> Json<Value> {
    let breakers = state.pipeline.breakers();
    breakers.reset_all().await;
    state.refresh_gauges().await;
    let names = breakers.names();
    info!(count = names.len(), "all circuit breakers reset");
    Json(json!({ "reset": names }))
}

async fn reset_breaker_handler(State(state): State<AppState>, Path(name): Path<String>) -> Response {
    if state.pipeline.breakers().reset(&name).await {
        state.refresh_gauges().await;
        info!(breaker = %name, "circuit breaker reset");
        Json(json!({ "reset": [name] })).into_response()
    } else {
        not_found(format!("unknown breaker '{name}'"))
    }
}

async fn client_stats_handler(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    match state.pipeline.limiter().client_stats(&id) {
        Some(stats) => Json(stats).into_response(),
        None => not_found(format!("unknown client '{id}'")),
    }
}

async fn reset_client_handler(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    if state.pipeline.limiter().reset_client(&id) {
        info!(client_id = %id, "rate limit state reset");
        Json(json!({ "reset": id })).into_response()
    } else {
        not_found(format!("unknown client '{id}'"))
    }
}

async fn allow_client_handler(State(state): State<AppState>, Path(id): Path<String>) -> Json<Value> {
    state.pipeline.limiter().allow_client(&id);
    Json(json!({ "allowed": id }))
}

async fn deny_client_handler(State(state): State<AppState>, Path(id): Path<String>) -> Json<Value> {
    state.pipeline.limiter().deny_client(&id);
    Json(json!({ "denied": id }))
}

async fn unlist_client_handler(State(state): State<AppState>, Path(id): Path<String>) -> Json<Value> {
    state.pipeline.limiter().remove_from_lists(&id);
    Json(json!({ "unlisted": id }))
}

async fn clear_cache_handler(State(state): State<AppState>) -> Json<Value> {
    let cache = state.pipeline.cache();
    let cleared = cache.len();
    cache.clear();
    info!(cleared, "cache cleared");
    Json(json!({ "cleared": cleared }))
}

fn not_found(message: String) -> Response {
    (StatusCode::NOT_FOUND, Json(json!({ "error": message }))).into_response()
}
