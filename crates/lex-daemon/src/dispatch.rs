use lex_harness::mcp::{error_codes, InitializeResult, JsonRpcRequest, JsonRpcResponse, ToolCallRequest, ToolCallResult};
use lex_harness::pipeline::PipelineError;
use lex_harness::rate_limiter::{RateLimitError, RequestMeta};
use lex_telemetry::metrics::{global_metrics, UPSTREAM_DURATION};
use lex_telemetry::tracing_setup::create_operation_span;
use lex_upstream::catalog::mcp_tools;
use lex_upstream::{ArgumentError, LegalTool, UpstreamError};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn, Instrument};

use crate::server::AppState;

pub const SERVER_NAME: &str = "lexgate";

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// A request that ends in a JSON-RPC error object.
///
/// Upstream failures are not here: they reach the client as a tool result
/// with `isError: true`.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("method not found: {0}")]
    MethodNotFound(String),

    #[error("unknown tool: {0}")]
    UnknownTool(String),

    #[error("invalid params: {0}")]
    InvalidParams(String),

    #[error("invalid arguments: {0}")]
    Arguments(#[from] ArgumentError),

    #[error(transparent)]
    RateLimited(RateLimitError),

    #[error("circuit breaker '{breaker}' is open")]
    CircuitOpen { breaker: String, retry_after: Duration },

    #[error("upstream call '{breaker}' timed out after {elapsed:?} (limit {limit:?})")]
    Timeout {
        breaker: String,
        elapsed: Duration,
        limit: Duration,
    },
}

impl DispatchError {
    pub fn code(&self) -> i32 {
        match self {
            Self::InvalidRequest(_) => error_codes::INVALID_REQUEST,
            Self::MethodNotFound(_) => error_codes::METHOD_NOT_FOUND,
            Self::UnknownTool(_) | Self::InvalidParams(_) | Self::Arguments(_) => error_codes::INVALID_PARAMS,
            Self::RateLimited(_) => error_codes::RATE_LIMITED,
            Self::CircuitOpen { .. } => error_codes::CIRCUIT_OPEN,
            Self::Timeout { .. } => error_codes::UPSTREAM_TIMEOUT,
        }
    }

    /// Retry hints for the client, in the unit each error speaks.
    pub fn data(&self) -> Option<Value> {
        match self {
            Self::RateLimited(RateLimitError::Exceeded {
                client_id,
                reason,
                retry_after_secs,
            }) => Some(json!({
                "clientId": client_id,
                "reason": reason,
                "retryAfterSeconds": retry_after_secs,
            })),
            Self::CircuitOpen { breaker, retry_after } => Some(json!({
                "breaker": breaker,
                "retryAfterMs": retry_after.as_millis() as u64,
            })),
            Self::Timeout { breaker, elapsed, limit } => Some(json!({
                "breaker": breaker,
                "elapsedMs": elapsed.as_millis() as u64,
                "limitMs": limit.as_millis() as u64,
            })),
            _ => None,
        }
    }

    pub fn into_response(self, id: Option<Value>) -> JsonRpcResponse {
        let code = self.code();
        let data = self.data();
        JsonRpcResponse::error_with_data(id, code, self.to_string(), data)
    }

    fn outcome_label(&self) -> &'static str {
        match self {
            Self::RateLimited(_) => "rate_limited",
            Self::CircuitOpen { .. } => "circuit_open",
            Self::Timeout { .. } => "timeout",
            _ => "rejected",
        }
    }
}

// ---------------------------------------------------------------------------
// Dispatch
// ---------------------------------------------------------------------------

/// Handle one JSON-RPC message. Notifications yield `None`.
pub async fn handle_request(state: &AppState, meta: &RequestMeta, request: JsonRpcRequest) -> Option<JsonRpcResponse> {
    if request.is_notification() {
        debug!(method = %request.method, "notification received");
        return None;
    }
    let id = request.response_id();
    if request.jsonrpc != "2.0" {
        let err = DispatchError::InvalidRequest(format!("unsupported jsonrpc version '{}'", request.jsonrpc));
        return Some(err.into_response(id));
    }

    let result = match request.method.as_str() {
        "initialize" => to_value(InitializeResult::new(SERVER_NAME, env!("CARGO_PKG_VERSION"))),
        "ping" => Ok(json!({})),
        "tools/list" => Ok(json!({ "tools": mcp_tools() })),
        "tools/call" => call_tool(state, meta, request.params).await.and_then(to_value),
        other => Err(DispatchError::MethodNotFound(other.to_string())),
    };

    Some(match result {
        Ok(value) => JsonRpcResponse::success(id, value),
        Err(err) => err.into_response(id),
    })
}

fn to_value<T: serde::Serialize>(value: T) -> Result<Value, DispatchError> {
    serde_json::to_value(value).map_err(|e| DispatchError::InvalidRequest(e.to_string()))
}

/// `tools/call`: validate, then run through the protected pipeline.
///
/// Argument errors are rejected before admission so they never consume
/// rate-limit budget or count as breaker failures.
pub async fn call_tool(
    state: &AppState,
    meta: &RequestMeta,
    params: Option<Value>,
) -> Result<ToolCallResult, DispatchError> {
    let params = params.ok_or_else(|| DispatchError::InvalidParams("missing params".into()))?;
    let call: ToolCallRequest =
        serde_json::from_value(params).map_err(|e| DispatchError::InvalidParams(e.to_string()))?;
    let tool = LegalTool::from_name(&call.name).ok_or_else(|| DispatchError::UnknownTool(call.name.clone()))?;
    let args = tool.validate(&call.arguments)?;

    let ttl = tool.volatility().ttl(state.pipeline.cache().config().default_ttl);
    let api = Arc::clone(&state.api);
    let upstream_args = args.clone();
    let fingerprint_params = Value::Object(args);

    let (span, trace_id) = create_operation_span(tool.name());
    let result = state
        .pipeline
        .call(meta, tool.name(), &fingerprint_params, ttl, move || async move {
            let started = Instant::now();
            let result = api.call(tool, &upstream_args).await;
            global_metrics().record_histogram(UPSTREAM_DURATION, started.elapsed().as_secs_f64());
            result
        })
        .instrument(span)
        .await;

    let metrics = global_metrics();
    let outcome = match result {
        Ok(outcome) => {
            if outcome.cached {
                metrics.increment_counter("cache_hits_total", &[("tool", tool.name())]);
            }
            let label = if outcome.cached { "cache_hit" } else { "success" };
            metrics.increment_counter("tool_calls_total", &[("tool", tool.name()), ("outcome", label)]);
            debug!(tool = %tool, client_id = %outcome.client_id, cached = outcome.cached, %trace_id, "tool call served");
            Ok(ToolCallResult::json(&outcome.value))
        }
        Err(PipelineError::Upstream(err)) => {
            metrics.increment_counter("tool_calls_total", &[("tool", tool.name()), ("outcome", "upstream_error")]);
            warn!(tool = %tool, error = %err, %trace_id, "upstream call failed");
            Ok(ToolCallResult::error(upstream_message(&err)))
        }
        Err(PipelineError::RateLimited(e)) => Err(rejected(tool, DispatchError::RateLimited(e), &trace_id)),
        Err(PipelineError::CircuitOpen { breaker, retry_after }) => {
            Err(rejected(tool, DispatchError::CircuitOpen { breaker, retry_after }, &trace_id))
        }
        Err(PipelineError::Timeout { breaker, elapsed, limit }) => {
            Err(rejected(tool, DispatchError::Timeout { breaker, elapsed, limit }, &trace_id))
        }
    };

    state.refresh_gauges().await;
    outcome
}

fn rejected(tool: LegalTool, err: DispatchError, trace_id: &str) -> DispatchError {
    global_metrics().increment_counter("tool_calls_total", &[("tool", tool.name()), ("outcome", err.outcome_label())]);
    info!(tool = %tool, error = %err, %trace_id, "tool call rejected");
    err
}

fn upstream_message(err: &UpstreamError) -> String {
    match err {
        UpstreamError::RateLimited {
            retry_after_secs: Some(secs),
        } => format!("upstream rate limited this server, retry in {secs}s"),
        UpstreamError::Status { status: 404, .. } => "not found upstream".to_string(),
        other => other.to_string(),
    }
}
