use axum::{
    body::Body,
    extract::{MatchedPath, Request},
    middleware::Next,
    response::Response,
};
use std::time::Instant;

use crate::metrics::{global_metrics, HTTP_DURATION};

/// `path` label for requests that matched no route.
pub const UNMATCHED_PATH: &str = "unmatched";

/// Axum middleware that records `http_requests_total{method,path,status}`
/// and the `http_request_duration_seconds` histogram.
///
/// `path` is the route template (`/admin/clients/{id}`), never the raw URI,
/// so label cardinality stays bounded by the route table. Must be added with
/// `Router::layer` for the template to be visible.
pub async fn metrics_middleware(request: Request<Body>, next: Next) -> Response {
    let method = request.method().to_string();
    let path = request
        .extensions()
        .get::<MatchedPath>()
        .map(|p| p.as_str().to_string())
        .unwrap_or_else(|| UNMATCHED_PATH.to_string());
    let start = Instant::now();

    let response = next.run(request).await;

    let duration = start.elapsed().as_secs_f64();
    let status = response.status().as_u16().to_string();
    let m = global_metrics();
    m.increment_counter(
        "http_requests_total",
        &[("method", &method), ("path", &path), ("status", &status)],
    );
    m.record_histogram(HTTP_DURATION, duration);
    response
}
