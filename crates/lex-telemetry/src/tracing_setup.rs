use axum::{body::Body, extract::Request, http::HeaderValue, middleware::Next, response::Response};
use tracing::Instrument;
use uuid::Uuid;

pub const REQUEST_ID_HEADER: &str = "x-request-id";

/// Generate a trace ID (32 hex characters).
pub fn generate_trace_id() -> String {
    Uuid::new_v4().as_simple().to_string()
}

/// Generate a span ID (16 hex characters).
pub fn generate_span_id() -> String {
    Uuid::new_v4().as_simple().to_string()[..16].to_string()
}

/// Axum middleware that propagates `X-Request-Id` and wraps the request in
/// an `http_request` span.
///
/// An incoming id is reused; otherwise a fresh trace id is generated. The
/// response always carries the header.
pub async fn request_id_middleware(mut request: Request<Body>, next: Next) -> Response {
    let request_id = request
        .headers()
        .get(REQUEST_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .filter(|s| !s.is_empty())
        .map(|s| s.to_string())
        .unwrap_or_else(generate_trace_id);

    let header = HeaderValue::from_str(&request_id).unwrap_or_else(|_| HeaderValue::from_static("unknown"));
    request.headers_mut().insert(REQUEST_ID_HEADER, header.clone());

    let span = tracing::info_span!(
        "http_request",
        trace_id = %request_id,
        method = %request.method(),
        path = %request.uri().path(),
    );

    let mut response = next.run(request).instrument(span).await;
    response.headers_mut().insert(REQUEST_ID_HEADER, header);
    response
}

/// Create a span for one logical operation (e.g. a tool call), returning the
/// span and its trace ID for log correlation.
pub fn create_operation_span(operation: &str) -> (tracing::Span, String) {
    let trace_id = generate_trace_id();
    let span_id = generate_span_id();
    let span = tracing::info_span!(
        "operation",
        trace_id = %trace_id,
        span_id = %span_id,
        operation = %operation,
    );
    (span, trace_id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_trace_id_format() {
        let id = generate_trace_id();
        assert_eq!(id.len(), 32);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_span_id_format() {
        let id = generate_span_id();
        assert_eq!(id.len(), 16);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_operation_span_creation() {
        let (span, trace_id) = create_operation_span("search_opinions");
        assert_eq!(trace_id.len(), 32);
        let _guard = span.enter();
    }
}
