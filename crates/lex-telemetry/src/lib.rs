//! Observability for lexgate: logging setup, an in-process metrics registry
//! with Prometheus export, and request-id propagation for the HTTP surface.
//!
//! - **Logging**: human-readable or JSON output via `tracing-subscriber`
//! - **Metrics**: counters, gauges, and histograms shared through [`metrics::global_metrics`]
//! - **Middleware**: axum layers recording request counts and durations
//! - **Tracing**: trace-id generation and per-operation spans

pub mod logging;
pub mod metrics;
pub mod middleware;
pub mod tracing_setup;
