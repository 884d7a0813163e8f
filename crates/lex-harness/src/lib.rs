//! Resilience harness for lexgate's upstream calls.
//!
//! Every tool invocation flows through one shared [`pipeline::ProtectedPipeline`]:
//! - [`rate_limiter`]: per-client admission with a rolling window, burst
//!   detection, and escalating penalties
//! - [`cache`]: TTL + LRU store keyed by a canonical request fingerprint
//! - [`circuit_breaker`]: per-operation breaker with call timeout and
//!   trial-call recovery, registered by name in a manager
//!
//! [`mcp`] holds the JSON-RPC / MCP wire types used at the boundary.
//!
//! All time-keeping uses `tokio::time::Instant`, so the whole harness can be
//! driven deterministically with a paused tokio clock.

pub mod cache;
pub mod circuit_breaker;
pub mod mcp;
pub mod pipeline;
pub mod rate_limiter;
