use crate::cache::{fingerprint, Cache, CacheConfig};
use crate::circuit_breaker::{CircuitBreakerConfig, CircuitBreakerError, CircuitBreakerManager};
use crate::rate_limiter::{RateLimitConfig, RateLimitError, RateLimiter, RequestMeta};
use lex_core::config::Config;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

/// Failure of a protected call, by the stage that produced it.
///
/// `E` is the upstream's own error, passed through unchanged.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError<E> {
    #[error(transparent)]
    RateLimited(#[from] RateLimitError),

    #[error("circuit breaker '{breaker}' is open, retry after {retry_after:?}")]
    CircuitOpen { breaker: String, retry_after: Duration },

    #[error("operation '{breaker}' timed out after {elapsed:?} (limit {limit:?})")]
    Timeout {
        breaker: String,
        elapsed: Duration,
        limit: Duration,
    },

    #[error("{0}")]
    Upstream(E),
}

impl<E> PipelineError<E> {
    /// `Some` for "retry later, here is when"; `None` when the call itself
    /// failed.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::RateLimited(e) => Some(e.retry_after()),
            Self::CircuitOpen { retry_after, .. } => Some(*retry_after),
            Self::Timeout { .. } | Self::Upstream(_) => None,
        }
    }
}

impl<E> From<CircuitBreakerError<E>> for PipelineError<E> {
    fn from(err: CircuitBreakerError<E>) -> Self {
        match err {
            CircuitBreakerError::Open { breaker, retry_after } => Self::CircuitOpen { breaker, retry_after },
            CircuitBreakerError::Timeout { breaker, elapsed, limit } => Self::Timeout { breaker, elapsed, limit },
            CircuitBreakerError::Inner(e) => Self::Upstream(e),
        }
    }
}

// ---------------------------------------------------------------------------
// Pipeline
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub struct CallOutcome<V> {
    pub value: V,
    /// Served from cache without touching the breaker or upstream.
    pub cached: bool,
    pub client_id: String,
    /// Requests left in the client's window, when the limiter tracked it.
    pub remaining: Option<u32>,
}

/// Rate limiter, cache, and breaker registry composed around upstream calls.
///
/// One instance is shared by every in-flight tool call.
#[derive(Debug)]
pub struct ProtectedPipeline<V> {
    limiter: Arc<RateLimiter>,
    breakers: Arc<CircuitBreakerManager>,
    cache: Arc<Cache<V>>,
    breaker_config: CircuitBreakerConfig,
}

impl<V: Clone> ProtectedPipeline<V> {
    pub fn new(
        limiter: Arc<RateLimiter>,
        breakers: Arc<CircuitBreakerManager>,
        cache: Arc<Cache<V>>,
        breaker_config: CircuitBreakerConfig,
    ) -> Self {
        Self {
            limiter,
            breakers,
            cache,
            breaker_config,
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(
            Arc::new(RateLimiter::new(RateLimitConfig::from(&config.rate_limit))),
            Arc::new(CircuitBreakerManager::new()),
            Arc::new(Cache::new(CacheConfig::from(&config.cache))),
            CircuitBreakerConfig::from(&config.circuit_breaker),
        )
    }

    pub fn limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    pub fn breakers(&self) -> &CircuitBreakerManager {
        &self.breakers
    }

    pub fn cache(&self) -> &Cache<V> {
        &self.cache
    }

    /// Admit, serve from cache, or run `op` through the breaker for
    /// `operation` and cache the result for `ttl`.
    ///
    /// A cache hit bypasses the breaker and `op` entirely. Errors from any
    /// stage are returned as-is.
    pub async fn call<F, Fut, E>(
        &self,
        meta: &RequestMeta,
        operation: &str,
        params: &serde_json::Value,
        ttl: Duration,
        op: F,
    ) -> Result<CallOutcome<V>, PipelineError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, E>>,
    {
        let decision = self.limiter.admit(meta, operation)?;

        let key = fingerprint(operation, params);
        if let Some(value) = self.cache.get(&key) {
            debug!(operation, client_id = %decision.client_id, "cache hit");
            return Ok(CallOutcome {
                value,
                cached: true,
                client_id: decision.client_id,
                remaining: decision.remaining,
            });
        }

        let breaker = self.breakers.get_breaker(operation, &self.breaker_config);
        let value = breaker.execute(op).await?;
        self.cache.set(key, value.clone(), ttl);

        Ok(CallOutcome {
            value,
            cached: false,
            client_id: decision.client_id,
            remaining: decision.remaining,
        })
    }
}
