use chrono::{DateTime, Utc};
use dashmap::DashMap;
use lex_core::config::CircuitBreakerSettings;
use serde::Serialize;
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, warn};

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

/// Errors returned by [`CircuitBreaker::execute`].
///
/// `E` is the wrapped operation's own error type; it is handed back untouched
/// in [`CircuitBreakerError::Inner`] after the failure has been counted.
///
/// ```rust
/// use lex_harness::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitBreakerError};
///
/// async fn lookup(breaker: &CircuitBreaker) {
///     match breaker.execute(|| async { Ok::<_, std::io::Error>("opinion") }).await {
///         Err(CircuitBreakerError::Open { retry_after, .. }) => {
///             println!("upstream degraded, retry in {retry_after:?}");
///         }
///         Err(CircuitBreakerError::Timeout { elapsed, limit, .. }) => {
///             println!("gave up after {elapsed:?} (limit {limit:?})");
///         }
///         Err(CircuitBreakerError::Inner(e)) => println!("upstream said: {e}"),
///         Ok(v) => println!("{v}"),
///     }
/// }
/// ```
#[derive(Debug, thiserror::Error)]
pub enum CircuitBreakerError<E> {
    /// Rejected without running the operation.
    ///
    /// Returned while the breaker is cooling down in **Open**, and in
    /// **HalfOpen** while another trial call is still in flight.
    #[error("circuit breaker '{breaker}' is open, retry after {retry_after:?}")]
    Open { breaker: String, retry_after: Duration },

    /// The operation did not settle within `call_timeout`. Counted as a failure.
    #[error("operation '{breaker}' timed out after {elapsed:?} (limit {limit:?})")]
    Timeout {
        breaker: String,
        elapsed: Duration,
        limit: Duration,
    },

    /// The operation's own error. Counted as a failure.
    #[error("{0}")]
    Inner(E),
}

impl<E> CircuitBreakerError<E> {
    /// How long the caller should back off, for rejections that carry one.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::Open { retry_after, .. } => Some(*retry_after),
            _ => None,
        }
    }

    pub fn into_inner(self) -> Option<E> {
        match self {
            Self::Inner(e) => Some(e),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// State
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitState {
    /// Normal operation; all calls pass through.
    Closed,
    /// Tripped; calls are rejected until the cooldown elapses.
    Open,
    /// Recovering; one trial call at a time is let through.
    HalfOpen,
}

// ---------------------------------------------------------------------------
// Config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CircuitBreakerConfig {
    /// When false, calls run directly and nothing is tracked.
    pub enabled: bool,
    /// Consecutive failures in **Closed** before the circuit opens.
    pub failure_threshold: u32,
    /// Successes in **HalfOpen** before the circuit closes.
    pub success_threshold: u32,
    /// Deadline for an individual call.
    pub call_timeout: Duration,
    /// How long the circuit stays open before a trial call is allowed.
    pub reset_timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self::from(&CircuitBreakerSettings::default())
    }
}

impl From<&CircuitBreakerSettings> for CircuitBreakerConfig {
    fn from(s: &CircuitBreakerSettings) -> Self {
        Self {
            enabled: s.enabled,
            failure_threshold: s.failure_threshold.max(1),
            success_threshold: s.success_threshold.max(1),
            call_timeout: Duration::from_millis(s.timeout_ms),
            reset_timeout: Duration::from_millis(s.reset_timeout_ms),
        }
    }
}

// ---------------------------------------------------------------------------
// Stats
// ---------------------------------------------------------------------------

/// Point-in-time snapshot of one breaker.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BreakerStats {
    pub name: String,
    pub state: CircuitState,
    pub enabled: bool,
    pub failure_count: u32,
    pub success_count: u32,
    pub total_requests: u64,
    pub total_failures: u64,
    pub created_at: DateTime<Utc>,
    pub last_failure_at: Option<DateTime<Utc>>,
    pub next_attempt_at: Option<DateTime<Utc>>,
}

impl BreakerStats {
    /// Time since the breaker was created.
    pub fn uptime(&self) -> Duration {
        (Utc::now() - self.created_at).to_std().unwrap_or_default()
    }
}

// ---------------------------------------------------------------------------
// Inner state (behind Mutex)
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct InnerState {
    state: CircuitState,
    failure_count: u32,
    success_count: u32,
    total_requests: u64,
    total_failures: u64,
    next_attempt: Option<Instant>,
    next_attempt_at: Option<DateTime<Utc>>,
    last_failure_at: Option<DateTime<Utc>>,
    /// Bumped on every transition and reset. Outcomes admitted under an older
    /// generation only touch the cumulative counters.
    generation: u64,
    /// Set while a HalfOpen trial call runs. A trial call can never outlive
    /// `call_timeout`, so a deadline in the past means the trial call was dropped.
    trial_deadline: Option<Instant>,
}

impl InnerState {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            failure_count: 0,
            success_count: 0,
            total_requests: 0,
            total_failures: 0,
            next_attempt: None,
            next_attempt_at: None,
            last_failure_at: None,
            generation: 0,
            trial_deadline: None,
        }
    }

    fn transition(&mut self, to: CircuitState) {
        self.state = to;
        self.failure_count = 0;
        self.success_count = 0;
        self.trial_deadline = None;
        self.generation += 1;
    }
}

enum Outcome {
    Success,
    Failure,
}

// ---------------------------------------------------------------------------
// CircuitBreaker
// ---------------------------------------------------------------------------

/// Breaker guarding one named upstream operation. Cloning shares state.
#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    name: Arc<str>,
    config: CircuitBreakerConfig,
    created_at: DateTime<Utc>,
    inner: Arc<Mutex<InnerState>>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            name: Arc::from(name.into()),
            config,
            created_at: Utc::now(),
            inner: Arc::new(Mutex::new(InnerState::new())),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    pub async fn state(&self) -> CircuitState {
        self.inner.lock().await.state
    }

    /// True when disabled or not **Open**.
    pub async fn is_healthy(&self) -> bool {
        !self.config.enabled || self.state().await != CircuitState::Open
    }

    /// Run `f` through the breaker.
    ///
    /// While **Open** and cooling down the call is rejected and `f` is never
    /// invoked. Once the cooldown has elapsed the next call moves the breaker
    /// to **HalfOpen** and runs as the trial call. The operation is raced against
    /// `call_timeout`; on timeout its future is dropped and the call counts as
    /// a failure.
    pub async fn execute<F, Fut, T, E>(&self, f: F) -> Result<T, CircuitBreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        if !self.config.enabled {
            return f().await.map_err(CircuitBreakerError::Inner);
        }

        let generation = self.admit().await?;

        let started = Instant::now();
        match tokio::time::timeout(self.config.call_timeout, f()).await {
            Ok(Ok(value)) => {
                self.record(generation, Outcome::Success).await;
                Ok(value)
            }
            Ok(Err(e)) => {
                self.record(generation, Outcome::Failure).await;
                Err(CircuitBreakerError::Inner(e))
            }
            Err(_elapsed) => {
                let elapsed = started.elapsed();
                warn!(breaker = %self.name, ?elapsed, limit = ?self.config.call_timeout, "operation timed out");
                self.record(generation, Outcome::Failure).await;
                Err(CircuitBreakerError::Timeout {
                    breaker: self.name.to_string(),
                    elapsed,
                    limit: self.config.call_timeout,
                })
            }
        }
    }

    /// Pre-flight: count the request and decide whether it may run.
    /// Returns the generation the call was admitted under.
    async fn admit<E>(&self) -> Result<u64, CircuitBreakerError<E>> {
        let mut guard = self.inner.lock().await;
        guard.total_requests += 1;
        let now = Instant::now();

        if guard.state == CircuitState::Open {
            match guard.next_attempt {
                Some(at) if now < at => {
                    return Err(self.open_error(at.saturating_duration_since(now)));
                }
                _ => {
                    info!(breaker = %self.name, "circuit breaker transitioning Open -> HalfOpen");
                    guard.transition(CircuitState::HalfOpen);
                }
            }
        }

        if guard.state == CircuitState::HalfOpen {
            if let Some(deadline) = guard.trial_deadline {
                if now < deadline {
                    debug!(breaker = %self.name, "trial call in flight, rejecting");
                    return Err(self.open_error(Duration::ZERO));
                }
            }
            guard.trial_deadline = Some(now + self.config.call_timeout);
        }

        Ok(guard.generation)
    }

    fn open_error<E>(&self, retry_after: Duration) -> CircuitBreakerError<E> {
        CircuitBreakerError::Open {
            breaker: self.name.to_string(),
            retry_after,
        }
    }

    async fn record(&self, generation: u64, outcome: Outcome) {
        let mut guard = self.inner.lock().await;

        if let Outcome::Failure = outcome {
            guard.total_failures += 1;
            guard.last_failure_at = Some(Utc::now());
        }

        if guard.generation != generation {
            debug!(breaker = %self.name, "discarding outcome from a previous generation");
            return;
        }

        match (guard.state, outcome) {
            (CircuitState::Closed, Outcome::Success) => {
                guard.failure_count = 0;
            }
            (CircuitState::Closed, Outcome::Failure) => {
                guard.failure_count += 1;
                if guard.failure_count >= self.config.failure_threshold {
                    warn!(
                        breaker = %self.name,
                        failures = guard.failure_count,
                        "circuit breaker transitioning Closed -> Open"
                    );
                    self.trip(&mut guard);
                }
            }
            (CircuitState::HalfOpen, Outcome::Success) => {
                guard.success_count += 1;
                guard.trial_deadline = None;
                if guard.success_count >= self.config.success_threshold {
                    info!(breaker = %self.name, "circuit breaker transitioning HalfOpen -> Closed");
                    guard.transition(CircuitState::Closed);
                    guard.next_attempt = None;
                    guard.next_attempt_at = None;
                }
            }
            (CircuitState::HalfOpen, Outcome::Failure) => {
                warn!(breaker = %self.name, "circuit breaker transitioning HalfOpen -> Open (trial call failed)");
                self.trip(&mut guard);
            }
            // Only reachable through a stale generation, handled above.
            (CircuitState::Open, _) => {}
        }
    }

    fn trip(&self, guard: &mut InnerState) {
        guard.transition(CircuitState::Open);
        guard.next_attempt = Some(Instant::now() + self.config.reset_timeout);
        guard.next_attempt_at = chrono::Duration::from_std(self.config.reset_timeout)
            .ok()
            .map(|d| Utc::now() + d);
    }

    /// Force **Closed** and clear the transition counters.
    ///
    /// `total_requests` and `total_failures` are monitoring counters and
    /// survive a reset. In-flight calls admitted before the reset cannot
    /// affect the new state.
    pub async fn reset(&self) {
        let mut guard = self.inner.lock().await;
        guard.transition(CircuitState::Closed);
        guard.next_attempt = None;
        guard.next_attempt_at = None;
        info!(breaker = %self.name, "circuit breaker manually reset");
    }

    /// Snapshot of state and counters. Does not mutate anything.
    pub async fn stats(&self) -> BreakerStats {
        let guard = self.inner.lock().await;
        BreakerStats {
            name: self.name.to_string(),
            state: guard.state,
            enabled: self.config.enabled,
            failure_count: guard.failure_count,
            success_count: guard.success_count,
            total_requests: guard.total_requests,
            total_failures: guard.total_failures,
            created_at: self.created_at,
            last_failure_at: guard.last_failure_at,
            next_attempt_at: guard.next_attempt_at,
        }
    }
}

// ---------------------------------------------------------------------------
// CircuitBreakerManager
// ---------------------------------------------------------------------------

/// Registry of breakers keyed by operation name.
///
/// Owned by the composition root and shared by reference. Breakers are
/// created on first reference and live as long as the manager.
#[derive(Debug, Default)]
pub struct CircuitBreakerManager {
    breakers: DashMap<String, CircuitBreaker>,
}

impl CircuitBreakerManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Existing breaker for `name`, or a new one built from `config`.
    ///
    /// The config of the first call wins; a differing config on later calls
    /// is ignored.
    pub fn get_breaker(&self, name: &str, config: &CircuitBreakerConfig) -> CircuitBreaker {
        if let Some(existing) = self.breakers.get(name) {
            if existing.config() != config {
                debug!(breaker = name, "ignoring config for already-registered breaker");
            }
            return existing.clone();
        }
        self.breakers
            .entry(name.to_string())
            .or_insert_with(|| {
                debug!(breaker = name, "registering circuit breaker");
                CircuitBreaker::new(name, config.clone())
            })
            .clone()
    }

    pub fn get(&self, name: &str) -> Option<CircuitBreaker> {
        self.breakers.get(name).map(|b| b.clone())
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.breakers.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    // Map guards are dropped before any await.
    fn snapshot(&self) -> Vec<CircuitBreaker> {
        self.breakers.iter().map(|e| e.value().clone()).collect()
    }

    pub async fn all_stats(&self) -> BTreeMap<String, BreakerStats> {
        let mut out = BTreeMap::new();
        for breaker in self.snapshot() {
            out.insert(breaker.name().to_string(), breaker.stats().await);
        }
        out
    }

    /// AND over every breaker's health; true when none are registered.
    pub async fn are_all_healthy(&self) -> bool {
        for breaker in self.snapshot() {
            if !breaker.is_healthy().await {
                return false;
            }
        }
        true
    }

    /// Names of breakers currently **Open**, sorted.
    pub async fn open_breakers(&self) -> Vec<String> {
        let mut open = Vec::new();
        for breaker in self.snapshot() {
            if breaker.state().await == CircuitState::Open {
                open.push(breaker.name().to_string());
            }
        }
        open.sort();
        open
    }

    /// Reset one breaker. Returns false if `name` is unknown.
    pub async fn reset(&self, name: &str) -> bool {
        match self.get(name) {
            Some(breaker) => {
                breaker.reset().await;
                true
            }
            None => false,
        }
    }

    pub async fn reset_all(&self) {
        for breaker in self.snapshot() {
            breaker.reset().await;
        }
    }
}
