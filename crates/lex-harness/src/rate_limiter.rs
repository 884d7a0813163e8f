use chrono::{DateTime, Utc};
use dashmap::{DashMap, DashSet};
use lex_core::config::RateLimitSettings;
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Lookback of the request window.
pub const WINDOW: Duration = Duration::from_secs(60);
/// Quiet period after which a client's burst counter decays to zero.
pub const BURST_DECAY: Duration = Duration::from_secs(10);
/// Length of the first penalty; later ones grow by `penalty_multiplier`.
pub const BASE_PENALTY: Duration = Duration::from_secs(60);
/// Clients seen within this span count as active in aggregate stats.
pub const ACTIVE_WINDOW: Duration = Duration::from_secs(300);

/// Longest single penalty. Far above any escalation a sane multiplier
/// reaches; guards float overflow in `BASE_PENALTY * multiplier^n`.
pub const MAX_PENALTY: Duration = Duration::from_secs(u32::MAX as u64);
/// Bucket key when per-client accounting is off.
const GLOBAL_KEY: &str = "global";
pub const ANONYMOUS_CLIENT: &str = "anonymous";

pub const CLIENT_ID_HEADER: &str = "x-client-id";
pub const FORWARDED_FOR_HEADER: &str = "x-forwarded-for";

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum RateLimitError {
    #[error("rate limit exceeded for client `{client_id}` ({reason}), retry after {retry_after_secs}s")]
    Exceeded {
        client_id: String,
        reason: DenyReason,
        retry_after_secs: u64,
    },
}

impl RateLimitError {
    pub fn retry_after(&self) -> Duration {
        match self {
            Self::Exceeded { retry_after_secs, .. } => Duration::from_secs(*retry_after_secs),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DenyReason {
    DenyListed,
    Penalized,
    BurstExceeded,
    WindowExceeded,
}

impl std::fmt::Display for DenyReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::DenyListed => "deny-listed",
            Self::Penalized => "penalized",
            Self::BurstExceeded => "burst exceeded",
            Self::WindowExceeded => "window exceeded",
        })
    }
}

// ---------------------------------------------------------------------------
// Config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    pub enabled: bool,
    pub requests_per_minute: u32,
    pub burst_size: u32,
    pub penalty_multiplier: f64,
    /// When false, every client is accounted under one shared bucket.
    pub per_client_enabled: bool,
    /// When false, the window resets wholesale every 60 s instead of rolling.
    pub sliding_window: bool,
    pub allow_list: Vec<String>,
    pub deny_list: Vec<String>,
    pub deny_retry_after: Duration,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self::from(&RateLimitSettings::default())
    }
}

impl From<&RateLimitSettings> for RateLimitConfig {
    fn from(s: &RateLimitSettings) -> Self {
        Self {
            enabled: s.enabled,
            requests_per_minute: s.requests_per_minute,
            burst_size: s.burst_size,
            penalty_multiplier: s.penalty_multiplier,
            per_client_enabled: s.per_client_enabled,
            sliding_window: s.sliding_window,
            allow_list: s.allow_list.clone(),
            deny_list: s.deny_list.clone(),
            deny_retry_after: Duration::from_secs(s.deny_retry_after_secs),
        }
    }
}

// ---------------------------------------------------------------------------
// Request metadata / client identity
// ---------------------------------------------------------------------------

/// Transport-agnostic view of an inbound request: headers (names lowercased)
/// plus the peer address when known.
#[derive(Debug, Clone, Default)]
pub struct RequestMeta {
    headers: HashMap<String, String>,
    remote_addr: Option<String>,
}

impl RequestMeta {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.insert(name.to_ascii_lowercase(), value.into());
        self
    }

    pub fn with_remote_addr(mut self, addr: impl Into<String>) -> Self {
        self.remote_addr = Some(addr.into());
        self
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(|v| v.trim())
            .filter(|v| !v.is_empty())
    }

    /// Client id header, then the first forwarded-for hop, then the peer
    /// address, then `"anonymous"`.
    pub fn client_id(&self) -> String {
        if let Some(id) = self.header(CLIENT_ID_HEADER) {
            return id.to_string();
        }
        if let Some(first) = self
            .header(FORWARDED_FOR_HEADER)
            .and_then(|v| v.split(',').next())
            .map(str::trim)
            .filter(|v| !v.is_empty())
        {
            return first.to_string();
        }
        if let Some(addr) = self.remote_addr.as_deref().filter(|a| !a.is_empty()) {
            return addr.to_string();
        }
        ANONYMOUS_CLIENT.to_string()
    }
}

// ---------------------------------------------------------------------------
// Decision / stats
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RateLimitDecision {
    pub allowed: bool,
    pub client_id: String,
    pub retry_after_secs: u64,
    /// Requests left in the current window; only set on normal admission.
    pub remaining: Option<u32>,
    pub reason: Option<DenyReason>,
}

impl RateLimitDecision {
    fn admit(client_id: String, remaining: Option<u32>) -> Self {
        Self {
            allowed: true,
            client_id,
            retry_after_secs: 0,
            remaining,
            reason: None,
        }
    }

    fn reject(client_id: String, reason: DenyReason, retry_after_secs: u64) -> Self {
        Self {
            allowed: false,
            client_id,
            retry_after_secs,
            remaining: None,
            reason: Some(reason),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClientStats {
    pub client_id: String,
    pub window_size: usize,
    pub burst_count: u32,
    pub penalty_count: u32,
    pub is_penalized: bool,
    pub penalty_ends_at: Option<DateTime<Utc>>,
    pub first_seen: DateTime<Utc>,
    pub last_request: Option<DateTime<Utc>>,
    pub last_tool: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RateLimiterStats {
    pub enabled: bool,
    pub total_clients: usize,
    pub allow_listed: usize,
    pub deny_listed: usize,
    pub penalized_clients: usize,
    pub active_clients: usize,
}

// ---------------------------------------------------------------------------
// Per-client state
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct WindowEntry {
    at: Instant,
    tool: String,
}

#[derive(Debug)]
struct ClientRateState {
    window: VecDeque<WindowEntry>,
    window_started: Instant,
    burst_count: u32,
    penalty_count: u32,
    penalty_until: Option<Instant>,
    penalty_ends_at: Option<DateTime<Utc>>,
    last_request: Option<Instant>,
    last_request_at: Option<DateTime<Utc>>,
    first_seen: DateTime<Utc>,
}

impl ClientRateState {
    fn new(now: Instant) -> Self {
        Self {
            window: VecDeque::new(),
            window_started: now,
            burst_count: 0,
            penalty_count: 0,
            penalty_until: None,
            penalty_ends_at: None,
            last_request: None,
            last_request_at: None,
            first_seen: Utc::now(),
        }
    }

    /// Age out the window and decay the burst counter.
    fn refresh(&mut self, now: Instant, sliding: bool) {
        if sliding {
            while let Some(front) = self.window.front() {
                if now.saturating_duration_since(front.at) >= WINDOW {
                    self.window.pop_front();
                } else {
                    break;
                }
            }
        } else if now.saturating_duration_since(self.window_started) >= WINDOW {
            self.window.clear();
            self.burst_count = 0;
            self.window_started = now;
        }

        let recent = self
            .window
            .back()
            .is_some_and(|e| now.saturating_duration_since(e.at) < BURST_DECAY);
        if !recent {
            self.burst_count = 0;
        }
    }

    fn penalty_remaining(&self, now: Instant) -> Option<Duration> {
        self.penalty_until
            .filter(|until| now < *until)
            .map(|until| until.saturating_duration_since(now))
    }

    fn is_penalized(&self, now: Instant) -> bool {
        self.penalty_remaining(now).is_some()
    }

    fn live_window_len(&self, now: Instant, sliding: bool) -> usize {
        if sliding {
            self.window
                .iter()
                .filter(|e| now.saturating_duration_since(e.at) < WINDOW)
                .count()
        } else if now.saturating_duration_since(self.window_started) >= WINDOW {
            0
        } else {
            self.window.len()
        }
    }
}

fn ceil_secs(d: Duration) -> u64 {
    d.as_secs_f64().ceil() as u64
}

// ---------------------------------------------------------------------------
// RateLimiter
// ---------------------------------------------------------------------------

/// Per-client admission control.
///
/// Client state is created on first request and kept in a concurrent map;
/// each admission mutates one entry under that entry's shard lock, so two
/// concurrent requests from the same client cannot both take the last slot.
/// Decay and penalty expiry are evaluated lazily on the next request.
#[derive(Debug)]
pub struct RateLimiter {
    config: RateLimitConfig,
    clients: DashMap<String, ClientRateState>,
    allow_list: DashSet<String>,
    deny_list: DashSet<String>,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        let allow_list: DashSet<String> = config.allow_list.iter().cloned().collect();
        let deny_list: DashSet<String> = config.deny_list.iter().cloned().collect();
        for id in allow_list.iter() {
            if deny_list.contains(id.key()) {
                warn!(client_id = %id.key(), "client on both allow and deny lists; allow wins");
            }
        }
        Self {
            config,
            clients: DashMap::new(),
            allow_list,
            deny_list,
        }
    }

    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    /// Decide whether `meta`'s client may call `tool` now, recording the
    /// request when admitted.
    pub fn check_limit(&self, meta: &RequestMeta, tool: &str) -> RateLimitDecision {
        let client_id = meta.client_id();

        if !self.config.enabled {
            return RateLimitDecision::admit(client_id, None);
        }
        if self.allow_list.contains(&client_id) {
            return RateLimitDecision::admit(client_id, None);
        }
        if self.deny_list.contains(&client_id) {
            let retry = self.config.deny_retry_after.as_secs();
            warn!(client_id = %client_id, tool, retry_after_secs = retry, "request from deny-listed client");
            return RateLimitDecision::reject(client_id, DenyReason::DenyListed, retry);
        }

        let key = self.bucket_key(&client_id).to_string();

        let now = Instant::now();
        let mut state = self
            .clients
            .entry(key)
            .or_insert_with(|| ClientRateState::new(now));
        state.refresh(now, self.config.sliding_window);

        if let Some(remaining) = state.penalty_remaining(now) {
            let retry = ceil_secs(remaining);
            warn!(client_id = %client_id, tool, retry_after_secs = retry, "client is penalized");
            return RateLimitDecision::reject(client_id, DenyReason::Penalized, retry);
        }

        let reason = if state.burst_count >= self.config.burst_size {
            Some(DenyReason::BurstExceeded)
        } else if state.window.len() >= self.config.requests_per_minute as usize {
            Some(DenyReason::WindowExceeded)
        } else {
            None
        };

        if let Some(reason) = reason {
            let duration = self.apply_penalty(&mut state, now);
            warn!(
                client_id = %client_id,
                tool,
                %reason,
                penalty_count = state.penalty_count,
                penalty_secs = duration.as_secs_f64(),
                "rate limit exceeded, penalty applied"
            );
            return RateLimitDecision::reject(client_id, reason, ceil_secs(duration));
        }

        state.window.push_back(WindowEntry {
            at: now,
            tool: tool.to_string(),
        });
        state.burst_count += 1;
        state.last_request = Some(now);
        state.last_request_at = Some(Utc::now());
        let remaining = (self.config.requests_per_minute as usize).saturating_sub(state.window.len());
        RateLimitDecision::admit(client_id, Some(remaining as u32))
    }

    /// [`RateLimiter::check_limit`] as a `Result`.
    pub fn admit(&self, meta: &RequestMeta, tool: &str) -> Result<RateLimitDecision, RateLimitError> {
        let decision = self.check_limit(meta, tool);
        if decision.allowed {
            Ok(decision)
        } else {
            Err(RateLimitError::Exceeded {
                client_id: decision.client_id,
                reason: decision.reason.unwrap_or(DenyReason::WindowExceeded),
                retry_after_secs: decision.retry_after_secs,
            })
        }
    }

    /// State key for a client: itself, or the shared bucket when per-client
    /// accounting is off.
    fn bucket_key<'a>(&self, client_id: &'a str) -> &'a str {
        if self.config.per_client_enabled {
            client_id
        } else {
            GLOBAL_KEY
        }
    }

    fn apply_penalty(&self, state: &mut ClientRateState, now: Instant) -> Duration {
        state.penalty_count += 1;
        let factor = self
            .config
            .penalty_multiplier
            .powi(state.penalty_count.saturating_sub(1) as i32);
        let duration = Duration::try_from_secs_f64(BASE_PENALTY.as_secs_f64() * factor)
            .unwrap_or(MAX_PENALTY)
            .min(MAX_PENALTY);
        state.penalty_until = now.checked_add(duration).or_else(|| now.checked_add(BASE_PENALTY));
        state.penalty_ends_at = chrono::Duration::from_std(duration).ok().map(|d| Utc::now() + d);
        state.burst_count = 0;
        duration
    }

    // -- Admin --------------------------------------------------------------

    pub fn allow_client(&self, client_id: &str) {
        info!(client_id, "client added to allow list");
        self.allow_list.insert(client_id.to_string());
    }

    pub fn deny_client(&self, client_id: &str) {
        info!(client_id, "client added to deny list");
        self.deny_list.insert(client_id.to_string());
    }

    pub fn remove_from_lists(&self, client_id: &str) {
        self.allow_list.remove(client_id);
        self.deny_list.remove(client_id);
    }

    /// Drop all accounting for one client, or for the shared bucket when
    /// per-client accounting is off. Returns false if there was none.
    pub fn reset_client(&self, client_id: &str) -> bool {
        self.clients.remove(self.bucket_key(client_id)).is_some()
    }

    /// Remove clients idle for at least `idle_for` that are not serving a
    /// penalty. Returns the number removed.
    pub fn prune_idle_clients(&self, idle_for: Duration) -> usize {
        let now = Instant::now();
        let before = self.clients.len();
        self.clients.retain(|_, state| {
            let idle = state
                .last_request
                .map(|t| now.saturating_duration_since(t) >= idle_for)
                .unwrap_or(true);
            !idle || state.is_penalized(now)
        });
        let removed = before.saturating_sub(self.clients.len());
        if removed > 0 {
            debug!(removed, "pruned idle rate-limit clients");
        }
        removed
    }

    // -- Stats --------------------------------------------------------------

    /// Read-only view of one client's accounting. With per-client accounting
    /// off every id resolves to the shared bucket, reported as `"global"`.
    pub fn client_stats(&self, client_id: &str) -> Option<ClientStats> {
        let now = Instant::now();
        let client_id = self.bucket_key(client_id);
        let state = self.clients.get(client_id)?;
        let sliding = self.config.sliding_window;
        let window_size = state.live_window_len(now, sliding);
        let recent = state
            .last_request
            .is_some_and(|t| now.saturating_duration_since(t) < BURST_DECAY);
        Some(ClientStats {
            client_id: client_id.to_string(),
            window_size,
            burst_count: if recent && window_size > 0 { state.burst_count } else { 0 },
            penalty_count: state.penalty_count,
            is_penalized: state.is_penalized(now),
            penalty_ends_at: state.penalty_ends_at.filter(|_| state.is_penalized(now)),
            first_seen: state.first_seen,
            last_request: state.last_request_at,
            last_tool: state.window.back().map(|e| e.tool.clone()),
        })
    }

    pub fn stats(&self) -> RateLimiterStats {
        let now = Instant::now();
        let mut penalized = 0;
        let mut active = 0;
        for entry in self.clients.iter() {
            if entry.is_penalized(now) {
                penalized += 1;
            }
            if entry
                .last_request
                .is_some_and(|t| now.saturating_duration_since(t) < ACTIVE_WINDOW)
            {
                active += 1;
            }
        }
        RateLimiterStats {
            enabled: self.config.enabled,
            total_clients: self.clients.len(),
            allow_listed: self.allow_list.len(),
            deny_listed: self.deny_list.len(),
            penalized_clients: penalized,
            active_clients: active,
        }
    }
}
