use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Top-level configuration loaded from `~/.lexgate/config.toml`.
///
/// **Security**: This struct NEVER stores API tokens or secrets. The upstream
/// token is resolved from the environment variable named in
/// [`UpstreamConfig::token_env`] via [`CredentialProvider`].
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub general: GeneralConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub upstream: UpstreamConfig,
    #[serde(default)]
    pub circuit_breaker: CircuitBreakerSettings,
    #[serde(default)]
    pub rate_limit: RateLimitSettings,
    #[serde(default)]
    pub cache: CacheSettings,
}

impl Config {
    /// Load config from `~/.lexgate/config.toml`, falling back to defaults
    /// when the file does not exist.
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::default_path();
        if path.exists() {
            Self::load_from(path)
        } else {
            let cfg = Config::default();
            cfg.validate()?;
            Ok(cfg)
        }
    }

    /// Load from a specific path.
    pub fn load_from(path: impl Into<PathBuf>) -> Result<Self, ConfigError> {
        let path = path.into();
        let text = std::fs::read_to_string(&path).map_err(|e| ConfigError::Io(e.to_string()))?;
        let cfg: Config = toml::from_str(&text).map_err(|e| ConfigError::Parse(e.to_string()))?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Serialize config to TOML string.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        self.validate()?;
        toml::to_string_pretty(self).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Apply `LEXGATE_*` environment overrides on top of file values.
    ///
    /// Unparseable values are ignored with a warning so a typo in the
    /// environment never prevents startup.
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides(|name| std::env::var(name).ok());
    }

    /// Same as [`Config::apply_env_overrides`] with an injectable lookup.
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(port) = lookup("LEXGATE_PORT") {
            match port.parse::<u16>() {
                Ok(p) => self.server.port = p,
                Err(_) => tracing::warn!(value = %port, "ignoring invalid LEXGATE_PORT"),
            }
        }
        if let Some(level) = lookup("LEXGATE_LOG_LEVEL") {
            if !level.trim().is_empty() {
                self.general.log_level = level;
            }
        }
        if let Some(url) = lookup("LEXGATE_UPSTREAM_URL") {
            if !url.trim().is_empty() {
                self.upstream.base_url = url;
            }
        }
    }

    /// Semantic validation for settings that are not fully expressible via type checks.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.server.validate()?;
        self.upstream.validate()?;
        self.circuit_breaker.validate()?;
        self.rate_limit.validate()?;
        self.cache.validate()?;
        Ok(())
    }

    fn default_path() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".lexgate")
            .join("config.toml")
    }
}

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("io: {0}")]
    Io(String),
    #[error("parse: {0}")]
    Parse(String),
    #[error("validation: {0}")]
    Validation(String),
}

// ---------------------------------------------------------------------------
// Section structs
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneralConfig {
    #[serde(default = "default_service_name")]
    pub service_name: String,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Emit JSON log lines instead of the human-readable format.
    #[serde(default)]
    pub json_logs: bool,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            service_name: default_service_name(),
            log_level: default_log_level(),
            json_logs: false,
        }
    }
}

fn default_service_name() -> String {
    "lexgate".into()
}
fn default_log_level() -> String {
    "info".into()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_server_host")]
    pub host: String,
    #[serde(default = "default_server_port")]
    pub port: u16,
    /// Port for the unauthenticated admin routes. Off when unset; the admin
    /// listener always binds to `host`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub admin_port: Option<u16>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_server_host(),
            port: default_server_port(),
            admin_port: None,
        }
    }
}

impl ServerConfig {
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn admin_bind_address(&self) -> Option<String> {
        self.admin_port.map(|port| format!("{}:{}", self.host, port))
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        match self.admin_port {
            Some(0) => Err(ConfigError::Validation("server.admin_port must be non-zero".into())),
            Some(port) if port == self.port => Err(ConfigError::Validation(
                "server.admin_port must differ from server.port".into(),
            )),
            _ => Ok(()),
        }
    }
}

fn default_server_host() -> String {
    "127.0.0.1".into()
}
fn default_server_port() -> u16 {
    8765
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpstreamConfig {
    #[serde(default = "default_upstream_url")]
    pub base_url: String,
    /// Name of the env var holding the API token (never the token itself).
    #[serde(default = "default_token_env")]
    pub token_env: String,
    /// Transport-level timeout for the HTTP client. The breaker's
    /// `timeout_ms` is the authoritative per-call deadline.
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            base_url: default_upstream_url(),
            token_env: default_token_env(),
            request_timeout_secs: default_request_timeout(),
            user_agent: default_user_agent(),
        }
    }
}

impl UpstreamConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        let url = self.base_url.trim();
        if url.is_empty() {
            return Err(ConfigError::Validation(
                "upstream.base_url must not be empty".to_string(),
            ));
        }
        if !(url.starts_with("http://") || url.starts_with("https://")) {
            return Err(ConfigError::Validation(format!(
                "upstream.base_url '{}' must start with http:// or https://",
                url
            )));
        }
        Ok(())
    }
}

fn default_upstream_url() -> String {
    "https://www.courtlistener.com/api/rest/v4".into()
}
fn default_token_env() -> String {
    "COURTLISTENER_API_TOKEN".into()
}
fn default_request_timeout() -> u64 {
    30
}
fn default_user_agent() -> String {
    "lexgate/0.1".into()
}

// ---------------------------------------------------------------------------
// Resilience settings
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerSettings {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Consecutive failures in CLOSED before the breaker opens.
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    /// Successes in HALF_OPEN before the breaker closes.
    #[serde(default = "default_success_threshold")]
    pub success_threshold: u32,
    /// Per-call deadline raced against the upstream operation.
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    /// Cooldown spent OPEN before a trial call is allowed.
    #[serde(default = "default_reset_timeout_ms")]
    pub reset_timeout_ms: u64,
}

impl Default for CircuitBreakerSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            failure_threshold: default_failure_threshold(),
            success_threshold: default_success_threshold(),
            timeout_ms: default_timeout_ms(),
            reset_timeout_ms: default_reset_timeout_ms(),
        }
    }
}

impl CircuitBreakerSettings {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.failure_threshold == 0 {
            return Err(ConfigError::Validation(
                "circuit_breaker.failure_threshold must be at least 1".to_string(),
            ));
        }
        if self.success_threshold == 0 {
            return Err(ConfigError::Validation(
                "circuit_breaker.success_threshold must be at least 1".to_string(),
            ));
        }
        if self.timeout_ms == 0 {
            return Err(ConfigError::Validation(
                "circuit_breaker.timeout_ms must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }
}

fn default_failure_threshold() -> u32 {
    5
}
fn default_success_threshold() -> u32 {
    2
}
fn default_timeout_ms() -> u64 {
    30_000
}
fn default_reset_timeout_ms() -> u64 {
    60_000
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitSettings {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_requests_per_minute")]
    pub requests_per_minute: u32,
    /// Requests admitted back-to-back before burst protection kicks in.
    #[serde(default = "default_burst_size")]
    pub burst_size: u32,
    /// Growth factor applied to each successive penalty.
    #[serde(default = "default_penalty_multiplier")]
    pub penalty_multiplier: f64,
    /// Track each client separately. When false all clients share one bucket.
    #[serde(default = "default_true")]
    pub per_client_enabled: bool,
    /// Rolling 60 s window. When false, windows are fixed and reset wholesale.
    #[serde(default = "default_true")]
    pub sliding_window: bool,
    #[serde(default)]
    pub allow_list: Vec<String>,
    #[serde(default)]
    pub deny_list: Vec<String>,
    #[serde(default = "default_deny_retry_after")]
    pub deny_retry_after_secs: u64,
    /// Periodically drop idle client state. Off unless set.
    #[serde(default)]
    pub idle_client_sweep_secs: Option<u64>,
}

impl Default for RateLimitSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            requests_per_minute: default_requests_per_minute(),
            burst_size: default_burst_size(),
            penalty_multiplier: default_penalty_multiplier(),
            per_client_enabled: true,
            sliding_window: true,
            allow_list: Vec::new(),
            deny_list: Vec::new(),
            deny_retry_after_secs: default_deny_retry_after(),
            idle_client_sweep_secs: None,
        }
    }
}

impl RateLimitSettings {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.requests_per_minute == 0 {
            return Err(ConfigError::Validation(
                "rate_limit.requests_per_minute must be at least 1".to_string(),
            ));
        }
        if self.burst_size == 0 || self.burst_size > self.requests_per_minute {
            return Err(ConfigError::Validation(format!(
                "rate_limit.burst_size must be between 1 and requests_per_minute ({})",
                self.requests_per_minute
            )));
        }
        if !self.penalty_multiplier.is_finite() || self.penalty_multiplier < 1.0 {
            return Err(ConfigError::Validation(
                "rate_limit.penalty_multiplier must be a finite number >= 1.0".to_string(),
            ));
        }
        if self.idle_client_sweep_secs == Some(0) {
            return Err(ConfigError::Validation(
                "rate_limit.idle_client_sweep_secs must be greater than 0 when set".to_string(),
            ));
        }
        Ok(())
    }
}

fn default_requests_per_minute() -> u32 {
    60
}
fn default_burst_size() -> u32 {
    10
}
fn default_penalty_multiplier() -> f64 {
    2.0
}
fn default_deny_retry_after() -> u64 {
    3600
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheSettings {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Default TTL, used for volatile data.
    #[serde(default = "default_cache_ttl")]
    pub ttl_seconds: u64,
    #[serde(default = "default_cache_max_size")]
    pub max_size: usize,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            ttl_seconds: default_cache_ttl(),
            max_size: default_cache_max_size(),
        }
    }
}

impl CacheSettings {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.enabled && self.max_size == 0 {
            return Err(ConfigError::Validation(
                "cache.max_size must be at least 1 when the cache is enabled".to_string(),
            ));
        }
        Ok(())
    }
}

fn default_cache_ttl() -> u64 {
    300
}
fn default_cache_max_size() -> usize {
    1000
}

fn default_true() -> bool {
    true
}

// ---------------------------------------------------------------------------
// Credential provider — reads secrets from environment at runtime
// ---------------------------------------------------------------------------

/// Reads credentials from environment variables at runtime.
///
/// Config stores env var *names*; this provider resolves them on demand.
pub struct CredentialProvider;

impl CredentialProvider {
    /// Read a credential from a named env var. Empty values count as unset.
    pub fn from_env(var_name: &str) -> Option<String> {
        std::env::var(var_name).ok().filter(|v| !v.trim().is_empty())
    }

    /// Resolve the upstream API token named by `upstream.token_env`.
    pub fn upstream_token(upstream: &UpstreamConfig) -> Option<String> {
        Self::from_env(&upstream.token_env)
    }
}
