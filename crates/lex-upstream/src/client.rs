use crate::catalog::LegalTool;
use async_trait::async_trait;
use lex_core::config::UpstreamConfig;
use serde_json::{Map, Value};
use std::time::Duration;
use tracing::debug;

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

/// Failures talking to the legal-data service.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum UpstreamError {
    /// Connection failure, DNS, TLS, and similar.
    #[error("HTTP error: {0}")]
    Http(String),

    #[error("upstream returned status {status}: {message}")]
    Status { status: u16, message: String },

    /// The service itself throttled us (HTTP 429).
    #[error("upstream rate limited, retry after {retry_after_secs:?}s")]
    RateLimited { retry_after_secs: Option<u64> },

    #[error("upstream request timed out")]
    Timeout,

    #[error("could not parse upstream response: {0}")]
    Parse(String),
}

impl From<reqwest::Error> for UpstreamError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            UpstreamError::Timeout
        } else if err.is_decode() {
            UpstreamError::Parse(err.to_string())
        } else {
            UpstreamError::Http(err.to_string())
        }
    }
}

// ---------------------------------------------------------------------------
// LegalDataApi trait
// ---------------------------------------------------------------------------

/// The upstream legal-data service, one call per tool invocation.
///
/// `args` have already been validated by [`LegalTool::validate`].
#[async_trait]
pub trait LegalDataApi: Send + Sync {
    async fn call(&self, tool: LegalTool, args: &Map<String, Value>) -> Result<Value, UpstreamError>;
}

// ---------------------------------------------------------------------------
// CourtListenerClient
// ---------------------------------------------------------------------------

/// [`LegalDataApi`] over the CourtListener REST API.
pub struct CourtListenerClient {
    client: reqwest::Client,
    base_url: String,
    token: Option<String>,
}

impl CourtListenerClient {
    /// Build a client from config. `token` is the resolved API token, if any;
    /// anonymous access works with lower upstream quotas.
    pub fn new(config: &UpstreamConfig, token: Option<String>) -> Result<Self, UpstreamError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .user_agent(config.user_agent.clone())
            .build()?;
        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            token,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn has_token(&self) -> bool {
        self.token.is_some()
    }

    /// Full URL for `tool` with `args`, query string included.
    pub fn url_for(&self, tool: LegalTool, args: &Map<String, Value>) -> Result<reqwest::Url, UpstreamError> {
        let request = tool.request(args);
        let mut url = reqwest::Url::parse(&format!("{}{}", self.base_url, request.path))
            .map_err(|e| UpstreamError::Http(format!("invalid upstream URL: {e}")))?;
        if !request.query.is_empty() {
            url.query_pairs_mut().extend_pairs(request.query.iter());
        }
        Ok(url)
    }
}

#[async_trait]
impl LegalDataApi for CourtListenerClient {
    async fn call(&self, tool: LegalTool, args: &Map<String, Value>) -> Result<Value, UpstreamError> {
        let url = self.url_for(tool, args)?;
        debug!(tool = %tool, path = url.path(), "calling upstream");

        let mut req = self.client.get(url).header("accept", "application/json");
        if let Some(token) = &self.token {
            req = req.header("authorization", format!("Token {token}"));
        }
        let resp = req.send().await?;
        let status = resp.status();

        if status.as_u16() == 429 {
            let retry_after_secs = resp
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<u64>().ok());
            return Err(UpstreamError::RateLimited { retry_after_secs });
        }

        if !status.is_success() {
            let message = resp.text().await.unwrap_or_default();
            return Err(UpstreamError::Status {
                status: status.as_u16(),
                message: message.chars().take(500).collect(),
            });
        }

        resp.json::<Value>()
            .await
            .map_err(|e| UpstreamError::Parse(e.to_string()))
    }
}
