use crate::catalog::LegalTool;
use crate::client::{LegalDataApi, UpstreamError};
use async_trait::async_trait;
use serde_json::{json, Map, Value};
use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

/// In-memory [`LegalDataApi`] for tests and offline runs.
///
/// Returns queued results in order, then a canned echo of the request.
/// Every call is recorded.
#[derive(Debug, Default)]
pub struct MockLegalApi {
    responses: Mutex<VecDeque<Result<Value, UpstreamError>>>,
    calls: Mutex<Vec<(LegalTool, Map<String, Value>)>>,
    delay: Option<Duration>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

impl MockLegalApi {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sleep this long before answering each call.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn push_response(&self, response: Result<Value, UpstreamError>) {
        lock(&self.responses).push_back(response);
    }

    pub fn calls(&self) -> Vec<(LegalTool, Map<String, Value>)> {
        lock(&self.calls).clone()
    }

    pub fn call_count(&self) -> usize {
        lock(&self.calls).len()
    }
}

#[async_trait]
impl LegalDataApi for MockLegalApi {
    async fn call(&self, tool: LegalTool, args: &Map<String, Value>) -> Result<Value, UpstreamError> {
        lock(&self.calls).push((tool, args.clone()));
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        let queued = lock(&self.responses).pop_front();
        queued.unwrap_or_else(|| Ok(json!({ "tool": tool.name(), "args": args })))
    }
}
