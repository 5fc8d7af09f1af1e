use async_trait::async_trait;
use log::warn;
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use super::call::ToolContext;
use super::definition::{Parameters, ToolDefinition};
use super::error::ToolError;
use super::Tool;
use crate::cache::CacheManager;

/// Re-runs a failing tool body up to `max_attempts` times with a fixed delay.
/// Input errors are returned immediately.
pub struct RetryTool {
    inner: Arc<dyn Tool>,
    max_attempts: usize,
    delay: Duration,
}

impl RetryTool {
    pub fn new(inner: Arc<dyn Tool>, max_attempts: usize, delay: Duration) -> Self {
        Self {
            inner,
            max_attempts: max_attempts.max(1),
            delay,
        }
    }
}

#[async_trait]
impl Tool for RetryTool {
    fn definition(&self) -> &ToolDefinition {
        self.inner.definition()
    }

    fn validate(&self, parameters: &Parameters) -> Result<(), ToolError> {
        self.inner.validate(parameters)
    }

    async fn execute(
        &self,
        parameters: &Parameters,
        context: &ToolContext,
    ) -> Result<Value, ToolError> {
        let mut attempt = 1;
        loop {
            match self.inner.execute(parameters, context).await {
                Ok(value) => return Ok(value),
                Err(err) if err.is_input_error() || attempt >= self.max_attempts => return Err(err),
                Err(err) => {
                    warn!(
                        "[{}] attempt {}/{} failed: {}",
                        self.name(),
                        attempt,
                        self.max_attempts,
                        err
                    );
                    tokio::time::sleep(self.delay).await;
                    attempt += 1;
                }
            }
        }
    }

    fn post_execute(&self, result: Value) -> Value {
        self.inner.post_execute(result)
    }

    fn on_error(&self, err: &ToolError) -> Option<Value> {
        self.inner.on_error(err)
    }
}

/// Serves repeated calls with identical parameters from the cache.
pub struct CachedTool {
    inner: Arc<dyn Tool>,
    cache: Arc<CacheManager>,
    namespace: String,
    ttl: Duration,
}

impl CachedTool {
    pub fn new(inner: Arc<dyn Tool>, cache: Arc<CacheManager>, ttl: Duration) -> Self {
        let namespace = format!("tool:{}", inner.name());
        Self {
            inner,
            cache,
            namespace,
            ttl,
        }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }
}

#[async_trait]
impl Tool for CachedTool {
    fn definition(&self) -> &ToolDefinition {
        self.inner.definition()
    }

    fn validate(&self, parameters: &Parameters) -> Result<(), ToolError> {
        self.inner.validate(parameters)
    }

    async fn execute(
        &self,
        parameters: &Parameters,
        context: &ToolContext,
    ) -> Result<Value, ToolError> {
        // Entries under keys that are never read again only go away in a sweep.
        if self.cache.auto_cleanup().is_some() {
            self.cache
                .clear_expired(Some(&self.namespace), Some(self.ttl));
        }

        let key = CacheManager::generate_key(parameters);
        self.cache
            .get_or_try_insert_with(&self.namespace, &key, Some(self.ttl), || {
                self.inner.execute(parameters, context)
            })
            .await
    }

    fn post_execute(&self, result: Value) -> Value {
        self.inner.post_execute(result)
    }

    fn on_error(&self, err: &ToolError) -> Option<Value> {
        self.inner.on_error(err)
    }
}

/// Allows at most `limit` executions inside any sliding window (one minute by default).
pub struct RateLimitedTool {
    inner: Arc<dyn Tool>,
    limit: u32,
    window: Duration,
    calls: Mutex<VecDeque<Instant>>,
}

impl RateLimitedTool {
    pub fn new(inner: Arc<dyn Tool>, calls_per_minute: u32) -> Self {
        Self {
            inner,
            limit: calls_per_minute.max(1),
            window: Duration::from_secs(60),
            calls: Mutex::new(VecDeque::new()),
        }
    }

    pub fn with_window(mut self, window: Duration) -> Self {
        self.window = window;
        self
    }

    fn acquire(&self) -> Result<(), ToolError> {
        let mut calls = self.calls.lock().unwrap_or_else(PoisonError::into_inner);
        let now = Instant::now();
        while let Some(oldest) = calls.front() {
            if now.duration_since(*oldest) >= self.window {
                calls.pop_front();
            } else {
                break;
            }
        }
        if calls.len() >= self.limit as usize {
            return Err(ToolError::RateLimited {
                tool: self.inner.name().to_string(),
                limit: self.limit,
            });
        }
        calls.push_back(now);
        Ok(())
    }
}

#[async_trait]
impl Tool for RateLimitedTool {
    fn definition(&self) -> &ToolDefinition {
        self.inner.definition()
    }

    fn validate(&self, parameters: &Parameters) -> Result<(), ToolError> {
        self.inner.validate(parameters)
    }

    async fn execute(
        &self,
        parameters: &Parameters,
        context: &ToolContext,
    ) -> Result<Value, ToolError> {
        self.acquire()?;
        self.inner.execute(parameters, context).await
    }

    fn post_execute(&self, result: Value) -> Value {
        self.inner.post_execute(result)
    }

    fn on_error(&self, err: &ToolError) -> Option<Value> {
        self.inner.on_error(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tool::{safe_execute, ToolBuilder};
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn flaky(failures: usize, counter: Arc<AtomicUsize>) -> Arc<dyn Tool> {
        Arc::new(
            ToolBuilder::new("flaky")
                .description("前几次调用失败")
                .handler(move |_, _| {
                    let n = counter.fetch_add(1, Ordering::SeqCst);
                    if n < failures {
                        Err(ToolError::execution(format!("failure #{n}")))
                    } else {
                        Ok(json!(n))
                    }
                })
                .build()
                .unwrap(),
        )
    }

    #[tokio::test]
    async fn retry_succeeds_after_transient_failures() {
        let counter = Arc::new(AtomicUsize::new(0));
        let tool = RetryTool::new(flaky(2, Arc::clone(&counter)), 3, Duration::ZERO);
        let response = safe_execute(&tool, "r", &Parameters::new(), &ToolContext::new()).await;
        assert!(response.success);
        assert_eq!(counter.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn retry_returns_last_error_when_exhausted() {
        let counter = Arc::new(AtomicUsize::new(0));
        let tool = RetryTool::new(flaky(5, Arc::clone(&counter)), 2, Duration::ZERO);
        let response = safe_execute(&tool, "r", &Parameters::new(), &ToolContext::new()).await;
        assert!(!response.success);
        assert_eq!(response.error_message(), "failure #1");
        assert_eq!(counter.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn cached_tool_skips_repeated_work() {
        let counter = Arc::new(AtomicUsize::new(0));
        let cache = Arc::new(CacheManager::default());
        let tool = CachedTool::new(flaky(0, Arc::clone(&counter)), Arc::clone(&cache), Duration::from_secs(60));
        let params = json!({"q": 1}).as_object().cloned().unwrap();

        let first = safe_execute(&tool, "a", &params, &ToolContext::new()).await;
        let second = safe_execute(&tool, "b", &params, &ToolContext::new()).await;
        assert_eq!(first.result, second.result);
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        assert_eq!(cache.stats().namespace_details.get("tool:flaky"), Some(&1));
    }

    #[tokio::test]
    async fn cached_tool_sweeps_expired_entries() {
        let counter = Arc::new(AtomicUsize::new(0));
        let cache = Arc::new(CacheManager::new(Duration::from_secs(3600), Duration::ZERO));
        let tool = CachedTool::new(flaky(0, Arc::clone(&counter)), Arc::clone(&cache), Duration::from_millis(1));

        for q in 0..50 {
            let params = json!({"q": q}).as_object().cloned().unwrap();
            assert!(safe_execute(&tool, "c", &params, &ToolContext::new()).await.success);
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
        let params = json!({"q": "last"}).as_object().cloned().unwrap();
        assert!(safe_execute(&tool, "c", &params, &ToolContext::new()).await.success);

        assert_eq!(counter.load(Ordering::SeqCst), 51);
        assert_eq!(cache.stats().namespace_details.get("tool:flaky"), Some(&1));
    }

    #[tokio::test]
    async fn rate_limit_rejects_calls_over_the_window_budget() {
        let counter = Arc::new(AtomicUsize::new(0));
        let tool = RateLimitedTool::new(flaky(0, counter), 2);
        let ctx = ToolContext::new();
        assert!(safe_execute(&tool, "1", &Parameters::new(), &ctx).await.success);
        assert!(safe_execute(&tool, "2", &Parameters::new(), &ctx).await.success);
        let third = safe_execute(&tool, "3", &Parameters::new(), &ctx).await;
        assert!(!third.success);
        assert!(third.error_message().contains("2 calls per minute"));
    }
}
