use std::future::Future;
use std::time::Duration;

use log::warn;
use novel_core::config::LlmConfig;

use crate::error::AdapterError;

#[derive(Clone, Copy, Debug)]
pub struct RetryConfig {
    pub max_retries: usize,
    pub sleep: Duration,
}

impl RetryConfig {
    pub const fn new(max_retries: usize, sleep: Duration) -> Self {
        Self { max_retries, sleep }
    }

    pub fn from_llm_config(config: &LlmConfig) -> Self {
        Self::new(
            config.retry_times.max(1),
            Duration::from_millis(config.retry_delay_ms),
        )
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            sleep: Duration::from_secs(2),
        }
    }
}

/// Runs `f` up to `max_retries` times. Errors that cannot succeed on a retry
/// are returned as they are; otherwise the last error is wrapped in
/// [`AdapterError::RetryExhausted`].
pub async fn call_with_retry<F, Fut, T>(mut f: F, config: &RetryConfig) -> Result<T, AdapterError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, AdapterError>>,
{
    let attempts = config.max_retries.max(1);
    let mut last_error: Option<AdapterError> = None;

    for attempt in 1..=attempts {
        match f().await {
            Ok(value) => return Ok(value),
            Err(err) if !err.is_retryable() => return Err(err),
            Err(err) => {
                warn!(
                    "[call_with_retry] attempt {}/{} failed: {}",
                    attempt, attempts, err
                );
                if attempt < attempts {
                    tokio::time::sleep(config.sleep).await;
                }
                last_error = Some(err);
            }
        }
    }

    let err = last_error.unwrap_or(AdapterError::EmptyResponse);
    Err(AdapterError::retry_exhausted(attempts, err))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const FAST: RetryConfig = RetryConfig::new(3, Duration::from_millis(1));

    #[tokio::test]
    async fn succeeds_after_transient_failures() {
        let calls = AtomicUsize::new(0);
        let result = call_with_retry(
            || async {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(AdapterError::EmptyResponse)
                } else {
                    Ok("done")
                }
            },
            &FAST,
        )
        .await
        .unwrap();
        assert_eq!(result, "done");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn wraps_the_last_error_when_exhausted() {
        let err = call_with_retry(|| async { Err::<(), _>(AdapterError::EmptyResponse) }, &FAST)
            .await
            .unwrap_err();
        assert!(matches!(err, AdapterError::RetryExhausted { attempts: 3, .. }));
    }

    #[tokio::test]
    async fn stops_on_configuration_errors() {
        let calls = AtomicUsize::new(0);
        let err = call_with_retry(
            || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(AdapterError::InvalidConfig("bad".into()))
            },
            &FAST,
        )
        .await
        .unwrap_err();
        assert!(matches!(err, AdapterError::InvalidConfig(_)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn reads_retry_settings_from_config() {
        let config = LlmConfig {
            retry_times: 0,
            retry_delay_ms: 250,
            ..LlmConfig::default()
        };
        let retry = RetryConfig::from_llm_config(&config);
        assert_eq!(retry.max_retries, 1);
        assert_eq!(retry.sleep, Duration::from_millis(250));
    }
}
