//! Completion backend adapters and the ordered backend pool.
//!
//! Each provider gets one adapter implementing [`Backend`]. Adapters own the
//! provider's request shape and normalize whatever the provider returns
//! (choice lists, prediction outputs) into plain text. Failures never escape
//! a call: [`invoke_backend`] always yields a [`BackendResult`].
//!
//! - OpenAI-compatible chat completions ([`OpenAiChatBackend`])
//! - Replicate predictions ([`ReplicateBackend`])
//! - Scripted text for demos and tests ([`StaticBackend`])

pub mod openai;
pub mod replicate;
pub mod scripted;

pub use openai::OpenAiChatBackend;
pub use replicate::ReplicateBackend;
pub use scripted::StaticBackend;

use async_trait::async_trait;
use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::config::{BackendConfig, RetryConfig};
use crate::error::{BackendErrorKind, ConfigError};
use crate::types::BackendResult;

/// A named text-completion service.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Name reported to clients.
    fn name(&self) -> &str;

    /// Send `prompt` and return the normalized response text.
    async fn invoke(&self, prompt: &str) -> Result<String, BackendErrorKind>;
}

/// Create a backend adapter from its configuration.
pub fn create_backend(config: &BackendConfig) -> Result<Arc<dyn Backend>, ConfigError> {
    match config.provider.as_str() {
        "openai" => Ok(Arc::new(OpenAiChatBackend::new(config)?)),
        "replicate" => Ok(Arc::new(ReplicateBackend::new(config)?)),
        "static" => Ok(Arc::new(StaticBackend::from_config(config))),
        other => Err(ConfigError::Invalid {
            message: format!(
                "backend '{}' has unknown provider '{}'",
                config.name, other
            ),
        }),
    }
}

/// The fixed, ordered set of backends compared for every request.
pub struct BackendPool {
    backends: Vec<Arc<dyn Backend>>,
    retry: RetryConfig,
}

impl std::fmt::Debug for BackendPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackendPool")
            .field("backends", &self.names())
            .field("max_retries", &self.retry.max_retries)
            .finish()
    }
}

impl BackendPool {
    /// Build a pool. Names must be unique and the pool non-empty.
    pub fn new(backends: Vec<Arc<dyn Backend>>) -> Result<Self, ConfigError> {
        if backends.is_empty() {
            return Err(ConfigError::Invalid {
                message: "backend pool must not be empty".into(),
            });
        }
        let mut seen = HashSet::new();
        for backend in &backends {
            if !seen.insert(backend.name().to_string()) {
                return Err(ConfigError::Invalid {
                    message: format!("duplicate backend name '{}'", backend.name()),
                });
            }
        }
        Ok(Self {
            backends,
            retry: RetryConfig::default(),
        })
    }

    /// Build every configured backend in order.
    pub fn from_config(configs: &[BackendConfig], retry: RetryConfig) -> Result<Self, ConfigError> {
        let backends = configs
            .iter()
            .map(create_backend)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self::new(backends)?.with_retry(retry))
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    pub fn len(&self) -> usize {
        self.backends.len()
    }

    pub fn is_empty(&self) -> bool {
        self.backends.is_empty()
    }

    /// Backend names in configured order.
    pub fn names(&self) -> Vec<String> {
        self.backends.iter().map(|b| b.name().to_string()).collect()
    }

    pub fn get(&self, slot: usize) -> Option<&Arc<dyn Backend>> {
        self.backends.get(slot)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<dyn Backend>> {
        self.backends.iter()
    }

    pub fn retry_config(&self) -> &RetryConfig {
        &self.retry
    }
}

/// Invoke one backend, folding any failure into the result.
pub async fn invoke_backend(
    backend: &dyn Backend,
    slot: usize,
    prompt: &str,
    retry: &RetryConfig,
) -> BackendResult {
    let start = Instant::now();
    let outcome = with_retry(retry, || backend.invoke(prompt)).await;
    let elapsed = start.elapsed();
    match outcome {
        Ok(text) => BackendResult::success(backend.name(), slot, text, elapsed),
        Err(kind) => BackendResult::failure(backend.name(), slot, kind, elapsed),
    }
}

/// Execute an async operation with exponential backoff retry on transient errors.
///
/// Retries on `RateLimited` and `NetworkError`. Everything else returns immediately.
pub async fn with_retry<F, Fut, T>(config: &RetryConfig, operation: F) -> Result<T, BackendErrorKind>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T, BackendErrorKind>>,
{
    let mut attempt = 0;
    loop {
        match operation().await {
            Ok(val) => return Ok(val),
            Err(e) => {
                if !e.is_transient() || attempt >= config.max_retries {
                    return Err(e);
                }
                let backoff_ms = compute_backoff(config, attempt);
                tracing::warn!(
                    attempt = attempt + 1,
                    max = config.max_retries,
                    backoff_ms = backoff_ms,
                    error = %e,
                    "Retrying backend after transient error"
                );
                tokio::time::sleep(Duration::from_millis(backoff_ms)).await;
                attempt += 1;
            }
        }
    }
}

/// Exponential backoff with up to 25% jitter, capped at `max_backoff_ms`.
fn compute_backoff(config: &RetryConfig, attempt: u32) -> u64 {
    let base = config.initial_backoff_ms as f64 * config.backoff_multiplier.powi(attempt as i32);
    let capped = base.min(config.max_backoff_ms as f64) as u64;
    let jitter = (capped as f64 * 0.25 * jitter_fraction()) as u64;
    capped + jitter
}

fn jitter_fraction() -> f64 {
    use std::time::SystemTime;
    let nanos = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .subsec_nanos();
    (nanos % 1000) as f64 / 1000.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn scripted(name: &str) -> Arc<dyn Backend> {
        Arc::new(StaticBackend::new(name, "ok"))
    }

    #[test]
    fn test_pool_rejects_duplicates() {
        let err = BackendPool::new(vec![scripted("a"), scripted("a")]).unwrap_err();
        assert!(err.to_string().contains("duplicate backend name 'a'"));
    }

    #[test]
    fn test_pool_rejects_empty() {
        assert!(BackendPool::new(Vec::new()).is_err());
    }

    #[test]
    fn test_pool_preserves_order() {
        let pool = BackendPool::new(vec![scripted("z"), scripted("a"), scripted("m")]).unwrap();
        assert_eq!(pool.names(), vec!["z", "a", "m"]);
        assert_eq!(pool.len(), 3);
        assert_eq!(pool.get(1).unwrap().name(), "a");
    }

    #[test]
    fn test_from_config_unknown_provider() {
        let mut cfg = BackendConfig::scripted("x", "y", 0);
        cfg.provider = "carrier-pigeon".into();
        let err = BackendPool::from_config(&[cfg], RetryConfig::default()).unwrap_err();
        assert!(err.to_string().contains("unknown provider"));
    }

    #[tokio::test]
    async fn test_invoke_backend_wraps_failure() {
        let backend = StaticBackend::failing("down", BackendErrorKind::AuthFailure);
        let result = invoke_backend(&backend, 2, "hi", &RetryConfig::default()).await;
        assert_eq!(result.backend_name, "down");
        assert_eq!(result.slot, 2);
        assert_eq!(result.error, Some(BackendErrorKind::AuthFailure));
    }

    #[tokio::test(start_paused = true)]
    async fn test_with_retry_retries_transient_then_succeeds() {
        let calls = AtomicU32::new(0);
        let config = RetryConfig {
            max_retries: 3,
            initial_backoff_ms: 10,
            max_backoff_ms: 100,
            backoff_multiplier: 2.0,
        };
        let result = with_retry(&config, || async {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            if n < 2 {
                Err(BackendErrorKind::RateLimited)
            } else {
                Ok("done")
            }
        })
        .await;
        assert_eq!(result.unwrap(), "done");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_with_retry_does_not_retry_permanent() {
        let calls = AtomicU32::new(0);
        let config = RetryConfig {
            max_retries: 5,
            ..RetryConfig::default()
        };
        let result: Result<(), _> = with_retry(&config, || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(BackendErrorKind::AuthFailure)
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_with_retry_disabled_by_default() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = with_retry(&RetryConfig::default(), || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(BackendErrorKind::RateLimited)
        })
        .await;
        assert_eq!(result.unwrap_err(), BackendErrorKind::RateLimited);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_backoff_is_capped() {
        let config = RetryConfig {
            max_retries: 10,
            initial_backoff_ms: 1000,
            max_backoff_ms: 2000,
            backoff_multiplier: 10.0,
        };
        let b = compute_backoff(&config, 5);
        assert!((2000..=2500).contains(&b));
    }
}
