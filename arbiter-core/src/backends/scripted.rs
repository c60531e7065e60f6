//! A backend that answers with scripted text.

use async_trait::async_trait;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use super::Backend;
use crate::config::BackendConfig;
use crate::error::BackendErrorKind;

/// Returns a fixed reply (or a fixed failure) after an optional delay, and
/// records every prompt it receives and every call that ran to completion.
pub struct StaticBackend {
    name: String,
    reply: Result<String, BackendErrorKind>,
    delay: Duration,
    prompts: Mutex<Vec<String>>,
    completed: AtomicUsize,
}

impl StaticBackend {
    pub fn new(name: impl Into<String>, response: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            reply: Ok(response.into()),
            delay: Duration::ZERO,
            prompts: Mutex::new(Vec::new()),
            completed: AtomicUsize::new(0),
        }
    }

    pub fn failing(name: impl Into<String>, error: BackendErrorKind) -> Self {
        Self {
            reply: Err(error),
            ..Self::new(name, "")
        }
    }

    pub fn from_config(config: &BackendConfig) -> Self {
        Self::new(config.name.clone(), config.response.clone().unwrap_or_default())
            .with_delay(Duration::from_millis(config.delay_ms))
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Prompts received so far, in call order.
    pub fn received_prompts(&self) -> Vec<String> {
        self.prompts.lock().map(|p| p.clone()).unwrap_or_default()
    }

    /// Calls that returned. A call dropped mid-delay is not counted.
    pub fn completed_calls(&self) -> usize {
        self.completed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Backend for StaticBackend {
    fn name(&self) -> &str {
        &self.name
    }

    async fn invoke(&self, prompt: &str) -> Result<String, BackendErrorKind> {
        if let Ok(mut prompts) = self.prompts.lock() {
            prompts.push(prompt.to_string());
        }
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.completed.fetch_add(1, Ordering::SeqCst);
        self.reply.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_static_reply_and_recording() {
        let backend = StaticBackend::new("s", "fixed");
        assert_eq!(backend.invoke("one").await.unwrap(), "fixed");
        assert_eq!(backend.invoke("two").await.unwrap(), "fixed");
        assert_eq!(backend.received_prompts(), vec!["one", "two"]);
        assert_eq!(backend.completed_calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_call_is_not_completed() {
        let backend = StaticBackend::new("slow", "late").with_delay(Duration::from_secs(10));
        let abandoned =
            tokio::time::timeout(Duration::from_secs(1), backend.invoke("x")).await;
        assert!(abandoned.is_err());
        assert_eq!(backend.received_prompts(), vec!["x"]);
        assert_eq!(backend.completed_calls(), 0);
    }

    #[tokio::test]
    async fn test_failing_backend() {
        let backend = StaticBackend::failing("f", BackendErrorKind::RateLimited);
        assert_eq!(
            backend.invoke("x").await.unwrap_err(),
            BackendErrorKind::RateLimited
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_delay_is_applied() {
        let backend = StaticBackend::new("slow", "late").with_delay(Duration::from_secs(3));
        let start = tokio::time::Instant::now();
        backend.invoke("x").await.unwrap();
        assert!(start.elapsed() >= Duration::from_secs(3));
    }

    #[test]
    fn test_from_config() {
        let backend = StaticBackend::from_config(&BackendConfig::scripted("demo", "hi", 15));
        assert_eq!(backend.name(), "demo");
        assert_eq!(backend.delay, Duration::from_millis(15));
    }
}
