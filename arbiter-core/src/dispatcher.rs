//! Concurrent fan-out of one augmented prompt to every backend.
//!
//! Each backend runs in its own task with its own deadline and reports into a
//! shared completion channel, so results arrive in completion order and a slow
//! or failing backend never holds up the others. The channel closes once every
//! task has reported, which is the "all backends complete" signal.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::backends::{BackendPool, invoke_backend};
use crate::error::BackendErrorKind;
use crate::types::{AugmentedPrompt, BackendResult};

/// Launches backend calls and enforces the per-call deadline.
#[derive(Debug, Clone)]
pub struct Dispatcher {
    timeout: Duration,
}

impl Dispatcher {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Invoke every backend in `pool` concurrently with the same prompt text.
    ///
    /// Cancelling `cancel` or dropping the returned [`Dispatch`] aborts the
    /// calls still in flight; their results are discarded.
    pub fn dispatch(
        &self,
        prompt: &AugmentedPrompt,
        pool: &BackendPool,
        cancel: CancellationToken,
    ) -> Dispatch {
        let (tx, rx) = mpsc::channel(pool.len().max(1));
        let mut tasks = JoinSet::new();
        let text: Arc<str> = Arc::from(prompt.combined_text.as_str());
        let timeout = self.timeout;
        let timeout_ms = timeout.as_millis() as u64;

        for (slot, backend) in pool.iter().enumerate() {
            let backend = Arc::clone(backend);
            let text = Arc::clone(&text);
            let tx = tx.clone();
            let cancel = cancel.clone();
            let retry = pool.retry_config().clone();

            tasks.spawn(async move {
                let name = backend.name().to_string();
                let call = tokio::time::timeout(
                    timeout,
                    invoke_backend(backend.as_ref(), slot, &text, &retry),
                );
                let result = tokio::select! {
                    _ = cancel.cancelled() => {
                        debug!(backend = %name, "Backend call cancelled");
                        return;
                    }
                    outcome = call => match outcome {
                        Ok(result) => result,
                        Err(_) => {
                            warn!(backend = %name, timeout_ms, "Backend call timed out");
                            BackendResult::failure(
                                name.clone(),
                                slot,
                                BackendErrorKind::Timeout { timeout_ms },
                                timeout,
                            )
                        }
                    },
                };

                match &result.error {
                    None => info!(
                        backend = %name,
                        elapsed_ms = result.elapsed.as_millis() as u64,
                        chars = result.response_text.len(),
                        "Backend responded"
                    ),
                    Some(err) => warn!(
                        backend = %name,
                        elapsed_ms = result.elapsed.as_millis() as u64,
                        error = %err,
                        "Backend failed"
                    ),
                }
                // Receiver gone means the session was torn down.
                let _ = tx.send(result).await;
            });
        }

        Dispatch {
            rx,
            tasks,
            expected: pool.len(),
            received: 0,
        }
    }
}

/// Handle to an in-flight fan-out.
///
/// Yields results in completion order. Dropping it aborts outstanding calls.
pub struct Dispatch {
    rx: mpsc::Receiver<BackendResult>,
    tasks: JoinSet<()>,
    expected: usize,
    received: usize,
}

impl Dispatch {
    /// Next completed result, or `None` once every backend has reported
    /// (or the dispatch was cancelled).
    pub async fn next(&mut self) -> Option<BackendResult> {
        let result = self.rx.recv().await;
        if result.is_some() {
            self.received += 1;
        }
        result
    }

    /// Number of backends this dispatch was launched for.
    pub fn expected(&self) -> usize {
        self.expected
    }

    /// Whether every backend has reported.
    pub fn is_complete(&self) -> bool {
        self.received == self.expected
    }

    /// Abort every call still in flight.
    pub fn abort(&mut self) {
        self.tasks.abort_all();
        self.rx.close();
    }

    /// Drain every result, in completion order.
    pub async fn collect(mut self) -> Vec<BackendResult> {
        let mut results = Vec::with_capacity(self.expected);
        while let Some(result) = self.next().await {
            results.push(result);
        }
        results
    }
}
