//! The assembled request pipeline: retrieval, composition, fan-out, scoring.
//!
//! Built once at startup and shared read-only by every session.

use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::backends::BackendPool;
use crate::classifier::{CoherenceClassifier, create_classifier};
use crate::config::ArbiterConfig;
use crate::dispatcher::Dispatcher;
use crate::error::ArbiterError;
use crate::evaluator::Evaluator;
use crate::retrieval::Retriever;
use crate::types::RetrievalResult;

#[derive(Debug)]
pub struct Pipeline {
    retriever: Option<Retriever>,
    pool: BackendPool,
    dispatcher: Dispatcher,
    evaluator: Evaluator,
}

impl Pipeline {
    pub fn new(
        retriever: Option<Retriever>,
        pool: BackendPool,
        dispatcher: Dispatcher,
        evaluator: Evaluator,
    ) -> Self {
        Self {
            retriever,
            pool,
            dispatcher,
            evaluator,
        }
    }

    /// Build every component from configuration.
    ///
    /// Missing credentials or an unknown provider fail here, before any
    /// client connects.
    pub async fn from_config(config: &ArbiterConfig) -> Result<Self, ArbiterError> {
        config.validate()?;
        let retriever = Retriever::from_config(&config.retrieval).await?;
        let pool = BackendPool::from_config(&config.backends, config.dispatch.retry.clone())?;
        let dispatcher = Dispatcher::new(Duration::from_secs(config.dispatch.timeout_secs));
        let classifier: Arc<dyn CoherenceClassifier> = create_classifier(&config.classifier)?;
        let evaluator = Evaluator::new(classifier, config.evaluation.clone());

        info!(
            backends = ?pool.names(),
            retrieval = retriever.is_some(),
            timeout_secs = config.dispatch.timeout_secs,
            "Pipeline ready"
        );
        Ok(Self::new(retriever, pool, dispatcher, evaluator))
    }

    pub fn retriever(&self) -> Option<&Retriever> {
        self.retriever.as_ref()
    }

    pub fn pool(&self) -> &BackendPool {
        &self.pool
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    pub fn evaluator(&self) -> &Evaluator {
        &self.evaluator
    }

    /// Retrieve context for `prompt`, degrading to no context on failure.
    pub async fn retrieve_context(&self, prompt: &str) -> RetrievalResult {
        let Some(retriever) = &self.retriever else {
            return RetrievalResult::empty();
        };
        match retriever.retrieve_default(prompt).await {
            Ok(result) => {
                info!(passages = result.len(), "Retrieved context");
                result
            }
            Err(e) => {
                warn!(error = %e, degraded = true, "Retrieval unavailable; using unaugmented prompt");
                RetrievalResult::empty()
            }
        }
    }
}
