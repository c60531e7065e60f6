//! Scoring and ranking of backend responses.
//!
//! Three independent axes per successful response:
//!
//! 1. **Relevance**: how many retrieved passages share at least one word with
//!    the response (case-sensitive whitespace tokens).
//! 2. **Coherence**: the classifier's confidence when it labels the response
//!    acceptable, else 0.
//! 3. **Length**: the response's word count, or 0 outside the configured
//!    `[min_words, max_words]` window.
//!
//! The total is their sum. Errored backends are left out of the ranking.

use futures::future::join_all;
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::classifier::CoherenceClassifier;
use crate::config::EvaluationConfig;
use crate::types::{BackendResult, EvaluationOutcome, RetrievalResult, ScoreBreakdown};

pub struct Evaluator {
    classifier: Arc<dyn CoherenceClassifier>,
    config: EvaluationConfig,
}

impl std::fmt::Debug for Evaluator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Evaluator")
            .field("classifier", &self.classifier.name())
            .field("config", &self.config)
            .finish()
    }
}

impl Evaluator {
    pub fn new(classifier: Arc<dyn CoherenceClassifier>, config: EvaluationConfig) -> Self {
        Self { classifier, config }
    }

    pub fn config(&self) -> &EvaluationConfig {
        &self.config
    }

    /// Score every non-errored result and pick the winner.
    ///
    /// Ties go to the backend configured first. If the classifier fails for
    /// any response, coherence is 0 for every response of this evaluation.
    pub async fn evaluate(
        &self,
        results: &[BackendResult],
        retrieval: &RetrievalResult,
    ) -> EvaluationOutcome {
        let mut ordered: Vec<&BackendResult> = results.iter().collect();
        ordered.sort_by_key(|r| r.slot);

        let errored: Vec<String> = ordered
            .iter()
            .filter(|r| r.is_error())
            .map(|r| r.backend_name.clone())
            .collect();
        let succeeded: Vec<&BackendResult> =
            ordered.into_iter().filter(|r| !r.is_error()).collect();

        let coherence = self.coherence_scores(&succeeded).await;

        let mut scores = BTreeMap::new();
        let mut winner: Option<(&str, f64)> = None;
        for (result, coherence) in succeeded.iter().zip(coherence) {
            let breakdown = ScoreBreakdown::new(
                result.backend_name.clone(),
                relevance_score(&result.response_text, retrieval) as f64,
                coherence,
                length_score(&result.response_text, &self.config) as f64,
            );
            debug!(
                backend = %result.backend_name,
                relevance = breakdown.relevance,
                coherence = breakdown.coherence,
                length = breakdown.length,
                total = breakdown.total,
                "Scored response"
            );
            // Strictly greater keeps the earlier slot on ties.
            if winner.is_none_or(|(_, best)| breakdown.total > best) {
                winner = Some((result.backend_name.as_str(), breakdown.total));
            }
            scores.insert(result.backend_name.clone(), breakdown);
        }

        let winner = winner.map(|(name, _)| name.to_string());
        match &winner {
            Some(name) => info!(winner = %name, scored = scores.len(), errored = errored.len(), "Evaluation complete"),
            None => warn!(errored = errored.len(), "Evaluation complete with no successful backend"),
        }

        EvaluationOutcome {
            scores,
            errored,
            winner,
        }
    }

    async fn coherence_scores(&self, results: &[&BackendResult]) -> Vec<f64> {
        let calls = results
            .iter()
            .map(|r| self.classifier.classify(&r.response_text));
        let mut scores = Vec::with_capacity(results.len());
        for outcome in join_all(calls).await {
            match outcome {
                Ok(classification) => scores.push(classification.coherence()),
                Err(e) => {
                    warn!(error = %e, "Coherence classifier unavailable; scoring coherence as 0");
                    return vec![0.0; results.len()];
                }
            }
        }
        scores
    }
}

/// Number of passages sharing at least one word with `response`.
pub fn relevance_score(response: &str, retrieval: &RetrievalResult) -> usize {
    let words: HashSet<&str> = response.split_whitespace().collect();
    retrieval
        .iter()
        .filter(|p| p.text.split_whitespace().any(|w| words.contains(w)))
        .count()
}

/// Word count, or 0 outside `[min_words, max_words]`.
pub fn length_score(response: &str, config: &EvaluationConfig) -> usize {
    let count = response.split_whitespace().count();
    if count < config.min_words || count > config.max_words {
        0
    } else {
        count
    }
}
