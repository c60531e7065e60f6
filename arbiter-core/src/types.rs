//! Core data types shared across the pipeline.

use crate::error::BackendErrorKind;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

/// A text passage stored in the semantic index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Passage {
    pub source_id: String,
    pub text: String,
}

impl Passage {
    pub fn new(source_id: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            source_id: source_id.into(),
            text: text.into(),
        }
    }
}

/// Passages ranked by similarity, most similar first.
///
/// May be empty when the index has nothing relevant; that is a valid result,
/// distinct from a retrieval failure.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetrievalResult {
    pub passages: Vec<Passage>,
}

impl RetrievalResult {
    pub fn new(passages: Vec<Passage>) -> Self {
        Self { passages }
    }

    pub fn empty() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.passages.is_empty()
    }

    pub fn len(&self) -> usize {
        self.passages.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Passage> {
        self.passages.iter()
    }
}

/// The prompt actually sent to every backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AugmentedPrompt {
    pub original_prompt: String,
    pub context: Vec<Passage>,
    pub combined_text: String,
}

/// Outcome of one backend invocation for one request.
#[derive(Debug, Clone, PartialEq)]
pub struct BackendResult {
    pub backend_name: String,
    /// Position of the backend in the configured order.
    pub slot: usize,
    pub response_text: String,
    pub elapsed: Duration,
    pub error: Option<BackendErrorKind>,
}

impl BackendResult {
    pub fn success(
        backend_name: impl Into<String>,
        slot: usize,
        response_text: impl Into<String>,
        elapsed: Duration,
    ) -> Self {
        Self {
            backend_name: backend_name.into(),
            slot,
            response_text: response_text.into(),
            elapsed,
            error: None,
        }
    }

    pub fn failure(
        backend_name: impl Into<String>,
        slot: usize,
        error: BackendErrorKind,
        elapsed: Duration,
    ) -> Self {
        Self {
            backend_name: backend_name.into(),
            slot,
            response_text: String::new(),
            elapsed,
            error: Some(error),
        }
    }

    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }
}

/// Per-axis scores for one successful backend response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoreBreakdown {
    pub backend_name: String,
    pub relevance: f64,
    pub coherence: f64,
    pub length: f64,
    pub total: f64,
}

impl ScoreBreakdown {
    /// Build a breakdown; `total` is always the sum of the three axes.
    pub fn new(backend_name: impl Into<String>, relevance: f64, coherence: f64, length: f64) -> Self {
        Self {
            backend_name: backend_name.into(),
            relevance,
            coherence,
            length,
            total: relevance + coherence + length,
        }
    }
}

/// Result of scoring every backend response of a request.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EvaluationOutcome {
    /// Scores of non-errored backends only.
    pub scores: BTreeMap<String, ScoreBreakdown>,
    /// Backends excluded from ranking because they failed, in configured order.
    pub errored: Vec<String>,
    /// `None` when every backend failed.
    pub winner: Option<String>,
}

/// Label sent in place of a winner name when no backend succeeded.
pub const NO_WINNER: &str = "No winner: all backends failed";

impl EvaluationOutcome {
    /// Winner name, or the explicit no-winner sentinel.
    pub fn winner_label(&self) -> &str {
        self.winner.as_deref().unwrap_or(NO_WINNER)
    }

    pub fn is_errored(&self, backend: &str) -> bool {
        self.errored.iter().any(|b| b == backend)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_score_total_is_sum() {
        let s = ScoreBreakdown::new("a", 2.0, 0.75, 80.0);
        assert_eq!(s.total, 82.75);
    }

    #[test]
    fn test_backend_result_constructors() {
        let ok = BackendResult::success("a", 0, "hi", Duration::from_millis(5));
        assert!(!ok.is_error());
        let err = BackendResult::failure(
            "b",
            1,
            BackendErrorKind::RateLimited,
            Duration::from_millis(5),
        );
        assert!(err.is_error());
        assert!(err.response_text.is_empty());
    }

    #[test]
    fn test_winner_label_sentinel() {
        let outcome = EvaluationOutcome::default();
        assert_eq!(outcome.winner_label(), NO_WINNER);

        let outcome = EvaluationOutcome {
            winner: Some("gpt-4".into()),
            ..Default::default()
        };
        assert_eq!(outcome.winner_label(), "gpt-4");
    }

    #[test]
    fn test_retrieval_result_empty() {
        let r = RetrievalResult::empty();
        assert!(r.is_empty());
        assert_eq!(r.len(), 0);
    }
}
