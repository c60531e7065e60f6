//! Wire messages exchanged over the websocket.
//!
//! Every server message is one JSON object with at least `model` and
//! `response`, the shape the browser page renders as `model: response`.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::types::{BackendResult, EvaluationOutcome, ScoreBreakdown};

/// `model` value of the final event.
pub const BEST_MODEL: &str = "Best Model";
/// `model` value of protocol error events.
pub const ERROR_MODEL: &str = "Error";

/// A prompt submitted by the client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientMessage {
    pub prompt: String,
}

impl ClientMessage {
    /// Parse one websocket text frame.
    pub fn parse(text: &str) -> Result<Self, String> {
        serde_json::from_str(text).map_err(|e| format!("Invalid message: {}", e))
    }
}

/// An event streamed to the client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerMessage {
    pub model: String,
    pub response: String,
    /// `<code>: <detail>` for a failed backend.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub elapsed_ms: Option<u64>,
    /// Present on the final event only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scores: Option<BTreeMap<String, ScoreBreakdown>>,
}

impl ServerMessage {
    /// Partial event for one backend completion.
    pub fn backend_result(result: &BackendResult) -> Self {
        Self {
            model: result.backend_name.clone(),
            response: result.response_text.clone(),
            error: result
                .error
                .as_ref()
                .map(|e| format!("{}: {}", e.code(), e)),
            elapsed_ms: Some(result.elapsed.as_millis() as u64),
            scores: None,
        }
    }

    /// Final event carrying the winner (or the no-winner label) and scores.
    pub fn outcome(outcome: &EvaluationOutcome) -> Self {
        Self {
            model: BEST_MODEL.to_string(),
            response: outcome.winner_label().to_string(),
            error: None,
            elapsed_ms: None,
            scores: Some(outcome.scores.clone()),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            model: ERROR_MODEL.to_string(),
            response: message.into(),
            error: None,
            elapsed_ms: None,
            scores: None,
        }
    }

    pub fn is_final(&self) -> bool {
        self.model == BEST_MODEL
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}
