//! Linguistic acceptability classification for the coherence score.
//!
//! A classifier is created once at startup and shared read-only by every
//! evaluation. Labels are normalized to [`ACCEPTABLE`] / [`UNACCEPTABLE`] so
//! scoring does not depend on how a given model names its classes.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Value, json};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use crate::config::{ClassifierConfig, resolve_api_key};
use crate::error::{ClassifierError, ConfigError};

pub const ACCEPTABLE: &str = "acceptable";
pub const UNACCEPTABLE: &str = "unacceptable";

/// Top label and its confidence for one text.
#[derive(Debug, Clone, PartialEq)]
pub struct Classification {
    pub label: String,
    pub score: f64,
}

impl Classification {
    pub fn new(label: impl Into<String>, score: f64) -> Self {
        Self {
            label: label.into(),
            score,
        }
    }

    pub fn is_acceptable(&self) -> bool {
        self.label == ACCEPTABLE
    }

    /// Coherence points: the confidence when acceptable, else 0.
    pub fn coherence(&self) -> f64 {
        if self.is_acceptable() && self.score.is_finite() {
            self.score.clamp(0.0, 1.0)
        } else {
            0.0
        }
    }
}

#[async_trait]
pub trait CoherenceClassifier: Send + Sync {
    async fn classify(&self, text: &str) -> Result<Classification, ClassifierError>;

    fn name(&self) -> &str;
}

/// Build the classifier named by the configuration.
pub fn create_classifier(
    config: &ClassifierConfig,
) -> Result<Arc<dyn CoherenceClassifier>, ConfigError> {
    match config.provider.as_str() {
        "huggingface" => {
            let token = resolve_api_key(&config.api_key_env)?;
            Ok(Arc::new(HuggingFaceClassifier::new(token, config)))
        }
        "none" => Ok(Arc::new(FixedClassifier::new(ACCEPTABLE, 0.0))),
        other => Err(ConfigError::Invalid {
            message: format!("unknown classifier provider '{}'", other),
        }),
    }
}

/// Hugging Face Inference API text-classification.
pub struct HuggingFaceClassifier {
    client: reqwest::Client,
    token: String,
    model: String,
    base_url: String,
    acceptable_label: String,
}

#[derive(Debug, Deserialize)]
struct LabelScore {
    label: String,
    score: f64,
}

impl HuggingFaceClassifier {
    pub fn new(token: String, config: &ClassifierConfig) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs.max(1)))
            .build()
            .unwrap_or_default();
        Self {
            client,
            token,
            model: config.model.clone(),
            base_url: config
                .base_url
                .clone()
                .unwrap_or_else(|| "https://api-inference.huggingface.co".into())
                .trim_end_matches('/')
                .to_string(),
            acceptable_label: config.acceptable_label.clone(),
        }
    }

    /// Pick the highest-scoring label from `[[{label, score}, ..]]` or
    /// `[{label, score}, ..]`.
    fn parse_top(body: &Value) -> Option<LabelScore> {
        let outer = body.as_array()?;
        let candidates = match outer.first()? {
            Value::Array(inner) => inner,
            _ => outer,
        };
        candidates
            .iter()
            .filter_map(|v| serde_json::from_value::<LabelScore>(v.clone()).ok())
            .max_by(|a, b| a.score.total_cmp(&b.score))
    }

    /// Map a model label onto acceptable/unacceptable.
    fn normalize_label(&self, label: &str) -> &'static str {
        if label.eq_ignore_ascii_case(&self.acceptable_label) || label == "LABEL_1" {
            ACCEPTABLE
        } else {
            UNACCEPTABLE
        }
    }
}

#[async_trait]
impl CoherenceClassifier for HuggingFaceClassifier {
    async fn classify(&self, text: &str) -> Result<Classification, ClassifierError> {
        let url = format!("{}/models/{}", self.base_url, self.model);
        let body = json!({
            "inputs": text,
            "options": { "wait_for_model": true },
        });

        let resp = self
            .client
            .post(&url)
            .bearer_auth(&self.token)
            .json(&body)
            .send()
            .await
            .map_err(|e| ClassifierError::Unavailable {
                message: format!("classification request failed: {}", e),
            })?;

        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(ClassifierError::Unavailable {
                message: format!("HTTP {}: {}", status, text),
            });
        }

        let json: Value = resp.json().await.map_err(|e| ClassifierError::Unavailable {
            message: format!("invalid JSON: {}", e),
        })?;
        let top = Self::parse_top(&json).ok_or_else(|| ClassifierError::Unavailable {
            message: "unexpected text-classification payload".into(),
        })?;
        debug!(model = %self.model, label = %top.label, score = top.score, "Classified response");
        Ok(Classification::new(self.normalize_label(&top.label), top.score))
    }

    fn name(&self) -> &str {
        &self.model
    }
}

/// Answers every text with the same classification.
pub struct FixedClassifier {
    answer: Classification,
}

impl FixedClassifier {
    pub fn new(label: impl Into<String>, score: f64) -> Self {
        Self {
            answer: Classification::new(label, score),
        }
    }
}

#[async_trait]
impl CoherenceClassifier for FixedClassifier {
    async fn classify(&self, _text: &str) -> Result<Classification, ClassifierError> {
        Ok(self.answer.clone())
    }

    fn name(&self) -> &str {
        "fixed"
    }
}

/// Always fails; stands in for an unreachable inference service.
pub struct UnavailableClassifier;

#[async_trait]
impl CoherenceClassifier for UnavailableClassifier {
    async fn classify(&self, _text: &str) -> Result<Classification, ClassifierError> {
        Err(ClassifierError::Unavailable {
            message: "classifier disabled".into(),
        })
    }

    fn name(&self) -> &str {
        "unavailable"
    }
}
