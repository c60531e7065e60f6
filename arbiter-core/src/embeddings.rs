//! Pluggable embedding providers for retrieval.
//!
//! Provides a trait-based abstraction over embedding models, with
//! implementations for the Hugging Face Inference API (default, matching the
//! index's `all-MiniLM-L6-v2` vector space), the OpenAI API, and a local
//! hashed term-frequency embedder that needs no network.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::time::Duration;

use crate::config::{EmbedderConfig, resolve_api_key};
use crate::error::{ConfigError, RetrievalError};

/// Trait for embedding providers.
#[async_trait]
pub trait Embedder: Send + Sync {
    /// Generate an embedding for a single text.
    async fn embed(&self, text: &str) -> Result<Vec<f32>, RetrievalError>;

    /// Return the dimensionality of embeddings.
    fn dimensions(&self) -> usize;

    /// Return the provider name.
    fn provider_name(&self) -> &str;
}

/// Per-request deadline for remote embedders unless overridden.
pub const DEFAULT_EMBED_TIMEOUT: Duration = Duration::from_secs(10);

fn http_client(timeout: Duration) -> reqwest::Client {
    reqwest::Client::builder()
        .timeout(timeout)
        .build()
        .unwrap_or_default()
}

/// Build the embedder named by the configuration. Remote embedders give up on
/// a request after `timeout`.
pub fn create_embedder(
    config: &EmbedderConfig,
    timeout: Duration,
) -> Result<std::sync::Arc<dyn Embedder>, ConfigError> {
    match config.provider.as_str() {
        "huggingface" => {
            let token = resolve_api_key(&config.api_key_env)?;
            Ok(std::sync::Arc::new(HuggingFaceEmbedder::new(
                token,
                config.model.clone(),
                config.base_url.clone(),
                config.dimensions,
            )
            .with_timeout(timeout)))
        }
        "openai" => {
            let key = resolve_api_key(&config.api_key_env)?;
            Ok(std::sync::Arc::new(OpenAiEmbedder::new(
                key,
                Some(config.model.clone()),
                config.base_url.clone(),
            )
            .with_timeout(timeout)))
        }
        "local" => Ok(std::sync::Arc::new(LocalEmbedder::new(config.dimensions))),
        other => Err(ConfigError::Invalid {
            message: format!("unknown embedder provider '{}'", other),
        }),
    }
}

/// Local hashed term-frequency embedder (no external dependencies).
#[derive(Debug, Clone)]
pub struct LocalEmbedder {
    dimensions: usize,
}

impl LocalEmbedder {
    pub fn new(dimensions: usize) -> Self {
        Self {
            dimensions: dimensions.max(1),
        }
    }

    fn embed_now(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0.0f32; self.dimensions];

        let lowered = text.to_lowercase();
        let mut tf: HashMap<&str, usize> = HashMap::new();
        for word in lowered
            .split(|c: char| !c.is_alphanumeric())
            .filter(|w| !w.is_empty())
        {
            *tf.entry(word).or_insert(0) += 1;
        }

        for (term, count) in &tf {
            let idx = simple_hash(term) % self.dimensions;
            vector[idx] += *count as f32;
        }

        // L2 normalize
        let norm: f32 = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > 0.0 {
            for v in &mut vector {
                *v /= norm;
            }
        }
        vector
    }
}

/// djb2 string hash.
fn simple_hash(s: &str) -> usize {
    let mut hash: usize = 5381;
    for b in s.bytes() {
        hash = hash.wrapping_mul(33).wrapping_add(b as usize);
    }
    hash
}

#[async_trait]
impl Embedder for LocalEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, RetrievalError> {
        Ok(self.embed_now(text))
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }

    fn provider_name(&self) -> &str {
        "local"
    }
}

/// Hugging Face Inference API embedder (feature-extraction pipeline).
pub struct HuggingFaceEmbedder {
    client: reqwest::Client,
    token: String,
    model: String,
    base_url: String,
    dims: usize,
}

impl HuggingFaceEmbedder {
    pub fn new(token: String, model: String, base_url: Option<String>, dims: usize) -> Self {
        Self {
            client: http_client(DEFAULT_EMBED_TIMEOUT),
            token,
            model,
            base_url: base_url
                .unwrap_or_else(|| "https://api-inference.huggingface.co".into()),
            dims,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.client = http_client(timeout);
        self
    }

    /// Sentence-transformer models return a flat vector; plain encoders return
    /// one vector per token, which is mean-pooled here.
    fn parse_vector(body: &Value) -> Option<Vec<f32>> {
        let arr = body.as_array()?;
        // Unwrap a single-input batch: [[...]] or [[[...]]].
        let arr = match arr.first() {
            Some(Value::Array(inner)) if arr.len() == 1 => inner,
            _ => arr,
        };
        match arr.first()? {
            Value::Number(_) => arr.iter().map(|v| v.as_f64().map(|f| f as f32)).collect(),
            Value::Array(_) => {
                let rows: Vec<Vec<f32>> = arr
                    .iter()
                    .map(|row| {
                        row.as_array()?
                            .iter()
                            .map(|v| v.as_f64().map(|f| f as f32))
                            .collect::<Option<Vec<f32>>>()
                    })
                    .collect::<Option<Vec<_>>>()?;
                let width = rows.first()?.len();
                if rows.iter().any(|r| r.len() != width) {
                    return None;
                }
                let mut pooled = vec![0.0f32; width];
                for row in &rows {
                    for (acc, v) in pooled.iter_mut().zip(row) {
                        *acc += v;
                    }
                }
                let n = rows.len() as f32;
                pooled.iter_mut().for_each(|v| *v /= n);
                Some(pooled)
            }
            _ => None,
        }
    }
}

#[async_trait]
impl Embedder for HuggingFaceEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, RetrievalError> {
        let url = format!(
            "{}/pipeline/feature-extraction/{}",
            self.base_url.trim_end_matches('/'),
            self.model
        );
        let body = serde_json::json!({
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
            .map_err(|e| RetrievalError::Unavailable {
                message: format!("embedding request failed: {}", e),
            })?;

        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(RetrievalError::Embedding {
                message: format!("HTTP {}: {}", status, text),
            });
        }

        let json: Value = resp.json().await.map_err(|e| RetrievalError::Embedding {
            message: format!("invalid JSON: {}", e),
        })?;
        Self::parse_vector(&json).ok_or_else(|| RetrievalError::Embedding {
            message: "unexpected feature-extraction payload".into(),
        })
    }

    fn dimensions(&self) -> usize {
        self.dims
    }

    fn provider_name(&self) -> &str {
        "huggingface"
    }
}

/// OpenAI API embedder (uses text-embedding-3-small by default).
pub struct OpenAiEmbedder {
    client: reqwest::Client,
    api_key: String,
    model: String,
    dims: usize,
    base_url: String,
}

impl OpenAiEmbedder {
    pub fn new(api_key: String, model: Option<String>, base_url: Option<String>) -> Self {
        let model = model.unwrap_or_else(|| "text-embedding-3-small".into());
        let dims = match model.as_str() {
            "text-embedding-3-large" => 3072,
            _ => 1536,
        };
        Self {
            client: http_client(DEFAULT_EMBED_TIMEOUT),
            api_key,
            model,
            dims,
            base_url: base_url.unwrap_or_else(|| "https://api.openai.com".into()),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.client = http_client(timeout);
        self
    }
}

#[async_trait]
impl Embedder for OpenAiEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, RetrievalError> {
        let url = format!("{}/v1/embeddings", self.base_url.trim_end_matches('/'));
        let body = serde_json::json!({
            "model": self.model,
            "input": text,
        });

        let resp = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| RetrievalError::Unavailable {
                message: format!("embedding request failed: {}", e),
            })?;

        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(RetrievalError::Embedding {
                message: format!("HTTP {}: {}", status, text),
            });
        }

        let json: Value = resp.json().await.map_err(|e| RetrievalError::Embedding {
            message: format!("invalid JSON: {}", e),
        })?;
        json["data"][0]["embedding"]
            .as_array()
            .map(|values| {
                values
                    .iter()
                    .filter_map(|v| v.as_f64().map(|f| f as f32))
                    .collect()
            })
            .ok_or_else(|| RetrievalError::Embedding {
                message: "missing data[0].embedding".into(),
            })
    }

    fn dimensions(&self) -> usize {
        self.dims
    }

    fn provider_name(&self) -> &str {
        "openai"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn test_local_embedder_normalized() {
        let embedder = LocalEmbedder::new(64);
        let v = embedder.embed("golden visa eligibility").await.unwrap();
        assert_eq!(v.len(), 64);
        let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-5);
    }

    #[tokio::test]
    async fn test_local_embedder_empty_text() {
        let embedder = LocalEmbedder::new(16);
        let v = embedder.embed("   ").await.unwrap();
        assert!(v.iter().all(|x| *x == 0.0));
    }

    #[tokio::test]
    async fn test_local_embedder_deterministic() {
        let embedder = LocalEmbedder::new(32);
        let a = embedder.embed("investment amount").await.unwrap();
        let b = embedder.embed("Investment   AMOUNT").await.unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_parse_flat_vector() {
        let v = HuggingFaceEmbedder::parse_vector(&json!([0.5, -0.5, 1.0])).unwrap();
        assert_eq!(v, vec![0.5, -0.5, 1.0]);
    }

    #[test]
    fn test_parse_token_vectors_mean_pooled() {
        let v = HuggingFaceEmbedder::parse_vector(&json!([[[1.0, 2.0], [3.0, 4.0]]])).unwrap();
        assert_eq!(v, vec![2.0, 3.0]);
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(HuggingFaceEmbedder::parse_vector(&json!({"error": "loading"})).is_none());
        assert!(HuggingFaceEmbedder::parse_vector(&json!(["a", "b"])).is_none());
    }

    #[tokio::test]
    async fn test_huggingface_embedder_against_mock() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path(
                "/pipeline/feature-extraction/sentence-transformers/all-MiniLM-L6-v2",
            ))
            .and(header("authorization", "Bearer hf-test"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([0.1, 0.2, 0.3])))
            .mount(&server)
            .await;

        let embedder = HuggingFaceEmbedder::new(
            "hf-test".into(),
            "sentence-transformers/all-MiniLM-L6-v2".into(),
            Some(server.uri()),
            3,
        );
        let v = embedder.embed("hello").await.unwrap();
        assert_eq!(v.len(), 3);
    }

    #[tokio::test]
    async fn test_huggingface_embedder_server_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503).set_body_string("loading"))
            .mount(&server)
            .await;

        let embedder = HuggingFaceEmbedder::new("t".into(), "m".into(), Some(server.uri()), 3);
        let err = embedder.embed("hello").await.unwrap_err();
        assert!(matches!(err, RetrievalError::Embedding { .. }));
    }

    #[tokio::test]
    async fn test_huggingface_embedder_gives_up_on_slow_service() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!([0.1, 0.2, 0.3]))
                    .set_delay(Duration::from_secs(5)),
            )
            .mount(&server)
            .await;

        let embedder = HuggingFaceEmbedder::new("t".into(), "m".into(), Some(server.uri()), 3)
            .with_timeout(Duration::from_millis(100));
        let err = embedder.embed("hello").await.unwrap_err();
        assert!(matches!(err, RetrievalError::Unavailable { .. }));
    }

    #[tokio::test]
    async fn test_openai_embedder_against_mock() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/embeddings"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({"data": [{"embedding": [1.0, 0.0]}]})),
            )
            .mount(&server)
            .await;

        let embedder = OpenAiEmbedder::new("k".into(), None, Some(server.uri()));
        assert_eq!(embedder.embed("x").await.unwrap(), vec![1.0, 0.0]);
    }

    #[test]
    fn test_create_embedder_local_and_unknown() {
        let config = EmbedderConfig {
            provider: "local".into(),
            dimensions: 8,
            ..Default::default()
        };
        let embedder = create_embedder(&config, DEFAULT_EMBED_TIMEOUT).unwrap();
        assert_eq!(embedder.provider_name(), "local");
        assert_eq!(embedder.dimensions(), 8);

        let config = EmbedderConfig {
            provider: "word2vec".into(),
            ..Default::default()
        };
        assert!(create_embedder(&config, DEFAULT_EMBED_TIMEOUT).is_err());
    }
}
