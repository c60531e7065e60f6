//! Context retrieval from a semantic index.
//!
//! The `Retriever` embeds the prompt into the index's vector space, asks the
//! index for the nearest passages, and returns them ranked by similarity.
//! An empty result is valid; a `RetrievalError` means the embedding service or
//! the index could not be reached in time.

pub mod index;
pub mod pinecone;

pub use index::{InMemoryIndex, IndexMatch, VectorIndex, cosine_similarity};
pub use pinecone::PineconeIndex;

use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::config::{RetrievalConfig, resolve_api_key};
use crate::embeddings::{Embedder, create_embedder};
use crate::error::{ArbiterError, ConfigError, RetrievalError};
use crate::types::{Passage, RetrievalResult};

/// Embeds prompts and queries a vector index for relevant passages.
pub struct Retriever {
    embedder: Arc<dyn Embedder>,
    index: Arc<dyn VectorIndex>,
    top_k: usize,
    timeout: Duration,
}

/// Deadline for one retrieval (embedding plus index query) unless configured.
pub const DEFAULT_RETRIEVAL_TIMEOUT: Duration = Duration::from_secs(10);

impl std::fmt::Debug for Retriever {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Retriever")
            .field("embedder", &self.embedder.provider_name())
            .field("index", &self.index.provider_name())
            .field("top_k", &self.top_k)
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl Retriever {
    pub fn new(embedder: Arc<dyn Embedder>, index: Arc<dyn VectorIndex>, top_k: usize) -> Self {
        Self {
            embedder,
            index,
            top_k,
            timeout: DEFAULT_RETRIEVAL_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Build a retriever from configuration. Returns `None` when retrieval is disabled.
    pub async fn from_config(config: &RetrievalConfig) -> Result<Option<Self>, ArbiterError> {
        if !config.enabled {
            return Ok(None);
        }
        let timeout = Duration::from_secs(config.timeout_secs.max(1));
        let embedder = create_embedder(&config.embedder, timeout)?;
        let index: Arc<dyn VectorIndex> = match config.index.provider.as_str() {
            "pinecone" => {
                let key = resolve_api_key(&config.index.api_key_env)?;
                match &config.index.host {
                    Some(host) => Arc::new(
                        PineconeIndex::with_host(key, host.clone(), config.index.namespace.clone())
                            .with_timeout(timeout),
                    ),
                    None => Arc::new(
                        PineconeIndex::connect(
                            key,
                            &config.index.index_name,
                            config.index.namespace.clone(),
                        )
                        .await?
                        .with_timeout(timeout),
                    ),
                }
            }
            "memory" => {
                let index = InMemoryIndex::new();
                if let Some(path) = &config.index.passages_path {
                    let passages = InMemoryIndex::load_passages(path)?;
                    let n = index.seed(embedder.as_ref(), passages).await?;
                    debug!(passages = n, path = %path.display(), "Seeded in-memory index");
                }
                Arc::new(index)
            }
            other => {
                return Err(ConfigError::Invalid {
                    message: format!("unknown index provider '{}'", other),
                }
                .into());
            }
        };
        Ok(Some(
            Self::new(embedder, index, config.top_k).with_timeout(timeout),
        ))
    }

    /// Default number of passages returned by [`Retriever::retrieve_default`].
    pub fn top_k(&self) -> usize {
        self.top_k
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Return up to `k` passages most similar to `prompt`, best first.
    ///
    /// Fails with `RetrievalError::Unavailable` if the embedder and index
    /// together take longer than the retriever's timeout.
    pub async fn retrieve(&self, prompt: &str, k: usize) -> Result<RetrievalResult, RetrievalError> {
        if k == 0 {
            return Ok(RetrievalResult::empty());
        }
        tokio::time::timeout(self.timeout, self.search(prompt, k))
            .await
            .map_err(|_| RetrievalError::Unavailable {
                message: format!("retrieval timed out after {}ms", self.timeout.as_millis()),
            })?
    }

    async fn search(&self, prompt: &str, k: usize) -> Result<RetrievalResult, RetrievalError> {
        let vector = self.embedder.embed(prompt).await?;
        let mut matches = self.index.query(&vector, k).await?;
        matches.sort_by(|a, b| b.score.total_cmp(&a.score));

        let passages: Vec<Passage> = matches
            .into_iter()
            .filter_map(|m| match m.text {
                Some(text) => Some(Passage::new(m.id, text)),
                None => {
                    warn!(id = %m.id, "Index match has no text metadata; skipping");
                    None
                }
            })
            .take(k)
            .collect();

        Ok(RetrievalResult::new(passages))
    }

    /// `retrieve` with the configured `top_k`.
    pub async fn retrieve_default(&self, prompt: &str) -> Result<RetrievalResult, RetrievalError> {
        self.retrieve(prompt, self.top_k).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embeddings::LocalEmbedder;
    use async_trait::async_trait;

    struct FixedIndex(Vec<IndexMatch>);

    #[async_trait]
    impl VectorIndex for FixedIndex {
        async fn query(&self, _v: &[f32], top_k: usize) -> Result<Vec<IndexMatch>, RetrievalError> {
            Ok(self.0.iter().take(top_k).cloned().collect())
        }
        fn provider_name(&self) -> &str {
            "fixed"
        }
    }

    struct DownIndex;

    #[async_trait]
    impl VectorIndex for DownIndex {
        async fn query(&self, _v: &[f32], _k: usize) -> Result<Vec<IndexMatch>, RetrievalError> {
            Err(RetrievalError::Unavailable {
                message: "connection refused".into(),
            })
        }
        fn provider_name(&self) -> &str {
            "down"
        }
    }

    struct StalledIndex;

    #[async_trait]
    impl VectorIndex for StalledIndex {
        async fn query(&self, _v: &[f32], _k: usize) -> Result<Vec<IndexMatch>, RetrievalError> {
            std::future::pending().await
        }
        fn provider_name(&self) -> &str {
            "stalled"
        }
    }

    fn hit(id: &str, text: Option<&str>, score: f32) -> IndexMatch {
        IndexMatch {
            id: id.into(),
            text: text.map(str::to_string),
            score,
        }
    }

    #[tokio::test]
    async fn test_retrieve_orders_by_score_and_drops_textless() {
        let index = FixedIndex(vec![
            hit("b", Some("second"), 0.5),
            hit("x", None, 0.9),
            hit("a", Some("first"), 0.8),
        ]);
        let retriever = Retriever::new(Arc::new(LocalEmbedder::new(8)), Arc::new(index), 5);
        let result = retriever.retrieve("q", 5).await.unwrap();
        let ids: Vec<_> = result.iter().map(|p| p.source_id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b"]);
    }

    #[tokio::test]
    async fn test_retrieve_respects_k() {
        let index = FixedIndex((0..10).map(|i| hit(&i.to_string(), Some("t"), 1.0)).collect());
        let retriever = Retriever::new(Arc::new(LocalEmbedder::new(8)), Arc::new(index), 5);
        assert_eq!(retriever.retrieve_default("q").await.unwrap().len(), 5);
        assert_eq!(retriever.retrieve("q", 2).await.unwrap().len(), 2);
        assert!(retriever.retrieve("q", 0).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_retrieve_empty_index_is_ok() {
        let retriever = Retriever::new(
            Arc::new(LocalEmbedder::new(8)),
            Arc::new(InMemoryIndex::new()),
            5,
        );
        let result = retriever.retrieve("anything", 5).await.unwrap();
        assert!(result.is_empty());
    }

    #[tokio::test]
    async fn test_retrieve_unreachable_index_is_error() {
        let retriever = Retriever::new(Arc::new(LocalEmbedder::new(8)), Arc::new(DownIndex), 5);
        assert!(retriever.retrieve("q", 5).await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_retrieve_stalled_index_times_out() {
        let retriever = Retriever::new(Arc::new(LocalEmbedder::new(8)), Arc::new(StalledIndex), 5)
            .with_timeout(Duration::from_secs(3));
        let start = tokio::time::Instant::now();
        let err = retriever.retrieve("q", 5).await.unwrap_err();
        assert!(matches!(err, RetrievalError::Unavailable { .. }));
        assert!(err.to_string().contains("timed out"));
        assert!(start.elapsed() >= Duration::from_secs(3));
    }

    #[tokio::test]
    async fn test_from_config_disabled() {
        let config = RetrievalConfig {
            enabled: false,
            ..Default::default()
        };
        assert!(Retriever::from_config(&config).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_from_config_memory_index() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("p.json");
        std::fs::write(
            &path,
            r#"[{"source_id": "g", "text": "golden visa eligibility"}]"#,
        )
        .unwrap();

        let mut config = RetrievalConfig::default();
        config.embedder.provider = "local".into();
        config.embedder.dimensions = 32;
        config.index.provider = "memory".into();
        config.index.passages_path = Some(path);

        config.timeout_secs = 4;

        let retriever = Retriever::from_config(&config).await.unwrap().unwrap();
        assert_eq!(retriever.timeout(), Duration::from_secs(4));
        let result = retriever.retrieve("golden visa", 3).await.unwrap();
        assert_eq!(result.len(), 1);
        assert_eq!(result.passages[0].source_id, "g");
    }
}
