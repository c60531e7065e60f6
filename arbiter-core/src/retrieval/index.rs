//! Vector index boundary and an in-memory implementation.

use async_trait::async_trait;
use std::sync::RwLock;

use crate::embeddings::Embedder;
use crate::error::RetrievalError;
use crate::types::Passage;

/// One nearest-neighbour hit returned by an index.
#[derive(Debug, Clone, PartialEq)]
pub struct IndexMatch {
    pub id: String,
    /// Stored passage text. `None` when the record carries no text metadata.
    pub text: Option<String>,
    pub score: f32,
}

/// A read-only similarity index.
#[async_trait]
pub trait VectorIndex: Send + Sync {
    /// Return up to `top_k` matches for `vector`, most similar first.
    async fn query(&self, vector: &[f32], top_k: usize) -> Result<Vec<IndexMatch>, RetrievalError>;

    /// Short provider name for logs.
    fn provider_name(&self) -> &str;
}

/// Cosine similarity; 0.0 for mismatched or zero-length vectors.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a * norm_b)
}

struct Entry {
    passage: Passage,
    vector: Vec<f32>,
}

/// Brute-force cosine index held in memory.
#[derive(Default)]
pub struct InMemoryIndex {
    entries: RwLock<Vec<Entry>>,
}

impl std::fmt::Debug for InMemoryIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryIndex")
            .field("entries", &self.len())
            .finish()
    }
}

impl InMemoryIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a passage with a precomputed vector.
    pub fn insert(&self, passage: Passage, vector: Vec<f32>) {
        if let Ok(mut entries) = self.entries.write() {
            entries.push(Entry { passage, vector });
        }
    }

    /// Embed and insert every passage.
    pub async fn seed(
        &self,
        embedder: &dyn Embedder,
        passages: Vec<Passage>,
    ) -> Result<usize, RetrievalError> {
        let mut count = 0;
        for passage in passages {
            let vector = embedder.embed(&passage.text).await?;
            self.insert(passage, vector);
            count += 1;
        }
        Ok(count)
    }

    /// Read a JSON array of `{source_id, text}` passages.
    pub fn load_passages(path: &std::path::Path) -> Result<Vec<Passage>, RetrievalError> {
        let raw = std::fs::read_to_string(path).map_err(|e| RetrievalError::Unavailable {
            message: format!("cannot read passages file {}: {}", path.display(), e),
        })?;
        serde_json::from_str(&raw).map_err(|e| RetrievalError::MalformedResponse {
            message: format!("invalid passages file {}: {}", path.display(), e),
        })
    }

    pub fn len(&self) -> usize {
        self.entries.read().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl VectorIndex for InMemoryIndex {
    async fn query(&self, vector: &[f32], top_k: usize) -> Result<Vec<IndexMatch>, RetrievalError> {
        let entries = self.entries.read().map_err(|_| RetrievalError::Unavailable {
            message: "in-memory index lock poisoned".into(),
        })?;
        let mut scored: Vec<IndexMatch> = entries
            .iter()
            .map(|e| IndexMatch {
                id: e.passage.source_id.clone(),
                text: Some(e.passage.text.clone()),
                score: cosine_similarity(vector, &e.vector),
            })
            .collect();
        scored.sort_by(|a, b| b.score.total_cmp(&a.score));
        scored.truncate(top_k);
        Ok(scored)
    }

    fn provider_name(&self) -> &str {
        "memory"
    }
}
