//! Pinecone REST index client.

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use tracing::debug;

use super::index::{IndexMatch, VectorIndex};
use crate::error::RetrievalError;

const CONTROL_PLANE: &str = "https://api.pinecone.io";
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

fn http_client(timeout: Duration) -> Client {
    Client::builder().timeout(timeout).build().unwrap_or_default()
}

pub struct PineconeIndex {
    client: Client,
    api_key: String,
    host: String,
    namespace: String,
}

#[derive(Debug, Serialize)]
struct QueryRequest<'a> {
    vector: &'a [f32],
    #[serde(rename = "topK")]
    top_k: usize,
    namespace: &'a str,
    #[serde(rename = "includeMetadata")]
    include_metadata: bool,
    #[serde(rename = "includeValues")]
    include_values: bool,
}

#[derive(Debug, Deserialize)]
struct QueryResponse {
    #[serde(default)]
    matches: Vec<QueryMatch>,
}

#[derive(Debug, Deserialize)]
struct QueryMatch {
    id: String,
    #[serde(default)]
    score: f32,
    metadata: Option<HashMap<String, serde_json::Value>>,
}

#[derive(Debug, Deserialize)]
struct DescribeIndexResponse {
    host: String,
}

impl PineconeIndex {
    /// Connect to a known data-plane host.
    pub fn with_host(api_key: String, host: impl Into<String>, namespace: impl Into<String>) -> Self {
        let host = host.into();
        let host = if host.starts_with("http://") || host.starts_with("https://") {
            host
        } else {
            format!("https://{}", host)
        };
        Self {
            client: http_client(DEFAULT_TIMEOUT),
            api_key,
            host: host.trim_end_matches('/').to_string(),
            namespace: namespace.into(),
        }
    }

    /// Resolve the data-plane host for `index_name` through the control plane.
    pub async fn connect(
        api_key: String,
        index_name: &str,
        namespace: impl Into<String>,
    ) -> Result<Self, RetrievalError> {
        Self::connect_via(CONTROL_PLANE, api_key, index_name, namespace).await
    }

    async fn connect_via(
        control_plane: &str,
        api_key: String,
        index_name: &str,
        namespace: impl Into<String>,
    ) -> Result<Self, RetrievalError> {
        let client = http_client(DEFAULT_TIMEOUT);
        let url = format!("{}/indexes/{}", control_plane, index_name);
        let resp = client
            .get(&url)
            .header("Api-Key", &api_key)
            .send()
            .await
            .map_err(|e| RetrievalError::Unavailable {
                message: format!("Pinecone: {}", e),
            })?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(RetrievalError::Unavailable {
                message: format!("Pinecone describe_index {}: {}", status, body),
            });
        }

        let info: DescribeIndexResponse =
            resp.json()
                .await
                .map_err(|e| RetrievalError::MalformedResponse {
                    message: e.to_string(),
                })?;
        debug!(host = %info.host, index = index_name, "Resolved Pinecone index host");
        Ok(Self::with_host(api_key, info.host, namespace))
    }

    /// Give up on a query after `timeout`.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.client = http_client(timeout);
        self
    }

    pub fn host(&self) -> &str {
        &self.host
    }
}

#[async_trait]
impl VectorIndex for PineconeIndex {
    async fn query(&self, vector: &[f32], top_k: usize) -> Result<Vec<IndexMatch>, RetrievalError> {
        let url = format!("{}/query", self.host);
        let request = QueryRequest {
            vector,
            top_k,
            namespace: &self.namespace,
            include_metadata: true,
            include_values: false,
        };

        let resp = self
            .client
            .post(&url)
            .header("Api-Key", &self.api_key)
            .json(&request)
            .send()
            .await
            .map_err(|e| RetrievalError::Unavailable {
                message: format!("Pinecone query: {}", e),
            })?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(RetrievalError::Unavailable {
                message: format!("Pinecone query {}: {}", status, body),
            });
        }

        let parsed: QueryResponse =
            resp.json()
                .await
                .map_err(|e| RetrievalError::MalformedResponse {
                    message: e.to_string(),
                })?;

        Ok(parsed
            .matches
            .into_iter()
            .map(|m| IndexMatch {
                text: m
                    .metadata
                    .as_ref()
                    .and_then(|md| md.get("text"))
                    .and_then(|t| t.as_str())
                    .map(str::to_string),
                id: m.id,
                score: m.score,
            })
            .collect())
    }

    fn provider_name(&self) -> &str {
        "pinecone"
    }
}
