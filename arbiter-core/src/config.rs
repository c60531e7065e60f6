//! Configuration system for Arbiter.
//!
//! Uses `figment` for layered configuration: defaults -> user config file ->
//! workspace config file -> environment -> explicit config file.
//! Configuration is loaded from `~/.config/arbiter/config.toml` and/or
//! `.arbiter/config.toml` in the workspace directory.

use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;

use crate::error::ConfigError;
use crate::gateway::GatewayConfig;

/// Top-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArbiterConfig {
    pub gateway: GatewayConfig,
    pub retrieval: RetrievalConfig,
    /// Backends in comparison order. Order decides score ties.
    pub backends: Vec<BackendConfig>,
    pub dispatch: DispatchConfig,
    pub evaluation: EvaluationConfig,
    pub classifier: ClassifierConfig,
}

impl Default for ArbiterConfig {
    fn default() -> Self {
        Self {
            gateway: GatewayConfig::default(),
            retrieval: RetrievalConfig::default(),
            backends: default_backends(),
            dispatch: DispatchConfig::default(),
            evaluation: EvaluationConfig::default(),
            classifier: ClassifierConfig::default(),
        }
    }
}

impl ArbiterConfig {
    /// Check cross-field constraints that serde cannot express.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.backends.is_empty() {
            return Err(ConfigError::Invalid {
                message: "at least one backend must be configured".into(),
            });
        }
        let mut seen = HashSet::new();
        for backend in &self.backends {
            if backend.name.trim().is_empty() {
                return Err(ConfigError::Invalid {
                    message: "backend name must not be empty".into(),
                });
            }
            if !seen.insert(backend.name.as_str()) {
                return Err(ConfigError::Invalid {
                    message: format!("duplicate backend name '{}'", backend.name),
                });
            }
        }
        if self.dispatch.timeout_secs == 0 {
            return Err(ConfigError::Invalid {
                message: "dispatch.timeout_secs must be greater than zero".into(),
            });
        }
        if self.evaluation.min_words > self.evaluation.max_words {
            return Err(ConfigError::Invalid {
                message: format!(
                    "evaluation.min_words ({}) exceeds evaluation.max_words ({})",
                    self.evaluation.min_words, self.evaluation.max_words
                ),
            });
        }
        if self.retrieval.enabled && self.retrieval.top_k == 0 {
            return Err(ConfigError::Invalid {
                message: "retrieval.top_k must be greater than zero".into(),
            });
        }
        if self.retrieval.enabled && self.retrieval.timeout_secs == 0 {
            return Err(ConfigError::Invalid {
                message: "retrieval.timeout_secs must be greater than zero".into(),
            });
        }
        Ok(())
    }
}

/// Configuration for context retrieval.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrievalConfig {
    /// When disabled every prompt is sent unaugmented.
    pub enabled: bool,
    /// Number of passages to retrieve.
    pub top_k: usize,
    /// Deadline for embedding plus index query. On expiry the prompt is sent
    /// unaugmented.
    pub timeout_secs: u64,
    pub embedder: EmbedderConfig,
    pub index: IndexConfig,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            top_k: 5,
            timeout_secs: 10,
            embedder: EmbedderConfig::default(),
            index: IndexConfig::default(),
        }
    }
}

/// Configuration for the embedding service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbedderConfig {
    /// Provider name: "huggingface" (default), "openai", "local".
    pub provider: String,
    /// Provider-specific model name.
    pub model: String,
    /// Environment variable holding the API key (unused by "local").
    pub api_key_env: String,
    /// Optional base URL override.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
    /// Embedding dimensions.
    pub dimensions: usize,
}

impl Default for EmbedderConfig {
    fn default() -> Self {
        Self {
            provider: "huggingface".into(),
            model: "sentence-transformers/all-MiniLM-L6-v2".into(),
            api_key_env: "HF_API_TOKEN".into(),
            base_url: None,
            dimensions: 384,
        }
    }
}

/// Configuration for the vector index.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexConfig {
    /// Provider name: "pinecone" (default) or "memory".
    pub provider: String,
    /// Index name (Pinecone).
    pub index_name: String,
    /// Data-plane host. Resolved from the control plane when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    pub namespace: String,
    pub api_key_env: String,
    /// JSON file of `{source_id, text}` passages seeding the in-memory index.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub passages_path: Option<std::path::PathBuf>,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            provider: "pinecone".into(),
            index_name: "modelindex".into(),
            host: None,
            namespace: "default".into(),
            api_key_env: "PINECONE_API_KEY".into(),
            passages_path: None,
        }
    }
}

/// Configuration for one completion backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendConfig {
    /// Name reported to clients. Must be unique.
    pub name: String,
    /// Provider name: "openai", "replicate", "static".
    pub provider: String,
    /// Provider model identifier (e.g. "gpt-4", "replicate/llama-2-70b-chat").
    #[serde(default)]
    pub model: String,
    /// Environment variable containing the API key.
    #[serde(default)]
    pub api_key_env: String,
    /// Optional base URL override for the API endpoint.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    /// Scripted reply for the "static" provider.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response: Option<String>,
    /// Artificial latency for the "static" provider.
    #[serde(default)]
    pub delay_ms: u64,
}

impl BackendConfig {
    fn remote(name: &str, provider: &str, model: &str, api_key_env: &str) -> Self {
        Self {
            name: name.into(),
            provider: provider.into(),
            model: model.into(),
            api_key_env: api_key_env.into(),
            base_url: None,
            max_tokens: None,
            temperature: None,
            response: None,
            delay_ms: 0,
        }
    }

    /// A backend answering with fixed text, for demos and tests.
    pub fn scripted(name: &str, response: &str, delay_ms: u64) -> Self {
        Self {
            response: Some(response.into()),
            delay_ms,
            ..Self::remote(name, "static", "", "")
        }
    }
}

fn default_backends() -> Vec<BackendConfig> {
    vec![
        BackendConfig::remote("gpt-3.5-turbo", "openai", "gpt-3.5-turbo", "OPENAI_API_KEY"),
        BackendConfig::remote("gpt-4", "openai", "gpt-4", "OPENAI_API_KEY"),
        BackendConfig::remote(
            "Llama-2-70b-chat",
            "replicate",
            "replicate/llama-2-70b-chat",
            "REPLICATE_API_TOKEN",
        ),
        BackendConfig::remote(
            "Falcon-40b-instruct",
            "replicate",
            "joehoover/falcon-40b-instruct",
            "REPLICATE_API_TOKEN",
        ),
    ]
}

/// Fan-out configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchConfig {
    /// Per-backend deadline in seconds.
    pub timeout_secs: u64,
    pub retry: RetryConfig,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 60,
            retry: RetryConfig::default(),
        }
    }
}

/// Bounded retry applied to transient backend failures.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Extra attempts after the first. Zero disables retry.
    pub max_retries: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 0,
            initial_backoff_ms: 500,
            max_backoff_ms: 8_000,
            backoff_multiplier: 2.0,
        }
    }
}

/// Scoring thresholds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvaluationConfig {
    /// Responses shorter than this score 0 on the length axis.
    pub min_words: usize,
    /// Responses longer than this score 0 on the length axis.
    pub max_words: usize,
}

impl Default for EvaluationConfig {
    fn default() -> Self {
        Self {
            min_words: 50,
            max_words: 500,
        }
    }
}

/// Coherence classifier configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClassifierConfig {
    /// Provider name: "huggingface" (default) or "none".
    pub provider: String,
    pub model: String,
    pub api_key_env: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
    /// Label the model uses for well-formed text.
    pub acceptable_label: String,
    pub timeout_secs: u64,
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            provider: "huggingface".into(),
            model: "cointegrated/roberta-large-cola-krishna2020".into(),
            api_key_env: "HF_API_TOKEN".into(),
            base_url: None,
            acceptable_label: "acceptable".into(),
            timeout_secs: 30,
        }
    }
}

/// Read an API key from the environment.
pub fn resolve_api_key(var: &str) -> Result<String, ConfigError> {
    std::env::var(var)
        .ok()
        .filter(|v| !v.trim().is_empty())
        .ok_or_else(|| ConfigError::EnvVarMissing { var: var.into() })
}

/// Load configuration from layered sources.
///
/// Priority (highest to lowest):
/// 1. Explicit config file (passed as argument)
/// 2. Environment variables (prefixed with `ARBITER_`)
/// 3. Workspace-local config (`.arbiter/config.toml`)
/// 4. User config (`~/.config/arbiter/config.toml`)
/// 5. Built-in defaults
pub fn load_config(
    workspace: Option<&Path>,
    explicit: Option<&Path>,
) -> Result<ArbiterConfig, ConfigError> {
    let mut figment = Figment::from(Serialized::defaults(ArbiterConfig::default()));

    if let Some(dirs) = directories::ProjectDirs::from("dev", "arbiter", "arbiter") {
        let user_config = dirs.config_dir().join("config.toml");
        if user_config.exists() {
            figment = figment.merge(Toml::file(&user_config));
        }
    }

    if let Some(ws) = workspace {
        let ws_config = ws.join(".arbiter").join("config.toml");
        if ws_config.exists() {
            figment = figment.merge(Toml::file(&ws_config));
        }
    }

    // ARBITER_DISPATCH__TIMEOUT_SECS, ARBITER_GATEWAY__PORT, ...
    figment = figment.merge(Env::prefixed("ARBITER_").split("__"));

    if let Some(path) = explicit {
        if !path.exists() {
            return Err(ConfigError::FileNotFound {
                path: path.to_path_buf(),
            });
        }
        figment = figment.merge(Toml::file(path));
    }

    let config: ArbiterConfig = figment.extract().map_err(|e| ConfigError::ParseError {
        message: e.to_string(),
    })?;
    config.validate()?;
    Ok(config)
}
