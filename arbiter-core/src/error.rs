//! Error types for the Arbiter core.
//!
//! Uses `thiserror` for public API error types. Errors are grouped by the
//! boundary they come from: retrieval, backend invocation, coherence
//! classification, the client channel, and configuration.

use std::path::PathBuf;

/// Top-level error type for the Arbiter core library.
#[derive(Debug, thiserror::Error)]
pub enum ArbiterError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Retrieval error: {0}")]
    Retrieval(#[from] RetrievalError),

    #[error("Backend error: {0}")]
    Backend(#[from] BackendError),

    #[error("Classifier error: {0}")]
    Classifier(#[from] ClassifierError),

    #[error("Channel error: {0}")]
    Channel(#[from] ChannelError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Failures of the embedding service or the vector index.
///
/// Every variant means retrieval is unavailable for this request; the session
/// degrades to the unaugmented prompt instead of failing.
#[derive(Debug, thiserror::Error)]
pub enum RetrievalError {
    #[error("Retrieval service unavailable: {message}")]
    Unavailable { message: String },

    #[error("Embedding failed: {message}")]
    Embedding { message: String },

    #[error("Malformed index response: {message}")]
    MalformedResponse { message: String },
}

/// Why a single backend invocation failed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BackendErrorKind {
    #[error("timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    #[error("authentication failed")]
    AuthFailure,

    #[error("rate limited")]
    RateLimited,

    #[error("network error: {message}")]
    NetworkError { message: String },

    #[error("malformed response: {message}")]
    MalformedResponse { message: String },
}

impl BackendErrorKind {
    /// Stable snake_case code used on the wire and in logs.
    pub fn code(&self) -> &'static str {
        match self {
            BackendErrorKind::Timeout { .. } => "timeout",
            BackendErrorKind::AuthFailure => "auth_failure",
            BackendErrorKind::RateLimited => "rate_limited",
            BackendErrorKind::NetworkError { .. } => "network_error",
            BackendErrorKind::MalformedResponse { .. } => "malformed_response",
        }
    }

    /// Transient failures that a bounded retry may clear.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            BackendErrorKind::RateLimited | BackendErrorKind::NetworkError { .. }
        )
    }

    /// Map a reqwest transport error onto the backend taxonomy.
    pub fn from_transport(err: &reqwest::Error) -> Self {
        if err.is_timeout() {
            BackendErrorKind::Timeout { timeout_ms: 0 }
        } else if err.is_decode() {
            BackendErrorKind::MalformedResponse {
                message: err.to_string(),
            }
        } else {
            BackendErrorKind::NetworkError {
                message: err.to_string(),
            }
        }
    }

    /// Map a non-success HTTP status onto the backend taxonomy.
    pub fn from_status(status: reqwest::StatusCode, body: &str) -> Self {
        match status.as_u16() {
            401 | 403 => BackendErrorKind::AuthFailure,
            429 => BackendErrorKind::RateLimited,
            code if code >= 500 => BackendErrorKind::NetworkError {
                message: format!("server error ({}): {}", code, truncate(body, 200)),
            },
            code => BackendErrorKind::MalformedResponse {
                message: format!("HTTP {}: {}", code, truncate(body, 200)),
            },
        }
    }
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

/// A backend failure attributed to a named backend.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("backend '{name}' failed: {cause}")]
pub struct BackendError {
    pub name: String,
    pub cause: BackendErrorKind,
}

/// Failures of the coherence classifier.
#[derive(Debug, thiserror::Error)]
pub enum ClassifierError {
    #[error("Coherence classifier unavailable: {message}")]
    Unavailable { message: String },
}

/// Failures of the client-facing channel.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ChannelError {
    #[error("Client channel closed")]
    Closed,
}

/// Errors from the configuration system.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Configuration file not found: {path}")]
    FileNotFound { path: PathBuf },

    #[error("Invalid configuration: {message}")]
    Invalid { message: String },

    #[error("Environment variable not set: {var}")]
    EnvVarMissing { var: String },

    #[error("Configuration parse error: {message}")]
    ParseError { message: String },
}

/// A type alias for results using the top-level `ArbiterError`.
pub type Result<T> = std::result::Result<T, ArbiterError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display_backend() {
        let err = ArbiterError::Backend(BackendError {
            name: "gpt-4".into(),
            cause: BackendErrorKind::Timeout { timeout_ms: 1500 },
        });
        assert_eq!(
            err.to_string(),
            "Backend error: backend 'gpt-4' failed: timed out after 1500ms"
        );
    }

    #[test]
    fn test_error_display_config() {
        let err = ArbiterError::Config(ConfigError::EnvVarMissing {
            var: "OPENAI_API_KEY".into(),
        });
        assert_eq!(
            err.to_string(),
            "Configuration error: Environment variable not set: OPENAI_API_KEY"
        );
    }

    #[test]
    fn test_error_from_serde() {
        let serde_err = serde_json::from_str::<serde_json::Value>("{not json").unwrap_err();
        let err: ArbiterError = serde_err.into();
        assert!(matches!(err, ArbiterError::Serialization(_)));
    }

    #[test]
    fn test_backend_error_codes() {
        assert_eq!(BackendErrorKind::Timeout { timeout_ms: 1 }.code(), "timeout");
        assert_eq!(BackendErrorKind::AuthFailure.code(), "auth_failure");
        assert_eq!(BackendErrorKind::RateLimited.code(), "rate_limited");
        assert_eq!(
            BackendErrorKind::NetworkError {
                message: String::new()
            }
            .code(),
            "network_error"
        );
        assert_eq!(
            BackendErrorKind::MalformedResponse {
                message: String::new()
            }
            .code(),
            "malformed_response"
        );
    }

    #[test]
    fn test_status_mapping() {
        use reqwest::StatusCode;
        assert_eq!(
            BackendErrorKind::from_status(StatusCode::UNAUTHORIZED, ""),
            BackendErrorKind::AuthFailure
        );
        assert_eq!(
            BackendErrorKind::from_status(StatusCode::FORBIDDEN, ""),
            BackendErrorKind::AuthFailure
        );
        assert_eq!(
            BackendErrorKind::from_status(StatusCode::TOO_MANY_REQUESTS, ""),
            BackendErrorKind::RateLimited
        );
        assert!(matches!(
            BackendErrorKind::from_status(StatusCode::BAD_GATEWAY, "upstream"),
            BackendErrorKind::NetworkError { .. }
        ));
        assert!(matches!(
            BackendErrorKind::from_status(StatusCode::BAD_REQUEST, "bad"),
            BackendErrorKind::MalformedResponse { .. }
        ));
    }

    #[test]
    fn test_transient_kinds() {
        assert!(BackendErrorKind::RateLimited.is_transient());
        assert!(
            BackendErrorKind::NetworkError {
                message: "reset".into()
            }
            .is_transient()
        );
        assert!(!BackendErrorKind::AuthFailure.is_transient());
        assert!(!BackendErrorKind::Timeout { timeout_ms: 5 }.is_transient());
    }

    #[test]
    fn test_truncate_respects_char_boundaries() {
        assert_eq!(truncate("héllo", 2), "hé");
        assert_eq!(truncate("abc", 10), "abc");
    }
}
