//! Replicate predictions backend.
//!
//! Creates a prediction with `Prefer: wait` so short generations come back in
//! the first response, then polls the prediction's `urls.get` until it reaches
//! a terminal status. Language models on Replicate usually return `output` as
//! a list of streamed text fragments; those are concatenated.
//!
//! A prediction abandoned before it finishes (deadline, client gone, polling
//! error) is cancelled through its `urls.cancel` endpoint.

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::{Value, json};
use std::time::Duration;
use tracing::{debug, warn};

use super::Backend;
use crate::config::{BackendConfig, resolve_api_key};
use crate::error::{BackendErrorKind, ConfigError};

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(500);

pub struct ReplicateBackend {
    client: Client,
    name: String,
    base_url: String,
    token: String,
    /// `owner/name`
    model: String,
    /// Pinned version hash, if the model was given as `owner/name:version`.
    version: Option<String>,
    max_tokens: Option<usize>,
    temperature: Option<f32>,
    poll_interval: Duration,
}

#[derive(Debug, Deserialize)]
struct Prediction {
    #[serde(default)]
    status: String,
    #[serde(default)]
    output: Value,
    #[serde(default)]
    error: Option<Value>,
    #[serde(default)]
    urls: Option<PredictionUrls>,
}

#[derive(Debug, Deserialize)]
struct PredictionUrls {
    get: Option<String>,
    cancel: Option<String>,
}

/// Cancels the remote prediction when dropped while armed.
struct CancelOnDrop {
    client: Client,
    token: String,
    url: Option<String>,
}

impl CancelOnDrop {
    fn new(client: &Client, token: &str) -> Self {
        Self {
            client: client.clone(),
            token: token.to_string(),
            url: None,
        }
    }

    fn arm(&mut self, prediction: &Prediction) {
        if self.url.is_none() {
            self.url = prediction.urls.as_ref().and_then(|u| u.cancel.clone());
        }
    }

    fn disarm(&mut self) {
        self.url = None;
    }
}

impl Drop for CancelOnDrop {
    fn drop(&mut self) {
        let Some(url) = self.url.take() else {
            return;
        };
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            return;
        };
        debug!(url = %url, "Cancelling abandoned Replicate prediction");
        let request = self.client.post(&url).bearer_auth(&self.token);
        handle.spawn(async move {
            if let Err(e) = request.send().await {
                warn!(url = %url, error = %e, "Failed to cancel Replicate prediction");
            }
        });
    }
}

impl ReplicateBackend {
    pub fn new(config: &BackendConfig) -> Result<Self, ConfigError> {
        let token = resolve_api_key(&config.api_key_env)?;
        Ok(Self::new_with_key(config, token))
    }

    pub fn new_with_key(config: &BackendConfig, token: String) -> Self {
        let (model, version) = split_model(&config.model);
        Self {
            client: Client::new(),
            name: config.name.clone(),
            base_url: config
                .base_url
                .clone()
                .unwrap_or_else(|| "https://api.replicate.com".to_string())
                .trim_end_matches('/')
                .to_string(),
            token,
            model,
            version,
            max_tokens: config.max_tokens,
            temperature: config.temperature,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    fn input(&self, prompt: &str) -> Value {
        let mut input = json!({ "prompt": prompt });
        if let Some(max_tokens) = self.max_tokens {
            input["max_new_tokens"] = json!(max_tokens);
        }
        if let Some(temperature) = self.temperature {
            input["temperature"] = json!(temperature);
        }
        input
    }

    fn create_request(&self, prompt: &str) -> (String, Value) {
        match &self.version {
            Some(version) => (
                format!("{}/v1/predictions", self.base_url),
                json!({ "version": version, "input": self.input(prompt) }),
            ),
            None => (
                format!("{}/v1/models/{}/predictions", self.base_url, self.model),
                json!({ "input": self.input(prompt) }),
            ),
        }
    }

    async fn read_prediction(resp: reqwest::Response) -> Result<Prediction, BackendErrorKind> {
        let status = resp.status();
        let text = resp
            .text()
            .await
            .map_err(|e| BackendErrorKind::from_transport(&e))?;
        if !status.is_success() {
            return Err(BackendErrorKind::from_status(status, &text));
        }
        serde_json::from_str(&text).map_err(|e| BackendErrorKind::MalformedResponse {
            message: format!("Invalid prediction JSON: {}", e),
        })
    }

    /// Normalize a prediction `output` to one string.
    fn normalize_output(output: &Value) -> Result<String, BackendErrorKind> {
        match output {
            Value::String(s) => Ok(s.clone()),
            Value::Array(parts) => parts
                .iter()
                .map(|p| {
                    p.as_str()
                        .ok_or_else(|| BackendErrorKind::MalformedResponse {
                            message: "non-text fragment in output".into(),
                        })
                })
                .collect::<Result<String, _>>(),
            Value::Null => Err(BackendErrorKind::MalformedResponse {
                message: "prediction has no output".into(),
            }),
            other => Err(BackendErrorKind::MalformedResponse {
                message: format!("unexpected output type: {}", other),
            }),
        }
    }
}

/// Split `owner/name[:version]`. `latest` is treated as unpinned.
fn split_model(model: &str) -> (String, Option<String>) {
    match model.split_once(':') {
        Some((name, version)) if !version.is_empty() && version != "latest" => {
            (name.to_string(), Some(version.to_string()))
        }
        Some((name, _)) => (name.to_string(), None),
        None => (model.to_string(), None),
    }
}

#[async_trait]
impl Backend for ReplicateBackend {
    fn name(&self) -> &str {
        &self.name
    }

    async fn invoke(&self, prompt: &str) -> Result<String, BackendErrorKind> {
        let (url, body) = self.create_request(prompt);
        debug!(url = %url, backend = %self.name, "Creating Replicate prediction");

        let resp = self
            .client
            .post(&url)
            .bearer_auth(&self.token)
            .header("Prefer", "wait")
            .json(&body)
            .send()
            .await
            .map_err(|e| BackendErrorKind::from_transport(&e))?;
        let mut prediction = Self::read_prediction(resp).await?;
        let mut guard = CancelOnDrop::new(&self.client, &self.token);

        loop {
            guard.arm(&prediction);
            match prediction.status.as_str() {
                "succeeded" => {
                    guard.disarm();
                    return Self::normalize_output(&prediction.output);
                }
                "failed" | "canceled" => {
                    guard.disarm();
                    let detail = prediction
                        .error
                        .as_ref()
                        .map(|e| e.to_string())
                        .unwrap_or_else(|| prediction.status.clone());
                    return Err(BackendErrorKind::NetworkError {
                        message: format!("prediction {}: {}", prediction.status, detail),
                    });
                }
                _ => {}
            }

            let poll_url = prediction
                .urls
                .as_ref()
                .and_then(|u| u.get.clone())
                .ok_or_else(|| BackendErrorKind::MalformedResponse {
                    message: format!(
                        "prediction in status '{}' has no polling URL",
                        prediction.status
                    ),
                })?;

            tokio::time::sleep(self.poll_interval).await;
            let resp = self
                .client
                .get(&poll_url)
                .bearer_auth(&self.token)
                .send()
                .await
                .map_err(|e| BackendErrorKind::from_transport(&e))?;
            prediction = Self::read_prediction(resp).await?;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn config(base_url: &str, model: &str) -> BackendConfig {
        BackendConfig {
            name: "Llama-2-70b-chat".into(),
            provider: "replicate".into(),
            model: model.into(),
            api_key_env: "ARBITER_TEST_UNSET_REPLICATE".into(),
            base_url: Some(base_url.into()),
            max_tokens: None,
            temperature: None,
            response: None,
            delay_ms: 0,
        }
    }

    #[test]
    fn test_split_model() {
        assert_eq!(
            split_model("replicate/llama-2-70b-chat:latest"),
            ("replicate/llama-2-70b-chat".into(), None)
        );
        assert_eq!(
            split_model("joehoover/falcon-40b-instruct:abc123"),
            ("joehoover/falcon-40b-instruct".into(), Some("abc123".into()))
        );
        assert_eq!(split_model("a/b"), ("a/b".into(), None));
    }

    #[test]
    fn test_normalize_output_variants() {
        assert_eq!(
            ReplicateBackend::normalize_output(&json!("whole text")).unwrap(),
            "whole text"
        );
        assert_eq!(
            ReplicateBackend::normalize_output(&json!(["A ", "golden ", "visa"])).unwrap(),
            "A golden visa"
        );
        assert!(ReplicateBackend::normalize_output(&Value::Null).is_err());
        assert!(ReplicateBackend::normalize_output(&json!([1, 2])).is_err());
        assert!(ReplicateBackend::normalize_output(&json!({"text": "x"})).is_err());
    }

    #[test]
    fn test_create_request_routes() {
        let b = ReplicateBackend::new_with_key(&config("http://r", "owner/model"), "t".into());
        let (url, body) = b.create_request("p");
        assert_eq!(url, "http://r/v1/models/owner/model/predictions");
        assert_eq!(body["input"]["prompt"], "p");

        let b = ReplicateBackend::new_with_key(&config("http://r", "owner/model:v1"), "t".into());
        let (url, body) = b.create_request("p");
        assert_eq!(url, "http://r/v1/predictions");
        assert_eq!(body["version"], "v1");
    }

    #[tokio::test]
    async fn test_invoke_immediate_success() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/models/replicate/llama-2-70b-chat/predictions"))
            .and(header("authorization", "Bearer r8-test"))
            .and(header("prefer", "wait"))
            .respond_with(ResponseTemplate::new(201).set_body_json(json!({
                "id": "p1",
                "status": "succeeded",
                "output": ["Golden ", "visas ", "grant residency."]
            })))
            .mount(&server)
            .await;

        let backend = ReplicateBackend::new_with_key(
            &config(&server.uri(), "replicate/llama-2-70b-chat:latest"),
            "r8-test".into(),
        );
        assert_eq!(
            backend.invoke("q").await.unwrap(),
            "Golden visas grant residency."
        );
    }

    #[tokio::test]
    async fn test_invoke_polls_until_done() {
        let server = MockServer::start().await;
        let poll_url = format!("{}/v1/predictions/p2", server.uri());
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(201).set_body_json(json!({
                "id": "p2",
                "status": "processing",
                "output": null,
                "urls": {"get": poll_url}
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/v1/predictions/p2"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "id": "p2",
                "status": "succeeded",
                "output": "done"
            })))
            .mount(&server)
            .await;

        let backend = ReplicateBackend::new_with_key(&config(&server.uri(), "a/b"), "t".into())
            .with_poll_interval(Duration::from_millis(5));
        assert_eq!(backend.invoke("q").await.unwrap(), "done");
    }

    #[tokio::test]
    async fn test_abandoned_prediction_is_cancelled() {
        let server = MockServer::start().await;
        let get_url = format!("{}/v1/predictions/p3", server.uri());
        let cancel_url = format!("{}/v1/predictions/p3/cancel", server.uri());
        let pending = json!({
            "id": "p3",
            "status": "processing",
            "output": null,
            "urls": {"get": get_url, "cancel": cancel_url}
        });
        Mock::given(method("POST"))
            .and(path("/v1/models/a/b/predictions"))
            .respond_with(ResponseTemplate::new(201).set_body_json(pending.clone()))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/v1/predictions/p3"))
            .respond_with(ResponseTemplate::new(200).set_body_json(pending))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/v1/predictions/p3/cancel"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"status": "canceled"})))
            .expect(1)
            .mount(&server)
            .await;

        let backend = ReplicateBackend::new_with_key(&config(&server.uri(), "a/b"), "t".into())
            .with_poll_interval(Duration::from_millis(5));
        let abandoned =
            tokio::time::timeout(Duration::from_millis(100), backend.invoke("q")).await;
        assert!(abandoned.is_err());

        let mut cancelled = false;
        for _ in 0..100 {
            let requests = server.received_requests().await.unwrap_or_default();
            if requests.iter().any(|r| r.url.path() == "/v1/predictions/p3/cancel") {
                cancelled = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(cancelled);
    }

    #[tokio::test]
    async fn test_finished_prediction_is_not_cancelled() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/models/a/b/predictions"))
            .respond_with(ResponseTemplate::new(201).set_body_json(json!({
                "status": "succeeded",
                "output": "done",
                "urls": {"cancel": format!("{}/v1/predictions/p4/cancel", server.uri())}
            })))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/v1/predictions/p4/cancel"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&server)
            .await;

        let backend = ReplicateBackend::new_with_key(&config(&server.uri(), "a/b"), "t".into());
        assert_eq!(backend.invoke("q").await.unwrap(), "done");
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    #[tokio::test]
    async fn test_invoke_failed_prediction() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(201).set_body_json(json!({
                "status": "failed",
                "error": "CUDA out of memory"
            })))
            .mount(&server)
            .await;

        let backend = ReplicateBackend::new_with_key(&config(&server.uri(), "a/b"), "t".into());
        let err = backend.invoke("q").await.unwrap_err();
        assert_eq!(err.code(), "network_error");
        assert!(err.to_string().contains("CUDA out of memory"));
    }

    #[tokio::test]
    async fn test_invoke_auth_failure() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(401))
            .mount(&server)
            .await;
        let backend = ReplicateBackend::new_with_key(&config(&server.uri(), "a/b"), "t".into());
        assert_eq!(
            backend.invoke("q").await.unwrap_err(),
            BackendErrorKind::AuthFailure
        );
    }
}
