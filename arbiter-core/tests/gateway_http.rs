//! Integration tests for the gateway's plain HTTP routes.

use axum::body::Body;
use std::sync::Arc;
use std::time::Duration;
use tower::ServiceExt;

use arbiter_core::backends::{Backend, BackendPool, StaticBackend};
use arbiter_core::classifier::FixedClassifier;
use arbiter_core::config::EvaluationConfig;
use arbiter_core::gateway::{GatewayConfig, GatewayServer, SharedGateway, gateway_router};
use arbiter_core::{Dispatcher, Evaluator, Pipeline};

fn make_gateway(max_connections: usize) -> SharedGateway {
    let backends: Vec<Arc<dyn Backend>> = vec![
        Arc::new(StaticBackend::new("gpt-3.5-turbo", "one")),
        Arc::new(StaticBackend::new("gpt-4", "two")),
        Arc::new(StaticBackend::new("Llama-2-70b-chat", "three")),
    ];
    let pipeline = Pipeline::new(
        None,
        BackendPool::new(backends).unwrap(),
        Dispatcher::new(Duration::from_secs(5)),
        Evaluator::new(
            Arc::new(FixedClassifier::new("acceptable", 0.5)),
            EvaluationConfig::default(),
        ),
    );
    let config = GatewayConfig {
        max_connections,
        ..GatewayConfig::default()
    };
    GatewayServer::new(config, Arc::new(pipeline)).shared()
}

fn make_request(uri: &str) -> axum::http::Request<Body> {
    axum::http::Request::builder()
        .uri(uri)
        .body(Body::empty())
        .unwrap()
}

async fn get(gw: SharedGateway, uri: &str) -> (axum::http::StatusCode, Vec<u8>) {
    let app = gateway_router(gw);
    let resp = ServiceExt::<axum::http::Request<Body>>::oneshot(app, make_request(uri))
        .await
        .unwrap();
    let status = resp.status();
    let body = axum::body::to_bytes(resp.into_body(), 100_000)
        .await
        .unwrap();
    (status, body.to_vec())
}

#[tokio::test]
async fn test_health_reports_backends_in_order() {
    let (status, body) = get(make_gateway(7), "/health").await;
    assert_eq!(status, 200);
    let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(json["status"], "ok");
    assert_eq!(json["connections"], 0);
    assert_eq!(json["max_connections"], 7);
    assert!(json["uptime_secs"].as_u64().is_some());
    assert_eq!(
        json["backends"],
        serde_json::json!(["gpt-3.5-turbo", "gpt-4", "Llama-2-70b-chat"])
    );
}

#[tokio::test]
async fn test_index_serves_prompt_form() {
    let (status, body) = get(make_gateway(1), "/").await;
    assert_eq!(status, 200);
    let html = String::from_utf8(body).unwrap();
    assert!(html.contains("<form id=\"form\">"));
    assert!(html.contains("JSON.stringify({ prompt })"));
}

#[tokio::test]
async fn test_unknown_route_is_404() {
    let (status, _) = get(make_gateway(1), "/api/status").await;
    assert_eq!(status, 404);
}
