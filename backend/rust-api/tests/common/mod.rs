#![allow(dead_code)]

use axum::{
    body::{to_bytes, Body},
    http::{Request, StatusCode},
    Router,
};
use questionengine_api::{
    config::Config, create_router, services::step_store::InMemoryStepStore, services::AppState,
};
use serde_json::Value;
use std::sync::Arc;
use tower::ServiceExt;

pub async fn create_test_app() -> Router {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::DEBUG)
        .try_init();

    let app_state = Arc::new(AppState::with_store(
        Config::in_memory(),
        Arc::new(InMemoryStepStore::new()),
    ));

    create_router(app_state)
}

pub async fn send(app: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let builder = Request::builder()
        .method(method)
        .uri(uri)
        .header("content-type", "application/json");
    let request = match body {
        Some(json) => builder.body(Body::from(json.to_string())).unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    };

    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let json = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes)
            .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(&bytes).to_string()))
    };

    (status, json)
}

/// Starts an attempt and returns its id.
pub async fn start_attempt(app: &Router) -> String {
    let (status, json) = send(
        app,
        "POST",
        "/api/v1/attempts",
        Some(serde_json::json!({ "question_id": "q-1", "user_id": "student-1" })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED, "unexpected body {}", json);
    json["attempt"]["id"].as_str().unwrap().to_string()
}
