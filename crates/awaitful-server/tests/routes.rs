//! Integration tests for the HTTP routes.

use std::sync::Arc;
use std::time::Duration;

use awaitful_server::{AppState, create_router};
use axum::body::{Body, to_bytes};
use axum::http::{Request, StatusCode};
use serde_json::{Value, json};
use tower::ServiceExt;

fn app(static_dir: &std::path::Path) -> axum::Router {
    create_router(Arc::new(AppState::new(static_dir)))
}

async fn get(router: axum::Router, uri: &str) -> (StatusCode, Vec<u8>) {
    let response = router
        .oneshot(Request::get(uri).body(Body::empty()).unwrap())
        .await
        .unwrap();
    let status = response.status();
    let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    (status, body.to_vec())
}

async fn get_json(router: axum::Router, uri: &str) -> Value {
    let (status, body) = get(router, uri).await;
    assert_eq!(status, StatusCode::OK, "{uri}");
    serde_json::from_slice(&body).unwrap()
}

#[tokio::test]
async fn test_health() {
    let dir = tempfile::tempdir().unwrap();
    let body = get_json(app(dir.path()), "/health").await;
    assert_eq!(body["status"], "ok");
}

#[tokio::test(start_paused = true)]
async fn test_item_routes() {
    let dir = tempfile::tempdir().unwrap();

    let started = tokio::time::Instant::now();
    assert_eq!(
        get_json(app(dir.path()), "/items").await,
        json!(["test", "test2"])
    );
    assert!(started.elapsed() >= Duration::from_secs(1));

    assert_eq!(
        get_json(app(dir.path()), "/items2").await,
        json!(["test3", "test4"])
    );

    let started = tokio::time::Instant::now();
    assert_eq!(
        get_json(app(dir.path()), "/items3").await,
        json!(["test", "test2", "test3", "test4"])
    );
    assert!(started.elapsed() >= Duration::from_secs(5));

    assert_eq!(
        get_json(app(dir.path()), "/itemUrls").await,
        json!(["/items", "/items2", "/items3"])
    );
}

#[tokio::test]
async fn test_static_page_resolution() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("index.html"), "<h1>home</h1>").unwrap();
    std::fs::write(dir.path().join("todo.html"), "<h1>todo</h1>").unwrap();
    std::fs::write(dir.path().join("app.js"), "console.log(1)").unwrap();

    let (status, body) = get(app(dir.path()), "/").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, b"<h1>home</h1>");

    let (status, body) = get(app(dir.path()), "/todo").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, b"<h1>todo</h1>");

    let (status, body) = get(app(dir.path()), "/app.js").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, b"console.log(1)");
}

#[tokio::test]
async fn test_static_missing_file() {
    let dir = tempfile::tempdir().unwrap();
    let (status, _) = get(app(dir.path()), "/nowhere").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}
