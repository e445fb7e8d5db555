//! Router-level integration tests: the full stack from HTTP to the blob store.

use std::time::Duration;

use axum::http::{Method, StatusCode, header};
use axum_test::multipart::{MultipartForm, Part};
use serde_json::json;
use url::Url;

use crate::config::CorsOrigin;
use crate::test_utils::{create_local_test_config, create_test_app, create_test_config};
use crate::{AppState, Application};

fn upload_form(name: &str, content: &'static [u8]) -> MultipartForm {
    MultipartForm::new().add_part("file", Part::bytes(content).file_name(name))
}

/// The operator scenario end to end against the disk backend
#[test_log::test(tokio::test)]
async fn test_local_store_upload_download_scenario() {
    let dir = tempfile::tempdir().unwrap();
    let (server, _bg) = create_test_app(create_local_test_config(dir.path())).await;

    let response = server
        .post("/fileupload")
        .add_query_param("machine_id", "m-001")
        .multipart(upload_form("hello.txt", b"hello"))
        .await;
    response.assert_status_ok();
    response.assert_json(&json!({ "message": "file uploaded" }));

    let response = server.get("/downloadfile").add_query_param("machine_id", "m-001").await;
    response.assert_status_ok();
    assert_eq!(response.text(), "hello");

    let response = server.get("/downloadfile").add_query_param("machine_id", "m-999").await;
    response.assert_status(StatusCode::NOT_FOUND);
    response.assert_json(&json!({ "error": "not found" }));

    // Nothing left behind in the staging area
    let mut tmp = tokio::fs::read_dir(dir.path().join("tmp")).await.unwrap();
    assert!(tmp.next_entry().await.unwrap().is_none());
}

#[test_log::test(tokio::test)]
async fn test_files_survive_restart() {
    let dir = tempfile::tempdir().unwrap();

    {
        let (server, bg) = create_test_app(create_local_test_config(dir.path())).await;
        server
            .post("/fileupload")
            .add_query_param("machine_id", "press-7")
            .multipart(upload_form("recipe.json", br#"{"temp":210}"#))
            .await
            .assert_status_ok();
        bg.shutdown().await;
    }

    let (server, _bg) = create_test_app(create_local_test_config(dir.path())).await;
    let response = server.get("/downloadfile").add_query_param("machine_id", "press-7").await;
    response.assert_status_ok();
    assert_eq!(response.text(), r#"{"temp":210}"#);
    assert_eq!(response.header(header::CONTENT_TYPE), "application/json");
}

#[tokio::test]
async fn test_healthz_and_openapi() {
    let (server, _bg) = create_test_app(create_test_config()).await;

    let response = server.get("/healthz").await;
    response.assert_status_ok();
    assert_eq!(response.text(), "OK");

    let response = server.get("/api-docs/openapi.json").await;
    response.assert_status_ok();
    let content = response.text();
    assert!(content.contains("\"openapi\""));
    assert!(content.contains("/fileupload"));
    assert!(content.contains("/downloadfile"));
}

#[tokio::test]
async fn test_build_router_with_metrics_disabled() {
    let (server, _bg) = create_test_app(create_test_config()).await;

    let response = server.get("/internal/metrics").await;
    response.assert_status(StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_build_router_with_metrics_enabled() {
    let mut config = create_test_config();
    config.enable_metrics = true;
    let (server, _bg) = create_test_app(config).await;

    // Generate some traffic so the request counters exist
    server.get("/healthz").await.assert_status_ok();

    let response = server.get("/internal/metrics").await;
    response.assert_status_ok();
    let content = response.text();
    assert!(content.contains("# HELP") || content.contains("# TYPE"));
}

#[tokio::test]
async fn test_cors_preflight_wildcard() {
    let (server, _bg) = create_test_app(create_test_config()).await;

    let response = server
        .method(Method::OPTIONS, "/fileupload")
        .add_header(header::ORIGIN, "https://anywhere.example")
        .add_header(header::ACCESS_CONTROL_REQUEST_METHOD, "POST")
        .await;
    response.assert_status_ok();
    assert_eq!(response.header(header::ACCESS_CONTROL_ALLOW_ORIGIN), "*");
    let methods = response.header(header::ACCESS_CONTROL_ALLOW_METHODS);
    assert!(methods.to_str().unwrap().contains("POST"));
}

#[tokio::test]
async fn test_cors_explicit_origins() {
    let mut config = create_test_config();
    config.cors.allowed_origins = vec![CorsOrigin::Url(Url::parse("https://ops.example.com").unwrap())];
    config.cors.allow_credentials = true;
    let (server, _bg) = create_test_app(config).await;

    let response = server
        .get("/healthz")
        .add_header(header::ORIGIN, "https://ops.example.com")
        .await;
    assert_eq!(response.header(header::ACCESS_CONTROL_ALLOW_ORIGIN), "https://ops.example.com");
    assert_eq!(response.header(header::ACCESS_CONTROL_ALLOW_CREDENTIALS), "true");

    let response = server.get("/healthz").add_header(header::ORIGIN, "https://evil.example").await;
    assert!(!response.headers().contains_key(header::ACCESS_CONTROL_ALLOW_ORIGIN));
}

#[tokio::test]
async fn test_retention_starts_background_sweeper() {
    let mut config = create_test_config();
    config.storage.retention = Some(Duration::from_secs(3600));
    config.storage.sweep_interval = Duration::from_millis(10);

    let app = Application::new(config).await.unwrap();
    let (_server, bg) = app.into_test_server();
    assert_eq!(bg.len(), 1);

    tokio::time::timeout(Duration::from_secs(5), bg.shutdown())
        .await
        .expect("background services should stop promptly");

    let (_server, bg) = create_test_app(create_test_config()).await;
    assert!(bg.is_empty());
}

#[tokio::test]
async fn test_dropping_background_services_cancels_sweeper() {
    let mut config = create_test_config();
    config.storage.retention = Some(Duration::from_secs(3600));
    let store = std::sync::Arc::new(crate::storage::InMemoryBlobStore::new(1024));
    let token = tokio_util::sync::CancellationToken::new();

    let bg = crate::setup_background_services(&config, store, token.clone());
    assert_eq!(bg.len(), 1);
    assert!(!token.is_cancelled());

    drop(bg);
    assert!(token.is_cancelled());
}

#[tokio::test]
async fn test_app_state_builder_defaults_to_unlimited_uploads() {
    let config = create_test_config();
    let store = std::sync::Arc::new(crate::storage::InMemoryBlobStore::new(1024));
    let transfer = crate::transfer::TransferService::new(store, Default::default(), 1024);

    let state = AppState::builder().config(config).transfer(transfer).build();
    assert!(state.limiters.file_uploads.is_none());

    let server = axum_test::TestServer::new(crate::build_router(&state).unwrap()).unwrap();
    server
        .post("/fileupload")
        .add_query_param("machine_id", "m-001")
        .multipart(upload_form("a.bin", b"abc"))
        .await
        .assert_status_ok();
}
