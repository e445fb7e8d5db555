//! Test utilities shared by handler and integration tests.

use axum_test::TestServer;

use crate::config::{Config, StorageBackend, StorageConfig};

pub async fn create_test_app(config: Config) -> (TestServer, crate::BackgroundServices) {
    let app = crate::Application::new(config).await.expect("Failed to create application");
    app.into_test_server()
}

/// In-memory storage with the optional services switched off.
pub fn create_test_config() -> Config {
    Config {
        host: "127.0.0.1".to_string(),
        port: 0,
        storage: StorageConfig {
            backend: StorageBackend::Memory,
            ..Default::default()
        },
        enable_metrics: false,
        enable_otel_export: false,
        ..Default::default()
    }
}

/// Local disk storage rooted in `dir`.
pub fn create_local_test_config(dir: &std::path::Path) -> Config {
    let mut config = create_test_config();
    config.storage.backend = StorageBackend::Local { path: dir.to_path_buf() };
    config
}
