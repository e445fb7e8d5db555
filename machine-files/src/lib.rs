//! # machine-files: per-machine file drop
//!
//! `machine-files` associates one binary file with each machine identifier and hands it back on
//! request. It is the backend for a simple operator form: pick a machine, attach a file, press
//! upload; later, anyone with the machine's identifier can download the file again.
//!
//! ## Overview
//!
//! Two endpoints make up the public surface:
//!
//! - `POST /fileupload?machine_id=<id>` takes a `multipart/form-data` body and stores the first
//!   part that carries a filename. A later upload for the same machine replaces the file
//!   wholesale (last write wins).
//! - `GET /downloadfile?machine_id=<id>` streams the stored bytes back with the original name in
//!   `Content-Disposition`, or answers `404 {"error":"not found"}`.
//!
//! There is no authentication, no versioning and no partial transfer: one whole file per
//! machine, replaced atomically.
//!
//! ## Architecture
//!
//! Requests flow through the [Axum](https://github.com/tokio-rs/axum) router into thin handlers
//! ([`api::handlers::transfer`]), which frame the HTTP exchange and delegate to
//! [`transfer::TransferService`]. The service validates the identifier
//! ([`machine_id::IdentifierPolicy`]), talks to a [`storage::BlobStore`], and maps storage
//! failures onto the stable client-facing error kinds in [`errors::Error`].
//!
//! The default backend ([`storage::LocalBlobStore`]) keeps files on local disk and commits each
//! upload with a rename, so a reader always sees either the previous file or the new one. An
//! in-memory backend exists for tests and throwaway deployments.
//!
//! **Background services** run alongside the HTTP server: currently only the optional
//! retention sweeper ([`retention`]), which evicts files older than `storage.retention`.
//!
//! ## Quick Start
//!
//! ```no_run
//! use clap::Parser;
//! use machine_files::{Application, Config};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let args = machine_files::config::Args::parse();
//!     let config = Config::load(&args)?;
//!
//!     machine_files::telemetry::init_telemetry(config.enable_otel_export)?;
//!
//!     let app = Application::new(config).await?;
//!     app.serve(async {
//!         let _ = tokio::signal::ctrl_c().await;
//!     })
//!     .await
//! }
//! ```
//!
//! ## Configuration
//!
//! See the [`config`] module for configuration options.
pub mod api;
pub mod config;
pub mod errors;
pub mod limits;
pub mod machine_id;
mod openapi;
pub mod retention;
pub mod storage;
pub mod telemetry;
pub mod transfer;

#[cfg(test)]
mod test;
#[cfg(test)]
pub mod test_utils;

use std::sync::Arc;

use axum::{
    Json, Router,
    http::{self, HeaderValue},
    routing::{get, post},
};
use axum_prometheus::PrometheusMetricLayer;
use bon::Builder;
use tokio::net::TcpListener;
use tokio_util::sync::{CancellationToken, DropGuard};
use tower_http::{
    cors::{AllowHeaders, AllowOrigin, CorsLayer},
    trace::{DefaultMakeSpan, DefaultOnRequest, DefaultOnResponse, TraceLayer},
};
use tracing::{Level, debug, info, instrument};
use utoipa::OpenApi;

pub use config::Config;

use crate::config::CorsOrigin;
use crate::limits::Limiters;
use crate::machine_id::IdentifierPolicy;
use crate::openapi::ApiDoc;
use crate::storage::{BlobStore, create_blob_store};
use crate::transfer::TransferService;

/// Application state shared across all request handlers.
///
/// # Example
///
/// ```ignore
/// let state = AppState::builder()
///     .config(config)
///     .transfer(transfer)
///     .build();
/// ```
#[derive(Clone, Builder)]
pub struct AppState {
    pub config: Config,
    pub transfer: TransferService,
    #[builder(default)]
    pub limiters: Limiters,
}

fn create_cors_layer(config: &Config) -> anyhow::Result<CorsLayer> {
    let cors_config = &config.cors;

    let allow_origin = if cors_config.allowed_origins.contains(&CorsOrigin::Wildcard) {
        AllowOrigin::any()
    } else {
        let mut origins = Vec::new();
        for origin in &cors_config.allowed_origins {
            if let CorsOrigin::Url(url) = origin {
                // Origins never carry a path, but Url always renders one
                origins.push(url.as_str().trim_end_matches('/').parse::<HeaderValue>()?);
            }
        }
        AllowOrigin::list(origins)
    };

    // A wildcard header list is not allowed together with credentials
    let allow_headers = if cors_config.allow_credentials {
        AllowHeaders::mirror_request()
    } else {
        AllowHeaders::any()
    };

    let mut cors = CorsLayer::new()
        .allow_origin(allow_origin)
        .allow_methods([http::Method::GET, http::Method::POST, http::Method::OPTIONS])
        .allow_headers(allow_headers)
        .allow_credentials(cors_config.allow_credentials)
        .expose_headers([http::header::CONTENT_DISPOSITION]);

    if let Some(max_age) = cors_config.max_age {
        cors = cors.max_age(std::time::Duration::from_secs(max_age));
    }

    Ok(cors)
}

/// Build the application router with all endpoints and middleware.
///
/// Routes: the two transfer endpoints, `/healthz`, `/api-docs/openapi.json`, and
/// `/internal/metrics` when metrics are enabled. CORS and request tracing wrap everything.
#[instrument(skip_all)]
pub fn build_router(state: &AppState) -> anyhow::Result<Router> {
    let router = Router::new()
        .route("/healthz", get(|| async { "OK" }))
        .route("/fileupload", post(api::handlers::transfer::upload_file))
        .route("/downloadfile", get(api::handlers::transfer::download_file))
        .route("/api-docs/openapi.json", get(|| async { Json(ApiDoc::openapi()) }))
        .with_state(state.clone());

    let mut router = router.layer(create_cors_layer(&state.config)?);

    if state.config.enable_metrics {
        let (prometheus_layer, metric_handle) = PrometheusMetricLayer::pair();
        router = router
            .route("/internal/metrics", get(|| async move { metric_handle.render() }))
            .layer(prometheus_layer);
    }

    let router = router.layer(
        TraceLayer::new_for_http()
            .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
            .on_request(DefaultOnRequest::new().level(Level::INFO))
            .on_response(DefaultOnResponse::new().level(Level::INFO)),
    );

    Ok(router)
}

/// Container for background services and their lifecycle management.
///
/// When dropped, the guard cancels the shutdown token, signalling every task to stop.
pub struct BackgroundServices {
    background_tasks: Vec<tokio::task::JoinHandle<()>>,
    shutdown_token: CancellationToken,
    _drop_guard: DropGuard,
}

impl BackgroundServices {
    /// Number of spawned background tasks
    pub fn len(&self) -> usize {
        self.background_tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.background_tasks.is_empty()
    }

    /// Gracefully shutdown all background tasks
    pub async fn shutdown(self) {
        self.shutdown_token.cancel();

        for handle in self.background_tasks {
            let _ = handle.await;
        }
    }
}

/// Spawn the background tasks the configuration asks for.
fn setup_background_services(config: &Config, store: Arc<dyn BlobStore>, shutdown_token: CancellationToken) -> BackgroundServices {
    let drop_guard = shutdown_token.clone().drop_guard();
    let mut background_tasks = Vec::new();

    if let Some(retention) = config.storage.retention {
        let handle = tokio::spawn(retention::run_retention_sweeper(
            store,
            retention,
            config.storage.sweep_interval,
            shutdown_token.clone(),
        ));
        background_tasks.push(handle);
    } else {
        debug!("No retention configured; stored files are kept until replaced");
    }

    BackgroundServices {
        background_tasks,
        shutdown_token,
        _drop_guard: drop_guard,
    }
}

/// Main application struct that owns all resources and lifecycle.
///
/// # Lifecycle
///
/// 1. **Create**: [`Application::new`] opens the blob store and starts background services
/// 2. **Serve**: [`Application::serve`] binds to a TCP port and starts handling requests
/// 3. **Shutdown**: When the shutdown signal resolves, in-flight requests drain and background
///    services are stopped
pub struct Application {
    router: Router,
    config: Config,
    bg_services: BackgroundServices,
}

impl Application {
    /// Create a new application instance with all resources initialized
    pub async fn new(config: Config) -> anyhow::Result<Self> {
        debug!("Starting machine-files with configuration: {:#?}", config);

        let store = create_blob_store(&config.storage, config.limits.files.max_file_size).await?;
        let transfer = TransferService::new(
            store.clone(),
            IdentifierPolicy::new(&config.identifiers),
            config.limits.files.max_file_size,
        );

        let shutdown_token = CancellationToken::new();
        let bg_services = setup_background_services(&config, store, shutdown_token);

        let app_state = AppState::builder()
            .config(config.clone())
            .transfer(transfer)
            .limiters(Limiters::new(&config.limits))
            .build();
        let router = build_router(&app_state)?;

        Ok(Self {
            router,
            config,
            bg_services,
        })
    }

    /// Convert application into a test server (for tests)
    #[cfg(test)]
    pub fn into_test_server(self) -> (axum_test::TestServer, BackgroundServices) {
        let server = axum_test::TestServer::new(self.router).expect("Failed to create test server");
        (server, self.bg_services)
    }

    /// Start serving the application
    pub async fn serve<F>(self, shutdown: F) -> anyhow::Result<()>
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let bind_addr = self.config.bind_address();
        let listener = TcpListener::bind(&bind_addr).await?;
        info!(
            "machine-files listening on http://{}, available at http://localhost:{}",
            bind_addr, self.config.port
        );

        axum::serve(listener, self.router).with_graceful_shutdown(shutdown).await?;

        info!("Stopping background services...");
        self.bg_services.shutdown().await;

        info!("Shutting down telemetry...");
        telemetry::shutdown_telemetry();

        Ok(())
    }
}
