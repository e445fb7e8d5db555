//! OpenAPI documentation, served at `/api-docs/openapi.json`.

use utoipa::OpenApi;

use crate::api;
use crate::errors::ErrorBody;

/// Liveness check.
#[utoipa::path(
    get,
    path = "/healthz",
    tag = "health",
    summary = "Health check",
    responses(
        (status = 200, description = "The service is up", body = String, content_type = "text/plain"),
    )
)]
#[allow(unused)]
fn healthz() {}

#[derive(OpenApi)]
#[openapi(
    info(
        title = "machine-files",
        description = "Stores one file per machine identifier and serves it back on request. \
            Uploading for a machine that already has a file replaces it."
    ),
    paths(
        api::handlers::transfer::upload_file,
        api::handlers::transfer::download_file,
        healthz,
    ),
    components(schemas(api::models::transfer::UploadResponse, ErrorBody)),
    tags(
        (name = "transfer", description = "Machine-scoped file upload and download"),
        (name = "health", description = "Service health"),
    )
)]
pub struct ApiDoc;
