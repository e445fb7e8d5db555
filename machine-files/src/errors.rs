use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::{Deserialize, Serialize};
use thiserror::Error as ThisError;
use utoipa::ToSchema;

use crate::storage::StorageError;

/// Failures surfaced by the transfer endpoints.
///
/// Every variant maps to one HTTP status and one stable, client-safe message. The fields carry
/// diagnostic detail for the logs only; they are never written to the response body.
#[derive(ThisError, Debug)]
pub enum Error {
    /// The machine identifier is empty, too long, or uses characters outside the allowed set
    #[error("Invalid machine identifier: {reason}")]
    InvalidIdentifier { reason: String },

    /// The multipart body did not contain a part with a filename
    #[error("No file part in upload")]
    MissingFile,

    /// The request body is not a well-formed multipart message
    #[error("Malformed multipart body: {detail}")]
    MalformedUpload { detail: String },

    /// The payload (declared or observed) exceeds the configured ceiling
    #[error("Payload exceeds maximum size of {limit} bytes")]
    PayloadTooLarge { limit: u64 },

    /// The upload limiter rejected the request
    #[error("{message}")]
    TooManyUploads { message: String },

    /// No file is stored for the machine
    #[error("No file stored for machine {machine_id}")]
    NotFound { machine_id: String },

    /// The blob store failed while committing an upload
    #[error("Failed to store file")]
    StorageWrite(#[source] StorageError),

    /// The blob store failed while reading a record back
    #[error("Failed to read file")]
    StorageRead(#[source] StorageError),

    /// Generic internal service error
    #[error("Failed to {operation}")]
    Internal { operation: String },
}

/// JSON body returned for every failed request.
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct ErrorBody {
    pub error: String,
}

impl Error {
    pub fn status_code(&self) -> StatusCode {
        match self {
            Error::InvalidIdentifier { .. } | Error::MissingFile | Error::MalformedUpload { .. } => StatusCode::BAD_REQUEST,
            Error::PayloadTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            Error::TooManyUploads { .. } => StatusCode::TOO_MANY_REQUESTS,
            Error::NotFound { .. } => StatusCode::NOT_FOUND,
            Error::StorageWrite(_) | Error::StorageRead(_) | Error::Internal { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Returns a user-safe error message, without leaking internal implementation details
    pub fn user_message(&self) -> &'static str {
        match self {
            Error::InvalidIdentifier { .. } => "invalid machine_id",
            Error::MissingFile => "missing file",
            Error::MalformedUpload { .. } => "malformed multipart body",
            Error::PayloadTooLarge { .. } => "payload too large",
            Error::TooManyUploads { .. } => "too many uploads in progress",
            Error::NotFound { .. } => "not found",
            Error::StorageWrite(_) => "storage write error",
            Error::StorageRead(_) => "storage read error",
            Error::Internal { .. } => "internal server error",
        }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        match &self {
            Error::StorageWrite(_) | Error::StorageRead(_) | Error::Internal { .. } => {
                tracing::error!("Internal service error: {}", error_chain(&self));
            }
            Error::TooManyUploads { .. } | Error::PayloadTooLarge { .. } => {
                tracing::warn!("Upload rejected: {}", self);
            }
            Error::InvalidIdentifier { .. } | Error::MissingFile | Error::MalformedUpload { .. } | Error::NotFound { .. } => {
                tracing::debug!("Client error: {}", self);
            }
        }

        let body = ErrorBody {
            error: self.user_message().to_string(),
        };
        (self.status_code(), Json(body)).into_response()
    }
}

/// Joins an error with its `source()` chain for log output.
fn error_chain(err: &dyn std::error::Error) -> String {
    let mut out = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        out.push_str(": ");
        out.push_str(&cause.to_string());
        source = cause.source();
    }
    out
}

/// Type alias for service operation results
pub type Result<T> = std::result::Result<T, Error>;
