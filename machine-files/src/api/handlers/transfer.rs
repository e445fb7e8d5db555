//! Upload and download endpoints.
//!
//! The multipart body is parsed with `multer` straight off the request stream, so the file part
//! is handed to the blob store chunk by chunk and never buffered here.

use axum::{
    Json,
    body::Body,
    extract::{Query, Request, State, rejection::QueryRejection},
    http::{HeaderMap, HeaderValue, header},
    response::{IntoResponse, Response},
};
use futures::StreamExt;
use multer::{Constraints, Multipart, SizeLimit};
use tokio_util::io::ReaderStream;

use crate::AppState;
use crate::api::models::transfer::{MachineQuery, UploadResponse};
use crate::errors::{Error, ErrorBody, Result};
use crate::storage::{BlobSource, NewFile, SourceError, StoredFile};
use crate::transfer::multipart_error;

/// Room allowed for multipart boundaries and part headers on top of the payload ceiling.
const MULTIPART_ENVELOPE: u64 = 64 * 1024;

/// Longest original file name kept, in bytes.
const MAX_ORIGINAL_NAME_BYTES: usize = 255;

const OCTET_STREAM: &str = "application/octet-stream";

#[utoipa::path(
    post,
    path = "/fileupload",
    tag = "transfer",
    summary = "Upload file",
    description = "Store a file for a machine, replacing any file previously stored for it. The body is \
        multipart/form-data; the first part carrying a filename is stored and other parts are ignored.",
    params(MachineQuery),
    request_body(content_type = "multipart/form-data", description = "A part with a filename, conventionally named `file`"),
    responses(
        (status = 200, description = "File stored", body = UploadResponse),
        (status = 400, description = "Invalid machine_id, missing file part, or malformed multipart body", body = ErrorBody),
        (status = 413, description = "Payload too large", body = ErrorBody),
        (status = 429, description = "Too many uploads in progress", body = ErrorBody),
        (status = 500, description = "Storage write error", body = ErrorBody)
    )
)]
#[tracing::instrument(skip_all)]
pub async fn upload_file(
    State(state): State<AppState>,
    query: std::result::Result<Query<MachineQuery>, QueryRejection>,
    request: Request,
) -> Result<Json<UploadResponse>> {
    let machine_id = state.transfer.machine_id(requested_machine_id(&query))?;

    let limit = state.transfer.max_file_size();
    let stream_limit = limit.saturating_add(MULTIPART_ENVELOPE);
    if let Some(declared) = declared_length(request.headers())
        && declared > stream_limit
    {
        return Err(Error::PayloadTooLarge { limit });
    }

    let boundary = multipart_boundary(request.headers())?;

    let _permit = state.limiters.admit_upload().await?;

    let constraints = Constraints::new().size_limit(SizeLimit::new().whole_stream(stream_limit));
    let mut multipart = Multipart::with_constraints(request.into_body().into_data_stream(), boundary, constraints);

    let field = loop {
        match multipart.next_field().await.map_err(multipart_error)? {
            Some(field) if field.file_name().is_some() => break field,
            Some(field) => {
                tracing::debug!(field = ?field.name(), "Skipping multipart part without a filename");
            }
            None => return Err(Error::MissingFile),
        }
    };

    let original_name = sanitize_file_name(field.file_name().unwrap_or_default());
    let declared_type = field
        .content_type()
        .filter(|mime| mime.essence_str() != OCTET_STREAM)
        .map(ToString::to_string);
    let file = NewFile {
        content_type: resolve_content_type(declared_type, &original_name),
        original_name,
        declared_size: declared_length(field.headers()),
    };

    let data: BlobSource = field.map(|chunk| chunk.map_err(SourceError::from)).boxed();
    state.transfer.upload(&machine_id, file, data).await?;

    Ok(Json(UploadResponse::uploaded()))
}

#[utoipa::path(
    get,
    path = "/downloadfile",
    tag = "transfer",
    summary = "Download file",
    description = "Return the file currently stored for a machine as an attachment.",
    params(MachineQuery),
    responses(
        (status = 200, description = "The stored file", content_type = "application/octet-stream", body = Vec<u8>),
        (status = 400, description = "Invalid machine_id", body = ErrorBody),
        (status = 404, description = "No file stored for this machine", body = ErrorBody),
        (status = 500, description = "Storage read error", body = ErrorBody)
    )
)]
#[tracing::instrument(skip_all)]
pub async fn download_file(
    State(state): State<AppState>,
    query: std::result::Result<Query<MachineQuery>, QueryRejection>,
) -> Result<Response> {
    let machine_id = state.transfer.machine_id(requested_machine_id(&query))?;
    let StoredFile { metadata, payload } = state.transfer.download(&machine_id).await?;

    let mut headers = HeaderMap::new();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_str(&metadata.content_type).unwrap_or(HeaderValue::from_static(OCTET_STREAM)),
    );
    headers.insert(header::CONTENT_LENGTH, HeaderValue::from(metadata.size_bytes));
    headers.insert(header::CONTENT_DISPOSITION, content_disposition(&metadata.original_name));
    if let Ok(last_modified) = HeaderValue::from_str(&metadata.uploaded_at.format("%a, %d %b %Y %H:%M:%S GMT").to_string()) {
        headers.insert(header::LAST_MODIFIED, last_modified);
    }

    Ok((headers, Body::from_stream(ReaderStream::new(payload))).into_response())
}

/// A query string that does not parse is treated like a missing identifier.
fn requested_machine_id(query: &std::result::Result<Query<MachineQuery>, QueryRejection>) -> Option<&str> {
    match query {
        Ok(Query(query)) => query.machine_id.as_deref(),
        Err(rejection) => {
            tracing::debug!(%rejection, "Unparseable query string");
            None
        }
    }
}

fn declared_length(headers: &HeaderMap) -> Option<u64> {
    headers
        .get(header::CONTENT_LENGTH)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.trim().parse().ok())
}

fn multipart_boundary(headers: &HeaderMap) -> Result<String> {
    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .ok_or_else(|| Error::MalformedUpload {
            detail: "missing or unreadable Content-Type".to_string(),
        })?;

    multer::parse_boundary(content_type).map_err(|e| Error::MalformedUpload { detail: e.to_string() })
}

/// Reduce an uploader-supplied file name to something safe to echo back in a header.
///
/// Only the last path segment is kept and control characters are dropped.
fn sanitize_file_name(raw: &str) -> String {
    let last_segment = raw.rsplit(['/', '\\']).next().unwrap_or_default();
    let cleaned: String = last_segment.chars().filter(|c| !c.is_control()).collect();
    let cleaned = cleaned.trim();

    let mut end = cleaned.len().min(MAX_ORIGINAL_NAME_BYTES);
    while !cleaned.is_char_boundary(end) {
        end -= 1;
    }
    let truncated = &cleaned[..end];

    match truncated {
        "" | "." | ".." => "file".to_string(),
        name => name.to_string(),
    }
}

/// A declared type other than `application/octet-stream` wins; otherwise guess from the name.
fn resolve_content_type(declared: Option<String>, original_name: &str) -> String {
    declared
        .or_else(|| mime_guess::from_path(original_name).first_raw().map(str::to_string))
        .unwrap_or_else(|| OCTET_STREAM.to_string())
}

/// `attachment` disposition with an ASCII fallback name and the exact name in RFC 5987 form.
fn content_disposition(original_name: &str) -> HeaderValue {
    let fallback: String = original_name
        .chars()
        .map(|c| match c {
            '"' | '\\' => '_',
            c if c == ' ' || c.is_ascii_graphic() => c,
            _ => '_',
        })
        .collect();

    let mut encoded = String::with_capacity(original_name.len());
    for byte in original_name.bytes() {
        if byte.is_ascii_alphanumeric() || b"!#$&+-.^_`|~".contains(&byte) {
            encoded.push(byte as char);
        } else {
            encoded.push_str(&format!("%{byte:02X}"));
        }
    }

    HeaderValue::from_str(&format!("attachment; filename=\"{fallback}\"; filename*=UTF-8''{encoded}"))
        .unwrap_or(HeaderValue::from_static("attachment"))
}
