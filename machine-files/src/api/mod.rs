//! HTTP surface: route handlers and their request/response models.
//!
//! - `POST /fileupload?machine_id=<id>`: multipart upload, see [`handlers::transfer::upload_file`]
//! - `GET /downloadfile?machine_id=<id>`: raw download, see [`handlers::transfer::download_file`]
//!
//! Failures are returned as `{"error": "<message>"}` by [`crate::errors::Error`].

pub mod handlers;
pub mod models;
