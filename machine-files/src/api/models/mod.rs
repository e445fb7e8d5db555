//! API request and response data models, annotated with `utoipa` for the OpenAPI document.

pub mod transfer;
