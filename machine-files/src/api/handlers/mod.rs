//! Axum route handlers.
//!
//! Handlers validate and frame requests; storage and error mapping live in
//! [`crate::transfer::TransferService`].

pub mod transfer;
