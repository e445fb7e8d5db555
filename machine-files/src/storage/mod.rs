//! Blob storage: one payload plus metadata per machine identifier.
//!
//! [`BlobStore`] is the seam between the transfer handlers and persistence. Every backend must
//! honour the same contract:
//!
//! - `put` replaces the previous record for a key atomically. Concurrent readers observe either
//!   the complete old record or the complete new one, never a partial write.
//! - Concurrent `put`s to one key serialize at commit time; the last commit wins.
//! - A `put` that fails (or whose future is dropped) leaves the previous record untouched.
//! - The payload size ceiling is enforced while the source is consumed, before the payload is
//!   fully buffered.
//!
//! Backends:
//! - [`local::LocalBlobStore`] - files on local disk, write-to-temp then rename
//! - [`memory::InMemoryBlobStore`] - process memory, for tests and ephemeral deployments

pub mod local;
pub mod memory;

use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::AsyncRead;

use crate::config::{StorageBackend, StorageConfig};
use crate::machine_id::MachineId;

pub use local::LocalBlobStore;
pub use memory::InMemoryBlobStore;

/// Error raised by a payload source while `put` is consuming it.
pub type SourceError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Incremental payload handed to [`BlobStore::put`].
pub type BlobSource = BoxStream<'static, std::result::Result<Bytes, SourceError>>;

/// Payload handed back by [`BlobStore::get`]. Owns its resources, so it can outlive the call.
pub type BlobReader = Pin<Box<dyn AsyncRead + Send + Sync>>;

#[derive(Error, Debug)]
pub enum StorageError {
    /// No record is stored under the key
    #[error("No record stored for this machine")]
    NotFound,

    /// The declared or observed payload size exceeded the ceiling
    #[error("Payload exceeds {limit} bytes")]
    PayloadTooLarge { limit: u64 },

    /// The payload source failed before it was fully consumed
    #[error("Payload source failed")]
    Source(#[source] SourceError),

    /// A persisted record could not be decoded or references missing data
    #[error("Corrupt record: {0}")]
    Corrupt(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, StorageError>;

/// Metadata supplied by the uploader alongside the payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewFile {
    pub original_name: String,
    pub content_type: String,
    /// Size announced by the client, if any. Checked against the ceiling before any bytes are
    /// read; the stored size is always the observed one.
    pub declared_size: Option<u64>,
}

/// Everything about a stored file except its bytes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileMetadata {
    pub machine_id: MachineId,
    pub original_name: String,
    pub content_type: String,
    pub size_bytes: u64,
    pub uploaded_at: DateTime<Utc>,
}

/// The current file for one machine.
pub struct StoredFile {
    pub metadata: FileMetadata,
    pub payload: BlobReader,
}

impl std::fmt::Debug for StoredFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoredFile").field("metadata", &self.metadata).finish_non_exhaustive()
    }
}

/// Trait for blob storage backends
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Consume `data` and atomically make it the record for `id`, replacing any previous one.
    async fn put(&self, id: &MachineId, file: NewFile, data: BlobSource) -> Result<FileMetadata>;

    /// Fetch the current record for `id`.
    async fn get(&self, id: &MachineId) -> Result<StoredFile>;

    /// Fetch only the metadata of the current record for `id`.
    async fn head(&self, id: &MachineId) -> Result<FileMetadata>;

    /// Remove the record for `id`. Returns whether a record existed.
    async fn delete(&self, id: &MachineId) -> Result<bool>;

    /// Metadata of every stored record, in no particular order.
    async fn list(&self) -> Result<Vec<FileMetadata>>;
}

/// Running byte count for a payload being ingested, checked against the ceiling.
#[derive(Debug)]
pub(crate) struct SizeGuard {
    limit: u64,
    seen: u64,
}

impl SizeGuard {
    pub(crate) fn new(limit: u64, declared: Option<u64>) -> Result<Self> {
        if declared.is_some_and(|declared| declared > limit) {
            return Err(StorageError::PayloadTooLarge { limit });
        }
        Ok(Self { limit, seen: 0 })
    }

    pub(crate) fn admit(&mut self, chunk: &[u8]) -> Result<()> {
        self.seen += chunk.len() as u64;
        if self.seen > self.limit {
            return Err(StorageError::PayloadTooLarge { limit: self.limit });
        }
        Ok(())
    }

    pub(crate) fn total(&self) -> u64 {
        self.seen
    }
}

/// Create a blob store backend based on configuration
pub async fn create_blob_store(config: &StorageConfig, max_blob_size: u64) -> Result<Arc<dyn BlobStore>> {
    match &config.backend {
        StorageBackend::Local { path } => {
            tracing::info!(path = %path.display(), max_blob_size, "Creating local blob store");
            Ok(Arc::new(LocalBlobStore::open(path.clone(), max_blob_size).await?))
        }
        StorageBackend::Memory => {
            tracing::warn!("Creating in-memory blob store; stored files will not survive a restart");
            Ok(Arc::new(InMemoryBlobStore::new(max_blob_size)))
        }
    }
}
