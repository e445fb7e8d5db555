//! Machine-scoped upload and download, independent of HTTP.
//!
//! [`TransferService`] ties identifier validation to the blob store and turns
//! [`StorageError`]s into the client-facing [`Error`] kinds. The HTTP handlers only deal with
//! framing.

use std::sync::Arc;

use crate::errors::{Error, Result};
use crate::machine_id::{IdentifierPolicy, MachineId};
use crate::storage::{BlobSource, BlobStore, FileMetadata, NewFile, SourceError, StorageError, StoredFile};

#[derive(Clone)]
pub struct TransferService {
    store: Arc<dyn BlobStore>,
    identifiers: IdentifierPolicy,
    max_file_size: u64,
}

impl TransferService {
    pub fn new(store: Arc<dyn BlobStore>, identifiers: IdentifierPolicy, max_file_size: u64) -> Self {
        Self {
            store,
            identifiers,
            max_file_size,
        }
    }

    pub fn max_file_size(&self) -> u64 {
        self.max_file_size
    }

    /// Validate the identifier a request carried. A missing identifier is treated as empty.
    pub fn machine_id(&self, raw: Option<&str>) -> Result<MachineId> {
        self.identifiers.validate(raw.unwrap_or_default())
    }

    /// Store `data` as the file for `machine_id`, replacing any previous one.
    ///
    /// On any error the previous file (if there was one) is still the current one.
    #[tracing::instrument(skip_all, fields(machine_id = %machine_id, original_name = %file.original_name))]
    pub async fn upload(&self, machine_id: &MachineId, file: NewFile, data: BlobSource) -> Result<FileMetadata> {
        let metadata = self.store.put(machine_id, file, data).await.map_err(upload_error)?;

        tracing::info!(
            size_bytes = metadata.size_bytes,
            content_type = %metadata.content_type,
            "File stored"
        );
        Ok(metadata)
    }

    /// Fetch the current file for `machine_id`.
    #[tracing::instrument(skip_all, fields(machine_id = %machine_id))]
    pub async fn download(&self, machine_id: &MachineId) -> Result<StoredFile> {
        match self.store.get(machine_id).await {
            Ok(file) => {
                tracing::debug!(size_bytes = file.metadata.size_bytes, "Serving stored file");
                Ok(file)
            }
            Err(StorageError::NotFound) => Err(Error::NotFound {
                machine_id: machine_id.to_string(),
            }),
            Err(e) => Err(Error::StorageRead(e)),
        }
    }
}

fn upload_error(err: StorageError) -> Error {
    match err {
        StorageError::PayloadTooLarge { limit } => Error::PayloadTooLarge { limit },
        StorageError::Source(source) => source_error(source),
        other => Error::StorageWrite(other),
    }
}

/// Failures of the payload source come from the multipart parser reading the request body.
fn source_error(source: SourceError) -> Error {
    match source.downcast::<multer::Error>() {
        Ok(parse_error) => multipart_error(*parse_error),
        Err(other) => Error::MalformedUpload {
            detail: other.to_string(),
        },
    }
}

pub(crate) fn multipart_error(err: multer::Error) -> Error {
    match err {
        multer::Error::FieldSizeExceeded { limit, .. } | multer::Error::StreamSizeExceeded { limit } => {
            Error::PayloadTooLarge { limit }
        }
        other => Error::MalformedUpload {
            detail: other.to_string(),
        },
    }
}
