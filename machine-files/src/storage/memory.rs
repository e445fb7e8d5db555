//! In-memory blob store.
//!
//! Records are built completely before a single map insert, so readers always see a whole
//! record. Nothing survives a restart; use it for tests and throwaway deployments.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use chrono::Utc;
use dashmap::DashMap;
use futures::StreamExt;

use super::{BlobSource, BlobStore, FileMetadata, NewFile, Result, SizeGuard, StorageError, StoredFile};
use crate::machine_id::MachineId;

struct MemoryRecord {
    metadata: FileMetadata,
    payload: Bytes,
}

/// Blob store that keeps every payload in process memory.
pub struct InMemoryBlobStore {
    max_blob_size: u64,
    records: DashMap<MachineId, Arc<MemoryRecord>>,
}

impl InMemoryBlobStore {
    pub fn new(max_blob_size: u64) -> Self {
        Self {
            max_blob_size,
            records: DashMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[async_trait]
impl BlobStore for InMemoryBlobStore {
    async fn put(&self, id: &MachineId, file: NewFile, mut data: BlobSource) -> Result<FileMetadata> {
        let mut size = SizeGuard::new(self.max_blob_size, file.declared_size)?;

        let mut buffer = BytesMut::new();
        while let Some(chunk) = data.next().await {
            let chunk = chunk.map_err(StorageError::Source)?;
            size.admit(&chunk)?;
            buffer.extend_from_slice(&chunk);
        }

        let metadata = FileMetadata {
            machine_id: id.clone(),
            original_name: file.original_name,
            content_type: file.content_type,
            size_bytes: size.total(),
            uploaded_at: Utc::now(),
        };
        let record = Arc::new(MemoryRecord {
            metadata: metadata.clone(),
            payload: buffer.freeze(),
        });
        self.records.insert(id.clone(), record);

        Ok(metadata)
    }

    async fn get(&self, id: &MachineId) -> Result<StoredFile> {
        let record = self.records.get(id).map(|entry| entry.value().clone()).ok_or(StorageError::NotFound)?;
        Ok(StoredFile {
            metadata: record.metadata.clone(),
            payload: Box::pin(std::io::Cursor::new(record.payload.clone())),
        })
    }

    async fn head(&self, id: &MachineId) -> Result<FileMetadata> {
        self.records
            .get(id)
            .map(|entry| entry.value().metadata.clone())
            .ok_or(StorageError::NotFound)
    }

    async fn delete(&self, id: &MachineId) -> Result<bool> {
        Ok(self.records.remove(id).is_some())
    }

    async fn list(&self) -> Result<Vec<FileMetadata>> {
        Ok(self.records.iter().map(|entry| entry.value().metadata.clone()).collect())
    }
}
