//! Local filesystem blob store.
//!
//! Layout under the configured root:
//!
//! ```text
//! records/<sha256(machine_id)>.json   metadata + name of the current blob
//! blobs/<uuid>.dat                    immutable payloads
//! tmp/<uuid>.part                     uploads and records being staged
//! ```
//!
//! Keys are hashed rather than used verbatim so that differently-cased identifiers stay distinct
//! on case-insensitive filesystems and no identifier can ever address a path outside `records/`.
//!
//! A `put` streams the payload into `tmp/` and fsyncs it, then stages the new record in `tmp/` as
//! well. The commit runs as a detached task so that a dropped request cannot stop it halfway: it
//! renames the payload into `blobs/` under a fresh name, renames the record over the old one while
//! the key's write lock is held, and unlinks the previous blob afterwards. A request dropped before
//! the commit starts leaves only staging files, which the drop guards (or the next `open`) remove.
//! Readers take the key's read lock
//! only long enough to resolve the record and open its blob, so an open handle keeps serving the
//! old payload even if a replace lands mid-download.

use std::collections::HashSet;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use futures::StreamExt;
use scopeguard::ScopeGuard;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::RwLock;
use uuid::Uuid;

use super::{BlobSource, BlobStore, FileMetadata, NewFile, Result, SizeGuard, StorageError, StoredFile};
use crate::machine_id::MachineId;

const RECORDS_DIR: &str = "records";
const BLOBS_DIR: &str = "blobs";
const TMP_DIR: &str = "tmp";

/// On-disk record: the public metadata plus the blob it points at.
#[derive(Debug, Serialize, Deserialize)]
struct Record {
    #[serde(flatten)]
    metadata: FileMetadata,
    blob: String,
}

/// Blob store backed by a directory on the local filesystem.
pub struct LocalBlobStore {
    root: PathBuf,
    max_blob_size: u64,
    /// Per-key commit locks, one entry per identifier with a stored record. `delete` prunes an
    /// entry only when no other task holds a clone of its lock.
    locks: DashMap<MachineId, Arc<RwLock<()>>>,
}

impl LocalBlobStore {
    /// Open (or create) a store rooted at `root`, clearing anything an interrupted upload left
    /// behind.
    pub async fn open(root: PathBuf, max_blob_size: u64) -> Result<Self> {
        for dir in [RECORDS_DIR, BLOBS_DIR, TMP_DIR] {
            fs::create_dir_all(root.join(dir)).await?;
        }

        let store = Self {
            root,
            max_blob_size,
            locks: DashMap::new(),
        };
        store.sweep_leftovers().await?;
        Ok(store)
    }

    async fn sweep_leftovers(&self) -> Result<()> {
        let mut removed = 0usize;

        let mut staged = fs::read_dir(self.root.join(TMP_DIR)).await?;
        while let Some(entry) = staged.next_entry().await? {
            if remove_if_exists(&entry.path()).await? {
                removed += 1;
            }
        }

        let referenced: HashSet<String> = self.read_records().await?.into_iter().map(|record| record.blob).collect();
        let mut blobs = fs::read_dir(self.root.join(BLOBS_DIR)).await?;
        while let Some(entry) = blobs.next_entry().await? {
            let name = entry.file_name().to_string_lossy().into_owned();
            if !referenced.contains(&name) && remove_if_exists(&entry.path()).await? {
                removed += 1;
            }
        }

        if removed > 0 {
            tracing::info!(root = %self.root.display(), removed, "Removed leftovers from interrupted uploads");
        }
        Ok(())
    }

    fn record_path(&self, id: &MachineId) -> PathBuf {
        self.root.join(RECORDS_DIR).join(format!("{}.json", storage_key(id)))
    }

    fn blob_path(&self, blob: &str) -> PathBuf {
        self.root.join(BLOBS_DIR).join(blob)
    }

    fn staging_path(&self) -> PathBuf {
        self.root.join(TMP_DIR).join(format!("{}.part", Uuid::new_v4()))
    }

    fn lock_for(&self, id: &MachineId) -> Arc<RwLock<()>> {
        self.locks.entry(id.clone()).or_default().clone()
    }

    async fn read_record(&self, id: &MachineId) -> Result<Option<Record>> {
        read_record_file(&self.record_path(id)).await
    }

    /// All decodable records. Corrupt ones are logged and skipped.
    async fn read_records(&self) -> Result<Vec<Record>> {
        let mut records = Vec::new();
        let mut entries = fs::read_dir(self.root.join(RECORDS_DIR)).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some("json") {
                continue;
            }
            match read_record_file(&path).await {
                Ok(Some(record)) => records.push(record),
                // Deleted between read_dir and read
                Ok(None) => {}
                Err(StorageError::Corrupt(detail)) => {
                    tracing::warn!(path = %path.display(), detail, "Skipping corrupt record");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(records)
    }
}

#[async_trait]
impl BlobStore for LocalBlobStore {
    async fn put(&self, id: &MachineId, file: NewFile, mut data: BlobSource) -> Result<FileMetadata> {
        let mut size = SizeGuard::new(self.max_blob_size, file.declared_size)?;

        // Every staged path is removed on early return or when this future is dropped
        let staged_blob = scopeguard::guard(self.staging_path(), |path| discard(&path));
        let mut out = fs::File::create(&*staged_blob).await?;
        while let Some(chunk) = data.next().await {
            let chunk = chunk.map_err(StorageError::Source)?;
            size.admit(&chunk)?;
            out.write_all(&chunk).await?;
        }
        out.flush().await?;
        out.sync_all().await?;
        drop(out);

        let blob = format!("{}.dat", Uuid::new_v4());
        let metadata = FileMetadata {
            machine_id: id.clone(),
            original_name: file.original_name,
            content_type: file.content_type,
            size_bytes: size.total(),
            uploaded_at: Utc::now(),
        };
        let record = Record {
            metadata: metadata.clone(),
            blob,
        };
        let encoded = serde_json::to_vec(&record).map_err(|e| StorageError::Corrupt(e.to_string()))?;

        let staged_record = scopeguard::guard(self.staging_path(), |path| discard(&path));
        write_synced(&staged_record, &encoded).await?;

        // From here on the commit runs to completion even if this future is dropped
        let commit = Commit {
            id: id.clone(),
            lock: self.lock_for(id),
            staged_blob: ScopeGuard::into_inner(staged_blob),
            blob_path: self.blob_path(&record.blob),
            staged_record: ScopeGuard::into_inner(staged_record),
            record_path: self.record_path(id),
            blobs_dir: self.root.join(BLOBS_DIR),
        };
        tokio::spawn(commit.run()).await.map_err(io::Error::other)??;

        tracing::debug!(
            machine_id = %id,
            blob = %record.blob,
            size_bytes = metadata.size_bytes,
            "Committed blob"
        );
        Ok(metadata)
    }

    async fn get(&self, id: &MachineId) -> Result<StoredFile> {
        // Checked before taking a lock so lookups of unknown ids don't grow the lock map
        if !fs::try_exists(self.record_path(id)).await? {
            return Err(StorageError::NotFound);
        }

        let lock = self.lock_for(id);
        let _read = lock.read().await;

        let record = self.read_record(id).await?.ok_or(StorageError::NotFound)?;
        let payload = match fs::File::open(self.blob_path(&record.blob)).await {
            Ok(payload) => payload,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(StorageError::Corrupt(format!(
                    "record for {id} references missing blob {}",
                    record.blob
                )));
            }
            Err(e) => return Err(e.into()),
        };

        let on_disk = payload.metadata().await?.len();
        if on_disk != record.metadata.size_bytes {
            return Err(StorageError::Corrupt(format!(
                "blob {} is {on_disk} bytes, record says {}",
                record.blob, record.metadata.size_bytes
            )));
        }

        Ok(StoredFile {
            metadata: record.metadata,
            payload: Box::pin(payload),
        })
    }

    async fn head(&self, id: &MachineId) -> Result<FileMetadata> {
        self.read_record(id)
            .await?
            .map(|record| record.metadata)
            .ok_or(StorageError::NotFound)
    }

    async fn delete(&self, id: &MachineId) -> Result<bool> {
        let record_path = self.record_path(id);
        if !fs::try_exists(&record_path).await? {
            return Ok(false);
        }

        let lock = self.lock_for(id);
        let blob = {
            let _commit = lock.write().await;
            let blob = match self.read_record(id).await {
                Ok(Some(record)) => Some(record.blob),
                Ok(None) => return Ok(false),
                Err(StorageError::Corrupt(detail)) => {
                    tracing::warn!(machine_id = %id, detail, "Deleting corrupt record");
                    None
                }
                Err(e) => return Err(e),
            };
            if !remove_if_exists(&record_path).await? {
                return Ok(false);
            }
            blob
        };

        drop(lock);
        self.locks.remove_if(id, |_, lock| Arc::strong_count(lock) == 1);

        if let Some(blob) = blob {
            remove_if_exists(&self.blob_path(&blob)).await?;
        }
        tracing::debug!(machine_id = %id, "Deleted record");
        Ok(true)
    }

    async fn list(&self) -> Result<Vec<FileMetadata>> {
        Ok(self.read_records().await?.into_iter().map(|record| record.metadata).collect())
    }
}

/// The commit half of a `put`, run as its own task once the payload and record are staged:
/// publish the blob, swap the record under the key's write lock, then unlink the replaced blob.
struct Commit {
    id: MachineId,
    lock: Arc<RwLock<()>>,
    staged_blob: PathBuf,
    blob_path: PathBuf,
    staged_record: PathBuf,
    record_path: PathBuf,
    blobs_dir: PathBuf,
}

impl Commit {
    async fn run(self) -> Result<()> {
        if let Err(e) = fs::rename(&self.staged_blob, &self.blob_path).await {
            discard(&self.staged_blob);
            discard(&self.staged_record);
            return Err(e.into());
        }

        let previous = {
            let _commit = self.lock.write().await;
            let previous = match read_record_file(&self.record_path).await {
                Ok(previous) => previous,
                Err(e) => {
                    tracing::warn!(machine_id = %self.id, error = %e, "Previous record unreadable, replacing it");
                    None
                }
            };
            if let Err(e) = fs::rename(&self.staged_record, &self.record_path).await {
                discard(&self.staged_record);
                discard(&self.blob_path);
                return Err(e.into());
            }
            previous
        };

        if let Some(previous) = previous
            && let Err(e) = remove_if_exists(&self.blobs_dir.join(&previous.blob)).await
        {
            tracing::warn!(machine_id = %self.id, blob = %previous.blob, error = %e, "Failed to remove replaced blob");
        }
        Ok(())
    }
}

/// Hex SHA-256 of the identifier, used as the record file stem.
fn storage_key(id: &MachineId) -> String {
    Sha256::digest(id.as_str().as_bytes())
        .iter()
        .map(|byte| format!("{byte:02x}"))
        .collect()
}

async fn read_record_file(path: &Path) -> Result<Option<Record>> {
    let bytes = match fs::read(path).await {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    serde_json::from_slice(&bytes)
        .map(Some)
        .map_err(|e| StorageError::Corrupt(format!("{}: {e}", path.display())))
}

async fn write_synced(path: &Path, bytes: &[u8]) -> io::Result<()> {
    let mut file = fs::File::create(path).await?;
    file.write_all(bytes).await?;
    file.flush().await?;
    file.sync_all().await
}

async fn remove_if_exists(path: &Path) -> io::Result<bool> {
    match fs::remove_file(path).await {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e),
    }
}

/// Best-effort synchronous removal, used from drop guards where we cannot await.
fn discard(path: &Path) {
    if let Err(e) = std::fs::remove_file(path)
        && e.kind() != io::ErrorKind::NotFound
    {
        tracing::warn!(path = %path.display(), error = %e, "Failed to discard staged file");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::test_support::*;
    use bytes::Bytes;
    use std::time::Duration;

    async fn open_store(dir: &Path, limit: u64) -> LocalBlobStore {
        LocalBlobStore::open(dir.to_path_buf(), limit).await.unwrap()
    }

    async fn count_entries(dir: PathBuf) -> usize {
        let mut entries = fs::read_dir(dir).await.unwrap();
        let mut count = 0;
        while entries.next_entry().await.unwrap().is_some() {
            count += 1;
        }
        count
    }

    #[tokio::test]
    async fn test_local_store_contract() {
        let temp_dir = tempfile::tempdir().unwrap();
        let store = open_store(temp_dir.path(), 1024).await;
        exercise_contract(&store).await;

        // Only the one remaining record and its blob are left on disk
        assert_eq!(count_entries(temp_dir.path().join(RECORDS_DIR)).await, 1);
        assert_eq!(count_entries(temp_dir.path().join(BLOBS_DIR)).await, 1);
        assert_eq!(count_entries(temp_dir.path().join(TMP_DIR)).await, 0);
    }

    #[tokio::test]
    async fn test_local_store_failed_puts_keep_previous() {
        let temp_dir = tempfile::tempdir().unwrap();
        let store = open_store(temp_dir.path(), 64).await;
        exercise_failed_puts(&store, 64).await;

        assert_eq!(count_entries(temp_dir.path().join(TMP_DIR)).await, 0);
        assert_eq!(count_entries(temp_dir.path().join(BLOBS_DIR)).await, 1);
    }

    #[tokio::test]
    async fn test_record_files_are_hashed_keys() {
        let temp_dir = tempfile::tempdir().unwrap();
        let store = open_store(temp_dir.path(), 1024).await;
        let m = id("Machine-7");
        store.put(&m, new_file("a.bin"), source_from_bytes(b"a".to_vec())).await.unwrap();

        let expected = temp_dir.path().join(RECORDS_DIR).join(format!("{}.json", storage_key(&m)));
        assert!(expected.is_file());
        assert_eq!(storage_key(&m).len(), 64);
        assert_ne!(storage_key(&m), storage_key(&id("machine-7")));
    }

    #[tokio::test]
    async fn test_records_survive_reopen() {
        let temp_dir = tempfile::tempdir().unwrap();
        let m = id("m-persist");
        {
            let store = open_store(temp_dir.path(), 1024).await;
            store
                .put(&m, new_file("persist.txt"), source_from_bytes(b"still here".to_vec()))
                .await
                .unwrap();
        }

        let store = open_store(temp_dir.path(), 1024).await;
        let file = store.get(&m).await.unwrap();
        assert_eq!(file.metadata.original_name, "persist.txt");
        assert_eq!(read_all(file).await, b"still here");
    }

    #[tokio::test]
    async fn test_open_removes_leftovers() {
        let temp_dir = tempfile::tempdir().unwrap();
        let m = id("m-live");
        {
            let store = open_store(temp_dir.path(), 1024).await;
            store.put(&m, new_file("live.bin"), source_from_bytes(b"live".to_vec())).await.unwrap();
        }
        std::fs::write(temp_dir.path().join(TMP_DIR).join("crashed.part"), b"half").unwrap();
        std::fs::write(temp_dir.path().join(BLOBS_DIR).join("orphan.dat"), b"orphan").unwrap();

        let store = open_store(temp_dir.path(), 1024).await;
        assert_eq!(count_entries(temp_dir.path().join(TMP_DIR)).await, 0);
        assert_eq!(count_entries(temp_dir.path().join(BLOBS_DIR)).await, 1);
        assert_eq!(read_all(store.get(&m).await.unwrap()).await, b"live");
    }

    #[tokio::test]
    async fn test_dropped_upload_leaves_previous_record() {
        let temp_dir = tempfile::tempdir().unwrap();
        let store = open_store(temp_dir.path(), 1024).await;
        let m = id("m-drop");
        store.put(&m, new_file("old.bin"), source_from_bytes(b"old".to_vec())).await.unwrap();

        // A client that sends one chunk and then stalls forever
        let first: Vec<std::result::Result<Bytes, crate::storage::SourceError>> = vec![Ok(Bytes::from_static(b"new-partial"))];
        let stalled = futures::stream::iter(first).chain(futures::stream::pending()).boxed();

        let result = tokio::time::timeout(Duration::from_millis(100), store.put(&m, new_file("new.bin"), stalled)).await;
        assert!(result.is_err(), "upload should still be pending");

        assert_eq!(count_entries(temp_dir.path().join(TMP_DIR)).await, 0);
        let file = store.get(&m).await.unwrap();
        assert_eq!(file.metadata.original_name, "old.bin");
        assert_eq!(read_all(file).await, b"old");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_aborted_put_never_leaves_dangling_record() {
        let temp_dir = tempfile::tempdir().unwrap();
        let store = Arc::new(open_store(temp_dir.path(), 1024).await);
        let m = id("m-cancel");
        store.put(&m, new_file("seed.bin"), source_from_bytes(vec![0; 64])).await.unwrap();

        for round in 0..200u64 {
            let task = {
                let store = store.clone();
                let m = m.clone();
                tokio::spawn(async move { store.put(&m, new_file("next.bin"), source_from_bytes(vec![1; 64])).await })
            };
            tokio::time::sleep(Duration::from_micros(50 + (round * 37) % 1500)).await;
            task.abort();
            let _ = task.await;

            match store.get(&m).await {
                Ok(file) => assert_eq!(read_all(file).await.len(), 64),
                Err(e) => panic!("round {round}: record unreadable after aborted upload: {e}"),
            }
        }

        // Let detached commits and file operations settle, then reopen to clear staging leftovers
        tokio::time::sleep(Duration::from_millis(200)).await;
        drop(store);
        let store = open_store(temp_dir.path(), 1024).await;
        assert_eq!(read_all(store.get(&m).await.unwrap()).await.len(), 64);
        assert_eq!(count_entries(temp_dir.path().join(RECORDS_DIR)).await, 1);
        assert_eq!(count_entries(temp_dir.path().join(BLOBS_DIR)).await, 1);
        assert_eq!(count_entries(temp_dir.path().join(TMP_DIR)).await, 0);
    }

    #[tokio::test]
    async fn test_delete_prunes_lock_entry() {
        let temp_dir = tempfile::tempdir().unwrap();
        let store = open_store(temp_dir.path(), 1024).await;
        let m = id("m-gone");
        store.put(&m, new_file("a.bin"), source_from_bytes(b"a".to_vec())).await.unwrap();
        assert!(store.locks.contains_key(&m));

        assert!(store.delete(&m).await.unwrap());
        assert!(!store.locks.contains_key(&m));

        // A lock still held elsewhere is kept
        store.put(&m, new_file("b.bin"), source_from_bytes(b"b".to_vec())).await.unwrap();
        let held = store.lock_for(&m);
        assert!(store.delete(&m).await.unwrap());
        assert!(store.locks.contains_key(&m));
        drop(held);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_puts_never_mix() {
        let temp_dir = tempfile::tempdir().unwrap();
        let store = Arc::new(open_store(temp_dir.path(), 1024 * 1024).await);
        let m = id("m-race");
        let len = 256 * 1024;

        let mut handles = Vec::new();
        for round in 0..8 {
            let byte = if round % 2 == 0 { b'a' } else { b'b' };
            let store = store.clone();
            let m = m.clone();
            handles.push(tokio::spawn(async move {
                let chunks: Vec<std::result::Result<Bytes, crate::storage::SourceError>> =
                    (0..16).map(|_| Ok(Bytes::from(vec![byte; len / 16]))).collect();
                store
                    .put(&m, new_file(&format!("{}.bin", byte as char)), futures::stream::iter(chunks).boxed())
                    .await
                    .unwrap();
            }));
        }
        for _ in 0..8 {
            let store = store.clone();
            let m = m.clone();
            handles.push(tokio::spawn(async move {
                match store.get(&m).await {
                    Ok(file) => {
                        let name = file.metadata.original_name.clone();
                        let body = read_all(file).await;
                        assert_eq!(body.len(), len);
                        let first = body[0];
                        assert!(body.iter().all(|b| *b == first), "payload mixed two uploads");
                        assert_eq!(name, format!("{}.bin", first as char));
                    }
                    Err(StorageError::NotFound) => {}
                    Err(e) => panic!("read failed during race: {e}"),
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        let file = store.get(&m).await.unwrap();
        let body = read_all(file).await;
        assert_eq!(body.len(), len);
        assert!(body.iter().all(|b| *b == body[0]));
        assert_eq!(count_entries(temp_dir.path().join(BLOBS_DIR)).await, 1);
    }

    #[tokio::test]
    async fn test_corrupt_record_reported_and_deletable() {
        let temp_dir = tempfile::tempdir().unwrap();
        let store = open_store(temp_dir.path(), 1024).await;
        let m = id("m-corrupt");
        std::fs::write(store.record_path(&m), b"{not json").unwrap();

        assert!(matches!(store.get(&m).await, Err(StorageError::Corrupt(_))));
        assert!(store.list().await.unwrap().is_empty());
        assert!(store.delete(&m).await.unwrap());
        assert!(matches!(store.get(&m).await, Err(StorageError::NotFound)));
    }

    #[tokio::test]
    async fn test_missing_blob_is_corrupt_not_not_found() {
        let temp_dir = tempfile::tempdir().unwrap();
        let store = open_store(temp_dir.path(), 1024).await;
        let m = id("m-missing-blob");
        store.put(&m, new_file("x.bin"), source_from_bytes(b"x".to_vec())).await.unwrap();

        let record = store.read_record(&m).await.unwrap().unwrap();
        std::fs::remove_file(store.blob_path(&record.blob)).unwrap();

        assert!(matches!(store.get(&m).await, Err(StorageError::Corrupt(_))));
    }
}
