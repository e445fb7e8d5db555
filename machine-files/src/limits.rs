//! Upload admission control.
//!
//! Uploads hold a disk temp file (or a memory buffer) for their whole lifetime, so the number
//! in flight is bounded system-wide. Requests beyond the bound queue for a slot, up to a
//! configured queue length and wait time, and are then turned away with HTTP 429.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::config::{FileLimitsConfig, LimitsConfig};
use crate::errors::{Error, Result};

const QUEUE_FULL: &str = "Too many file uploads in progress. Please retry later.";
const WAIT_EXPIRED: &str = "Timed out waiting for upload slot. Please retry later.";

/// Container for all resource limiters.
#[derive(Debug, Default, Clone)]
pub struct Limiters {
    /// Limiter for concurrent file uploads. None means unlimited.
    pub file_uploads: Option<Arc<UploadLimiter>>,
}

impl Limiters {
    pub fn new(config: &LimitsConfig) -> Self {
        Self {
            file_uploads: UploadLimiter::new(&config.files).map(Arc::new),
        }
    }

    /// Take an upload slot if uploads are limited. `None` means no limit is configured.
    pub async fn admit_upload(&self) -> Result<Option<UploadPermit>> {
        match &self.file_uploads {
            Some(limiter) => limiter.acquire().await.map(Some),
            None => Ok(None),
        }
    }
}

/// Bounded-concurrency gate for uploads with a bounded waiting queue.
#[derive(Debug)]
pub struct UploadLimiter {
    semaphore: Arc<Semaphore>,
    waiting: AtomicUsize,
    /// `None` lets any number of requests queue
    max_waiting: Option<usize>,
    max_wait: Duration,
}

impl UploadLimiter {
    /// Returns `None` when `max_concurrent_uploads` is 0 (unlimited).
    ///
    /// A `max_waiting_uploads` of 0 means the waiting queue is unbounded.
    pub fn new(config: &FileLimitsConfig) -> Option<Self> {
        if config.max_concurrent_uploads == 0 {
            return None;
        }

        Some(Self {
            semaphore: Arc::new(Semaphore::new(config.max_concurrent_uploads)),
            waiting: AtomicUsize::new(0),
            max_waiting: (config.max_waiting_uploads > 0).then_some(config.max_waiting_uploads),
            max_wait: config.max_upload_wait,
        })
    }

    /// Number of requests currently queued for a slot.
    pub fn waiting(&self) -> usize {
        self.waiting.load(Ordering::SeqCst)
    }

    /// Wait for an upload slot.
    ///
    /// Fails with [`Error::TooManyUploads`] when the queue is already full, or when no slot frees
    /// up within `max_upload_wait`.
    pub async fn acquire(&self) -> Result<UploadPermit> {
        if let Ok(permit) = self.semaphore.clone().try_acquire_owned() {
            return Ok(UploadPermit { _permit: permit });
        }

        let _queued = self.join_queue()?;

        // A slot may have been released while we were joining the queue
        if let Ok(permit) = self.semaphore.clone().try_acquire_owned() {
            return Ok(UploadPermit { _permit: permit });
        }

        if self.max_wait.is_zero() {
            return Err(too_many(QUEUE_FULL));
        }

        match tokio::time::timeout(self.max_wait, self.semaphore.clone().acquire_owned()).await {
            Ok(Ok(permit)) => Ok(UploadPermit { _permit: permit }),
            Ok(Err(_closed)) => Err(too_many("Upload service temporarily unavailable.")),
            Err(_elapsed) => {
                tracing::debug!(max_wait = ?self.max_wait, "Upload gave up waiting for a slot");
                Err(too_many(WAIT_EXPIRED))
            }
        }
    }

    fn join_queue(&self) -> Result<QueuedRequest<'_>> {
        let ahead = self.waiting.fetch_add(1, Ordering::SeqCst);
        let queued = QueuedRequest { counter: &self.waiting };
        if let Some(max_waiting) = self.max_waiting
            && ahead >= max_waiting
        {
            tracing::debug!(max_waiting, "Upload queue full");
            return Err(too_many(QUEUE_FULL));
        }
        Ok(queued)
    }
}

/// Counts a request as waiting until it is dropped, including when the request future is.
struct QueuedRequest<'a> {
    counter: &'a AtomicUsize,
}

impl Drop for QueuedRequest<'_> {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Held for the duration of one upload; the slot is released on drop.
#[must_use]
pub struct UploadPermit {
    _permit: OwnedSemaphorePermit,
}

fn too_many(message: &str) -> Error {
    Error::TooManyUploads {
        message: message.to_string(),
    }
}
