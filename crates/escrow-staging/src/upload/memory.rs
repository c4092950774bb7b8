//! In-memory upload queue.
//!
//! Deduplication keys are remembered for the lifetime of the queue, so a
//! request relayed twice is enqueued once.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{PoisonError, RwLock};

use async_trait::async_trait;
use ulid::Ulid;

use super::{EnqueueResult, UploadQueue, UploadRequest};
use crate::error::{Error, Result};

/// Entry in the in-memory queue.
#[derive(Debug, Clone)]
pub struct QueueEntry {
    /// Message ID.
    pub message_id: String,
    /// Idempotency key.
    pub idempotency_key: String,
    /// The request.
    pub request: UploadRequest,
}

#[derive(Debug, Default)]
struct QueueState {
    queue: VecDeque<QueueEntry>,
    seen_keys: HashMap<String, String>,
}

/// In-memory upload queue for tests and embedding.
#[derive(Debug, Default)]
pub struct InMemoryUploadQueue {
    state: RwLock<QueueState>,
    fail_next: AtomicU32,
}

fn poison_err<T>(_: PoisonError<T>) -> Error {
    Error::storage("upload queue lock poisoned")
}

impl InMemoryUploadQueue {
    /// Creates an empty queue.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next `count` enqueues fail with `Error::Enqueue`.
    pub fn fail_next(&self, count: u32) {
        self.fail_next.store(count, Ordering::SeqCst);
    }

    /// Returns all enqueued entries in order.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn entries(&self) -> Result<Vec<QueueEntry>> {
        let state = self.state.read().map_err(poison_err)?;
        Ok(state.queue.iter().cloned().collect())
    }

    /// Number of queued entries.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn len(&self) -> Result<usize> {
        let state = self.state.read().map_err(poison_err)?;
        Ok(state.queue.len())
    }

    /// Returns true if nothing is queued.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    fn take_failure(&self) -> bool {
        self.fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl UploadQueue for InMemoryUploadQueue {
    async fn enqueue(&self, request: UploadRequest) -> Result<EnqueueResult> {
        if self.take_failure() {
            return Err(Error::Enqueue {
                message: "injected enqueue failure".into(),
            });
        }

        let idempotency_key = request.idempotency_key();
        let mut state = self.state.write().map_err(poison_err)?;

        if let Some(existing) = state.seen_keys.get(&idempotency_key) {
            return Ok(EnqueueResult::Deduplicated {
                existing_message_id: existing.clone(),
            });
        }

        let message_id = Ulid::new().to_string();
        state
            .seen_keys
            .insert(idempotency_key.clone(), message_id.clone());
        state.queue.push_back(QueueEntry {
            message_id: message_id.clone(),
            idempotency_key,
            request,
        });
        drop(state);

        tracing::debug!(%message_id, "enqueued upload task");
        Ok(EnqueueResult::Enqueued { message_id })
    }
}
