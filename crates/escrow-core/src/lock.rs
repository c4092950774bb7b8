//! CAS + TTL locks on object storage.
//!
//! A lock is a small JSON object. Acquisition is a conditional write:
//!
//! 1. Write the lock object with `DoesNotExist`; exactly one writer wins.
//! 2. If the object exists and has expired, take it over with a
//!    `MatchesVersion` write bound to the version that was inspected.
//! 3. Release rewrites the object as already expired, again via CAS, so a
//!    holder that lost its lock to a takeover never clobbers the new holder.
//!
//! The TTL bounds how long a crashed holder can block others.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::error::{Error, Result};
use crate::storage::{StorageBackend, WritePrecondition, WriteResult, get_optional};

/// Default lock TTL (10 minutes).
pub const DEFAULT_LOCK_TTL: Duration = Duration::from_secs(600);

/// Lock file contents.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockInfo {
    /// Unique identifier of the holder.
    pub holder_id: String,

    /// When the lock expires.
    pub expires_at: DateTime<Utc>,

    /// When the lock was acquired.
    pub acquired_at: DateTime<Utc>,

    /// Incremented on every acquisition of this lock path.
    #[serde(default)]
    pub sequence_number: u64,

    /// Optional description of the operation.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub operation: Option<String>,
}

impl LockInfo {
    /// Creates a new lock info with the given holder ID, TTL, and sequence number.
    #[must_use]
    pub fn new(holder_id: impl Into<String>, ttl: Duration, sequence_number: u64) -> Self {
        let now = Utc::now();
        Self {
            holder_id: holder_id.into(),
            expires_at: now
                + chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::seconds(600)),
            acquired_at: now,
            sequence_number,
            operation: None,
        }
    }

    /// Returns whether this lock has expired.
    #[must_use]
    pub fn is_expired(&self) -> bool {
        Utc::now() >= self.expires_at
    }

    /// Returns the remaining TTL, or zero if expired.
    #[must_use]
    pub fn remaining_ttl(&self) -> Duration {
        let millis = (self.expires_at - Utc::now()).num_milliseconds();
        if millis <= 0 {
            Duration::ZERO
        } else {
            Duration::from_millis(u64::try_from(millis).unwrap_or(u64::MAX))
        }
    }

    fn to_bytes(&self) -> Result<Bytes> {
        serde_json::to_vec(self)
            .map(Bytes::from)
            .map_err(|e| Error::Serialization {
                message: format!("serialize lock: {e}"),
            })
    }

    fn expired_copy(&self) -> Self {
        Self {
            holder_id: self.holder_id.clone(),
            expires_at: Utc::now() - chrono::Duration::seconds(1),
            acquired_at: self.acquired_at,
            sequence_number: self.sequence_number,
            operation: None,
        }
    }
}

async fn read_lock<S: StorageBackend + ?Sized>(
    storage: &S,
    path: &str,
) -> Result<Option<LockInfo>> {
    let Some(data) = get_optional(storage, path).await? else {
        return Ok(None);
    };
    serde_json::from_slice(&data)
        .map(Some)
        .map_err(|e| Error::Serialization {
            message: format!("parse lock {path}: {e}"),
        })
}

/// A distributed lock backed by object storage.
pub struct DistributedLock<S: StorageBackend + ?Sized> {
    storage: Arc<S>,
    lock_path: String,
    holder_id: String,
}

impl<S: StorageBackend + ?Sized> Clone for DistributedLock<S> {
    fn clone(&self) -> Self {
        Self {
            storage: Arc::clone(&self.storage),
            lock_path: self.lock_path.clone(),
            holder_id: self.holder_id.clone(),
        }
    }
}

impl<S: StorageBackend + ?Sized> DistributedLock<S> {
    /// Creates a new distributed lock with a fresh holder ID.
    #[must_use]
    pub fn new(storage: Arc<S>, lock_path: impl Into<String>) -> Self {
        Self {
            storage,
            lock_path: lock_path.into(),
            holder_id: Ulid::new().to_string(),
        }
    }

    /// Returns the holder ID for this lock instance.
    #[must_use]
    pub fn holder_id(&self) -> &str {
        &self.holder_id
    }

    /// Returns the storage path of the lock object.
    #[must_use]
    pub fn path(&self) -> &str {
        &self.lock_path
    }

    /// Attempts to acquire the lock once, without waiting.
    ///
    /// Returns `Ok(None)` when another holder owns an unexpired lock or wins a
    /// concurrent takeover race.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock object cannot be read or written.
    pub async fn try_acquire(
        &self,
        ttl: Duration,
        operation: Option<String>,
    ) -> Result<Option<LockGuard<S>>> {
        let mut info = LockInfo::new(&self.holder_id, ttl, 1);
        info.operation.clone_from(&operation);

        if let WriteResult::Success { version } = self
            .storage
            .put(&self.lock_path, info.to_bytes()?, WritePrecondition::DoesNotExist)
            .await?
        {
            return Ok(Some(self.guard(version, 1)));
        }

        // Read the version first so the expiry decision is bound to the same
        // version the takeover CAS uses.
        let Some(meta) = self.storage.head(&self.lock_path).await? else {
            return Ok(None);
        };
        let Some(existing) = read_lock(self.storage.as_ref(), &self.lock_path).await? else {
            return Ok(None);
        };

        if !existing.is_expired() {
            tracing::debug!(
                path = %self.lock_path,
                holder = %existing.holder_id,
                remaining = ?existing.remaining_ttl(),
                "lock held"
            );
            return Ok(None);
        }

        let sequence = existing.sequence_number.saturating_add(1);
        let mut takeover = LockInfo::new(&self.holder_id, ttl, sequence);
        takeover.operation = operation;

        match self
            .storage
            .put(
                &self.lock_path,
                takeover.to_bytes()?,
                WritePrecondition::MatchesVersion(meta.version),
            )
            .await?
        {
            WriteResult::Success { version } => {
                tracing::info!(
                    path = %self.lock_path,
                    previous_holder = %existing.holder_id,
                    sequence,
                    "took over expired lock"
                );
                Ok(Some(self.guard(version, sequence)))
            }
            WriteResult::PreconditionFailed { .. } => Ok(None),
        }
    }

    /// Checks if the lock is currently held (regardless of holder).
    ///
    /// # Errors
    ///
    /// Returns an error if the lock state could not be read.
    pub async fn is_locked(&self) -> Result<bool> {
        Ok(read_lock(self.storage.as_ref(), &self.lock_path)
            .await?
            .is_some_and(|info| !info.is_expired()))
    }

    /// Reads the current lock info without acquiring the lock.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock state could not be read.
    pub async fn read_lock_info(&self) -> Result<Option<LockInfo>> {
        read_lock(self.storage.as_ref(), &self.lock_path).await
    }

    fn guard(&self, version: String, sequence: u64) -> LockGuard<S> {
        LockGuard {
            storage: Arc::clone(&self.storage),
            lock_path: self.lock_path.clone(),
            holder_id: self.holder_id.clone(),
            version,
            sequence,
            released: false,
        }
    }
}

/// RAII guard for a held lock.
///
/// Dropping an unreleased guard schedules a best-effort release on the
/// current Tokio runtime; the TTL covers the case where none is available.
pub struct LockGuard<S: StorageBackend + ?Sized> {
    storage: Arc<S>,
    lock_path: String,
    holder_id: String,
    version: String,
    sequence: u64,
    released: bool,
}

impl<S: StorageBackend + ?Sized> LockGuard<S> {
    /// Returns the holder ID for this lock.
    #[must_use]
    pub fn holder_id(&self) -> &str {
        &self.holder_id
    }

    /// Returns the acquisition sequence number of this lock path.
    #[must_use]
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    /// Explicitly releases the lock.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock object could not be read or rewritten.
    pub async fn release(mut self) -> Result<()> {
        self.do_release().await
    }

    async fn do_release(&mut self) -> Result<()> {
        if self.released {
            return Ok(());
        }

        if let Some(info) = read_lock(self.storage.as_ref(), &self.lock_path).await? {
            if info.holder_id == self.holder_id {
                // Leave the expired record in place: deleting would race with a
                // new holder acquiring between our CAS and the delete.
                let _ = self
                    .storage
                    .put(
                        &self.lock_path,
                        info.expired_copy().to_bytes()?,
                        WritePrecondition::MatchesVersion(self.version.clone()),
                    )
                    .await?;
            }
        }

        self.released = true;
        Ok(())
    }
}

impl<S: StorageBackend + ?Sized> Drop for LockGuard<S> {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            return;
        };

        let storage = Arc::clone(&self.storage);
        let path = self.lock_path.clone();
        let holder = self.holder_id.clone();
        let version = self.version.clone();

        handle.spawn(async move {
            let Ok(Some(info)) = read_lock(storage.as_ref(), &path).await else {
                return;
            };
            if info.holder_id != holder {
                return;
            }
            if let Ok(bytes) = info.expired_copy().to_bytes() {
                let _ = storage
                    .put(&path, bytes, WritePrecondition::MatchesVersion(version))
                    .await;
            }
        });
    }
}
