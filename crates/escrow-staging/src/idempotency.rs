//! Per-deposit lock preventing concurrent reduces of the same deposit.
//!
//! Built on the storage CAS lock, so it is shared by every process using the
//! same artifact storage. The TTL bounds how long a crashed reducer blocks
//! the deposit.

use std::sync::Arc;
use std::time::Duration;

use escrow_core::{DistributedLock, LockGuard, StorageBackend};

use crate::deposit::DepositKey;
use crate::error::Result;

/// Storage prefix of deposit locks.
pub const DEPOSIT_LOCK_PREFIX: &str = "locks/deposits/";

/// Returns the lock path of a deposit.
#[must_use]
pub fn lock_path(key: &DepositKey) -> String {
    format!("{DEPOSIT_LOCK_PREFIX}{}.lock.json", key.slug())
}

/// A held deposit lock.
pub type DepositLockGuard = LockGuard<dyn StorageBackend>;

/// Acquires and releases deposit locks.
#[derive(Clone)]
pub struct DepositLock {
    storage: Arc<dyn StorageBackend>,
    ttl: Duration,
}

impl std::fmt::Debug for DepositLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DepositLock")
            .field("ttl", &self.ttl)
            .finish_non_exhaustive()
    }
}

impl DepositLock {
    /// Creates locks on `storage` that expire after `ttl`.
    #[must_use]
    pub fn new(storage: Arc<dyn StorageBackend>, ttl: Duration) -> Self {
        Self { storage, ttl }
    }

    /// Tries to acquire the lock for `key` without waiting.
    ///
    /// Returns `None` if another holder owns it.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock object could not be read or written.
    pub async fn acquire(&self, key: &DepositKey) -> Result<Option<DepositLockGuard>> {
        let lock = DistributedLock::new(Arc::clone(&self.storage), lock_path(key));
        Ok(lock
            .try_acquire(self.ttl, Some(format!("reduce {key}")))
            .await?)
    }
}
