//! Intermediate storage between the map and reduce phases.
//!
//! Each map task writes one object per deposit key it produced snapshots for,
//! at `shuffle/{job_id}/{deposit_slug}/{shard}.json`. The path depends only on
//! the job, the deposit and the shard, so a retried map task overwrites its
//! own earlier output instead of duplicating it.

use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use escrow_core::{JobId, StorageBackend, WritePrecondition};

use crate::deposit::DepositKey;
use crate::error::{Error, Result};
use crate::resource::{ResourceSnapshot, ShardId};

/// Storage prefix of all shuffle output.
pub const SHUFFLE_PREFIX: &str = "shuffle/";

/// Unit of map work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum MapShard {
    /// Pseudo-shard emitting every registrar; runs once per job.
    Registrars,
    /// One shard of the resource index.
    Index(ShardId),
}

impl fmt::Display for MapShard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Registrars => f.write_str("registrars"),
            Self::Index(shard) => shard.fmt(f),
        }
    }
}

#[derive(Serialize, Deserialize)]
struct ShuffleObject {
    shard: String,
    snapshots: Vec<ResourceSnapshot>,
}

/// Reads and writes map output.
#[derive(Clone)]
pub struct ShuffleStore {
    storage: Arc<dyn StorageBackend>,
}

impl fmt::Debug for ShuffleStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ShuffleStore").finish_non_exhaustive()
    }
}

impl ShuffleStore {
    /// Creates a shuffle store on `storage`.
    #[must_use]
    pub fn new(storage: Arc<dyn StorageBackend>) -> Self {
        Self { storage }
    }

    fn key_prefix(job_id: JobId, key: &DepositKey) -> String {
        format!("{SHUFFLE_PREFIX}{job_id}/{}/", key.slug())
    }

    /// Writes the snapshots `shard` produced for `key`, replacing any earlier
    /// output of the same shard.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization or the write fails.
    pub async fn put(
        &self,
        job_id: JobId,
        key: &DepositKey,
        shard: MapShard,
        snapshots: Vec<ResourceSnapshot>,
    ) -> Result<()> {
        let path = format!("{}{shard}.json", Self::key_prefix(job_id, key));
        let object = ShuffleObject {
            shard: shard.to_string(),
            snapshots,
        };
        let bytes = serde_json::to_vec(&object)
            .map_err(|e| Error::serialization(format!("failed to serialize shuffle output: {e}")))?;
        self.storage
            .put(&path, Bytes::from(bytes), WritePrecondition::None)
            .await?;
        Ok(())
    }

    /// Reads every snapshot emitted for `key` in `job_id`, ordered by shard.
    ///
    /// # Errors
    ///
    /// Returns an error if listing, reading or decoding fails.
    pub async fn collect(&self, job_id: JobId, key: &DepositKey) -> Result<Vec<ResourceSnapshot>> {
        let mut metas = self.storage.list(&Self::key_prefix(job_id, key)).await?;
        metas.sort_by(|a, b| a.path.cmp(&b.path));

        let mut snapshots = Vec::new();
        for meta in metas {
            let bytes = self.storage.get(&meta.path).await?;
            let object: ShuffleObject = serde_json::from_slice(&bytes).map_err(|e| {
                Error::serialization(format!("invalid shuffle object {}: {e}", meta.path))
            })?;
            snapshots.extend(object.snapshots);
        }
        Ok(snapshots)
    }

    /// Deletes the map output for `key` in `job_id`.
    ///
    /// # Errors
    ///
    /// Returns an error if listing or deleting fails.
    pub async fn clear(&self, job_id: JobId, key: &DepositKey) -> Result<()> {
        for meta in self.storage.list(&Self::key_prefix(job_id, key)).await? {
            self.storage.delete(&meta.path).await?;
        }
        Ok(())
    }

    /// Deletes all remaining map output of `job_id`.
    ///
    /// # Errors
    ///
    /// Returns an error if listing or deleting fails.
    pub async fn clear_job(&self, job_id: JobId) -> Result<()> {
        for meta in self.storage.list(&format!("{SHUFFLE_PREFIX}{job_id}/")).await? {
            self.storage.delete(&meta.path).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mode::DepositMode;
    use crate::resource::{RegistrarState, RegistrarStatus};
    use chrono::{TimeZone, Utc};
    use escrow_core::MemoryBackend;

    fn registrar(id: &str) -> ResourceSnapshot {
        ResourceSnapshot::Registrar(RegistrarState {
            registrar_id: id.into(),
            name: format!("{id} Inc"),
            iana_id: None,
            status: RegistrarStatus::Active,
        })
    }

    fn key() -> DepositKey {
        DepositKey::new(
            "example",
            DepositMode::Full,
            Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
        )
    }

    #[test]
    fn shard_labels() {
        assert_eq!(MapShard::Registrars.to_string(), "registrars");
        assert_eq!(MapShard::Index(ShardId(7)).to_string(), "shard-0007");
    }

    #[tokio::test]
    async fn rewrites_replace_and_clear_removes() {
        let backend = MemoryBackend::new();
        let store = ShuffleStore::new(Arc::new(backend.clone()));
        let job = JobId::generate();

        store.put(job, &key(), MapShard::Registrars, vec![registrar("a")]).await.unwrap();
        store.put(job, &key(), MapShard::Registrars, vec![registrar("a")]).await.unwrap();
        store
            .put(job, &key(), MapShard::Index(ShardId(0)), vec![registrar("b")])
            .await
            .unwrap();

        let collected = store.collect(job, &key()).await.unwrap();
        assert_eq!(collected.len(), 2);

        store.clear(job, &key()).await.unwrap();
        assert!(store.collect(job, &key()).await.unwrap().is_empty());
        assert!(backend.paths().unwrap().is_empty());
    }

    #[tokio::test]
    async fn jobs_do_not_share_output() {
        let store = ShuffleStore::new(Arc::new(MemoryBackend::new()));
        let first = JobId::generate();
        let second = JobId::generate();
        store.put(first, &key(), MapShard::Registrars, vec![registrar("a")]).await.unwrap();
        assert!(store.collect(second, &key()).await.unwrap().is_empty());

        store.clear_job(second).await.unwrap();
        assert_eq!(store.collect(first, &key()).await.unwrap().len(), 1);
        store.clear_job(first).await.unwrap();
        assert!(store.collect(first, &key()).await.unwrap().is_empty());
    }
}
