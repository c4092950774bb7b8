//! In-memory resource store.
//!
//! Resources are spread over a fixed number of shards by hashing their
//! repository id. Every commit appends a revision to the resource's history.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::RwLock;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};

use super::history::RevisionLog;
use super::{Partition, RegistrarState, ResourceKey, ResourceState, ResourceStore, ShardId};
use crate::error::{Error, Result};

/// Default number of index shards.
pub const DEFAULT_SHARD_COUNT: u32 = 16;

#[derive(Debug, Default)]
struct StoreState {
    histories: BTreeMap<ResourceKey, RevisionLog>,
    shards: BTreeMap<ShardId, BTreeSet<ResourceKey>>,
    registrars: BTreeMap<String, RegistrarState>,
    partitions: BTreeMap<String, Partition>,
}

/// Sharded resource store held in process memory.
#[derive(Debug)]
pub struct MemoryResourceStore {
    shard_count: u32,
    state: RwLock<StoreState>,
}

impl Default for MemoryResourceStore {
    fn default() -> Self {
        Self::new(DEFAULT_SHARD_COUNT)
    }
}

fn poison_err<T>(_: std::sync::PoisonError<T>) -> Error {
    Error::storage("resource store lock poisoned")
}

impl MemoryResourceStore {
    /// Creates an empty store with `shard_count` shards (at least one).
    #[must_use]
    pub fn new(shard_count: u32) -> Self {
        Self {
            shard_count: shard_count.max(1),
            state: RwLock::new(StoreState::default()),
        }
    }

    /// Number of shards in the index.
    #[must_use]
    pub fn shard_count(&self) -> u32 {
        self.shard_count
    }

    /// Shard a repository id hashes to.
    #[must_use]
    pub fn shard_for(&self, repo_id: &str) -> ShardId {
        let digest = Sha256::digest(repo_id.as_bytes());
        let prefix = u32::from_be_bytes([digest[0], digest[1], digest[2], digest[3]]);
        ShardId(prefix % self.shard_count)
    }

    /// Commits a new revision of a resource.
    ///
    /// # Errors
    ///
    /// Returns `Error::RevisionOrder` if `commit_time` is not after the
    /// resource's latest revision.
    pub fn commit(&self, commit_time: DateTime<Utc>, state: ResourceState) -> Result<()> {
        let key = state.key();
        let shard = self.shard_for(&key.repo_id);
        let mut guard = self.state.write().map_err(poison_err)?;
        guard
            .histories
            .entry(key.clone())
            .or_insert_with(|| RevisionLog::new(key.clone()))
            .append(commit_time, state)?;
        guard.shards.entry(shard).or_default().insert(key);
        Ok(())
    }

    /// Inserts or replaces a registrar.
    ///
    /// # Errors
    ///
    /// Returns an error if the store lock is poisoned.
    pub fn put_registrar(&self, registrar: RegistrarState) -> Result<()> {
        let mut guard = self.state.write().map_err(poison_err)?;
        guard
            .registrars
            .insert(registrar.registrar_id.clone(), registrar);
        Ok(())
    }

    /// Removes a registrar.
    ///
    /// # Errors
    ///
    /// Returns an error if the store lock is poisoned.
    pub fn remove_registrar(&self, registrar_id: &str) -> Result<()> {
        let mut guard = self.state.write().map_err(poison_err)?;
        guard.registrars.remove(registrar_id);
        Ok(())
    }

    /// Inserts or replaces a TLD.
    ///
    /// # Errors
    ///
    /// Returns an error if the store lock is poisoned.
    pub fn put_partition(&self, partition: Partition) -> Result<()> {
        let mut guard = self.state.write().map_err(poison_err)?;
        guard.partitions.insert(partition.tld.clone(), partition);
        Ok(())
    }
}

#[async_trait]
impl ResourceStore for MemoryResourceStore {
    async fn shards(&self) -> Result<Vec<ShardId>> {
        Ok((0..self.shard_count).map(ShardId).collect())
    }

    async fn shard_members(&self, shard: ShardId) -> Result<Vec<ResourceKey>> {
        let guard = self.state.read().map_err(poison_err)?;
        Ok(guard
            .shards
            .get(&shard)
            .map(|keys| keys.iter().cloned().collect())
            .unwrap_or_default())
    }

    async fn history(&self, key: &ResourceKey) -> Result<Option<RevisionLog>> {
        let guard = self.state.read().map_err(poison_err)?;
        Ok(guard.histories.get(key).cloned())
    }

    async fn registrars(&self) -> Result<Vec<RegistrarState>> {
        let guard = self.state.read().map_err(poison_err)?;
        Ok(guard.registrars.values().cloned().collect())
    }

    async fn partitions(&self) -> Result<Vec<Partition>> {
        let guard = self.state.read().map_err(poison_err)?;
        Ok(guard.partitions.values().cloned().collect())
    }
}
