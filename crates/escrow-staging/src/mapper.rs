//! Map phase: fans resources out to the deposits that contain them.
//!
//! A map task covers one index shard, or the registrar pseudo-shard. For
//! each resource it works out which pending deposits the resource belongs
//! to, reads the resource's history once, projects it to each distinct
//! watermark and emits the snapshots that exist at that watermark.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use chrono::{DateTime, Utc};

use escrow_core::JobId;

use crate::deposit::DepositKey;
use crate::error::Result;
use crate::mode::DepositMode;
use crate::pending::PendingDeposit;
use crate::resource::reader::{PointInTimeReader, snapshot_at};
use crate::resource::{ResourceKey, ResourceKind, ResourceSnapshot, ResourceStore};
use crate::shuffle::{MapShard, ShuffleStore};

/// Snapshots a map task emitted, per deposit.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MapOutput {
    /// Number of snapshots emitted per deposit key.
    pub emitted: BTreeMap<DepositKey, u64>,
}

impl MapOutput {
    /// Total snapshots emitted.
    #[must_use]
    pub fn total(&self) -> u64 {
        self.emitted.values().sum()
    }
}

/// Runs map tasks.
#[derive(Clone)]
pub struct Mapper {
    resources: Arc<dyn ResourceStore>,
    reader: PointInTimeReader,
    shuffle: ShuffleStore,
}

impl std::fmt::Debug for Mapper {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Mapper").finish_non_exhaustive()
    }
}

impl Mapper {
    /// Creates a mapper reading from `resources` and writing to `shuffle`.
    #[must_use]
    pub fn new(resources: Arc<dyn ResourceStore>, shuffle: ShuffleStore) -> Self {
        Self {
            reader: PointInTimeReader::new(Arc::clone(&resources)),
            resources,
            shuffle,
        }
    }

    /// Runs one map task of `job_id` over `shard` for the given deposits.
    ///
    /// # Errors
    ///
    /// Returns an error if resources could not be read or output could not be
    /// written. The task may be re-run; its output is overwritten.
    #[tracing::instrument(skip(self, pending), fields(job_id = %job_id, shard = %shard))]
    pub async fn map_shard(
        &self,
        job_id: JobId,
        shard: MapShard,
        pending: &[PendingDeposit],
    ) -> Result<MapOutput> {
        let emitted = match shard {
            MapShard::Registrars => self.map_registrars(pending).await?,
            MapShard::Index(index) => {
                let mut emitted: BTreeMap<DepositKey, Vec<ResourceSnapshot>> = BTreeMap::new();
                for key in self.resources.shard_members(index).await? {
                    self.map_resource(&key, pending, &mut emitted).await?;
                }
                emitted
            }
        };

        let mut output = MapOutput::default();
        for (key, snapshots) in emitted {
            output.emitted.insert(key.clone(), snapshots.len() as u64);
            self.shuffle.put(job_id, &key, shard, snapshots).await?;
        }
        tracing::debug!(snapshots = output.total(), "map task finished");
        Ok(output)
    }

    async fn map_registrars(
        &self,
        pending: &[PendingDeposit],
    ) -> Result<BTreeMap<DepositKey, Vec<ResourceSnapshot>>> {
        let registrars = self.reader.registrars().await?;
        let mut emitted = BTreeMap::new();
        if registrars.is_empty() {
            return Ok(emitted);
        }
        for deposit in pending {
            let snapshots = registrars
                .iter()
                .cloned()
                .map(ResourceSnapshot::Registrar)
                .collect();
            emitted.insert(deposit.key(), snapshots);
        }
        Ok(emitted)
    }

    async fn map_resource(
        &self,
        key: &ResourceKey,
        pending: &[PendingDeposit],
        emitted: &mut BTreeMap<DepositKey, Vec<ResourceSnapshot>>,
    ) -> Result<()> {
        let candidates: Vec<&PendingDeposit> = match key.kind {
            ResourceKind::Domain => pending.iter().collect(),
            ResourceKind::Host | ResourceKind::Contact => pending
                .iter()
                .filter(|p| p.mode == DepositMode::Full)
                .collect(),
            ResourceKind::Registrar => Vec::new(),
        };
        if candidates.is_empty() {
            return Ok(());
        }

        let Some(log) = self.reader.history(key).await? else {
            return Ok(());
        };

        let mut by_watermark: HashMap<DateTime<Utc>, Option<ResourceSnapshot>> = HashMap::new();
        for deposit in candidates {
            let snapshot = by_watermark
                .entry(deposit.watermark)
                .or_insert_with(|| snapshot_at(&log, deposit.watermark));
            let Some(snapshot) = snapshot.as_ref() else {
                continue;
            };
            if let ResourceSnapshot::Domain(domain) = snapshot {
                if domain.tld != deposit.tld {
                    continue;
                }
            }
            emitted
                .entry(deposit.key())
                .or_default()
                .push(snapshot.clone());
        }
        Ok(())
    }
}
