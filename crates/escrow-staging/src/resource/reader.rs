//! Point-in-time reads of registry resources.
//!
//! A read "as of" a watermark selects the latest revision committed at or
//! before the watermark and projects it forward to the watermark. Resources
//! created after, or deleted at or before, the watermark are absent.

use std::sync::Arc;

use chrono::{DateTime, Utc};

use super::history::RevisionLog;
use super::{RegistrarState, ResourceKey, ResourceSnapshot, ResourceStore};
use crate::error::Result;

/// Reconstructs resource state at a past instant.
#[derive(Clone)]
pub struct PointInTimeReader {
    store: Arc<dyn ResourceStore>,
}

impl std::fmt::Debug for PointInTimeReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PointInTimeReader").finish_non_exhaustive()
    }
}

impl PointInTimeReader {
    /// Creates a reader over `store`.
    #[must_use]
    pub fn new(store: Arc<dyn ResourceStore>) -> Self {
        Self { store }
    }

    /// Reads `key` as of `watermark`.
    ///
    /// Returns `None` if the resource did not exist at the watermark.
    ///
    /// # Errors
    ///
    /// Returns an error if the history could not be read.
    pub async fn read_as_of(
        &self,
        key: &ResourceKey,
        watermark: DateTime<Utc>,
    ) -> Result<Option<ResourceSnapshot>> {
        let Some(log) = self.store.history(key).await? else {
            return Ok(None);
        };
        Ok(snapshot_at(&log, watermark))
    }

    /// Reads the full revision history once, for projecting to several
    /// watermarks.
    ///
    /// # Errors
    ///
    /// Returns an error if the history could not be read.
    pub async fn history(&self, key: &ResourceKey) -> Result<Option<RevisionLog>> {
        self.store.history(key).await
    }

    /// Reads all registrars as currently stored.
    ///
    /// # Errors
    ///
    /// Returns an error if the registrars could not be read.
    pub async fn registrars(&self) -> Result<Vec<RegistrarState>> {
        self.store.registrars().await
    }
}

/// Projects a revision log to `watermark`.
#[must_use]
pub fn snapshot_at(log: &RevisionLog, watermark: DateTime<Utc>) -> Option<ResourceSnapshot> {
    log.revision_at(watermark)?.state.project_to(watermark)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource::memory::MemoryResourceStore;
    use crate::resource::{DomainState, PendingTransfer, ResourceKind, ResourceState};
    use chrono::{Duration, TimeZone};
    use std::collections::BTreeSet;

    fn ts(day: u32, hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, day, hour, 0, 0).unwrap()
    }

    fn domain(sponsor: &str) -> DomainState {
        DomainState {
            repo_id: "D1-EXAMPLE".into(),
            fqdn: "a.example".into(),
            tld: "example".into(),
            sponsor: sponsor.into(),
            statuses: BTreeSet::from(["ok".to_string()]),
            nameservers: BTreeSet::new(),
            registrant: None,
            contacts: BTreeSet::new(),
            creation_time: ts(1, 0),
            expiration_time: ts(1, 0) + Duration::days(365),
            deletion_time: None,
            pending_transfer: None,
        }
    }

    fn key() -> ResourceKey {
        ResourceKey::new(ResourceKind::Domain, "D1-EXAMPLE")
    }

    fn reader(store: MemoryResourceStore) -> PointInTimeReader {
        PointInTimeReader::new(Arc::new(store))
    }

    #[tokio::test]
    async fn later_edits_are_invisible() {
        let store = MemoryResourceStore::new(1);
        store.commit(ts(1, 0), ResourceState::Domain(domain("RegA"))).unwrap();
        store.commit(ts(2, 1), ResourceState::Domain(domain("RegB"))).unwrap();
        let reader = reader(store);

        let Some(ResourceSnapshot::Domain(d)) = reader.read_as_of(&key(), ts(2, 0)).await.unwrap()
        else {
            panic!("expected domain");
        };
        assert_eq!(d.sponsor, "RegA");

        let Some(ResourceSnapshot::Domain(d)) = reader.read_as_of(&key(), ts(3, 0)).await.unwrap()
        else {
            panic!("expected domain");
        };
        assert_eq!(d.sponsor, "RegB");
    }

    #[tokio::test]
    async fn absent_before_creation_and_from_deletion() {
        let store = MemoryResourceStore::new(1);
        let mut created = domain("RegA");
        created.creation_time = ts(1, 12);
        store.commit(ts(1, 12), ResourceState::Domain(created.clone())).unwrap();
        let mut deleted = created;
        deleted.deletion_time = Some(ts(3, 0));
        store.commit(ts(2, 6), ResourceState::Domain(deleted)).unwrap();
        let reader = reader(store);

        assert!(reader.read_as_of(&key(), ts(1, 0)).await.unwrap().is_none());
        assert!(reader.read_as_of(&key(), ts(2, 12)).await.unwrap().is_some());
        assert!(reader.read_as_of(&key(), ts(3, 0)).await.unwrap().is_none());
        let missing = ResourceKey::new(ResourceKind::Host, "nope");
        assert!(reader.read_as_of(&missing, ts(3, 0)).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn expired_pending_transfer_is_projected() {
        let store = MemoryResourceStore::new(1);
        let mut pending = domain("RegA");
        pending.statuses.insert("pendingTransfer".into());
        pending.pending_transfer = Some(PendingTransfer {
            gaining_registrar: "RegB".into(),
            requested_at: ts(1, 0),
            auto_approve_at: ts(6, 0),
        });
        store.commit(ts(1, 0), ResourceState::Domain(pending)).unwrap();
        let reader = reader(store);

        let Some(ResourceSnapshot::Domain(before)) =
            reader.read_as_of(&key(), ts(5, 0)).await.unwrap()
        else {
            panic!("expected domain");
        };
        assert_eq!(before.sponsor, "RegA");
        assert!(before.pending_transfer.is_some());

        let Some(ResourceSnapshot::Domain(after)) =
            reader.read_as_of(&key(), ts(6, 0)).await.unwrap()
        else {
            panic!("expected domain");
        };
        assert_eq!(after.sponsor, "RegB");
        assert!(after.pending_transfer.is_none());
        assert!(!after.statuses.contains("pendingTransfer"));
    }
}
