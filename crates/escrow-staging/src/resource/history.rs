//! Append-only revision history of a versioned resource.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{ResourceKey, ResourceState};
use crate::error::{Error, Result};

/// One committed version of a resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Revision {
    /// Commit time of the transaction that produced this version.
    pub commit_time: DateTime<Utc>,
    /// Resource state as written by that transaction.
    pub state: ResourceState,
}

/// Revisions of a single resource, ordered by strictly increasing commit time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RevisionLog {
    key: ResourceKey,
    revisions: Vec<Revision>,
}

impl RevisionLog {
    /// Creates an empty log.
    #[must_use]
    pub fn new(key: ResourceKey) -> Self {
        Self {
            key,
            revisions: Vec::new(),
        }
    }

    /// Resource this log belongs to.
    #[must_use]
    pub fn key(&self) -> &ResourceKey {
        &self.key
    }

    /// All revisions, oldest first.
    #[must_use]
    pub fn revisions(&self) -> &[Revision] {
        &self.revisions
    }

    /// Returns true if nothing has been committed yet.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.revisions.is_empty()
    }

    /// Appends a revision.
    ///
    /// # Errors
    ///
    /// Returns `Error::RevisionOrder` if `commit_time` is not strictly after
    /// the latest revision, or `Error::Serialization` if the state belongs to
    /// a different resource.
    pub fn append(&mut self, commit_time: DateTime<Utc>, state: ResourceState) -> Result<()> {
        if state.key() != self.key {
            return Err(Error::serialization(format!(
                "revision for {} appended to history of {}",
                state.key(),
                self.key
            )));
        }
        if let Some(latest) = self.revisions.last() {
            if commit_time <= latest.commit_time {
                return Err(Error::RevisionOrder {
                    key: self.key.to_string(),
                    commit_time,
                    latest: latest.commit_time,
                });
            }
        }
        self.revisions.push(Revision { commit_time, state });
        Ok(())
    }

    /// Returns the latest revision committed at or before `at`.
    #[must_use]
    pub fn revision_at(&self, at: DateTime<Utc>) -> Option<&Revision> {
        let idx = self.revisions.partition_point(|r| r.commit_time <= at);
        idx.checked_sub(1).map(|i| &self.revisions[i])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource::{ContactState, ResourceKind};
    use chrono::{Duration, TimeZone};
    use proptest::prelude::*;

    fn contact(name: &str) -> ResourceState {
        ResourceState::Contact(ContactState {
            repo_id: "C1-EXAMPLE".into(),
            contact_id: "jd1234".into(),
            sponsor: "TheRegistrar".into(),
            name: Some(name.into()),
            email: None,
            creation_time: Utc.with_ymd_and_hms(2020, 1, 1, 0, 0, 0).unwrap(),
            deletion_time: None,
        })
    }

    fn key() -> ResourceKey {
        ResourceKey::new(ResourceKind::Contact, "C1-EXAMPLE")
    }

    #[test]
    fn lookup_picks_latest_revision_at_or_before() {
        let t0 = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let mut log = RevisionLog::new(key());
        log.append(t0, contact("first")).unwrap();
        log.append(t0 + Duration::hours(2), contact("second")).unwrap();

        assert!(log.revision_at(t0 - Duration::seconds(1)).is_none());
        assert_eq!(log.revision_at(t0).unwrap().state, contact("first"));
        assert_eq!(
            log.revision_at(t0 + Duration::hours(1)).unwrap().state,
            contact("first")
        );
        assert_eq!(
            log.revision_at(t0 + Duration::hours(2)).unwrap().state,
            contact("second")
        );
    }

    #[test]
    fn rejects_non_increasing_commit_time() {
        let t0 = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let mut log = RevisionLog::new(key());
        log.append(t0, contact("first")).unwrap();
        let err = log.append(t0, contact("again")).unwrap_err();
        assert!(matches!(err, Error::RevisionOrder { .. }));
        assert_eq!(log.revisions().len(), 1);
    }

    proptest! {
        #[test]
        fn revision_at_never_sees_the_future(
            offsets in proptest::collection::btree_set(0i64..10_000, 1..20),
            lookup in -10i64..10_010,
        ) {
            let base = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
            let mut log = RevisionLog::new(key());
            for offset in &offsets {
                log.append(base + Duration::seconds(*offset), contact(&offset.to_string()))
                    .unwrap();
            }
            let at = base + Duration::seconds(lookup);
            let expected = offsets.iter().filter(|o| **o <= lookup).max();
            match (log.revision_at(at), expected) {
                (Some(rev), Some(offset)) => {
                    prop_assert_eq!(rev.commit_time, base + Duration::seconds(*offset));
                }
                (None, None) => {}
                (got, want) => prop_assert!(
                    false,
                    "got {:?}, want {:?}",
                    got.map(|r| r.commit_time),
                    want
                ),
            }
        }
    }
}
