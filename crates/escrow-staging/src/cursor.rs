//! Durable per-TLD progress cursors.
//!
//! A cursor records the earliest watermark whose deposit has not yet been
//! produced. It is the only durable statement of progress: every other
//! artifact of a run can be recomputed from it.
//!
//! Cursors live at `cursors/{tld}/{cursor_type}.json` and are only ever
//! changed by conditional writes. Each record also carries an outbox of
//! upload requests: advancing a cursor and staging its upload happen in a
//! single write, and [`CursorStore::relay_outbox`] later moves the staged
//! requests to the upload queue.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use escrow_core::storage::get_optional;
use escrow_core::{Clock, StorageBackend, WritePrecondition, WriteResult};

use crate::error::{Error, Result};
use crate::mode::CursorType;
use crate::upload::{UploadQueue, UploadRequest};

/// Storage prefix of all cursors.
pub const CURSOR_PREFIX: &str = "cursors/";

/// Default number of attempts for a contended cursor write.
pub const DEFAULT_MAX_CAS_RETRIES: u32 = 8;

const BACKOFF_BASE: Duration = Duration::from_millis(5);
const BACKOFF_MAX: Duration = Duration::from_millis(250);

/// Stored cursor contents.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CursorRecord {
    /// TLD the cursor belongs to.
    pub tld: String,
    /// Cursor type.
    pub cursor_type: CursorType,
    /// Earliest watermark not yet deposited.
    pub position: DateTime<Utc>,
    /// When the record was last written.
    pub updated_at: DateTime<Utc>,
    /// Upload requests staged with an advance and not yet relayed.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub outbox: Vec<UploadRequest>,
}

impl CursorRecord {
    fn to_bytes(&self) -> Result<Bytes> {
        serde_json::to_vec(self)
            .map(Bytes::from)
            .map_err(|e| Error::serialization(format!("failed to serialize cursor: {e}")))
    }
}

/// Returns the storage path of a cursor.
#[must_use]
pub fn cursor_path(tld: &str, cursor_type: CursorType) -> String {
    format!("{CURSOR_PREFIX}{tld}/{cursor_type}.json")
}

/// Reads and conditionally updates cursors.
#[derive(Clone)]
pub struct CursorStore {
    storage: Arc<dyn StorageBackend>,
    clock: Arc<dyn Clock>,
    epoch: DateTime<Utc>,
    max_cas_retries: u32,
}

impl std::fmt::Debug for CursorStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CursorStore")
            .field("epoch", &self.epoch)
            .field("max_cas_retries", &self.max_cas_retries)
            .finish_non_exhaustive()
    }
}

impl CursorStore {
    /// Creates a store whose missing cursors read as the Unix epoch.
    #[must_use]
    pub fn new(storage: Arc<dyn StorageBackend>, clock: Arc<dyn Clock>) -> Self {
        Self {
            storage,
            clock,
            epoch: DateTime::<Utc>::UNIX_EPOCH,
            max_cas_retries: DEFAULT_MAX_CAS_RETRIES,
        }
    }

    /// Sets the position reported for missing cursors.
    #[must_use]
    pub const fn with_epoch(mut self, epoch: DateTime<Utc>) -> Self {
        self.epoch = epoch;
        self
    }

    /// Sets the number of attempts for contended writes (at least one).
    #[must_use]
    pub fn with_cas_retries(mut self, max_cas_retries: u32) -> Self {
        self.max_cas_retries = max_cas_retries.max(1);
        self
    }

    /// Position reported for missing cursors.
    #[must_use]
    pub const fn epoch(&self) -> DateTime<Utc> {
        self.epoch
    }

    /// Returns the cursor position, or the epoch default if missing.
    ///
    /// # Errors
    ///
    /// Returns an error if the cursor could not be read.
    pub async fn get(&self, tld: &str, cursor_type: CursorType) -> Result<DateTime<Utc>> {
        Ok(self.get_raw(tld, cursor_type).await?.unwrap_or(self.epoch))
    }

    /// Returns the cursor position, or `None` if the cursor was never written.
    ///
    /// # Errors
    ///
    /// Returns an error if the cursor could not be read.
    pub async fn get_raw(
        &self,
        tld: &str,
        cursor_type: CursorType,
    ) -> Result<Option<DateTime<Utc>>> {
        Ok(self
            .read_record(&cursor_path(tld, cursor_type))
            .await?
            .map(|record| record.position))
    }

    /// Creates the cursor at `at` if it does not exist yet.
    ///
    /// Returns the stored position, which is `at` unless another writer
    /// created the cursor first.
    ///
    /// # Errors
    ///
    /// Returns an error if the cursor could not be read or written.
    pub async fn initialize(
        &self,
        tld: &str,
        cursor_type: CursorType,
        at: DateTime<Utc>,
    ) -> Result<DateTime<Utc>> {
        let path = cursor_path(tld, cursor_type);
        let record = CursorRecord {
            tld: tld.to_string(),
            cursor_type,
            position: at,
            updated_at: self.clock.now(),
            outbox: Vec::new(),
        };

        match self
            .storage
            .put(&path, record.to_bytes()?, WritePrecondition::DoesNotExist)
            .await?
        {
            WriteResult::Success { .. } => {
                tracing::info!(%tld, %cursor_type, position = %at, "initialized cursor");
                Ok(at)
            }
            WriteResult::PreconditionFailed { .. } => self
                .read_record(&path)
                .await?
                .map(|existing| existing.position)
                .ok_or_else(|| Error::storage(format!("cursor {path} vanished after create race"))),
        }
    }

    /// Advances the cursor from `from` to `to`.
    ///
    /// Returns `false` without writing if the cursor is already at or past
    /// `to`.
    ///
    /// # Errors
    ///
    /// Returns `Error::CursorOrdering` if the cursor is before `to` but not
    /// at `from`, and `Error::CursorContention` if the write kept losing
    /// races.
    pub async fn try_advance(
        &self,
        tld: &str,
        cursor_type: CursorType,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<bool> {
        self.advance(tld, cursor_type, from, to, None).await
    }

    /// Advances the cursor like [`Self::try_advance`] and, in the same write,
    /// stages `request` in the cursor's outbox.
    ///
    /// Nothing is staged when the advance is a no-op.
    ///
    /// # Errors
    ///
    /// Same as [`Self::try_advance`].
    pub async fn advance_and_stage(
        &self,
        tld: &str,
        cursor_type: CursorType,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        request: UploadRequest,
    ) -> Result<bool> {
        self.advance(tld, cursor_type, from, to, Some(request)).await
    }

    async fn advance(
        &self,
        tld: &str,
        cursor_type: CursorType,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        staged: Option<UploadRequest>,
    ) -> Result<bool> {
        let path = cursor_path(tld, cursor_type);

        for attempt in 1..=self.max_cas_retries {
            let loaded = self.read_record_with_version(&path).await?;
            let current = loaded
                .as_ref()
                .map_or(self.epoch, |(record, _)| record.position);

            if current >= to {
                tracing::info!(
                    %tld,
                    %cursor_type,
                    position = %current,
                    target = %to,
                    "cursor already advanced"
                );
                return Ok(false);
            }
            if current != from {
                return Err(Error::CursorOrdering {
                    tld: tld.to_string(),
                    cursor_type: cursor_type.to_string(),
                    position: current,
                    watermark: from,
                });
            }

            let (mut record, precondition) = match loaded {
                Some((record, version)) => (record, WritePrecondition::MatchesVersion(version)),
                None => (
                    CursorRecord {
                        tld: tld.to_string(),
                        cursor_type,
                        position: current,
                        updated_at: self.clock.now(),
                        outbox: Vec::new(),
                    },
                    WritePrecondition::DoesNotExist,
                ),
            };
            record.position = to;
            record.updated_at = self.clock.now();
            if let Some(request) = &staged {
                let key = request.idempotency_key();
                if !record.outbox.iter().any(|r| r.idempotency_key() == key) {
                    record.outbox.push(request.clone());
                }
            }

            match self
                .storage
                .put(&path, record.to_bytes()?, precondition)
                .await?
            {
                WriteResult::Success { .. } => {
                    tracing::info!(%tld, %cursor_type, %from, %to, "advanced cursor");
                    return Ok(true);
                }
                WriteResult::PreconditionFailed { .. } => {
                    tracing::debug!(%path, attempt, "cursor write lost CAS race");
                    backoff(attempt).await;
                }
            }
        }

        Err(Error::CursorContention {
            path,
            attempts: self.max_cas_retries,
        })
    }

    /// Enqueues every staged upload request of one cursor and removes the
    /// relayed requests from its outbox.
    ///
    /// Returns the number of requests relayed. Requests may be enqueued more
    /// than once if a relay is interrupted; the queue deduplicates them.
    ///
    /// # Errors
    ///
    /// Returns an error if the cursor could not be read or written, or if the
    /// queue rejected a request. Requests not yet removed stay staged.
    pub async fn relay_outbox(
        &self,
        tld: &str,
        cursor_type: CursorType,
        queue: &dyn UploadQueue,
    ) -> Result<usize> {
        let path = cursor_path(tld, cursor_type);
        let Some(record) = self.read_record(&path).await? else {
            return Ok(0);
        };
        if record.outbox.is_empty() {
            return Ok(0);
        }

        let mut relayed = HashSet::new();
        for request in record.outbox {
            let result = queue.enqueue(request.clone()).await?;
            tracing::info!(
                %tld,
                %cursor_type,
                action = %request.action,
                watermark = %request.watermark,
                message_id = %result.message_id(),
                "relayed upload request"
            );
            relayed.insert(request.idempotency_key());
        }

        for attempt in 1..=self.max_cas_retries {
            let Some((mut current, version)) = self.read_record_with_version(&path).await? else {
                return Ok(relayed.len());
            };
            let before = current.outbox.len();
            current
                .outbox
                .retain(|r| !relayed.contains(&r.idempotency_key()));
            if current.outbox.len() == before {
                return Ok(relayed.len());
            }
            current.updated_at = self.clock.now();

            match self
                .storage
                .put(
                    &path,
                    current.to_bytes()?,
                    WritePrecondition::MatchesVersion(version),
                )
                .await?
            {
                WriteResult::Success { .. } => return Ok(relayed.len()),
                WriteResult::PreconditionFailed { .. } => backoff(attempt).await,
            }
        }

        Err(Error::CursorContention {
            path,
            attempts: self.max_cas_retries,
        })
    }

    /// Relays the outboxes of all cursors with staged requests.
    ///
    /// # Errors
    ///
    /// Returns the first relay error; cursors after it are left for the next
    /// sweep.
    pub async fn relay_all(&self, queue: &dyn UploadQueue) -> Result<usize> {
        let mut total = 0;
        for record in self.list().await? {
            if !record.outbox.is_empty() {
                total += self
                    .relay_outbox(&record.tld, record.cursor_type, queue)
                    .await?;
            }
        }
        Ok(total)
    }

    /// Lists every cursor record, ordered by path.
    ///
    /// # Errors
    ///
    /// Returns an error if listing or reading fails.
    pub async fn list(&self) -> Result<Vec<CursorRecord>> {
        let mut metas = self.storage.list(CURSOR_PREFIX).await?;
        metas.sort_by(|a, b| a.path.cmp(&b.path));

        let mut records = Vec::with_capacity(metas.len());
        for meta in metas {
            if let Some(record) = self.read_record(&meta.path).await? {
                records.push(record);
            }
        }
        Ok(records)
    }

    async fn read_record(&self, path: &str) -> Result<Option<CursorRecord>> {
        get_optional(self.storage.as_ref(), path)
            .await?
            .map(|bytes| decode(path, &bytes))
            .transpose()
    }

    async fn read_record_with_version(
        &self,
        path: &str,
    ) -> Result<Option<(CursorRecord, String)>> {
        // Version first: a newer body with an older version only makes the
        // following CAS fail.
        let Some(meta) = self.storage.head(path).await? else {
            return Ok(None);
        };
        let Some(record) = self.read_record(path).await? else {
            return Ok(None);
        };
        Ok(Some((record, meta.version)))
    }
}

fn decode(path: &str, bytes: &[u8]) -> Result<CursorRecord> {
    serde_json::from_slice(bytes)
        .map_err(|e| Error::serialization(format!("invalid cursor at {path}: {e}")))
}

async fn backoff(attempt: u32) {
    let factor = 1u32 << attempt.min(16);
    let delay = BACKOFF_BASE.saturating_mul(factor).min(BACKOFF_MAX);
    tokio::time::sleep(delay).await;
}
