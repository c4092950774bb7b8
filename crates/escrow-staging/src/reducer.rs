//! Reduce phase: assembles, encrypts and commits one deposit.
//!
//! The commit sequence for a deposit is:
//!
//! 1. Acquire the deposit lock; if another reducer holds it, stop.
//! 2. Marshal every snapshot. Any invalid snapshot abandons the deposit.
//! 3. Encrypt the document and report and write them, plus the length
//!    object, to paths that depend only on the deposit key.
//! 4. Advance the cursor and stage the upload request in one conditional
//!    write. The cursor never moves before the artifacts are durable.
//! 5. Relay the staged upload and release the lock.

use std::sync::Arc;

use bytes::Bytes;
use chrono::SecondsFormat;
use tracing::Instrument;

use escrow_core::observability::deposit_span;
use escrow_core::{JobId, StorageBackend, WritePrecondition};

use crate::config::StagingConfig;
use crate::crypto::Encryptor;
use crate::cursor::CursorStore;
use crate::deposit::{
    DepositArtifact, DepositDocument, DepositHeader, DepositKey, DepositReport,
};
use crate::error::{Error, Result};
use crate::idempotency::DepositLock;
use crate::marshal::{DepositFragment, DepositMarshaller};
use crate::metrics::StagingMetrics;
use crate::pending::PendingDeposit;
use crate::resource::ResourceSnapshot;
use crate::shuffle::ShuffleStore;
use crate::upload::{UploadAction, UploadQueue, UploadRequest};

/// How a reduce ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReduceOutcome {
    /// Artifacts written and the cursor advanced.
    Completed(DepositArtifact),
    /// The cursor was already past this deposit; nothing was advanced.
    AlreadyCompleted,
    /// Another reducer holds the deposit lock.
    LockContended,
}

impl ReduceOutcome {
    /// Short label for logs and metrics.
    #[must_use]
    pub const fn label(&self) -> &'static str {
        match self {
            Self::Completed(_) => "completed",
            Self::AlreadyCompleted => "already_completed",
            Self::LockContended => "lock_contended",
        }
    }
}

/// Runs reduce tasks.
#[derive(Clone)]
pub struct Reducer {
    storage: Arc<dyn StorageBackend>,
    shuffle: ShuffleStore,
    locks: DepositLock,
    cursors: CursorStore,
    encryptor: Arc<dyn Encryptor>,
    marshaller: Arc<dyn DepositMarshaller>,
    upload_queue: Arc<dyn UploadQueue>,
    prefix: String,
    metrics: StagingMetrics,
}

impl std::fmt::Debug for Reducer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reducer")
            .field("prefix", &self.prefix)
            .finish_non_exhaustive()
    }
}

fn to_json<T: serde::Serialize>(value: &T, what: &str) -> Result<Vec<u8>> {
    serde_json::to_vec(value)
        .map_err(|e| Error::serialization(format!("failed to serialize {what}: {e}")))
}

impl Reducer {
    /// Creates a reducer from the pipeline configuration.
    #[must_use]
    pub fn new(config: &StagingConfig) -> Self {
        Self {
            storage: Arc::clone(&config.storage),
            shuffle: ShuffleStore::new(Arc::clone(&config.storage)),
            locks: DepositLock::new(Arc::clone(&config.storage), config.settings.lock_ttl),
            cursors: config.cursor_store(),
            encryptor: Arc::clone(&config.encryptor),
            marshaller: Arc::clone(&config.marshaller),
            upload_queue: Arc::clone(&config.upload_queue),
            prefix: config.settings.staging_prefix.clone(),
            metrics: StagingMetrics::new(),
        }
    }

    /// Reduces the map output of `job_id` for `pending` into a deposit.
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidDeposit` if any snapshot failed to marshal,
    /// `Error::CursorOrdering` if the cursor is not at the deposit's
    /// watermark, and storage or encryption errors otherwise. The cursor is
    /// untouched whenever an error is returned.
    pub async fn reduce(&self, job_id: JobId, pending: &PendingDeposit) -> Result<ReduceOutcome> {
        let watermark = pending
            .watermark
            .to_rfc3339_opts(SecondsFormat::Secs, true);
        let span = deposit_span("reduce", &pending.tld, pending.mode.as_str(), &watermark);
        self.reduce_in_span(job_id, pending).instrument(span).await
    }

    async fn reduce_in_span(
        &self,
        job_id: JobId,
        pending: &PendingDeposit,
    ) -> Result<ReduceOutcome> {
        tracing::debug!(%job_id, "reducing deposit");
        let key = pending.key();
        let Some(guard) = self.locks.acquire(&key).await? else {
            tracing::info!("deposit is being reduced elsewhere");
            return Ok(ReduceOutcome::LockContended);
        };

        let _timer = self.metrics.time_reduce(pending.mode);
        let result = self.reduce_locked(job_id, pending, &key).await;

        if let Err(e) = guard.release().await {
            tracing::warn!(error = %e, "failed to release deposit lock; it will expire");
        }
        result
    }

    async fn reduce_locked(
        &self,
        job_id: JobId,
        pending: &PendingDeposit,
        key: &DepositKey,
    ) -> Result<ReduceOutcome> {
        let cursor_type = pending.cursor_type();
        let next = pending.next_watermark();

        let position = self.cursors.get(&pending.tld, cursor_type).await?;
        if position >= next {
            tracing::info!(%position, "deposit already completed");
            self.clear_shuffle(job_id, key).await;
            return Ok(ReduceOutcome::AlreadyCompleted);
        }

        let snapshots = self.shuffle.collect(job_id, key).await?;
        let fragments = self.marshal_all(key, &snapshots)?;
        let header = DepositHeader::new(key, &fragments);
        let counts = header.counts.clone();
        let paths = key.paths(&self.prefix);

        let document = DepositDocument {
            header: header.clone(),
            fragments,
        };
        let sealed_document = self
            .encryptor
            .encrypt(&paths.document, &to_json(&document, "deposit document")?)?;
        let document_size = sealed_document.len() as u64;
        let report = DepositReport {
            header,
            document_size,
        };
        let sealed_report = self
            .encryptor
            .encrypt(&paths.report, &to_json(&report, "deposit report")?)?;

        self.write(&paths.document, sealed_document).await?;
        self.write(&paths.length, Bytes::from(document_size.to_string()))
            .await?;
        self.write(&paths.report, sealed_report).await?;
        tracing::info!(
            path = %paths.document,
            bytes = document_size,
            resources = snapshots.len(),
            "wrote deposit artifacts"
        );

        let request = UploadRequest {
            tld: pending.tld.clone(),
            mode: pending.mode,
            watermark: pending.watermark,
            action: UploadAction::for_mode(pending.mode),
            document_path: paths.document.clone(),
        };
        let advanced = self
            .cursors
            .advance_and_stage(&pending.tld, cursor_type, pending.watermark, next, request)
            .await?;
        if !advanced {
            self.clear_shuffle(job_id, key).await;
            return Ok(ReduceOutcome::AlreadyCompleted);
        }

        match self
            .cursors
            .relay_outbox(&pending.tld, cursor_type, self.upload_queue.as_ref())
            .await
        {
            Ok(relayed) => self.metrics.record_relayed(relayed),
            Err(e) => tracing::warn!(error = %e, "upload relay deferred to next run"),
        }
        self.clear_shuffle(job_id, key).await;

        Ok(ReduceOutcome::Completed(DepositArtifact {
            key: key.clone(),
            paths,
            document_size,
            counts,
        }))
    }

    fn marshal_all(
        &self,
        key: &DepositKey,
        snapshots: &[ResourceSnapshot],
    ) -> Result<Vec<DepositFragment>> {
        let mut fragments = Vec::with_capacity(snapshots.len());
        let mut failures = 0;
        for snapshot in snapshots {
            match self.marshaller.marshal(key, snapshot) {
                Ok(fragment) => fragments.push(fragment),
                Err(e) => {
                    tracing::error!(
                        deposit = %key,
                        kind = %e.kind,
                        id = %e.id,
                        reason = %e.reason,
                        repr = ?snapshot,
                        "invalid resource in deposit"
                    );
                    failures += 1;
                }
            }
        }
        if failures > 0 {
            return Err(Error::InvalidDeposit {
                deposit: key.to_string(),
                failures,
            });
        }
        fragments.sort_by(|a, b| (a.kind, &a.id).cmp(&(b.kind, &b.id)));
        Ok(fragments)
    }

    async fn write(&self, path: &str, data: Bytes) -> Result<()> {
        self.storage
            .put(path, data, WritePrecondition::None)
            .await?;
        Ok(())
    }

    async fn clear_shuffle(&self, job_id: JobId, key: &DepositKey) {
        if let Err(e) = self.shuffle.clear(job_id, key).await {
            tracing::warn!(error = %e, "failed to clear shuffle output");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StagingSettings;
    use crate::crypto::XChaChaEncryptor;
    use crate::deposit::DepositReport;
    use crate::mode::{CursorType, DepositMode};
    use crate::resource::memory::MemoryResourceStore;
    use crate::resource::{DomainState, RegistrarState, RegistrarStatus, ResourceKind};
    use crate::shuffle::MapShard;
    use crate::upload::memory::InMemoryUploadQueue;
    use chrono::{DateTime, Duration, TimeZone, Utc};
    use escrow_core::{FakeClock, MemoryBackend};
    use std::collections::BTreeSet;

    fn jan(day: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, day, 0, 0, 0).unwrap()
    }

    struct Harness {
        reducer: Reducer,
        config: StagingConfig,
        backend: MemoryBackend,
        queue: Arc<InMemoryUploadQueue>,
        encryptor: Arc<XChaChaEncryptor>,
    }

    fn harness() -> Harness {
        let backend = MemoryBackend::new();
        let queue = Arc::new(InMemoryUploadQueue::new());
        let encryptor = Arc::new(XChaChaEncryptor::new([3u8; 32]).unwrap());
        let config = StagingConfig::new(
            StagingSettings::default(),
            Arc::new(MemoryResourceStore::new(1)),
            Arc::new(backend.clone()),
            encryptor.clone(),
            queue.clone(),
        )
        .with_clock(Arc::new(FakeClock::new(jan(2) + Duration::hours(1))));
        Harness {
            reducer: Reducer::new(&config),
            config,
            backend,
            queue,
            encryptor,
        }
    }

    fn pending() -> PendingDeposit {
        PendingDeposit {
            tld: "example".into(),
            mode: DepositMode::Full,
            watermark: jan(1),
            interval: Duration::days(1),
            size_hint: None,
        }
    }

    fn registrar(name: &str) -> ResourceSnapshot {
        ResourceSnapshot::Registrar(RegistrarState {
            registrar_id: "TheRegistrar".into(),
            name: name.into(),
            iana_id: Some(1),
            status: RegistrarStatus::Active,
        })
    }

    fn domain() -> ResourceSnapshot {
        ResourceSnapshot::Domain(DomainState {
            repo_id: "D1-EXAMPLE".into(),
            fqdn: "a.example".into(),
            tld: "example".into(),
            sponsor: "TheRegistrar".into(),
            statuses: BTreeSet::new(),
            nameservers: BTreeSet::new(),
            registrant: None,
            contacts: BTreeSet::new(),
            creation_time: jan(1) - Duration::days(10),
            expiration_time: jan(1) + Duration::days(355),
            deletion_time: None,
            pending_transfer: None,
        })
    }

    async fn seed(h: &Harness, job: JobId, snapshots: Vec<ResourceSnapshot>) {
        ShuffleStore::new(Arc::clone(&h.config.storage))
            .put(job, &pending().key(), MapShard::Registrars, snapshots)
            .await
            .unwrap();
        h.config
            .cursor_store()
            .initialize("example", CursorType::RdeStaging, jan(1))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn completed_reduce_writes_artifacts_then_advances() {
        let h = harness();
        let job = JobId::generate();
        seed(&h, job, vec![registrar("The Registrar"), domain()]).await;

        let artifact = match h.reducer.reduce(job, &pending()).await.unwrap() {
            ReduceOutcome::Completed(artifact) => artifact,
            other => panic!("expected completion, got {other:?}"),
        };
        assert_eq!(artifact.counts[&ResourceKind::Domain], 1);
        assert_eq!(artifact.counts[&ResourceKind::Registrar], 1);

        let cursors = h.config.cursor_store();
        assert_eq!(cursors.get("example", CursorType::RdeStaging).await.unwrap(), jan(2));
        assert_eq!(h.queue.len().unwrap(), 1);
        assert!(cursors.list().await.unwrap()[0].outbox.is_empty());

        let sealed = h.backend.get(&artifact.paths.report).await.unwrap();
        let report: DepositReport =
            serde_json::from_slice(&h.encryptor.decrypt(&artifact.paths.report, &sealed).unwrap())
                .unwrap();
        assert_eq!(report.header.id, "S6K2O0");
        assert_eq!(report.document_size, artifact.document_size);
        let length = h.backend.get(&artifact.paths.length).await.unwrap();
        assert_eq!(length, Bytes::from(artifact.document_size.to_string()));

        assert!(!h.backend.paths().unwrap().iter().any(|p| p.starts_with("shuffle/")));
    }

    #[tokio::test]
    async fn repeated_reduce_is_a_no_op() {
        let h = harness();
        let job = JobId::generate();
        seed(&h, job, vec![registrar("The Registrar")]).await;

        assert!(matches!(
            h.reducer.reduce(job, &pending()).await.unwrap(),
            ReduceOutcome::Completed(_)
        ));
        assert_eq!(
            h.reducer.reduce(job, &pending()).await.unwrap(),
            ReduceOutcome::AlreadyCompleted
        );
        assert_eq!(h.queue.len().unwrap(), 1);
    }

    #[tokio::test]
    async fn invalid_snapshot_abandons_the_deposit() {
        let h = harness();
        let job = JobId::generate();
        seed(&h, job, vec![registrar(""), registrar(""), domain()]).await;

        let err = h.reducer.reduce(job, &pending()).await.unwrap_err();
        assert!(matches!(err, Error::InvalidDeposit { failures: 2, .. }));
        assert_eq!(
            h.config.cursor_store().get("example", CursorType::RdeStaging).await.unwrap(),
            jan(1)
        );
        let paths = pending().key().paths("rde");
        assert!(h.backend.head(&paths.document).await.unwrap().is_none());
        assert!(h.queue.is_empty().unwrap());
    }

    #[derive(Clone, Default)]
    struct CapturedLog(Arc<std::sync::Mutex<Vec<u8>>>);

    impl std::io::Write for CapturedLog {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn invalid_snapshot_is_logged_with_its_contents() {
        let h = harness();
        let log = CapturedLog::default();
        let writer = log.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_ansi(false)
            .with_writer(move || writer.clone())
            .finish();

        let result = tracing::subscriber::with_default(subscriber, || {
            h.reducer
                .marshal_all(&pending().key(), &[registrar(""), domain()])
        });
        assert!(matches!(result, Err(Error::InvalidDeposit { failures: 1, .. })));

        let output = String::from_utf8(log.0.lock().unwrap().clone()).unwrap();
        assert!(output.contains("invalid resource in deposit"), "{output}");
        assert!(output.contains("repr=Registrar(RegistrarState"), "{output}");
        assert!(output.contains("registrar_id: \"TheRegistrar\""), "{output}");
    }

    #[tokio::test]
    async fn held_lock_skips_the_deposit() {
        let h = harness();
        let job = JobId::generate();
        seed(&h, job, vec![registrar("The Registrar")]).await;

        let locks = DepositLock::new(Arc::clone(&h.config.storage), h.config.settings.lock_ttl);
        let _guard = locks.acquire(&pending().key()).await.unwrap().expect("lock");
        assert_eq!(
            h.reducer.reduce(job, &pending()).await.unwrap(),
            ReduceOutcome::LockContended
        );
        assert_eq!(
            h.config.cursor_store().get("example", CursorType::RdeStaging).await.unwrap(),
            jan(1)
        );
    }
}
