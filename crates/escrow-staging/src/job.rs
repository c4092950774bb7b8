//! In-process map/shuffle/reduce job runner.
//!
//! A job runs one map task per index shard plus the registrar pseudo-shard,
//! waits for all of them, then runs one reduce task per pending deposit.
//! Tasks failing with transient errors are retried with exponential backoff;
//! other errors end the task immediately. If any map task fails, no deposit
//! of the job is reduced.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use futures::stream;
use tokio::task::JoinHandle;
use tracing::Instrument;

use escrow_core::JobId;
use escrow_core::observability::job_span;

use crate::config::{StagingConfig, StagingSettings};
use crate::deposit::{DepositArtifact, DepositKey};
use crate::error::{Error, Result};
use crate::mapper::{MapOutput, Mapper};
use crate::metrics::StagingMetrics;
use crate::pending::PendingDeposit;
use crate::reducer::{ReduceOutcome, Reducer};
use crate::resource::ResourceStore;
use crate::shuffle::{MapShard, ShuffleStore};

const RETRY_BASE: Duration = Duration::from_millis(50);
const RETRY_MAX: Duration = Duration::from_secs(5);

/// Final state of one deposit in a job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DepositOutcome {
    /// Staged and the cursor advanced.
    Completed(DepositArtifact),
    /// Already staged by an earlier run.
    AlreadyCompleted,
    /// Another reducer held the deposit lock.
    LockContended,
    /// The deposit was not staged; the cursor did not move.
    Failed(String),
}

impl DepositOutcome {
    /// Short label for logs and metrics.
    #[must_use]
    pub const fn label(&self) -> &'static str {
        match self {
            Self::Completed(_) => "completed",
            Self::AlreadyCompleted => "already_completed",
            Self::LockContended => "lock_contended",
            Self::Failed(_) => "failed",
        }
    }

    /// Returns true unless the deposit failed.
    #[must_use]
    pub const fn is_ok(&self) -> bool {
        !matches!(self, Self::Failed(_))
    }
}

impl From<ReduceOutcome> for DepositOutcome {
    fn from(outcome: ReduceOutcome) -> Self {
        match outcome {
            ReduceOutcome::Completed(artifact) => Self::Completed(artifact),
            ReduceOutcome::AlreadyCompleted => Self::AlreadyCompleted,
            ReduceOutcome::LockContended => Self::LockContended,
        }
    }
}

/// Result of a finished job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobReport {
    /// Job identifier.
    pub job_id: JobId,
    /// Outcome per deposit.
    pub outcomes: BTreeMap<DepositKey, DepositOutcome>,
}

impl JobReport {
    /// Outcome of one deposit.
    #[must_use]
    pub fn outcome(&self, key: &DepositKey) -> Option<&DepositOutcome> {
        self.outcomes.get(key)
    }

    /// Returns true if no deposit failed.
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.outcomes.values().all(DepositOutcome::is_ok)
    }

    /// Deposits that failed, with their reasons.
    pub fn failures(&self) -> impl Iterator<Item = (&DepositKey, &str)> {
        self.outcomes.iter().filter_map(|(key, outcome)| match outcome {
            DepositOutcome::Failed(reason) => Some((key, reason.as_str())),
            _ => None,
        })
    }
}

/// Handle to a launched job.
#[derive(Debug)]
pub struct JobHandle {
    job_id: JobId,
    deposits: Vec<DepositKey>,
    handle: JoinHandle<JobReport>,
}

impl JobHandle {
    /// Job identifier.
    #[must_use]
    pub const fn job_id(&self) -> JobId {
        self.job_id
    }

    /// Deposits the job was launched for.
    #[must_use]
    pub fn deposits(&self) -> &[DepositKey] {
        &self.deposits
    }

    /// Waits for the job to finish.
    ///
    /// # Errors
    ///
    /// Returns `Error::TaskFailed` if the job task panicked.
    pub async fn wait(self) -> Result<JobReport> {
        self.handle.await.map_err(|e| Error::TaskFailed {
            task: format!("job {}", self.job_id),
            attempts: 1,
            message: e.to_string(),
        })
    }
}

/// One staging job over a fixed set of pending deposits.
#[derive(Clone)]
pub struct StagingJob {
    job_id: JobId,
    pending: Vec<PendingDeposit>,
    resources: Arc<dyn ResourceStore>,
    mapper: Mapper,
    reducer: Reducer,
    shuffle: ShuffleStore,
    settings: StagingSettings,
    metrics: StagingMetrics,
}

impl std::fmt::Debug for StagingJob {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StagingJob")
            .field("job_id", &self.job_id)
            .field("pending", &self.pending)
            .finish_non_exhaustive()
    }
}

impl StagingJob {
    /// Creates a job for `pending`.
    #[must_use]
    pub fn new(config: &StagingConfig, pending: Vec<PendingDeposit>) -> Self {
        let shuffle = ShuffleStore::new(Arc::clone(&config.storage));
        Self {
            job_id: JobId::generate(),
            pending,
            resources: Arc::clone(&config.resources),
            mapper: Mapper::new(Arc::clone(&config.resources), shuffle.clone()),
            reducer: Reducer::new(config),
            shuffle,
            settings: config.settings.clone(),
            metrics: StagingMetrics::new(),
        }
    }

    /// Job identifier.
    #[must_use]
    pub const fn job_id(&self) -> JobId {
        self.job_id
    }

    /// Runs the job on the current Tokio runtime and returns a handle.
    #[must_use]
    pub fn spawn(self) -> JobHandle {
        let job_id = self.job_id;
        let deposits = self.pending.iter().map(PendingDeposit::key).collect();
        let handle = tokio::spawn(self.run());
        JobHandle {
            job_id,
            deposits,
            handle,
        }
    }

    /// Runs the job to completion.
    pub async fn run(self) -> JobReport {
        let span = job_span("run", &self.job_id.to_string());
        self.run_in_span().instrument(span).await
    }

    async fn run_in_span(mut self) -> JobReport {
        tracing::info!(deposits = self.pending.len(), "job started");
        let outcomes = match self.map_phase().await {
            Ok(emitted) => {
                for deposit in &mut self.pending {
                    deposit.size_hint = Some(emitted.get(&deposit.key()).copied().unwrap_or(0));
                }
                self.reduce_phase().await
            }
            Err(e) => {
                tracing::error!(error = %e, "map phase failed; no deposit staged");
                let reason = format!("map phase failed: {e}");
                self.pending
                    .iter()
                    .map(|p| (p.key(), DepositOutcome::Failed(reason.clone())))
                    .collect()
            }
        };

        if let Err(e) = self.shuffle.clear_job(self.job_id).await {
            tracing::warn!(error = %e, "failed to clear shuffle output");
        }
        for (key, outcome) in &outcomes {
            self.metrics.record_deposit(key.mode, outcome.label());
        }

        let report = JobReport {
            job_id: self.job_id,
            outcomes,
        };
        tracing::info!(success = report.is_success(), "job finished");
        report
    }

    async fn map_phase(&self) -> Result<BTreeMap<DepositKey, u64>> {
        let max_attempts = self.settings.max_task_attempts;
        let shards = retry_task("list shards", max_attempts, "map", self.metrics, || {
            self.resources.shards()
        })
        .await?;

        let tasks: Vec<MapShard> = std::iter::once(MapShard::Registrars)
            .chain(shards.into_iter().map(MapShard::Index))
            .collect();
        tracing::info!(tasks = tasks.len(), "starting map phase");

        let job_id = self.job_id;
        let metrics = self.metrics;
        let pending: Arc<[PendingDeposit]> = self.pending.clone().into();
        let results: Vec<(MapShard, Result<MapOutput>)> = stream::iter(tasks)
            .map(|shard| {
                let mapper = self.mapper.clone();
                let pending = Arc::clone(&pending);
                async move {
                    let label = format!("map {shard}");
                    let result = retry_task(&label, max_attempts, "map", metrics, || {
                        mapper.map_shard(job_id, shard, &pending)
                    })
                    .await;
                    (shard, result)
                }
            })
            .buffer_unordered(self.settings.map_concurrency.max(1))
            .collect()
            .await;

        let mut emitted: BTreeMap<DepositKey, u64> = BTreeMap::new();
        let mut first_error = None;
        for (shard, result) in results {
            match result {
                Ok(output) => {
                    self.metrics.record_snapshots(&shard.to_string(), output.total());
                    for (key, count) in output.emitted {
                        *emitted.entry(key).or_insert(0) += count;
                    }
                }
                Err(e) => {
                    tracing::error!(%shard, error = %e, "map task failed");
                    first_error.get_or_insert(e);
                }
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(emitted),
        }
    }

    async fn reduce_phase(&self) -> BTreeMap<DepositKey, DepositOutcome> {
        let mut ordered = self.pending.clone();
        ordered.sort_by(|a, b| b.size_hint.cmp(&a.size_hint).then_with(|| a.key().cmp(&b.key())));

        let job_id = self.job_id;
        let metrics = self.metrics;
        let max_attempts = self.settings.max_task_attempts;
        stream::iter(ordered)
            .map(|deposit| {
                let reducer = self.reducer.clone();
                async move {
                    let key = deposit.key();
                    let label = format!("reduce {key}");
                    let result = retry_task(&label, max_attempts, "reduce", metrics, || {
                        reducer.reduce(job_id, &deposit)
                    })
                    .await;
                    let outcome = match result {
                        Ok(outcome) => DepositOutcome::from(outcome),
                        Err(e) => {
                            tracing::error!(deposit = %key, error = %e, "deposit failed");
                            DepositOutcome::Failed(e.to_string())
                        }
                    };
                    (key, outcome)
                }
            })
            .buffer_unordered(self.settings.reduce_concurrency.max(1))
            .collect()
            .await
    }
}

/// Runs `op`, retrying transient failures up to `max_attempts` times.
async fn retry_task<T, F, Fut>(
    task: &str,
    max_attempts: u32,
    phase: &'static str,
    metrics: StagingMetrics,
    mut op: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let max_attempts = max_attempts.max(1);
    let mut attempt = 1;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_transient() && attempt < max_attempts => {
                tracing::warn!(task, attempt, error = %e, "transient task failure; retrying");
                metrics.record_retry(phase);
                let delay = RETRY_BASE
                    .saturating_mul(1 << attempt.min(16))
                    .min(RETRY_MAX);
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) if e.is_transient() => {
                return Err(Error::TaskFailed {
                    task: task.to_string(),
                    attempts: attempt,
                    message: e.to_string(),
                });
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test(start_paused = true)]
    async fn transient_errors_are_retried_until_success() {
        let calls = &AtomicU32::new(0);
        let value = retry_task("t", 3, "map", StagingMetrics::new(), || async move {
            if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(Error::storage("flaky"))
            } else {
                Ok(7)
            }
        })
        .await
        .unwrap();
        assert_eq!(value, 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_retries_become_task_failures() {
        let calls = &AtomicU32::new(0);
        let err = retry_task("map shard-0001", 2, "map", StagingMetrics::new(), || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Err::<(), _>(Error::storage("down"))
        })
        .await
        .unwrap_err();
        assert!(matches!(err, Error::TaskFailed { attempts: 2, .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn data_errors_are_not_retried() {
        let calls = &AtomicU32::new(0);
        let err = retry_task("reduce", 5, "reduce", StagingMetrics::new(), || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Err::<(), _>(Error::InvalidDeposit {
                deposit: "example/full/2024-01-01T00:00:00Z".into(),
                failures: 1,
            })
        })
        .await
        .unwrap_err();
        assert!(matches!(err, Error::InvalidDeposit { .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn report_summarizes_failures() {
        use crate::mode::DepositMode;
        use chrono::{TimeZone, Utc};

        let at = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let full = DepositKey::new("example", DepositMode::Full, at);
        let thin = DepositKey::new("example", DepositMode::Thin, at);
        let report = JobReport {
            job_id: JobId::generate(),
            outcomes: BTreeMap::from([
                (full.clone(), DepositOutcome::AlreadyCompleted),
                (thin.clone(), DepositOutcome::Failed("bad".into())),
            ]),
        };
        assert!(!report.is_success());
        assert_eq!(report.failures().collect::<Vec<_>>(), vec![(&thin, "bad")]);
        assert_eq!(report.outcome(&full), Some(&DepositOutcome::AlreadyCompleted));
    }
}
