//! Entry point of a staging run.

use chrono::{DateTime, Utc};

use crate::config::StagingConfig;
use crate::cursor::CursorStore;
use crate::error::Result;
use crate::job::{JobHandle, StagingJob};
use crate::metrics::StagingMetrics;
use crate::pending::{PendingDeposit, PendingDepositChecker};

/// Message returned when nothing is due.
pub const NOTHING_PENDING: &str = "no deposits pending";

/// Result of [`StagingAction::run`].
#[derive(Debug)]
pub enum StagingOutcome {
    /// Nothing was due; no job was launched.
    NoContent {
        /// Human-readable reason.
        message: String,
    },
    /// A job was launched in the background.
    JobLaunched(JobHandle),
}

/// Orchestrates one staging run: finds due deposits and launches a job.
#[derive(Debug, Clone)]
pub struct StagingAction {
    config: StagingConfig,
    cursors: CursorStore,
    checker: PendingDepositChecker,
    metrics: StagingMetrics,
}

impl StagingAction {
    /// Creates an action from the pipeline configuration.
    #[must_use]
    pub fn new(config: StagingConfig) -> Self {
        let cursors = config.cursor_store();
        let checker = PendingDepositChecker::new(
            std::sync::Arc::clone(&config.resources),
            cursors.clone(),
            config.settings.schedule(),
        );
        Self {
            config,
            cursors,
            checker,
            metrics: StagingMetrics::new(),
        }
    }

    /// Runs once: relays leftover staged uploads, computes pending deposits
    /// and launches a job for those outside the cooldown window.
    ///
    /// Returns without waiting for the job.
    ///
    /// # Errors
    ///
    /// Returns an error if pending deposits could not be computed.
    #[tracing::instrument(skip(self))]
    pub async fn run(&self) -> Result<StagingOutcome> {
        let now = self.config.clock.now();

        match self.cursors.relay_all(self.config.upload_queue.as_ref()).await {
            Ok(0) => {}
            Ok(relayed) => {
                tracing::info!(relayed, "relayed staged uploads from an earlier run");
                self.metrics.record_relayed(relayed);
            }
            Err(e) => tracing::warn!(error = %e, "failed to relay staged uploads"),
        }

        let pending = self.checker.compute_pending(now).await?;
        let due = self.outside_cooldown(pending, now);
        self.metrics.set_pending(due.len());

        if due.is_empty() {
            tracing::info!("{NOTHING_PENDING}");
            return Ok(StagingOutcome::NoContent {
                message: NOTHING_PENDING.to_string(),
            });
        }

        for deposit in &due {
            tracing::info!(
                tld = %deposit.tld,
                mode = %deposit.mode,
                watermark = %deposit.watermark,
                "deposit pending"
            );
        }
        let job = StagingJob::new(&self.config, due);
        tracing::info!(job_id = %job.job_id(), "launching staging job");
        Ok(StagingOutcome::JobLaunched(job.spawn()))
    }

    fn outside_cooldown(
        &self,
        pending: Vec<PendingDeposit>,
        now: DateTime<Utc>,
    ) -> Vec<PendingDeposit> {
        let cooldown = self.config.settings.transaction_cooldown;
        pending
            .into_iter()
            .filter(|deposit| {
                let ready = now >= deposit.watermark + cooldown;
                if !ready {
                    tracing::warn!(
                        tld = %deposit.tld,
                        mode = %deposit.mode,
                        watermark = %deposit.watermark,
                        "dropping deposit inside cooldown window"
                    );
                }
                ready
            })
            .collect()
    }
}
