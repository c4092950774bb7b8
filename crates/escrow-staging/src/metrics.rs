//! Metrics for the staging pipeline.
//!
//! Recorded through the `metrics` facade; the embedding process installs the
//! exporter.
//!
//! | Metric | Type | Labels |
//! |--------|------|--------|
//! | `escrow_staging_deposits_total` | Counter | `mode`, `outcome` |
//! | `escrow_staging_pending_deposits` | Gauge | - |
//! | `escrow_staging_snapshots_emitted_total` | Counter | `shard` |
//! | `escrow_staging_task_retries_total` | Counter | `phase` |
//! | `escrow_staging_reduce_duration_seconds` | Histogram | `mode` |
//! | `escrow_staging_uploads_relayed_total` | Counter | - |

use std::time::{Duration, Instant};

use metrics::{counter, gauge, histogram};

use crate::mode::DepositMode;

/// Metric names.
pub mod names {
    /// Counter: finished deposits by outcome.
    pub const DEPOSITS_TOTAL: &str = "escrow_staging_deposits_total";
    /// Gauge: deposits found pending by the last run.
    pub const PENDING_DEPOSITS: &str = "escrow_staging_pending_deposits";
    /// Counter: snapshots written to the shuffle store.
    pub const SNAPSHOTS_EMITTED_TOTAL: &str = "escrow_staging_snapshots_emitted_total";
    /// Counter: map and reduce task retries.
    pub const TASK_RETRIES_TOTAL: &str = "escrow_staging_task_retries_total";
    /// Histogram: reduce duration in seconds.
    pub const REDUCE_DURATION_SECONDS: &str = "escrow_staging_reduce_duration_seconds";
    /// Counter: staged upload requests relayed to the queue.
    pub const UPLOADS_RELAYED_TOTAL: &str = "escrow_staging_uploads_relayed_total";
}

/// Label keys.
pub mod labels {
    /// Deposit mode (full, thin).
    pub const MODE: &str = "mode";
    /// Deposit outcome.
    pub const OUTCOME: &str = "outcome";
    /// Map shard label.
    pub const SHARD: &str = "shard";
    /// Job phase (map, reduce).
    pub const PHASE: &str = "phase";
}

/// Records staging metrics.
#[derive(Debug, Clone, Copy, Default)]
pub struct StagingMetrics;

impl StagingMetrics {
    /// Creates a recorder.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Counts a finished deposit.
    pub fn record_deposit(&self, mode: DepositMode, outcome: &str) {
        counter!(
            names::DEPOSITS_TOTAL,
            labels::MODE => mode.as_str(),
            labels::OUTCOME => outcome.to_string(),
        )
        .increment(1);
    }

    /// Sets the number of pending deposits.
    #[allow(clippy::cast_precision_loss)]
    pub fn set_pending(&self, count: usize) {
        gauge!(names::PENDING_DEPOSITS).set(count as f64);
    }

    /// Counts snapshots a map task emitted.
    pub fn record_snapshots(&self, shard: &str, count: u64) {
        counter!(
            names::SNAPSHOTS_EMITTED_TOTAL,
            labels::SHARD => shard.to_string(),
        )
        .increment(count);
    }

    /// Counts a task retry.
    pub fn record_retry(&self, phase: &'static str) {
        counter!(names::TASK_RETRIES_TOTAL, labels::PHASE => phase).increment(1);
    }

    /// Records how long a reduce took.
    pub fn observe_reduce(&self, mode: DepositMode, duration: Duration) {
        histogram!(names::REDUCE_DURATION_SECONDS, labels::MODE => mode.as_str())
            .record(duration.as_secs_f64());
    }

    /// Counts relayed upload requests.
    pub fn record_relayed(&self, count: usize) {
        counter!(names::UPLOADS_RELAYED_TOTAL).increment(count as u64);
    }

    /// Starts timing a reduce; the duration is recorded when the timer drops.
    #[must_use]
    pub fn time_reduce(&self, mode: DepositMode) -> ReduceTimer {
        ReduceTimer {
            mode,
            start: Instant::now(),
        }
    }
}

/// Records reduce duration on drop.
#[derive(Debug)]
pub struct ReduceTimer {
    mode: DepositMode,
    start: Instant,
}

impl Drop for ReduceTimer {
    fn drop(&mut self) {
        StagingMetrics.observe_reduce(self.mode, self.start.elapsed());
    }
}
