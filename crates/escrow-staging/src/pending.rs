//! Decides which deposits are due.
//!
//! For every escrow-enabled TLD and both cursor types the cursor position is
//! the watermark of the next deposit. A deposit is pending once the cooldown
//! after its watermark has elapsed, so no transaction committed before the
//! watermark can still be in flight. Cursors are never advanced here.

use std::sync::Arc;

use chrono::{DateTime, Datelike, Duration, Utc, Weekday};

use crate::cursor::CursorStore;
use crate::deposit::DepositKey;
use crate::error::Result;
use crate::mode::{CursorType, DepositMode};
use crate::resource::ResourceStore;

/// A deposit due for generation.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PendingDeposit {
    /// TLD to deposit.
    pub tld: String,
    /// Deposit mode.
    pub mode: DepositMode,
    /// Point in time to capture.
    pub watermark: DateTime<Utc>,
    /// Distance the cursor moves once the deposit completes.
    pub interval: Duration,
    /// Relative size estimate used to schedule larger reduces first.
    pub size_hint: Option<u64>,
}

impl PendingDeposit {
    /// Identity of the deposit.
    #[must_use]
    pub fn key(&self) -> DepositKey {
        DepositKey::new(self.tld.clone(), self.mode, self.watermark)
    }

    /// Cursor gating this deposit.
    #[must_use]
    pub const fn cursor_type(&self) -> CursorType {
        self.mode.cursor_type()
    }

    /// Cursor position after the deposit completes.
    #[must_use]
    pub fn next_watermark(&self) -> DateTime<Utc> {
        self.watermark + self.interval
    }
}

/// Schedule parameters for the checker.
#[derive(Debug, Clone)]
pub struct Schedule {
    /// Interval between full deposits.
    pub rde_interval: Duration,
    /// Interval between thin deposits.
    pub brda_interval: Duration,
    /// Weekday thin deposits are aligned to.
    pub brda_day_of_week: Weekday,
    /// Minimum age of a watermark before it is deposited.
    pub transaction_cooldown: Duration,
    /// Whether missing cursors are created at today's schedule point.
    pub initialize_missing_cursors: bool,
}

impl Schedule {
    /// Interval of the given cursor type.
    #[must_use]
    pub const fn interval(&self, cursor_type: CursorType) -> Duration {
        match cursor_type {
            CursorType::RdeStaging => self.rde_interval,
            CursorType::Brda => self.brda_interval,
        }
    }

    /// Where a new cursor of `cursor_type` starts, given the current time:
    /// midnight today, moved forward to the thin-deposit weekday for BRDA.
    #[must_use]
    pub fn starting_point(&self, cursor_type: CursorType, now: DateTime<Utc>) -> DateTime<Utc> {
        let mut date = now.date_naive();
        if cursor_type == CursorType::Brda {
            while date.weekday() != self.brda_day_of_week {
                match date.succ_opt() {
                    Some(next) => date = next,
                    None => break,
                }
            }
        }
        date.and_time(chrono::NaiveTime::MIN).and_utc()
    }
}

/// Computes the set of pending deposits.
#[derive(Clone)]
pub struct PendingDepositChecker {
    resources: Arc<dyn ResourceStore>,
    cursors: CursorStore,
    schedule: Schedule,
}

impl std::fmt::Debug for PendingDepositChecker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingDepositChecker")
            .field("schedule", &self.schedule)
            .finish_non_exhaustive()
    }
}

impl PendingDepositChecker {
    /// Creates a checker.
    #[must_use]
    pub fn new(
        resources: Arc<dyn ResourceStore>,
        cursors: CursorStore,
        schedule: Schedule,
    ) -> Self {
        Self {
            resources,
            cursors,
            schedule,
        }
    }

    /// Returns every deposit due at `now`, ordered by TLD then mode.
    ///
    /// # Errors
    ///
    /// Returns an error if TLDs or cursors could not be read, or a missing
    /// cursor could not be initialized.
    pub async fn compute_pending(&self, now: DateTime<Utc>) -> Result<Vec<PendingDeposit>> {
        let mut partitions = self.resources.partitions().await?;
        partitions.sort_by(|a, b| a.tld.cmp(&b.tld));

        let mut pending = Vec::new();
        for partition in partitions.into_iter().filter(|p| p.escrow_enabled) {
            for cursor_type in CursorType::ALL {
                let watermark = self.watermark(&partition.tld, cursor_type, now).await?;
                if now < watermark + self.schedule.transaction_cooldown {
                    tracing::debug!(
                        tld = %partition.tld,
                        %cursor_type,
                        %watermark,
                        "deposit not yet due"
                    );
                    continue;
                }
                pending.push(PendingDeposit {
                    tld: partition.tld.clone(),
                    mode: cursor_type.mode(),
                    watermark,
                    interval: self.schedule.interval(cursor_type),
                    size_hint: None,
                });
            }
        }
        Ok(pending)
    }

    async fn watermark(
        &self,
        tld: &str,
        cursor_type: CursorType,
        now: DateTime<Utc>,
    ) -> Result<DateTime<Utc>> {
        if let Some(position) = self.cursors.get_raw(tld, cursor_type).await? {
            return Ok(position);
        }
        if !self.schedule.initialize_missing_cursors {
            return Ok(self.cursors.epoch());
        }
        let start = self.schedule.starting_point(cursor_type, now);
        self.cursors.initialize(tld, cursor_type, start).await
    }
}
