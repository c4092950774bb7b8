//! Pipeline configuration.
//!
//! [`StagingSettings`] holds plain values and can be loaded from `ESCROW_*`
//! environment variables. [`StagingConfig`] bundles the settings with the
//! collaborators the pipeline talks to.

use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, Utc, Weekday};

use escrow_core::lock::DEFAULT_LOCK_TTL;
use escrow_core::{Clock, StorageBackend, SystemClock};

use crate::crypto::Encryptor;
use crate::cursor::{CursorStore, DEFAULT_MAX_CAS_RETRIES};
use crate::error::{Error, Result};
use crate::marshal::{DepositMarshaller, JsonMarshaller};
use crate::pending::Schedule;
use crate::resource::ResourceStore;
use crate::upload::UploadQueue;

const ENV_RDE_INTERVAL_SECS: &str = "ESCROW_RDE_INTERVAL_SECS";
const ENV_BRDA_INTERVAL_SECS: &str = "ESCROW_BRDA_INTERVAL_SECS";
const ENV_BRDA_DAY_OF_WEEK: &str = "ESCROW_BRDA_DAY_OF_WEEK";
const ENV_TRANSACTION_COOLDOWN_SECS: &str = "ESCROW_TRANSACTION_COOLDOWN_SECS";
const ENV_LOCK_TTL_SECS: &str = "ESCROW_LOCK_TTL_SECS";
const ENV_MAP_CONCURRENCY: &str = "ESCROW_MAP_CONCURRENCY";
const ENV_REDUCE_CONCURRENCY: &str = "ESCROW_REDUCE_CONCURRENCY";
const ENV_MAX_TASK_ATTEMPTS: &str = "ESCROW_MAX_TASK_ATTEMPTS";
const ENV_STAGING_PREFIX: &str = "ESCROW_STAGING_PREFIX";
const ENV_INITIALIZE_MISSING_CURSORS: &str = "ESCROW_INITIALIZE_MISSING_CURSORS";
const ENV_CURSOR_EPOCH: &str = "ESCROW_CURSOR_EPOCH";

const DEFAULT_RDE_INTERVAL_SECS: u64 = 24 * 60 * 60;
const DEFAULT_BRDA_INTERVAL_SECS: u64 = 7 * 24 * 60 * 60;
const DEFAULT_TRANSACTION_COOLDOWN_SECS: u64 = 5 * 60;
const DEFAULT_MAP_CONCURRENCY: usize = 8;
const DEFAULT_REDUCE_CONCURRENCY: usize = 4;
const DEFAULT_MAX_TASK_ATTEMPTS: u32 = 3;
const DEFAULT_STAGING_PREFIX: &str = "rde";

/// Tunable settings of the staging pipeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagingSettings {
    /// Interval between full deposits.
    pub rde_interval: Duration,
    /// Interval between thin deposits.
    pub brda_interval: Duration,
    /// Weekday new thin cursors are aligned to.
    pub brda_day_of_week: Weekday,
    /// Minimum age of a watermark before it is deposited.
    pub transaction_cooldown: Duration,
    /// Deposit lock TTL.
    pub lock_ttl: StdDuration,
    /// Map tasks run at once.
    pub map_concurrency: usize,
    /// Reduce tasks run at once.
    pub reduce_concurrency: usize,
    /// Attempts per task for transient failures.
    pub max_task_attempts: u32,
    /// Storage prefix of deposit artifacts.
    pub staging_prefix: String,
    /// Whether missing cursors are created at today's schedule point.
    pub initialize_missing_cursors: bool,
    /// Position reported for cursors that were never written.
    pub cursor_epoch: DateTime<Utc>,
}

impl Default for StagingSettings {
    fn default() -> Self {
        Self {
            rde_interval: Duration::days(1),
            brda_interval: Duration::days(7),
            brda_day_of_week: Weekday::Tue,
            transaction_cooldown: Duration::minutes(5),
            lock_ttl: DEFAULT_LOCK_TTL,
            map_concurrency: DEFAULT_MAP_CONCURRENCY,
            reduce_concurrency: DEFAULT_REDUCE_CONCURRENCY,
            max_task_attempts: DEFAULT_MAX_TASK_ATTEMPTS,
            staging_prefix: DEFAULT_STAGING_PREFIX.to_string(),
            initialize_missing_cursors: true,
            cursor_epoch: DateTime::<Utc>::UNIX_EPOCH,
        }
    }
}

impl StagingSettings {
    /// Loads settings from the process environment.
    ///
    /// # Errors
    ///
    /// Returns a configuration error when a value is malformed or out of
    /// range.
    pub fn from_env() -> Result<Self> {
        Self::from_env_with(|key| std::env::var(key).ok())
    }

    /// Loads settings with a custom environment source.
    ///
    /// # Errors
    ///
    /// Returns a configuration error when a value is malformed or out of
    /// range.
    pub fn from_env_with<F>(get_env: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        let rde_interval = seconds(
            ENV_RDE_INTERVAL_SECS,
            parse_u64_env(&get_env, ENV_RDE_INTERVAL_SECS, DEFAULT_RDE_INTERVAL_SECS, false)?,
        )?;
        let brda_interval = seconds(
            ENV_BRDA_INTERVAL_SECS,
            parse_u64_env(&get_env, ENV_BRDA_INTERVAL_SECS, DEFAULT_BRDA_INTERVAL_SECS, false)?,
        )?;
        let transaction_cooldown = seconds(
            ENV_TRANSACTION_COOLDOWN_SECS,
            parse_u64_env(
                &get_env,
                ENV_TRANSACTION_COOLDOWN_SECS,
                DEFAULT_TRANSACTION_COOLDOWN_SECS,
                true,
            )?,
        )?;
        let lock_ttl = StdDuration::from_secs(parse_u64_env(
            &get_env,
            ENV_LOCK_TTL_SECS,
            defaults.lock_ttl.as_secs(),
            false,
        )?);

        let brda_day_of_week = match get_env(ENV_BRDA_DAY_OF_WEEK) {
            Some(raw) => raw.trim().parse::<Weekday>().map_err(|_| {
                Error::configuration(format!(
                    "{ENV_BRDA_DAY_OF_WEEK} must be a weekday name, got '{raw}'"
                ))
            })?,
            None => defaults.brda_day_of_week,
        };

        let initialize_missing_cursors = match get_env(ENV_INITIALIZE_MISSING_CURSORS) {
            Some(raw) => parse_bool(ENV_INITIALIZE_MISSING_CURSORS, &raw)?,
            None => defaults.initialize_missing_cursors,
        };

        let cursor_epoch = match get_env(ENV_CURSOR_EPOCH) {
            Some(raw) => DateTime::parse_from_rfc3339(raw.trim())
                .map_err(|e| {
                    Error::configuration(format!("{ENV_CURSOR_EPOCH} must be RFC 3339: {e}"))
                })?
                .with_timezone(&Utc),
            None => defaults.cursor_epoch,
        };

        let staging_prefix = get_env(ENV_STAGING_PREFIX)
            .map(|raw| raw.trim().trim_end_matches('/').to_string())
            .unwrap_or(defaults.staging_prefix);
        if staging_prefix.is_empty() {
            return Err(Error::configuration(format!(
                "{ENV_STAGING_PREFIX} must not be empty"
            )));
        }

        Ok(Self {
            rde_interval,
            brda_interval,
            brda_day_of_week,
            transaction_cooldown,
            lock_ttl,
            map_concurrency: to_usize(
                ENV_MAP_CONCURRENCY,
                parse_u64_env(
                    &get_env,
                    ENV_MAP_CONCURRENCY,
                    defaults.map_concurrency as u64,
                    false,
                )?,
            )?,
            reduce_concurrency: to_usize(
                ENV_REDUCE_CONCURRENCY,
                parse_u64_env(
                    &get_env,
                    ENV_REDUCE_CONCURRENCY,
                    defaults.reduce_concurrency as u64,
                    false,
                )?,
            )?,
            max_task_attempts: u32::try_from(parse_u64_env(
                &get_env,
                ENV_MAX_TASK_ATTEMPTS,
                u64::from(defaults.max_task_attempts),
                false,
            )?)
            .map_err(|_| {
                Error::configuration(format!("{ENV_MAX_TASK_ATTEMPTS} exceeds supported range"))
            })?,
            staging_prefix,
            initialize_missing_cursors,
            cursor_epoch,
        })
    }

    /// Schedule parameters for the pending deposit checker.
    #[must_use]
    pub fn schedule(&self) -> Schedule {
        Schedule {
            rde_interval: self.rde_interval,
            brda_interval: self.brda_interval,
            brda_day_of_week: self.brda_day_of_week,
            transaction_cooldown: self.transaction_cooldown,
            initialize_missing_cursors: self.initialize_missing_cursors,
        }
    }
}

fn parse_u64_env<F>(get_env: &F, key: &str, default: u64, allow_zero: bool) -> Result<u64>
where
    F: Fn(&str) -> Option<String>,
{
    let Some(raw) = get_env(key) else {
        return Ok(default);
    };

    let parsed = raw.trim().parse::<u64>().map_err(|_| {
        Error::configuration(format!("{key} must be a non-negative integer, got '{raw}'"))
    })?;
    if parsed == 0 && !allow_zero {
        return Err(Error::configuration(format!("{key} must be greater than zero")));
    }
    Ok(parsed)
}

fn parse_bool(key: &str, raw: &str) -> Result<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" => Ok(true),
        "0" | "false" | "no" => Ok(false),
        _ => Err(Error::configuration(format!(
            "{key} must be a boolean, got '{raw}'"
        ))),
    }
}

fn seconds(key: &str, value: u64) -> Result<Duration> {
    i64::try_from(value)
        .ok()
        .and_then(Duration::try_seconds)
        .ok_or_else(|| Error::configuration(format!("{key} value {value} exceeds supported range")))
}

fn to_usize(key: &str, value: u64) -> Result<usize> {
    usize::try_from(value)
        .map_err(|_| Error::configuration(format!("{key} value {value} exceeds supported range")))
}

/// Settings plus collaborator handles.
#[derive(Clone)]
pub struct StagingConfig {
    /// Tunable settings.
    pub settings: StagingSettings,
    /// Versioned registry data.
    pub resources: Arc<dyn ResourceStore>,
    /// Artifact, cursor, lock and shuffle storage.
    pub storage: Arc<dyn StorageBackend>,
    /// Artifact encryption.
    pub encryptor: Arc<dyn Encryptor>,
    /// Follow-on upload tasks.
    pub upload_queue: Arc<dyn UploadQueue>,
    /// Time source.
    pub clock: Arc<dyn Clock>,
    /// Snapshot marshalling and validation.
    pub marshaller: Arc<dyn DepositMarshaller>,
}

impl std::fmt::Debug for StagingConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StagingConfig")
            .field("settings", &self.settings)
            .field("clock", &self.clock)
            .finish_non_exhaustive()
    }
}

impl StagingConfig {
    /// Creates a configuration with the system clock and the JSON marshaller.
    #[must_use]
    pub fn new(
        settings: StagingSettings,
        resources: Arc<dyn ResourceStore>,
        storage: Arc<dyn StorageBackend>,
        encryptor: Arc<dyn Encryptor>,
        upload_queue: Arc<dyn UploadQueue>,
    ) -> Self {
        Self {
            settings,
            resources,
            storage,
            encryptor,
            upload_queue,
            clock: Arc::new(SystemClock),
            marshaller: Arc::new(JsonMarshaller),
        }
    }

    /// Replaces the time source.
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Replaces the marshaller.
    #[must_use]
    pub fn with_marshaller(mut self, marshaller: Arc<dyn DepositMarshaller>) -> Self {
        self.marshaller = marshaller;
        self
    }

    /// Cursor store over the configured storage.
    #[must_use]
    pub fn cursor_store(&self) -> CursorStore {
        CursorStore::new(Arc::clone(&self.storage), Arc::clone(&self.clock))
            .with_epoch(self.settings.cursor_epoch)
            .with_cas_retries(DEFAULT_MAX_CAS_RETRIES)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_apply_when_unset() {
        let settings = StagingSettings::from_env_with(env(&[])).unwrap();
        assert_eq!(settings, StagingSettings::default());
        assert_eq!(settings.rde_interval, Duration::days(1));
        assert_eq!(settings.brda_day_of_week, Weekday::Tue);
        assert_eq!(settings.map_concurrency, DEFAULT_MAP_CONCURRENCY);
        assert_eq!(settings.reduce_concurrency, DEFAULT_REDUCE_CONCURRENCY);
        assert_eq!(settings.max_task_attempts, DEFAULT_MAX_TASK_ATTEMPTS);
    }

    #[test]
    fn values_are_parsed() {
        let settings = StagingSettings::from_env_with(env(&[
            (ENV_RDE_INTERVAL_SECS, "3600"),
            (ENV_BRDA_DAY_OF_WEEK, "friday"),
            (ENV_TRANSACTION_COOLDOWN_SECS, "0"),
            (ENV_MAP_CONCURRENCY, "2"),
            (ENV_STAGING_PREFIX, "deposits/"),
            (ENV_INITIALIZE_MISSING_CURSORS, "false"),
            (ENV_CURSOR_EPOCH, "2024-01-01T00:00:00Z"),
        ]))
        .unwrap();
        assert_eq!(settings.rde_interval, Duration::hours(1));
        assert_eq!(settings.brda_day_of_week, Weekday::Fri);
        assert_eq!(settings.transaction_cooldown, Duration::zero());
        assert_eq!(settings.map_concurrency, 2);
        assert_eq!(settings.staging_prefix, "deposits");
        assert!(!settings.initialize_missing_cursors);
        assert_eq!(settings.cursor_epoch.to_rfc3339(), "2024-01-01T00:00:00+00:00");
    }

    #[test]
    fn invalid_values_are_rejected() {
        for (key, value) in [
            (ENV_RDE_INTERVAL_SECS, "0"),
            (ENV_BRDA_INTERVAL_SECS, "-1"),
            (ENV_BRDA_DAY_OF_WEEK, "someday"),
            (ENV_MAX_TASK_ATTEMPTS, "99999999999"),
            (ENV_INITIALIZE_MISSING_CURSORS, "maybe"),
            (ENV_STAGING_PREFIX, "/"),
        ] {
            let err = StagingSettings::from_env_with(env(&[(key, value)])).unwrap_err();
            assert!(matches!(err, Error::Configuration { .. }), "{key}={value}");
        }
    }
}
