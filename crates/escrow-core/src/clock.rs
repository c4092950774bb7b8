//! Injectable time source.
//!
//! Schedule and cooldown arithmetic never reads the system clock directly;
//! it goes through [`Clock`] so tests can pin "now" to an exact instant.

use std::fmt;
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Duration, Utc};

use crate::error::{Error, Result};

/// Abstraction over wall-clock time.
pub trait Clock: Send + Sync + fmt::Debug {
    /// Returns the current UTC instant.
    fn now(&self) -> DateTime<Utc>;
}

/// Production clock backed by the system time.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Manually driven clock for tests.
///
/// Clones share the same underlying instant.
#[derive(Debug, Clone)]
pub struct FakeClock {
    now: Arc<RwLock<DateTime<Utc>>>,
}

impl FakeClock {
    /// Creates a clock frozen at `now`.
    #[must_use]
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            now: Arc::new(RwLock::new(now)),
        }
    }

    /// Creates a clock frozen at an RFC 3339 timestamp.
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidInput` if the timestamp does not parse.
    pub fn at_rfc3339(timestamp: &str) -> Result<Self> {
        let parsed = DateTime::parse_from_rfc3339(timestamp)
            .map_err(|e| Error::InvalidInput(format!("invalid timestamp '{timestamp}': {e}")))?;
        Ok(Self::new(parsed.with_timezone(&Utc)))
    }

    /// Moves the clock to `now`.
    pub fn set(&self, now: DateTime<Utc>) {
        match self.now.write() {
            Ok(mut guard) => *guard = now,
            Err(poisoned) => *poisoned.into_inner() = now,
        }
    }

    /// Advances the clock by `delta`.
    pub fn advance(&self, delta: Duration) {
        let next = self.now() + delta;
        self.set(next);
    }
}

impl Clock for FakeClock {
    fn now(&self) -> DateTime<Utc> {
        match self.now.read() {
            Ok(guard) => *guard,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fake_clock_is_shared_between_clones() {
        let clock = FakeClock::at_rfc3339("2024-01-01T00:00:00Z").expect("parse");
        let other = clock.clone();
        other.advance(Duration::hours(25));
        assert_eq!(clock.now().to_rfc3339(), "2024-01-02T01:00:00+00:00");
    }

    #[test]
    fn fake_clock_rejects_garbage() {
        assert!(FakeClock::at_rfc3339("yesterday").is_err());
    }

    #[test]
    fn system_clock_moves_forward() {
        let clock = SystemClock;
        let a = clock.now();
        let b = clock.now();
        assert!(b >= a);
    }
}
