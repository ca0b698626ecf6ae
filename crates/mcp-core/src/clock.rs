//! Time source used by every module that reasons about age or expiry.
//!
//! Production code uses [`SystemClock`]. Tests drive a [`ManualClock`] forward
//! instead of sleeping.

use chrono::{DateTime, Duration, Utc};
use std::sync::{Arc, Mutex};

/// Source of the current UTC time.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// Wall-clock time.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Shared handle to the system clock.
pub fn system_clock() -> Arc<dyn Clock> {
    Arc::new(SystemClock)
}

/// A clock that only moves when told to.
#[derive(Debug, Clone)]
pub struct ManualClock {
    now: Arc<Mutex<DateTime<Utc>>>,
}

impl ManualClock {
    /// Start at the current wall-clock time.
    pub fn new() -> Self {
        Self::starting_at(Utc::now())
    }

    pub fn starting_at(start: DateTime<Utc>) -> Self {
        Self {
            now: Arc::new(Mutex::new(start)),
        }
    }

    /// Move the clock forward.
    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock().unwrap_or_else(|e| e.into_inner());
        *now += by;
    }

    pub fn set(&self, to: DateTime<Utc>) {
        let mut now = self.now.lock().unwrap_or_else(|e| e.into_inner());
        *now = to;
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Parse an RFC 3339 / ISO-8601 timestamp.
pub fn parse_datetime(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

/// Longest span any configured window converts to, about a thousand years.
const MAX_SPAN_WEEKS: i64 = 52 * 1000;

/// Convert a std duration into a chrono duration, saturating at a thousand years
/// so it can always be added to the current time.
pub fn to_chrono(d: std::time::Duration) -> Duration {
    let max = Duration::weeks(MAX_SPAN_WEEKS);
    Duration::from_std(d).map_or(max, |span| span.min(max))
}

/// `minutes` as a chrono duration, saturating like [`to_chrono`].
pub fn minutes(minutes: u64) -> Duration {
    to_chrono(std::time::Duration::from_secs(minutes.saturating_mul(60)))
}

/// `hours` as a chrono duration, saturating like [`to_chrono`].
pub fn hours(hours: u64) -> Duration {
    to_chrono(std::time::Duration::from_secs(hours.saturating_mul(3600)))
}
