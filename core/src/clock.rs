//! Clock abstraction so that every expiry decision is testable.

use chrono::{DateTime, Utc};

/// Source of the current time.
///
/// Hold expiry, ledger retention and cache TTLs all read time through this
/// trait; tests inject a fixed or steppable clock instead of sleeping.
pub trait Clock: Send + Sync {
    /// Current instant in UTC.
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
