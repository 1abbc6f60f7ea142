//! Time source and epoch-millisecond conversions.
//!
//! The remote API speaks integer milliseconds since the Unix epoch. The store
//! keeps a redundant RFC 3339 rendering next to each reading so that rows can
//! be inspected and filtered without decoding.

use std::sync::atomic::{AtomicI64, Ordering};

use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;

use crate::error::{ParseError, ParseResult};

/// Five minutes in milliseconds (the nominal station reporting interval).
pub const FIVE_MINUTES_MS: i64 = 5 * 60_000;
/// Thirty minutes in milliseconds.
pub const THIRTY_MINUTES_MS: i64 = 30 * 60_000;
/// Six hours in milliseconds.
pub const SIX_HOURS_MS: i64 = 6 * 60 * 60_000;
/// One day in milliseconds.
pub const ONE_DAY_MS: i64 = 24 * 60 * 60_000;

/// A source of "now", expressed in epoch milliseconds.
pub trait Clock: Send + Sync {
    /// Current time in milliseconds since the Unix epoch.
    fn now_millis(&self) -> i64;
}

/// Wall clock backed by the system time.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_millis(&self) -> i64 {
        datetime_to_millis(OffsetDateTime::now_utc())
    }
}

/// A manually driven clock, mostly useful in tests.
#[derive(Debug, Default)]
pub struct FixedClock {
    now: AtomicI64,
}

impl FixedClock {
    /// Create a clock frozen at `now_millis`.
    pub fn new(now_millis: i64) -> Self {
        Self {
            now: AtomicI64::new(now_millis),
        }
    }

    /// Move the clock to an absolute time.
    pub fn set(&self, now_millis: i64) {
        self.now.store(now_millis, Ordering::SeqCst);
    }

    /// Move the clock forward by `millis`.
    pub fn advance(&self, millis: i64) {
        self.now.fetch_add(millis, Ordering::SeqCst);
    }
}

impl Clock for FixedClock {
    fn now_millis(&self) -> i64 {
        self.now.load(Ordering::SeqCst)
    }
}

impl<C: Clock + ?Sized> Clock for std::sync::Arc<C> {
    fn now_millis(&self) -> i64 {
        (**self).now_millis()
    }
}

/// Convert epoch milliseconds to a UTC date-time.
pub fn millis_to_datetime(millis: i64) -> ParseResult<OffsetDateTime> {
    OffsetDateTime::from_unix_timestamp_nanos(i128::from(millis) * 1_000_000)
        .map_err(|_| ParseError::TimestampOutOfRange(millis))
}

/// Convert a date-time to epoch milliseconds.
pub fn datetime_to_millis(dt: OffsetDateTime) -> i64 {
    (dt.unix_timestamp_nanos() / 1_000_000) as i64
}

/// Render epoch milliseconds as an RFC 3339 string in UTC.
pub fn format_recorded_at(millis: i64) -> ParseResult<String> {
    millis_to_datetime(millis)?
        .format(&Rfc3339)
        .map_err(|_| ParseError::TimestampOutOfRange(millis))
}
