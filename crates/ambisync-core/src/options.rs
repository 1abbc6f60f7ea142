//! Tunables for the synchronization algorithm.
//!
//! The defaults describe a station that reports every five minutes behind an
//! API that serves at most one day (288 records) per request and allows
//! roughly one request per second.

use std::time::Duration;

use ambisync_types::{FIVE_MINUTES_MS, ONE_DAY_MS, SIX_HOURS_MS, THIRTY_MINUTES_MS};

use crate::error::{Error, Result};

/// Default page size: one day of five-minute records.
pub const DEFAULT_PAGE_LIMIT: u32 = 288;

/// Default catch-up threshold, in missed reporting intervals (~23.5 hours).
pub const DEFAULT_CATCH_UP_THRESHOLD: i64 = 282;

/// Configuration for [`SyncEngine`](crate::SyncEngine) and
/// [`GapAwareFetcher`](crate::GapAwareFetcher).
#[derive(Debug, Clone, PartialEq)]
pub struct SyncOptions {
    /// Where the search starts for a device with no stored readings.
    pub history_start_millis: i64,
    /// Maximum records requested per remote call.
    pub page_limit: u32,
    /// How far the window advances after an empty probe.
    pub gap_skip_millis: i64,
    /// Nominal interval between device reports.
    pub report_interval_millis: i64,
    /// Missed reports after which the search jumps forward from the
    /// high-water mark instead of looking back from now.
    pub catch_up_threshold: i64,
    /// Offset from the high-water mark used once the threshold is exceeded.
    pub catch_up_lookahead_millis: i64,
    /// Span of stored readings loaded as the deduplication reference.
    pub lookback_millis: i64,
    /// Pause between consecutive gap-skip probes.
    pub probe_delay: Duration,
    /// Pause between consecutive devices in a pass.
    pub device_delay: Duration,
    /// Wall-clock allowance for one device's gap search within a pass.
    ///
    /// When it runs out the search stops between probes and resumes from
    /// the same point on the next pass.
    pub search_budget: Option<Duration>,
    /// Hard limit on one device's whole sync within a pass.
    pub device_timeout: Option<Duration>,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            history_start_millis: 0,
            page_limit: DEFAULT_PAGE_LIMIT,
            gap_skip_millis: SIX_HOURS_MS,
            report_interval_millis: FIVE_MINUTES_MS,
            catch_up_threshold: DEFAULT_CATCH_UP_THRESHOLD,
            catch_up_lookahead_millis: ONE_DAY_MS - THIRTY_MINUTES_MS,
            lookback_millis: ONE_DAY_MS,
            probe_delay: Duration::from_secs(1),
            device_delay: Duration::from_secs(1),
            search_budget: None,
            device_timeout: None,
        }
    }
}

impl SyncOptions {
    /// Default options with the given history start.
    pub fn new(history_start_millis: i64) -> Self {
        Self {
            history_start_millis,
            ..Default::default()
        }
    }

    /// Set the history start.
    #[must_use]
    pub fn history_start_millis(mut self, millis: i64) -> Self {
        self.history_start_millis = millis;
        self
    }

    /// Set the page limit.
    #[must_use]
    pub fn page_limit(mut self, limit: u32) -> Self {
        self.page_limit = limit;
        self
    }

    /// Set the gap-skip stride.
    #[must_use]
    pub fn gap_skip_millis(mut self, millis: i64) -> Self {
        self.gap_skip_millis = millis;
        self
    }

    /// Set the nominal reporting interval.
    #[must_use]
    pub fn report_interval_millis(mut self, millis: i64) -> Self {
        self.report_interval_millis = millis;
        self
    }

    /// Set the catch-up threshold.
    #[must_use]
    pub fn catch_up_threshold(mut self, updates: i64) -> Self {
        self.catch_up_threshold = updates;
        self
    }

    /// Set the catch-up lookahead.
    #[must_use]
    pub fn catch_up_lookahead_millis(mut self, millis: i64) -> Self {
        self.catch_up_lookahead_millis = millis;
        self
    }

    /// Set the deduplication lookback.
    #[must_use]
    pub fn lookback_millis(mut self, millis: i64) -> Self {
        self.lookback_millis = millis;
        self
    }

    /// Derive lookahead and lookback from the page span.
    ///
    /// The lookback covers one full page; the lookahead stops six reports
    /// short of it so a catch-up page never runs past what one request can
    /// return.
    #[must_use]
    pub fn fit_windows_to_page(mut self) -> Self {
        let span = i64::from(self.page_limit) * self.report_interval_millis;
        self.lookback_millis = span;
        self.catch_up_lookahead_millis =
            (span - 6 * self.report_interval_millis).max(self.report_interval_millis);
        self
    }

    /// Limit how long one device's gap search may run per pass.
    #[must_use]
    pub fn search_budget(mut self, budget: Duration) -> Self {
        self.search_budget = Some(budget);
        self
    }

    /// Limit how long one device's sync may run per pass.
    #[must_use]
    pub fn device_timeout(mut self, timeout: Duration) -> Self {
        self.device_timeout = Some(timeout);
        self
    }

    /// Set both pacing delays.
    #[must_use]
    pub fn delays(mut self, probe: Duration, device: Duration) -> Self {
        self.probe_delay = probe;
        self.device_delay = device;
        self
    }

    /// Remove all pacing delays.
    #[must_use]
    pub fn no_delays(self) -> Self {
        self.delays(Duration::ZERO, Duration::ZERO)
    }

    /// Reject values that would stall or break the algorithm.
    pub fn validate(&self) -> Result<()> {
        if self.page_limit == 0 {
            return Err(Error::invalid_config("page_limit must be at least 1"));
        }
        if self.gap_skip_millis <= 0 {
            return Err(Error::invalid_config("gap_skip_millis must be positive"));
        }
        if self.report_interval_millis <= 0 {
            return Err(Error::invalid_config(
                "report_interval_millis must be positive",
            ));
        }
        if self.lookback_millis <= 0 {
            return Err(Error::invalid_config("lookback_millis must be positive"));
        }
        if self.catch_up_lookahead_millis <= 0 {
            return Err(Error::invalid_config(
                "catch_up_lookahead_millis must be positive",
            ));
        }
        if self.catch_up_threshold < 0 {
            return Err(Error::invalid_config(
                "catch_up_threshold cannot be negative",
            ));
        }
        if let (Some(budget), Some(timeout)) = (self.search_budget, self.device_timeout)
            && budget >= timeout
        {
            return Err(Error::invalid_config(
                "search_budget must be shorter than device_timeout",
            ));
        }
        Ok(())
    }
}
