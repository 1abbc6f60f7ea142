//! Gap-aware page fetching.
//!
//! The remote API only answers "up to N records ending at T". There is no
//! "everything since X" query, so finding new data after an outage means
//! probing forward in time. [`GapAwareFetcher`] requests one page at the
//! current window end; if that page holds nothing newer than what is already
//! stored, the window is treated as a gap and advanced by a fixed stride
//! (clamped to just past now) until new data turns up or the search passes
//! the present.
//!
//! A search can be given a deadline. It then stops between probes once the
//! deadline has passed and reports where it stopped, so the caller can resume
//! from there instead of re-walking the same empty windows.

use tokio::time::{Instant, sleep};
use tracing::{debug, warn};

use ambisync_types::{RawRecord, Record};

use crate::error::Result;
use crate::options::SyncOptions;
use crate::traits::RemoteSource;

/// Result of one gap-aware search.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FetchOutcome {
    /// Candidate records. Empty if nothing newer than the high-water mark
    /// exists up to now. Otherwise holds the whole page that contained new
    /// data, which may also include already-stored records.
    pub records: Vec<Record>,
    /// Window end of the last probe (or where the search stopped).
    pub query_end_millis: i64,
    /// Remote calls made.
    pub probes: u32,
    /// Windows skipped for holding no new data.
    pub gaps_skipped: u32,
    /// Records dropped because their timestamp was missing, invalid or
    /// later than now.
    pub malformed: u32,
    /// The deadline passed before the search finished. `query_end_millis` is
    /// the next window that was not probed.
    pub interrupted: bool,
}

impl FetchOutcome {
    /// Highest timestamp among the candidates.
    pub fn max_epoch_millis(&self) -> Option<i64> {
        self.records.iter().map(|r| r.epoch_millis).max()
    }

    /// Lowest timestamp among the candidates.
    pub fn min_epoch_millis(&self) -> Option<i64> {
        self.records.iter().map(|r| r.epoch_millis).min()
    }
}

/// Walks forward from a starting window until it finds a page with data
/// newer than the stored high-water mark.
pub struct GapAwareFetcher<'a, R: ?Sized> {
    remote: &'a R,
    options: &'a SyncOptions,
    deadline: Option<Instant>,
}

impl<'a, R: RemoteSource + ?Sized> GapAwareFetcher<'a, R> {
    /// Create a fetcher over `remote`.
    pub fn new(remote: &'a R, options: &'a SyncOptions) -> Self {
        Self {
            remote,
            options,
            deadline: None,
        }
    }

    /// Stop searching once `deadline` has passed.
    #[must_use]
    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    fn deadline_passed(&self) -> bool {
        self.deadline.is_some_and(|d| Instant::now() >= d)
    }

    /// Search for records newer than `known_max_millis`.
    ///
    /// `known_max_millis = None` means nothing is stored, so any record counts
    /// as new. The search makes at most
    /// `(now_millis - query_end_millis) / gap_skip_millis + 1` remote calls and
    /// none at all when `query_end_millis > now_millis`.
    pub async fn fetch(
        &self,
        device_id: &str,
        query_end_millis: i64,
        now_millis: i64,
        known_max_millis: Option<i64>,
    ) -> Result<FetchOutcome> {
        let mut outcome = FetchOutcome {
            query_end_millis,
            ..Default::default()
        };

        while outcome.query_end_millis <= now_millis {
            if self.deadline_passed() {
                debug!(
                    device_id,
                    query_end_millis = outcome.query_end_millis,
                    probes = outcome.probes,
                    "Search deadline reached"
                );
                outcome.interrupted = true;
                return Ok(outcome);
            }

            let page = self
                .remote
                .fetch(device_id, outcome.query_end_millis, self.options.page_limit)
                .await?;
            outcome.probes += 1;

            let records = parse_page(device_id, page, now_millis, &mut outcome.malformed);
            let page_max = records.iter().map(|r| r.epoch_millis).max();

            let has_new_data = match (page_max, known_max_millis) {
                (Some(page_max), Some(known_max)) => page_max > known_max,
                (Some(_), None) => true,
                (None, _) => false,
            };

            if has_new_data {
                debug!(
                    device_id,
                    query_end_millis = outcome.query_end_millis,
                    records = records.len(),
                    "Found page with new data"
                );
                outcome.records = records;
                return Ok(outcome);
            }

            let next_end = outcome
                .query_end_millis
                .saturating_add(self.options.gap_skip_millis)
                .min(now_millis.saturating_add(1));

            warn!(
                device_id,
                from_millis = outcome.query_end_millis,
                to_millis = next_end,
                "No data newer than stored, skipping gap"
            );

            outcome.query_end_millis = next_end;
            outcome.gaps_skipped += 1;

            if outcome.query_end_millis <= now_millis && !self.options.probe_delay.is_zero() {
                sleep(self.options.probe_delay).await;
            }
        }

        debug!(
            device_id,
            probes = outcome.probes,
            "Reached the present without finding new data"
        );
        Ok(outcome)
    }
}

/// Parse a page, dropping (and counting) malformed records.
///
/// A record stamped after `now_millis` would become a high-water mark no
/// real data can pass until the clock catches up, so it is dropped as well.
fn parse_page(
    device_id: &str,
    page: Vec<RawRecord>,
    now_millis: i64,
    malformed: &mut u32,
) -> Vec<Record> {
    page.into_iter()
        .filter_map(|raw| match raw.parse() {
            Ok(record) if record.epoch_millis > now_millis => {
                warn!(
                    device_id,
                    epoch_millis = record.epoch_millis,
                    now_millis,
                    "Dropping record stamped in the future"
                );
                *malformed += 1;
                None
            }
            Ok(record) => Some(record),
            Err(e) => {
                warn!(device_id, error = %e, "Dropping malformed record");
                *malformed += 1;
                None
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockRemote;
    use ambisync_types::{FIVE_MINUTES_MS, SIX_HOURS_MS};
    use proptest::prelude::*;
    use serde_json::json;
    use std::time::Duration;

    const DEVICE: &str = "AA:BB:CC:DD:EE:FF";
    const NOW: i64 = 1_700_000_000_000;
    const ONE_HOUR: i64 = 60 * 60_000;
    const ONE_DAY: i64 = 24 * ONE_HOUR;

    fn record(ms: i64) -> RawRecord {
        RawRecord(json!({"dateutc": ms, "tempf": 55.0}))
    }

    fn page(end: i64, count: i64) -> Vec<RawRecord> {
        (0..count).map(|i| record(end - i * FIVE_MINUTES_MS)).collect()
    }

    #[tokio::test]
    async fn test_future_window_makes_no_calls() {
        let remote = MockRemote::new();
        let options = SyncOptions::default();
        let fetcher = GapAwareFetcher::new(&remote, &options);

        let outcome = fetcher.fetch(DEVICE, NOW + 1, NOW, None).await.unwrap();
        assert!(outcome.records.is_empty());
        assert_eq!(outcome.probes, 0);
        assert!(remote.calls().is_empty());
    }

    #[tokio::test]
    async fn test_first_page_with_new_data_is_returned() {
        let remote = MockRemote::new();
        remote.push_page(DEVICE, page(NOW, 10));
        let options = SyncOptions::default();
        let fetcher = GapAwareFetcher::new(&remote, &options);

        let outcome = fetcher
            .fetch(DEVICE, NOW, NOW, Some(NOW - ONE_HOUR))
            .await
            .unwrap();
        assert_eq!(outcome.records.len(), 10);
        assert_eq!(outcome.probes, 1);
        assert_eq!(outcome.gaps_skipped, 0);
        assert_eq!(outcome.max_epoch_millis(), Some(NOW));
        assert_eq!(remote.calls()[0].limit, 288);
    }

    #[tokio::test(start_paused = true)]
    async fn test_empty_probes_advance_by_gap_stride() {
        let remote = MockRemote::new();
        let start = NOW - 2 * ONE_DAY;
        remote.push_page(DEVICE, vec![]);
        remote.push_page(DEVICE, vec![]);
        remote.push_page(DEVICE, vec![]);
        remote.push_page(DEVICE, page(start + 3 * SIX_HOURS_MS, 5));

        let options = SyncOptions::default();
        let fetcher = GapAwareFetcher::new(&remote, &options);
        let outcome = fetcher
            .fetch(DEVICE, start, NOW, Some(start - ONE_DAY))
            .await
            .unwrap();

        assert_eq!(outcome.records.len(), 5);
        assert_eq!(outcome.gaps_skipped, 3);
        assert_eq!(outcome.probes, 4);
        assert_eq!(outcome.query_end_millis, start + 3 * SIX_HOURS_MS);

        let ends: Vec<i64> = remote.calls().iter().map(|c| c.end_millis).collect();
        assert_eq!(
            ends,
            vec![
                start,
                start + SIX_HOURS_MS,
                start + 2 * SIX_HOURS_MS,
                start + 3 * SIX_HOURS_MS
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_page_counts_as_gap() {
        let remote = MockRemote::new();
        let known_max = NOW - ONE_DAY;
        // Page only holds data we already have
        remote.push_page(DEVICE, page(known_max, 3));
        remote.push_page(DEVICE, page(known_max + ONE_HOUR, 3));

        let options = SyncOptions::default();
        let fetcher = GapAwareFetcher::new(&remote, &options);
        let outcome = fetcher
            .fetch(DEVICE, known_max, NOW, Some(known_max))
            .await
            .unwrap();

        assert_eq!(outcome.gaps_skipped, 1);
        assert_eq!(outcome.max_epoch_millis(), Some(known_max + ONE_HOUR));
    }

    #[tokio::test(start_paused = true)]
    async fn test_search_stops_just_past_now() {
        let remote = MockRemote::new();
        let start = NOW - SIX_HOURS_MS - ONE_HOUR;

        let options = SyncOptions::default();
        let fetcher = GapAwareFetcher::new(&remote, &options);
        let outcome = fetcher.fetch(DEVICE, start, NOW, Some(0)).await.unwrap();

        assert!(outcome.records.is_empty());
        // start, start + 6h, then clamped to now + 1 which is not probed
        assert_eq!(outcome.probes, 2);
        assert_eq!(outcome.gaps_skipped, 2);
        assert_eq!(outcome.query_end_millis, NOW + 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_probe_landing_on_now_is_made() {
        let remote = MockRemote::new();
        let start = NOW - ONE_HOUR;
        remote.push_page(DEVICE, vec![]);

        let options = SyncOptions::default().gap_skip_millis(ONE_HOUR);
        let fetcher = GapAwareFetcher::new(&remote, &options);
        let outcome = fetcher.fetch(DEVICE, start, NOW, None).await.unwrap();

        let ends: Vec<i64> = remote.calls().iter().map(|c| c.end_millis).collect();
        assert_eq!(ends, vec![start, NOW]);
        assert_eq!(outcome.query_end_millis, NOW + 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_probes_are_paced() {
        let remote = MockRemote::new();
        let options = SyncOptions::default().delays(Duration::from_secs(1), Duration::ZERO);
        let fetcher = GapAwareFetcher::new(&remote, &options);

        let started = tokio::time::Instant::now();
        let outcome = fetcher
            .fetch(DEVICE, NOW - 3 * SIX_HOURS_MS, NOW, None)
            .await
            .unwrap();

        assert_eq!(outcome.probes, 4);
        // One pause between each pair of consecutive probes
        assert_eq!(started.elapsed(), Duration::from_secs(3));
    }

    #[tokio::test]
    async fn test_malformed_records_are_dropped() {
        let remote = MockRemote::new();
        remote.push_page(
            DEVICE,
            vec![
                record(NOW),
                RawRecord(json!({"tempf": 50.0})),
                RawRecord(json!({"dateutc": "yesterday"})),
            ],
        );

        let options = SyncOptions::default();
        let fetcher = GapAwareFetcher::new(&remote, &options);
        let outcome = fetcher.fetch(DEVICE, NOW, NOW, None).await.unwrap();

        assert_eq!(outcome.records.len(), 1);
        assert_eq!(outcome.malformed, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_page_of_only_malformed_records_is_a_gap() {
        let remote = MockRemote::new();
        remote.push_page(DEVICE, vec![RawRecord(json!({"tempf": 50.0}))]);

        let options = SyncOptions::default();
        let fetcher = GapAwareFetcher::new(&remote, &options);
        let outcome = fetcher.fetch(DEVICE, NOW, NOW, None).await.unwrap();

        assert!(outcome.records.is_empty());
        assert_eq!(outcome.gaps_skipped, 1);
        assert_eq!(outcome.malformed, 1);
    }

    #[tokio::test]
    async fn test_future_records_are_dropped() {
        let remote = MockRemote::new();
        remote.push_page(
            DEVICE,
            vec![record(NOW + ONE_DAY), record(NOW), record(NOW - FIVE_MINUTES_MS)],
        );

        let options = SyncOptions::default();
        let fetcher = GapAwareFetcher::new(&remote, &options);
        let outcome = fetcher
            .fetch(DEVICE, NOW, NOW, Some(NOW - ONE_HOUR))
            .await
            .unwrap();

        assert_eq!(outcome.records.len(), 2);
        assert_eq!(outcome.max_epoch_millis(), Some(NOW));
        assert_eq!(outcome.malformed, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_page_of_only_future_records_is_a_gap() {
        let remote = MockRemote::new();
        remote.push_page(DEVICE, vec![record(NOW + ONE_HOUR)]);

        let options = SyncOptions::default();
        let fetcher = GapAwareFetcher::new(&remote, &options);
        let outcome = fetcher.fetch(DEVICE, NOW, NOW, None).await.unwrap();

        assert!(outcome.records.is_empty());
        assert_eq!(outcome.gaps_skipped, 1);
        assert_eq!(outcome.malformed, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_stops_search_between_probes() {
        let remote = MockRemote::new();
        let options = SyncOptions::default().delays(Duration::from_secs(1), Duration::ZERO);
        let start = NOW - 10 * SIX_HOURS_MS;

        // Probes at 0s, 1s and 2s; the deadline passes during the third pause
        let deadline = Instant::now() + Duration::from_millis(2_500);
        let fetcher = GapAwareFetcher::new(&remote, &options).with_deadline(deadline);
        let outcome = fetcher.fetch(DEVICE, start, NOW, None).await.unwrap();

        assert!(outcome.interrupted);
        assert!(outcome.records.is_empty());
        assert_eq!(outcome.probes, 3);
        assert_eq!(outcome.gaps_skipped, 3);
        // Resume point is the first window that was not probed
        assert_eq!(outcome.query_end_millis, start + 3 * SIX_HOURS_MS);
        assert_eq!(remote.calls().len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_search_finishing_before_deadline_is_not_interrupted() {
        let remote = MockRemote::new();
        remote.push_page(DEVICE, vec![]);
        remote.push_page(DEVICE, page(NOW - SIX_HOURS_MS, 4));

        let options = SyncOptions::default();
        let deadline = Instant::now() + Duration::from_secs(60);
        let fetcher = GapAwareFetcher::new(&remote, &options).with_deadline(deadline);
        let outcome = fetcher
            .fetch(DEVICE, NOW - 2 * SIX_HOURS_MS, NOW, None)
            .await
            .unwrap();

        assert!(!outcome.interrupted);
        assert_eq!(outcome.records.len(), 4);
    }

    #[tokio::test]
    async fn test_remote_error_propagates() {
        let remote = MockRemote::new();
        remote.fail_device(DEVICE);

        let options = SyncOptions::default();
        let fetcher = GapAwareFetcher::new(&remote, &options);
        let result = fetcher.fetch(DEVICE, NOW, NOW, None).await;
        assert!(matches!(
            result,
            Err(crate::error::Error::RemoteUnavailable(_))
        ));
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        #[test]
        fn search_terminates_within_bound(
            distance in 0i64..(60 * 86_400_000i64),
            stride in 60_000i64..(12 * 3_600_000i64),
        ) {
            let rt = tokio::runtime::Builder::new_current_thread()
                .enable_time()
                .start_paused(true)
                .build()
                .unwrap();

            let remote = MockRemote::new();
            let options = SyncOptions::default().gap_skip_millis(stride);
            let start = NOW - distance;

            let outcome = rt
                .block_on(GapAwareFetcher::new(&remote, &options).fetch(DEVICE, start, NOW, None))
                .unwrap();

            prop_assert!(outcome.records.is_empty());
            prop_assert!(i64::from(outcome.probes) <= distance / stride + 1);
            prop_assert_eq!(outcome.query_end_millis, NOW + 1);
        }
    }
}
