//! Scheduled synchronization passes.
//!
//! The runner owns the engine and drives one pass at a time: a pass is
//! awaited to completion before the next tick is taken, so passes never
//! overlap. Time limits apply per device inside the engine
//! ([`SyncOptions::device_timeout`](ambisync_core::SyncOptions)), so a
//! device that is slow or far behind cannot starve the devices after it.

use std::future::Future;
use std::time::Duration;

use tokio::time::{MissedTickBehavior, interval};
use tracing::{info, warn};

use ambisync_core::{Clock, DeviceDirectory, PassReport, RecordStore, RemoteSource, SyncEngine};

/// Runs synchronization passes against a device directory.
pub struct Runner<R, S, C, D> {
    engine: SyncEngine<R, S, C>,
    directory: D,
    interval: Duration,
}

impl<R, S, C, D> Runner<R, S, C, D>
where
    R: RemoteSource,
    S: RecordStore,
    C: Clock,
    D: DeviceDirectory,
{
    /// Create a runner.
    pub fn new(engine: SyncEngine<R, S, C>, directory: D, interval: Duration) -> Self {
        Self {
            engine,
            directory,
            interval,
        }
    }

    /// The engine driven by this runner.
    pub fn engine(&self) -> &SyncEngine<R, S, C> {
        &self.engine
    }

    /// Run a single pass over the directory's devices.
    ///
    /// Fails only when the device list cannot be obtained; per-device
    /// failures, timeouts included, are reported inside the [`PassReport`].
    pub async fn run_once(&self) -> ambisync_core::Result<PassReport> {
        self.engine.run_directory_pass(&self.directory).await
    }

    /// Run passes every interval until `shutdown` resolves.
    ///
    /// The first pass starts immediately. Shutdown interrupts a pass in
    /// progress. Returns the number of passes that completed.
    pub async fn run_until<F>(&self, shutdown: F) -> usize
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);

        let mut ticker = interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut completed = 0;

        info!(
            interval_secs = self.interval.as_secs(),
            "Starting synchronization loop"
        );

        loop {
            tokio::select! {
                biased;
                _ = &mut shutdown => break,
                _ = ticker.tick() => {}
            }

            tokio::select! {
                biased;
                _ = &mut shutdown => {
                    warn!("Shutdown requested during a pass, abandoning it");
                    break;
                }
                result = self.run_once() => {
                    completed += 1;
                    if let Ok(report) = &result
                        && report.all_failed()
                    {
                        warn!(devices = report.outcomes.len(), "Every device failed this pass");
                    }
                }
            }
        }

        info!(passes = completed, "Synchronization loop stopped");
        completed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ambisync_core::mock::{MemoryStore, MockRemote};
    use ambisync_core::{Device, Error, FixedClock, SyncOptions};
    use ambisync_types::{FIVE_MINUTES_MS, ONE_DAY_MS, RawRecord, Reading};
    use serde_json::json;
    use tokio::time::sleep;

    const T0: i64 = 1_577_836_800_000;
    const NOW: i64 = T0 + 12 * 60 * 60_000;
    const INTERVAL: Duration = Duration::from_secs(300);

    type TestRunner = Runner<MockRemote, MemoryStore, FixedClock, MockRemote>;

    fn runner_with(
        remote: MockRemote,
        store: MemoryStore,
        options: SyncOptions,
        directory: MockRemote,
    ) -> TestRunner {
        let engine =
            SyncEngine::with_clock(remote, store, FixedClock::new(NOW), options).unwrap();
        Runner::new(engine, directory, INTERVAL)
    }

    fn runner(remote: MockRemote, directory: MockRemote) -> TestRunner {
        runner_with(
            remote,
            MemoryStore::new(),
            SyncOptions::new(T0).no_delays(),
            directory,
        )
    }

    fn directory(macs: &[&str]) -> MockRemote {
        let directory = MockRemote::new();
        directory.set_devices(macs.iter().map(|mac| Device::new(*mac)).collect());
        directory
    }

    fn reading(mac: &str, ms: i64) -> Reading {
        let record = RawRecord(json!({"dateutc": ms})).parse().unwrap();
        Reading::from_record(&Device::new(mac), record).unwrap()
    }

    #[tokio::test]
    async fn test_run_once_syncs_directory_devices() {
        let remote = MockRemote::new();
        remote.add_series("AA:01", NOW - 4 * FIVE_MINUTES_MS, 5, FIVE_MINUTES_MS);
        let runner = runner(remote, directory(&["AA:01", "AA:02"]));

        let report = runner.run_once().await.unwrap();
        assert_eq!(report.outcomes.len(), 2);
        assert_eq!(report.inserted_total(), 5);
        assert_eq!(runner.engine().store().len(), 5);
    }

    #[tokio::test]
    async fn test_run_once_directory_failure() {
        let directory = directory(&["AA:01"]);
        directory.fail_directory(true);
        let runner = runner(MockRemote::new(), directory);

        let err = runner.run_once().await.unwrap_err();
        assert!(matches!(err, Error::RemoteUnavailable(_)));
        assert!(runner.engine().remote().calls().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_hung_device_does_not_block_the_next() {
        let remote = MockRemote::new();
        remote.stall_device("AA:01");
        remote.add_series("AA:02", NOW - 4 * FIVE_MINUTES_MS, 5, FIVE_MINUTES_MS);
        let options = SyncOptions::new(T0)
            .no_delays()
            .device_timeout(Duration::from_secs(60));
        let runner = runner_with(
            remote,
            MemoryStore::new(),
            options,
            directory(&["AA:01", "AA:02"]),
        );

        let started = tokio::time::Instant::now();
        let report = runner.run_once().await.unwrap();
        assert_eq!(started.elapsed(), Duration::from_secs(60));
        assert!(matches!(
            report.outcomes[0].result,
            Err(Error::DeviceTimeout(_))
        ));
        assert_eq!(report.inserted_total(), 5);
        assert_eq!(runner.engine().store().readings("AA:02").len(), 5);
        assert_eq!(runner.engine().store().runs().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_device_far_behind_does_not_starve_others() {
        // AA:01 starts searching 60 days back but only reported in the
        // last hour; walking the gap takes 237 requests at one per second.
        // AA:02 is current and has twelve fresh records waiting.
        let remote = MockRemote::new();
        remote.add_series("AA:01", NOW - 11 * FIVE_MINUTES_MS, 12, FIVE_MINUTES_MS);
        remote.add_series("AA:02", NOW - 11 * FIVE_MINUTES_MS, 12, FIVE_MINUTES_MS);

        let store = MemoryStore::new();
        store.seed([reading("AA:02", NOW - 2 * 60 * 60_000)]);

        let options = SyncOptions::new(NOW - 60 * ONE_DAY_MS)
            .delays(Duration::from_secs(1), Duration::from_secs(1))
            .search_budget(Duration::from_secs(50))
            .device_timeout(Duration::from_secs(60));
        let runner = runner_with(remote, store, options, directory(&["AA:01", "AA:02"]));

        let first = runner.run_once().await.unwrap();
        assert_eq!(first.failed_count(), 0);
        let behind = first.outcomes[0].result.as_ref().unwrap();
        assert!(behind.search_paused);
        assert_eq!(behind.probes, 50);
        assert_eq!(first.outcomes[1].result.as_ref().unwrap().inserted, 12);

        // The paused search keeps its place: 50 requests per pass
        for _ in 0..3 {
            let report = runner.run_once().await.unwrap();
            let behind = report.outcomes[0].result.as_ref().unwrap();
            assert!(behind.search_paused);
            assert_eq!(behind.inserted, 0);
        }

        let fifth = runner.run_once().await.unwrap();
        let caught_up = fifth.outcomes[0].result.as_ref().unwrap();
        assert!(!caught_up.search_paused);
        assert_eq!(caught_up.probes, 37);
        // The window that reaches the data ends half an hour before now
        assert_eq!(caught_up.inserted, 6);
        assert_eq!(runner.engine().remote().calls_for("AA:01").len(), 237);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_until_ticks_every_interval() {
        let remote = MockRemote::new();
        let runner = runner(remote, directory(&["AA:01"]));

        // Ticks at 0, 300 and 600 seconds
        let passes = runner
            .run_until(sleep(2 * INTERVAL + Duration::from_secs(1)))
            .await;
        assert_eq!(passes, 3);
        assert_eq!(runner.engine().store().runs().len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_until_stops_immediately_on_shutdown() {
        let runner = runner(MockRemote::new(), directory(&["AA:01"]));

        let passes = runner.run_until(std::future::ready(())).await;
        assert_eq!(passes, 0);
        assert!(runner.engine().remote().calls().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_abandons_running_pass() {
        let remote = MockRemote::new();
        remote.stall_device("AA:01");
        let runner = runner(remote, directory(&["AA:01"]));

        let started = tokio::time::Instant::now();
        let passes = runner.run_until(sleep(Duration::from_secs(5))).await;
        assert_eq!(passes, 0);
        assert_eq!(started.elapsed(), Duration::from_secs(5));
    }
}
