//! The synchronization engine.
//!
//! [`SyncEngine`] brings each device's stored readings up to date with the
//! remote API. Per device it:
//!
//! 1. computes the query window from the stored high-water mark
//! 2. loads the stored readings in that window as the deduplication reference
//! 3. runs the [`GapAwareFetcher`] to find a page with new data
//! 4. drops candidates that are already stored
//! 5. tags the rest with the device and inserts them in one batch
//!
//! Passes are idempotent: re-running a pass with no new remote data inserts
//! nothing. A device that fails is logged and reported; the pass moves on.
//!
//! With [`SyncOptions::search_budget`] set, a long gap search is paused when
//! the budget runs out and resumed from the same window on the next pass, so
//! one device that is far behind never holds up the others. Paused searches
//! live in memory only; after a restart the search starts over from the
//! stored high-water mark. [`SyncOptions::device_timeout`] caps a device's
//! whole turn, including hung requests.

use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard, PoisonError};

use time::OffsetDateTime;
use tokio::time::{Instant, sleep, timeout};
use tracing::{debug, error, info, warn};

use ambisync_store::{InsertOutcome, SyncRun};
use ambisync_types::{Clock, Device, Reading, SystemClock};

use crate::error::{Error, Result};
use crate::fetcher::GapAwareFetcher;
use crate::options::SyncOptions;
use crate::traits::{DeviceDirectory, RecordStore, RemoteSource};
use crate::window::sync_window;

fn count(n: usize) -> u32 {
    u32::try_from(n).unwrap_or(u32::MAX)
}

/// Result of synchronizing one device.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceReport {
    pub device_id: String,
    /// End of the first window probed.
    pub query_end_millis: i64,
    /// End of the window where the search stopped.
    pub final_query_end_millis: i64,
    /// Valid candidate records returned by the remote.
    pub fetched: u32,
    /// Candidates already stored, or repeated within the page.
    pub skipped_existing: u32,
    /// Readings written.
    pub inserted: u32,
    /// Timestamps rejected by the store as already present.
    pub conflicts: Vec<i64>,
    /// Records dropped for lacking a usable timestamp.
    pub malformed: u32,
    /// Windows skipped while searching for new data.
    pub gaps_skipped: u32,
    /// Remote calls made.
    pub probes: u32,
    /// The search budget ran out; the next pass resumes at
    /// `final_query_end_millis`.
    pub search_paused: bool,
}

/// One device's outcome within a pass.
#[derive(Debug)]
pub struct DeviceOutcome {
    pub device_id: String,
    pub result: Result<DeviceReport>,
}

/// Outcome of a full pass over all devices.
#[derive(Debug)]
pub struct PassReport {
    pub started_at: OffsetDateTime,
    pub finished_at: OffsetDateTime,
    pub outcomes: Vec<DeviceOutcome>,
}

impl PassReport {
    /// Readings inserted across all devices.
    pub fn inserted_total(&self) -> u64 {
        self.successes().map(|r| u64::from(r.inserted)).sum()
    }

    /// Reports of devices that synchronized successfully.
    pub fn successes(&self) -> impl Iterator<Item = &DeviceReport> {
        self.outcomes.iter().filter_map(|o| o.result.as_ref().ok())
    }

    /// Devices that failed, with their errors.
    pub fn failures(&self) -> impl Iterator<Item = (&str, &Error)> {
        self.outcomes
            .iter()
            .filter_map(|o| o.result.as_ref().err().map(|e| (o.device_id.as_str(), e)))
    }

    /// Number of failed devices.
    pub fn failed_count(&self) -> usize {
        self.failures().count()
    }

    /// Whether there was at least one device and every device failed.
    pub fn all_failed(&self) -> bool {
        !self.outcomes.is_empty() && self.failed_count() == self.outcomes.len()
    }
}

/// Where a paused gap search picks up again.
#[derive(Debug, Clone, Copy)]
struct SearchCursor {
    /// High-water mark when the search was paused.
    latest_millis: Option<i64>,
    /// Next window end to probe.
    query_end_millis: i64,
}

/// Synchronizes remote device readings into a [`RecordStore`].
///
/// # Example
///
/// ```no_run
/// use ambisync_core::{AmbientClient, SyncEngine, SyncOptions};
/// use ambisync_store::Store;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let client = AmbientClient::new("https://rt.ambientweather.net/v1", "api-key", "app-key")?;
/// let store = Store::open_default()?;
/// let engine = SyncEngine::new(client.clone(), store, SyncOptions::new(1_577_836_800_000))?;
///
/// let report = engine.run_directory_pass(&client).await?;
/// println!("inserted {} readings", report.inserted_total());
/// # Ok(())
/// # }
/// ```
pub struct SyncEngine<R, S, C = SystemClock> {
    remote: R,
    store: S,
    clock: C,
    options: SyncOptions,
    cursors: Mutex<HashMap<String, SearchCursor>>,
}

impl<R: RemoteSource, S: RecordStore> SyncEngine<R, S, SystemClock> {
    /// Create an engine using the system clock.
    pub fn new(remote: R, store: S, options: SyncOptions) -> Result<Self> {
        Self::with_clock(remote, store, SystemClock, options)
    }
}

impl<R: RemoteSource, S: RecordStore, C: Clock> SyncEngine<R, S, C> {
    /// Create an engine with an explicit clock.
    pub fn with_clock(remote: R, store: S, clock: C, options: SyncOptions) -> Result<Self> {
        options.validate()?;
        Ok(Self {
            remote,
            store,
            clock,
            options,
            cursors: Mutex::default(),
        })
    }

    /// Engine options.
    pub fn options(&self) -> &SyncOptions {
        &self.options
    }

    /// The remote source.
    pub fn remote(&self) -> &R {
        &self.remote
    }

    /// The record store.
    pub fn store(&self) -> &S {
        &self.store
    }

    /// Bring one device up to date.
    pub async fn sync_device(&self, device: &Device) -> Result<DeviceReport> {
        let device_id = device.mac_address.as_str();
        let now_millis = self.clock.now_millis();

        self.store.upsert_device(device)?;

        let latest_millis = self.store.latest(device_id)?.map(|r| r.epoch_millis);
        let mut window = sync_window(device_id, latest_millis, now_millis, &self.options);
        if let Some(resume_at) = self.take_cursor(device_id, latest_millis)
            && resume_at > window.query_end_millis
        {
            debug!(device_id, resume_at, "Resuming paused gap search");
            window.query_end_millis = resume_at;
        }
        debug!(
            device_id,
            latest_millis,
            query_end_millis = window.query_end_millis,
            "Computed sync window"
        );

        let existing =
            self.store
                .range_query(device_id, window.from_millis(), window.query_end_millis)?;
        let mut reference: HashSet<i64> = existing.iter().map(|r| r.epoch_millis).collect();
        // The window contains the high-water mark unless the latter is in the future
        let known_max_millis = reference.iter().copied().max().max(latest_millis);

        let mut fetcher = GapAwareFetcher::new(&self.remote, &self.options);
        if let Some(budget) = self.options.search_budget {
            fetcher = fetcher.with_deadline(Instant::now() + budget);
        }
        let outcome = fetcher
            .fetch(
                device_id,
                window.query_end_millis,
                now_millis,
                known_max_millis,
            )
            .await?;

        if outcome.interrupted {
            info!(
                device_id,
                resume_at = outcome.query_end_millis,
                probes = outcome.probes,
                "Gap search paused, resuming next pass"
            );
            self.cursors().insert(
                device_id.to_string(),
                SearchCursor {
                    latest_millis,
                    query_end_millis: outcome.query_end_millis,
                },
            );
        }

        // After gap skips the page can reach outside the loaded window
        if let (Some(min), Some(max)) = (outcome.min_epoch_millis(), outcome.max_epoch_millis()) {
            if min <= window.from_millis() || max > window.query_end_millis {
                let extra = self
                    .store
                    .range_query(device_id, min.saturating_sub(1), max)?;
                reference.extend(extra.iter().map(|r| r.epoch_millis));
            }
        }

        let mut report = DeviceReport {
            device_id: device_id.to_string(),
            query_end_millis: window.query_end_millis,
            final_query_end_millis: outcome.query_end_millis,
            fetched: count(outcome.records.len()),
            malformed: outcome.malformed,
            gaps_skipped: outcome.gaps_skipped,
            probes: outcome.probes,
            search_paused: outcome.interrupted,
            ..Default::default()
        };

        let mut readings = Vec::with_capacity(outcome.records.len());
        for record in outcome.records {
            if !reference.insert(record.epoch_millis) {
                report.skipped_existing += 1;
                continue;
            }
            match Reading::from_record(device, record) {
                Ok(reading) => readings.push(reading),
                Err(e) => {
                    warn!(device_id, error = %e, "Dropping malformed record");
                    report.malformed += 1;
                }
            }
        }
        readings.sort_by_key(|r| r.epoch_millis);

        if !readings.is_empty() {
            let outcomes = self.store.insert_batch(&readings)?;
            for (reading, outcome) in readings.iter().zip(outcomes) {
                match outcome {
                    InsertOutcome::Inserted => report.inserted += 1,
                    InsertOutcome::Conflict => {
                        warn!(
                            device_id,
                            epoch_millis = reading.epoch_millis,
                            "Reading already stored, skipped"
                        );
                        report.conflicts.push(reading.epoch_millis);
                    }
                }
            }
        }

        info!(
            device_id,
            fetched = report.fetched,
            inserted = report.inserted,
            conflicts = report.conflicts.len(),
            gaps_skipped = report.gaps_skipped,
            "Device synchronized"
        );
        Ok(report)
    }

    /// Synchronize each device in turn, pausing between devices.
    ///
    /// A failing device is logged and reported; the remaining devices are
    /// still processed.
    pub async fn run_pass(&self, devices: &[Device]) -> PassReport {
        let started_at = OffsetDateTime::now_utc();
        let mut outcomes = Vec::with_capacity(devices.len());

        for (i, device) in devices.iter().enumerate() {
            if i > 0 && !self.options.device_delay.is_zero() {
                sleep(self.options.device_delay).await;
            }

            info!(
                device_id = %device.mac_address,
                name = device.display_name(),
                "Synchronizing device"
            );
            let device_started = OffsetDateTime::now_utc();
            let result = match self.options.device_timeout {
                Some(limit) => timeout(limit, self.sync_device(device))
                    .await
                    .unwrap_or_else(|_| Err(Error::DeviceTimeout(limit))),
                None => self.sync_device(device).await,
            };
            if let Err(e) = &result {
                error!(device_id = %device.mac_address, error = %e, "Device sync failed");
            }
            self.record_run(&device.mac_address, device_started, &result);

            outcomes.push(DeviceOutcome {
                device_id: device.mac_address.clone(),
                result,
            });
        }

        let report = PassReport {
            started_at,
            finished_at: OffsetDateTime::now_utc(),
            outcomes,
        };
        info!(
            devices = report.outcomes.len(),
            failed = report.failed_count(),
            inserted = report.inserted_total(),
            "Pass complete"
        );
        report
    }

    /// List devices from `directory`, then run a pass over them.
    ///
    /// A directory failure ends the pass before any device is touched.
    pub async fn run_directory_pass<D: DeviceDirectory + ?Sized>(
        &self,
        directory: &D,
    ) -> Result<PassReport> {
        let devices = directory.devices().await.map_err(|e| {
            error!(error = %e, "Failed to get devices, trying again later");
            Error::from(e)
        })?;
        info!(count = devices.len(), "Got device list");
        Ok(self.run_pass(&devices).await)
    }

    fn cursors(&self) -> MutexGuard<'_, HashMap<String, SearchCursor>> {
        self.cursors.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Remove the device's paused search, returning its next window end if
    /// nothing was stored for the device since the pause.
    fn take_cursor(&self, device_id: &str, latest_millis: Option<i64>) -> Option<i64> {
        self.cursors()
            .remove(device_id)
            .filter(|cursor| cursor.latest_millis == latest_millis)
            .map(|cursor| cursor.query_end_millis)
    }

    fn record_run(&self, device_id: &str, started_at: OffsetDateTime, result: &Result<DeviceReport>) {
        let mut run = SyncRun {
            device_id: device_id.to_string(),
            started_at,
            finished_at: OffsetDateTime::now_utc(),
            fetched: 0,
            inserted: 0,
            conflicts: 0,
            malformed: 0,
            gaps_skipped: 0,
            error: None,
        };
        match result {
            Ok(report) => {
                run.fetched = report.fetched;
                run.inserted = report.inserted;
                run.conflicts = count(report.conflicts.len());
                run.malformed = report.malformed;
                run.gaps_skipped = report.gaps_skipped;
            }
            Err(e) => run.error = Some(e.to_string()),
        }

        if let Err(e) = self.store.record_run(&run) {
            warn!(device_id, error = %e, "Failed to record sync run");
        }
    }
}
