//! In-memory test doubles for the synchronization seams.
//!
//! - [`MockRemote`] implements [`RemoteSource`] and [`DeviceDirectory`]
//! - [`MemoryStore`] implements [`RecordStore`]
//!
//! # Features
//!
//! - **Dataset mode**: seed a device's full remote history and let the mock
//!   answer "up to N records ending at T" the way the real API does
//! - **Scripted pages**: queue exact responses for a device, served before
//!   the dataset
//! - **Failure injection**: fail a device, the directory, or the store
//! - **Stalls**: make a device's fetches hang forever, for timeout tests
//! - **Race simulation**: have [`MemoryStore`] receive another writer's rows
//!   just before the next batch insert
//!
//! # Example
//!
//! ```
//! use ambisync_core::mock::{MemoryStore, MockRemote};
//! use ambisync_core::{SyncEngine, SyncOptions};
//! use ambisync_types::{Device, FixedClock};
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let remote = MockRemote::new();
//! remote.add_series("AA", 1_000_000, 10, 300_000);
//!
//! let engine = SyncEngine::with_clock(
//!     remote,
//!     MemoryStore::new(),
//!     FixedClock::new(5_000_000),
//!     SyncOptions::new(0).no_delays(),
//! )
//! .unwrap();
//! let report = engine.sync_device(&Device::new("AA")).await.unwrap();
//! assert_eq!(report.inserted, 10);
//! # }
//! ```

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use serde_json::json;

use ambisync_store::{InsertOutcome, SyncRun};
use ambisync_types::{Device, EPOCH_FIELD, RawRecord, Reading};

use crate::error::{Error, RemoteError, Result};
use crate::traits::{DeviceDirectory, RecordStore, RemoteSource};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// One call observed by [`MockRemote`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchCall {
    pub device_id: String,
    pub end_millis: i64,
    pub limit: u32,
}

/// A scriptable remote telemetry API.
#[derive(Debug, Default)]
pub struct MockRemote {
    /// Full remote history per device, keyed by epoch.
    datasets: Mutex<HashMap<String, BTreeMap<i64, RawRecord>>>,
    /// Exact responses served before the dataset is consulted.
    scripted: Mutex<HashMap<String, VecDeque<Vec<RawRecord>>>>,
    calls: Mutex<Vec<FetchCall>>,
    failing: Mutex<HashSet<String>>,
    stalled: Mutex<HashSet<String>>,
    directory: Mutex<Vec<Device>>,
    fail_directory: AtomicBool,
}

impl MockRemote {
    /// Create an empty remote: every fetch returns no records.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add records to a device's remote history.
    pub fn add_records(&self, device_id: &str, records: impl IntoIterator<Item = RawRecord>) {
        let mut datasets = lock(&self.datasets);
        let dataset = datasets.entry(device_id.to_string()).or_default();
        for record in records {
            if let Some(epoch) = record.0.get(EPOCH_FIELD).and_then(|v| v.as_i64()) {
                dataset.insert(epoch, record);
            }
        }
    }

    /// Add `count` evenly spaced records starting at `start_millis`.
    pub fn add_series(&self, device_id: &str, start_millis: i64, count: usize, interval_millis: i64) {
        let records = (0..count).map(|i| {
            let epoch = start_millis + interval_millis * i as i64;
            RawRecord(json!({
                EPOCH_FIELD: epoch,
                "tempf": 50.0 + (i % 20) as f64,
                "humidity": 40 + (i % 30),
            }))
        });
        self.add_records(device_id, records);
    }

    /// Queue an exact response for the device's next fetch.
    pub fn push_page(&self, device_id: &str, page: Vec<RawRecord>) {
        lock(&self.scripted)
            .entry(device_id.to_string())
            .or_default()
            .push_back(page);
    }

    /// Make every fetch for the device fail.
    pub fn fail_device(&self, device_id: &str) {
        lock(&self.failing).insert(device_id.to_string());
    }

    /// Make every fetch for the device hang without answering.
    pub fn stall_device(&self, device_id: &str) {
        lock(&self.stalled).insert(device_id.to_string());
    }

    /// Set the devices served by the directory.
    pub fn set_devices(&self, devices: Vec<Device>) {
        *lock(&self.directory) = devices;
    }

    /// Make the directory listing fail.
    pub fn fail_directory(&self, fail: bool) {
        self.fail_directory.store(fail, Ordering::Relaxed);
    }

    /// All fetch calls so far, in order.
    pub fn calls(&self) -> Vec<FetchCall> {
        lock(&self.calls).clone()
    }

    /// Fetch calls made for one device.
    pub fn calls_for(&self, device_id: &str) -> Vec<FetchCall> {
        lock(&self.calls)
            .iter()
            .filter(|c| c.device_id == device_id)
            .cloned()
            .collect()
    }

    /// Forget recorded calls.
    pub fn clear_calls(&self) {
        lock(&self.calls).clear();
    }
}

#[async_trait]
impl RemoteSource for MockRemote {
    async fn fetch(
        &self,
        device_id: &str,
        end_millis: i64,
        limit: u32,
    ) -> std::result::Result<Vec<RawRecord>, RemoteError> {
        lock(&self.calls).push(FetchCall {
            device_id: device_id.to_string(),
            end_millis,
            limit,
        });

        let stalled = lock(&self.stalled).contains(device_id);
        if stalled {
            std::future::pending::<()>().await;
        }

        if lock(&self.failing).contains(device_id) {
            return Err(RemoteError::Other(format!(
                "mock failure for device {device_id}"
            )));
        }

        if let Some(page) = lock(&self.scripted)
            .get_mut(device_id)
            .and_then(VecDeque::pop_front)
        {
            return Ok(page);
        }

        // Newest first, like the real API
        let page = lock(&self.datasets)
            .get(device_id)
            .map(|dataset| {
                dataset
                    .range(..=end_millis)
                    .rev()
                    .take(limit as usize)
                    .map(|(_, record)| record.clone())
                    .collect()
            })
            .unwrap_or_default();
        Ok(page)
    }
}

#[async_trait]
impl DeviceDirectory for MockRemote {
    async fn devices(&self) -> std::result::Result<Vec<Device>, RemoteError> {
        if self.fail_directory.load(Ordering::Relaxed) {
            return Err(RemoteError::Status {
                status: 503,
                message: "mock directory unavailable".to_string(),
            });
        }
        Ok(lock(&self.directory).clone())
    }
}

#[derive(Debug, Default)]
struct MemoryState {
    readings: BTreeMap<(String, i64), Reading>,
    devices: HashMap<String, Device>,
    runs: Vec<SyncRun>,
    /// Rows written by "another writer" right before the next insert.
    pending_race: Vec<Reading>,
}

/// An in-memory [`RecordStore`] with the same uniqueness rules as SQLite.
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
    unavailable: AtomicBool,
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert readings directly, bypassing the engine.
    pub fn seed(&self, readings: impl IntoIterator<Item = Reading>) {
        let mut state = lock(&self.state);
        for reading in readings {
            state
                .readings
                .insert((reading.device_id.clone(), reading.epoch_millis), reading);
        }
    }

    /// Have `readings` appear just before the next [`insert_batch`](RecordStore::insert_batch),
    /// as if written concurrently by another process.
    pub fn race_next_insert(&self, readings: Vec<Reading>) {
        lock(&self.state).pending_race.extend(readings);
    }

    /// Make every operation fail.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::Relaxed);
    }

    /// Stored readings for a device, oldest first.
    pub fn readings(&self, device_id: &str) -> Vec<Reading> {
        lock(&self.state)
            .readings
            .values()
            .filter(|r| r.device_id == device_id)
            .cloned()
            .collect()
    }

    /// Total stored readings.
    pub fn len(&self) -> usize {
        lock(&self.state).readings.len()
    }

    /// Whether nothing is stored.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Devices seen via [`upsert_device`](RecordStore::upsert_device).
    pub fn device(&self, device_id: &str) -> Option<Device> {
        lock(&self.state).devices.get(device_id).cloned()
    }

    /// Recorded sync runs, in order.
    pub fn runs(&self) -> Vec<SyncRun> {
        lock(&self.state).runs.clone()
    }

    fn check_available(&self) -> Result<()> {
        if self.unavailable.load(Ordering::Relaxed) {
            Err(Error::store_unavailable("mock store unavailable"))
        } else {
            Ok(())
        }
    }
}

impl RecordStore for MemoryStore {
    fn latest(&self, device_id: &str) -> Result<Option<Reading>> {
        self.check_available()?;
        let state = lock(&self.state);
        Ok(state
            .readings
            .range((device_id.to_string(), i64::MIN)..=(device_id.to_string(), i64::MAX))
            .next_back()
            .map(|(_, r)| r.clone()))
    }

    fn range_query(
        &self,
        device_id: &str,
        from_millis: i64,
        to_millis: i64,
    ) -> Result<Vec<Reading>> {
        self.check_available()?;
        if from_millis >= to_millis {
            return Ok(Vec::new());
        }
        let state = lock(&self.state);
        Ok(state
            .readings
            .range(
                (device_id.to_string(), from_millis.saturating_add(1))
                    ..=(device_id.to_string(), to_millis),
            )
            .rev()
            .map(|(_, r)| r.clone())
            .collect())
    }

    fn insert_batch(&self, readings: &[Reading]) -> Result<Vec<InsertOutcome>> {
        self.check_available()?;
        let mut state = lock(&self.state);

        for raced in std::mem::take(&mut state.pending_race) {
            state
                .readings
                .insert((raced.device_id.clone(), raced.epoch_millis), raced);
        }

        let outcomes = readings
            .iter()
            .map(|reading| {
                let key = (reading.device_id.clone(), reading.epoch_millis);
                if state.readings.contains_key(&key) {
                    InsertOutcome::Conflict
                } else {
                    state.readings.insert(key, reading.clone());
                    InsertOutcome::Inserted
                }
            })
            .collect();
        Ok(outcomes)
    }

    fn upsert_device(&self, device: &Device) -> Result<()> {
        self.check_available()?;
        lock(&self.state)
            .devices
            .insert(device.mac_address.clone(), device.clone());
        Ok(())
    }

    fn record_run(&self, run: &SyncRun) -> Result<()> {
        self.check_available()?;
        lock(&self.state).runs.push(run.clone());
        Ok(())
    }
}
