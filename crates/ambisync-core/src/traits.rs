//! Collaborator seams for the synchronization engine.
//!
//! The engine never talks to HTTP or SQLite directly. It is generic over:
//!
//! - [`RemoteSource`]: fetches a bounded page of records ending at a timestamp
//! - [`DeviceDirectory`]: supplies the devices to synchronize
//! - [`RecordStore`]: the system of record
//!
//! Production implementations are [`AmbientClient`](crate::AmbientClient) and
//! [`ambisync_store::Store`]; [`crate::mock`] provides in-memory doubles.

use async_trait::async_trait;

use ambisync_store::{InsertOutcome, Store, SyncRun};
use ambisync_types::{Device, RawRecord, Reading};

use crate::error::{RemoteError, Result};

/// A remote telemetry API that serves fixed-size pages ending at a timestamp.
#[async_trait]
pub trait RemoteSource: Send + Sync {
    /// Fetch up to `limit` records for `device_id` with timestamps at or
    /// before `end_millis`. May return fewer records, in any order.
    async fn fetch(
        &self,
        device_id: &str,
        end_millis: i64,
        limit: u32,
    ) -> std::result::Result<Vec<RawRecord>, RemoteError>;
}

/// Supplies the set of devices to synchronize. Consumed, never mutated.
#[async_trait]
pub trait DeviceDirectory: Send + Sync {
    /// List devices with their descriptive metadata.
    async fn devices(&self) -> std::result::Result<Vec<Device>, RemoteError>;
}

/// The persistent store readings are synchronized into.
///
/// Implementations must give read-your-writes consistency between
/// [`latest`](Self::latest) and a subsequent [`insert_batch`](Self::insert_batch).
pub trait RecordStore {
    /// Most recent stored reading for a device by `epoch_millis`.
    fn latest(&self, device_id: &str) -> Result<Option<Reading>>;

    /// Stored readings with `from_millis < epoch_millis <= to_millis`,
    /// newest first.
    fn range_query(&self, device_id: &str, from_millis: i64, to_millis: i64)
    -> Result<Vec<Reading>>;

    /// Insert readings, reporting a per-row outcome in input order.
    /// Duplicate keys are reported as [`InsertOutcome::Conflict`], not errors.
    fn insert_batch(&self, readings: &[Reading]) -> Result<Vec<InsertOutcome>>;

    /// Record the device's metadata before its readings are written.
    fn upsert_device(&self, _device: &Device) -> Result<()> {
        Ok(())
    }

    /// Persist the outcome of one device's synchronization.
    fn record_run(&self, _run: &SyncRun) -> Result<()> {
        Ok(())
    }
}

impl RecordStore for Store {
    fn latest(&self, device_id: &str) -> Result<Option<Reading>> {
        Ok(self.latest_reading(device_id)?)
    }

    fn range_query(
        &self,
        device_id: &str,
        from_millis: i64,
        to_millis: i64,
    ) -> Result<Vec<Reading>> {
        Ok(self.readings_in_range(device_id, from_millis, to_millis)?)
    }

    fn insert_batch(&self, readings: &[Reading]) -> Result<Vec<InsertOutcome>> {
        Ok(Store::insert_batch(self, readings)?)
    }

    fn upsert_device(&self, device: &Device) -> Result<()> {
        Store::upsert_device(self, device)?;
        Ok(())
    }

    fn record_run(&self, run: &SyncRun) -> Result<()> {
        self.record_sync_run(run)?;
        Ok(())
    }
}

/// A fixed device list, e.g. taken from configuration.
#[derive(Debug, Clone, Default)]
pub struct StaticDirectory {
    devices: Vec<Device>,
}

impl StaticDirectory {
    /// Create a directory serving `devices`.
    pub fn new(devices: Vec<Device>) -> Self {
        Self { devices }
    }
}

#[async_trait]
impl DeviceDirectory for StaticDirectory {
    async fn devices(&self) -> std::result::Result<Vec<Device>, RemoteError> {
        Ok(self.devices.clone())
    }
}

#[async_trait]
impl<T: DeviceDirectory + ?Sized> DeviceDirectory for Box<T> {
    async fn devices(&self) -> std::result::Result<Vec<Device>, RemoteError> {
        (**self).devices().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ambisync_types::RawRecord;
    use serde_json::json;

    #[tokio::test]
    async fn test_static_directory() {
        let directory = StaticDirectory::new(vec![Device::new("AA"), Device::new("BB")]);
        let devices = directory.devices().await.unwrap();
        assert_eq!(devices.len(), 2);
        assert_eq!(devices[1].mac_address, "BB");

        let boxed: Box<dyn DeviceDirectory> = Box::new(directory);
        assert_eq!(boxed.devices().await.unwrap().len(), 2);
    }

    #[test]
    fn test_store_implements_record_store() {
        let store = Store::open_in_memory().unwrap();
        let device = Device::new("AA:BB").with_info(json!({"name": "Roof"}));
        RecordStore::upsert_device(&store, &device).unwrap();

        let readings: Vec<Reading> = [1_000i64, 2_000]
            .iter()
            .map(|&ms| {
                let record = RawRecord(json!({"dateutc": ms})).parse().unwrap();
                Reading::from_record(&device, record).unwrap()
            })
            .collect();

        let outcomes = RecordStore::insert_batch(&store, &readings).unwrap();
        assert_eq!(outcomes, vec![InsertOutcome::Inserted; 2]);

        assert_eq!(store.latest("AA:BB").unwrap().unwrap().epoch_millis, 2_000);
        assert_eq!(store.range_query("AA:BB", 1_000, 2_000).unwrap().len(), 1);
    }
}
