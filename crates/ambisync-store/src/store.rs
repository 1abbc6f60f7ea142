//! Main store implementation.

use std::path::Path;

use rusqlite::types::Type;
use rusqlite::{Connection, OptionalExtension, Row};
use time::OffsetDateTime;
use tracing::{debug, info};

use ambisync_types::{Device, Reading, format_recorded_at, millis_to_datetime};

use crate::error::{Error, Result};
use crate::models::{DeviceSummary, InsertOutcome, StoredDevice, SyncRun};
use crate::queries::ReadingQuery;
use crate::schema;

/// SQLite-based store for synchronized readings.
pub struct Store {
    conn: Connection,
}

impl Store {
    /// Open or create a database at the given path.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
            && !parent.exists()
        {
            std::fs::create_dir_all(parent).map_err(|e| Error::CreateDirectory {
                path: parent.to_path_buf(),
                source: e,
            })?;
        }

        info!("Opening database at {}", path.display());
        let conn = Connection::open(path)?;

        conn.execute_batch(
            "PRAGMA foreign_keys = ON;
             PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;",
        )?;

        schema::initialize(&conn)?;

        Ok(Self { conn })
    }

    /// Open the default database location.
    pub fn open_default() -> Result<Self> {
        Self::open(crate::default_db_path())
    }

    /// Open an in-memory database (for testing).
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        schema::initialize(&conn)?;
        Ok(Self { conn })
    }
}

fn now_unix() -> i64 {
    OffsetDateTime::now_utc().unix_timestamp()
}

fn conversion_error<E>(idx: usize, ty: Type, err: E) -> rusqlite::Error
where
    E: std::error::Error + Send + Sync + 'static,
{
    rusqlite::Error::FromSqlConversionFailure(idx, ty, Box::new(err))
}

fn unix_column(row: &Row<'_>, idx: usize) -> rusqlite::Result<OffsetDateTime> {
    let secs: i64 = row.get(idx)?;
    OffsetDateTime::from_unix_timestamp(secs).map_err(|e| conversion_error(idx, Type::Integer, e))
}

fn json_column<T: serde::de::DeserializeOwned>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T> {
    let text: String = row.get(idx)?;
    serde_json::from_str(&text).map_err(|e| conversion_error(idx, Type::Text, e))
}

fn row_to_device(row: &Row<'_>) -> rusqlite::Result<StoredDevice> {
    Ok(StoredDevice {
        id: row.get(0)?,
        info: json_column(row, 1)?,
        first_seen: unix_column(row, 2)?,
        last_seen: unix_column(row, 3)?,
    })
}

fn row_to_reading(row: &Row<'_>) -> rusqlite::Result<Reading> {
    let epoch_millis: i64 = row.get(1)?;
    Ok(Reading {
        device_id: row.get(0)?,
        epoch_millis,
        recorded_at: millis_to_datetime(epoch_millis)
            .map_err(|e| conversion_error(1, Type::Integer, e))?,
        device_info: json_column(row, 2)?,
        payload: json_column(row, 3)?,
    })
}

fn row_to_sync_run(row: &Row<'_>) -> rusqlite::Result<SyncRun> {
    Ok(SyncRun {
        device_id: row.get(0)?,
        started_at: unix_column(row, 1)?,
        finished_at: unix_column(row, 2)?,
        fetched: row.get(3)?,
        inserted: row.get(4)?,
        conflicts: row.get(5)?,
        malformed: row.get(6)?,
        gaps_skipped: row.get(7)?,
        error: row.get(8)?,
    })
}

fn is_unique_violation(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _)
            if e.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE
    )
}

// Device operations
impl Store {
    /// Insert a device or refresh its metadata and `last_seen`.
    ///
    /// A `null` metadata value never overwrites previously stored metadata.
    pub fn upsert_device(&self, device: &Device) -> Result<StoredDevice> {
        let info = serde_json::to_string(&device.info)?;

        self.conn.execute(
            "INSERT INTO devices (id, info, first_seen, last_seen) VALUES (?1, ?2, ?3, ?3)
             ON CONFLICT(id) DO UPDATE SET
                info = CASE WHEN excluded.info = 'null' THEN devices.info ELSE excluded.info END,
                last_seen = excluded.last_seen",
            rusqlite::params![device.mac_address, info, now_unix()],
        )?;

        self.get_device(&device.mac_address)?
            .ok_or_else(|| Error::DeviceNotFound(device.mac_address.clone()))
    }

    /// Get a device by ID.
    pub fn get_device(&self, device_id: &str) -> Result<Option<StoredDevice>> {
        let device = self
            .conn
            .query_row(
                "SELECT id, info, first_seen, last_seen FROM devices WHERE id = ?",
                [device_id],
                row_to_device,
            )
            .optional()?;

        Ok(device)
    }

    /// List all devices, most recently seen first.
    pub fn list_devices(&self) -> Result<Vec<StoredDevice>> {
        let mut stmt = self
            .conn
            .prepare("SELECT id, info, first_seen, last_seen FROM devices ORDER BY last_seen DESC, id")?;

        let devices = stmt
            .query_map([], row_to_device)?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(devices)
    }
}

// Reading operations
impl Store {
    /// Query readings with filters.
    pub fn query_readings(&self, query: &ReadingQuery) -> Result<Vec<Reading>> {
        let sql = query.build_sql();
        let (_, params) = query.build_where();

        debug!("Executing query: {}", sql);

        let params_ref: Vec<&dyn rusqlite::ToSql> = params.iter().map(|p| p.as_ref()).collect();

        let mut stmt = self.conn.prepare(&sql)?;
        let readings = stmt
            .query_map(params_ref.as_slice(), row_to_reading)?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(readings)
    }

    /// The most recent reading for a device by `epoch_millis`.
    pub fn latest_reading(&self, device_id: &str) -> Result<Option<Reading>> {
        let query = ReadingQuery::new().device(device_id).limit(1);
        let mut readings = self.query_readings(&query)?;
        Ok(readings.pop())
    }

    /// Readings of one device with `from_millis < epoch_millis <= to_millis`,
    /// newest first.
    pub fn readings_in_range(
        &self,
        device_id: &str,
        from_millis: i64,
        to_millis: i64,
    ) -> Result<Vec<Reading>> {
        let query = ReadingQuery::new()
            .device(device_id)
            .after(from_millis)
            .until(to_millis);
        self.query_readings(&query)
    }

    /// Insert a batch of readings in one transaction.
    ///
    /// Returns one outcome per input reading, in input order. A reading whose
    /// `(device_id, epoch_millis)` is already stored is reported as
    /// [`InsertOutcome::Conflict`] and skipped; every other row still commits.
    /// Any other database error rolls the whole batch back.
    pub fn insert_batch(&self, readings: &[Reading]) -> Result<Vec<InsertOutcome>> {
        if readings.is_empty() {
            return Ok(Vec::new());
        }

        let synced_at = now_unix();
        let tx = self.conn.unchecked_transaction()?;
        let mut outcomes = Vec::with_capacity(readings.len());

        {
            let mut ensure_device = tx.prepare_cached(
                "INSERT OR IGNORE INTO devices (id, first_seen, last_seen) VALUES (?1, ?2, ?2)",
            )?;
            let mut insert = tx.prepare_cached(
                "INSERT INTO readings (device_id, epoch_millis, recorded_at, device_info,
                 payload, synced_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            )?;

            for reading in readings {
                ensure_device.execute(rusqlite::params![reading.device_id, synced_at])?;

                let result = insert.execute(rusqlite::params![
                    reading.device_id,
                    reading.epoch_millis,
                    format_recorded_at(reading.epoch_millis)?,
                    serde_json::to_string(&reading.device_info)?,
                    serde_json::to_string(&reading.payload)?,
                    synced_at,
                ]);

                match result {
                    Ok(_) => outcomes.push(InsertOutcome::Inserted),
                    Err(e) if is_unique_violation(&e) => {
                        debug!(
                            device_id = %reading.device_id,
                            epoch_millis = reading.epoch_millis,
                            "Reading already stored, skipping"
                        );
                        outcomes.push(InsertOutcome::Conflict);
                    }
                    Err(e) => return Err(e.into()),
                }
            }
        }

        tx.commit()?;

        let inserted = outcomes.iter().filter(|o| o.is_inserted()).count();
        info!(
            "Inserted {} of {} readings ({} conflicts)",
            inserted,
            readings.len(),
            readings.len() - inserted
        );

        Ok(outcomes)
    }

    /// Count readings, optionally for one device.
    pub fn count_readings(&self, device_id: Option<&str>) -> Result<u64> {
        let count: i64 = match device_id {
            Some(id) => self.conn.query_row(
                "SELECT COUNT(*) FROM readings WHERE device_id = ?",
                [id],
                |row| row.get(0),
            )?,
            None => self
                .conn
                .query_row("SELECT COUNT(*) FROM readings", [], |row| row.get(0))?,
        };

        Ok(count as u64)
    }
}

// Sync run log
impl Store {
    /// Record the outcome of one device's synchronization.
    pub fn record_sync_run(&self, run: &SyncRun) -> Result<i64> {
        self.conn.execute(
            "INSERT INTO sync_runs (device_id, started_at, finished_at, fetched, inserted,
             conflicts, malformed, gaps_skipped, error)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            rusqlite::params![
                run.device_id,
                run.started_at.unix_timestamp(),
                run.finished_at.unix_timestamp(),
                run.fetched,
                run.inserted,
                run.conflicts,
                run.malformed,
                run.gaps_skipped,
                run.error,
            ],
        )?;

        debug!(
            "Recorded sync run for {}: inserted={}, error={:?}",
            run.device_id, run.inserted, run.error
        );

        Ok(self.conn.last_insert_rowid())
    }

    /// The most recent sync run for a device.
    pub fn last_sync_run(&self, device_id: &str) -> Result<Option<SyncRun>> {
        let run = self
            .conn
            .query_row(
                "SELECT device_id, started_at, finished_at, fetched, inserted, conflicts,
                 malformed, gaps_skipped, error
                 FROM sync_runs WHERE device_id = ?
                 ORDER BY finished_at DESC, id DESC LIMIT 1",
                [device_id],
                row_to_sync_run,
            )
            .optional()?;

        Ok(run)
    }

    /// Overview of every known device.
    pub fn device_summaries(&self) -> Result<Vec<DeviceSummary>> {
        let mut summaries = Vec::new();

        for device in self.list_devices()? {
            let reading_count = self.count_readings(Some(&device.id))?;
            let latest_epoch_millis: Option<i64> = self.conn.query_row(
                "SELECT MAX(epoch_millis) FROM readings WHERE device_id = ?",
                [&device.id],
                |row| row.get(0),
            )?;
            let last_run = self.last_sync_run(&device.id)?;

            summaries.push(DeviceSummary {
                device,
                reading_count,
                latest_epoch_millis,
                last_run,
            });
        }

        Ok(summaries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ambisync_types::RawRecord;
    use serde_json::json;

    const DEVICE: &str = "AA:BB:CC:DD:EE:FF";

    fn reading(device_id: &str, epoch_millis: i64) -> Reading {
        let device = Device::new(device_id).with_info(json!({"name": "Backyard"}));
        let record = RawRecord(json!({"dateutc": epoch_millis, "tempf": 60.0}))
            .parse()
            .unwrap();
        Reading::from_record(&device, record).unwrap()
    }

    #[test]
    fn test_open_in_memory() {
        let store = Store::open_in_memory().unwrap();
        assert!(store.list_devices().unwrap().is_empty());
        assert_eq!(store.count_readings(None).unwrap(), 0);
    }

    #[test]
    fn test_open_creates_parent_directories() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("data.db");

        {
            let store = Store::open(&path).unwrap();
            store.insert_batch(&[reading(DEVICE, 1_000)]).unwrap();
        }

        assert!(path.exists());
        let reopened = Store::open(&path).unwrap();
        assert_eq!(reopened.count_readings(Some(DEVICE)).unwrap(), 1);
    }

    #[test]
    fn test_upsert_device() {
        let store = Store::open_in_memory().unwrap();

        let device = Device::new(DEVICE).with_info(json!({"name": "Backyard"}));
        let stored = store.upsert_device(&device).unwrap();
        assert_eq!(stored.id, DEVICE);
        assert_eq!(stored.info, json!({"name": "Backyard"}));

        let renamed = Device::new(DEVICE).with_info(json!({"name": "Roof"}));
        assert_eq!(store.upsert_device(&renamed).unwrap().info, json!({"name": "Roof"}));

        // Missing metadata keeps what was stored
        let bare = Device::new(DEVICE);
        assert_eq!(store.upsert_device(&bare).unwrap().info, json!({"name": "Roof"}));

        assert_eq!(store.list_devices().unwrap().len(), 1);
    }

    #[test]
    fn test_insert_and_query_round_trip() {
        let store = Store::open_in_memory().unwrap();
        let original = reading(DEVICE, 1_577_836_800_000);

        let outcomes = store.insert_batch(std::slice::from_ref(&original)).unwrap();
        assert_eq!(outcomes, vec![InsertOutcome::Inserted]);

        let stored = store.latest_reading(DEVICE).unwrap().unwrap();
        assert_eq!(stored, original);
        assert_eq!(stored.device_info, json!({"name": "Backyard"}));
    }

    #[test]
    fn test_insert_batch_reports_conflicts_and_commits_the_rest() {
        let store = Store::open_in_memory().unwrap();
        store.insert_batch(&[reading(DEVICE, 2_000)]).unwrap();

        let batch = vec![
            reading(DEVICE, 1_000),
            reading(DEVICE, 2_000),
            reading(DEVICE, 3_000),
        ];
        let outcomes = store.insert_batch(&batch).unwrap();

        assert_eq!(
            outcomes,
            vec![
                InsertOutcome::Inserted,
                InsertOutcome::Conflict,
                InsertOutcome::Inserted
            ]
        );
        assert_eq!(store.count_readings(Some(DEVICE)).unwrap(), 3);
    }

    #[test]
    fn test_same_timestamp_on_different_devices() {
        let store = Store::open_in_memory().unwrap();
        let outcomes = store
            .insert_batch(&[reading(DEVICE, 1_000), reading("11:22:33:44:55:66", 1_000)])
            .unwrap();
        assert!(outcomes.iter().all(|o| o.is_inserted()));
        assert_eq!(store.count_readings(None).unwrap(), 2);
    }

    #[test]
    fn test_latest_reading_uses_epoch_order() {
        let store = Store::open_in_memory().unwrap();
        store
            .insert_batch(&[reading(DEVICE, 3_000), reading(DEVICE, 1_000)])
            .unwrap();
        store.insert_batch(&[reading(DEVICE, 2_000)]).unwrap();

        let latest = store.latest_reading(DEVICE).unwrap().unwrap();
        assert_eq!(latest.epoch_millis, 3_000);
        assert!(store.latest_reading("unknown").unwrap().is_none());
    }

    #[test]
    fn test_readings_in_range_bounds() {
        let store = Store::open_in_memory().unwrap();
        let batch: Vec<_> = (1..=5).map(|i| reading(DEVICE, i * 1_000)).collect();
        store.insert_batch(&batch).unwrap();

        let range = store.readings_in_range(DEVICE, 2_000, 4_000).unwrap();
        let millis: Vec<_> = range.iter().map(|r| r.epoch_millis).collect();
        // Lower bound exclusive, upper inclusive, newest first
        assert_eq!(millis, vec![4_000, 3_000]);
    }

    #[test]
    fn test_sync_runs() {
        let store = Store::open_in_memory().unwrap();
        store.upsert_device(&Device::new(DEVICE)).unwrap();
        assert!(store.last_sync_run(DEVICE).unwrap().is_none());

        let now = OffsetDateTime::from_unix_timestamp(1_700_000_000).unwrap();
        let run = SyncRun {
            device_id: DEVICE.to_string(),
            started_at: now,
            finished_at: now,
            fetched: 10,
            inserted: 9,
            conflicts: 1,
            malformed: 0,
            gaps_skipped: 2,
            error: None,
        };
        store.record_sync_run(&run).unwrap();

        let failed = SyncRun {
            inserted: 0,
            error: Some("remote unavailable".to_string()),
            ..run.clone()
        };
        store.record_sync_run(&failed).unwrap();

        let last = store.last_sync_run(DEVICE).unwrap().unwrap();
        assert_eq!(last, failed);
        assert!(!last.succeeded());
    }

    #[test]
    fn test_device_summaries() {
        let store = Store::open_in_memory().unwrap();
        store
            .upsert_device(&Device::new(DEVICE).with_info(json!({"name": "Backyard"})))
            .unwrap();
        store
            .insert_batch(&[reading(DEVICE, 1_000), reading(DEVICE, 5_000)])
            .unwrap();

        let summaries = store.device_summaries().unwrap();
        assert_eq!(summaries.len(), 1);
        assert_eq!(summaries[0].reading_count, 2);
        assert_eq!(summaries[0].latest_epoch_millis, Some(5_000));
        assert!(summaries[0].last_run.is_none());
    }
}
