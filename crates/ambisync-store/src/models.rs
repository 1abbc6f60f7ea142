//! Data models for stored data.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::OffsetDateTime;

/// A device stored in the database.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredDevice {
    /// Device MAC address.
    pub id: String,
    /// Last metadata reported by the device directory.
    pub info: Value,
    /// First time this device was synchronized.
    #[serde(with = "time::serde::rfc3339")]
    pub first_seen: OffsetDateTime,
    /// Last time this device was synchronized.
    #[serde(with = "time::serde::rfc3339")]
    pub last_seen: OffsetDateTime,
}

/// Result of inserting one reading from a batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InsertOutcome {
    /// The row was written.
    Inserted,
    /// A row with the same `(device_id, epoch_millis)` already existed.
    Conflict,
}

impl InsertOutcome {
    /// Whether the row was written.
    pub fn is_inserted(self) -> bool {
        matches!(self, Self::Inserted)
    }
}

/// Outcome of one device's synchronization in one pass.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncRun {
    /// Device identifier.
    pub device_id: String,
    /// When the device's sync started.
    #[serde(with = "time::serde::rfc3339")]
    pub started_at: OffsetDateTime,
    /// When it finished (successfully or not).
    #[serde(with = "time::serde::rfc3339")]
    pub finished_at: OffsetDateTime,
    /// Valid records returned by the remote.
    pub fetched: u32,
    /// Rows written.
    pub inserted: u32,
    /// Rows rejected as already present at insert time.
    pub conflicts: u32,
    /// Records dropped for lacking a usable timestamp.
    pub malformed: u32,
    /// Empty windows skipped while searching for new data.
    pub gaps_skipped: u32,
    /// Error message when the device failed.
    pub error: Option<String>,
}

impl SyncRun {
    /// Whether the run completed without error.
    pub fn succeeded(&self) -> bool {
        self.error.is_none()
    }
}

/// Per-device overview used by status reporting.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceSummary {
    /// The device.
    pub device: StoredDevice,
    /// Number of stored readings.
    pub reading_count: u64,
    /// High-water mark, if any readings are stored.
    pub latest_epoch_millis: Option<i64>,
    /// Most recent sync run, if any.
    pub last_run: Option<SyncRun>,
}
