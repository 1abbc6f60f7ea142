//! Core data types for devices, fetched records, and stored readings.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use time::OffsetDateTime;

use crate::clock::{ONE_DAY_MS, millis_to_datetime};
use crate::error::{ParseError, ParseResult};

/// Name of the epoch-millisecond field carried by every remote record.
pub const EPOCH_FIELD: &str = "dateutc";

/// Opaque measurement payload (a JSON object).
pub type Payload = Map<String, Value>;

/// A telemetry device, as supplied by the device directory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Device {
    /// Physical (MAC) address, unique per device.
    #[serde(rename = "macAddress")]
    pub mac_address: String,
    /// Descriptive metadata, stored as-is.
    #[serde(default)]
    pub info: Value,
}

impl Device {
    /// Create a device with no metadata.
    pub fn new(mac_address: impl Into<String>) -> Self {
        Self {
            mac_address: mac_address.into(),
            info: Value::Null,
        }
    }

    /// Attach descriptive metadata.
    #[must_use]
    pub fn with_info(mut self, info: Value) -> Self {
        self.info = info;
        self
    }

    /// Human-friendly name from the metadata, if the directory provided one.
    pub fn display_name(&self) -> &str {
        self.info
            .get("name")
            .and_then(Value::as_str)
            .unwrap_or(&self.mac_address)
    }
}

/// A record exactly as returned by the remote API.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RawRecord(pub Value);

impl RawRecord {
    /// Validate the record and extract its epoch timestamp.
    pub fn parse(self) -> ParseResult<Record> {
        let Value::Object(payload) = self.0 else {
            return Err(ParseError::NotAnObject);
        };
        let epoch_millis = match payload.get(EPOCH_FIELD) {
            None | Some(Value::Null) => {
                return Err(ParseError::MissingEpoch { field: EPOCH_FIELD });
            }
            Some(v) => v.as_i64().ok_or_else(|| ParseError::InvalidEpoch {
                field: EPOCH_FIELD,
                value: v.to_string(),
            })?,
        };
        Ok(Record {
            epoch_millis,
            payload,
        })
    }
}

impl From<Value> for RawRecord {
    fn from(value: Value) -> Self {
        Self(value)
    }
}

/// A validated remote record: a payload with a known epoch timestamp.
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    /// Epoch timestamp in milliseconds.
    pub epoch_millis: i64,
    /// The full record, including the epoch field.
    pub payload: Payload,
}

/// A persisted telemetry reading.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reading {
    /// Device the reading belongs to.
    pub device_id: String,
    /// Epoch timestamp in milliseconds; unique per device.
    pub epoch_millis: i64,
    /// Wall-clock rendering of `epoch_millis` (UTC).
    #[serde(with = "time::serde::rfc3339")]
    pub recorded_at: OffsetDateTime,
    /// Device metadata captured when the reading was synchronized.
    #[serde(default)]
    pub device_info: Value,
    /// Measurement fields.
    pub payload: Payload,
}

impl Reading {
    /// Tag a fetched record with its device, deriving `recorded_at`.
    pub fn from_record(device: &Device, record: Record) -> ParseResult<Self> {
        Ok(Self {
            device_id: device.mac_address.clone(),
            epoch_millis: record.epoch_millis,
            recorded_at: millis_to_datetime(record.epoch_millis)?,
            device_info: device.info.clone(),
            payload: record.payload,
        })
    }
}

/// The query window computed for one device in one pass. Not persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncWindow<'a> {
    /// Device being synchronized.
    pub device_id: &'a str,
    /// End of the first remote page to request.
    pub query_end_millis: i64,
    /// How far back from `query_end_millis` stored readings are loaded.
    pub lookback_millis: i64,
}

impl<'a> SyncWindow<'a> {
    /// Create a window with the default one-day lookback.
    pub fn new(device_id: &'a str, query_end_millis: i64) -> Self {
        Self {
            device_id,
            query_end_millis,
            lookback_millis: ONE_DAY_MS,
        }
    }

    /// Exclusive lower bound of the stored-reading window.
    pub fn from_millis(&self) -> i64 {
        self.query_end_millis.saturating_sub(self.lookback_millis)
    }
}
