//! Shared types for ambisync.
//!
//! This crate holds the data model used by the store, the synchronization
//! engine, and the service:
//!
//! - [`Device`] as supplied by the device directory
//! - [`RawRecord`] as returned by the remote API, and its validated form [`Record`]
//! - [`Reading`], the persisted unit, keyed by `(device_id, epoch_millis)`
//! - [`SyncWindow`], the per-pass query window
//! - [`Clock`] and epoch-millisecond conversions
//!
//! # Example
//!
//! ```
//! use ambisync_types::{Device, RawRecord, Reading};
//! use serde_json::json;
//!
//! let device = Device::new("AA:BB:CC:DD:EE:FF");
//! let record = RawRecord(json!({"dateutc": 1_577_836_800_000i64, "tempf": 50.1})).parse()?;
//! let reading = Reading::from_record(&device, record)?;
//! assert_eq!(reading.recorded_at.unix_timestamp(), 1_577_836_800);
//! # Ok::<(), ambisync_types::ParseError>(())
//! ```

pub mod clock;
pub mod error;
pub mod types;

pub use clock::{
    Clock, FIVE_MINUTES_MS, FixedClock, ONE_DAY_MS, SIX_HOURS_MS, SystemClock, THIRTY_MINUTES_MS,
    datetime_to_millis, format_recorded_at, millis_to_datetime,
};
pub use error::{ParseError, ParseResult};
pub use types::{Device, EPOCH_FIELD, Payload, RawRecord, Reading, Record, SyncWindow};
