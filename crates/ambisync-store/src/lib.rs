//! Local persistence for synchronized weather-station readings.
//!
//! This crate provides SQLite-based storage for readings pulled from the
//! remote telemetry API. Readings are keyed by `(device_id, epoch_millis)`
//! and are never updated once written.
//!
//! # Features
//!
//! - High-water mark lookup per device ([`Store::latest_reading`])
//! - Windowed range queries ([`Store::readings_in_range`])
//! - Batched inserts that report duplicate-key conflicts per row
//!   ([`Store::insert_batch`])
//! - A log of per-device sync runs for status reporting
//!
//! # Example
//!
//! ```no_run
//! use ambisync_store::Store;
//!
//! let store = Store::open_default()?;
//! if let Some(latest) = store.latest_reading("AA:BB:CC:DD:EE:FF")? {
//!     println!("latest reading at {}", latest.recorded_at);
//! }
//! # Ok::<(), ambisync_store::Error>(())
//! ```

mod error;
mod models;
mod queries;
mod schema;
mod store;

pub use error::{Error, Result};
pub use models::{DeviceSummary, InsertOutcome, StoredDevice, SyncRun};
pub use queries::ReadingQuery;
pub use store::Store;

/// Default database path following platform conventions.
///
/// - Linux: `~/.local/share/ambisync/data.db`
/// - macOS: `~/Library/Application Support/ambisync/data.db`
/// - Windows: `C:\Users\<user>\AppData\Local\ambisync\data.db`
pub fn default_db_path() -> std::path::PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| std::path::PathBuf::from("."))
        .join("ambisync")
        .join("data.db")
}
