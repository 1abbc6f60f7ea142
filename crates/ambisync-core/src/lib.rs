//! Gap-aware incremental synchronization of weather-station telemetry.
//!
//! This crate pulls timestamped readings for a set of devices from a remote
//! REST API that only serves bounded pages ("up to N records ending at T")
//! and writes the missing ones to a local store, with no gaps and no
//! duplicates.
//!
//! # Features
//!
//! - **Window computation**: decide per device whether one page ending now
//!   covers what is missing, or whether to walk forward from the stored data
//! - **Gap skipping**: step over outages in fixed strides until new data
//!   appears, bounded by the present
//! - **Deduplication**: set-membership against stored readings, plus per-row
//!   conflict reporting from the store for concurrent writers
//! - **Failure isolation**: one failing device never stops the others
//! - **HTTP client**: Ambient Weather API with retry and backoff (`http` feature)
//! - **Test doubles**: [`mock::MockRemote`] and [`mock::MemoryStore`]
//!
//! # Seams
//!
//! | Trait | Production | Tests |
//! |-------|------------|-------|
//! | [`RemoteSource`] | [`AmbientClient`] | [`mock::MockRemote`] |
//! | [`DeviceDirectory`] | [`AmbientClient`], [`StaticDirectory`] | [`mock::MockRemote`] |
//! | [`RecordStore`] | [`ambisync_store::Store`] | [`mock::MemoryStore`] |
//!
//! # Quick Start
//!
//! ```no_run
//! use ambisync_core::{AmbientClient, SyncEngine, SyncOptions};
//! use ambisync_store::Store;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let client = AmbientClient::new("https://rt.ambientweather.net/v1", "api-key", "app-key")?;
//!     let store = Store::open("weather.db")?;
//!     let engine = SyncEngine::new(client.clone(), store, SyncOptions::new(1_577_836_800_000))?;
//!
//!     let report = engine.run_directory_pass(&client).await?;
//!     for (device_id, error) in report.failures() {
//!         eprintln!("{device_id}: {error}");
//!     }
//!     println!("Inserted {} readings", report.inserted_total());
//!     Ok(())
//! }
//! ```

#[cfg(feature = "http")]
pub mod client;
pub mod engine;
pub mod error;
pub mod fetcher;
pub mod mock;
pub mod options;
pub mod retry;
pub mod traits;
pub mod window;

#[cfg(feature = "http")]
pub use client::AmbientClient;
pub use engine::{DeviceOutcome, DeviceReport, PassReport, SyncEngine};
pub use error::{Error, RemoteError, Result};
pub use fetcher::{FetchOutcome, GapAwareFetcher};
pub use options::{DEFAULT_CATCH_UP_THRESHOLD, DEFAULT_PAGE_LIMIT, SyncOptions};
pub use retry::{RetryConfig, with_retry};
pub use traits::{DeviceDirectory, RecordStore, RemoteSource, StaticDirectory};
pub use window::{compute_query_end, sync_window};

// Re-export the data types engine callers need
pub use ambisync_types::{Clock, Device, FixedClock, RawRecord, Reading, SystemClock};
