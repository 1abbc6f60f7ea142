//! Scheduled synchronization service for weather-station telemetry.
//!
//! This crate provides a service that:
//! - Reads its configuration from TOML, with credentials from the environment
//!   or a `.env` file
//! - Lists devices from the remote API, or from a static list in the config
//! - Runs a synchronization pass on a fixed interval, one pass at a time
//! - Reports stored readings and past sync runs per device
//!
//! # Configuration
//!
//! The service reads configuration from `~/.config/ambisync/server.toml`:
//!
//! ```toml
//! [remote]
//! endpoint = "https://rt.ambientweather.net/v1"
//! api_key = "..."            # or AMBIENT_API_KEY
//! application_key = "..."    # or AMBIENT_APPLICATION_KEY
//!
//! [storage]
//! path = "~/.local/share/ambisync/data.db"
//!
//! [sync]
//! history_start = 1577836800000   # or AMBIENT_DATA_START_TIMESTAMP
//! interval_secs = 300
//! device_timeout_secs = 300    # hard limit per device and pass
//! search_budget_secs = 240     # an unfinished gap search resumes next pass
//!
//! [[devices]]
//! mac_address = "AA:BB:CC:DD:EE:FF"
//! info = { name = "Backyard" }
//! ```

pub mod config;
pub mod runner;
pub mod status;

pub use config::{Config, ConfigError, ValidationError, default_config_path, read_env_file};
pub use runner::Runner;
pub use status::{DeviceListing, DeviceStatus, collect_listing, collect_status};
