//! Service configuration.
//!
//! Settings come from a TOML file. Credentials and the history start may
//! also come from the environment or a `.env` file; variables already set in
//! the process environment win over the file.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use ambisync_core::SyncOptions;
use ambisync_core::client::{DEFAULT_ENDPOINT, DEFAULT_TIMEOUT};
use ambisync_core::options::{DEFAULT_CATCH_UP_THRESHOLD, DEFAULT_PAGE_LIMIT};
use ambisync_types::Device;

/// Environment variable holding the account API key.
pub const ENV_API_KEY: &str = "AMBIENT_API_KEY";
/// Environment variable holding the application key.
pub const ENV_APPLICATION_KEY: &str = "AMBIENT_APPLICATION_KEY";
/// Environment variable holding the history start (epoch milliseconds).
pub const ENV_HISTORY_START: &str = "AMBIENT_DATA_START_TIMESTAMP";

/// Largest page the remote API will serve.
pub const MAX_PAGE_LIMIT: u32 = 288;
/// Minimum time between passes in seconds.
pub const MIN_INTERVAL_SECS: u64 = 10;
/// Maximum time between passes in seconds (1 day).
pub const MAX_INTERVAL_SECS: u64 = 86_400;

/// Service configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Remote API settings.
    pub remote: RemoteConfig,
    /// Storage settings.
    pub storage: StorageConfig,
    /// Synchronization settings.
    pub sync: SyncConfig,
    /// Devices to synchronize. When empty, the remote device list is used.
    #[serde(default)]
    pub devices: Vec<DeviceConfig>,
}

impl Config {
    /// Load configuration from the default path.
    pub fn load_default() -> Result<Self, ConfigError> {
        let path = default_config_path();
        if path.exists() {
            Self::load(&path)
        } else {
            Ok(Self::default())
        }
    }

    /// Load configuration from a file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| ConfigError::Read {
            path: path.as_ref().to_path_buf(),
            source: e,
        })?;
        toml::from_str(&content).map_err(|e| ConfigError::Parse {
            path: path.as_ref().to_path_buf(),
            source: e,
        })
    }

    /// Save configuration to a file.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let content = toml::to_string_pretty(self).map_err(ConfigError::Serialize)?;

        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent).map_err(|e| ConfigError::Write {
                path: parent.to_path_buf(),
                source: e,
            })?;
        }

        std::fs::write(path.as_ref(), content).map_err(|e| ConfigError::Write {
            path: path.as_ref().to_path_buf(),
            source: e,
        })
    }

    /// Fill credentials and history start from the process environment.
    pub fn apply_env(&mut self) -> Result<(), ConfigError> {
        self.apply_env_from(|name| std::env::var(name).ok())
    }

    /// Fill credentials and history start from a `.env` file, falling back
    /// to the file only for variables missing from the process environment.
    pub fn apply_env_file<P: AsRef<Path>>(&mut self, path: P) -> Result<(), ConfigError> {
        let file_vars = read_env_file(path)?;
        self.apply_env_from(|name| {
            std::env::var(name)
                .ok()
                .or_else(|| file_vars.get(name).cloned())
        })
    }

    /// Fill credentials and history start from `lookup`.
    ///
    /// Environment values take precedence over the file.
    pub fn apply_env_from<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(key) = lookup(ENV_API_KEY) {
            self.remote.api_key = key;
        }
        if let Some(key) = lookup(ENV_APPLICATION_KEY) {
            self.remote.application_key = key;
        }
        if let Some(value) = lookup(ENV_HISTORY_START) {
            let millis = value.trim().parse::<i64>().map_err(|_| ConfigError::Env {
                name: ENV_HISTORY_START,
                value: value.clone(),
            })?;
            self.sync.history_start = Some(millis);
        }
        Ok(())
    }

    /// Validate the configuration and return any errors.
    ///
    /// This checks:
    /// - The remote endpoint is an http(s) URL and the timeout is non-zero
    /// - Storage path is not empty
    /// - Sync tunables are within bounds
    /// - Device addresses are present and unique
    ///
    /// Credentials are checked separately by
    /// [`validate_for_sync`](Self::validate_for_sync), since read-only commands
    /// do not need them.
    ///
    /// # Example
    ///
    /// ```
    /// use ambisync_service::Config;
    ///
    /// let config = Config::default();
    /// config.validate().expect("Default config should be valid");
    /// ```
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut errors = Vec::new();

        errors.extend(self.remote.validate());
        errors.extend(self.storage.validate());
        errors.extend(self.sync.validate());

        let mut seen_addresses = std::collections::HashSet::new();
        for (i, device) in self.devices.iter().enumerate() {
            let prefix = format!("devices[{}]", i);
            errors.extend(device.validate(&prefix));

            let addr_lower = device.mac_address.to_lowercase();
            if !seen_addresses.insert(addr_lower) {
                errors.push(ValidationError {
                    field: format!("{}.mac_address", prefix),
                    message: format!("duplicate device address '{}'", device.mac_address),
                });
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Validation(errors))
        }
    }

    /// Validate everything needed to talk to the remote API and sync.
    pub fn validate_for_sync(&self) -> Result<(), ConfigError> {
        let mut errors = match self.validate() {
            Ok(()) => Vec::new(),
            Err(ConfigError::Validation(errors)) => errors,
            Err(e) => return Err(e),
        };

        if self.remote.api_key.is_empty() {
            errors.push(ValidationError {
                field: "remote.api_key".to_string(),
                message: format!("API key is required (set it here or via {ENV_API_KEY})"),
            });
        }
        if self.remote.application_key.is_empty() {
            errors.push(ValidationError {
                field: "remote.application_key".to_string(),
                message: format!(
                    "application key is required (set it here or via {ENV_APPLICATION_KEY})"
                ),
            });
        }
        if self.sync.history_start.is_none() {
            errors.push(ValidationError {
                field: "sync.history_start".to_string(),
                message: format!(
                    "history start is required (set it here or via {ENV_HISTORY_START})"
                ),
            });
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Validation(errors))
        }
    }

    /// Engine options derived from the `[sync]` section.
    ///
    /// Catch-up lookahead and lookback follow the page span unless set.
    pub fn to_sync_options(&self) -> SyncOptions {
        let sync = &self.sync;
        let mut options = SyncOptions::new(sync.history_start.unwrap_or_default())
            .page_limit(sync.page_limit)
            .gap_skip_millis(secs_to_millis(sync.gap_skip_secs))
            .report_interval_millis(secs_to_millis(sync.report_interval_secs))
            .catch_up_threshold(sync.catch_up_threshold)
            .fit_windows_to_page()
            .search_budget(sync.search_budget())
            .device_timeout(sync.device_timeout())
            .delays(
                Duration::from_millis(sync.probe_delay_ms),
                Duration::from_millis(sync.device_delay_ms),
            );
        if let Some(secs) = sync.catch_up_lookahead_secs {
            options = options.catch_up_lookahead_millis(secs_to_millis(secs));
        }
        if let Some(secs) = sync.lookback_secs {
            options = options.lookback_millis(secs_to_millis(secs));
        }
        options
    }

    /// Devices from the static list, tagged with their metadata.
    pub fn static_devices(&self) -> Vec<Device> {
        self.devices.iter().map(DeviceConfig::to_device).collect()
    }
}

/// Read `KEY=value` pairs from a `.env` file without touching the process
/// environment.
pub fn read_env_file<P: AsRef<Path>>(path: P) -> Result<HashMap<String, String>, ConfigError> {
    let path = path.as_ref();
    let env_file_error = |source| ConfigError::EnvFile {
        path: path.to_path_buf(),
        source,
    };
    dotenv::from_path_iter(path)
        .map_err(env_file_error)?
        .collect::<Result<HashMap<_, _>, _>>()
        .map_err(env_file_error)
}

fn secs_to_millis(secs: u64) -> i64 {
    i64::try_from(secs.saturating_mul(1_000)).unwrap_or(i64::MAX)
}

/// Remote API configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RemoteConfig {
    /// API root URL.
    pub endpoint: String,
    /// Account API key.
    pub api_key: String,
    /// Application key.
    pub application_key: String,
    /// Per-request timeout in seconds.
    pub timeout_secs: u64,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            endpoint: DEFAULT_ENDPOINT.to_string(),
            api_key: String::new(),
            application_key: String::new(),
            timeout_secs: DEFAULT_TIMEOUT.as_secs(),
        }
    }
}

impl RemoteConfig {
    /// Validate remote configuration.
    pub fn validate(&self) -> Vec<ValidationError> {
        let mut errors = Vec::new();

        if !self.endpoint.starts_with("http://") && !self.endpoint.starts_with("https://") {
            errors.push(ValidationError {
                field: "remote.endpoint".to_string(),
                message: format!(
                    "invalid endpoint '{}': must start with http:// or https://",
                    self.endpoint
                ),
            });
        }

        if self.timeout_secs == 0 {
            errors.push(ValidationError {
                field: "remote.timeout_secs".to_string(),
                message: "timeout cannot be 0".to_string(),
            });
        }

        errors
    }

    /// Request timeout.
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Storage configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Database file path.
    pub path: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            path: ambisync_store::default_db_path(),
        }
    }
}

impl StorageConfig {
    /// Validate storage configuration.
    pub fn validate(&self) -> Vec<ValidationError> {
        let mut errors = Vec::new();

        if self.path.as_os_str().is_empty() {
            errors.push(ValidationError {
                field: "storage.path".to_string(),
                message: "database path cannot be empty".to_string(),
            });
        }

        errors
    }
}

/// Synchronization configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Where to start for devices with no stored readings (epoch millis).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub history_start: Option<i64>,
    /// Seconds between passes in run mode.
    pub interval_secs: u64,
    /// Hard limit on one device's turn in a pass, in seconds.
    pub device_timeout_secs: u64,
    /// Time one device may spend searching gaps per pass, in seconds. An
    /// unfinished search resumes on the next pass.
    pub search_budget_secs: u64,
    /// Records requested per remote call.
    pub page_limit: u32,
    /// How far an empty probe advances the window, in seconds.
    pub gap_skip_secs: u64,
    /// Nominal station reporting interval, in seconds.
    pub report_interval_secs: u64,
    /// Missed reports after which the search walks forward from stored data.
    pub catch_up_threshold: i64,
    /// Pause between devices, in milliseconds.
    pub device_delay_ms: u64,
    /// Pause between gap-skip probes, in milliseconds.
    pub probe_delay_ms: u64,
    /// Jump past the high-water mark when catching up, in seconds. Defaults
    /// to the page span minus six reports.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub catch_up_lookahead_secs: Option<u64>,
    /// Stored history loaded for deduplication, in seconds. Defaults to the
    /// page span.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lookback_secs: Option<u64>,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            history_start: None,
            interval_secs: 300,
            device_timeout_secs: 300,
            search_budget_secs: 240,
            page_limit: DEFAULT_PAGE_LIMIT,
            gap_skip_secs: 6 * 60 * 60,
            report_interval_secs: 300,
            catch_up_threshold: DEFAULT_CATCH_UP_THRESHOLD,
            device_delay_ms: 1_000,
            probe_delay_ms: 1_000,
            catch_up_lookahead_secs: None,
            lookback_secs: None,
        }
    }
}

impl SyncConfig {
    /// Validate sync configuration.
    pub fn validate(&self) -> Vec<ValidationError> {
        let mut errors = Vec::new();
        let mut push = |field: &str, message: String| {
            errors.push(ValidationError {
                field: format!("sync.{}", field),
                message,
            })
        };

        if let Some(start) = self.history_start {
            if start < 0 {
                push(
                    "history_start",
                    format!("history start {} cannot be negative", start),
                );
            }
        }

        if self.interval_secs < MIN_INTERVAL_SECS {
            push(
                "interval_secs",
                format!(
                    "interval {} is too short (minimum {} seconds)",
                    self.interval_secs, MIN_INTERVAL_SECS
                ),
            );
        } else if self.interval_secs > MAX_INTERVAL_SECS {
            push(
                "interval_secs",
                format!(
                    "interval {} is too long (maximum {} seconds / 1 day)",
                    self.interval_secs, MAX_INTERVAL_SECS
                ),
            );
        }

        if self.device_timeout_secs == 0 {
            push("device_timeout_secs", "device timeout cannot be 0".to_string());
        }
        if self.search_budget_secs == 0 {
            push("search_budget_secs", "search budget cannot be 0".to_string());
        } else if self.device_timeout_secs > 0
            && self.search_budget_secs >= self.device_timeout_secs
        {
            push(
                "search_budget_secs",
                format!(
                    "search budget {}s must be shorter than the device timeout {}s",
                    self.search_budget_secs, self.device_timeout_secs
                ),
            );
        }

        if self.page_limit == 0 || self.page_limit > MAX_PAGE_LIMIT {
            push(
                "page_limit",
                format!(
                    "page limit {} must be between 1 and {}",
                    self.page_limit, MAX_PAGE_LIMIT
                ),
            );
        }

        if self.gap_skip_secs == 0 {
            push("gap_skip_secs", "gap skip cannot be 0".to_string());
        }

        if self.report_interval_secs == 0 {
            push(
                "report_interval_secs",
                "report interval cannot be 0".to_string(),
            );
        }

        if self.catch_up_threshold < 0 {
            push(
                "catch_up_threshold",
                format!(
                    "catch-up threshold {} cannot be negative",
                    self.catch_up_threshold
                ),
            );
        }

        if self.catch_up_lookahead_secs == Some(0) {
            push(
                "catch_up_lookahead_secs",
                "catch-up lookahead cannot be 0".to_string(),
            );
        }
        if self.lookback_secs == Some(0) {
            push("lookback_secs", "lookback cannot be 0".to_string());
        }

        errors
    }

    /// Time between passes.
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    /// Hard limit on one device's turn in a pass.
    pub fn device_timeout(&self) -> Duration {
        Duration::from_secs(self.device_timeout_secs)
    }

    /// Gap-search allowance per device and pass.
    pub fn search_budget(&self) -> Duration {
        Duration::from_secs(self.search_budget_secs)
    }
}

/// A device listed in the configuration file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// Station MAC address.
    pub mac_address: String,
    /// Descriptive metadata stored with each reading.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub info: Option<serde_json::Value>,
}

impl DeviceConfig {
    /// Validate device configuration.
    pub fn validate(&self, prefix: &str) -> Vec<ValidationError> {
        let mut errors = Vec::new();

        if self.mac_address.trim().is_empty() {
            errors.push(ValidationError {
                field: format!("{}.mac_address", prefix),
                message: "device address cannot be empty".to_string(),
            });
        }

        errors
    }

    /// Convert to the engine's device type.
    pub fn to_device(&self) -> Device {
        let device = Device::new(self.mac_address.clone());
        match &self.info {
            Some(info) => device.with_info(info.clone()),
            None => device,
        }
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("Failed to serialize config: {0}")]
    Serialize(toml::ser::Error),
    #[error("Failed to write config file {path}: {source}")]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Invalid value for {name}: '{value}' is not an epoch timestamp in milliseconds")]
    Env { name: &'static str, value: String },
    #[error("Failed to read env file {path}: {source}")]
    EnvFile {
        path: PathBuf,
        source: dotenv::Error,
    },
    #[error("Configuration validation failed:\n{}", format_validation_errors(.0))]
    Validation(Vec<ValidationError>),
}

/// A single validation error with context.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    /// The field path (e.g., `sync.page_limit` or `devices[0].mac_address`).
    pub field: String,
    /// Description of the validation failure.
    pub message: String,
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

fn format_validation_errors(errors: &[ValidationError]) -> String {
    errors
        .iter()
        .map(|e| format!("  - {}", e))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Default configuration file path.
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("ambisync")
        .join("server.toml")
}
