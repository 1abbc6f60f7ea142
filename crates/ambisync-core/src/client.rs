//! HTTP client for the Ambient Weather REST API.
//!
//! [`AmbientClient`] implements both [`RemoteSource`] and [`DeviceDirectory`]:
//!
//! - `GET {endpoint}/devices` lists the account's devices
//! - `GET {endpoint}/devices/{mac}?endDate=..&limit=..` returns up to `limit`
//!   records at or before `endDate`, newest first
//!
//! Both keys travel as opaque `apiKey` / `applicationKey` query parameters.
//! Transient failures (transport errors, HTTP 429, HTTP 5xx) are retried with
//! backoff; everything else is returned on first failure.
//!
//! # Example
//!
//! ```no_run
//! use ambisync_core::{AmbientClient, DeviceDirectory};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let client = AmbientClient::new("https://rt.ambientweather.net/v1", "api-key", "app-key")?;
//! for device in client.devices().await? {
//!     println!("{}", device.display_name());
//! }
//! # Ok(())
//! # }
//! ```

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::de::DeserializeOwned;
use tracing::debug;

use ambisync_types::{Device, RawRecord};

use crate::error::{Error, RemoteError, Result};
use crate::retry::{RetryConfig, with_retry};
use crate::traits::{DeviceDirectory, RemoteSource};

/// Public Ambient Weather API endpoint.
pub const DEFAULT_ENDPOINT: &str = "https://rt.ambientweather.net/v1";

/// Default per-request timeout.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// HTTP client for the remote telemetry API.
#[derive(Debug, Clone)]
pub struct AmbientClient {
    client: Client,
    base_url: String,
    api_key: String,
    application_key: String,
    retry: RetryConfig,
}

impl AmbientClient {
    /// Create a client with the default timeout and retry settings.
    ///
    /// # Arguments
    ///
    /// * `base_url` - API root, e.g. `https://rt.ambientweather.net/v1`
    /// * `api_key` - account key
    /// * `application_key` - application key
    pub fn new(base_url: &str, api_key: &str, application_key: &str) -> Result<Self> {
        let client = Client::builder()
            .timeout(DEFAULT_TIMEOUT)
            .build()
            .map_err(|e| Error::invalid_config(format!("Failed to build HTTP client: {e}")))?;
        Self::with_client(base_url, api_key, application_key, client)
    }

    /// Create a client around a custom reqwest [`Client`].
    pub fn with_client(
        base_url: &str,
        api_key: &str,
        application_key: &str,
        client: Client,
    ) -> Result<Self> {
        // Normalize URL (remove trailing slash)
        let base_url = base_url.trim_end_matches('/').to_string();

        if !base_url.starts_with("http://") && !base_url.starts_with("https://") {
            return Err(Error::invalid_config(format!(
                "Endpoint must start with http:// or https://, got: {}",
                base_url
            )));
        }

        Ok(Self {
            client,
            base_url,
            api_key: api_key.to_string(),
            application_key: application_key.to_string(),
            retry: RetryConfig::for_remote(),
        })
    }

    /// Replace the underlying client with one using `timeout`.
    pub fn with_timeout(mut self, timeout: Duration) -> Result<Self> {
        self.client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::invalid_config(format!("Failed to build HTTP client: {e}")))?;
        Ok(self)
    }

    /// Use a custom retry policy.
    #[must_use]
    pub fn with_retry_config(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Get the base URL.
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn devices_url(&self) -> String {
        format!("{}/devices", self.base_url)
    }

    fn device_data_url(&self, mac_address: &str) -> String {
        format!("{}/devices/{}", self.base_url, mac_address)
    }

    fn auth_params(&self) -> [(&'static str, &str); 2] {
        [
            ("apiKey", self.api_key.as_str()),
            ("applicationKey", self.application_key.as_str()),
        ]
    }

    async fn get<T: DeserializeOwned>(
        &self,
        url: &str,
        params: &[(&str, String)],
    ) -> std::result::Result<T, RemoteError> {
        let response = self
            .client
            .get(url)
            .query(&self.auth_params())
            .query(params)
            .send()
            .await
            .map_err(|e| RemoteError::Transport {
                url: url.to_string(),
                // The request URL carries the keys
                message: e.without_url().to_string(),
            })?;

        let status = response.status();
        if status.is_success() {
            response
                .json()
                .await
                .map_err(|e| RemoteError::InvalidResponse(e.without_url().to_string()))
        } else {
            let message = response
                .json::<serde_json::Value>()
                .await
                .ok()
                .and_then(|v| v.get("error").and_then(|e| e.as_str()).map(String::from))
                .unwrap_or_else(|| status.to_string());

            Err(status_error(status, message))
        }
    }
}

/// Map a non-success status to a [`RemoteError`].
fn status_error(status: StatusCode, message: String) -> RemoteError {
    if status == StatusCode::TOO_MANY_REQUESTS {
        RemoteError::RateLimited
    } else {
        RemoteError::Status {
            status: status.as_u16(),
            message,
        }
    }
}

#[async_trait]
impl RemoteSource for AmbientClient {
    async fn fetch(
        &self,
        device_id: &str,
        end_millis: i64,
        limit: u32,
    ) -> std::result::Result<Vec<RawRecord>, RemoteError> {
        let url = self.device_data_url(device_id);
        let params = [
            ("endDate", end_millis.to_string()),
            ("limit", limit.to_string()),
        ];

        debug!(device_id, end_millis, limit, "Fetching device data");
        with_retry(&self.retry, "fetch_device_data", || self.get(&url, &params)).await
    }
}

#[async_trait]
impl DeviceDirectory for AmbientClient {
    async fn devices(&self) -> std::result::Result<Vec<Device>, RemoteError> {
        let url = self.devices_url();
        let devices: Vec<Device> =
            with_retry(&self.retry, "list_devices", || self.get(&url, &[])).await?;
        debug!(count = devices.len(), "Listed devices");
        Ok(devices)
    }
}
