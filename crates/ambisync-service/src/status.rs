//! Read-only reporting for the `devices` and `status` subcommands.

use serde::Serialize;
use tabled::settings::Style;

use ambisync_store::{Store, SyncRun};
use ambisync_types::{Device, format_recorded_at};

/// Per-device synchronization status.
#[derive(Debug, Clone, Serialize)]
pub struct DeviceStatus {
    pub device_id: String,
    pub name: String,
    pub reading_count: u64,
    pub latest_epoch_millis: Option<i64>,
    pub latest_recorded_at: Option<String>,
    pub last_run: Option<SyncRun>,
}

/// A directory device alongside its stored high-water mark.
#[derive(Debug, Clone, Serialize)]
pub struct DeviceListing {
    pub device_id: String,
    pub name: String,
    pub latest_epoch_millis: Option<i64>,
    pub latest_recorded_at: Option<String>,
}

/// Status of every device known to the store.
pub fn collect_status(store: &Store) -> ambisync_store::Result<Vec<DeviceStatus>> {
    let summaries = store.device_summaries()?;
    Ok(summaries
        .into_iter()
        .map(|summary| {
            let device = Device::new(summary.device.id.clone()).with_info(summary.device.info);
            DeviceStatus {
                name: device.display_name().to_string(),
                device_id: summary.device.id,
                reading_count: summary.reading_count,
                latest_epoch_millis: summary.latest_epoch_millis,
                latest_recorded_at: summary.latest_epoch_millis.and_then(recorded_at),
                last_run: summary.last_run,
            }
        })
        .collect())
}

/// Pair each directory device with its stored high-water mark.
pub fn collect_listing(
    devices: &[Device],
    store: &Store,
) -> ambisync_store::Result<Vec<DeviceListing>> {
    devices
        .iter()
        .map(|device| {
            let latest = store
                .latest_reading(&device.mac_address)?
                .map(|r| r.epoch_millis);
            Ok(DeviceListing {
                device_id: device.mac_address.clone(),
                name: device.display_name().to_string(),
                latest_epoch_millis: latest,
                latest_recorded_at: latest.and_then(recorded_at),
            })
        })
        .collect()
}

fn recorded_at(millis: i64) -> Option<String> {
    format_recorded_at(millis).ok()
}

/// Render device status as a text table.
#[must_use]
pub fn format_status_table(statuses: &[DeviceStatus]) -> String {
    use tabled::{Table, Tabled};

    if statuses.is_empty() {
        return "No devices synchronized yet.\n".to_string();
    }

    #[derive(Tabled)]
    struct StatusRow {
        #[tabled(rename = "Device")]
        device_id: String,
        #[tabled(rename = "Name")]
        name: String,
        #[tabled(rename = "Readings")]
        readings: u64,
        #[tabled(rename = "Latest")]
        latest: String,
        #[tabled(rename = "Last Run")]
        last_run: String,
    }

    let rows: Vec<StatusRow> = statuses
        .iter()
        .map(|status| StatusRow {
            device_id: status.device_id.clone(),
            name: status.name.clone(),
            readings: status.reading_count,
            latest: status
                .latest_recorded_at
                .clone()
                .unwrap_or_else(|| "-".to_string()),
            last_run: status
                .last_run
                .as_ref()
                .map(format_run)
                .unwrap_or_else(|| "never".to_string()),
        })
        .collect();

    let mut table = Table::new(rows);
    table.with(Style::rounded());
    format!("{table}\n")
}

/// Render a device listing as a text table.
#[must_use]
pub fn format_listing_table(listing: &[DeviceListing]) -> String {
    use tabled::builder::Builder;

    if listing.is_empty() {
        return "No devices found.\n".to_string();
    }

    let mut builder = Builder::default();
    builder.push_record(["Device", "Name", "Latest"]);
    for entry in listing {
        builder.push_record([
            entry.device_id.as_str(),
            entry.name.as_str(),
            entry.latest_recorded_at.as_deref().unwrap_or("no data"),
        ]);
    }

    let mut table = builder.build();
    table.with(Style::rounded());
    format!("{table}\n")
}

fn format_run(run: &SyncRun) -> String {
    let finished = run
        .finished_at
        .format(&time::format_description::well_known::Rfc3339)
        .unwrap_or_else(|_| "?".to_string());
    match &run.error {
        None => format!("ok at {} (+{})", finished, run.inserted),
        Some(error) => format!("failed at {}: {}", finished, error),
    }
}
