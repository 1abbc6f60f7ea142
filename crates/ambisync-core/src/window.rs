//! Query-window computation from a device's high-water mark.

use ambisync_types::SyncWindow;

use crate::options::SyncOptions;

/// Compute where the first remote page for a device should end.
///
/// If fewer than `catch_up_threshold` reports were missed since `last_millis`
/// a single page ending now covers the gap. Otherwise the search jumps to just
/// under a day past `last_millis`, so the fetcher walks forward from the known
/// data instead of paging back from now through a long outage.
pub fn compute_query_end(last_millis: i64, now_millis: i64, options: &SyncOptions) -> i64 {
    let updates_since_last_sync = now_millis
        .saturating_sub(last_millis)
        .div_euclid(options.report_interval_millis);

    if updates_since_last_sync < options.catch_up_threshold {
        now_millis
    } else {
        last_millis.saturating_add(options.catch_up_lookahead_millis)
    }
}

/// Build the sync window for a device.
///
/// `latest_millis` is the device's stored high-water mark; when absent the
/// configured history start is used.
pub fn sync_window<'a>(
    device_id: &'a str,
    latest_millis: Option<i64>,
    now_millis: i64,
    options: &SyncOptions,
) -> SyncWindow<'a> {
    let last_millis = latest_millis.unwrap_or(options.history_start_millis);
    SyncWindow {
        device_id,
        query_end_millis: compute_query_end(last_millis, now_millis, options),
        lookback_millis: options.lookback_millis,
    }
}
