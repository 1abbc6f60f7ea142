//! A config file drives a pass into an on-disk store.

use std::time::Duration;

use ambisync_core::mock::MockRemote;
use ambisync_core::{FixedClock, StaticDirectory, SyncEngine};
use ambisync_service::{Config, Runner, collect_status};
use ambisync_store::Store;
use ambisync_types::FIVE_MINUTES_MS;

const T0: i64 = 1_577_836_800_000;
const NOW: i64 = T0 + 6 * 60 * 60_000;

#[tokio::test(start_paused = true)]
async fn test_configured_devices_are_synchronized() {
    let dir = tempfile::tempdir().unwrap();
    let config_path = dir.path().join("server.toml");
    let db_path = dir.path().join("data.db");

    let toml = format!(
        r#"
        [storage]
        path = "{}"

        [sync]
        history_start = {T0}
        device_delay_ms = 500
        probe_delay_ms = 0

        [[devices]]
        mac_address = "AA:01"
        info = {{ name = "Roof" }}

        [[devices]]
        mac_address = "AA:02"
        info = {{ name = "Shed" }}
        "#,
        db_path.display().to_string().replace('\\', "/")
    );
    std::fs::write(&config_path, toml).unwrap();

    let mut config = Config::load(&config_path).unwrap();
    config
        .apply_env_from(|name| match name {
            "AMBIENT_API_KEY" => Some("key".to_string()),
            "AMBIENT_APPLICATION_KEY" => Some("app".to_string()),
            _ => None,
        })
        .unwrap();
    config.validate_for_sync().unwrap();

    let remote = MockRemote::new();
    remote.add_series("AA:01", NOW - 9 * FIVE_MINUTES_MS, 10, FIVE_MINUTES_MS);
    remote.add_series("AA:02", NOW - 4 * FIVE_MINUTES_MS, 5, FIVE_MINUTES_MS);

    let engine = SyncEngine::with_clock(
        remote,
        Store::open(&config.storage.path).unwrap(),
        FixedClock::new(NOW),
        config.to_sync_options(),
    )
    .unwrap();
    let runner = Runner::new(
        engine,
        StaticDirectory::new(config.static_devices()),
        config.sync.interval(),
    );

    let started = tokio::time::Instant::now();
    let report = runner.run_once().await.unwrap();
    assert_eq!(report.inserted_total(), 15);
    assert_eq!(started.elapsed(), Duration::from_millis(500));

    let mut statuses = collect_status(runner.engine().store()).unwrap();
    statuses.sort_by(|a, b| a.name.cmp(&b.name));
    let names: Vec<&str> = statuses.iter().map(|s| s.name.as_str()).collect();
    assert_eq!(names, vec!["Roof", "Shed"]);
    assert_eq!(statuses[0].reading_count, 10);
    assert_eq!(statuses[1].reading_count, 5);
}
