//! SQLite schema bootstrap.

use rusqlite::Connection;

use crate::error::Result;

/// Schema version recorded in `PRAGMA user_version`.
pub const SCHEMA_VERSION: i32 = 1;

/// Bring a fresh or older database up to [`SCHEMA_VERSION`].
pub fn initialize(conn: &Connection) -> Result<()> {
    if schema_version(conn)? < SCHEMA_VERSION {
        create_schema_v1(conn)?;
        conn.pragma_update(None, "user_version", SCHEMA_VERSION)?;
    }
    Ok(())
}

fn schema_version(conn: &Connection) -> Result<i32> {
    Ok(conn.pragma_query_value(None, "user_version", |row| row.get(0))?)
}

fn create_schema_v1(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS devices (
            id TEXT PRIMARY KEY,
            info TEXT NOT NULL DEFAULT 'null',
            first_seen INTEGER NOT NULL,
            last_seen INTEGER NOT NULL
        );

        -- One row per (device, epoch_millis); rows are never updated
        CREATE TABLE IF NOT EXISTS readings (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            device_id TEXT NOT NULL REFERENCES devices(id),
            epoch_millis INTEGER NOT NULL,
            recorded_at TEXT NOT NULL,
            device_info TEXT NOT NULL DEFAULT 'null',
            payload TEXT NOT NULL,
            synced_at INTEGER NOT NULL,
            UNIQUE(device_id, epoch_millis)
        );
        CREATE INDEX IF NOT EXISTS idx_readings_device_time
            ON readings(device_id, epoch_millis);

        CREATE TABLE IF NOT EXISTS sync_runs (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            device_id TEXT NOT NULL,
            started_at INTEGER NOT NULL,
            finished_at INTEGER NOT NULL,
            fetched INTEGER NOT NULL DEFAULT 0,
            inserted INTEGER NOT NULL DEFAULT 0,
            conflicts INTEGER NOT NULL DEFAULT 0,
            malformed INTEGER NOT NULL DEFAULT 0,
            gaps_skipped INTEGER NOT NULL DEFAULT 0,
            error TEXT
        );
        CREATE INDEX IF NOT EXISTS idx_sync_runs_device
            ON sync_runs(device_id, finished_at);
        "#,
    )?;

    Ok(())
}
