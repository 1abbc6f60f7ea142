//! Store errors.
//!
//! A duplicate `(device_id, epoch_millis)` is not an error here: batch
//! inserts report it per row as [`InsertOutcome::Conflict`](crate::InsertOutcome).

use std::path::PathBuf;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// SQLite rejected a statement or the connection failed.
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Failed to create database directory {path}: {source}")]
    CreateDirectory {
        path: PathBuf,
        source: std::io::Error,
    },

    /// A device row vanished between upsert and read-back.
    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    /// An `epoch_millis` outside the range `recorded_at` can express.
    #[error("Invalid timestamp: {0}")]
    InvalidTimestamp(#[from] ambisync_types::ParseError),

    /// Payload or device metadata could not be encoded as JSON text.
    #[error("Failed to encode JSON column: {0}")]
    Serialization(#[from] serde_json::Error),
}
