//! Error types for record parsing in ambisync-types.

use thiserror::Error;

/// Errors that can occur when interpreting a record returned by the remote API.
///
/// This enum is marked `#[non_exhaustive]` to allow adding new error variants
/// in future versions without breaking downstream code.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum ParseError {
    /// The record is not a JSON object.
    #[error("Record is not a JSON object")]
    NotAnObject,

    /// The record has no epoch timestamp field.
    #[error("Record is missing the '{field}' timestamp field")]
    MissingEpoch {
        /// Name of the expected field.
        field: &'static str,
    },

    /// The epoch timestamp field is present but not an integer.
    #[error("Record field '{field}' is not an integer timestamp: {value}")]
    InvalidEpoch {
        /// Name of the field.
        field: &'static str,
        /// The offending value, rendered as JSON.
        value: String,
    },

    /// The timestamp cannot be represented as a calendar date.
    #[error("Timestamp {0} ms is out of range")]
    TimestampOutOfRange(i64),
}

/// Result type alias using ambisync-types' ParseError type.
pub type ParseResult<T> = std::result::Result<T, ParseError>;
