//! Error types
//!
//! One enum per concern. Per-cycle failures (`SourceError`, `ReplayError`)
//! are consumed by the forwarding loops and never stop the process.

use std::path::PathBuf;
use thiserror::Error;

/// Errors produced while turning a CSV source into readings
#[derive(Error, Debug)]
pub enum SourceError {
    /// No timestamp or power column could be identified
    #[error("Schema error: {reason}. Columns seen: {columns:?}")]
    Schema {
        reason: &'static str,
        columns: Vec<String>,
    },

    /// Some timestamp values could not be parsed
    #[error("Unparseable timestamps (examples): {examples:?}")]
    TimeParse { examples: Vec<String> },

    /// Source file does not exist (transient)
    #[error("Source file not found: {}", path.display())]
    MissingFile { path: PathBuf },

    /// File has no header row
    #[error("Source file is empty: {}", path.display())]
    EmptyFile { path: PathBuf },

    /// I/O operation failed
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// CSV reader error
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),
}

impl SourceError {
    pub(crate) fn missing_timestamp(columns: &[String]) -> Self {
        SourceError::Schema {
            reason: "no time column found",
            columns: columns.to_vec(),
        }
    }

    pub(crate) fn missing_power(columns: &[String]) -> Self {
        SourceError::Schema {
            reason: "no power column found",
            columns: columns.to_vec(),
        }
    }
}

/// Errors produced while loading or expanding a recorded session
#[derive(Error, Debug)]
pub enum ReplayError {
    /// I/O operation failed
    #[error("IO error reading {}: {error}", path.display())]
    Io {
        path: PathBuf,
        error: std::io::Error,
    },

    /// Document is not valid JSON or misses required keys
    #[error("Invalid session document: {0}")]
    Json(#[from] serde_json::Error),

    /// Requested appliance is not in the predictions map
    #[error("Appliance {name:?} not found in session (available: {available:?})")]
    UnknownAppliance {
        name: String,
        available: Vec<String>,
    },

    /// Base `datetime` could not be parsed
    #[error("Invalid base datetime: {0}")]
    BaseInstant(String),

    /// An absolute epoch value is outside the representable range
    #[error("Timestamp out of range: {0}")]
    OutOfRange(f64),
}

/// Transport errors raised by the bus client
#[derive(Error, Debug)]
pub enum BusError {
    /// Initial connection to the broker failed
    #[error("Failed to connect to broker {addr}: {error}")]
    Connect { addr: String, error: String },

    /// Broker did not acknowledge the connection in time
    #[error("Timed out connecting to broker {0}")]
    Timeout(String),

    /// Message could not be queued for sending
    #[error("Publish to {topic} failed: {error}")]
    Publish { topic: String, error: String },
}
