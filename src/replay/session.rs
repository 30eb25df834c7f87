//! Recorded session documents
//!
//! ```json
//! {
//!   "datetime": "2024-03-01T08:00:00",
//!   "predictions": {
//!     "dishwasher": {
//!       "timestamps": [0, 8, 16],
//!       "aggregate_power": [310.0, 2150.5, 2100.0],
//!       "predicted_power": [0.0, 1830.2, 1790.0],
//!       "status": [0, 1, 1]
//!     }
//!   }
//! }
//! ```
//!
//! Time values are either offsets in seconds from `datetime` or absolute
//! UNIX timestamps in seconds, depending on who produced the file.

use chrono::{DateTime, NaiveDate, NaiveDateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

use crate::error::ReplayError;

/// A recorded prediction session
#[derive(Debug, Clone, Deserialize)]
pub struct SessionDocument {
    /// Base instant for relative offsets
    pub datetime: String,
    pub predictions: BTreeMap<String, ApplianceSeries>,
}

/// Parallel arrays for one appliance
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ApplianceSeries {
    #[serde(default)]
    pub timestamps: Vec<f64>,
    #[serde(default)]
    pub aggregate_power: Vec<f64>,
    #[serde(default)]
    pub predicted_power: Vec<f64>,
    #[serde(default)]
    pub status: Vec<f64>,
}

impl ApplianceSeries {
    /// Number of usable points: the shortest of the four arrays
    pub fn len(&self) -> usize {
        self.timestamps
            .len()
            .min(self.aggregate_power.len())
            .min(self.predicted_power.len())
            .min(self.status.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl SessionDocument {
    /// Read a document from disk
    pub fn load(path: &Path) -> Result<Self, ReplayError> {
        let content = std::fs::read_to_string(path).map_err(|error| ReplayError::Io {
            path: path.to_path_buf(),
            error,
        })?;
        Self::from_json(&content)
    }

    pub fn from_json(content: &str) -> Result<Self, ReplayError> {
        Ok(serde_json::from_str(content)?)
    }

    /// Base instant. Any offset in the text is dropped and the wall time
    /// is read as UTC.
    pub fn base_instant(&self) -> Result<DateTime<Utc>, ReplayError> {
        parse_base_instant(&self.datetime)
    }

    pub fn series(&self, appliance: &str) -> Result<&ApplianceSeries, ReplayError> {
        self.predictions
            .get(appliance)
            .ok_or_else(|| ReplayError::UnknownAppliance {
                name: appliance.to_string(),
                available: self.predictions.keys().cloned().collect(),
            })
    }
}

fn parse_base_instant(value: &str) -> Result<DateTime<Utc>, ReplayError> {
    let value = value.trim();

    if let Ok(dt) = DateTime::parse_from_rfc3339(value) {
        return Ok(dt.naive_local().and_utc());
    }
    if let Ok(dt) = DateTime::parse_from_str(value, "%Y-%m-%d %H:%M:%S%.f%:z") {
        return Ok(dt.naive_local().and_utc());
    }

    for fmt in [
        "%Y-%m-%dT%H:%M:%S%.f",
        "%Y-%m-%d %H:%M:%S%.f",
        "%Y-%m-%dT%H:%M",
        "%Y-%m-%d %H:%M",
    ] {
        if let Ok(dt) = NaiveDateTime::parse_from_str(value, fmt) {
            return Ok(dt.and_utc());
        }
    }

    NaiveDate::parse_from_str(value, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|dt| dt.and_utc())
        .ok_or_else(|| ReplayError::BaseInstant(value.to_string()))
}

/// How a time value was read
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeKind {
    /// Seconds since the session's base instant
    Offset,
    /// Seconds since the UNIX epoch
    Epoch,
}

/// Classify a time value against the epoch threshold
pub fn classify(value: f64, epoch_threshold: f64) -> TimeKind {
    if value >= epoch_threshold {
        TimeKind::Epoch
    } else {
        TimeKind::Offset
    }
}

/// Resolve a time value to an instant, at microsecond precision
pub fn resolve_time(
    base: DateTime<Utc>,
    value: f64,
    epoch_threshold: f64,
) -> Result<DateTime<Utc>, ReplayError> {
    if !value.is_finite() {
        return Err(ReplayError::OutOfRange(value));
    }
    let micros = (value * 1e6).round();
    if micros.abs() >= i64::MAX as f64 {
        return Err(ReplayError::OutOfRange(value));
    }
    let micros = micros as i64;

    let resolved = match classify(value, epoch_threshold) {
        TimeKind::Epoch => DateTime::from_timestamp_micros(micros),
        TimeKind::Offset => base.checked_add_signed(TimeDelta::microseconds(micros)),
    };
    resolved.ok_or(ReplayError::OutOfRange(value))
}

/// ISO-8601 with microseconds and a `Z` suffix
pub fn format_iso(instant: DateTime<Utc>) -> String {
    instant.format("%Y-%m-%dT%H:%M:%S%.6fZ").to_string()
}

/// JSON payload published for one point
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PredictionMessage {
    pub appliance: String,
    pub datetime: String,
    pub aggregate_power: f64,
    pub predicted_power: f64,
    pub status: i64,
}

/// A point placed on the timeline
#[derive(Debug, Clone, PartialEq)]
pub struct ReplayEvent {
    pub at: DateTime<Utc>,
    pub message: PredictionMessage,
}

/// How a session is turned into events
#[derive(Debug, Clone)]
pub struct ReplayOptions {
    pub appliance: String,
    /// Keep one record out of `stride`, starting with the first
    pub stride: usize,
    pub keep_only_offsets: bool,
    pub max_events: Option<usize>,
    pub epoch_threshold: f64,
}

impl Default for ReplayOptions {
    fn default() -> Self {
        Self {
            appliance: "dishwasher".to_string(),
            stride: 1,
            keep_only_offsets: true,
            max_events: None,
            epoch_threshold: super::EPOCH_THRESHOLD_SECS,
        }
    }
}

/// Expand a session into events sorted by instant.
///
/// Arrays are cut to the shortest length, sampled with `stride`, filtered
/// to offsets when requested, sorted, then capped at `max_events`.
pub fn build_events(
    doc: &SessionDocument,
    options: &ReplayOptions,
) -> Result<Vec<ReplayEvent>, ReplayError> {
    let base = doc.base_instant()?;
    let series = doc.series(&options.appliance)?;
    let stride = options.stride.max(1);

    let mut events = Vec::new();
    for i in (0..series.len()).step_by(stride) {
        let value = series.timestamps[i];

        if options.keep_only_offsets
            && classify(value, options.epoch_threshold) == TimeKind::Epoch
        {
            continue;
        }

        let at = resolve_time(base, value, options.epoch_threshold)?;
        events.push(ReplayEvent {
            at,
            message: PredictionMessage {
                appliance: options.appliance.clone(),
                datetime: format_iso(at),
                aggregate_power: series.aggregate_power[i],
                predicted_power: series.predicted_power[i],
                status: series.status[i] as i64,
            },
        });
    }

    // Recorded order is not trusted
    events.sort_by_key(|e| e.at);

    if let Some(max) = options.max_events {
        events.truncate(max);
    }

    Ok(events)
}
