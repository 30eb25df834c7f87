//! Line protocol encoding
//!
//! `<measurement>,appliance=<tag> watts=<float> <timestamp>`, one line per
//! reading, no batching.

use chrono::{DateTime, Utc};

use crate::config::Precision;
use crate::csv_source::Reading;

/// Encodes readings for one measurement
#[derive(Debug, Clone)]
pub struct LineProtocol {
    measurement: String,
    precision: Precision,
}

impl LineProtocol {
    pub fn new(measurement: impl Into<String>, precision: Precision) -> Self {
        Self {
            measurement: measurement.into(),
            precision,
        }
    }

    pub fn encode(&self, reading: &Reading) -> String {
        format!(
            "{},appliance={} watts={} {}",
            escape_measurement(&self.measurement),
            escape_tag(&reading.source_tag),
            format_float(reading.power_watts),
            timestamp_in(reading.timestamp, self.precision),
        )
    }
}

/// Integer epoch timestamp in the requested unit
pub fn timestamp_in(ts: DateTime<Utc>, precision: Precision) -> i64 {
    match precision {
        Precision::Ns => ts
            .timestamp_nanos_opt()
            .unwrap_or_else(|| ts.timestamp_micros().saturating_mul(1000)),
        Precision::Us => ts.timestamp_micros(),
        Precision::Ms => ts.timestamp_millis(),
        Precision::S => ts.timestamp(),
    }
}

/// Floats always carry a decimal part so the field stays a float
fn format_float(value: f64) -> String {
    let mut s = format!("{value:?}");
    if !s.contains(['.', 'e', 'E']) {
        s.push_str(".0");
    }
    s
}

fn escape_measurement(value: &str) -> String {
    escape(value, &[',', ' '])
}

fn escape_tag(value: &str) -> String {
    escape(value, &[',', '=', ' '])
}

fn escape(value: &str, special: &[char]) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        if special.contains(&c) {
            out.push('\\');
        }
        out.push(c);
    }
    out
}
