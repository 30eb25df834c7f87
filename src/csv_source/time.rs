//! Timestamp normalisation
//!
//! Loggers write naive wall-clock times in the deployment's civil zone,
//! day before month. Values are localised into that zone and converted
//! to UTC instants so that every source compares on the same axis.

use chrono::{
    DateTime, FixedOffset, LocalResult, NaiveDate, NaiveDateTime, TimeDelta, TimeZone, Timelike,
    Utc,
};
use chrono_tz::Tz;

use crate::error::SourceError;

/// Day-first formats, then ISO-like ones. `%.f` also matches no fraction.
/// Two-digit years come first since `%Y` would read `24` as year 24.
const DATETIME_FORMATS: [&str; 14] = [
    "%d/%m/%y %H:%M:%S",
    "%d/%m/%y %H:%M",
    "%d/%m/%Y %H:%M:%S%.f",
    "%d/%m/%Y %H:%M",
    "%d-%m-%Y %H:%M:%S%.f",
    "%d-%m-%Y %H:%M",
    "%d.%m.%Y %H:%M:%S%.f",
    "%d.%m.%Y %H:%M",
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%d %H:%M",
    "%Y-%m-%dT%H:%M",
    "%Y/%m/%d %H:%M:%S%.f",
    "%Y/%m/%d %H:%M",
];

const DATE_FORMATS: [&str; 5] = ["%d/%m/%Y", "%d-%m-%Y", "%d.%m.%Y", "%Y-%m-%d", "%Y/%m/%d"];

/// Number of bad values quoted in a `TimeParse` error
const MAX_EXAMPLES: usize = 3;

/// Longest daylight-saving gap searched when shifting forward
const MAX_GAP_MINUTES: i64 = 24 * 60;

/// A timestamp as written in the file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RawTimestamp {
    /// Wall-clock time without zone information
    Naive(NaiveDateTime),
    /// Time carrying its own UTC offset
    Aware(DateTime<FixedOffset>),
}

/// Parse one cell, day-first. Returns `None` when no format matches.
pub fn parse_timestamp(raw: &str) -> Option<RawTimestamp> {
    let value = raw.trim();
    if value.is_empty() {
        return None;
    }

    if let Ok(dt) = DateTime::parse_from_rfc3339(value) {
        return Some(RawTimestamp::Aware(dt));
    }
    if let Ok(dt) = DateTime::parse_from_str(value, "%Y-%m-%d %H:%M:%S%.f%:z") {
        return Some(RawTimestamp::Aware(dt));
    }

    for fmt in DATETIME_FORMATS {
        if let Ok(dt) = NaiveDateTime::parse_from_str(value, fmt) {
            return Some(RawTimestamp::Naive(dt));
        }
    }

    for fmt in DATE_FORMATS {
        if let Ok(date) = NaiveDate::parse_from_str(value, fmt) {
            return date.and_hms_opt(0, 0, 0).map(RawTimestamp::Naive);
        }
    }

    None
}

/// How a naive value was placed on the timeline
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Localization {
    /// Exactly one instant matched
    Exact,
    /// Repeated hour during fall-back: first occurrence was attached
    Ambiguous,
    /// Skipped hour during spring-forward: moved to the end of the gap
    ShiftedForward,
}

/// Result of normalising a whole column
#[derive(Debug, Clone, Default)]
pub struct NormalizedColumn {
    pub instants: Vec<DateTime<Utc>>,
    /// Values resolved by attaching the zone to an ambiguous wall time
    pub ambiguous: usize,
    /// Values that fell in a daylight-saving gap
    pub shifted: usize,
}

/// Converts timestamp strings into UTC instants for one civil zone
#[derive(Debug, Clone, Copy)]
pub struct TimeNormalizer {
    tz: Tz,
}

impl TimeNormalizer {
    pub fn new(tz: Tz) -> Self {
        Self { tz }
    }

    pub fn tz(&self) -> Tz {
        self.tz
    }

    /// Attach the configured zone to a wall-clock time.
    ///
    /// Ambiguous times are flagged and resolved to the earlier instant;
    /// nonexistent times move forward to the first valid instant.
    pub fn localize(&self, naive: NaiveDateTime) -> Option<(DateTime<Utc>, Localization)> {
        match self.tz.from_local_datetime(&naive) {
            LocalResult::Single(dt) => Some((dt.with_timezone(&Utc), Localization::Exact)),
            LocalResult::Ambiguous(earliest, _) => {
                Some((earliest.with_timezone(&Utc), Localization::Ambiguous))
            }
            LocalResult::None => self
                .shift_forward(naive)
                .map(|dt| (dt, Localization::ShiftedForward)),
        }
    }

    fn shift_forward(&self, naive: NaiveDateTime) -> Option<DateTime<Utc>> {
        // Transitions happen on minute boundaries
        let mut probe = naive.with_second(0)?.with_nanosecond(0)?;
        for _ in 0..MAX_GAP_MINUTES {
            probe = probe.checked_add_signed(TimeDelta::minutes(1))?;
            if let Some(dt) = self.tz.from_local_datetime(&probe).earliest() {
                return Some(dt.with_timezone(&Utc));
            }
        }
        None
    }

    /// Parse and localise a single value
    pub fn normalize(&self, raw: &str) -> Option<(DateTime<Utc>, Localization)> {
        match parse_timestamp(raw)? {
            RawTimestamp::Aware(dt) => Some((dt.with_timezone(&Utc), Localization::Exact)),
            RawTimestamp::Naive(naive) => self.localize(naive),
        }
    }

    /// Normalise every value of a column, failing on the first column that
    /// contains any unparseable value.
    pub fn normalize_column<'a, I>(&self, values: I) -> Result<NormalizedColumn, SourceError>
    where
        I: IntoIterator<Item = &'a str>,
    {
        let mut column = NormalizedColumn::default();
        let mut examples = Vec::new();
        let mut failures = 0usize;

        for raw in values {
            match self.normalize(raw) {
                Some((instant, how)) => {
                    match how {
                        Localization::Exact => {}
                        Localization::Ambiguous => column.ambiguous += 1,
                        Localization::ShiftedForward => column.shifted += 1,
                    }
                    column.instants.push(instant);
                }
                None => {
                    failures += 1;
                    if examples.len() < MAX_EXAMPLES {
                        examples.push(raw.to_string());
                    }
                }
            }
        }

        if failures > 0 {
            tracing::debug!(failures, "Unparseable timestamps in column");
            return Err(SourceError::TimeParse { examples });
        }

        Ok(column)
    }
}
