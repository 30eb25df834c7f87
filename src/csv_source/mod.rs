//! CSV Sources
//!
//! Turns an append-only CSV log into power readings:
//!
//! - **detect**: delimiter sniffing, decimal mark, column heuristics
//! - **time**: day-first parsing and localisation into the deployment zone
//!
//! The whole file is read and parsed on every call. No file handle or
//! byte offset is kept between cycles.

pub mod detect;
pub mod time;

pub use detect::{guess_columns, parse_decimal, sniff_delimiter, ColumnChoice, DecimalMark};
pub use time::{Localization, NormalizedColumn, TimeNormalizer};

use chrono::{DateTime, Utc};
use std::path::Path;

use crate::error::SourceError;

/// One power measurement from a source
#[derive(Debug, Clone, PartialEq)]
pub struct Reading {
    /// Appliance tag of the source
    pub source_tag: String,
    pub timestamp: DateTime<Utc>,
    /// Always finite
    pub power_watts: f64,
}

/// Everything learned from one parse of a source file
#[derive(Debug, Clone)]
pub struct ParsedSource {
    pub delimiter: u8,
    pub decimal: DecimalMark,
    pub timestamp_column: String,
    pub power_column: String,
    /// Readings in file order
    pub readings: Vec<Reading>,
    /// Rows dropped because the power value was not numeric
    pub dropped: usize,
    /// Timestamps resolved during a fall-back hour
    pub ambiguous: usize,
    /// Timestamps moved out of a spring-forward gap
    pub shifted: usize,
}

impl ParsedSource {
    /// Latest timestamp in the file
    pub fn max_timestamp(&self) -> Option<DateTime<Utc>> {
        self.readings.iter().map(|r| r.timestamp).max()
    }

    /// Earliest timestamp in the file
    pub fn min_timestamp(&self) -> Option<DateTime<Utc>> {
        self.readings.iter().map(|r| r.timestamp).min()
    }
}

/// Parses CSV exports into readings for one time zone
#[derive(Debug, Clone, Copy)]
pub struct CsvParser {
    normalizer: TimeNormalizer,
}

impl CsvParser {
    pub fn new(normalizer: TimeNormalizer) -> Self {
        Self { normalizer }
    }

    /// Zone the naive timestamps are read in
    pub fn tz(&self) -> chrono_tz::Tz {
        self.normalizer.tz()
    }

    /// Read and parse a file from disk
    pub fn read_file(&self, tag: &str, path: &Path) -> Result<ParsedSource, SourceError> {
        if !path.exists() {
            return Err(SourceError::MissingFile {
                path: path.to_path_buf(),
            });
        }

        let bytes = std::fs::read(path)?;
        // Loggers are not consistent about encoding, keep what decodes
        let text = String::from_utf8_lossy(&bytes);

        self.parse_str(tag, &text).map_err(|e| match e {
            SourceError::EmptyFile { .. } => SourceError::EmptyFile {
                path: path.to_path_buf(),
            },
            other => other,
        })
    }

    /// Parse CSV text
    pub fn parse_str(&self, tag: &str, text: &str) -> Result<ParsedSource, SourceError> {
        let text = text.strip_prefix('\u{feff}').unwrap_or(text);
        let delimiter = sniff_delimiter(text);

        let mut reader = csv::ReaderBuilder::new()
            .delimiter(delimiter)
            .has_headers(true)
            .flexible(true)
            .trim(csv::Trim::All)
            .from_reader(text.as_bytes());

        let columns: Vec<String> = reader.headers()?.iter().map(str::to_string).collect();
        if columns.iter().all(|c| c.is_empty()) {
            return Err(SourceError::EmptyFile {
                path: Default::default(),
            });
        }

        let choice = guess_columns(&columns)?;

        let mut raw_times = Vec::new();
        let mut raw_powers = Vec::new();
        for record in reader.records() {
            let record = record?;
            raw_times.push(record.get(choice.timestamp).unwrap_or("").to_string());
            raw_powers.push(record.get(choice.power).unwrap_or("").to_string());
        }

        let normalized = self
            .normalizer
            .normalize_column(raw_times.iter().map(String::as_str))?;

        let decimal = DecimalMark::detect(raw_powers.iter().map(String::as_str));

        let mut readings = Vec::with_capacity(raw_powers.len());
        let mut dropped = 0;
        for (timestamp, raw) in normalized.instants.iter().zip(raw_powers.iter()) {
            match parse_decimal(raw, decimal) {
                Some(power_watts) => readings.push(Reading {
                    source_tag: tag.to_string(),
                    timestamp: *timestamp,
                    power_watts,
                }),
                None => dropped += 1,
            }
        }

        if dropped > 0 {
            tracing::debug!(source = %tag, dropped, "Dropped rows with non-numeric power");
        }
        if normalized.ambiguous > 0 || normalized.shifted > 0 {
            tracing::warn!(
                source = %tag,
                ambiguous = normalized.ambiguous,
                shifted = normalized.shifted,
                "Timestamps adjusted around a daylight-saving transition"
            );
        }

        Ok(ParsedSource {
            delimiter,
            decimal,
            timestamp_column: columns[choice.timestamp].clone(),
            power_column: columns[choice.power].clone(),
            readings,
            dropped,
            ambiguous: normalized.ambiguous,
            shifted: normalized.shifted,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use tempfile::tempdir;

    fn parser() -> CsvParser {
        CsvParser::new(TimeNormalizer::new(chrono_tz::Africa::Tunis))
    }

    #[test]
    fn test_semicolon_decimal_comma_export() {
        let csv_data = "Date;Heure inutile;Puissance active (W)
15/01/2024 13:00:00;x;120,5
15/01/2024 13:00:10;x;121,25
15/01/2024 13:00:20;x;--";

        let parsed = parser().parse_str("fridge", csv_data).unwrap();

        assert_eq!(parsed.delimiter, b';');
        assert_eq!(parsed.decimal, DecimalMark::Comma);
        assert_eq!(parsed.timestamp_column, "Date");
        assert_eq!(parsed.power_column, "Puissance active (W)");
        assert_eq!(parsed.readings.len(), 2);
        assert_eq!(parsed.dropped, 1);
        assert_eq!(parsed.readings[0].power_watts, 120.5);
        assert_eq!(parsed.readings[1].power_watts, 121.25);
        assert_eq!(parsed.readings[0].source_tag, "fridge");
        assert_eq!(
            parsed.readings[0].timestamp,
            Utc.with_ymd_and_hms(2024, 1, 15, 12, 0, 0).unwrap()
        );
    }

    #[test]
    fn test_comma_and_point_files_agree() {
        let comma = "timestamp;watts\n15/01/2024 13:00:00;12,5\n15/01/2024 13:00:10;0,75\n";
        let point = "timestamp,watts\n15/01/2024 13:00:00,12.5\n15/01/2024 13:00:10,0.75\n";

        let a = parser().parse_str("tv", comma).unwrap();
        let b = parser().parse_str("tv", point).unwrap();

        assert_eq!(a.readings, b.readings);
        assert_eq!(a.decimal, DecimalMark::Comma);
        assert_eq!(b.decimal, DecimalMark::Point);
    }

    #[test]
    fn test_quoted_decimal_comma_in_comma_file() {
        let csv_data = "time,power\n15/01/2024 13:00:00,\"12,5\"\n";
        let parsed = parser().parse_str("tv", csv_data).unwrap();
        assert_eq!(parsed.readings[0].power_watts, 12.5);
    }

    #[test]
    fn test_missing_power_column() {
        let csv_data = "date;energy\n15/01/2024 13:00:00;1\n";
        let err = parser().parse_str("tv", csv_data).unwrap_err();
        assert!(matches!(err, SourceError::Schema { .. }));
    }

    #[test]
    fn test_bad_timestamp_fails_whole_file() {
        let csv_data = "date;power\n15/01/2024 13:00:00;1\nnot a date;2\n";
        let err = parser().parse_str("tv", csv_data).unwrap_err();
        match err {
            SourceError::TimeParse { examples } => assert_eq!(examples, vec!["not a date"]),
            other => panic!("expected time parse error, got {:?}", other),
        }
    }

    #[test]
    fn test_header_only_file() {
        let parsed = parser().parse_str("tv", "date;power\n").unwrap();
        assert!(parsed.readings.is_empty());
        assert_eq!(parsed.max_timestamp(), None);
    }

    #[test]
    fn test_empty_file() {
        let err = parser().parse_str("tv", "").unwrap_err();
        assert!(matches!(err, SourceError::EmptyFile { .. }));
    }

    #[test]
    fn test_read_missing_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("absent.csv");
        let err = parser().read_file("tv", &path).unwrap_err();
        assert!(matches!(err, SourceError::MissingFile { path: p } if p == path));
    }

    #[test]
    fn test_read_file_with_bom() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("tv.csv");
        std::fs::write(
            &path,
            "\u{feff}Timestamp;P (W)\n15/01/2024 13:00:00;80\n15/01/2024 12:00:00;75\n",
        )
        .unwrap();

        let parsed = parser().read_file("tv", &path).unwrap();
        assert_eq!(parsed.timestamp_column, "Timestamp");
        assert_eq!(parsed.readings.len(), 2);
        assert_eq!(
            parsed.max_timestamp(),
            Some(Utc.with_ymd_and_hms(2024, 1, 15, 12, 0, 0).unwrap())
        );
        assert_eq!(
            parsed.min_timestamp(),
            Some(Utc.with_ymd_and_hms(2024, 1, 15, 11, 0, 0).unwrap())
        );
    }
}
