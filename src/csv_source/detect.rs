//! Format detection for heterogeneous CSV exports
//!
//! Loggers disagree on delimiter, decimal mark and column naming. Every
//! function here is pure so the heuristics can be tested without files.

use crate::error::SourceError;

/// Delimiters tried by the sniffer, in order of preference on ties
const DELIMITER_CANDIDATES: [u8; 4] = [b';', b',', b'\t', b'|'];

/// Number of non-empty lines looked at when sniffing
const SNIFF_LINES: usize = 20;

const TIMESTAMP_KEYWORDS: [&str; 3] = ["timestamp", "date", "time"];

const POWER_KEYWORDS: [&str; 4] = ["puissance", "watt", "power", "p (w)"];

/// Decimal separator used by a file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecimalMark {
    /// `12,5`
    Comma,
    /// `12.5`
    Point,
}

impl DecimalMark {
    /// Pick the convention for a column of raw values.
    ///
    /// Decimal comma is tried first; it is abandoned as soon as one value
    /// only makes sense with a decimal point.
    pub fn detect<'a, I>(values: I) -> Self
    where
        I: IntoIterator<Item = &'a str>,
    {
        let point_only = values.into_iter().any(|v| {
            parse_decimal(v, DecimalMark::Comma).is_none()
                && parse_decimal(v, DecimalMark::Point).is_some()
        });

        if point_only {
            DecimalMark::Point
        } else {
            DecimalMark::Comma
        }
    }
}

impl std::fmt::Display for DecimalMark {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DecimalMark::Comma => write!(f, "decimal comma"),
            DecimalMark::Point => write!(f, "decimal point"),
        }
    }
}

/// Parse one numeric cell with the given convention.
///
/// Returns `None` for empty, non-numeric and non-finite values.
pub fn parse_decimal(raw: &str, mark: DecimalMark) -> Option<f64> {
    let value = raw.trim();
    if value.is_empty() {
        return None;
    }

    let parsed = match mark {
        DecimalMark::Comma => {
            if value.contains('.') {
                return None;
            }
            value.replace(',', ".").parse::<f64>().ok()?
        }
        DecimalMark::Point => {
            if value.contains(',') {
                return None;
            }
            value.parse::<f64>().ok()?
        }
    };

    parsed.is_finite().then_some(parsed)
}

/// Guess the field delimiter from the first lines of a file.
///
/// A candidate that appears the same number of times on every sampled line
/// wins over one whose count varies (a decimal comma inside `;` separated
/// data). Falls back to `,` when nothing splits the header.
pub fn sniff_delimiter(text: &str) -> u8 {
    let lines: Vec<&str> = text
        .lines()
        .filter(|l| !l.trim().is_empty())
        .take(SNIFF_LINES)
        .collect();

    let Some(header) = lines.first() else {
        return b',';
    };

    let mut best: Option<(u8, usize, bool)> = None;
    for &candidate in &DELIMITER_CANDIDATES {
        let header_count = count_unquoted(header, candidate);
        if header_count == 0 {
            continue;
        }
        let consistent = lines
            .iter()
            .all(|line| count_unquoted(line, candidate) == header_count);

        let better = match best {
            None => true,
            Some((_, count, was_consistent)) => {
                (consistent && !was_consistent)
                    || (consistent == was_consistent && header_count > count)
            }
        };
        if better {
            best = Some((candidate, header_count, consistent));
        }
    }

    best.map(|(d, _, _)| d).unwrap_or(b',')
}

fn count_unquoted(line: &str, delimiter: u8) -> usize {
    let mut in_quotes = false;
    let mut count = 0;
    for b in line.bytes() {
        if b == b'"' {
            in_quotes = !in_quotes;
        } else if b == delimiter && !in_quotes {
            count += 1;
        }
    }
    count
}

/// Columns chosen for timestamps and power values
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ColumnChoice {
    pub timestamp: usize,
    pub power: usize,
}

/// Choose the timestamp and power columns by name.
///
/// The first column (declaration order) whose lowercase name contains a
/// keyword wins.
pub fn guess_columns<S: AsRef<str>>(columns: &[S]) -> Result<ColumnChoice, SourceError> {
    let lowered: Vec<String> = columns
        .iter()
        .map(|c| c.as_ref().to_lowercase())
        .collect();
    let names = || columns.iter().map(|c| c.as_ref().to_string()).collect::<Vec<_>>();

    let timestamp = lowered
        .iter()
        .position(|c| TIMESTAMP_KEYWORDS.iter().any(|k| c.contains(k)))
        .ok_or_else(|| SourceError::missing_timestamp(&names()))?;

    let power = lowered
        .iter()
        .position(|c| POWER_KEYWORDS.iter().any(|k| c.contains(k)))
        .ok_or_else(|| SourceError::missing_power(&names()))?;

    Ok(ColumnChoice { timestamp, power })
}
