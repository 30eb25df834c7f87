//! Incremental CSV Forwarder
//!
//! Publishes only the rows of each source that are newer than the
//! source's cursor, then advances the cursor.
//!
//! ```text
//! cycle:  read file -> parse -> sort -> filter (ts > cursor) -> publish -> new cursor
//! ```
//!
//! Cursor state lives in the caller: `forward` takes a cursor and returns
//! the next one, `plan_batch` is the pure part of that step.

pub mod line_protocol;

pub use line_protocol::LineProtocol;

use chrono::{DateTime, Utc};
use std::future::Future;
use std::time::Duration;

use crate::bus::{Publisher, Qos};
use crate::config::{ConfigError, ForwarderConfig, SourceConfig, StartMode};
use crate::csv_source::{CsvParser, Reading, TimeNormalizer};
use crate::error::SourceError;

/// High-water mark of one source, held in memory only
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cursor {
    pub source_tag: String,
    /// Greatest timestamp already forwarded
    pub high_water_mark: Option<DateTime<Utc>>,
}

impl Cursor {
    /// Cursor with no prior state: the whole file is new
    pub fn empty(source_tag: impl Into<String>) -> Self {
        Self {
            source_tag: source_tag.into(),
            high_water_mark: None,
        }
    }

    pub fn at(source_tag: impl Into<String>, high_water_mark: DateTime<Utc>) -> Self {
        Self {
            source_tag: source_tag.into(),
            high_water_mark: Some(high_water_mark),
        }
    }

    /// Whether a reading was not forwarded yet
    pub fn admits(&self, timestamp: DateTime<Utc>) -> bool {
        self.high_water_mark.map_or(true, |hwm| timestamp > hwm)
    }
}

/// Readings to publish this cycle and the cursor to keep afterwards
#[derive(Debug, Clone, PartialEq)]
pub struct Batch {
    /// Sorted ascending by timestamp
    pub readings: Vec<Reading>,
    pub cursor: Cursor,
}

/// Select the readings newer than `cursor`, in timestamp order.
///
/// The returned cursor is the greatest selected timestamp, or `cursor`
/// unchanged when nothing is newer.
pub fn plan_batch(mut readings: Vec<Reading>, cursor: &Cursor) -> Batch {
    readings.sort_by_key(|r| r.timestamp);
    readings.retain(|r| cursor.admits(r.timestamp));

    let high_water_mark = readings
        .last()
        .map(|r| r.timestamp)
        .or(cursor.high_water_mark);

    Batch {
        readings,
        cursor: Cursor {
            source_tag: cursor.source_tag.clone(),
            high_water_mark,
        },
    }
}

/// Result of one successful forwarding step
#[derive(Debug, Clone, PartialEq)]
pub struct ForwardOutcome {
    /// Messages accepted by the bus
    pub published: usize,
    /// Messages the bus refused (not retried)
    pub failed: usize,
    pub cursor: Cursor,
}

/// Forwards CSV sources onto a topic as line protocol
#[derive(Debug, Clone)]
pub struct Forwarder {
    parser: CsvParser,
    encoder: LineProtocol,
    topic: String,
    qos: Qos,
    retain: bool,
}

impl Forwarder {
    pub fn new(parser: CsvParser, encoder: LineProtocol, topic: impl Into<String>) -> Self {
        Self {
            parser,
            encoder,
            topic: topic.into(),
            qos: Qos::AtMostOnce,
            retain: false,
        }
    }

    /// Build from the `[forwarder]` section
    pub fn from_config(config: &ForwarderConfig) -> Result<Self, ConfigError> {
        let parser = CsvParser::new(TimeNormalizer::new(config.tz()?));
        let encoder = LineProtocol::new(config.measurement.clone(), config.precision);
        Ok(Self::new(parser, encoder, config.topic.clone())
            .with_qos(config.qos()?)
            .with_retain(config.retain))
    }

    pub fn with_qos(mut self, qos: Qos) -> Self {
        self.qos = qos;
        self
    }

    pub fn with_retain(mut self, retain: bool) -> Self {
        self.retain = retain;
        self
    }

    pub fn parser(&self) -> &CsvParser {
        &self.parser
    }

    /// Initial cursor for a source according to the start mode.
    ///
    /// In tail mode the cursor starts at the latest timestamp already in
    /// the file. A file that is absent or unreadable starts empty.
    pub fn seed_cursor(&self, source: &SourceConfig, mode: StartMode) -> Cursor {
        match mode {
            StartMode::All => Cursor::empty(&source.tag),
            StartMode::Tail => match self.parser.read_file(&source.tag, &source.path) {
                Ok(parsed) => Cursor {
                    source_tag: source.tag.clone(),
                    high_water_mark: parsed.max_timestamp(),
                },
                Err(e) => {
                    tracing::debug!(source = %source.tag, error = %e, "Tail seed unavailable");
                    Cursor::empty(&source.tag)
                }
            },
        }
    }

    /// Publish the rows of `source` newer than `cursor`
    pub async fn forward(
        &self,
        bus: &dyn Publisher,
        source: &SourceConfig,
        cursor: Cursor,
    ) -> Result<ForwardOutcome, SourceError> {
        let parsed = self.parser.read_file(&source.tag, &source.path)?;
        let batch = plan_batch(parsed.readings, &cursor);

        let mut published = 0;
        let mut failed = 0;
        for reading in &batch.readings {
            let line = self.encoder.encode(reading);
            match bus
                .publish(&self.topic, line.into_bytes(), self.qos, self.retain)
                .await
            {
                Ok(()) => published += 1,
                Err(e) => {
                    failed += 1;
                    tracing::warn!(source = %source.tag, error = %e, "Publish failed");
                }
            }
        }

        // At most once: refused messages are not sent again
        Ok(ForwardOutcome {
            published,
            failed,
            cursor: batch.cursor,
        })
    }

    /// Run one forwarding step for every source and return the new cursors.
    ///
    /// Every failure is logged here and leaves that source's cursor as is.
    pub async fn cycle(
        &self,
        bus: &dyn Publisher,
        sources: &[SourceConfig],
        cursors: Vec<Cursor>,
    ) -> Vec<Cursor> {
        let mut next = Vec::with_capacity(cursors.len());

        for (source, cursor) in sources.iter().zip(cursors) {
            let kept = cursor.clone();
            let cursor = match self.forward(bus, source, cursor).await {
                Ok(outcome) => {
                    if outcome.published > 0 || outcome.failed > 0 {
                        tracing::info!(
                            source = %source.tag,
                            published = outcome.published,
                            failed = outcome.failed,
                            "{}: +{} points sent",
                            source.tag,
                            outcome.published
                        );
                    }
                    outcome.cursor
                }
                Err(SourceError::MissingFile { path }) => {
                    tracing::warn!(source = %source.tag, "File not found: {}", path.display());
                    kept
                }
                Err(e @ (SourceError::Schema { .. } | SourceError::TimeParse { .. })) => {
                    tracing::warn!(source = %source.tag, error = %e, "Cycle error, skipping file");
                    kept
                }
                Err(e) => {
                    tracing::warn!(source = %source.tag, error = %e, "Cycle error");
                    kept
                }
            };
            next.push(cursor);
        }

        next
    }

    /// Scan all sources every `interval` until `shutdown` resolves
    pub async fn run<F>(
        &self,
        bus: &dyn Publisher,
        sources: &[SourceConfig],
        mut cursors: Vec<Cursor>,
        interval: Duration,
        shutdown: F,
    ) -> Vec<Cursor>
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);

        tracing::info!(
            sources = sources.len(),
            interval_secs = interval.as_secs(),
            "Forwarder started (Ctrl+C to stop)"
        );

        loop {
            // Interrupted cycles keep the previous cursors
            let previous = cursors.clone();
            tokio::select! {
                biased;
                next = self.cycle(bus, sources, cursors) => cursors = next,
                _ = &mut shutdown => {
                    tracing::info!("Stop requested");
                    return previous;
                }
            }

            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = &mut shutdown => {
                    tracing::info!("Stop requested");
                    break;
                }
            }
        }

        cursors
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::MemoryBus;
    use crate::config::Precision;
    use chrono::TimeZone;
    use std::io::Write;
    use std::path::Path;
    use tempfile::tempdir;

    fn forwarder() -> Forwarder {
        Forwarder::new(
            CsvParser::new(TimeNormalizer::new(chrono_tz::Africa::Tunis)),
            LineProtocol::new("power", Precision::Ns),
            "home/power",
        )
    }

    fn utc(h: u32, m: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 15, h, m, s).unwrap()
    }

    fn reading(ts: DateTime<Utc>, watts: f64) -> Reading {
        Reading {
            source_tag: "fridge".to_string(),
            timestamp: ts,
            power_watts: watts,
        }
    }

    fn source(path: &Path) -> SourceConfig {
        SourceConfig {
            tag: "fridge".to_string(),
            path: path.to_path_buf(),
        }
    }

    fn append(path: &Path, lines: &str) {
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .unwrap();
        file.write_all(lines.as_bytes()).unwrap();
    }

    #[test]
    fn test_plan_batch_sorts_and_filters() {
        let readings = vec![
            reading(utc(10, 0, 3), 3.0),
            reading(utc(10, 0, 1), 1.0),
            reading(utc(10, 0, 2), 2.0),
        ];

        let batch = plan_batch(readings, &Cursor::at("fridge", utc(10, 0, 1)));

        let watts: Vec<f64> = batch.readings.iter().map(|r| r.power_watts).collect();
        assert_eq!(watts, vec![2.0, 3.0]);
        assert_eq!(batch.cursor.high_water_mark, Some(utc(10, 0, 3)));
    }

    #[test]
    fn test_plan_batch_is_idempotent() {
        let readings = vec![reading(utc(10, 0, 1), 1.0), reading(utc(10, 0, 2), 2.0)];

        let first = plan_batch(readings.clone(), &Cursor::empty("fridge"));
        assert_eq!(first.readings.len(), 2);

        let second = plan_batch(readings, &first.cursor);
        assert!(second.readings.is_empty());
        assert_eq!(second.cursor, first.cursor);
    }

    #[test]
    fn test_plan_batch_equal_timestamp_is_not_new() {
        let readings = vec![reading(utc(10, 0, 1), 1.0)];
        let batch = plan_batch(readings, &Cursor::at("fridge", utc(10, 0, 1)));
        assert!(batch.readings.is_empty());
        assert_eq!(batch.cursor.high_water_mark, Some(utc(10, 0, 1)));
    }

    #[test]
    fn test_plan_batch_empty_cursor_stays_empty() {
        let batch = plan_batch(Vec::new(), &Cursor::empty("fridge"));
        assert_eq!(batch.cursor.high_water_mark, None);
    }

    #[tokio::test]
    async fn test_forward_full_history_then_nothing() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("fridge.csv");
        append(
            &path,
            "Date;Puissance\n15/01/2024 13:00:02;12,5\n15/01/2024 13:00:01;10\n",
        );

        let fwd = forwarder();
        let bus = MemoryBus::new();
        let src = source(&path);

        let outcome = fwd.forward(&bus, &src, Cursor::empty("fridge")).await.unwrap();
        assert_eq!(outcome.published, 2);
        assert_eq!(outcome.cursor.high_water_mark, Some(utc(12, 0, 2)));
        assert_eq!(
            bus.payloads(),
            vec![
                "power,appliance=fridge watts=10.0 1705320001000000000",
                "power,appliance=fridge watts=12.5 1705320002000000000",
            ]
        );
        assert!(bus.messages().iter().all(|m| m.topic == "home/power"));

        let again = fwd.forward(&bus, &src, outcome.cursor.clone()).await.unwrap();
        assert_eq!(again.published, 0);
        assert_eq!(again.cursor, outcome.cursor);
        assert_eq!(bus.len(), 2);
    }

    #[tokio::test]
    async fn test_tail_mode_only_forwards_appended_rows() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("fridge.csv");
        append(
            &path,
            "timestamp,power\n15/01/2024 13:00:00,1.0\n15/01/2024 13:00:05,2.0\n",
        );

        let fwd = forwarder();
        let bus = MemoryBus::new();
        let src = source(&path);

        let cursor = fwd.seed_cursor(&src, StartMode::Tail);
        assert_eq!(cursor.high_water_mark, Some(utc(12, 0, 5)));

        let first = fwd.forward(&bus, &src, cursor).await.unwrap();
        assert_eq!(first.published, 0);

        // One older row (ignored) and two new ones
        append(
            &path,
            "15/01/2024 13:00:03,9.0\n15/01/2024 13:00:07,3.0\n15/01/2024 13:00:06,4.0\n",
        );

        let second = fwd.forward(&bus, &src, first.cursor).await.unwrap();
        assert_eq!(second.published, 2);
        assert_eq!(second.cursor.high_water_mark, Some(utc(12, 0, 7)));
        assert_eq!(
            bus.payloads(),
            vec![
                "power,appliance=fridge watts=4.0 1705320006000000000",
                "power,appliance=fridge watts=3.0 1705320007000000000",
            ]
        );
    }

    #[test]
    fn test_seed_cursor_all_mode_and_missing_file() {
        let dir = tempdir().unwrap();
        let src = source(&dir.path().join("absent.csv"));
        let fwd = forwarder();

        assert_eq!(fwd.seed_cursor(&src, StartMode::All), Cursor::empty("fridge"));
        assert_eq!(fwd.seed_cursor(&src, StartMode::Tail), Cursor::empty("fridge"));
    }

    #[tokio::test]
    async fn test_missing_file_is_an_explicit_error() {
        let dir = tempdir().unwrap();
        let src = source(&dir.path().join("absent.csv"));

        let err = forwarder()
            .forward(&MemoryBus::new(), &src, Cursor::empty("fridge"))
            .await
            .unwrap_err();
        assert!(matches!(err, SourceError::MissingFile { .. }));
    }

    #[tokio::test]
    async fn test_cycle_keeps_cursor_on_schema_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("fridge.csv");
        append(&path, "date;energy\n15/01/2024 13:00:00;1\n");

        let fwd = forwarder();
        let bus = MemoryBus::new();
        let before = Cursor::at("fridge", utc(9, 0, 0));

        let cursors = fwd.cycle(&bus, &[source(&path)], vec![before.clone()]).await;
        assert_eq!(cursors, vec![before]);
        assert!(bus.is_empty());
    }

    #[tokio::test]
    async fn test_cycle_handles_each_source_independently() {
        let dir = tempdir().unwrap();
        let good = dir.path().join("tv.csv");
        append(&good, "time;watt\n15/01/2024 13:00:00;80\n");

        let sources = vec![
            SourceConfig {
                tag: "fridge".to_string(),
                path: dir.path().join("absent.csv"),
            },
            SourceConfig {
                tag: "tv".to_string(),
                path: good,
            },
        ];
        let cursors = vec![Cursor::empty("fridge"), Cursor::empty("tv")];

        let fwd = forwarder();
        let bus = MemoryBus::new();
        let next = fwd.cycle(&bus, &sources, cursors).await;

        assert_eq!(next[0], Cursor::empty("fridge"));
        assert_eq!(next[1], Cursor::at("tv", utc(12, 0, 0)));
        assert_eq!(bus.payloads(), vec!["power,appliance=tv watts=80.0 1705320000000000000"]);
    }

    #[tokio::test]
    async fn test_refused_messages_still_advance_cursor() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("fridge.csv");
        append(&path, "date;power\n15/01/2024 13:00:00;1\n");

        let outcome = forwarder()
            .forward(&MemoryBus::rejecting(), &source(&path), Cursor::empty("fridge"))
            .await
            .unwrap();
        assert_eq!(outcome.published, 0);
        assert_eq!(outcome.failed, 1);
        assert_eq!(outcome.cursor.high_water_mark, Some(utc(12, 0, 0)));
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("fridge.csv");
        append(&path, "date;power\n15/01/2024 13:00:00;1\n");

        let fwd = forwarder();
        let bus = MemoryBus::new();
        let sources = vec![source(&path)];

        let cursors = fwd
            .run(
                &bus,
                &sources,
                vec![Cursor::empty("fridge")],
                Duration::from_secs(3600),
                async {},
            )
            .await;

        // One cycle ran before the shutdown was observed
        assert_eq!(bus.len(), 1);
        assert_eq!(cursors, vec![Cursor::at("fridge", utc(12, 0, 0))]);
    }

    /// Accepts publishes but never completes them
    struct StalledBus;

    #[async_trait::async_trait]
    impl Publisher for StalledBus {
        async fn publish(
            &self,
            _topic: &str,
            _payload: Vec<u8>,
            _qos: Qos,
            _retain: bool,
        ) -> Result<(), crate::error::BusError> {
            std::future::pending().await
        }
    }

    #[tokio::test]
    async fn test_run_stops_during_a_stalled_cycle() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("fridge.csv");
        append(&path, "date;power\n15/01/2024 13:00:00;1\n");

        let fwd = forwarder();
        let sources = vec![source(&path)];
        let before = Cursor::at("fridge", utc(9, 0, 0));

        let cursors = tokio::time::timeout(
            Duration::from_secs(5),
            fwd.run(
                &StalledBus,
                &sources,
                vec![before.clone()],
                Duration::from_secs(3600),
                tokio::time::sleep(Duration::from_millis(50)),
            ),
        )
        .await
        .expect("shutdown was not observed during the cycle");

        assert_eq!(cursors, vec![before]);
    }

    #[tokio::test]
    async fn test_cycle_keeps_cursor_on_bad_timestamps() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("fridge.csv");
        append(
            &path,
            "date;power\n15/01/2024 13:00:00;1\nnot a date;2\n15/01/2024 13:00:20;3\n",
        );

        let fwd = forwarder();
        let bus = MemoryBus::new();
        let before = Cursor::at("fridge", utc(9, 0, 0));

        let cursors = fwd.cycle(&bus, &[source(&path)], vec![before.clone()]).await;
        assert_eq!(cursors, vec![before]);
        assert!(bus.is_empty());
    }

    #[tokio::test]
    async fn test_cycle_keeps_cursor_on_empty_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("fridge.csv");
        append(&path, "");

        let fwd = forwarder();
        let bus = MemoryBus::new();
        let before = Cursor::at("fridge", utc(9, 0, 0));

        let err = fwd
            .forward(&bus, &source(&path), before.clone())
            .await
            .unwrap_err();
        assert!(matches!(err, SourceError::EmptyFile { .. }));

        let cursors = fwd.cycle(&bus, &[source(&path)], vec![before.clone()]).await;
        assert_eq!(cursors, vec![before]);
        assert!(bus.is_empty());
    }

    #[test]
    fn test_from_config() {
        let mut config = ForwarderConfig::default();
        config.qos = 1;
        config.retain = true;
        let fwd = Forwarder::from_config(&config).unwrap();
        assert_eq!(fwd.qos, Qos::AtLeastOnce);
        assert!(fwd.retain);
        assert_eq!(fwd.parser().tz(), chrono_tz::Africa::Tunis);

        config.timezone = "Nowhere/Special".to_string();
        assert!(Forwarder::from_config(&config).is_err());
    }
}
