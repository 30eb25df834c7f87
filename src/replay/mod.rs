//! Recorded-Session Replayer
//!
//! Replays a static prediction session as if it were live: the document is
//! re-read from disk on every pass, expanded into time-ordered events and
//! published one by one with a fixed wall-clock delay, forever.
//!
//! The pacing does not follow the gaps between event times.

mod session;

pub use session::{
    build_events, classify, format_iso, resolve_time, ApplianceSeries, PredictionMessage,
    ReplayEvent, ReplayOptions, SessionDocument, TimeKind,
};

use std::future::Future;
use std::path::PathBuf;
use std::time::Duration;

use crate::bus::{Publisher, Qos};
use crate::config::ReplayConfig;
use crate::error::ReplayError;

/// Default boundary between relative offsets and UNIX timestamps.
///
/// Recorded files mix both encodings; values at or above one billion
/// seconds (2001-09-09) are read as absolute.
pub const EPOCH_THRESHOLD_SECS: f64 = 1_000_000_000.0;

/// Result of one pass over the document
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PassSummary {
    pub published: usize,
    pub failed: usize,
}

/// Publishes a recorded session in a loop
#[derive(Debug, Clone)]
pub struct Replayer {
    file: PathBuf,
    topic: String,
    options: ReplayOptions,
    delay: Duration,
    cycle_pause: Duration,
}

impl Replayer {
    pub fn new(file: impl Into<PathBuf>, topic: impl Into<String>, options: ReplayOptions) -> Self {
        Self {
            file: file.into(),
            topic: topic.into(),
            options,
            delay: Duration::from_millis(50),
            cycle_pause: Duration::from_secs(5),
        }
    }

    /// Build from the `[replay]` section
    pub fn from_config(config: &ReplayConfig) -> Self {
        let options = ReplayOptions {
            appliance: config.appliance.clone(),
            stride: config.stride,
            keep_only_offsets: config.keep_only_offsets,
            max_events: config.limit(),
            epoch_threshold: config.epoch_threshold,
        };

        Self::new(config.file.clone(), config.topic.clone(), options)
            .with_delay(Duration::from_millis(config.delay_ms))
            .with_cycle_pause(Duration::from_secs(config.cycle_pause_secs))
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn with_cycle_pause(mut self, pause: Duration) -> Self {
        self.cycle_pause = pause;
        self
    }

    pub fn options(&self) -> &ReplayOptions {
        &self.options
    }

    /// Load the document and publish every event once
    pub async fn publish_once(&self, bus: &dyn Publisher) -> Result<PassSummary, ReplayError> {
        let doc = SessionDocument::load(&self.file)?;
        let events = build_events(&doc, &self.options)?;

        let mut summary = PassSummary {
            published: 0,
            failed: 0,
        };

        for event in &events {
            let payload = serde_json::to_vec(&event.message)?;
            match bus
                .publish(&self.topic, payload, Qos::AtMostOnce, false)
                .await
            {
                Ok(()) => summary.published += 1,
                Err(e) => {
                    summary.failed += 1;
                    tracing::warn!(error = %e, "Publish failed");
                }
            }

            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
        }

        tracing::info!(
            published = summary.published,
            failed = summary.failed,
            mode = if self.options.keep_only_offsets {
                "offsets only"
            } else {
                "offsets+unix sorted"
            },
            "Published {} points",
            summary.published
        );

        Ok(summary)
    }

    /// Replay until `shutdown` resolves. Returns the number of passes that
    /// completed.
    pub async fn run<F>(&self, bus: &dyn Publisher, shutdown: F) -> usize
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);

        tracing::info!(
            file = %self.file.display(),
            appliance = %self.options.appliance,
            topic = %self.topic,
            "Replayer started"
        );

        let mut passes = 0;
        loop {
            tokio::select! {
                result = self.publish_once(bus) => {
                    match result {
                        Ok(_) => passes += 1,
                        Err(e) => tracing::warn!(error = %e, "Replay pass failed"),
                    }
                }
                _ = &mut shutdown => break,
            }

            tracing::info!(
                pause_secs = self.cycle_pause.as_secs(),
                "File replay finished, waiting before re-reading"
            );

            tokio::select! {
                _ = tokio::time::sleep(self.cycle_pause) => {}
                _ = &mut shutdown => break,
            }
        }

        tracing::info!(passes, "Stop requested");
        passes
    }
}
