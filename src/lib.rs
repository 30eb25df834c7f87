//! # wattrelay
//!
//! Power-reading relay for a home energy dashboard. Two independent loops
//! feed an MQTT broker:
//!
//! - **Forwarder**: rescans append-only CSV logs from smart plugs and
//!   publishes each new reading once, as a line-protocol message
//! - **Replayer**: plays back a recorded appliance prediction session as
//!   paced JSON messages, looping forever
//!
//! ## Modules
//!
//! - [`csv_source`]: delimiter/decimal/column detection and time normalisation
//! - [`forwarder`]: per-source cursors, batch planning and the scan loop
//! - [`replay`]: session documents and the replay loop
//! - [`bus`]: the `Publisher` seam with MQTT and in-memory backends
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use wattrelay::bus::MqttBus;
//! use wattrelay::config::Config;
//! use wattrelay::forwarder::Forwarder;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load_default();
//!     let bus = MqttBus::connect(&config.broker).await?;
//!
//!     let forwarder = Forwarder::from_config(&config.forwarder)?;
//!     let sources = config.forwarder.sources.clone();
//!     let cursors = sources
//!         .iter()
//!         .map(|s| forwarder.seed_cursor(s, config.forwarder.start_mode))
//!         .collect();
//!
//!     // One scan over every source
//!     let cursors = forwarder.cycle(&bus, &sources, cursors).await;
//!     println!("{:?}", cursors);
//!
//!     bus.disconnect().await;
//!     Ok(())
//! }
//! ```

pub mod bus;
pub mod config;
pub mod csv_source;
pub mod error;
pub mod forwarder;
pub mod logging;
pub mod replay;

pub use bus::{MemoryBus, MqttBus, Publisher, Qos};
pub use config::Config;
pub use csv_source::{CsvParser, Reading};
pub use error::{BusError, ReplayError, SourceError};
pub use forwarder::{plan_batch, Cursor, Forwarder};
pub use replay::Replayer;
