//! wattrelay CLI
//!
//! - `forward`: scan the CSV sources and publish new readings
//! - `replay`: loop over a recorded prediction session
//! - `inspect`: show how a CSV file is read and what would be sent
//! - `config`: print the default configuration

use anyhow::Context;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::time::Duration;

use wattrelay::bus::{MemoryBus, MqttBus};
use wattrelay::config::{generate_default_config, Config, SourceConfig, StartMode};
use wattrelay::forwarder::{Cursor, Forwarder};
use wattrelay::logging::init_logging;
use wattrelay::replay::Replayer;

#[derive(Parser)]
#[command(name = "wattrelay")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Relay smart-plug power readings and recorded predictions to MQTT")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Config file (default: search the usual locations)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Forward new CSV readings as line protocol
    Forward {
        /// Send the history first (all) or only new rows (tail)
        #[arg(long, value_enum)]
        start_mode: Option<StartMode>,
        /// Seconds between two scans
        #[arg(short, long)]
        interval: Option<u64>,
        /// Run a single scan then exit
        #[arg(long)]
        once: bool,
    },

    /// Replay a recorded prediction session
    Replay {
        /// Appliance to replay
        #[arg(short, long)]
        appliance: Option<String>,
        /// Session JSON file
        #[arg(short, long)]
        file: Option<PathBuf>,
        /// Publish the session once then exit
        #[arg(long)]
        once: bool,
    },

    /// Parse a CSV file and print the messages a full forward would send
    Inspect {
        /// Path to CSV file
        path: PathBuf,
        /// Appliance tag
        #[arg(short, long, default_value = "inspect")]
        tag: String,
        /// IANA zone of the timestamps (default: from config)
        #[arg(long)]
        timezone: Option<String>,
        /// Number of messages to print
        #[arg(short, long, default_value = "10")]
        limit: usize,
    },

    /// Generate default config file
    Config {
        /// Output path (default: stdout)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    if let Commands::Config { output } = &cli.command {
        let content = generate_default_config();
        match output {
            Some(path) => {
                std::fs::write(path, content)
                    .with_context(|| format!("writing {}", path.display()))?;
                println!("Config written to {}", path.display());
            }
            None => print!("{}", content),
        }
        return Ok(());
    }

    // Logging depends on the config, so the search is reported afterwards
    let (mut config, search) = match &cli.config {
        Some(path) => (Config::load_with_env(path)?, None),
        None => {
            let loaded = Config::search_default();
            (loaded.config.clone(), Some(loaded))
        }
    };

    init_logging(&config.logging).context("installing the log subscriber")?;
    tracing::info!("wattrelay v{}", env!("CARGO_PKG_VERSION"));
    match (&search, &cli.config) {
        (Some(loaded), _) => loaded.log(),
        (None, Some(path)) => tracing::info!("Loaded config from {:?}", path),
        (None, None) => {}
    }

    match cli.command {
        Commands::Forward {
            start_mode,
            interval,
            once,
        } => {
            if let Some(mode) = start_mode {
                config.forwarder.start_mode = mode;
            }
            if let Some(secs) = interval {
                config.forwarder.interval_secs = secs;
            }
            config.validate_forwarder()?;
            forward(&config, once).await
        }
        Commands::Replay {
            appliance,
            file,
            once,
        } => {
            if let Some(appliance) = appliance {
                config.replay.appliance = appliance;
            }
            if let Some(file) = file {
                config.replay.file = file;
            }
            config.validate_replay()?;
            replay(&config, once).await
        }
        Commands::Inspect {
            path,
            tag,
            timezone,
            limit,
        } => {
            if let Some(tz) = timezone {
                config.forwarder.timezone = tz;
            }
            inspect(&config, SourceConfig { tag, path }, limit).await
        }
        Commands::Config { .. } => Ok(()),
    }
}

async fn forward(config: &Config, once: bool) -> anyhow::Result<()> {
    let forwarder = Forwarder::from_config(&config.forwarder)?;
    let sources = &config.forwarder.sources;

    let bus = MqttBus::connect(&config.broker)
        .await
        .context("connecting to the broker")?;
    tracing::info!(
        broker = %config.broker.addr(),
        topic = %config.forwarder.topic,
        start_mode = ?config.forwarder.start_mode,
        "Connected"
    );

    let cursors: Vec<Cursor> = sources
        .iter()
        .map(|s| forwarder.seed_cursor(s, config.forwarder.start_mode))
        .collect();

    if once {
        forwarder.cycle(&bus, sources, cursors).await;
    } else {
        let interval = Duration::from_secs(config.forwarder.interval_secs);
        forwarder
            .run(&bus, sources, cursors, interval, shutdown_signal())
            .await;
    }

    bus.disconnect().await;
    tracing::info!("Bye");
    Ok(())
}

async fn replay(config: &Config, once: bool) -> anyhow::Result<()> {
    let replayer = Replayer::from_config(&config.replay);
    let broker = config.replay_broker();

    let bus = MqttBus::connect(&broker)
        .await
        .context("connecting to the broker")?;
    tracing::info!(broker = %broker.addr(), topic = %config.replay.topic, "Connected");

    let result = if once {
        replayer.publish_once(&bus).await.map(|_| ())
    } else {
        replayer.run(&bus, shutdown_signal()).await;
        Ok(())
    };

    bus.disconnect().await;
    tracing::info!("Bye");
    Ok(result?)
}

async fn inspect(config: &Config, source: SourceConfig, limit: usize) -> anyhow::Result<()> {
    let forwarder = Forwarder::from_config(&config.forwarder)?;
    let parsed = forwarder
        .parser()
        .read_file(&source.tag, &source.path)
        .with_context(|| format!("reading {}", source.path.display()))?;

    println!("File:        {}", source.path.display());
    println!("Delimiter:   {:?}", parsed.delimiter as char);
    println!("Decimal:     {:?}", parsed.decimal);
    println!("Timestamp:   {}", parsed.timestamp_column);
    println!("Power:       {}", parsed.power_column);
    println!("Readings:    {}", parsed.readings.len());
    println!("Dropped:     {}", parsed.dropped);
    if parsed.ambiguous > 0 || parsed.shifted > 0 {
        println!(
            "DST:         {} ambiguous, {} shifted",
            parsed.ambiguous, parsed.shifted
        );
    }
    if let (Some(first), Some(last)) = (parsed.min_timestamp(), parsed.max_timestamp()) {
        println!("Range:       {} .. {}", first, last);
    }

    let bus = MemoryBus::new();
    let outcome = forwarder
        .forward(&bus, &source, Cursor::empty(&source.tag))
        .await?;

    println!();
    println!(
        "{} message(s) on {}:",
        outcome.published, config.forwarder.topic
    );
    for line in bus.payloads().iter().take(limit) {
        println!("  {}", line);
    }
    if outcome.published > limit {
        println!("  ... {} more", outcome.published - limit);
    }

    Ok(())
}

/// Wait for Ctrl+C or SIGTERM
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install signal handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("Shutdown signal received");
}
