//! Configuration System
//!
//! Handles loading configuration from files and environment variables.
//! Supports TOML config files and environment variable overrides.
//! There is no dynamic reload: the configuration is read once at startup.

use chrono_tz::Tz;
use serde::Deserialize;
use std::path::{Path, PathBuf};

use crate::bus::Qos;

/// Main configuration structure
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub broker: BrokerConfig,

    #[serde(default)]
    pub forwarder: ForwarderConfig,

    #[serde(default)]
    pub replay: ReplayConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

/// MQTT broker connection settings
#[derive(Debug, Clone, Deserialize)]
pub struct BrokerConfig {
    #[serde(default = "default_broker_host")]
    pub host: String,

    #[serde(default = "default_broker_port")]
    pub port: u16,

    #[serde(default = "default_keepalive")]
    pub keepalive_secs: u64,

    #[serde(default = "default_client_id")]
    pub client_id: String,

    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
}

fn default_broker_host() -> String {
    "localhost".to_string()
}

fn default_broker_port() -> u16 {
    1884
}

fn default_keepalive() -> u64 {
    60
}

fn default_client_id() -> String {
    "wattrelay".to_string()
}

fn default_connect_timeout() -> u64 {
    10
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            host: default_broker_host(),
            port: default_broker_port(),
            keepalive_secs: default_keepalive(),
            client_id: default_client_id(),
            connect_timeout_secs: default_connect_timeout(),
        }
    }
}

impl BrokerConfig {
    /// `host:port` for log lines and errors
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Startup behaviour of the CSV forwarder
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum StartMode {
    /// Send the whole history on the first cycle
    #[default]
    All,
    /// Start at the end of each file, only forward newly appended rows
    Tail,
}

impl std::str::FromStr for StartMode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "all" => Ok(StartMode::All),
            "tail" => Ok(StartMode::Tail),
            other => Err(ConfigError::Invalid(format!(
                "unknown start mode {other:?} (expected \"all\" or \"tail\")"
            ))),
        }
    }
}

/// Unit of the integer timestamp written in line protocol
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Precision {
    #[default]
    Ns,
    Us,
    Ms,
    S,
}

/// One CSV file to tail
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct SourceConfig {
    /// Appliance tag written into every message
    pub tag: String,
    /// Path of the growing CSV file
    pub path: PathBuf,
}

/// Incremental CSV forwarder settings
#[derive(Debug, Clone, Deserialize)]
pub struct ForwarderConfig {
    #[serde(default = "default_power_topic")]
    pub topic: String,

    #[serde(default = "default_measurement")]
    pub measurement: String,

    #[serde(default = "default_interval")]
    pub interval_secs: u64,

    #[serde(default)]
    pub start_mode: StartMode,

    #[serde(default = "default_timezone")]
    pub timezone: String,

    #[serde(default)]
    pub precision: Precision,

    #[serde(default)]
    pub qos: u8,

    #[serde(default)]
    pub retain: bool,

    #[serde(default = "default_sources")]
    pub sources: Vec<SourceConfig>,
}

fn default_power_topic() -> String {
    "home/power".to_string()
}

fn default_measurement() -> String {
    "power".to_string()
}

fn default_interval() -> u64 {
    10
}

fn default_timezone() -> String {
    "Africa/Tunis".to_string()
}

fn default_sources() -> Vec<SourceConfig> {
    vec![
        SourceConfig {
            tag: "fridge".to_string(),
            path: PathBuf::from("txttocsv/mesuresfridge_puissance_active.csv"),
        },
        SourceConfig {
            tag: "tv".to_string(),
            path: PathBuf::from("txttocsv/mesurestv_puissance_active.csv"),
        },
    ]
}

impl Default for ForwarderConfig {
    fn default() -> Self {
        Self {
            topic: default_power_topic(),
            measurement: default_measurement(),
            interval_secs: default_interval(),
            start_mode: StartMode::default(),
            timezone: default_timezone(),
            precision: Precision::default(),
            qos: 0,
            retain: false,
            sources: default_sources(),
        }
    }
}

impl ForwarderConfig {
    /// Resolve the configured IANA zone
    pub fn tz(&self) -> Result<Tz, ConfigError> {
        self.timezone
            .parse::<Tz>()
            .map_err(|_| ConfigError::Invalid(format!("unknown time zone {:?}", self.timezone)))
    }

    pub fn qos(&self) -> Result<Qos, ConfigError> {
        Qos::try_from(self.qos)
            .map_err(|q| ConfigError::Invalid(format!("unsupported qos level {q}")))
    }
}

/// Recorded-session replayer settings
#[derive(Debug, Clone, Deserialize)]
pub struct ReplayConfig {
    /// Broker host for the replay process (falls back to `[broker]`)
    #[serde(default)]
    pub host: Option<String>,

    /// Broker port for the replay process (falls back to `[broker]`)
    #[serde(default)]
    pub port: Option<u16>,

    #[serde(default = "default_replay_topic")]
    pub topic: String,

    #[serde(default = "default_appliance")]
    pub appliance: String,

    /// Keep one record out of `stride`
    #[serde(default = "default_stride")]
    pub stride: usize,

    /// Pause between two publishes
    #[serde(default = "default_delay_ms")]
    pub delay_ms: u64,

    #[serde(default = "default_replay_file")]
    pub file: PathBuf,

    /// Drop entries whose time value is an absolute epoch timestamp
    #[serde(default = "default_keep_only_offsets")]
    pub keep_only_offsets: bool,

    /// Cap on emitted events per pass, 0 means no cap
    #[serde(default = "default_max_events")]
    pub max_events: usize,

    /// Time values at or above this are epoch seconds, below are offsets
    #[serde(default = "default_epoch_threshold")]
    pub epoch_threshold: f64,

    #[serde(default = "default_cycle_pause")]
    pub cycle_pause_secs: u64,
}

fn default_replay_topic() -> String {
    "nilm/predictions".to_string()
}

fn default_appliance() -> String {
    "dishwasher".to_string()
}

fn default_stride() -> usize {
    1
}

fn default_delay_ms() -> u64 {
    50
}

fn default_replay_file() -> PathBuf {
    PathBuf::from("sample.json")
}

fn default_keep_only_offsets() -> bool {
    true
}

fn default_max_events() -> usize {
    480
}

fn default_epoch_threshold() -> f64 {
    crate::replay::EPOCH_THRESHOLD_SECS
}

fn default_cycle_pause() -> u64 {
    5
}

impl Default for ReplayConfig {
    fn default() -> Self {
        Self {
            host: None,
            port: None,
            topic: default_replay_topic(),
            appliance: default_appliance(),
            stride: default_stride(),
            delay_ms: default_delay_ms(),
            file: default_replay_file(),
            keep_only_offsets: default_keep_only_offsets(),
            max_events: default_max_events(),
            epoch_threshold: default_epoch_threshold(),
            cycle_pause_secs: default_cycle_pause(),
        }
    }
}

impl ReplayConfig {
    pub fn limit(&self) -> Option<usize> {
        (self.max_events > 0).then_some(self.max_events)
    }
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,

    #[serde(default = "default_log_format")]
    pub format: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

impl Config {
    /// Load configuration from a file
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
            path: path.to_path_buf(),
            error: e.to_string(),
        })?;

        Self::from_toml(&content).map_err(|e| match e {
            ConfigError::Parse { error, .. } => ConfigError::Parse {
                path: path.to_path_buf(),
                error,
            },
            other => other,
        })
    }

    /// Parse configuration from TOML text
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        toml::from_str(content).map_err(|e| ConfigError::Parse {
            path: PathBuf::new(),
            error: e.to_string(),
        })
    }

    /// Load configuration from environment variables only
    pub fn from_env() -> Self {
        let mut config = Config::default();
        config.apply_env_overrides();
        config
    }

    /// Load configuration with environment variable overrides
    pub fn load_with_env(path: &Path) -> Result<Self, ConfigError> {
        let mut config = Self::load(path)?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Load from default locations or environment, logging the outcome
    pub fn load_default() -> Self {
        let loaded = Self::search_default();
        loaded.log();
        loaded.config
    }

    /// Load from default locations or environment without logging.
    ///
    /// The outcome is returned so it can be reported once a subscriber is
    /// installed.
    pub fn search_default() -> DefaultLoad {
        let config_paths: Vec<PathBuf> = [
            dirs::config_dir().map(|p| p.join("wattrelay").join("config.toml")),
            Some(PathBuf::from("/etc/wattrelay/config.toml")),
            Some(PathBuf::from("./config.toml")),
        ]
        .into_iter()
        .flatten()
        .collect();

        Self::search(&config_paths)
    }

    /// First of `paths` that exists and loads, else defaults
    pub fn search(paths: &[PathBuf]) -> DefaultLoad {
        let mut failures = Vec::new();

        for path in paths {
            if path.exists() {
                match Self::load_with_env(path) {
                    Ok(config) => {
                        return DefaultLoad {
                            config,
                            path: Some(path.clone()),
                            failures,
                        }
                    }
                    Err(e) => failures.push(e),
                }
            }
        }

        DefaultLoad {
            config: Self::from_env(),
            path: None,
            failures,
        }
    }

    /// Broker settings for the replay process
    pub fn replay_broker(&self) -> BrokerConfig {
        let mut broker = self.broker.clone();
        if let Some(host) = &self.replay.host {
            broker.host = host.clone();
        }
        if let Some(port) = self.replay.port {
            broker.port = port;
        }
        broker
    }

    /// Reject values either loop cannot run with
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.validate_forwarder()?;
        self.validate_replay()
    }

    /// Checks for `wattrelay forward`
    pub fn validate_forwarder(&self) -> Result<(), ConfigError> {
        self.forwarder.tz()?;
        self.forwarder.qos()?;

        if self.forwarder.interval_secs == 0 {
            return Err(ConfigError::Invalid(
                "forwarder.interval_secs must be greater than 0".to_string(),
            ));
        }
        if self.forwarder.sources.is_empty() {
            return Err(ConfigError::Invalid(
                "at least one [[forwarder.sources]] entry is required".to_string(),
            ));
        }
        Ok(())
    }

    /// Checks for `wattrelay replay`
    pub fn validate_replay(&self) -> Result<(), ConfigError> {
        if self.replay.stride == 0 {
            return Err(ConfigError::Invalid(
                "replay.stride must be at least 1".to_string(),
            ));
        }
        if !self.replay.epoch_threshold.is_finite() || self.replay.epoch_threshold <= 0.0 {
            return Err(ConfigError::Invalid(
                "replay.epoch_threshold must be a positive number".to_string(),
            ));
        }
        Ok(())
    }

    /// Apply environment variable overrides to an existing config
    fn apply_env_overrides(&mut self) {
        // Broker overrides
        if let Ok(host) = std::env::var("WATTRELAY_BROKER_HOST") {
            self.broker.host = host;
        }
        if let Ok(port) = std::env::var("WATTRELAY_BROKER_PORT") {
            if let Ok(p) = port.parse() {
                self.broker.port = p;
            }
        }

        // Forwarder overrides
        if let Ok(topic) = std::env::var("WATTRELAY_TOPIC") {
            self.forwarder.topic = topic;
        }
        if let Ok(mode) = std::env::var("WATTRELAY_START_MODE") {
            match mode.parse() {
                Ok(m) => self.forwarder.start_mode = m,
                Err(e) => tracing::warn!("Ignoring WATTRELAY_START_MODE: {}", e),
            }
        }
        if let Ok(interval) = std::env::var("WATTRELAY_INTERVAL_SECS") {
            if let Ok(i) = interval.parse() {
                self.forwarder.interval_secs = i;
            }
        }
        if let Ok(tz) = std::env::var("WATTRELAY_TIMEZONE") {
            self.forwarder.timezone = tz;
        }

        // Replay overrides
        if let Ok(file) = std::env::var("WATTRELAY_REPLAY_FILE") {
            self.replay.file = PathBuf::from(file);
        }
        if let Ok(appliance) = std::env::var("WATTRELAY_REPLAY_APPLIANCE") {
            self.replay.appliance = appliance;
        }

        // Logging overrides
        if let Ok(level) = std::env::var("WATTRELAY_LOG_LEVEL") {
            self.logging.level = level;
        }
        if let Ok(format) = std::env::var("WATTRELAY_LOG_FORMAT") {
            self.logging.format = format;
        }
    }
}

/// Outcome of searching the default config locations
#[derive(Debug)]
pub struct DefaultLoad {
    pub config: Config,
    /// File the config came from, `None` for built-in defaults
    pub path: Option<PathBuf>,
    /// Files that exist but could not be loaded
    pub failures: Vec<ConfigError>,
}

impl DefaultLoad {
    pub fn log(&self) {
        for e in &self.failures {
            tracing::warn!("Skipping config file: {}", e);
        }
        match &self.path {
            Some(path) => tracing::info!("Loaded config from {:?}", path),
            None => tracing::info!("Using default config with environment overrides"),
        }
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path:?}: {error}")]
    Io { path: PathBuf, error: String },

    #[error("Failed to parse config file {path:?}: {error}")]
    Parse { path: PathBuf, error: String },

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Generate a default config file content
pub fn generate_default_config() -> String {
    r#"# Wattrelay Configuration
#
# Environment variables override these settings:
# - WATTRELAY_BROKER_HOST
# - WATTRELAY_BROKER_PORT
# - WATTRELAY_TOPIC
# - WATTRELAY_START_MODE
# - WATTRELAY_INTERVAL_SECS
# - WATTRELAY_TIMEZONE
# - WATTRELAY_REPLAY_FILE
# - WATTRELAY_REPLAY_APPLIANCE
# - WATTRELAY_LOG_LEVEL
# - WATTRELAY_LOG_FORMAT

[broker]
host = "localhost"
port = 1884
keepalive_secs = 60

# Prefix of the MQTT client id (a random suffix is appended)
client_id = "wattrelay"

# Startup fails if the broker does not answer within this delay
connect_timeout_secs = 10

[forwarder]
topic = "home/power"

# Line protocol measurement name
measurement = "power"

# Scan every N seconds
interval_secs = 10

# "all" sends the history on the first cycle, "tail" starts at the end
start_mode = "all"

# Zone of the naive timestamps written by the loggers
timezone = "Africa/Tunis"

# Unit of the line protocol timestamp: ns, us, ms, s
precision = "ns"

qos = 0
retain = false

[[forwarder.sources]]
tag = "fridge"
path = "txttocsv/mesuresfridge_puissance_active.csv"

[[forwarder.sources]]
tag = "tv"
path = "txttocsv/mesurestv_puissance_active.csv"

[replay]
# Broker used by the replay process (remove both to use [broker])
host = "127.0.0.1"
port = 1883

topic = "nilm/predictions"
appliance = "dishwasher"

# Keep one record out of N
stride = 1

# Delay between two publishes (ms)
delay_ms = 50

file = "sample.json"

# Ignore entries carrying absolute UNIX timestamps
keep_only_offsets = true

# Number of points published per pass (0 for all)
max_events = 480

# Time values >= threshold are epoch seconds, smaller ones are offsets
epoch_threshold = 1000000000.0

# Pause before re-reading the file (seconds)
cycle_pause_secs = 5

[logging]
# Log level: trace, debug, info, warn, error
level = "info"

# Log format: pretty (for development) or json (for production)
format = "pretty"
"#
    .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_parses() {
        let config = Config::from_toml(&generate_default_config()).unwrap();
        assert_eq!(config.broker.port, 1884);
        assert_eq!(config.forwarder.topic, "home/power");
        assert_eq!(config.forwarder.start_mode, StartMode::All);
        assert_eq!(config.forwarder.sources.len(), 2);
        assert_eq!(config.replay.limit(), Some(480));
        assert_eq!(config.replay.epoch_threshold, 1_000_000_000.0);
        config.validate().unwrap();
    }

    #[test]
    fn test_empty_file_uses_defaults() {
        let config = Config::from_toml("").unwrap();
        assert_eq!(config.broker.host, "localhost");
        assert_eq!(config.forwarder.interval_secs, 10);
        assert_eq!(config.forwarder.precision, Precision::Ns);
        assert_eq!(config.replay.appliance, "dishwasher");
        assert!(config.replay.keep_only_offsets);
    }

    #[test]
    fn test_partial_sections() {
        let config = Config::from_toml(
            r#"
            [forwarder]
            start_mode = "tail"
            timezone = "Europe/Paris"

            [[forwarder.sources]]
            tag = "oven"
            path = "/var/log/oven.csv"

            [replay]
            max_events = 0
            "#,
        )
        .unwrap();

        assert_eq!(config.forwarder.start_mode, StartMode::Tail);
        assert_eq!(config.forwarder.tz().unwrap(), chrono_tz::Europe::Paris);
        assert_eq!(
            config.forwarder.sources,
            vec![SourceConfig {
                tag: "oven".to_string(),
                path: PathBuf::from("/var/log/oven.csv"),
            }]
        );
        assert_eq!(config.replay.limit(), None);
    }

    #[test]
    fn test_replay_broker_override() {
        let config = Config::from_toml(&generate_default_config()).unwrap();
        let broker = config.replay_broker();
        assert_eq!(broker.host, "127.0.0.1");
        assert_eq!(broker.port, 1883);
        assert_eq!(broker.keepalive_secs, 60);
    }

    #[test]
    fn test_replay_broker_falls_back_when_unset_in_file() {
        let config = Config::from_toml(
            r#"
            [broker]
            host = "mqtt.lan"
            port = 1884

            [replay]
            topic = "nilm/predictions"
            "#,
        )
        .unwrap();
        assert_eq!(config.replay.host, None);
        assert_eq!(config.replay_broker().addr(), "mqtt.lan:1884");

        let config = Config::from_toml("[replay]\nport = 1999\n").unwrap();
        assert_eq!(config.replay_broker().addr(), "localhost:1999");
    }

    #[test]
    fn test_validation_is_split_by_loop() {
        let mut config = Config::default();
        config.forwarder.sources.clear();
        config.forwarder.timezone = "Mars/Olympus".to_string();
        assert!(config.validate_replay().is_ok());
        assert!(config.validate_forwarder().is_err());

        let mut config = Config::default();
        config.replay.stride = 0;
        assert!(config.validate_forwarder().is_ok());
        assert!(config.validate_replay().is_err());
    }

    #[test]
    fn test_search_reports_broken_file() {
        let dir = tempfile::tempdir().unwrap();
        let broken = dir.path().join("broken.toml");
        let good = dir.path().join("good.toml");
        std::fs::write(&broken, "[broker\n").unwrap();
        std::fs::write(&good, "[broker]\nport = 2000\n").unwrap();

        let paths = [dir.path().join("absent.toml"), broken.clone(), good.clone()];
        let loaded = Config::search(&paths);
        assert_eq!(loaded.path, Some(good));
        assert_eq!(loaded.config.broker.port, 2000);
        assert_eq!(loaded.failures.len(), 1);
        assert!(matches!(&loaded.failures[0], ConfigError::Parse { path, .. } if *path == broken));

        let loaded = Config::search(&[broken]);
        assert_eq!(loaded.path, None);
        assert_eq!(loaded.failures.len(), 1);
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        let mut config = Config::default();
        config.forwarder.timezone = "Mars/Olympus".to_string();
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));

        let mut config = Config::default();
        config.replay.stride = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.forwarder.qos = 3;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.forwarder.sources.clear();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_start_mode_from_str() {
        assert_eq!("TAIL".parse::<StartMode>().unwrap(), StartMode::Tail);
        assert_eq!("all".parse::<StartMode>().unwrap(), StartMode::All);
        assert!("head".parse::<StartMode>().is_err());
    }

    #[test]
    fn test_load_reports_path_on_parse_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[broker\nport = ").unwrap();

        match Config::load(&path) {
            Err(ConfigError::Parse { path: p, .. }) => assert_eq!(p, path),
            other => panic!("expected parse error, got {:?}", other),
        }
    }
}
