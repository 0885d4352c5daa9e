use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{info, warn};
use zonewatch_core::{AllocatorConfig, CorrelationConfig, ZoneTable};

use crate::error::ConfigError;

/// Returns the ~/.zonewatch directory, creating it if needed.
/// Falls back to a local `.zonewatch` directory if the home directory cannot be determined.
pub fn zonewatch_data_dir() -> PathBuf {
    match dirs::home_dir() {
        Some(mut path) => {
            path.push(".zonewatch");
            if let Err(e) = fs::create_dir_all(&path) {
                warn!(
                    error = %e,
                    "Could not create ~/.zonewatch, falling back to local .zonewatch"
                );
                return local_data_dir();
            }
            path
        }
        None => {
            warn!("Could not determine home directory, falling back to local .zonewatch");
            local_data_dir()
        }
    }
}

fn local_data_dir() -> PathBuf {
    let fallback = PathBuf::from(".zonewatch");
    let _ = fs::create_dir_all(&fallback);
    fallback
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub correlation: CorrelationConfig,
    #[serde(default)]
    pub allocator: AllocatorConfig,
    #[serde(default)]
    pub transport: TransportConfig,
    #[serde(default)]
    pub outbound: OutboundConfig,
    #[serde(default)]
    pub sink: SinkConfig,
    #[serde(default)]
    pub api: ApiConfig,
    /// Zone table; validated as a section partition when parsed.
    #[serde(default)]
    pub zones: ZoneTable,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportConfig {
    /// Deliveries handed out but not yet finished or requeued.
    #[serde(default = "default_max_in_flight")]
    pub max_in_flight: usize,
    /// Pending messages per topic before publishes are refused.
    #[serde(default = "default_queue_depth")]
    pub queue_depth: usize,
    #[serde(default = "default_raw_topic")]
    pub raw_topic: String,
    #[serde(default = "default_outbound_topic")]
    pub outbound_topic: String,
}

fn default_max_in_flight() -> usize {
    5
}
fn default_queue_depth() -> usize {
    10_000
}
fn default_raw_topic() -> String {
    "raw-sensor-data".to_string()
}
fn default_outbound_topic() -> String {
    "sensor-data".to_string()
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            max_in_flight: default_max_in_flight(),
            queue_depth: default_queue_depth(),
            raw_topic: default_raw_topic(),
            outbound_topic: default_outbound_topic(),
        }
    }
}

/// Where accepted events are forwarded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutboundMode {
    /// Publish onto the outbound topic of the in-process channel, drained
    /// through `GET /api/outbound`.
    Queue,
    /// POST each event as JSON to `url`.
    Http,
    /// Only log the event.
    #[default]
    Log,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboundConfig {
    #[serde(default)]
    pub mode: OutboundMode,
    /// Downstream endpoint for `http` mode
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_initial_backoff")]
    pub initial_backoff_ms: u64,
    #[serde(default = "default_max_backoff")]
    pub max_backoff_ms: u64,
    /// JSON-lines file receiving events that exhausted their retries
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dead_letter_path: Option<PathBuf>,
}

fn default_max_retries() -> u32 {
    5
}
fn default_initial_backoff() -> u64 {
    100
}
fn default_max_backoff() -> u64 {
    5_000
}

impl Default for OutboundConfig {
    fn default() -> Self {
        Self {
            mode: OutboundMode::default(),
            url: None,
            max_retries: default_max_retries(),
            initial_backoff_ms: default_initial_backoff(),
            max_backoff_ms: default_max_backoff(),
            dead_letter_path: None,
        }
    }
}

impl OutboundConfig {
    pub fn dead_letter_path(&self) -> PathBuf {
        self.dead_letter_path
            .clone()
            .unwrap_or_else(|| zonewatch_data_dir().join("dead_letter.jsonl"))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct SinkConfig {
    /// JSON-lines file receiving anomaly records
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,
}

impl SinkConfig {
    pub fn path(&self) -> PathBuf {
        self.path
            .clone()
            .unwrap_or_else(|| zonewatch_data_dir().join("anomalies.jsonl"))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    #[serde(default = "default_port")]
    pub port: u16,
    /// Bind 0.0.0.0 instead of loopback
    #[serde(default)]
    pub public: bool,
}

fn default_port() -> u16 {
    8080
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            public: false,
        }
    }
}

impl ApiConfig {
    pub fn bind_addr(&self) -> String {
        if self.public || std::env::var("ZONEWATCH_PUBLIC").is_ok() {
            format!("0.0.0.0:{}", self.port)
        } else {
            format!("127.0.0.1:{}", self.port)
        }
    }
}

impl Config {
    pub fn default_path() -> PathBuf {
        let mut path = zonewatch_data_dir();
        path.push("config.toml");
        path
    }

    /// Loads `path`, writing the defaults there first if it does not exist.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            let config = Config::default();
            config.save_to(path)?;
            info!(path = %path.display(), "Wrote default configuration");
            return Ok(config);
        }

        let content = fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        match path {
            Some(path) => Self::load_from(path),
            None => Self::load_from(&Self::default_path()),
        }
    }

    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(content)?)
    }

    pub fn save_to(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let toml = toml::to_string_pretty(self)?;
        fs::write(path, toml)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use zonewatch_core::TrustPolicy;

    #[test]
    fn empty_file_yields_defaults() {
        let config = Config::from_toml("").unwrap();
        assert_eq!(config.zones, ZoneTable::reference());
        assert_eq!(config.correlation.window_capacity, 50);
        assert_eq!(config.correlation.zone_deviation_limit, 15.0);
        assert_eq!(config.correlation.section_deviation_limit, 12.5);
        assert_eq!(config.allocator.liveness_ttl_secs, 10);
        assert_eq!(config.allocator.sweep_interval_secs, 5);
        assert_eq!(config.allocator.trust, TrustPolicy::Trusting);
        assert_eq!(config.transport.max_in_flight, 5);
        assert_eq!(config.transport.raw_topic, "raw-sensor-data");
        assert_eq!(config.transport.outbound_topic, "sensor-data");
        assert_eq!(config.outbound.mode, OutboundMode::Log);
        assert_eq!(config.outbound.max_retries, 5);
        assert_eq!(config.api.port, 8080);
        assert!(!config.api.public);
    }

    #[test]
    fn partial_sections_keep_other_defaults() {
        let config = Config::from_toml(
            r#"
            [correlation]
            window_capacity = 10

            [outbound]
            mode = "http"
            url = "http://127.0.0.1:9000/ingest"

            [[zones]]
            id = 1
            temperature = { min = 0.0, max = 10.0 }
            sections = { min = 1, max = 2 }

            [[zones]]
            id = 2
            temperature = { min = 10.0, max = 20.0 }
            sections = { min = 3, max = 8 }
            "#,
        )
        .unwrap();
        assert_eq!(config.correlation.window_capacity, 10);
        assert_eq!(config.correlation.zone_deviation_limit, 15.0);
        assert_eq!(config.outbound.mode, OutboundMode::Http);
        assert_eq!(config.outbound.initial_backoff_ms, 100);
        assert_eq!(config.zones.max_section(), 8);
    }

    #[test]
    fn overlapping_zones_fail_to_load() {
        let result = Config::from_toml(
            r#"
            [[zones]]
            id = 1
            temperature = { min = 0.0, max = 10.0 }
            sections = { min = 1, max = 4 }

            [[zones]]
            id = 2
            temperature = { min = 10.0, max = 20.0 }
            sections = { min = 4, max = 8 }
            "#,
        );
        assert!(matches!(result, Err(ConfigError::Parse(_))));
    }

    #[test]
    fn missing_file_is_created_with_defaults() {
        let dir = std::env::temp_dir().join(format!("zonewatch-config-{}", uuid::Uuid::new_v4()));
        let path = dir.join("config.toml");

        let config = Config::load_from(&path).unwrap();
        assert!(path.exists());
        assert_eq!(config.api.port, 8080);

        let reloaded = Config::load_from(&path).unwrap();
        assert_eq!(reloaded.zones, config.zones);
        assert_eq!(reloaded.transport.queue_depth, 10_000);

        let _ = fs::remove_dir_all(dir);
    }
}
