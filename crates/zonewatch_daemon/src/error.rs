//! Daemon error types.

use thiserror::Error;

/// Failures of the in-process message channel.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("topic '{0}' is closed")]
    Closed(String),
    #[error("topic '{topic}' is full ({depth} pending)")]
    Full { topic: String, depth: usize },
}

/// Failures writing an anomaly record.
#[derive(Debug, Error)]
pub enum SinkError {
    #[error("sink I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("sink serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Failures forwarding an accepted event downstream.
#[derive(Debug, Error)]
pub enum PublishError {
    #[error("HTTP error: {0}")]
    Http(String),
    #[error("downstream answered {0}")]
    Status(u16),
    #[error(transparent)]
    Transport(#[from] TransportError),
}

impl From<reqwest::Error> for PublishError {
    fn from(e: reqwest::Error) -> Self {
        match e.status() {
            Some(status) => PublishError::Status(status.as_u16()),
            None => PublishError::Http(e.to_string()),
        }
    }
}

/// Failures loading or writing the configuration file.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("could not encode config: {0}")]
    Encode(#[from] toml::ser::Error),
}
