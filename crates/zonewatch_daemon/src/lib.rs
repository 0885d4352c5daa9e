//! zonewatch daemon
//!
//! Wires the core engines into a running service: HTTP ingress, the
//! in-process message channel, the per-zone correlation consumer, the anomaly
//! sink and the outbound forwarder.

pub mod api;
pub mod config;
pub mod consumer;
pub mod error;
pub mod node;
pub mod outbound;
pub mod sink;
pub mod stats;
pub mod sweeper;
pub mod transport;

pub use config::Config;
pub use error::{ConfigError, PublishError, SinkError, TransportError};
pub use node::Node;
