//! Outbound forwarding of accepted events.
//!
//! Each event is retried with capped exponential backoff; once the retries
//! are exhausted it is appended to a dead-letter file instead of being lost.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use zonewatch_core::TelemetryEvent;

use crate::config::OutboundConfig;
use crate::error::PublishError;
use crate::stats::ServiceStats;
use crate::transport::MessageQueue;

#[async_trait]
pub trait Publisher: Send + Sync {
    async fn publish(&self, event: &TelemetryEvent) -> Result<(), PublishError>;
    fn name(&self) -> &str;
}

/// Publishes onto a topic of the in-process channel.
pub struct QueuePublisher {
    queue: Arc<MessageQueue>,
    topic: String,
}

impl QueuePublisher {
    pub fn new(queue: Arc<MessageQueue>, topic: impl Into<String>) -> Self {
        Self {
            queue,
            topic: topic.into(),
        }
    }
}

#[async_trait]
impl Publisher for QueuePublisher {
    async fn publish(&self, event: &TelemetryEvent) -> Result<(), PublishError> {
        self.queue.publish(&self.topic, event.to_vec())?;
        Ok(())
    }

    fn name(&self) -> &str {
        "queue"
    }
}

/// POSTs each event as JSON.
pub struct HttpPublisher {
    client: reqwest::Client,
    url: String,
}

impl HttpPublisher {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            url: url.into(),
        }
    }
}

#[async_trait]
impl Publisher for HttpPublisher {
    async fn publish(&self, event: &TelemetryEvent) -> Result<(), PublishError> {
        self.client
            .post(&self.url)
            .json(event)
            .timeout(Duration::from_secs(5))
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }

    fn name(&self) -> &str {
        "http"
    }
}

pub struct LogPublisher;

#[async_trait]
impl Publisher for LogPublisher {
    async fn publish(&self, event: &TelemetryEvent) -> Result<(), PublishError> {
        info!(
            device_id = %event.device_id,
            zone = event.zone,
            section = event.section,
            temperature = event.sample.temperature,
            humidity = event.sample.humidity,
            "Accepted reading"
        );
        Ok(())
    }

    fn name(&self) -> &str {
        "log"
    }
}

/// Capped exponential backoff.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl RetryPolicy {
    /// Delay before retry number `retry` (0-based), without jitter.
    pub fn delay(&self, retry: u32) -> Duration {
        let factor = 1u32.checked_shl(retry).unwrap_or(u32::MAX);
        self.initial_backoff
            .checked_mul(factor)
            .unwrap_or(self.max_backoff)
            .min(self.max_backoff)
    }

    /// `delay(retry)` scaled by a random factor in `[0.5, 1.0]`.
    pub fn jittered(&self, retry: u32) -> Duration {
        let scale = rand::thread_rng().gen_range(0.5..=1.0);
        self.delay(retry).mul_f64(scale)
    }
}

impl From<&OutboundConfig> for RetryPolicy {
    fn from(config: &OutboundConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            initial_backoff: Duration::from_millis(config.initial_backoff_ms),
            max_backoff: Duration::from_millis(config.max_backoff_ms),
        }
    }
}

/// Line written to the dead-letter file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadLetter {
    pub event: TelemetryEvent,
    pub error: String,
    pub attempts: u32,
    pub failed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForwardOutcome {
    Delivered { attempts: u32 },
    DeadLettered,
}

pub struct Forwarder {
    publisher: Arc<dyn Publisher>,
    policy: RetryPolicy,
    dead_letter_path: PathBuf,
    stats: Arc<ServiceStats>,
}

impl Forwarder {
    pub fn new(
        publisher: Arc<dyn Publisher>,
        policy: RetryPolicy,
        dead_letter_path: PathBuf,
        stats: Arc<ServiceStats>,
    ) -> Self {
        Self {
            publisher,
            policy,
            dead_letter_path,
            stats,
        }
    }

    pub async fn forward(&self, event: &TelemetryEvent) -> ForwardOutcome {
        let mut retry = 0;
        loop {
            match self.publisher.publish(event).await {
                Ok(()) => {
                    self.stats.record_forwarded();
                    return ForwardOutcome::Delivered {
                        attempts: retry + 1,
                    };
                }
                Err(e) if retry >= self.policy.max_retries => {
                    self.dead_letter(event, &e, retry + 1).await;
                    return ForwardOutcome::DeadLettered;
                }
                Err(e) => {
                    let delay = self.policy.jittered(retry);
                    self.stats.record_forward_retry();
                    warn!(
                        publisher = self.publisher.name(),
                        device_id = %event.device_id,
                        retry = retry + 1,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Forward failed, backing off"
                    );
                    tokio::time::sleep(delay).await;
                    retry += 1;
                }
            }
        }
    }

    async fn dead_letter(&self, event: &TelemetryEvent, cause: &PublishError, attempts: u32) {
        self.stats.record_dead_lettered();
        error!(
            publisher = self.publisher.name(),
            device_id = %event.device_id,
            attempts = attempts,
            error = %cause,
            path = %self.dead_letter_path.display(),
            "Forward exhausted retries, dead-lettering"
        );

        let letter = DeadLetter {
            event: event.clone(),
            error: cause.to_string(),
            attempts,
            failed_at: Utc::now(),
        };
        if let Err(e) = append_json_line(&self.dead_letter_path, &letter).await {
            error!(error = %e, "Could not write dead letter, event lost");
        }
    }
}

async fn append_json_line<T: Serialize>(path: &Path, value: &T) -> std::io::Result<()> {
    let mut line = serde_json::to_vec(value).map_err(std::io::Error::other)?;
    line.push(b'\n');
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            tokio::fs::create_dir_all(parent).await?;
        }
    }
    let mut file = tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await?;
    file.write_all(&line).await?;
    file.flush().await
}

/// Forwards events in arrival order until the channel closes.
pub async fn run_forwarder(
    forwarder: Forwarder,
    mut events: mpsc::UnboundedReceiver<TelemetryEvent>,
) {
    while let Some(event) = events.recv().await {
        forwarder.forward(&event).await;
    }
    debug!(publisher = forwarder.publisher.name(), "Forwarder stopped");
}
