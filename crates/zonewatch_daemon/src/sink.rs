//! Anomaly sink: write-only persistence for rejected events.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tracing::{debug, error, warn};
use zonewatch_core::AnomalyRecord;

use crate::error::SinkError;
use crate::stats::ServiceStats;

/// Attempts per record before it is given up on.
const SINK_ATTEMPTS: u32 = 3;
const SINK_RETRY_DELAY: Duration = Duration::from_millis(200);

#[async_trait]
pub trait AnomalySink: Send + Sync {
    async fn insert(&self, record: &AnomalyRecord) -> Result<(), SinkError>;
    fn name(&self) -> &str;
}

/// Appends one JSON object per line.
pub struct JsonlSink {
    path: PathBuf,
    file: tokio::sync::Mutex<tokio::fs::File>,
}

impl JsonlSink {
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, SinkError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        let file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;
        Ok(Self {
            path,
            file: tokio::sync::Mutex::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl AnomalySink for JsonlSink {
    async fn insert(&self, record: &AnomalyRecord) -> Result<(), SinkError> {
        let mut line = serde_json::to_vec(record)?;
        line.push(b'\n');
        let mut file = self.file.lock().await;
        file.write_all(&line).await?;
        file.flush().await?;
        Ok(())
    }

    fn name(&self) -> &str {
        "jsonl"
    }
}

/// Keeps records in memory.
#[derive(Default)]
pub struct MemorySink {
    records: Mutex<Vec<AnomalyRecord>>,
}

impl MemorySink {
    pub fn records(&self) -> Vec<AnomalyRecord> {
        self.records
            .lock()
            .unwrap_or_else(|poisoned| {
                warn!("Memory sink mutex was poisoned, recovering");
                poisoned.into_inner()
            })
            .clone()
    }
}

#[async_trait]
impl AnomalySink for MemorySink {
    async fn insert(&self, record: &AnomalyRecord) -> Result<(), SinkError> {
        self.records
            .lock()
            .unwrap_or_else(|poisoned| {
                warn!("Memory sink mutex was poisoned, recovering");
                poisoned.into_inner()
            })
            .push(record.clone());
        Ok(())
    }

    fn name(&self) -> &str {
        "memory"
    }
}

/// Writes records in arrival order until the channel closes.
pub async fn run_sink_worker(
    sink: Arc<dyn AnomalySink>,
    mut records: mpsc::UnboundedReceiver<AnomalyRecord>,
    stats: Arc<ServiceStats>,
) {
    while let Some(record) = records.recv().await {
        write_with_retry(sink.as_ref(), &record, &stats).await;
    }
    debug!(sink = sink.name(), "Anomaly sink worker stopped");
}

async fn write_with_retry(sink: &dyn AnomalySink, record: &AnomalyRecord, stats: &ServiceStats) {
    for attempt in 1..=SINK_ATTEMPTS {
        match sink.insert(record).await {
            Ok(()) => {
                stats.record_anomaly_written();
                return;
            }
            Err(e) => {
                stats.record_sink_failure();
                error!(
                    sink = sink.name(),
                    device_id = %record.device_id,
                    attempt = attempt,
                    error = %e,
                    "Failed to write anomaly record"
                );
                if attempt < SINK_ATTEMPTS {
                    tokio::time::sleep(SINK_RETRY_DELAY * attempt).await;
                }
            }
        }
    }
}
