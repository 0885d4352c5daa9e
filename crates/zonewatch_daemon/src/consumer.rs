//! Telemetry consumer.
//!
//! A dispatcher pulls deliveries off the raw topic and routes each one to the
//! lane of its zone. Lanes are FIFO tasks, so events of one section are
//! decided in arrival order while different zones proceed in parallel. Side
//! effects (anomaly write, forward) are handed to their workers before the
//! delivery is finished.

use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use zonewatch_core::{AnomalyRecord, CorrelationEngine, TelemetryEvent, Verdict};

use crate::stats::ServiceStats;
use crate::transport::{Delivery, Topic};

pub struct Consumer {
    engine: Arc<CorrelationEngine>,
    stats: Arc<ServiceStats>,
    anomalies: mpsc::UnboundedSender<AnomalyRecord>,
    accepted: mpsc::UnboundedSender<TelemetryEvent>,
}

impl Consumer {
    pub fn new(
        engine: Arc<CorrelationEngine>,
        stats: Arc<ServiceStats>,
        anomalies: mpsc::UnboundedSender<AnomalyRecord>,
        accepted: mpsc::UnboundedSender<TelemetryEvent>,
    ) -> Self {
        Self {
            engine,
            stats,
            anomalies,
            accepted,
        }
    }

    /// Decides one event, queues its side effect, then acknowledges it.
    pub fn handle(&self, event: TelemetryEvent, delivery: Delivery) {
        match self.engine.process(&event) {
            Ok(Verdict::Accepted {
                validated,
                missed_invalid,
            }) => {
                self.stats.record_accepted();
                if validated {
                    self.stats.record_validated();
                }
                if missed_invalid {
                    self.stats.record_missed_invalid();
                    debug!(
                        device_id = %event.device_id,
                        fault_type = ?event.fault_type,
                        "Flagged reading passed validation"
                    );
                }
                if self.accepted.send(event).is_err() {
                    warn!("Forwarder is gone, accepted reading not forwarded");
                }
            }
            Ok(Verdict::Rejected(record)) => {
                self.stats.record_validated();
                self.stats.record_rejected();
                if self.anomalies.send(record).is_err() {
                    warn!("Anomaly sink is gone, record dropped");
                }
            }
            Err(e) => {
                self.stats.record_malformed();
                warn!(
                    device_id = %event.device_id,
                    error = %e,
                    "Dropping event with invalid location"
                );
            }
        }
        delivery.finish();
    }

    /// Parses a delivery and picks its lane; unusable payloads are finished here.
    fn route(&self, delivery: Delivery) -> Option<(usize, TelemetryEvent, Delivery)> {
        if delivery.is_redelivery() {
            self.stats.record_redelivered();
            warn!(
                message_id = %delivery.id(),
                attempts = delivery.attempts(),
                "Processing redelivered message"
            );
        }

        let event = match TelemetryEvent::from_slice(delivery.body()) {
            Ok(event) => event,
            Err(e) => {
                self.stats.record_malformed();
                warn!(message_id = %delivery.id(), error = %e, "Dropping malformed payload");
                delivery.finish();
                return None;
            }
        };

        match self.engine.zones().zone_index(event.zone) {
            Ok(lane) => Some((lane, event, delivery)),
            Err(e) => {
                self.stats.record_malformed();
                warn!(device_id = %event.device_id, error = %e, "Dropping event for unknown zone");
                delivery.finish();
                None
            }
        }
    }
}

fn spawn_lane(
    consumer: Arc<Consumer>,
) -> (mpsc::UnboundedSender<(TelemetryEvent, Delivery)>, JoinHandle<()>) {
    let (tx, mut rx) = mpsc::unbounded_channel::<(TelemetryEvent, Delivery)>();
    let handle = tokio::spawn(async move {
        while let Some((event, delivery)) = rx.recv().await {
            consumer.handle(event, delivery);
        }
    });
    (tx, handle)
}

/// Consumes `topic` until shutdown is signalled or the topic closes.
pub async fn run_consumer(
    consumer: Arc<Consumer>,
    topic: Arc<Topic>,
    mut shutdown: watch::Receiver<bool>,
) {
    let zone_count = consumer.engine.zones().len();
    let (lanes, handles): (Vec<_>, Vec<_>) = (0..zone_count)
        .map(|_| spawn_lane(Arc::clone(&consumer)))
        .unzip();
    info!(topic = topic.name(), lanes = zone_count, "Consumer started");

    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            delivery = topic.next() => {
                let Some(delivery) = delivery else { break };
                if let Some((lane, event, delivery)) = consumer.route(delivery) {
                    let sent = lanes[lane].send((event, delivery));
                    if let Err(mpsc::error::SendError((_, delivery))) = sent {
                        warn!("Lane stopped, requeueing");
                        delivery.requeue();
                    }
                }
            }
        }
    }

    drop(lanes);
    for handle in handles {
        let _ = handle.await;
    }
    info!(topic = topic.name(), "Consumer stopped");
}
