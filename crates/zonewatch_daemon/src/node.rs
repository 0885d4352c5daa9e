//! Service assembly: builds the engines and workers from a [`Config`] and runs
//! them until shutdown.

use anyhow::Context;
use std::future::Future;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch};
use tracing::{error, info};
use zonewatch_core::{CorrelationEngine, SectionAllocator};

use crate::api::{run_api_server, ApiState};
use crate::config::{Config, OutboundMode};
use crate::consumer::{run_consumer, Consumer};
use crate::outbound::{
    run_forwarder, Forwarder, HttpPublisher, LogPublisher, Publisher, QueuePublisher, RetryPolicy,
};
use crate::sink::{run_sink_worker, AnomalySink, JsonlSink};
use crate::stats::ServiceStats;
use crate::sweeper::run_sweeper;
use crate::transport::MessageQueue;

pub struct Node {
    config: Config,
    allocator: Arc<SectionAllocator>,
    engine: Arc<CorrelationEngine>,
    queue: Arc<MessageQueue>,
    stats: Arc<ServiceStats>,
    sink: Arc<dyn AnomalySink>,
    publisher: Arc<dyn Publisher>,
}

impl Node {
    /// Builds a node writing anomalies to the configured JSON-lines file.
    pub async fn from_config(config: Config) -> anyhow::Result<Self> {
        let sink_path = config.sink.path();
        let sink = JsonlSink::open(&sink_path)
            .await
            .with_context(|| format!("opening anomaly sink {}", sink_path.display()))?;
        info!(path = %sink_path.display(), "Anomaly sink ready");
        Self::with_sink(config, Arc::new(sink))
    }

    pub fn with_sink(config: Config, sink: Arc<dyn AnomalySink>) -> anyhow::Result<Self> {
        let queue = Arc::new(MessageQueue::new(
            config.transport.queue_depth,
            config.transport.max_in_flight,
        ));
        let publisher = build_publisher(&config, &queue)?;
        Self::with_io(config, queue, sink, publisher)
    }

    pub fn with_io(
        config: Config,
        queue: Arc<MessageQueue>,
        sink: Arc<dyn AnomalySink>,
        publisher: Arc<dyn Publisher>,
    ) -> anyhow::Result<Self> {
        let zones = Arc::new(config.zones.clone());
        let engine = CorrelationEngine::new(Arc::clone(&zones), config.correlation.clone())
            .context("building correlation engine")?;
        let allocator = SectionAllocator::new(zones, config.allocator.clone());

        Ok(Self {
            allocator: Arc::new(allocator),
            engine: Arc::new(engine),
            queue,
            stats: Arc::new(ServiceStats::default()),
            sink,
            publisher,
            config,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn allocator(&self) -> &Arc<SectionAllocator> {
        &self.allocator
    }

    pub fn engine(&self) -> &Arc<CorrelationEngine> {
        &self.engine
    }

    pub fn queue(&self) -> &Arc<MessageQueue> {
        &self.queue
    }

    pub fn stats(&self) -> &Arc<ServiceStats> {
        &self.stats
    }

    pub fn api_state(&self) -> ApiState {
        ApiState {
            allocator: Arc::clone(&self.allocator),
            engine: Arc::clone(&self.engine),
            queue: Arc::clone(&self.queue),
            raw_topic: self.config.transport.raw_topic.clone(),
            outbound_topic: self.config.transport.outbound_topic.clone(),
            stats: Arc::clone(&self.stats),
        }
    }

    /// Runs the API, consumer, sweeper, sink and forwarder until `shutdown`
    /// resolves, then drains the sink and forwarder queues.
    pub async fn run<F>(self, listener: TcpListener, shutdown: F) -> anyhow::Result<()>
    where
        F: Future<Output = ()>,
    {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (anomaly_tx, anomaly_rx) = mpsc::unbounded_channel();
        let (accepted_tx, accepted_rx) = mpsc::unbounded_channel();

        let sink_task = tokio::spawn(run_sink_worker(
            Arc::clone(&self.sink),
            anomaly_rx,
            Arc::clone(&self.stats),
        ));
        let forwarder = Forwarder::new(
            Arc::clone(&self.publisher),
            RetryPolicy::from(&self.config.outbound),
            self.config.outbound.dead_letter_path(),
            Arc::clone(&self.stats),
        );
        let forward_task = tokio::spawn(run_forwarder(forwarder, accepted_rx));

        let consumer = Arc::new(Consumer::new(
            Arc::clone(&self.engine),
            Arc::clone(&self.stats),
            anomaly_tx,
            accepted_tx,
        ));
        let raw_topic = self.queue.topic(&self.config.transport.raw_topic);
        let consumer_task = tokio::spawn(run_consumer(
            consumer,
            Arc::clone(&raw_topic),
            shutdown_rx.clone(),
        ));
        let sweeper_task = tokio::spawn(run_sweeper(
            Arc::clone(&self.allocator),
            self.config.allocator.sweep_interval(),
            shutdown_rx.clone(),
        ));

        let mut api_shutdown = shutdown_rx.clone();
        let api_task = tokio::spawn(run_api_server(listener, self.api_state(), async move {
            let _ = api_shutdown.changed().await;
        }));

        info!(
            raw_topic = raw_topic.name(),
            outbound = self.publisher.name(),
            sink = self.sink.name(),
            window_capacity = self.config.correlation.window_capacity,
            max_in_flight = self.config.transport.max_in_flight,
            "Node running"
        );

        shutdown.await;
        info!("Shutdown requested");
        raw_topic.close();
        let _ = shutdown_tx.send(true);

        let api_result = api_task.await;
        let _ = consumer_task.await;
        let _ = sweeper_task.await;
        // the consumer held the only senders; the workers exit once drained
        let _ = sink_task.await;
        let _ = forward_task.await;

        match api_result {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                error!(error = %e, "API server failed");
                return Err(e.into());
            }
            Err(e) => return Err(anyhow::anyhow!("API task panicked: {e}")),
        }
        info!(stats = ?self.stats.snapshot(), "Node stopped");
        Ok(())
    }
}

fn build_publisher(
    config: &Config,
    queue: &Arc<MessageQueue>,
) -> anyhow::Result<Arc<dyn Publisher>> {
    let publisher: Arc<dyn Publisher> = match config.outbound.mode {
        OutboundMode::Queue => Arc::new(QueuePublisher::new(
            Arc::clone(queue),
            config.transport.outbound_topic.clone(),
        )),
        OutboundMode::Http => {
            let url = config
                .outbound
                .url
                .clone()
                .context("outbound.url is required when outbound.mode = \"http\"")?;
            Arc::new(HttpPublisher::new(url))
        }
        OutboundMode::Log => Arc::new(LogPublisher),
    };
    Ok(publisher)
}
