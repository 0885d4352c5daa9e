//! Live fleet: simulated devices talking to a running `zonewatchd` over HTTP.

use rand::rngs::StdRng;
use rand::SeedableRng;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{self, MissedTickBehavior};
use tracing::{info, warn};
use zonewatch_core::Assignment;

use crate::device::{DeviceProfile, SimDevice};

#[derive(Debug, Clone)]
pub struct FleetConfig {
    /// Base URL of the service, e.g. `http://127.0.0.1:8080`.
    pub url: String,
    pub devices: usize,
    pub interval: Duration,
    pub register_attempts: u32,
    pub profile: DeviceProfile,
}

impl Default for FleetConfig {
    fn default() -> Self {
        Self {
            url: "http://127.0.0.1:8080".to_string(),
            devices: 10,
            interval: Duration::from_millis(2500),
            register_attempts: 5,
            profile: DeviceProfile::default(),
        }
    }
}

#[derive(Debug, Default)]
pub struct FleetCounters {
    pub registered: AtomicU64,
    pub sent: AtomicU64,
    pub failed: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FleetSummary {
    pub registered: u64,
    pub sent: u64,
    pub failed: u64,
}

impl FleetCounters {
    pub fn summary(&self) -> FleetSummary {
        FleetSummary {
            registered: self.registered.load(Ordering::Relaxed),
            sent: self.sent.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
        }
    }
}

async fn fetch_assignment(
    client: &reqwest::Client,
    endpoint: &str,
) -> Result<Assignment, reqwest::Error> {
    client
        .get(endpoint)
        .send()
        .await?
        .error_for_status()?
        .json()
        .await
}

async fn register(
    client: &reqwest::Client,
    url: &str,
    attempts: u32,
    shutdown: &mut watch::Receiver<bool>,
) -> Option<Assignment> {
    let endpoint = format!("{url}/register");
    for attempt in 1..=attempts.max(1) {
        match fetch_assignment(client, &endpoint).await {
            Ok(assignment) => return Some(assignment),
            Err(e) => warn!(attempt, error = %e, "Registration failed"),
        }
        let backoff = Duration::from_millis(250 * u64::from(attempt));
        tokio::select! {
            _ = shutdown.changed() => return None,
            _ = time::sleep(backoff) => {}
        }
    }
    None
}

async fn run_device(
    client: reqwest::Client,
    config: Arc<FleetConfig>,
    counters: Arc<FleetCounters>,
    mut shutdown: watch::Receiver<bool>,
) {
    let Some(assignment) =
        register(&client, &config.url, config.register_attempts, &mut shutdown).await
    else {
        return;
    };
    counters.registered.fetch_add(1, Ordering::Relaxed);
    info!(
        device_id = %assignment.device_id,
        zone = assignment.zone.id,
        section = assignment.zone.section,
        "Device registered"
    );

    let endpoint = format!("{}/data", config.url);
    let mut device = SimDevice::new(assignment, config.profile, StdRng::from_entropy());
    let mut interval = time::interval(config.interval.max(Duration::from_millis(1)));
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = interval.tick() => {
                let event = device.next_reading();
                let result = client
                    .post(&endpoint)
                    .json(&event)
                    .send()
                    .await
                    .and_then(|response| response.error_for_status());
                match result {
                    Ok(_) => {
                        counters.sent.fetch_add(1, Ordering::Relaxed);
                    }
                    Err(e) => {
                        counters.failed.fetch_add(1, Ordering::Relaxed);
                        warn!(device_id = device.id(), error = %e, "Failed to send reading");
                    }
                }
            }
        }
    }
}

/// Runs `config.devices` devices until `shutdown` flips to true.
pub async fn run_fleet(
    config: FleetConfig,
    shutdown: watch::Receiver<bool>,
) -> anyhow::Result<FleetSummary> {
    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(5))
        .build()?;
    let config = Arc::new(config);
    let counters = Arc::new(FleetCounters::default());

    info!(
        url = %config.url,
        devices = config.devices,
        interval_ms = config.interval.as_millis() as u64,
        "Starting fleet"
    );
    let tasks: Vec<_> = (0..config.devices)
        .map(|_| {
            tokio::spawn(run_device(
                client.clone(),
                Arc::clone(&config),
                Arc::clone(&counters),
                shutdown.clone(),
            ))
        })
        .collect();
    for task in tasks {
        if let Err(e) = task.await {
            warn!(error = %e, "Device task failed");
        }
    }

    let summary = counters.summary();
    info!(
        registered = summary.registered,
        sent = summary.sent,
        failed = summary.failed,
        "Fleet stopped"
    );
    Ok(summary)
}
