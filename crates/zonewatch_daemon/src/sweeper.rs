use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{self, MissedTickBehavior};
use tracing::{debug, info};
use zonewatch_core::SectionAllocator;

/// Runs the allocator's liveness sweep every `period` until shutdown.
pub async fn run_sweeper(
    allocator: Arc<SectionAllocator>,
    period: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut interval = time::interval(period.max(Duration::from_millis(1)));
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // the first tick completes immediately
    interval.tick().await;
    info!(period_secs = period.as_secs(), "Liveness sweeper started");

    loop {
        tokio::select! {
            _ = interval.tick() => {
                let report = allocator.sweep();
                debug!(evicted = report.evicted, live = report.live, "Liveness sweep");
            }
            _ = shutdown.changed() => break,
        }
    }
    info!("Liveness sweeper stopped");
}
