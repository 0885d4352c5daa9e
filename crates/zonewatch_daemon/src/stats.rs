use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

/// Service counters, shared by the ingress, consumer and workers.
#[derive(Debug, Default)]
pub struct ServiceStats {
    received: AtomicU64,
    malformed: AtomicU64,
    accepted: AtomicU64,
    validated: AtomicU64,
    rejected: AtomicU64,
    missed_invalid: AtomicU64,
    anomalies_written: AtomicU64,
    sink_failures: AtomicU64,
    forwarded: AtomicU64,
    forward_retries: AtomicU64,
    dead_lettered: AtomicU64,
    redelivered: AtomicU64,
}

/// Point-in-time copy of [`ServiceStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatsSnapshot {
    pub received: u64,
    pub malformed: u64,
    pub accepted: u64,
    pub validated: u64,
    pub rejected: u64,
    pub missed_invalid: u64,
    pub anomalies_written: u64,
    pub sink_failures: u64,
    pub forwarded: u64,
    pub forward_retries: u64,
    pub dead_lettered: u64,
    pub redelivered: u64,
}

macro_rules! counters {
    ($($name:ident => $field:ident),* $(,)?) => {
        impl ServiceStats {
            $(
                pub fn $name(&self) {
                    self.$field.fetch_add(1, Ordering::Relaxed);
                }
            )*

            pub fn snapshot(&self) -> StatsSnapshot {
                StatsSnapshot {
                    $($field: self.$field.load(Ordering::Relaxed),)*
                }
            }
        }
    };
}

counters! {
    record_received => received,
    record_malformed => malformed,
    record_accepted => accepted,
    record_validated => validated,
    record_rejected => rejected,
    record_missed_invalid => missed_invalid,
    record_anomaly_written => anomalies_written,
    record_sink_failure => sink_failures,
    record_forwarded => forwarded,
    record_forward_retry => forward_retries,
    record_dead_lettered => dead_lettered,
    record_redelivered => redelivered,
}
