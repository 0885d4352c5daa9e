//! Simulated devices for zonewatch.
//!
//! [`fleet`] drives devices against a running service over HTTP, while
//! [`experiment`] feeds the core engines directly to measure how well the
//! correlation checks catch faulty devices.

pub mod device;
pub mod experiment;
pub mod fleet;

pub use device::{DeviceProfile, SimDevice};
pub use experiment::{run_experiment, ExperimentConfig, ExperimentReport, FaultTally};
pub use fleet::{run_fleet, FleetConfig, FleetSummary};
