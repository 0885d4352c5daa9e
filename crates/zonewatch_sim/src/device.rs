//! Simulated device.
//!
//! Reports readings inside its zone's band until, after a short healthy
//! period, it may fall into one of the fault modes. Once faulty it stays
//! faulty and flags its readings as invalid.

use rand::seq::SliceRandom;
use rand::Rng;
use tracing::info;
use zonewatch_core::{Assignment, FaultType, TelemetryEvent, TemperatureRange, TemperatureSample};

#[derive(Debug, Clone, Copy)]
pub struct DeviceProfile {
    /// Healthy readings produced before a fault can start.
    pub healthy_readings: u64,
    /// Chance, in percent, of turning faulty on each later reading.
    pub fault_percent: f64,
    pub upper_shift: f64,
    pub lower_shift: f64,
    /// Offset of the humidity band from the temperature band.
    pub humidity_offset: f64,
}

impl Default for DeviceProfile {
    fn default() -> Self {
        Self {
            healthy_readings: 10,
            fault_percent: 5.0,
            upper_shift: 1.4,
            lower_shift: 0.6,
            humidity_offset: 5.0,
        }
    }
}

pub struct SimDevice<R> {
    assignment: Assignment,
    profile: DeviceProfile,
    rng: R,
    produced: u64,
    fault: FaultType,
    every_other_dead: bool,
}

impl<R: Rng> SimDevice<R> {
    pub fn new(assignment: Assignment, profile: DeviceProfile, rng: R) -> Self {
        Self {
            assignment,
            profile,
            rng,
            produced: 0,
            fault: FaultType::Real,
            every_other_dead: false,
        }
    }

    pub fn id(&self) -> &str {
        &self.assignment.device_id
    }

    pub fn assignment(&self) -> &Assignment {
        &self.assignment
    }

    pub fn fault(&self) -> FaultType {
        self.fault
    }

    pub fn produced(&self) -> u64 {
        self.produced
    }

    /// Puts the device into `fault` immediately.
    pub fn force_fault(&mut self, fault: FaultType) {
        self.fault = fault;
    }

    pub fn next_reading(&mut self) -> TelemetryEvent {
        self.maybe_start_fault();

        let sample = match self.fault {
            FaultType::Real => self.standard(),
            FaultType::Dead => TemperatureSample::new(0.0, 0.0),
            FaultType::TooLow => self.shifted(self.profile.lower_shift),
            FaultType::TooHigh => self.shifted(self.profile.upper_shift),
            FaultType::Flux => {
                let shift = if self.rng.gen_bool(0.5) {
                    self.profile.lower_shift
                } else {
                    self.profile.upper_shift
                };
                self.shifted(shift)
            }
            FaultType::EveryOther => {
                self.every_other_dead = !self.every_other_dead;
                if self.every_other_dead {
                    TemperatureSample::new(0.0, 0.0)
                } else {
                    self.standard()
                }
            }
        };
        self.produced += 1;

        TelemetryEvent::new(
            self.assignment.device_id.clone(),
            self.assignment.zone.id,
            self.assignment.zone.section,
            sample,
        )
        .with_fault(self.fault)
    }

    fn maybe_start_fault(&mut self) {
        if self.fault != FaultType::Real || self.produced <= self.profile.healthy_readings {
            return;
        }
        if self.rng.gen_range(1.0..100.0) > self.profile.fault_percent {
            return;
        }
        if let Some(fault) = FaultType::FAULTS.choose(&mut self.rng) {
            self.fault = *fault;
            info!(
                device_id = %self.assignment.device_id,
                fault_type = %fault,
                produced = self.produced,
                "Device entered fault state"
            );
        }
    }

    fn band(&self) -> TemperatureRange {
        self.assignment.zone.temperature
    }

    fn standard(&mut self) -> TemperatureSample {
        self.shifted(1.0)
    }

    fn shifted(&mut self, shift: f64) -> TemperatureSample {
        let band = self.band();
        let offset = self.profile.humidity_offset;
        let temperature = uniform(&mut self.rng, band.min * shift, band.max * shift);
        let humidity = uniform(
            &mut self.rng,
            (band.min + offset) * shift,
            (band.max + offset) * shift,
        );
        TemperatureSample::new(round2(temperature), round2(humidity))
    }
}

fn uniform<R: Rng>(rng: &mut R, low: f64, high: f64) -> f64 {
    if high > low {
        rng.gen_range(low..high)
    } else {
        low
    }
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}
