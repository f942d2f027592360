//! ==============================================================================
//! sensors/mod.rs - sample readers for every activity
//! ==============================================================================
//!
//! purpose:
//!     one `SensorDevice` per activity. a device knows how to claim its pins,
//!     produce one normalized reading per poll, drive its outputs and give
//!     everything back. retry/probe policy lives in session.rs, not here.
//!
//! relationships:
//!     - uses: hal.rs (HardwareProvider)
//!     - used by: session.rs (HardwareSession wraps a Box<dyn SensorDevice>)
//!     - built by: DeviceFactory (HalDeviceFactory in production, fakes in tests)
//!
//! ==============================================================================

pub mod climate;
pub mod hazard;
pub mod location;
pub mod nmea;
pub mod ultrasonic;

use std::sync::Arc;
use tracing::warn;

use crate::actuator::ActuatorState;
use crate::config::{parse_bus_address, EngineConfig};
use crate::domain::{ActivityKind, Reading};
use crate::error::{InitError, ReadError};
use crate::hal::HardwareProvider;

pub use climate::ClimateSensor;
pub use hazard::HazardSensor;
pub use location::LocationSensor;
pub use ultrasonic::DistanceSensor;

pub trait SensorDevice: Send {
    fn name(&self) -> &'static str;

    /// claim pins and buses. outputs start OFF.
    fn open(&mut self) -> Result<(), InitError>;

    /// one poll. Ok(None) means "not ready, poll again later".
    fn read(&mut self) -> Result<Option<Reading>, ReadError>;

    fn apply(&mut self, outputs: &ActuatorState) -> Result<(), ReadError>;

    /// give back everything `open` claimed. must tolerate a partial or
    /// missing `open`.
    fn close(&mut self);
}

/// builds the device for an activity
pub trait DeviceFactory: Send + Sync {
    fn build(&self, kind: ActivityKind) -> Result<Box<dyn SensorDevice>, InitError>;
}

pub struct HalDeviceFactory {
    hal: Arc<dyn HardwareProvider>,
    config: EngineConfig,
}

impl HalDeviceFactory {
    pub fn new(hal: Arc<dyn HardwareProvider>, config: EngineConfig) -> Self {
        Self { hal, config }
    }
}

impl DeviceFactory for HalDeviceFactory {
    fn build(&self, kind: ActivityKind) -> Result<Box<dyn SensorDevice>, InitError> {
        if !self.config.monitor(kind).enabled {
            return Err(InitError::Unavailable(kind));
        }
        let hal = Arc::clone(&self.hal);
        let device: Box<dyn SensorDevice> = match kind {
            ActivityKind::Climate => Box::new(ClimateSensor::new(hal, &self.config.climate)),
            ActivityKind::Distance => Box::new(DistanceSensor::new(hal, &self.config.distance)),
            ActivityKind::Hazard => {
                let addr = parse_bus_address(&self.config.hazard.i2c_address)
                    .map_err(|e| InitError::Hardware(e.to_string()))?;
                Box::new(HazardSensor::new(hal, addr, &self.config.hazard))
            }
            ActivityKind::Location => Box::new(LocationSensor::new(hal, &self.config.location)),
        };
        Ok(device)
    }
}

/// the buzzer / led pins an activity drives
pub(crate) struct OutputPins {
    hal: Arc<dyn HardwareProvider>,
    buzzer: Option<u8>,
    red_led: Option<u8>,
    green_led: Option<u8>,
    claimed: Vec<u8>,
}

impl OutputPins {
    pub(crate) fn new(
        hal: Arc<dyn HardwareProvider>,
        buzzer: Option<u8>,
        red_led: Option<u8>,
        green_led: Option<u8>,
    ) -> Self {
        Self { hal, buzzer, red_led, green_led, claimed: Vec::new() }
    }

    pub(crate) fn claim(&mut self) -> Result<(), InitError> {
        for pin in [self.buzzer, self.red_led, self.green_led].into_iter().flatten() {
            if self.claimed.contains(&pin) {
                continue;
            }
            self.hal
                .claim_output(pin, false)
                .map_err(|e| InitError::Hardware(format!("output pin {}: {}", pin, e)))?;
            self.claimed.push(pin);
        }
        Ok(())
    }

    pub(crate) fn apply(&self, state: &ActuatorState) -> Result<(), ReadError> {
        let wanted = [
            (self.buzzer, state.buzzer),
            (self.red_led, state.red_led),
            (self.green_led, state.green_led),
        ];
        for (pin, level) in wanted {
            if let Some(pin) = pin.filter(|p| self.claimed.contains(p)) {
                self.hal
                    .write_gpio(pin, level)
                    .map_err(|e| ReadError::DeviceBusy(e.to_string()))?;
            }
        }
        Ok(())
    }

    /// drive everything low, then release
    pub(crate) fn release(&mut self) {
        for pin in self.claimed.drain(..) {
            if let Err(e) = self.hal.write_gpio(pin, false) {
                warn!(pin, "could not drive output low before release: {}", e);
            }
            self.hal.release_pin(pin);
        }
    }
}
