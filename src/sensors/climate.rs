use chrono::Local;
use std::sync::Arc;

use super::{OutputPins, SensorDevice};
use crate::actuator::ActuatorState;
use crate::config::{ClimateConfig, DhtModel};
use crate::domain::{round1, Measurement, Reading};
use crate::error::{InitError, ReadError};
use crate::hal::HardwareProvider;

/// dht temperature/humidity sensor plus the alarm buzzer
pub struct ClimateSensor {
    hal: Arc<dyn HardwareProvider>,
    dht_pin: u8,
    model: DhtModel,
    outputs: OutputPins,
}

impl ClimateSensor {
    pub fn new(hal: Arc<dyn HardwareProvider>, config: &ClimateConfig) -> Self {
        Self {
            outputs: OutputPins::new(Arc::clone(&hal), Some(config.buzzer_pin), None, None),
            hal,
            dht_pin: config.dht_pin,
            model: config.dht_model,
        }
    }
}

/// shared by the distance activity's optional dht
pub(crate) fn read_climate(
    hal: &dyn HardwareProvider,
    pin: u8,
    model: DhtModel,
) -> Result<Option<Measurement>, ReadError> {
    match hal.read_dht(pin, model) {
        Ok(Some((t, h))) => Ok(Some(Measurement::Climate {
            temperature: round1(f64::from(t)),
            humidity: round1(f64::from(h)),
        })),
        Ok(None) => Ok(None),
        Err(e) => Err(ReadError::DeviceBusy(e.to_string())),
    }
}

impl SensorDevice for ClimateSensor {
    fn name(&self) -> &'static str {
        "climate"
    }

    fn open(&mut self) -> Result<(), InitError> {
        self.outputs.claim()
    }

    fn read(&mut self) -> Result<Option<Reading>, ReadError> {
        let measurement = read_climate(self.hal.as_ref(), self.dht_pin, self.model)?;
        Ok(measurement.map(|m| Reading::new(vec![m], Local::now())))
    }

    fn apply(&mut self, outputs: &ActuatorState) -> Result<(), ReadError> {
        self.outputs.apply(outputs)
    }

    fn close(&mut self) {
        self.outputs.release();
    }
}
