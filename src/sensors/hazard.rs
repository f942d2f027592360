use chrono::Local;
use std::sync::Arc;

use super::{OutputPins, SensorDevice};
use crate::actuator::ActuatorState;
use crate::config::HazardConfig;
use crate::domain::{Measurement, Reading};
use crate::error::{InitError, ReadError};
use crate::hal::HardwareProvider;

/// pcf8591 control byte: analog input mode, channel in the low bits
const PCF8591_AIN: u8 = 0x40;

/// gas level through a pcf8591 adc, a vibration switch, two leds and a buzzer.
/// both reads are plain bus/gpio reads and cannot time out.
pub struct HazardSensor {
    hal: Arc<dyn HardwareProvider>,
    i2c_address: u8,
    control: u8,
    vibration_pin: u8,
    vibration_claimed: bool,
    outputs: OutputPins,
}

impl HazardSensor {
    pub fn new(hal: Arc<dyn HardwareProvider>, i2c_address: u8, config: &HazardConfig) -> Self {
        Self {
            outputs: OutputPins::new(
                Arc::clone(&hal),
                Some(config.buzzer_pin),
                Some(config.red_led_pin),
                Some(config.green_led_pin),
            ),
            hal,
            i2c_address,
            control: PCF8591_AIN | (config.adc_channel & 0x03),
            vibration_pin: config.vibration_pin,
            vibration_claimed: false,
        }
    }
}

impl SensorDevice for HazardSensor {
    fn name(&self) -> &'static str {
        "hazard"
    }

    fn open(&mut self) -> Result<(), InitError> {
        self.hal
            .claim_input(self.vibration_pin)
            .map_err(|e| InitError::Hardware(format!("vibration pin {}: {}", self.vibration_pin, e)))?;
        self.vibration_claimed = true;
        self.outputs.claim()
    }

    fn read(&mut self) -> Result<Option<Reading>, ReadError> {
        let level = self
            .hal
            .i2c_transfer(self.i2c_address, &[self.control], 1)
            .map_err(|e| ReadError::DeviceBusy(format!("adc: {}", e)))?
            .first()
            .copied()
            .ok_or_else(|| ReadError::DeviceBusy("adc returned no data".to_string()))?;
        let detected = self
            .hal
            .read_gpio(self.vibration_pin)
            .map_err(|e| ReadError::DeviceBusy(format!("vibration: {}", e)))?;

        Ok(Some(Reading::new(
            vec![Measurement::Gas { level }, Measurement::Vibration { detected }],
            Local::now(),
        )))
    }

    fn apply(&mut self, outputs: &ActuatorState) -> Result<(), ReadError> {
        self.outputs.apply(outputs)
    }

    fn close(&mut self) {
        self.outputs.release();
        if std::mem::take(&mut self.vibration_claimed) {
            self.hal.release_pin(self.vibration_pin);
        }
    }
}
