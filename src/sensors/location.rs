use chrono::Local;
use std::sync::Arc;
use std::time::{Duration, Instant};

use super::nmea::{parse_sentence, FixTracker};
use super::{OutputPins, SensorDevice};
use crate::actuator::ActuatorState;
use crate::config::LocationConfig;
use crate::domain::{Measurement, Reading};
use crate::error::{InitError, ReadError};
use crate::hal::HardwareProvider;

/// uart gps receiver with fix leds and a buzzer
pub struct LocationSensor {
    hal: Arc<dyn HardwareProvider>,
    serial_path: String,
    baud_rate: u32,
    read_timeout: Duration,
    tracker: FixTracker,
    serial_open: bool,
    outputs: OutputPins,
}

impl LocationSensor {
    pub fn new(hal: Arc<dyn HardwareProvider>, config: &LocationConfig) -> Self {
        Self {
            outputs: OutputPins::new(
                Arc::clone(&hal),
                Some(config.buzzer_pin),
                Some(config.red_led_pin),
                Some(config.green_led_pin),
            ),
            hal,
            serial_path: config.serial_path.clone(),
            baud_rate: config.baud_rate,
            read_timeout: Duration::from_millis(config.read_timeout_ms),
            tracker: FixTracker::default(),
            serial_open: false,
        }
    }
}

impl SensorDevice for LocationSensor {
    fn name(&self) -> &'static str {
        "location"
    }

    fn open(&mut self) -> Result<(), InitError> {
        self.hal
            .open_serial(&self.serial_path, self.baud_rate)
            .map_err(|e| InitError::Hardware(format!("{}: {}", self.serial_path, e)))?;
        self.serial_open = true;
        self.tracker = FixTracker::default();
        self.outputs.claim()
    }

    /// reads sentences until a GGA completes a fix or the read budget runs out.
    /// silence for the whole budget is a timeout; chatter without GGA is "not ready".
    fn read(&mut self) -> Result<Option<Reading>, ReadError> {
        let deadline = Instant::now() + self.read_timeout;
        let mut heard_anything = false;

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            let line = self
                .hal
                .read_serial_line(remaining)
                .map_err(|e| ReadError::DeviceBusy(e.to_string()))?;
            let Some(line) = line else { continue };
            heard_anything = true;

            match parse_sentence(&line) {
                Ok(sentence) => {
                    if let Some(fix) = self.tracker.update(sentence) {
                        return Ok(Some(Reading::new(vec![Measurement::Location(fix)], Local::now())));
                    }
                }
                Err(e) => tracing::trace!("skipping nmea line: {}", e),
            }
        }

        if heard_anything {
            Ok(None)
        } else {
            Err(ReadError::Timeout("nmea"))
        }
    }

    fn apply(&mut self, outputs: &ActuatorState) -> Result<(), ReadError> {
        self.outputs.apply(outputs)
    }

    fn close(&mut self) {
        self.outputs.release();
        if std::mem::take(&mut self.serial_open) {
            self.hal.close_serial();
        }
    }
}

#[cfg(all(test, not(feature = "hardware")))]
mod tests {
    use super::*;
    use crate::hal::Hal;

    #[test]
    fn test_location_reads_mock_nmea_stream() {
        let hal = Arc::new(Hal::new().unwrap());
        let mut sensor = LocationSensor::new(hal, &LocationConfig::default());
        sensor.open().unwrap();

        let first = sensor.read().unwrap().unwrap();
        let Measurement::Location(fix) = &first.measurements[0] else {
            panic!("expected a location measurement");
        };
        assert!(fix.fix);
        assert_eq!(fix.satellites, 8);
        assert!(fix.longitude.unwrap() < 0.0);

        // RMC and GSA are consumed on the way to the next GGA
        let second = sensor.read().unwrap().unwrap();
        let Measurement::Location(fix) = &second.measurements[0] else {
            panic!("expected a location measurement");
        };
        assert_eq!(fix.timestamp.as_deref(), Some("2011-05-28 09:27:50"));

        sensor.close();
        assert!(matches!(sensor.read(), Err(ReadError::DeviceBusy(_))));
    }
}
