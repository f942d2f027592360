//! HC-SR04 style ultrasonic ranging.
//!
//! A ~10 µs trigger pulse starts a measurement; the echo line then stays high
//! for the round trip time. Both edges are waited for with a bounded busy
//! wait, and the distance is only accepted inside the ranger's valid span.

use chrono::Local;
use std::sync::Arc;
use std::time::{Duration, Instant};

use super::climate::read_climate;
use super::{OutputPins, SensorDevice};
use crate::actuator::ActuatorState;
use crate::config::{DhtModel, DistanceConfig, RangerPins};
use crate::domain::{round1, Measurement, Reading};
use crate::error::{InitError, ReadError};
use crate::hal::HardwareProvider;

/// speed of sound, cm/s
const SPEED_OF_SOUND_CM_S: f64 = 34300.0;
pub const MIN_DISTANCE_CM: f64 = 2.0;
pub const MAX_DISTANCE_CM: f64 = 400.0;

const TRIGGER_SETTLE: Duration = Duration::from_micros(500);
const TRIGGER_PULSE: Duration = Duration::from_micros(10);

/// round trip echo width -> distance, rejected (not clamped) outside 2..=400 cm
pub fn distance_from_pulse(width: Duration) -> Result<f64, ReadError> {
    let cm = width.as_secs_f64() * SPEED_OF_SOUND_CM_S / 2.0;
    if (MIN_DISTANCE_CM..=MAX_DISTANCE_CM).contains(&cm) {
        Ok(round1(cm))
    } else {
        Err(ReadError::OutOfRange(round1(cm)))
    }
}

fn busy(e: anyhow::Error) -> ReadError {
    ReadError::DeviceBusy(e.to_string())
}

/// spin until `echo` reads `level`, or give up after `timeout`
fn wait_for_level(
    hal: &dyn HardwareProvider,
    echo: u8,
    level: bool,
    timeout: Duration,
) -> Result<Instant, ReadError> {
    let start = Instant::now();
    loop {
        if hal.read_gpio(echo).map_err(busy)? == level {
            return Ok(Instant::now());
        }
        if start.elapsed() > timeout {
            return Err(ReadError::Timeout(if level { "rising" } else { "falling" }));
        }
        std::hint::spin_loop();
    }
}

pub fn measure_distance(
    hal: &dyn HardwareProvider,
    pins: RangerPins,
    timeout: Duration,
) -> Result<f64, ReadError> {
    hal.write_gpio(pins.trigger_pin, false).map_err(busy)?;
    std::thread::sleep(TRIGGER_SETTLE);
    hal.write_gpio(pins.trigger_pin, true).map_err(busy)?;
    std::thread::sleep(TRIGGER_PULSE);
    hal.write_gpio(pins.trigger_pin, false).map_err(busy)?;

    let rise = wait_for_level(hal, pins.echo_pin, true, timeout)?;
    let fall = wait_for_level(hal, pins.echo_pin, false, timeout)?;
    distance_from_pulse(fall.duration_since(rise))
}

/// one or two rangers, optionally with a dht, plus the proximity buzzer
pub struct DistanceSensor {
    hal: Arc<dyn HardwareProvider>,
    ranger: RangerPins,
    secondary: Option<RangerPins>,
    dht: Option<(u8, DhtModel)>,
    echo_timeout: Duration,
    outputs: OutputPins,
    claimed: Vec<u8>,
}

impl DistanceSensor {
    pub fn new(hal: Arc<dyn HardwareProvider>, config: &DistanceConfig) -> Self {
        Self {
            outputs: OutputPins::new(Arc::clone(&hal), Some(config.buzzer_pin), None, None),
            hal,
            ranger: config.ranger,
            secondary: config.secondary,
            dht: config.dht_pin.map(|pin| (pin, config.dht_model)),
            echo_timeout: Duration::from_millis(config.echo_timeout_ms),
            claimed: Vec::new(),
        }
    }

    fn claim_ranger(&mut self, pins: RangerPins) -> Result<(), InitError> {
        self.hal
            .claim_output(pins.trigger_pin, false)
            .map_err(|e| InitError::Hardware(format!("trigger pin {}: {}", pins.trigger_pin, e)))?;
        self.claimed.push(pins.trigger_pin);
        self.hal
            .claim_input(pins.echo_pin)
            .map_err(|e| InitError::Hardware(format!("echo pin {}: {}", pins.echo_pin, e)))?;
        self.claimed.push(pins.echo_pin);
        Ok(())
    }
}

impl SensorDevice for DistanceSensor {
    fn name(&self) -> &'static str {
        "distance"
    }

    fn open(&mut self) -> Result<(), InitError> {
        self.claim_ranger(self.ranger)?;
        if let Some(secondary) = self.secondary {
            self.claim_ranger(secondary)?;
        }
        self.outputs.claim()
    }

    fn read(&mut self) -> Result<Option<Reading>, ReadError> {
        let hal = self.hal.as_ref();
        let primary = measure_distance(hal, self.ranger, self.echo_timeout)?;
        let mut partial = false;

        let mut measurements = match self.secondary {
            Some(pins) => match measure_distance(hal, pins, self.echo_timeout) {
                Ok(secondary) => vec![Measurement::DualDistance { primary_cm: primary, secondary_cm: secondary }],
                Err(e) => {
                    tracing::debug!("secondary ranger failed: {}", e);
                    partial = true;
                    vec![Measurement::Distance { cm: primary }]
                }
            },
            None => vec![Measurement::Distance { cm: primary }],
        };

        if let Some((pin, model)) = self.dht {
            match read_climate(hal, pin, model) {
                Ok(Some(climate)) => measurements.push(climate),
                Ok(None) => {}
                Err(e) => {
                    tracing::debug!("dht alongside ranger failed: {}", e);
                    partial = true;
                }
            }
        }

        let reading = Reading::new(measurements, Local::now());
        Ok(Some(if partial { reading.partial() } else { reading }))
    }

    fn apply(&mut self, outputs: &ActuatorState) -> Result<(), ReadError> {
        self.outputs.apply(outputs)
    }

    fn close(&mut self) {
        self.outputs.release();
        for pin in self.claimed.drain(..) {
            self.hal.release_pin(pin);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_distance_from_pulse_range() {
        assert_eq!(distance_from_pulse(Duration::from_millis(2)).unwrap(), 34.3);
        assert!(matches!(
            distance_from_pulse(Duration::from_micros(100)),
            Err(ReadError::OutOfRange(_))
        ));
        assert!(matches!(
            distance_from_pulse(Duration::from_millis(25)),
            Err(ReadError::OutOfRange(_))
        ));
        let near_limit = Duration::from_secs_f64(399.0 * 2.0 / SPEED_OF_SOUND_CM_S);
        assert_eq!(distance_from_pulse(near_limit).unwrap(), 399.0);
    }

    #[cfg(not(feature = "hardware"))]
    mod mock {
        use super::*;
        use crate::hal::Hal;

        #[test]
        fn test_echo_never_rises_times_out() {
            let hal = Hal::new().unwrap();
            hal.claim_output(23, false).unwrap();
            hal.claim_input(24).unwrap();

            let start = Instant::now();
            let result = measure_distance(&hal, RangerPins { trigger_pin: 23, echo_pin: 24 }, Duration::from_millis(100));
            assert_eq!(result, Err(ReadError::Timeout("rising")));
            assert!(start.elapsed() >= Duration::from_millis(100));
        }

        #[test]
        fn test_distance_sensor_reads_mock_ranger() {
            let hal = Arc::new(Hal::new().unwrap().with_ranger(23, 24, 50.0));
            let config = DistanceConfig { dht_pin: None, ..DistanceConfig::default() };
            let mut sensor = DistanceSensor::new(hal.clone(), &config);
            sensor.open().unwrap();

            let reading = sensor.read().unwrap().unwrap();
            let cm = reading.metric("distance").unwrap();
            assert!((40.0..=80.0).contains(&cm), "unexpected distance {}", cm);
            assert!(reading.valid);

            sensor.close();
            assert!(!hal.is_claimed(23));
            assert!(!hal.is_claimed(24));
        }

        #[test]
        fn test_missing_secondary_echo_marks_partial() {
            let hal = Arc::new(Hal::new().unwrap().with_ranger(23, 24, 30.0));
            let config = DistanceConfig {
                secondary: Some(RangerPins { trigger_pin: 5, echo_pin: 6 }),
                echo_timeout_ms: 5,
                ..DistanceConfig::default()
            };
            let mut sensor = DistanceSensor::new(hal, &config);
            sensor.open().unwrap();

            let reading = sensor.read().unwrap().unwrap();
            assert!(!reading.valid);
            assert!(reading.metric("distance").is_some());
            assert_eq!(reading.metric("distance2"), None);
            assert_eq!(reading.metric("temp"), Some(25.0));
        }
    }
}
