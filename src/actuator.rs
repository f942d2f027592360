//! ==============================================================================
//! actuator.rs - buzzer / led policy per activity
//! ==============================================================================
//!
//! purpose:
//!     turns a successful reading into the desired output state. the polling
//!     loop applies the result through the hardware session; this module never
//!     touches pins itself.
//!
//! policies:
//!     - climate: at/above the threshold the buzzer pulses, and the pause until
//!       the next poll shrinks as the temperature climbs.
//!     - distance: buzzer held on while the primary distance >= alert distance.
//!     - hazard: red led on gas >= threshold, green led on vibration, buzzer on
//!       either.
//!     - location: green led on fix, red led blinks while searching, one short
//!       beep when a fix is first acquired.
//!
//! ==============================================================================

use serde::Serialize;
use std::time::Duration;

use crate::config::{EngineConfig, TemperatureAlarmConfig};
use crate::domain::{ActivityKind, Measurement, Reading};

/// level of every output an activity may drive
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct ActuatorState {
    pub buzzer: bool,
    pub red_led: bool,
    pub green_led: bool,
}

impl ActuatorState {
    pub const OFF: ActuatorState = ActuatorState { buzzer: false, red_led: false, green_led: false };
}

/// a timed buzzer pulse performed by the polling loop
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BuzzerPulse {
    pub on_for: Duration,
    /// replaces the regular poll interval for the following wait
    pub then_wait: Option<Duration>,
}

/// outcome of one policy evaluation
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Actuation {
    pub outputs: ActuatorState,
    pub pulse: Option<BuzzerPulse>,
}

impl Actuation {
    fn steady(outputs: ActuatorState) -> Self {
        Self { outputs, pulse: None }
    }

    /// state as reported to readers: a pulsing buzzer counts as on
    pub fn reported(&self) -> ActuatorState {
        ActuatorState { buzzer: self.outputs.buzzer || self.pulse.is_some(), ..self.outputs }
    }
}

#[derive(Clone, Debug)]
pub enum ActuatorPolicy {
    TemperatureAlarm(TemperatureAlarmConfig),
    ProximityAlert { alert_distance_cm: f64 },
    HazardAlarm { gas_threshold: u8 },
    FixIndicator { fix_beep: Duration, had_fix: bool, blink: bool },
}

impl ActuatorPolicy {
    pub fn for_activity(kind: ActivityKind, config: &EngineConfig) -> Self {
        match kind {
            ActivityKind::Climate => ActuatorPolicy::TemperatureAlarm(config.climate.alarm.clone()),
            ActivityKind::Distance => ActuatorPolicy::ProximityAlert {
                alert_distance_cm: config.distance.alert_distance_cm,
            },
            ActivityKind::Hazard => ActuatorPolicy::HazardAlarm {
                gas_threshold: config.hazard.gas_threshold,
            },
            ActivityKind::Location => ActuatorPolicy::FixIndicator {
                fix_beep: Duration::from_millis(config.location.fix_beep_ms),
                had_fix: false,
                blink: false,
            },
        }
    }

    pub fn evaluate(&mut self, reading: &Reading) -> Actuation {
        match self {
            ActuatorPolicy::TemperatureAlarm(alarm) => match reading.metric("temp") {
                Some(t) if t >= alarm.threshold_c => Actuation {
                    outputs: ActuatorState::OFF,
                    pulse: Some(BuzzerPulse {
                        on_for: Duration::from_millis(alarm.beep_on_ms),
                        then_wait: Some(beep_delay(alarm, t)),
                    }),
                },
                _ => Actuation::steady(ActuatorState::OFF),
            },
            ActuatorPolicy::ProximityAlert { alert_distance_cm } => {
                let alert = reading.metric("distance").is_some_and(|d| d >= *alert_distance_cm);
                Actuation::steady(ActuatorState { buzzer: alert, ..ActuatorState::OFF })
            }
            ActuatorPolicy::HazardAlarm { gas_threshold } => {
                let gas = reading.metric("gas").is_some_and(|g| g >= f64::from(*gas_threshold));
                let vibration = reading.metric("vibration").is_some_and(|v| v > 0.0);
                Actuation::steady(ActuatorState {
                    buzzer: gas || vibration,
                    red_led: gas,
                    green_led: vibration,
                })
            }
            ActuatorPolicy::FixIndicator { fix_beep, had_fix, blink } => {
                let fix = reading.measurements.iter().any(|m| matches!(m, Measurement::Location(f) if f.fix));
                let actuation = if fix {
                    let pulse = (!*had_fix).then_some(BuzzerPulse { on_for: *fix_beep, then_wait: None });
                    *blink = false;
                    Actuation {
                        outputs: ActuatorState { green_led: true, ..ActuatorState::OFF },
                        pulse,
                    }
                } else {
                    *blink = !*blink;
                    Actuation::steady(ActuatorState { red_led: *blink, ..ActuatorState::OFF })
                };
                *had_fix = fix;
                actuation
            }
        }
    }
}

/// pause after an alarm beep: base delay minus a per-degree step, floored
pub fn beep_delay(alarm: &TemperatureAlarmConfig, temperature: f64) -> Duration {
    let over = (temperature - alarm.threshold_c).max(0.0);
    let ms = alarm.base_delay_ms as f64 - alarm.step_ms_per_degree * over;
    Duration::from_millis(ms.max(alarm.min_delay_ms as f64).round() as u64)
}
