use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::actuator::ActuatorState;

/// a mutually exclusive mode that owns the shared actuator pins
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActivityKind {
    /// dht temperature/humidity with a temperature alarm
    Climate,
    /// ultrasonic ranger(s), optionally with a dht
    Distance,
    /// gas level adc + vibration input
    Hazard,
    /// uart gps
    Location,
}

impl ActivityKind {
    pub const ALL: [ActivityKind; 4] = [
        ActivityKind::Climate,
        ActivityKind::Distance,
        ActivityKind::Hazard,
        ActivityKind::Location,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            ActivityKind::Climate => "climate",
            ActivityKind::Distance => "distance",
            ActivityKind::Hazard => "hazard",
            ActivityKind::Location => "location",
        }
    }
}

impl fmt::Display for ActivityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// one gps observation assembled from GGA/RMC sentences
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct GpsFix {
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub altitude: Option<f64>,
    pub satellites: u32,
    pub fix: bool,
    /// utc date/time as reported by RMC, when seen
    pub timestamp: Option<String>,
}

/// a single measured quantity
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Measurement {
    Climate { temperature: f64, humidity: f64 },
    Distance { cm: f64 },
    DualDistance { primary_cm: f64, secondary_cm: f64 },
    Gas { level: u8 },
    Vibration { detected: bool },
    Location(GpsFix),
}

impl Measurement {
    /// numeric channels this measurement contributes to history, by metric name
    pub fn metrics(&self) -> Vec<(&'static str, f64)> {
        match self {
            Measurement::Climate { temperature, humidity } => {
                vec![("temp", *temperature), ("hum", *humidity)]
            }
            Measurement::Distance { cm } => vec![("distance", *cm)],
            Measurement::DualDistance { primary_cm, secondary_cm } => {
                vec![("distance", *primary_cm), ("distance2", *secondary_cm)]
            }
            Measurement::Gas { level } => vec![("gas", f64::from(*level))],
            Measurement::Vibration { detected } => {
                vec![("vibration", if *detected { 1.0 } else { 0.0 })]
            }
            Measurement::Location(fix) => vec![("satellites", f64::from(fix.satellites))],
        }
    }
}

/// one poll's worth of data. immutable once produced.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Reading {
    pub measurements: Vec<Measurement>,
    pub captured_at: DateTime<Local>,
    /// false when an optional secondary channel failed this poll
    pub valid: bool,
}

impl Reading {
    pub fn new(measurements: Vec<Measurement>, captured_at: DateTime<Local>) -> Self {
        Self { measurements, captured_at, valid: true }
    }

    pub fn partial(mut self) -> Self {
        self.valid = false;
        self
    }

    /// value of a named metric, if any measurement carries it
    pub fn metric(&self, name: &str) -> Option<f64> {
        self.measurements
            .iter()
            .flat_map(|m| m.metrics())
            .find(|(n, _)| *n == name)
            .map(|(_, v)| v)
    }
}

/// lifecycle of one activity's polling loop
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PollState {
    #[default]
    Stopped,
    Polling,
    Degraded,
}

/// the last published snapshot for one activity.
/// replaced as a whole on every poll; readers never see a half update.
#[derive(Clone, Debug, Serialize)]
pub struct LatestReading {
    pub activity: ActivityKind,
    pub state: PollState,
    pub reading: Option<Reading>,
    pub error: bool,
    pub last_error: Option<String>,
    pub actuators: ActuatorState,
    pub updated_at: Option<DateTime<Local>>,
    pub last_success: Option<DateTime<Local>>,
    /// computed at query time from last_success
    pub stale: bool,
}

impl LatestReading {
    pub fn empty(activity: ActivityKind) -> Self {
        Self {
            activity,
            state: PollState::Stopped,
            reading: None,
            error: false,
            last_error: None,
            actuators: ActuatorState::default(),
            updated_at: None,
            last_success: None,
            stale: false,
        }
    }
}

/// round to one decimal place
pub fn round1(value: f64) -> f64 {
    (value * 10.0).round() / 10.0
}
