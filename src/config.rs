//! ==============================================================================
//! config.rs - Engine Configuration Loader
//! ==============================================================================
//!
//! purpose:
//!     defines the schema for `engine.toml`.
//!     loads configuration from file or falls back to defaults.
//!
//! structure:
//!     - LoggingConfig / ServerConfig / SwitchboardConfig: process-wide knobs.
//!     - ClimateConfig, DistanceConfig, HazardConfig, LocationConfig: one per
//!       activity. each carries its pins/bus addresses, actuator thresholds,
//!       a MonitorConfig (poll cadence, fault + probe policy) and, where the
//!       activity keeps history, a HistoryConfig.
//!
//! ==============================================================================

use anyhow::{anyhow, Context};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};

use crate::domain::ActivityKind;

/// Root configuration structure
#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct EngineConfig {
    pub logging: LoggingConfig,
    pub server: ServerConfig,
    pub engine: SwitchboardConfig,
    pub climate: ClimateConfig,
    pub distance: DistanceConfig,
    pub hazard: HazardConfig,
    pub location: LocationConfig,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub show_sensor_data: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self { level: "info".to_string(), show_sensor_data: false }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ServerConfig {
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self { bind: "0.0.0.0:5000".to_string() }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct SwitchboardConfig {
    /// how long a stop waits for the polling task before aborting it
    pub stop_grace_ms: u64,
}

impl Default for SwitchboardConfig {
    fn default() -> Self {
        Self { stop_grace_ms: 2000 }
    }
}

/// what to do when every initial probe read fails
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum ProbePolicy {
    /// start anyway in degraded state; the sensor may recover
    #[default]
    Optimistic,
    /// fail the activity start
    Strict,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct MonitorConfig {
    pub enabled: bool,
    pub poll_interval_ms: u64,
    /// consecutive read failures before the session is re-acquired
    pub fault_threshold: u32,
    pub probe_attempts: u32,
    pub probe_backoff_ms: u64,
    pub probe_policy: ProbePolicy,
    /// latest reading is reported stale after this long without a success
    pub stale_after_ms: u64,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            poll_interval_ms: 2000,
            fault_threshold: 3,
            probe_attempts: 3,
            probe_backoff_ms: 2000,
            probe_policy: ProbePolicy::Optimistic,
            stale_after_ms: 5000,
        }
    }
}

impl MonitorConfig {
    fn with_interval(poll_interval_ms: u64) -> Self {
        Self { poll_interval_ms, ..Self::default() }
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn probe_backoff(&self) -> Duration {
        Duration::from_millis(self.probe_backoff_ms)
    }

    pub fn stale_after(&self) -> Duration {
        Duration::from_millis(self.stale_after_ms)
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct HistoryConfig {
    pub path: PathBuf,
    /// metric names summarised per window, e.g. ["temp", "hum"]
    pub metrics: Vec<String>,
    pub window_secs: u64,
    pub window_max_samples: usize,
    pub max_points: usize,
    pub retention_hours: u64,
    pub prune_interval_secs: u64,
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("data").join("history.json"),
            metrics: Vec::new(),
            window_secs: 60,
            window_max_samples: 60,
            max_points: 1440,
            retention_hours: 24,
            prune_interval_secs: 3600,
        }
    }
}

impl HistoryConfig {
    fn for_metrics(file: &str, metrics: &[&str], window_secs: u64, max_points: usize) -> Self {
        Self {
            path: PathBuf::from("data").join(file),
            metrics: metrics.iter().map(|m| m.to_string()).collect(),
            window_secs,
            max_points,
            ..Self::default()
        }
    }

    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }

    pub fn retention(&self) -> chrono::Duration {
        chrono::Duration::hours(self.retention_hours as i64)
    }

    pub fn prune_interval(&self) -> Duration {
        Duration::from_secs(self.prune_interval_secs.max(1))
    }
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum DhtModel {
    #[default]
    Dht11,
    Dht22,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct TemperatureAlarmConfig {
    pub threshold_c: f64,
    pub beep_on_ms: u64,
    /// pause after a beep right at the threshold
    pub base_delay_ms: u64,
    /// pause shrinks by this much per degree above the threshold
    pub step_ms_per_degree: f64,
    pub min_delay_ms: u64,
}

impl Default for TemperatureAlarmConfig {
    fn default() -> Self {
        Self {
            threshold_c: 38.0,
            beep_on_ms: 100,
            base_delay_ms: 1000,
            step_ms_per_degree: 350.0,
            min_delay_ms: 100,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ClimateConfig {
    pub dht_pin: u8,
    pub dht_model: DhtModel,
    pub buzzer_pin: u8,
    pub alarm: TemperatureAlarmConfig,
    pub monitor: MonitorConfig,
    pub history: HistoryConfig,
}

impl Default for ClimateConfig {
    fn default() -> Self {
        Self {
            dht_pin: 4,
            dht_model: DhtModel::Dht11,
            buzzer_pin: 17,
            alarm: TemperatureAlarmConfig::default(),
            monitor: MonitorConfig::with_interval(5000),
            history: HistoryConfig::for_metrics("historical_data_climate.json", &["temp", "hum"], 60, 1440),
        }
    }
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
pub struct RangerPins {
    pub trigger_pin: u8,
    pub echo_pin: u8,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct DistanceConfig {
    pub ranger: RangerPins,
    /// optional second ranger, reported as a dual distance
    pub secondary: Option<RangerPins>,
    /// optional dht sampled alongside the ranger
    pub dht_pin: Option<u8>,
    pub dht_model: DhtModel,
    pub buzzer_pin: u8,
    pub alert_distance_cm: f64,
    pub echo_timeout_ms: u64,
    pub monitor: MonitorConfig,
    pub history: HistoryConfig,
}

impl Default for DistanceConfig {
    fn default() -> Self {
        Self {
            ranger: RangerPins { trigger_pin: 23, echo_pin: 24 },
            secondary: None,
            dht_pin: Some(4),
            dht_model: DhtModel::Dht11,
            buzzer_pin: 17,
            alert_distance_cm: 12.0,
            echo_timeout_ms: 100,
            monitor: MonitorConfig::with_interval(2000),
            history: HistoryConfig::for_metrics("historical_data_distance.json", &["distance"], 300, 288),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct HazardConfig {
    /// pcf8591 address, written like "0x48"
    pub i2c_address: String,
    pub adc_channel: u8,
    pub vibration_pin: u8,
    pub buzzer_pin: u8,
    pub red_led_pin: u8,
    pub green_led_pin: u8,
    pub gas_threshold: u8,
    pub monitor: MonitorConfig,
    pub history: HistoryConfig,
}

impl Default for HazardConfig {
    fn default() -> Self {
        Self {
            i2c_address: "0x48".to_string(),
            adc_channel: 0,
            vibration_pin: 26,
            buzzer_pin: 17,
            red_led_pin: 6,
            green_led_pin: 5,
            gas_threshold: 200,
            monitor: MonitorConfig::with_interval(1000),
            history: HistoryConfig::for_metrics("historical_data_hazard.json", &["gas"], 60, 1440),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct LocationConfig {
    pub serial_path: String,
    pub baud_rate: u32,
    pub buzzer_pin: u8,
    pub green_led_pin: u8,
    pub red_led_pin: u8,
    pub fix_beep_ms: u64,
    /// how long one poll may spend reading nmea lines
    pub read_timeout_ms: u64,
    pub monitor: MonitorConfig,
}

impl Default for LocationConfig {
    fn default() -> Self {
        Self {
            serial_path: "/dev/serial0".to_string(),
            baud_rate: 9600,
            buzzer_pin: 22,
            green_led_pin: 17,
            red_led_pin: 27,
            fix_beep_ms: 200,
            read_timeout_ms: 1500,
            monitor: MonitorConfig::with_interval(1000),
        }
    }
}

impl EngineConfig {
    /// Load configuration from file
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .with_context(|| format!("Failed to read config file {}", path.as_ref().display()))?;

        let config: EngineConfig = toml::from_str(&content)
            .map_err(|e| anyhow!("Failed to parse config: {}", e))?;

        Ok(config)
    }

    /// Load with default fallback
    pub fn load_or_default() -> Self {
        let paths = [
            PathBuf::from("config").join("engine.toml"),
            PathBuf::from("..").join("config").join("engine.toml"),
        ];

        for path in &paths {
            if path.exists() {
                match Self::load(path) {
                    Ok(config) => {
                        info!(path = %path.display(), "configuration loaded");
                        return config;
                    }
                    Err(e) => {
                        warn!(path = %path.display(), "failed to load config: {:#}", e);
                    }
                }
            }
        }

        warn!("no config file found - using defaults");
        Self::default()
    }

    pub fn monitor(&self, kind: ActivityKind) -> &MonitorConfig {
        match kind {
            ActivityKind::Climate => &self.climate.monitor,
            ActivityKind::Distance => &self.distance.monitor,
            ActivityKind::Hazard => &self.hazard.monitor,
            ActivityKind::Location => &self.location.monitor,
        }
    }

    /// history settings, for activities that keep history
    pub fn history(&self, kind: ActivityKind) -> Option<&HistoryConfig> {
        match kind {
            ActivityKind::Climate => Some(&self.climate.history),
            ActivityKind::Distance => Some(&self.distance.history),
            ActivityKind::Hazard => Some(&self.hazard.history),
            ActivityKind::Location => None,
        }
    }

    pub fn stop_grace(&self) -> Duration {
        Duration::from_millis(self.engine.stop_grace_ms)
    }

    /// Log configuration summary
    pub fn log_summary(&self) {
        info!(bind = %self.server.bind, level = %self.logging.level, "engine configuration");
        for kind in ActivityKind::ALL {
            let monitor = self.monitor(kind);
            match self.history(kind) {
                Some(h) => info!(
                    activity = %kind,
                    enabled = monitor.enabled,
                    poll_ms = monitor.poll_interval_ms,
                    window_s = h.window_secs,
                    max_points = h.max_points,
                    file = %h.path.display(),
                    "activity"
                ),
                None => info!(
                    activity = %kind,
                    enabled = monitor.enabled,
                    poll_ms = monitor.poll_interval_ms,
                    "activity (no history)"
                ),
            }
        }
    }
}

/// parse a bus address written as "0x48", "48h" or "72"
pub fn parse_bus_address(text: &str) -> anyhow::Result<u8> {
    let t = text.trim();
    let parsed = if let Some(hex) = t.strip_prefix("0x").or_else(|| t.strip_prefix("0X")) {
        u8::from_str_radix(hex, 16)
    } else if let Some(hex) = t.strip_suffix('h') {
        u8::from_str_radix(hex, 16)
    } else {
        t.parse::<u8>()
    };
    parsed.map_err(|e| anyhow!("invalid bus address {:?}: {}", text, e))
}
