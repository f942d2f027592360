//! ==============================================================================
//! session.rs - hardware session (acquire / probe / release)
//! ==============================================================================
//!
//! purpose:
//!     owns one activity's device for as long as the activity runs. acquiring
//!     opens the device and probes it a bounded number of times; releasing
//!     drives every output OFF and gives the pins back.
//!
//! probe policy:
//!     - strict: every probe failed -> InitError::ProbeFailed, nothing stays claimed
//!     - optimistic: every probe failed -> session is returned flagged degraded
//!
//! relationships:
//!     - uses: sensors/mod.rs (SensorDevice)
//!     - used by: monitor.rs (reads, actuators, reinit) and switchboard.rs
//!
//! all methods block (pin timing, probe backoff); async callers go through
//! spawn_blocking. once a stop channel is attached, the probe loop and its
//! backoff give up as soon as the stop flag is raised.
//!
//! ==============================================================================

use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::actuator::ActuatorState;
use crate::config::{MonitorConfig, ProbePolicy};
use crate::domain::{ActivityKind, Reading};
use crate::error::{InitError, ReadError};
use crate::sensors::SensorDevice;

/// granularity of the stop check while sleeping out a probe backoff
const STOP_CHECK: Duration = Duration::from_millis(20);

pub struct HardwareSession {
    kind: ActivityKind,
    device: Box<dyn SensorDevice>,
    probe_attempts: u32,
    probe_backoff: Duration,
    policy: ProbePolicy,
    active: bool,
    degraded: bool,
    stop: Option<watch::Receiver<bool>>,
}

impl HardwareSession {
    /// open and probe `device`. on error the device has already been closed.
    pub fn acquire(
        kind: ActivityKind,
        device: Box<dyn SensorDevice>,
        config: &MonitorConfig,
    ) -> Result<Self, InitError> {
        let mut session = Self {
            kind,
            device,
            probe_attempts: config.probe_attempts.max(1),
            probe_backoff: config.probe_backoff(),
            policy: config.probe_policy,
            active: false,
            degraded: false,
            stop: None,
        };
        session.open_and_probe()?;
        Ok(session)
    }

    fn open_and_probe(&mut self) -> Result<(), InitError> {
        if let Err(e) = self.device.open() {
            self.device.close();
            return Err(e);
        }
        self.active = true;

        for attempt in 1..=self.probe_attempts {
            if self.stop_requested() {
                return self.cancel();
            }
            match self.device.read() {
                Ok(Some(_)) => {
                    info!(activity = %self.kind, device = self.device.name(), attempt, "sensor answered probe");
                    self.degraded = false;
                    return Ok(());
                }
                Ok(None) => debug!(activity = %self.kind, attempt, "probe: sensor not ready"),
                Err(e) => debug!(activity = %self.kind, attempt, "probe failed: {}", e),
            }
            if attempt < self.probe_attempts && !self.backoff() {
                return self.cancel();
            }
        }

        match self.policy {
            ProbePolicy::Strict => {
                warn!(activity = %self.kind, attempts = self.probe_attempts, "sensor never answered, giving up");
                self.release();
                Err(InitError::ProbeFailed { attempts: self.probe_attempts })
            }
            ProbePolicy::Optimistic => {
                warn!(activity = %self.kind, attempts = self.probe_attempts, "sensor never answered, starting degraded");
                self.degraded = true;
                Ok(())
            }
        }
    }

    /// sleep out the probe backoff; false when a stop arrived meanwhile
    fn backoff(&self) -> bool {
        let deadline = Instant::now() + self.probe_backoff;
        loop {
            if self.stop_requested() {
                return false;
            }
            let left = deadline.saturating_duration_since(Instant::now());
            if left.is_zero() {
                return true;
            }
            std::thread::sleep(left.min(STOP_CHECK));
        }
    }

    fn stop_requested(&self) -> bool {
        self.stop.as_ref().is_some_and(|stop| *stop.borrow())
    }

    fn cancel(&mut self) -> Result<(), InitError> {
        debug!(activity = %self.kind, "probing interrupted by stop");
        self.release();
        Err(InitError::Cancelled)
    }

    /// later probes (reacquire) bail out once `stop` reads true
    pub fn watch_stop(&mut self, stop: watch::Receiver<bool>) {
        self.stop = Some(stop);
    }

    /// release and acquire again with the same device and probe settings
    pub fn reacquire(&mut self) -> Result<(), InitError> {
        info!(activity = %self.kind, "re-initializing hardware");
        self.release();
        self.open_and_probe()
    }

    pub fn read(&mut self) -> Result<Option<Reading>, ReadError> {
        if !self.active {
            return Err(ReadError::DeviceBusy(format!("{} session released", self.kind)));
        }
        self.device.read()
    }

    pub fn set_actuators(&mut self, outputs: &ActuatorState) -> Result<(), ReadError> {
        if !self.active {
            return Err(ReadError::DeviceBusy(format!("{} session released", self.kind)));
        }
        self.device.apply(outputs)
    }

    /// outputs OFF, then give the pins back. safe to call any number of times.
    pub fn release(&mut self) {
        if !std::mem::take(&mut self.active) {
            return;
        }
        if let Err(e) = self.device.apply(&ActuatorState::OFF) {
            warn!(activity = %self.kind, "could not switch outputs off: {}", e);
        }
        self.device.close();
        debug!(activity = %self.kind, "hardware released");
    }

    pub fn kind(&self) -> ActivityKind {
        self.kind
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    /// every probe of the last acquire failed (optimistic policy only)
    pub fn is_degraded(&self) -> bool {
        self.degraded
    }
}

impl Drop for HardwareSession {
    fn drop(&mut self) {
        self.release();
    }
}
