//! ==============================================================================
//! error.rs - engine error taxonomy
//! ==============================================================================
//!
//! purpose:
//!     typed errors for the three places the engine can fail:
//!     - InitError: hardware acquisition (surfaced as a failed activity start)
//!     - ReadError: a single poll (counted by the fault monitor, never fatal)
//!     - PersistenceError: history file i/o (logged, memory stays authoritative)
//!
//!     schema problems while loading history are not errors at all: the loader
//!     falls back to an empty canonical series.
//!
//! ==============================================================================

use std::path::PathBuf;
use thiserror::Error;

use crate::domain::ActivityKind;

/// hardware acquisition failed
#[derive(Debug, Error)]
pub enum InitError {
    /// claiming pins / opening a bus failed
    #[error("hardware init failed: {0}")]
    Hardware(String),

    /// every probe read failed and the probe policy is strict
    #[error("sensor did not answer after {attempts} probe attempts")]
    ProbeFailed { attempts: u32 },

    /// the activity is disabled or has no device
    #[error("activity {0} is not available")]
    Unavailable(ActivityKind),

    /// a stop arrived while probing; the device was released again
    #[error("acquire cancelled by stop")]
    Cancelled,
}

/// a single poll failed
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ReadError {
    /// no edge seen on the echo line within the bounded wait
    #[error("timed out waiting for {0} edge")]
    Timeout(&'static str),

    /// measurement outside the sensor's valid range (not clamped)
    #[error("value {0} outside valid range")]
    OutOfRange(f64),

    /// bus error, released session or a poisoned lock
    #[error("device busy: {0}")]
    DeviceBusy(String),
}

/// history could not be written or removed
#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("history i/o on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("history encode failed: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("activity {0} keeps no history")]
    NoHistory(ActivityKind),
}

impl PersistenceError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io { path: path.into(), source }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_error_messages() {
        assert_eq!(ReadError::Timeout("rising").to_string(), "timed out waiting for rising edge");
        assert_eq!(ReadError::OutOfRange(512.3).to_string(), "value 512.3 outside valid range");
    }

    #[test]
    fn test_init_error_names_activity() {
        let e = InitError::Unavailable(ActivityKind::Location);
        assert_eq!(e.to_string(), "activity location is not available");
    }
}
