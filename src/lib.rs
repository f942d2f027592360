//! ==============================================================================
//! sensorhub - sensor monitoring engine
//! ==============================================================================
//!
//! runs one sensor "activity" at a time on a single-board computer: a polling
//! loop per activity, windowed aggregation into a capped on-disk history and
//! a switchboard that hands the shared pins from one activity to the next.
//!
//! data flow:
//!
//!     Switchboard -> HardwareSession::acquire -> PollLoop -> SensorDevice::read
//!         -> AggregationBuffer -> HistoryStore
//!         -> EngineState (latest snapshot, read by the web layer)
//!
//! ==============================================================================

pub mod actuator;
pub mod aggregate;
pub mod config;
pub mod domain;
pub mod error;
pub mod hal;
pub mod history;
pub mod monitor;
pub mod sensors;
pub mod session;
pub mod switchboard;

pub use config::EngineConfig;
pub use domain::{ActivityKind, LatestReading, Measurement, PollState, Reading};
pub use error::{InitError, PersistenceError, ReadError};
pub use history::{HistoricalPoint, HistoricalSeries};
pub use switchboard::{SlotPhase, Switchboard};
