//! ==============================================================================
//! switchboard.rs - activity switchboard + engine state
//! ==============================================================================
//!
//! purpose:
//!     the function surface the presentation layer calls:
//!       start_activity / stop_activity / latest_reading / history / clear_history
//!
//!     only one activity may hold the hardware at a time. switching always
//!     runs the full stop sequence of the active one first:
//!
//!       signal stop -> join the poll task (bounded by stop_grace, then abort)
//!                   -> flush the open window into history -> save
//!                   -> release the session (outputs OFF)
//!                   -> only then build + acquire the next device
//!
//! shared state:
//!     EngineState holds what request handlers read: the latest snapshot per
//!     activity (tokio RwLock, replaced whole) and the history stores. it
//!     also keeps each activity's open aggregation window, so the stop
//!     sequence and clear_history reach it without the polling task. lock
//!     order is window, then store. the slot itself sits behind a tokio Mutex
//!     so transitions never interleave.
//!
//! ==============================================================================

use chrono::Local;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::{watch, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::actuator::ActuatorState;
use crate::aggregate::AggregationBuffer;
use crate::config::EngineConfig;
use crate::domain::{ActivityKind, LatestReading, PollState};
use crate::error::{InitError, PersistenceError};
use crate::hal::lock;
use crate::history::{HistoricalSeries, HistoryStore};
use crate::monitor::{run_pruner, PollLoop};
use crate::sensors::DeviceFactory;
use crate::session::HardwareSession;

// ==============================================================================
// engine state
// ==============================================================================

pub struct EngineState {
    latest: RwLock<HashMap<ActivityKind, LatestReading>>,
    histories: HashMap<ActivityKind, Arc<Mutex<HistoryStore>>>,
    windows: HashMap<ActivityKind, Arc<Mutex<AggregationBuffer>>>,
}

impl EngineState {
    /// loads every activity's history from disk (tolerant, never fails)
    pub fn new(config: &EngineConfig) -> Self {
        let mut histories = HashMap::new();
        let mut windows = HashMap::new();
        for kind in ActivityKind::ALL {
            let Some(history) = config.history(kind) else { continue };
            histories.insert(kind, Arc::new(Mutex::new(HistoryStore::load(history))));
            let window = AggregationBuffer::new(history.metrics.clone(), history.window(), history.window_max_samples);
            windows.insert(kind, Arc::new(Mutex::new(window)));
        }
        let latest = ActivityKind::ALL.into_iter().map(|k| (k, LatestReading::empty(k))).collect();

        Self { latest: RwLock::new(latest), histories, windows }
    }

    /// replace the snapshot as a whole
    pub async fn publish(&self, snapshot: LatestReading) {
        self.latest.write().await.insert(snapshot.activity, snapshot);
    }

    pub async fn latest(&self, kind: ActivityKind) -> LatestReading {
        self.latest
            .read()
            .await
            .get(&kind)
            .cloned()
            .unwrap_or_else(|| LatestReading::empty(kind))
    }

    pub fn history(&self, kind: ActivityKind) -> Option<Arc<Mutex<HistoryStore>>> {
        self.histories.get(&kind).cloned()
    }

    /// open aggregation window; None for activities that keep no history
    pub fn window(&self, kind: ActivityKind) -> Option<Arc<Mutex<AggregationBuffer>>> {
        self.windows.get(&kind).cloned()
    }
}

// ==============================================================================
// switchboard
// ==============================================================================

/// lifecycle of the single activity slot
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "phase", content = "activity", rename_all = "lowercase")]
pub enum SlotPhase {
    Idle,
    Starting(ActivityKind),
    Running(ActivityKind),
    Stopping(ActivityKind),
}

struct ActiveActivity {
    kind: ActivityKind,
    session: Arc<Mutex<HardwareSession>>,
    stop: watch::Sender<bool>,
    poll: JoinHandle<()>,
    pruner: Option<JoinHandle<()>>,
}

pub struct Switchboard {
    config: EngineConfig,
    factory: Arc<dyn DeviceFactory>,
    engine: Arc<EngineState>,
    slot: tokio::sync::Mutex<Option<ActiveActivity>>,
    phase: watch::Sender<SlotPhase>,
}

impl Switchboard {
    pub fn new(config: EngineConfig, factory: Arc<dyn DeviceFactory>) -> Self {
        let engine = Arc::new(EngineState::new(&config));
        let (phase, _) = watch::channel(SlotPhase::Idle);
        Self { config, factory, engine, slot: tokio::sync::Mutex::new(None), phase }
    }

    pub fn engine(&self) -> &Arc<EngineState> {
        &self.engine
    }

    pub fn status(&self) -> SlotPhase {
        *self.phase.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<SlotPhase> {
        self.phase.subscribe()
    }

    fn set_phase(&self, phase: SlotPhase) {
        debug!(?phase, "slot transition");
        self.phase.send_replace(phase);
    }

    /// make `kind` the active activity. already running -> no-op.
    pub async fn start_activity(&self, kind: ActivityKind) -> Result<(), InitError> {
        let mut slot = self.slot.lock().await;
        if slot.as_ref().is_some_and(|active| active.kind == kind) {
            debug!(activity = %kind, "already running");
            return Ok(());
        }
        if let Some(active) = slot.take() {
            self.stop_sequence(active).await;
        }

        self.set_phase(SlotPhase::Starting(kind));
        match self.launch(kind).await {
            Ok(active) => {
                *slot = Some(active);
                self.set_phase(SlotPhase::Running(kind));
                info!(activity = %kind, "activity started");
                Ok(())
            }
            Err(e) => {
                error!(activity = %kind, "activity failed to start: {}", e);
                let mut snapshot = LatestReading::empty(kind);
                snapshot.error = true;
                snapshot.last_error = Some(e.to_string());
                snapshot.updated_at = Some(Local::now());
                self.engine.publish(snapshot).await;
                self.set_phase(SlotPhase::Idle);
                Err(e)
            }
        }
    }

    async fn launch(&self, kind: ActivityKind) -> Result<ActiveActivity, InitError> {
        let device = self.factory.build(kind)?;
        let monitor = self.config.monitor(kind).clone();
        let mut session = tokio::task::spawn_blocking(move || HardwareSession::acquire(kind, device, &monitor))
            .await
            .map_err(|e| InitError::Hardware(format!("acquire task failed: {}", e)))??;

        let degraded = session.is_degraded();
        let (stop, stop_rx) = watch::channel(false);
        session.watch_stop(stop_rx.clone());
        let session = Arc::new(Mutex::new(session));

        let poll_loop = PollLoop::new(kind, Arc::clone(&session), Arc::clone(&self.engine), &self.config, degraded);
        let poll = tokio::spawn(poll_loop.run(stop_rx.clone()));

        let pruner = match (self.config.history(kind), self.engine.history(kind)) {
            (Some(history), Some(store)) => Some(tokio::spawn(run_pruner(
                kind,
                store,
                history.prune_interval(),
                history.retention(),
                stop_rx,
            ))),
            _ => None,
        };

        Ok(ActiveActivity { kind, session, stop, poll, pruner })
    }

    /// stop `kind` if it is the active activity; returns whether it was
    pub async fn stop_activity(&self, kind: ActivityKind) -> bool {
        let mut slot = self.slot.lock().await;
        match slot.take() {
            Some(active) if active.kind == kind => {
                self.stop_sequence(active).await;
                true
            }
            other => {
                *slot = other;
                false
            }
        }
    }

    /// stop whatever is active (signal-driven shutdown)
    pub async fn shutdown(&self) {
        let mut slot = self.slot.lock().await;
        if let Some(active) = slot.take() {
            info!(activity = %active.kind, "shutting down active activity");
            self.stop_sequence(active).await;
        }
    }

    pub async fn active_activity(&self) -> Option<ActivityKind> {
        self.slot.lock().await.as_ref().map(|a| a.kind)
    }

    async fn stop_sequence(&self, mut active: ActiveActivity) {
        let kind = active.kind;
        self.set_phase(SlotPhase::Stopping(kind));
        active.stop.send_replace(true);

        let grace = self.config.stop_grace();
        match tokio::time::timeout(grace, &mut active.poll).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!(activity = %kind, "poll task ended abnormally: {}", e),
            Err(_) => {
                warn!(activity = %kind, grace_ms = grace.as_millis() as u64, "poll task did not stop in time, aborting");
                active.poll.abort();
            }
        }
        if let Some(pruner) = active.pruner.take() {
            pruner.abort();
        }

        // the window outlives an aborted task, so it is flushed either way
        if let (Some(window), Some(store)) = (self.engine.window(kind), self.engine.history(kind)) {
            let saved = tokio::task::spawn_blocking(move || {
                let mut window = lock(&window);
                let mut store = lock(&store);
                if let Some(point) = window.flush(Local::now()) {
                    store.record(&point);
                }
                store.save()
            })
            .await;
            match saved {
                Ok(Ok(())) => debug!(activity = %kind, "history saved on stop"),
                Ok(Err(e)) => warn!(activity = %kind, "history save on stop failed: {}", e),
                Err(e) => error!(activity = %kind, "history task failed: {}", e),
            }
        }

        let session = Arc::clone(&active.session);
        if let Err(e) = tokio::task::spawn_blocking(move || lock(&session).release()).await {
            error!(activity = %kind, "release task failed: {}", e);
        }

        let mut snapshot = self.engine.latest(kind).await;
        snapshot.state = PollState::Stopped;
        snapshot.actuators = ActuatorState::OFF;
        self.engine.publish(snapshot).await;

        self.set_phase(SlotPhase::Idle);
        info!(activity = %kind, "activity stopped");
    }

    /// latest snapshot with the stale flag computed now
    pub async fn latest_reading(&self, kind: ActivityKind) -> LatestReading {
        let mut snapshot = self.engine.latest(kind).await;
        let stale_after = self.config.monitor(kind).stale_after();
        snapshot.stale = snapshot.state != PollState::Stopped
            && match snapshot.last_success {
                Some(at) => Local::now()
                    .signed_duration_since(at)
                    .to_std()
                    .is_ok_and(|age| age > stale_after),
                None => snapshot.error,
            };
        snapshot
    }

    /// best available series; None for activities that keep no history
    pub fn history(&self, kind: ActivityKind) -> Option<HistoricalSeries> {
        let store = self.engine.history(kind)?;
        let series = lock(&store).series().clone();
        Some(series)
    }

    /// empty the series, remove the file and drop the open window
    pub async fn clear_history(&self, kind: ActivityKind) -> Result<(), PersistenceError> {
        let store = self.engine.history(kind).ok_or(PersistenceError::NoHistory(kind))?;
        let window = self.engine.window(kind);
        let path = lock(&store).path().to_path_buf();

        let cleared = tokio::task::spawn_blocking(move || {
            // held across the store clear so the loop cannot record in between
            let mut window = window.as_ref().map(|w| lock(w));
            if let Some(window) = window.as_mut() {
                window.reset();
            }
            let mut store = lock(&store);
            store.clear()
        })
        .await
        .unwrap_or_else(|e| Err(PersistenceError::io(path, std::io::Error::other(e.to_string()))));
        if cleared.is_ok() {
            info!(activity = %kind, "history cleared");
        }
        cleared
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{MonitorConfig, ProbePolicy};
    use crate::domain::{Measurement, Reading};
    use crate::error::ReadError;
    use crate::sensors::SensorDevice;
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    type EventLog = Arc<Mutex<Vec<String>>>;

    struct LoggingDevice {
        kind: ActivityKind,
        log: EventLog,
    }

    impl SensorDevice for LoggingDevice {
        fn name(&self) -> &'static str {
            self.kind.name()
        }
        fn open(&mut self) -> Result<(), InitError> {
            self.log.lock().unwrap().push(format!("open {}", self.kind));
            Ok(())
        }
        fn read(&mut self) -> Result<Option<Reading>, ReadError> {
            let measurement = match self.kind {
                ActivityKind::Hazard => Measurement::Gas { level: 250 },
                _ => Measurement::Distance { cm: 40.0 },
            };
            Ok(Some(Reading::new(vec![measurement], Local::now())))
        }
        fn apply(&mut self, outputs: &ActuatorState) -> Result<(), ReadError> {
            if *outputs == ActuatorState::OFF {
                self.log.lock().unwrap().push(format!("off {}", self.kind));
            }
            Ok(())
        }
        fn close(&mut self) {
            self.log.lock().unwrap().push(format!("close {}", self.kind));
        }
    }

    struct LoggingFactory {
        log: EventLog,
        /// noted on every build so the test can see what was on disk by then
        distance_history: PathBuf,
    }

    impl DeviceFactory for LoggingFactory {
        fn build(&self, kind: ActivityKind) -> Result<Box<dyn SensorDevice>, InitError> {
            if kind == ActivityKind::Location {
                return Err(InitError::Unavailable(kind));
            }
            let saved = std::fs::read_to_string(&self.distance_history).unwrap_or_default();
            self.log
                .lock()
                .unwrap()
                .push(format!("build {} (distance points on disk: {})", kind, saved.contains("40.0")));
            Ok(Box::new(LoggingDevice { kind, log: self.log.clone() }))
        }
    }

    fn fast_monitor() -> MonitorConfig {
        MonitorConfig {
            poll_interval_ms: 10,
            probe_backoff_ms: 0,
            probe_policy: ProbePolicy::Strict,
            ..MonitorConfig::default()
        }
    }

    fn config_in(dir: &tempfile::TempDir) -> EngineConfig {
        let mut config = EngineConfig::default();
        config.climate.history.path = dir.path().join("climate.json");
        config.distance.history.path = dir.path().join("distance.json");
        config.hazard.history.path = dir.path().join("hazard.json");
        config.distance.monitor = fast_monitor();
        config.hazard.monitor = fast_monitor();
        config
    }

    fn setup() -> (tempfile::TempDir, Switchboard, EventLog) {
        let dir = tempfile::tempdir().unwrap();
        let config = config_in(&dir);
        setup_with(dir, config)
    }

    fn setup_with(dir: tempfile::TempDir, config: EngineConfig) -> (tempfile::TempDir, Switchboard, EventLog) {
        let log: EventLog = Arc::new(Mutex::new(Vec::new()));
        let factory = LoggingFactory { log: log.clone(), distance_history: config.distance.history.path.clone() };
        (dir, Switchboard::new(config, Arc::new(factory)), log)
    }

    fn position(log: &EventLog, event: &str) -> usize {
        let log = log.lock().unwrap();
        log.iter().position(|e| e == event).unwrap_or_else(|| panic!("{} missing from {:?}", event, log))
    }

    #[tokio::test]
    async fn test_switch_fully_stops_previous_activity_first() {
        let (_dir, board, log) = setup();

        board.start_activity(ActivityKind::Distance).await.unwrap();
        assert_eq!(board.status(), SlotPhase::Running(ActivityKind::Distance));
        tokio::time::sleep(Duration::from_millis(50)).await;

        board.start_activity(ActivityKind::Hazard).await.unwrap();
        assert_eq!(board.status(), SlotPhase::Running(ActivityKind::Hazard));

        let off = position(&log, "off distance");
        let close = position(&log, "close distance");
        let build_b = position(&log, "build hazard (distance points on disk: true)");
        let open_b = position(&log, "open hazard");
        assert!(off < close && close < build_b && build_b < open_b);

        let distance = board.history(ActivityKind::Distance).unwrap();
        assert_eq!(distance.column("avg_distance").unwrap(), &[Some(40.0)]);
        assert_eq!(board.latest_reading(ActivityKind::Distance).await.state, PollState::Stopped);

        board.shutdown().await;
        assert_eq!(board.status(), SlotPhase::Idle);
        assert!(log.lock().unwrap().contains(&"close hazard".to_string()));
    }

    #[tokio::test]
    async fn test_start_same_activity_is_noop() {
        let (_dir, board, log) = setup();
        board.start_activity(ActivityKind::Distance).await.unwrap();
        board.start_activity(ActivityKind::Distance).await.unwrap();

        let opens = log.lock().unwrap().iter().filter(|e| *e == "open distance").count();
        assert_eq!(opens, 1);
        board.shutdown().await;
    }

    #[tokio::test]
    async fn test_failed_start_leaves_slot_idle() {
        let (_dir, board, _log) = setup();
        let result = board.start_activity(ActivityKind::Location).await;

        assert!(matches!(result, Err(InitError::Unavailable(ActivityKind::Location))));
        assert_eq!(board.status(), SlotPhase::Idle);
        assert_eq!(board.active_activity().await, None);
        let latest = board.latest_reading(ActivityKind::Location).await;
        assert!(latest.error);
        assert_eq!(latest.state, PollState::Stopped);
    }

    #[tokio::test]
    async fn test_stop_other_activity_is_noop() {
        let (_dir, board, _log) = setup();
        board.start_activity(ActivityKind::Hazard).await.unwrap();

        assert!(!board.stop_activity(ActivityKind::Distance).await);
        assert_eq!(board.active_activity().await, Some(ActivityKind::Hazard));

        tokio::time::sleep(Duration::from_millis(30)).await;
        let latest = board.latest_reading(ActivityKind::Hazard).await;
        assert!(!latest.error);
        assert!(!latest.stale);
        // gas 250 is over the default threshold
        assert!(latest.actuators.red_led && latest.actuators.buzzer);

        assert!(board.stop_activity(ActivityKind::Hazard).await);
        let latest = board.latest_reading(ActivityKind::Hazard).await;
        assert_eq!(latest.state, PollState::Stopped);
        assert_eq!(latest.actuators, ActuatorState::OFF);
        assert!(!board.stop_activity(ActivityKind::Hazard).await);
    }

    #[tokio::test]
    async fn test_clear_history() {
        let (dir, board, _log) = setup();
        board.start_activity(ActivityKind::Distance).await.unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        board.stop_activity(ActivityKind::Distance).await;
        assert!(dir.path().join("distance.json").exists());

        board.clear_history(ActivityKind::Distance).await.unwrap();
        assert!(!dir.path().join("distance.json").exists());
        assert!(board.history(ActivityKind::Distance).unwrap().is_empty());

        assert!(matches!(
            board.clear_history(ActivityKind::Location).await,
            Err(PersistenceError::NoHistory(ActivityKind::Location))
        ));
        assert!(board.history(ActivityKind::Location).is_none());
    }

    #[tokio::test]
    async fn test_clear_then_stop_discards_open_window() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = config_in(&dir);
        config.distance.monitor.poll_interval_ms = 300;
        let (dir, board, _log) = setup_with(dir, config);

        board.start_activity(ActivityKind::Distance).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        board.clear_history(ActivityKind::Distance).await.unwrap();
        board.stop_activity(ActivityKind::Distance).await;

        let series = board.history(ActivityKind::Distance).unwrap();
        assert!(series.is_empty(), "pre-clear samples came back: {:?}", series.labels);
        let on_disk = HistoryStore::open(dir.path().join("distance.json"), vec!["distance".into()], 10);
        assert!(on_disk.series().is_empty());
    }

    /// answers two polls, then fails; reopening hangs for a while
    struct SlowReopen {
        opens: AtomicUsize,
        reads: AtomicUsize,
    }

    impl SensorDevice for SlowReopen {
        fn name(&self) -> &'static str {
            "slow-reopen"
        }
        fn open(&mut self) -> Result<(), InitError> {
            if self.opens.fetch_add(1, Ordering::SeqCst) > 0 {
                std::thread::sleep(Duration::from_millis(1500));
            }
            Ok(())
        }
        fn read(&mut self) -> Result<Option<Reading>, ReadError> {
            // probe + two polls
            if self.reads.fetch_add(1, Ordering::SeqCst) < 3 {
                Ok(Some(Reading::new(vec![Measurement::Distance { cm: 40.0 }], Local::now())))
            } else {
                Err(ReadError::Timeout("rising"))
            }
        }
        fn apply(&mut self, _outputs: &ActuatorState) -> Result<(), ReadError> {
            Ok(())
        }
        fn close(&mut self) {}
    }

    struct SingleDevice(Mutex<Option<Box<dyn SensorDevice>>>);

    impl DeviceFactory for SingleDevice {
        fn build(&self, kind: ActivityKind) -> Result<Box<dyn SensorDevice>, InitError> {
            self.0.lock().unwrap().take().ok_or(InitError::Unavailable(kind))
        }
    }

    #[tokio::test]
    async fn test_stop_during_slow_reinit_keeps_window() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = config_in(&dir);
        config.distance.monitor.fault_threshold = 1;
        config.engine.stop_grace_ms = 200;
        let device: Box<dyn SensorDevice> =
            Box::new(SlowReopen { opens: AtomicUsize::new(0), reads: AtomicUsize::new(0) });
        let factory = SingleDevice(Mutex::new(Some(device)));
        let board = Switchboard::new(config, Arc::new(factory));

        board.start_activity(ActivityKind::Distance).await.unwrap();
        // two good polls, then the third read trips the reinit
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(board.stop_activity(ActivityKind::Distance).await);

        let series = board.history(ActivityKind::Distance).unwrap();
        assert_eq!(series.column("avg_distance").unwrap(), &[Some(40.0)]);
        assert!(dir.path().join("distance.json").exists());
        assert_eq!(board.status(), SlotPhase::Idle);
    }
}
