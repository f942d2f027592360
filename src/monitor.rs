//! ==============================================================================
//! monitor.rs - polling loop / fault monitor
//! ==============================================================================
//!
//! purpose:
//!     one PollLoop runs per active activity. every tick it reads the session,
//!     publishes the whole LatestReading snapshot, feeds the aggregation
//!     buffer and drives the actuator policy.
//!
//! fault handling:
//!     consecutive read failures are counted. when the count reaches the
//!     configured threshold the session is re-acquired once and the counter
//!     goes back to 0 whatever the outcome. there is no other retry: the loop
//!     always sleeps its interval, also after an error.
//!
//! cancellation:
//!     a watch channel carries the stop flag. it is checked before every tick
//!     and the sleep between ticks is raced against it; the session's probe
//!     backoff watches it too. outputs are forced OFF by the switchboard when
//!     it releases the session afterwards.
//!
//! open window:
//!     the aggregation buffer lives in EngineState, not in the task. a stop
//!     that has to abort the task can still flush it, and a history clear
//!     drops it under the same lock the loop records through.
//!
//! relationships:
//!     - uses: session.rs, aggregate.rs, history.rs, actuator.rs
//!     - spawned by: switchboard.rs (which also owns EngineState)
//!
//! ==============================================================================

use chrono::{DateTime, Local};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::actuator::{ActuatorPolicy, ActuatorState};
use crate::aggregate::AggregationBuffer;
use crate::config::{EngineConfig, MonitorConfig};
use crate::domain::{ActivityKind, LatestReading, PollState, Reading};
use crate::error::{InitError, ReadError};
use crate::hal::lock;
use crate::history::HistoryStore;
use crate::session::HardwareSession;
use crate::switchboard::EngineState;

/// consecutive read failures of one activity
#[derive(Debug)]
pub struct FaultCounter {
    consecutive: u32,
    threshold: u32,
}

impl FaultCounter {
    pub fn new(threshold: u32) -> Self {
        Self { consecutive: 0, threshold: threshold.max(1) }
    }

    /// count one failure; true when the reinit threshold is reached
    pub fn record_failure(&mut self) -> bool {
        self.consecutive += 1;
        self.consecutive >= self.threshold
    }

    pub fn reset(&mut self) {
        self.consecutive = 0;
    }

    pub fn count(&self) -> u32 {
        self.consecutive
    }
}

pub struct PollLoop {
    kind: ActivityKind,
    session: Arc<Mutex<HardwareSession>>,
    engine: Arc<EngineState>,
    monitor: MonitorConfig,
    window: Option<Arc<Mutex<AggregationBuffer>>>,
    history: Option<Arc<Mutex<HistoryStore>>>,
    policy: ActuatorPolicy,
    faults: FaultCounter,
    snapshot: LatestReading,
    show_sensor_data: bool,
}

impl PollLoop {
    pub fn new(
        kind: ActivityKind,
        session: Arc<Mutex<HardwareSession>>,
        engine: Arc<EngineState>,
        config: &EngineConfig,
        degraded: bool,
    ) -> Self {
        let monitor = config.monitor(kind).clone();
        // every run starts with a fresh window
        let window = engine.window(kind);
        if let Some(window) = &window {
            lock(window).reset();
        }

        let mut snapshot = LatestReading::empty(kind);
        snapshot.state = if degraded { PollState::Degraded } else { PollState::Polling };

        Self {
            kind,
            history: engine.history(kind),
            session,
            engine,
            faults: FaultCounter::new(monitor.fault_threshold),
            monitor,
            window,
            policy: ActuatorPolicy::for_activity(kind, config),
            snapshot,
            show_sensor_data: config.logging.show_sensor_data,
        }
    }

    /// poll until stopped. the open window is left for the stop sequence.
    pub async fn run(mut self, mut stop: watch::Receiver<bool>) {
        info!(activity = %self.kind, interval_ms = self.monitor.poll_interval_ms, "polling started");
        self.engine.publish(self.snapshot.clone()).await;

        while !*stop.borrow() {
            let wait = self.tick().await;
            tokio::select! {
                _ = tokio::time::sleep(wait) => {}
                changed = stop.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }

        info!(activity = %self.kind, "polling stopped");
    }

    /// one poll; returns how long to wait before the next one
    pub async fn tick(&mut self) -> Duration {
        let session = Arc::clone(&self.session);
        let result = tokio::task::spawn_blocking(move || lock(&session).read())
            .await
            .unwrap_or_else(|e| Err(ReadError::DeviceBusy(format!("read task failed: {}", e))));

        let now = Local::now();
        match result {
            Ok(Some(reading)) => self.on_reading(reading, now).await,
            Ok(None) => {
                debug!(activity = %self.kind, "sensor not ready");
                self.monitor.poll_interval()
            }
            Err(e) => {
                self.on_failure(e, now).await;
                self.monitor.poll_interval()
            }
        }
    }

    async fn on_reading(&mut self, reading: Reading, now: DateTime<Local>) -> Duration {
        self.faults.reset();

        if self.show_sensor_data {
            info!(activity = %self.kind, valid = reading.valid, "{:?}", reading.measurements);
        } else {
            debug!(activity = %self.kind, valid = reading.valid, "{:?}", reading.measurements);
        }

        let actuation = self.policy.evaluate(&reading);
        let wait = actuation.pulse.and_then(|p| p.then_wait).unwrap_or(self.monitor.poll_interval());

        if self.snapshot.state == PollState::Degraded {
            info!(activity = %self.kind, "sensor recovered");
        }
        self.snapshot = LatestReading {
            state: PollState::Polling,
            reading: Some(reading.clone()),
            error: false,
            last_error: None,
            actuators: actuation.reported(),
            updated_at: Some(now),
            last_success: Some(now),
            ..LatestReading::empty(self.kind)
        };
        self.engine.publish(self.snapshot.clone()).await;
        self.aggregate(reading, now).await;

        let session = Arc::clone(&self.session);
        let applied = tokio::task::spawn_blocking(move || {
            let mut session = lock(&session);
            if let Some(pulse) = actuation.pulse {
                session.set_actuators(&ActuatorState { buzzer: true, ..actuation.outputs })?;
                std::thread::sleep(pulse.on_for);
            }
            session.set_actuators(&actuation.outputs)
        })
        .await;
        match applied {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(activity = %self.kind, "could not drive outputs: {}", e),
            Err(e) => error!(activity = %self.kind, "actuator task failed: {}", e),
        }

        wait
    }

    async fn on_failure(&mut self, e: ReadError, now: DateTime<Local>) {
        let tripped = self.faults.record_failure();
        warn!(activity = %self.kind, faults = self.faults.count(), "read failed: {}", e);

        let session = Arc::clone(&self.session);
        match tokio::task::spawn_blocking(move || lock(&session).set_actuators(&ActuatorState::OFF)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(activity = %self.kind, "could not force outputs off: {}", e),
            Err(e) => error!(activity = %self.kind, "actuator task failed: {}", e),
        }

        self.snapshot.error = true;
        self.snapshot.last_error = Some(e.to_string());
        self.snapshot.actuators = ActuatorState::OFF;
        self.snapshot.updated_at = Some(now);

        if tripped {
            self.reinit().await;
        }
        self.engine.publish(self.snapshot.clone()).await;
    }

    /// fire-and-forget re-acquire; the counter resets either way
    async fn reinit(&mut self) {
        warn!(activity = %self.kind, faults = self.faults.count(), "fault threshold reached, re-initializing");
        let session = Arc::clone(&self.session);
        let outcome = tokio::task::spawn_blocking(move || {
            let mut session = lock(&session);
            session.reacquire().map(|_| session.is_degraded())
        })
        .await;

        self.snapshot.state = match outcome {
            Ok(Ok(false)) => {
                info!(activity = %self.kind, "hardware re-initialized");
                PollState::Polling
            }
            Ok(Ok(true)) => PollState::Degraded,
            Ok(Err(InitError::Cancelled)) => {
                debug!(activity = %self.kind, "re-initialization cancelled by stop");
                self.snapshot.state
            }
            Ok(Err(e)) => {
                error!(activity = %self.kind, "re-initialization failed: {}", e);
                PollState::Degraded
            }
            Err(e) => {
                error!(activity = %self.kind, "re-initialization task failed: {}", e);
                PollState::Degraded
            }
        };
        self.faults.reset();
    }

    /// feed the open window; a closed window is recorded and saved while the
    /// window lock is held, so a concurrent clear sees all or nothing
    async fn aggregate(&self, reading: Reading, now: DateTime<Local>) {
        let Some(window) = self.window.clone() else { return };
        let history = self.history.clone();
        let saved = tokio::task::spawn_blocking(move || {
            let mut window = lock(&window);
            let point = window.add(&reading, now)?;
            let store = history?;
            let mut store = lock(&store);
            store.record(&point);
            Some(store.save())
        })
        .await;
        match saved {
            Ok(None) => {}
            Ok(Some(Ok(()))) => debug!(activity = %self.kind, "history point recorded"),
            // the in-memory series stays authoritative
            Ok(Some(Err(e))) => warn!(activity = %self.kind, "history save failed: {}", e),
            Err(e) => error!(activity = %self.kind, "history task failed: {}", e),
        }
    }
}

/// age-based retention, on its own slow timer
pub async fn run_pruner(
    kind: ActivityKind,
    store: Arc<Mutex<HistoryStore>>,
    every: Duration,
    horizon: chrono::Duration,
    mut stop: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(every);
    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            changed = stop.changed() => {
                if changed.is_err() || *stop.borrow() {
                    break;
                }
                continue;
            }
        }

        let store = Arc::clone(&store);
        let pruned = tokio::task::spawn_blocking(move || {
            let mut store = lock(&store);
            let removed = store.prune(Local::now(), horizon);
            if removed > 0 {
                store.save().map(|_| removed)
            } else {
                Ok(0)
            }
        })
        .await;
        match pruned {
            Ok(Ok(0)) => {}
            Ok(Ok(n)) => info!(activity = %kind, removed = n, "pruned old history points"),
            Ok(Err(e)) => warn!(activity = %kind, "history save after prune failed: {}", e),
            Err(e) => error!(activity = %kind, "prune task failed: {}", e),
        }
    }
    debug!(activity = %kind, "pruner stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    use crate::config::ProbePolicy;
    use crate::domain::Measurement;
    use crate::history::{HistoricalPoint, MetricSummary};
    use crate::sensors::SensorDevice;

    /// replays scripted results, then keeps failing
    struct FakeRanger {
        opens: Arc<AtomicUsize>,
        reads: Arc<Mutex<VecDeque<Result<Option<f64>, ReadError>>>>,
        buzzer: Arc<Mutex<Vec<bool>>>,
        apply_fails: Arc<AtomicBool>,
    }

    impl SensorDevice for FakeRanger {
        fn name(&self) -> &'static str {
            "fake-ranger"
        }
        fn open(&mut self) -> Result<(), InitError> {
            self.opens.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
        fn read(&mut self) -> Result<Option<Reading>, ReadError> {
            let next = self.reads.lock().unwrap().pop_front().unwrap_or(Err(ReadError::Timeout("rising")));
            next.map(|v| v.map(|cm| Reading::new(vec![Measurement::Distance { cm }], Local::now())))
        }
        fn apply(&mut self, outputs: &ActuatorState) -> Result<(), ReadError> {
            if self.apply_fails.load(Ordering::SeqCst) {
                return Err(ReadError::DeviceBusy("pin stuck".into()));
            }
            self.buzzer.lock().unwrap().push(outputs.buzzer);
            Ok(())
        }
        fn close(&mut self) {}
    }

    struct Harness {
        _dir: tempfile::TempDir,
        config: EngineConfig,
        engine: Arc<EngineState>,
        opens: Arc<AtomicUsize>,
        reads: Arc<Mutex<VecDeque<Result<Option<f64>, ReadError>>>>,
        buzzer: Arc<Mutex<Vec<bool>>>,
        apply_fails: Arc<AtomicBool>,
    }

    impl Harness {
        fn new(window_max_samples: usize) -> Self {
            let dir = tempfile::tempdir().unwrap();
            let mut config = EngineConfig::default();
            config.climate.history.path = dir.path().join("climate.json");
            config.hazard.history.path = dir.path().join("hazard.json");
            config.distance.history.path = dir.path().join("distance.json");
            config.distance.history.window_max_samples = window_max_samples;
            config.distance.monitor = MonitorConfig {
                poll_interval_ms: 10,
                probe_backoff_ms: 0,
                probe_policy: ProbePolicy::Optimistic,
                ..MonitorConfig::default()
            };
            let engine = Arc::new(EngineState::new(&config));
            Self {
                _dir: dir,
                config,
                engine,
                opens: Arc::new(AtomicUsize::new(0)),
                reads: Arc::new(Mutex::new(VecDeque::new())),
                buzzer: Arc::new(Mutex::new(Vec::new())),
                apply_fails: Arc::new(AtomicBool::new(false)),
            }
        }

        fn window_len(&self) -> usize {
            let window = self.engine.window(ActivityKind::Distance).unwrap();
            let len = lock(&window).len();
            len
        }

        fn script(&self, reads: impl IntoIterator<Item = Result<Option<f64>, ReadError>>) {
            self.reads.lock().unwrap().extend(reads);
        }

        /// acquires with one good probe read queued in front of the script
        fn poll_loop(&self) -> PollLoop {
            self.reads.lock().unwrap().push_front(Ok(Some(5.0)));
            let device = Box::new(FakeRanger {
                opens: self.opens.clone(),
                reads: self.reads.clone(),
                buzzer: self.buzzer.clone(),
                apply_fails: self.apply_fails.clone(),
            });
            let session =
                HardwareSession::acquire(ActivityKind::Distance, device, &self.config.distance.monitor).unwrap();
            PollLoop::new(
                ActivityKind::Distance,
                Arc::new(Mutex::new(session)),
                self.engine.clone(),
                &self.config,
                false,
            )
        }
    }

    #[test]
    fn test_fault_counter_threshold() {
        let mut faults = FaultCounter::new(3);
        assert!(!faults.record_failure());
        assert!(!faults.record_failure());
        assert!(faults.record_failure());
        faults.reset();
        assert_eq!(faults.count(), 0);
    }

    #[tokio::test]
    async fn test_three_failures_reinit_exactly_once() {
        let h = Harness::new(60);
        let mut poll = h.poll_loop();
        assert_eq!(h.opens.load(Ordering::SeqCst), 1);

        for _ in 0..3 {
            poll.tick().await;
        }
        assert_eq!(h.opens.load(Ordering::SeqCst), 2);
        assert_eq!(poll.faults.count(), 0);

        let latest = h.engine.latest(ActivityKind::Distance).await;
        assert!(latest.error);
        assert_eq!(latest.actuators, ActuatorState::OFF);
        // every reinit probe failed, optimistic policy keeps polling degraded
        assert_eq!(latest.state, PollState::Degraded);

        poll.tick().await;
        poll.tick().await;
        assert_eq!(h.opens.load(Ordering::SeqCst), 2);
        assert_eq!(poll.faults.count(), 2);
    }

    #[tokio::test]
    async fn test_success_resets_faults_and_publishes() {
        let h = Harness::new(60);
        h.script([Err(ReadError::OutOfRange(512.0)), Ok(Some(30.0))]);
        let mut poll = h.poll_loop();

        poll.tick().await;
        assert_eq!(poll.faults.count(), 1);

        let wait = poll.tick().await;
        assert_eq!(wait, Duration::from_millis(10));
        assert_eq!(poll.faults.count(), 0);

        let latest = h.engine.latest(ActivityKind::Distance).await;
        assert!(!latest.error);
        assert_eq!(latest.reading.unwrap().metric("distance"), Some(30.0));
        // 30 cm is past the 12 cm alert distance
        assert!(latest.actuators.buzzer);
        assert_eq!(h.buzzer.lock().unwrap().last(), Some(&true));
    }

    #[tokio::test]
    async fn test_degraded_start_recovers_on_first_success() {
        let h = Harness::new(60);
        h.script([Ok(Some(8.0))]);
        let mut poll = h.poll_loop();
        poll.snapshot.state = PollState::Degraded;

        poll.tick().await;
        assert_eq!(h.engine.latest(ActivityKind::Distance).await.state, PollState::Polling);
    }

    #[tokio::test]
    async fn test_closed_window_is_recorded_and_saved() {
        let h = Harness::new(2);
        h.script([Ok(Some(10.0)), Ok(Some(20.0))]);
        let mut poll = h.poll_loop();

        poll.tick().await;
        poll.tick().await;

        let store = h.engine.history(ActivityKind::Distance).unwrap();
        let store = lock(&store);
        assert_eq!(store.series().column("avg_distance").unwrap(), &[Some(15.0)]);
        assert_eq!(store.series().column("peak_distance").unwrap(), &[Some(20.0)]);
        assert!(store.path().exists());
    }

    #[tokio::test]
    async fn test_failed_output_reset_still_publishes_error() {
        let h = Harness::new(60);
        h.script([Err(ReadError::Timeout("falling"))]);
        let mut poll = h.poll_loop();
        h.apply_fails.store(true, Ordering::SeqCst);

        poll.tick().await;
        let latest = h.engine.latest(ActivityKind::Distance).await;
        assert!(latest.error);
        assert_eq!(latest.last_error.as_deref(), Some("timed out waiting for falling edge"));
        assert_eq!(latest.actuators, ActuatorState::OFF);
    }

    #[tokio::test]
    async fn test_open_window_lives_in_engine_state() {
        let h = Harness::new(60);
        h.script([Ok(Some(10.0)), Ok(Some(20.0))]);
        let mut poll = h.poll_loop();

        poll.tick().await;
        poll.tick().await;
        assert_eq!(h.window_len(), 2);

        // a new run of the same activity starts from an empty window
        let _next = h.poll_loop();
        assert_eq!(h.window_len(), 0);
    }

    #[tokio::test]
    async fn test_run_stops_and_leaves_window() {
        let h = Harness::new(60);
        h.script((0..1000).map(|_| Ok(Some(25.0))));
        let poll = h.poll_loop();

        let (stop_tx, stop_rx) = watch::channel(false);
        let task = tokio::spawn(poll.run(stop_rx));
        tokio::time::sleep(Duration::from_millis(60)).await;
        stop_tx.send(true).unwrap();

        tokio::time::timeout(Duration::from_secs(2), task).await.unwrap().unwrap();
        assert!(h.window_len() > 0);
        assert_eq!(h.engine.latest(ActivityKind::Distance).await.state, PollState::Polling);
    }

    #[tokio::test]
    async fn test_pruner_drops_old_points_and_stops() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("distance.json");
        let mut store = HistoryStore::open(&path, vec!["distance".to_string()], 100);
        let recent = Local::now().format(crate::history::LABEL_FORMAT).to_string();
        for label in ["2020-01-01 00:00".to_string(), recent] {
            store.record(&HistoricalPoint {
                label,
                metrics: vec![MetricSummary { name: "distance".into(), avg: 30.0, peak: 35.0 }],
            });
        }
        let store = Arc::new(Mutex::new(store));

        let (stop_tx, stop_rx) = watch::channel(false);
        let task = tokio::spawn(run_pruner(
            ActivityKind::Distance,
            Arc::clone(&store),
            Duration::from_millis(20),
            chrono::Duration::hours(24),
            stop_rx,
        ));
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert_eq!(lock(&store).series().len(), 1);
        assert!(path.exists());
        let on_disk = HistoryStore::open(&path, vec!["distance".to_string()], 100);
        assert_eq!(on_disk.series().len(), 1);

        stop_tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(1), task).await.unwrap().unwrap();
    }
}
