//! Sampling controller: decides when a measurement run is done.
//!
//! The controller polls a running measurement source on a fixed tick and
//! ends the session on the first of three signals: the source's own
//! running flag going false (authoritative), the sampled numbers holding
//! bit-identical for a configured number of consecutive ticks (the
//! source may keep reporting "running" long after its aggregate has
//! converged), or an absolute tick ceiling once upload activity has been
//! seen (a safety valve against a source that never stops on its own).
//!
//! Every stop path funnels through one idempotent finish, so the racing
//! signals cannot double-tear-down, and disposal cancels the poll task
//! on paths where no finish ever happens.

use crate::consumer::{Snapshot, SnapshotConsumer};
use crate::slot::EventSlot;
use crate::source::{MeasurementSource, Sample};
use log::{debug, info};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};

/// Default poll period.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Default number of consecutive identical samples that end a session.
pub const DEFAULT_STABILITY_THRESHOLD: u32 = 14;

/// Default tick ceiling once upload activity has been seen
/// (150 ticks at 500 ms is about 75 seconds of polling).
pub const DEFAULT_MAX_TICKS: u32 = 150;

/// Configuration for the sampling controller.
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    /// Fixed poll period.
    pub poll_interval: Duration,
    /// Consecutive identical ticks (download/upload/latency equal and
    /// positive) after which the session is considered converged.
    pub stability_threshold: u32,
    /// Tick ceiling; only ticks with positive upload count toward it,
    /// and the count resets whenever upload drops back to zero.
    pub max_ticks: u32,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            poll_interval: DEFAULT_POLL_INTERVAL,
            stability_threshold: DEFAULT_STABILITY_THRESHOLD,
            max_ticks: DEFAULT_MAX_TICKS,
        }
    }
}

/// How a session reached its final state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionOutcome {
    /// The source itself reported it was no longer running.
    SourceStopped,
    /// The sampled numbers held identical for the stability threshold.
    Stabilized,
    /// The tick ceiling was reached with upload activity present.
    StallForced,
}

impl SessionOutcome {
    /// Short machine-readable label for reports.
    pub fn label(&self) -> &'static str {
        match self {
            SessionOutcome::SourceStopped => "engine-stopped",
            SessionOutcome::Stabilized => "stabilized",
            SessionOutcome::StallForced => "time-capped",
        }
    }
}

/// The controller's working state for one session.
///
/// Owned exclusively by the poll loop; everyone else sees copies.
#[derive(Debug, Clone)]
struct SessionState {
    running: bool,
    finished: bool,
    latest: Sample,
    previous: Sample,
    unchanged_ticks: u32,
    ticks: u32,
    seq: u64,
    outcome: Option<SessionOutcome>,
}

impl SessionState {
    fn new() -> Self {
        Self {
            running: false,
            finished: false,
            latest: Sample::default(),
            previous: Sample::default(),
            unchanged_ticks: 0,
            ticks: 0,
            seq: 0,
            outcome: None,
        }
    }

    fn snapshot(&self) -> Snapshot {
        Snapshot {
            download_bps: self.latest.download_bps,
            upload_bps: self.latest.upload_bps,
            latency_ms: self.latest.latency_ms,
            jitter_ms: self.latest.jitter_ms,
            running: self.running,
            finished: self.finished,
            seq: self.seq,
        }
    }
}

struct SessionShared {
    state: Mutex<SessionState>,
    finished_tx: watch::Sender<bool>,
    /// Set exactly once, by whichever stop path wins.
    stopped: AtomicBool,
    task: Mutex<Option<JoinHandle<()>>>,
    /// The authoritative final snapshot, held until consumed.
    result: EventSlot<Snapshot>,
}

impl SessionShared {
    fn lock_state(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Handle to a session: read-only snapshots plus teardown.
///
/// Clones refer to the same session.
#[derive(Clone)]
pub struct SessionHandle {
    shared: Arc<SessionShared>,
    finished_rx: watch::Receiver<bool>,
}

impl SessionHandle {
    /// Copy of the current state, taken under one lock acquisition.
    pub fn snapshot(&self) -> Snapshot {
        self.shared.lock_state().snapshot()
    }

    /// Whether the session has reached its final state.
    pub fn is_finished(&self) -> bool {
        *self.finished_rx.borrow()
    }

    /// Whether the session is still polling. False once finished or
    /// disposed.
    pub fn is_active(&self) -> bool {
        !self.shared.stopped.load(Ordering::SeqCst)
    }

    /// How the session ended, if it has.
    pub fn outcome(&self) -> Option<SessionOutcome> {
        self.shared.lock_state().outcome
    }

    /// Wait until the session finishes. Returns immediately if it
    /// already has. A disposed session never finishes; callers that can
    /// dispose should race this against their own signal.
    pub async fn wait_finished(&self) {
        let mut rx = self.finished_rx.clone();
        while !*rx.borrow_and_update() {
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    /// Consume the final snapshot. Present only after the session
    /// finished, and only once.
    pub fn take_result(&self) -> Option<Snapshot> {
        self.shared.result.take()
    }

    /// Tear the session down: cancel the poll task and stop all state
    /// updates. Idempotent, and a no-op on a finished session.
    pub fn dispose(&self) {
        if self.shared.stopped.swap(true, Ordering::SeqCst) {
            return;
        }

        if let Some(task) = self
            .shared
            .task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            task.abort();
        }

        let mut state = self.shared.lock_state();
        state.running = false;
        debug!("session disposed; poll loop cancelled");
    }
}

/// Owns session lifecycles: at most one session is active at a time.
pub struct SamplingController {
    config: ControllerConfig,
    active: Option<SessionHandle>,
}

impl SamplingController {
    /// Create a controller with the given configuration.
    pub fn new(config: ControllerConfig) -> Self {
        Self { config, active: None }
    }

    /// Start a measurement session.
    ///
    /// If a session is already active the call is ignored and the
    /// existing handle is returned: the source is not started again and
    /// no second poll task is created. A fresh session resets all
    /// working state, starts the source, and begins polling.
    pub fn start_session(
        &mut self,
        source: Arc<dyn MeasurementSource>,
        consumer: Arc<dyn SnapshotConsumer>,
    ) -> SessionHandle {
        if let Some(handle) = &self.active {
            if handle.is_active() {
                info!("start ignored: a session is already active");
                return handle.clone();
            }
        }

        let (finished_tx, finished_rx) = watch::channel(false);
        let shared = Arc::new(SessionShared {
            state: Mutex::new(SessionState::new()),
            finished_tx,
            stopped: AtomicBool::new(false),
            task: Mutex::new(None),
            result: EventSlot::new(),
        });

        source.start();
        let running_rx = source.running();

        {
            let mut state = shared.lock_state();
            state.running = true;
        }

        let task = tokio::spawn(poll_loop(
            Arc::clone(&shared),
            source,
            consumer,
            self.config.clone(),
            running_rx,
        ));
        *shared.task.lock().unwrap_or_else(PoisonError::into_inner) =
            Some(task);

        let handle = SessionHandle { shared, finished_rx };
        self.active = Some(handle.clone());
        handle
    }
}

impl Drop for SamplingController {
    /// Tear down any in-flight session when the controller goes away,
    /// so an abandoned controller cannot leak a ticking poll task.
    fn drop(&mut self) {
        if let Some(handle) = &self.active {
            if handle.is_active() {
                handle.dispose();
            }
        }
    }
}

enum TickFlow {
    Continue,
    Finish(SessionOutcome),
    Cancelled,
}

async fn poll_loop(
    shared: Arc<SessionShared>,
    source: Arc<dyn MeasurementSource>,
    consumer: Arc<dyn SnapshotConsumer>,
    config: ControllerConfig,
    mut running_rx: watch::Receiver<bool>,
) {
    // The source may already have finished by the time polling begins.
    if !*running_rx.borrow_and_update() {
        finish(&shared, &*source, &*consumer, SessionOutcome::SourceStopped);
        return;
    }

    let mut ticker = interval_at(
        Instant::now() + config.poll_interval,
        config.poll_interval,
    );
    // A slow aggregate read must not cause a burst of catch-up ticks.
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            changed = running_rx.changed() => {
                let source_stopped = match changed {
                    Ok(()) => !*running_rx.borrow_and_update(),
                    Err(_) => true,
                };
                if source_stopped {
                    finish(
                        &shared,
                        &*source,
                        &*consumer,
                        SessionOutcome::SourceStopped,
                    );
                    return;
                }
            }
            _ = ticker.tick() => {
                match on_tick(&shared, &*source, &*consumer, &config) {
                    TickFlow::Continue => {}
                    TickFlow::Finish(outcome) => {
                        finish(&shared, &*source, &*consumer, outcome);
                        return;
                    }
                    TickFlow::Cancelled => return,
                }
            }
        }
    }
}

/// One poll: read the aggregate, update state, evaluate termination.
fn on_tick(
    shared: &SessionShared,
    source: &dyn MeasurementSource,
    consumer: &dyn SnapshotConsumer,
    config: &ControllerConfig,
) -> TickFlow {
    let sample = source.sample();

    let (snapshot, outcome) = {
        let mut state = shared.lock_state();
        if shared.stopped.load(Ordering::SeqCst) {
            return TickFlow::Cancelled;
        }

        state.seq += 1;
        // The consumer sees in-progress numbers before any termination.
        state.latest = sample;
        state.ticks += 1;

        let mut outcome = None;

        if state.ticks >= config.max_ticks && sample.upload_bps > 0.0 {
            outcome = Some(SessionOutcome::StallForced);
        } else if sample.upload_bps <= 0.0 {
            // The source regressed to a pre-upload phase; only sustained
            // upload activity counts toward the ceiling.
            state.ticks = 0;
        }

        let stable = sample.download_bps == state.previous.download_bps
            && sample.upload_bps == state.previous.upload_bps
            && sample.latency_ms == state.previous.latency_ms
            && sample.download_bps > 0.0
            && sample.upload_bps > 0.0
            && sample.latency_ms > 0.0;

        if stable {
            state.unchanged_ticks += 1;
            if state.unchanged_ticks >= config.stability_threshold
                && outcome.is_none()
            {
                outcome = Some(SessionOutcome::Stabilized);
            }
        } else {
            state.unchanged_ticks = 0;
        }
        state.previous = sample;

        debug!(
            "tick {} seq {}: down={:.0} up={:.0} latency={:.1} unchanged={}/{}",
            state.ticks,
            state.seq,
            sample.download_bps,
            sample.upload_bps,
            sample.latency_ms,
            state.unchanged_ticks,
            config.stability_threshold
        );

        (state.snapshot(), outcome)
    };

    consumer.on_snapshot(snapshot);

    match outcome {
        Some(outcome) => TickFlow::Finish(outcome),
        None => TickFlow::Continue,
    }
}

/// Mark the session finished. Exactly one caller wins; the rest no-op.
fn finish(
    shared: &SessionShared,
    source: &dyn MeasurementSource,
    consumer: &dyn SnapshotConsumer,
    outcome: SessionOutcome,
) {
    if shared.stopped.swap(true, Ordering::SeqCst) {
        return;
    }

    let snapshot = {
        let mut state = shared.lock_state();
        state.seq += 1;
        // Capture the source's final aggregate: a one-shot engine may
        // publish its result in the gap since the last tick.
        state.latest = source.sample();
        state.previous = state.latest;
        state.running = false;
        state.finished = true;
        state.outcome = Some(outcome);
        state.snapshot()
    };

    shared.result.store(snapshot);
    consumer.on_snapshot(snapshot);
    let _ = shared.finished_tx.send(true);

    match outcome {
        SessionOutcome::SourceStopped => {
            info!("session finished: source reported not running");
        }
        SessionOutcome::Stabilized => {
            info!("session finished: sample held stable");
        }
        SessionOutcome::StallForced => {
            info!("session finished: tick ceiling reached with upload active");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consumer::NullConsumer;
    use std::sync::atomic::AtomicU32;
    use tokio::time::{advance, sleep};

    /// Source stub producing a scripted sample per read.
    struct ScriptedSource {
        start_calls: AtomicU32,
        reads: AtomicU32,
        started: AtomicBool,
        running_tx: watch::Sender<bool>,
        script: Box<dyn Fn(u32) -> Sample + Send + Sync>,
    }

    impl ScriptedSource {
        fn new(script: impl Fn(u32) -> Sample + Send + Sync + 'static) -> Self {
            let (running_tx, _) = watch::channel(false);
            Self {
                start_calls: AtomicU32::new(0),
                reads: AtomicU32::new(0),
                started: AtomicBool::new(false),
                running_tx,
                script: Box::new(script),
            }
        }

        fn start_calls(&self) -> u32 {
            self.start_calls.load(Ordering::SeqCst)
        }

        fn reads(&self) -> u32 {
            self.reads.load(Ordering::SeqCst)
        }

        fn stop(&self) {
            self.running_tx.send_replace(false);
        }
    }

    impl MeasurementSource for ScriptedSource {
        fn start(&self) {
            self.start_calls.fetch_add(1, Ordering::SeqCst);
            if self.started.swap(true, Ordering::SeqCst) {
                return;
            }
            self.running_tx.send_replace(true);
        }

        fn sample(&self) -> Sample {
            let read = self.reads.fetch_add(1, Ordering::SeqCst);
            (self.script)(read)
        }

        fn running(&self) -> watch::Receiver<bool> {
            self.running_tx.subscribe()
        }
    }

    fn steady_sample(_read: u32) -> Sample {
        Sample {
            download_bps: 50_000_000.0,
            upload_bps: 10_000_000.0,
            latency_ms: 12.0,
            jitter_ms: 2.0,
        }
    }

    fn test_config() -> ControllerConfig {
        ControllerConfig {
            poll_interval: Duration::from_millis(500),
            stability_threshold: 14,
            max_ticks: 150,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_stability_terminates_at_threshold() {
        let source = Arc::new(ScriptedSource::new(steady_sample));
        let mut controller = SamplingController::new(test_config());

        let handle = controller
            .start_session(source.clone(), Arc::new(NullConsumer));
        handle.wait_finished().await;

        assert_eq!(handle.outcome(), Some(SessionOutcome::Stabilized));
        // Tick 1 seeds the comparison; ticks 2..=15 are the 14 identical
        // ones. The final read in finish() adds one more.
        assert_eq!(source.reads(), 16);

        let result = handle.take_result().unwrap();
        assert!(result.finished);
        assert!(!result.running);
        assert_eq!(result.download_bps, 50_000_000.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stability_requires_positive_values() {
        // Identical every tick, but upload never starts: the session
        // must not stabilize (nor hit the ceiling, which is
        // upload-gated too).
        let source = Arc::new(ScriptedSource::new(|_| Sample {
            download_bps: 50_000_000.0,
            upload_bps: 0.0,
            latency_ms: 12.0,
            jitter_ms: 2.0,
        }));
        let mut controller = SamplingController::new(test_config());

        let handle = controller
            .start_session(source.clone(), Arc::new(NullConsumer));

        // Well past both thresholds.
        sleep(Duration::from_secs(120)).await;
        assert!(!handle.is_finished());

        handle.dispose();
    }

    #[tokio::test(start_paused = true)]
    async fn test_hard_cap_terminates_unstable_session() {
        // Upload active from the first tick, but download changes on
        // every read, so stability never fires.
        let source = Arc::new(ScriptedSource::new(|read| Sample {
            download_bps: 50_000_000.0 + read as f64,
            upload_bps: 10_000_000.0,
            latency_ms: 12.0,
            jitter_ms: 2.0,
        }));
        let mut controller = SamplingController::new(test_config());

        let handle = controller
            .start_session(source.clone(), Arc::new(NullConsumer));
        handle.wait_finished().await;

        assert_eq!(handle.outcome(), Some(SessionOutcome::StallForced));
        // 150 polled ticks plus the final read in finish().
        assert_eq!(source.reads(), 151);
    }

    #[tokio::test(start_paused = true)]
    async fn test_upload_dropout_resets_hard_cap() {
        // Upload positive for 100 ticks, gone for 1, then positive
        // again: the ceiling counter restarts, so the combined
        // sequence must still be running at tick 150 and beyond.
        let source = Arc::new(ScriptedSource::new(|read| Sample {
            download_bps: 50_000_000.0 + read as f64,
            upload_bps: if read == 100 { 0.0 } else { 10_000_000.0 },
            latency_ms: 12.0,
            jitter_ms: 2.0,
        }));
        let mut controller = SamplingController::new(test_config());

        let handle = controller
            .start_session(source.clone(), Arc::new(NullConsumer));

        // 180 ticks at 500 ms: past 150 combined, short of 100 + 150.
        sleep(Duration::from_millis(500 * 180 + 250)).await;
        assert!(!handle.is_finished());

        // Another 75 ticks put the post-dropout count over the ceiling.
        handle.wait_finished().await;
        assert_eq!(handle.outcome(), Some(SessionOutcome::StallForced));
        // Dropout at read 100 resets the counter; 150 more ticks follow,
        // then the final read in finish().
        assert_eq!(source.reads(), 252);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reentrant_start_is_ignored() {
        let source = Arc::new(ScriptedSource::new(steady_sample));
        let mut controller = SamplingController::new(test_config());

        let first = controller
            .start_session(source.clone(), Arc::new(NullConsumer));
        let second = controller
            .start_session(source.clone(), Arc::new(NullConsumer));

        assert_eq!(source.start_calls(), 1);
        assert!(Arc::ptr_eq(&first.shared, &second.shared));

        first.dispose();
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_after_finish_creates_fresh_session() {
        let source = Arc::new(ScriptedSource::new(steady_sample));
        let mut controller = SamplingController::new(test_config());

        let first = controller
            .start_session(source.clone(), Arc::new(NullConsumer));
        first.wait_finished().await;

        // ScriptedSource keeps its running flag up after stabilization,
        // mirroring an engine that never stops on its own; a second
        // session can still be started.
        let second = controller
            .start_session(source.clone(), Arc::new(NullConsumer));

        assert!(!Arc::ptr_eq(&first.shared, &second.shared));
        assert!(!second.is_finished());
        assert_eq!(second.snapshot().seq, 0);

        second.dispose();
    }

    #[tokio::test(start_paused = true)]
    async fn test_dispose_cancels_polling() {
        let source = Arc::new(ScriptedSource::new(steady_sample));
        let mut controller = SamplingController::new(test_config());

        let handle = controller
            .start_session(source.clone(), Arc::new(NullConsumer));

        // Let a few ticks land, then tear down.
        sleep(Duration::from_millis(1600)).await;
        let seq_before = handle.snapshot().seq;
        assert!(seq_before > 0);

        handle.dispose();
        let reads_before = source.reads();

        // Advance well past several poll periods: no reads, no updates.
        advance(Duration::from_secs(10)).await;
        tokio::task::yield_now().await;

        assert_eq!(source.reads(), reads_before);
        assert_eq!(handle.snapshot().seq, seq_before);
        assert!(!handle.is_finished());
        assert!(!handle.is_active());

        // Disposal is idempotent.
        handle.dispose();
    }

    #[tokio::test(start_paused = true)]
    async fn test_source_stop_is_authoritative() {
        let source = Arc::new(ScriptedSource::new(steady_sample));
        let mut controller = SamplingController::new(test_config());

        let handle = controller
            .start_session(source.clone(), Arc::new(NullConsumer));

        // A couple of ticks in, the engine decides it is done.
        sleep(Duration::from_millis(1100)).await;
        source.stop();
        handle.wait_finished().await;

        assert_eq!(handle.outcome(), Some(SessionOutcome::SourceStopped));
        let result = handle.take_result().unwrap();
        // The final aggregate was re-read at finish time.
        assert_eq!(result.download_bps, 50_000_000.0);
        assert!(result.finished);
    }

    #[tokio::test(start_paused = true)]
    async fn test_source_already_stopped_finishes_immediately() {
        // The engine publishes its jump and stops before the first tick.
        let source = Arc::new(ScriptedSource::new(steady_sample));
        let mut controller = SamplingController::new(test_config());

        source.start();
        source.stop();

        let handle = controller
            .start_session(source.clone(), Arc::new(NullConsumer));
        handle.wait_finished().await;

        assert_eq!(handle.outcome(), Some(SessionOutcome::SourceStopped));
        assert!(handle.take_result().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_snapshot_seq_is_monotonic() {
        let source = Arc::new(ScriptedSource::new(steady_sample));
        let mut controller = SamplingController::new(test_config());

        let handle = controller
            .start_session(source.clone(), Arc::new(NullConsumer));

        let mut last_seq = 0;
        for _ in 0..5 {
            sleep(Duration::from_millis(500)).await;
            let snapshot = handle.snapshot();
            assert!(snapshot.seq >= last_seq);
            last_seq = snapshot.seq;
        }

        handle.dispose();
    }

    #[tokio::test(start_paused = true)]
    async fn test_consumer_sees_final_snapshot() {
        struct Recorder {
            last: Mutex<Option<Snapshot>>,
        }
        impl SnapshotConsumer for Recorder {
            fn on_snapshot(&self, snapshot: Snapshot) {
                *self.last.lock().unwrap() = Some(snapshot);
            }
        }

        let source = Arc::new(ScriptedSource::new(steady_sample));
        let recorder = Arc::new(Recorder { last: Mutex::new(None) });
        let mut controller = SamplingController::new(test_config());

        let handle =
            controller.start_session(source.clone(), recorder.clone());
        handle.wait_finished().await;

        let last = recorder.last.lock().unwrap().unwrap();
        assert!(last.finished);
        assert!(!last.running);
    }
}
