//! Synchronized replay worker
//!
//! Plays the test vector against the device, one cycle per delay, and records
//! what the device reports back.
//!
//! # Cycle
//!
//! For each delay `td` (an absolute offset from the start of the run):
//!
//! 1. Wait until `run_start + td`, giving up early if stopped
//! 2. Build the frame group: every signal's value at `td`, grouped by frame
//! 3. Merge heartbeat frames into the live heartbeat set and replace the
//!    scripted frame list with every other frame that has a CAN id
//! 4. Queue the heartbeat set for persisting
//! 5. Publish the TX event and capture RX on two scoped threads, then join
//!
//! Only one run is active at a time. Whatever happens during the run, the
//! results are saved exactly once afterwards and the controller becomes
//! available again.

use crate::backend::poller::DevicePoller;
use crate::backend::result_sink::ResultSink;
use crate::backend::state::EngineState;
use crate::backend::telemetry::TelemetryEvent;
use crate::backend::worker::{sleep_until, sleep_while_running};
use crate::error::Result;
use crate::types::{
    flatten_frame_group, CanId, FrameGroup, FrameValues, LiveSignals, SignalTimeSeries,
    UserSendEntry,
};
use std::collections::BTreeMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

// ==================== Frame Groups ====================

/// Values of every scripted signal at `delay_ms`, grouped by frame
///
/// Signals whose frame is unknown are left out.
pub fn build_frame_group(
    series: &SignalTimeSeries,
    signal_frames: &BTreeMap<String, String>,
    frame_ids: &BTreeMap<String, CanId>,
    delay_ms: u64,
) -> FrameGroup {
    let mut group = FrameGroup::new();
    for (signal, points) in series {
        let Some(value) = points.value_at(delay_ms) else {
            continue;
        };
        let Some(frame) = signal_frames.get(signal) else {
            tracing::debug!("Signal {} belongs to no catalog frame", signal);
            continue;
        };
        group
            .entry(frame.clone())
            .or_insert_with(|| FrameValues {
                can_id: frame_ids.get(frame).copied(),
                signals: Default::default(),
            })
            .signals
            .insert(signal.clone(), value);
    }
    group
}

/// What applying a frame group changed
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ApplyStats {
    /// Heartbeat signals updated
    pub heartbeat_signals: usize,
    /// Frames in the new scripted list
    pub user_frames: usize,
    /// Frames dropped for lack of a CAN id
    pub skipped: usize,
}

/// Apply a frame group to the live signal sets
pub fn apply_frame_group(live: &mut LiveSignals, group: &FrameGroup) -> ApplyStats {
    let heartbeat_frames = live.heartbeat_frames();
    let mut stats = ApplyStats::default();
    let mut user = Vec::new();

    for (name, frame) in group {
        if heartbeat_frames.contains(name) {
            stats.heartbeat_signals += live.merge_heartbeat(name, &frame.signals);
            continue;
        }
        match frame.can_id {
            Some(can_id) => user.push(UserSendEntry {
                frame_name: name.clone(),
                can_id,
                signals: frame.signals.clone(),
            }),
            None => {
                tracing::warn!("No CAN id for frame {}, not sending it", name);
                stats.skipped += 1;
            }
        }
    }

    stats.user_frames = user.len();
    live.replace_user(user);
    stats
}

// ==================== Controller ====================

/// Outcome of a replay run
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReplaySummary {
    /// Cycles that ran to the join
    pub cycles_completed: usize,
    /// Delays in the schedule
    pub delays_total: usize,
    /// Delays too far out to schedule
    pub delays_skipped: usize,
    /// The run was stopped before the last delay
    pub stopped: bool,
    /// Error or panic message that ended the run
    pub error: Option<String>,
    /// The results were saved
    pub saved: bool,
}

/// Clears the busy flag when the run thread ends, even by panic
struct BusyGuard(Arc<AtomicBool>);

impl Drop for BusyGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Single-flight handle for replay runs
pub struct ReplayController {
    state: Arc<EngineState>,
    poller: DevicePoller,
    busy: Arc<AtomicBool>,
    active: Arc<AtomicBool>,
    handle: Mutex<Option<JoinHandle<ReplaySummary>>>,
}

impl ReplayController {
    pub fn new(state: Arc<EngineState>, poller: DevicePoller) -> Self {
        Self {
            state,
            poller,
            busy: Arc::new(AtomicBool::new(false)),
            active: Arc::new(AtomicBool::new(false)),
            handle: Mutex::new(None),
        }
    }

    pub fn is_running(&self) -> bool {
        self.busy.load(Ordering::SeqCst)
    }

    /// Start a run; returns `false` if one is already active
    pub fn start(&self) -> bool {
        if self
            .busy
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            tracing::info!("Replay already running, ignoring start");
            return false;
        }
        self.active.store(true, Ordering::SeqCst);

        let guard = BusyGuard(self.busy.clone());
        let state = self.state.clone();
        let poller = self.poller.clone();
        let active = self.active.clone();

        match std::thread::Builder::new()
            .name("replay".to_string())
            .spawn(move || {
                let _guard = guard;
                run_replay(&state, &poller, &active)
            }) {
            Ok(handle) => {
                *self.handle.lock().unwrap_or_else(PoisonError::into_inner) = Some(handle);
                true
            }
            Err(e) => {
                // The closure and its guard are dropped, clearing busy
                tracing::error!("Failed to spawn replay worker: {}", e);
                false
            }
        }
    }

    /// Ask the active run to stop after its current step
    pub fn stop(&self) {
        if self.active.swap(false, Ordering::SeqCst) {
            tracing::info!("Replay stop requested");
        }
    }

    /// Wait for the last started run and return its summary
    pub fn wait(&self) -> Option<ReplaySummary> {
        let handle = self
            .handle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()?;
        match handle.join() {
            Ok(summary) => Some(summary),
            Err(_) => {
                tracing::error!("Replay thread panicked outside the run");
                None
            }
        }
    }
}

// ==================== Run ====================

fn run_replay(state: &EngineState, poller: &DevicePoller, active: &AtomicBool) -> ReplaySummary {
    let store = state.cache.sources().store;
    let mut sink = ResultSink::new(store.clone());
    let mut summary = ReplaySummary::default();

    if let Err(e) = store.enable_fast_path() {
        tracing::warn!("Vector store fast path unavailable: {}", e);
    }

    let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
        run_cycles(state, poller, active, &mut sink, &mut summary)
    }));
    match outcome {
        Ok(Ok(())) => {}
        Ok(Err(e)) => {
            tracing::error!("Replay failed: {}", e);
            summary.error = Some(e.to_string());
        }
        Err(payload) => {
            let message = panic_message(payload.as_ref());
            tracing::error!("Replay panicked: {}", message);
            summary.error = Some(message);
        }
    }

    state.live().replace_user(Vec::new());

    match sink.save() {
        Ok(()) => summary.saved = true,
        Err(e) => tracing::error!("Failed to save results: {}", e),
    }
    store.clear_fast_path();
    active.store(false, Ordering::SeqCst);

    tracing::info!(
        "Replay finished: {}/{} cycles{}",
        summary.cycles_completed,
        summary.delays_total,
        if summary.stopped { " (stopped)" } else { "" }
    );
    summary
}

fn run_cycles(
    state: &EngineState,
    poller: &DevicePoller,
    active: &AtomicBool,
    sink: &mut ResultSink,
    summary: &mut ReplaySummary,
) -> Result<()> {
    let delays = schedule(state)?;
    summary.delays_total = delays.len();
    if delays.is_empty() {
        tracing::warn!("Delay list is empty, nothing to replay");
        return Ok(());
    }

    let series = state.cache.time_series()?;
    let signal_frames = state.cache.signal_frames()?;
    let frame_ids = state.cache.frame_ids()?;

    let signals: Vec<String> = series.keys().cloned().collect();
    sink.prepare(&delays, &signals)?;
    tracing::info!(
        "Replaying {} signals over {} delays",
        signals.len(),
        delays.len()
    );

    let sink: &ResultSink = sink;
    let run_start = Instant::now();

    for &delay_ms in &delays {
        let Some(due) = run_start.checked_add(Duration::from_millis(delay_ms)) else {
            tracing::warn!("Delay {} ms cannot be scheduled, skipping it", delay_ms);
            summary.delays_skipped += 1;
            continue;
        };
        if !active.load(Ordering::SeqCst) || !sleep_until(active, due) {
            summary.stopped = true;
            break;
        }

        let group = build_frame_group(&series, &signal_frames, &frame_ids, delay_ms);
        let heartbeat = {
            let mut live = state.live();
            let stats = apply_frame_group(&mut live, &group);
            tracing::debug!(
                "Cycle {} ms: {} heartbeat signals, {} scripted frames, {} skipped",
                delay_ms,
                stats.heartbeat_signals,
                stats.user_frames,
                stats.skipped
            );
            live.heartbeat.clone()
        };
        state.persister.submit(heartbeat);

        let first = summary.cycles_completed == 0;
        std::thread::scope(|scope| -> Result<()> {
            let tx = scope.spawn(|| notify_tx(state, delay_ms, &group));
            let rx = scope.spawn(|| capture_rx(state, poller, active, sink, delay_ms, first));

            let tx_result = tx.join();
            let rx_result = rx.join();
            if let Err(payload) = tx_result {
                panic::resume_unwind(payload);
            }
            match rx_result {
                Ok(result) => result.map(|_| ()),
                Err(payload) => panic::resume_unwind(payload),
            }
        })?;

        summary.cycles_completed += 1;
    }
    Ok(())
}

/// Delays from the configuration, else from the vector store's time column
fn schedule(state: &EngineState) -> Result<Vec<u64>> {
    let configured = state.config.snapshot().config.delays.clone();
    if !configured.is_empty() {
        return Ok(configured);
    }
    tracing::debug!("No delays configured, reading the time column");
    state.cache.sources().store.read_delay_list()
}

fn notify_tx(state: &EngineState, delay_ms: u64, group: &FrameGroup) {
    let values = flatten_frame_group(group);
    tracing::debug!("TX {} ms: {} signals", delay_ms, values.len());
    state
        .telemetry
        .publish(TelemetryEvent::Tx { delay_ms, values });
}

fn capture_rx(
    state: &EngineState,
    poller: &DevicePoller,
    active: &AtomicBool,
    sink: &ResultSink,
    delay_ms: u64,
    first: bool,
) -> Result<usize> {
    if first {
        poller.restart();
    }
    let timing = state.timing();
    if !sleep_while_running(active, timing.rx_settle()) {
        return Ok(0);
    }

    state.snapshot.clear();
    let deadline = Instant::now() + timing.rx_wait_ceiling();
    while state.snapshot.is_empty() && Instant::now() < deadline {
        if !sleep_while_running(active, timing.rx_poll_interval()) {
            break;
        }
    }

    let snapshot = state.snapshot.get();
    if snapshot.is_empty() {
        tracing::warn!("No device state within {:?} for {} ms", timing.rx_wait_ceiling(), delay_ms);
    }
    let written = sink.record(delay_ms, &snapshot)?;
    tracing::debug!("RX {} ms: {} results", delay_ms, written);
    state
        .telemetry
        .publish(TelemetryEvent::Rx { delay_ms, snapshot });
    Ok(written)
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{HeartbeatEntry, SignalSeries};

    fn series() -> SignalTimeSeries {
        let mut series = SignalTimeSeries::new();
        series.insert(
            "Door_Lock".to_string(),
            SignalSeries::new().with_point(0, 0.0).with_point(100, 1.0),
        );
        series.insert(
            "Ignition".to_string(),
            SignalSeries::new().with_point(0, 1.0),
        );
        series.insert("Orphan".to_string(), SignalSeries::new().with_point(0, 5.0));
        series
    }

    fn signal_frames() -> BTreeMap<String, String> {
        [
            ("Door_Lock".to_string(), "BodyCtrl".to_string()),
            ("Ignition".to_string(), "PowerMode".to_string()),
        ]
        .into_iter()
        .collect()
    }

    fn frame_ids() -> BTreeMap<String, CanId> {
        [
            ("BodyCtrl".to_string(), CanId(0x120)),
            ("PowerMode".to_string(), CanId(0x100)),
        ]
        .into_iter()
        .collect()
    }

    #[test]
    fn test_frame_group_uses_fallback_values() {
        let group = build_frame_group(&series(), &signal_frames(), &frame_ids(), 250);

        assert_eq!(group.len(), 2);
        assert_eq!(group["BodyCtrl"].signals["Door_Lock"], 1.0);
        assert_eq!(group["BodyCtrl"].can_id, Some(CanId(0x120)));
        assert_eq!(group["PowerMode"].signals["Ignition"], 1.0);
    }

    #[test]
    fn test_frame_group_without_id() {
        let group = build_frame_group(&series(), &signal_frames(), &BTreeMap::new(), 0);
        assert!(group.values().all(|frame| frame.can_id.is_none()));
    }

    #[test]
    fn test_apply_merges_heartbeat_and_replaces_user() {
        let mut live = LiveSignals::with_heartbeat(vec![HeartbeatEntry::new(
            "PowerMode",
            Some(CanId(0x100)),
        )
        .with_signal("Ignition", 0.0)]);
        live.replace_user(vec![UserSendEntry {
            frame_name: "Stale".to_string(),
            can_id: CanId(0x300),
            signals: Default::default(),
        }]);

        let group = build_frame_group(&series(), &signal_frames(), &frame_ids(), 0);
        let stats = apply_frame_group(&mut live, &group);

        assert_eq!(
            stats,
            ApplyStats {
                heartbeat_signals: 1,
                user_frames: 1,
                skipped: 0,
            }
        );
        assert_eq!(live.heartbeat[0].signals["Ignition"], 1.0);
        assert_eq!(live.user.len(), 1);
        assert_eq!(live.user[0].frame_name, "BodyCtrl");
    }

    #[test]
    fn test_apply_skips_frames_without_id() {
        let mut live = LiveSignals::default();
        let group = build_frame_group(&series(), &signal_frames(), &BTreeMap::new(), 0);
        let stats = apply_frame_group(&mut live, &group);

        assert_eq!(stats.skipped, 2);
        assert!(live.user.is_empty());
    }

    #[test]
    fn test_panic_message() {
        let payload = std::panic::catch_unwind(|| panic!("boom")).unwrap_err();
        assert_eq!(panic_message(payload.as_ref()), "boom");
    }
}
