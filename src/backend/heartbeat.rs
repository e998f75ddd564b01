//! Heartbeat transmitter
//!
//! Sends the heartbeat set and the current cycle's scripted frames on a fixed
//! period for as long as the engine runs.
//!
//! # Period
//!
//! Each period the transmitter:
//!
//! 1. Reloads the configuration if someone else edited the file, reseeding
//!    the live heartbeat set from it
//! 2. Checks the link-up and device-connected gates, logging when they change
//! 3. Encodes every live frame under the live-state lock, then sends them one
//!    by one through the shared bus with a short gap between frames
//! 4. Sleeps to the next absolute deadline; an overrun restarts the schedule
//!    from the current time instead of bursting to catch up
//!
//! Encode and transmit failures are logged per frame and never stop the loop.

use crate::backend::bus::CanFrame;
use crate::backend::state::EngineState;
use crate::backend::worker::{sleep_until, sleep_while_running};
use crate::config::TimingSettings;
use crate::types::{CanId, SignalValues};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::JoinHandle;
use std::time::Instant;

/// Lifecycle of the transmitter thread
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransmitterState {
    /// Never started
    Idle,
    /// Sending every period
    Running,
    /// Stop requested, thread finishing
    Stopping,
    /// Thread joined
    Stopped,
}

struct Control {
    status: TransmitterState,
    handle: Option<JoinHandle<()>>,
}

/// The periodic heartbeat sender
pub struct HeartbeatTransmitter {
    state: Arc<EngineState>,
    running: Arc<AtomicBool>,
    control: Mutex<Control>,
}

impl HeartbeatTransmitter {
    pub fn new(state: Arc<EngineState>) -> Self {
        Self {
            state,
            running: Arc::new(AtomicBool::new(false)),
            control: Mutex::new(Control {
                status: TransmitterState::Idle,
                handle: None,
            }),
        }
    }

    pub fn status(&self) -> TransmitterState {
        self.control
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .status
    }

    /// Start the thread; a no-op while already running
    pub fn start(&self) {
        let mut control = self.control.lock().unwrap_or_else(PoisonError::into_inner);
        if control.status == TransmitterState::Running {
            tracing::debug!("Heartbeat transmitter already running");
            return;
        }

        self.running.store(true, Ordering::SeqCst);
        let state = self.state.clone();
        let running = self.running.clone();
        match std::thread::Builder::new()
            .name("heartbeat".to_string())
            .spawn(move || run(state, running))
        {
            Ok(handle) => {
                control.handle = Some(handle);
                control.status = TransmitterState::Running;
                tracing::info!("Heartbeat transmitter started");
            }
            Err(e) => {
                self.running.store(false, Ordering::SeqCst);
                tracing::error!("Failed to spawn heartbeat transmitter: {}", e);
            }
        }
    }

    /// Stop the thread and wait for it to finish
    pub fn stop(&self) {
        let mut control = self.control.lock().unwrap_or_else(PoisonError::into_inner);
        if control.status != TransmitterState::Running {
            return;
        }
        control.status = TransmitterState::Stopping;
        self.running.store(false, Ordering::SeqCst);

        if let Some(handle) = control.handle.take() {
            if handle.join().is_err() {
                tracing::error!("Heartbeat transmitter panicked");
            }
        }
        control.status = TransmitterState::Stopped;
        tracing::info!("Heartbeat transmitter stopped");
    }
}

impl Drop for HeartbeatTransmitter {
    fn drop(&mut self) {
        self.stop();
    }
}

/// A frame ready to go on the bus
struct Outgoing {
    name: String,
    frame: CanFrame,
}

fn run(state: Arc<EngineState>, running: Arc<AtomicBool>) {
    let mut gate_open: Option<bool> = None;
    let mut next = Instant::now();

    while running.load(Ordering::SeqCst) {
        let timing = state.timing();

        match state.config.reload_if_changed() {
            Ok(Some(snapshot)) => {
                state.live().heartbeat = snapshot.config.heartbeat.clone();
                tracing::info!(
                    "Configuration changed on disk, heartbeat set reseeded (version {})",
                    snapshot.version
                );
            }
            Ok(None) => {}
            Err(e) => tracing::warn!("Failed to reload configuration: {}", e),
        }

        let open = state.gates_open();
        if gate_open != Some(open) {
            if open {
                tracing::info!("Transmission gates open");
            } else {
                tracing::warn!(
                    "Transmission paused (link up: {}, device connected: {})",
                    state.link_up.load(Ordering::SeqCst),
                    state.device_connected.load(Ordering::SeqCst)
                );
            }
            gate_open = Some(open);
        }

        if open {
            transmit_period(&state, &running, &timing);
        }

        next += timing.transmit_period();
        let now = Instant::now();
        if next <= now {
            tracing::debug!("Heartbeat period overran by {:?}", now - next);
            next = now;
        }
        if !sleep_until(&running, next) {
            break;
        }
    }
}

/// Encode the live frames and send them
fn transmit_period(state: &EngineState, running: &AtomicBool, timing: &TimingSettings) {
    let outgoing = encode_live(state);

    for (index, item) in outgoing.iter().enumerate() {
        if !running.load(Ordering::SeqCst) {
            return;
        }
        if let Err(e) = state.bus.send(&item.frame) {
            tracing::warn!("Failed to send {} ({}): {}", item.name, item.frame.id, e);
        }
        if index + 1 < outgoing.len() && !sleep_while_running(running, timing.inter_frame_gap()) {
            return;
        }
    }
}

fn encode_live(state: &EngineState) -> Vec<Outgoing> {
    let frame_ids = match state.cache.frame_ids() {
        Ok(ids) => ids,
        Err(e) => {
            tracing::warn!("Frame id lookup failed: {}", e);
            Default::default()
        }
    };
    let catalog = state.cache.sources().catalog;

    let encode = |name: &str, id: Option<CanId>, signals: &SignalValues| -> Option<Outgoing> {
        let Some(id) = id.or_else(|| frame_ids.get(name).copied()) else {
            tracing::warn!("No CAN id for frame {}, skipping", name);
            return None;
        };
        match catalog.encode(name, signals) {
            Ok(data) => {
                let extended = catalog.frame(name).is_some_and(|f| f.is_extended());
                Some(Outgoing {
                    name: name.to_string(),
                    frame: CanFrame::new(id, data).with_extended(extended),
                })
            }
            Err(e) => {
                tracing::warn!("{}", e);
                None
            }
        }
    };

    let live = state.live();
    let outgoing = live
        .heartbeat
        .iter()
        .filter_map(|hb| encode(&hb.frame_name, hb.can_id, &hb.signals))
        .chain(
            live.user
                .iter()
                .filter_map(|user| encode(&user.frame_name, Some(user.can_id), &user.signals)),
        )
        .collect();
    outgoing
}
